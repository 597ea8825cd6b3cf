//! Composition root: pre-dispatch and post-execution validation.
//!
//! A service is built per hook invocation with an injected audit writer and
//! diff source, runs one operation, and is dropped. Audit writes are best
//! effort and never change a verdict.

use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::completion::StepCompletionValidator;
use crate::core::prompt_validator::{PromptValidation, PromptValidator};
use crate::core::schema::PhaseSchema;
use crate::core::types::{CompletionResult, ScopeCheckResult};
use crate::io::audit::{AuditEvent, AuditEventType, AuditWriter, resolve_audit_dir};
use crate::io::config::Settings;
use crate::io::execution_log::{LogReadError, read_step_events};
use crate::io::git::{DiffSource, GitDiffSource};
use crate::scope::{ScopeChecker, ScopeRequest, relative_artifact};
use crate::stale::{StaleExecutionDetector, StaleScanResult};

/// Request payload for the post-execution check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCompletionContext {
    pub execution_log_path: PathBuf,
    pub project_id: String,
    pub step_id: String,
    pub project_root: PathBuf,
    #[serde(default)]
    pub allowed_patterns: Vec<String>,
    #[serde(default)]
    pub modified_files: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Block,
}

/// Machine-readable reason attached to every block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockReason {
    PromptInvalid,
    StaleExecution,
    LogNotFound,
    LogCorrupted,
    ProjectIdMismatch,
    StepIncomplete,
}

/// Verdict of `on_step_complete`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopDecision {
    pub decision: Decision,
    pub reason: Option<BlockReason>,
    pub message: String,
    pub recovery_suggestions: Vec<String>,
    pub completion: Option<CompletionResult>,
    pub scope: Option<ScopeCheckResult>,
}

impl StopDecision {
    pub fn is_allowed(&self) -> bool {
        self.decision == Decision::Allow
    }

    fn block(reason: BlockReason, message: String, recovery_suggestions: Vec<String>) -> Self {
        Self {
            decision: Decision::Block,
            reason: Some(reason),
            message,
            recovery_suggestions,
            completion: None,
            scope: None,
        }
    }
}

/// Verdict of `guard_dispatch`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchDecision {
    pub decision: Decision,
    pub reason: Option<BlockReason>,
    pub message: String,
    pub recovery_suggestions: Vec<String>,
    pub validation: Option<PromptValidation>,
    pub stale: Option<StaleScanResult>,
}

impl DispatchDecision {
    pub fn is_allowed(&self) -> bool {
        self.decision == Decision::Allow
    }
}

pub struct SubagentStopService<D: DiffSource> {
    schema: &'static PhaseSchema,
    audit: AuditWriter,
    scope: ScopeChecker<D>,
    stale: StaleExecutionDetector,
    default_patterns: Vec<String>,
}

impl SubagentStopService<GitDiffSource> {
    /// Build a service from settings: resolves the audit directory (unless
    /// audit logging is disabled) and uses git for diffs.
    pub fn from_settings<F>(settings: &Settings, project_root: Option<&Path>, env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let audit = audit_writer_for(settings, project_root, env);
        let diff = GitDiffSource {
            timeout: std::time::Duration::from_secs(settings.diff_timeout_secs),
        };
        Self::new(audit, diff)
            .with_stale_detector(
                StaleExecutionDetector::new(settings.stale_threshold_minutes)
                    .with_warning_minutes(settings.phase_warning_minutes.clone()),
            )
            .with_default_patterns(settings.allowed_patterns.clone())
    }
}

impl<D: DiffSource> SubagentStopService<D> {
    pub fn new(audit: AuditWriter, diff: D) -> Self {
        Self {
            schema: PhaseSchema::canonical(),
            audit,
            scope: ScopeChecker::new(diff),
            stale: StaleExecutionDetector::default(),
            default_patterns: Vec::new(),
        }
    }

    /// Allow-patterns used when a completion request carries none.
    pub fn with_default_patterns(mut self, patterns: Vec<String>) -> Self {
        self.default_patterns = patterns;
        self
    }

    pub fn with_stale_detector(mut self, stale: StaleExecutionDetector) -> Self {
        self.stale = stale;
        self
    }

    pub fn audit(&self) -> &AuditWriter {
        &self.audit
    }

    /// Check a prompt before dispatch and record the verdict.
    pub fn validate_prompt(&self, prompt: &str) -> PromptValidation {
        self.record_invocation_started(prompt);
        self.check_prompt(prompt)
    }

    fn record_invocation_started(&self, prompt: &str) {
        self.audit.record(
            AuditEvent::new(AuditEventType::TaskInvocationStarted)
                .with("prompt_bytes", prompt.len()),
        );
    }

    #[instrument(skip_all, fields(prompt_bytes = prompt.len()))]
    fn check_prompt(&self, prompt: &str) -> PromptValidation {
        let started = Instant::now();
        let validation = PromptValidator::new(self.schema).validate(prompt, None);
        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            errors = validation.errors.len(),
            "prompt validated"
        );

        let event = if validation.is_valid() {
            AuditEvent::new(AuditEventType::TaskInvocationValidated)
        } else {
            AuditEvent::new(AuditEventType::TaskInvocationRejected)
                .with("errors", validation.errors.clone())
        };
        self.audit
            .record(event.with("schema_version", validation.schema_version.as_str()));
        validation
    }

    /// Refuse dispatch while stale phases exist, then check the prompt.
    pub fn guard_dispatch(&self, prompt: &str, steps_dir: &Path) -> DispatchDecision {
        self.guard_dispatch_at(prompt, steps_dir, Utc::now())
    }

    pub fn guard_dispatch_at(
        &self,
        prompt: &str,
        steps_dir: &Path,
        now: DateTime<Utc>,
    ) -> DispatchDecision {
        self.record_invocation_started(prompt);
        let scan = match self.stale.scan(steps_dir, now) {
            Ok(scan) if scan.is_blocked => {
                let message = scan
                    .alert_message()
                    .unwrap_or_else(|| "stale execution detected".to_string());
                let recovery = scan
                    .stale_executions
                    .iter()
                    .map(|s| {
                        format!(
                            "Resume or reset phase {} of step {} ({})",
                            s.phase_name,
                            s.step_id,
                            s.step_file.display()
                        )
                    })
                    .collect();
                warn!(stale = scan.stale_executions.len(), "dispatch refused");
                self.audit.record(
                    AuditEvent::new(AuditEventType::TaskInvocationRejected)
                        .with("reason", "STALE_EXECUTION")
                        .with("stale_phases", stale_summary(&scan)),
                );
                return DispatchDecision {
                    decision: Decision::Block,
                    reason: Some(BlockReason::StaleExecution),
                    message,
                    recovery_suggestions: recovery,
                    validation: None,
                    stale: Some(scan),
                };
            }
            Ok(scan) => {
                for warning in &scan.warnings {
                    warn!("{warning}");
                }
                Some(scan)
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "stale scan failed; continuing");
                None
            }
        };

        let validation = self.check_prompt(prompt);
        if validation.is_valid() {
            return DispatchDecision {
                decision: Decision::Allow,
                reason: None,
                message: "prompt passed validation".to_string(),
                recovery_suggestions: Vec::new(),
                validation: Some(validation),
                stale: scan,
            };
        }
        DispatchDecision {
            decision: Decision::Block,
            reason: Some(BlockReason::PromptInvalid),
            message: format!(
                "prompt failed validation with {} defect(s)",
                validation.errors.len()
            ),
            recovery_suggestions: vec![
                "Add the missing sections and name every TDD phase, then dispatch again"
                    .to_string(),
            ],
            validation: Some(validation),
            stale: scan,
        }
    }

    /// Validate a finished step and decide whether it may stop.
    #[instrument(skip_all, fields(step_id = %context.step_id, project_id = %context.project_id))]
    pub fn on_step_complete(&self, context: &StepCompletionContext) -> StopDecision {
        let log = match read_step_events(&context.execution_log_path, &context.step_id) {
            Ok(log) => log,
            Err(err) => return self.block_on_log_error(context, &err),
        };

        if log.project_id != context.project_id {
            let decision = StopDecision::block(
                BlockReason::ProjectIdMismatch,
                format!(
                    "execution log belongs to project '{}' but step {} expects '{}'",
                    log.project_id, context.step_id, context.project_id
                ),
                vec![format!(
                    "Point the step at the execution log of project '{}'",
                    context.project_id
                )],
            );
            self.record_stop_failure(context, &decision, None);
            return decision;
        }

        let completion = StepCompletionValidator::new(self.schema).validate(&context.step_id, &log.events);
        if !completion.is_valid {
            let mut decision = StopDecision::block(
                BlockReason::StepIncomplete,
                format!(
                    "step {} is not complete: {}",
                    context.step_id,
                    completion.error_messages.join("; ")
                ),
                completion.recovery_suggestions.clone(),
            );
            self.record_stop_failure(context, &decision, Some(&completion));
            decision.completion = Some(completion);
            return decision;
        }

        let allowed_patterns = self.effective_patterns(context);
        let scope = self.check_scope(context, &allowed_patterns);
        for file in &scope.out_of_scope_files {
            self.audit.record(
                self.stop_event(AuditEventType::ScopeViolation, context)
                    .with("file", file.as_str())
                    .with("allowed_patterns", allowed_patterns.clone()),
            );
        }
        if scope.has_violations {
            warn!(files = scope.out_of_scope_files.len(), "out-of-scope modifications");
        }

        self.audit.record(
            self.stop_event(AuditEventType::SubagentStopPassed, context)
                .with("phases_validated", self.schema.phase_count())
                .with("scope_skipped", scope.skipped)
                .with("scope_violations", scope.out_of_scope_files.len()),
        );
        info!("step complete");

        StopDecision {
            decision: Decision::Allow,
            reason: None,
            message: format!("step {} completed all TDD phases", context.step_id),
            recovery_suggestions: Vec::new(),
            completion: Some(completion),
            scope: Some(scope),
        }
    }

    fn effective_patterns(&self, context: &StepCompletionContext) -> Vec<String> {
        if context.allowed_patterns.is_empty() {
            self.default_patterns.clone()
        } else {
            context.allowed_patterns.clone()
        }
    }

    fn check_scope(&self, context: &StepCompletionContext, allowed_patterns: &[String]) -> ScopeCheckResult {
        let request = ScopeRequest {
            root: context.project_root.clone(),
            allowed_patterns: allowed_patterns.to_vec(),
            modified_files: context.modified_files.clone(),
            tracking_artifact: Some(relative_artifact(
                &context.project_root,
                &context.execution_log_path,
            )),
        };
        match self.scope.check(&request) {
            Ok(result) => result,
            Err(err) => {
                warn!(err = %err, "scope check skipped");
                ScopeCheckResult::skipped(err.to_string())
            }
        }
    }

    fn block_on_log_error(&self, context: &StepCompletionContext, err: &LogReadError) -> StopDecision {
        let decision = match err {
            LogReadError::NotFound { path } => StopDecision::block(
                BlockReason::LogNotFound,
                err.to_string(),
                vec![format!(
                    "Create the execution log at {} before running step {}",
                    path.display(),
                    context.step_id
                )],
            ),
            LogReadError::Corrupted { path, reason } => StopDecision::block(
                BlockReason::LogCorrupted,
                err.to_string(),
                vec![format!(
                    "Repair {} ({reason}); each event must read stepId|phase|status|outcome|timestamp",
                    path.display()
                )],
            ),
        };
        self.record_stop_failure(context, &decision, None);
        decision
    }

    fn record_stop_failure(
        &self,
        context: &StepCompletionContext,
        decision: &StopDecision,
        completion: Option<&CompletionResult>,
    ) {
        let mut event = self
            .stop_event(AuditEventType::SubagentStopFailed, context)
            .with("message", decision.message.as_str());
        if let Some(reason) = decision.reason {
            event = event.with("reason", to_value(reason));
        }
        if let Some(completion) = completion {
            event = event
                .with("error_type", completion.error_type.map(to_value).unwrap_or(Value::Null))
                .with("missing_phases", completion.missing_phases.clone())
                .with("invalid_outcomes", completion.invalid_outcomes.clone())
                .with("invalid_skips", completion.invalid_skips.clone());
        }
        self.audit.record(event);
    }

    fn stop_event(&self, kind: AuditEventType, context: &StepCompletionContext) -> AuditEvent {
        AuditEvent::new(kind)
            .project(context.project_id.as_str())
            .step(context.step_id.as_str())
    }
}

/// Audit writer honoring the settings toggle and directory resolution.
pub fn audit_writer_for<F>(settings: &Settings, project_root: Option<&Path>, env: F) -> AuditWriter
where
    F: Fn(&str) -> Option<String>,
{
    if !settings.audit_logging_enabled {
        return AuditWriter::disabled();
    }
    AuditWriter::from_resolved(resolve_audit_dir(
        settings.audit_dir.as_deref(),
        project_root,
        env,
    ))
}

fn to_value<T: Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn stale_summary(scan: &StaleScanResult) -> Vec<Value> {
    scan.stale_executions
        .iter()
        .map(|s| {
            serde_json::json!({
                "step_id": s.step_id,
                "phase": s.phase_name,
                "age_minutes": s.age_minutes,
            })
        })
        .collect()
}
