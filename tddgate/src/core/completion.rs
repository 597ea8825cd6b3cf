//! Step completion rules.
//!
//! Turns the phase events recorded for one step into a verdict. Only the most
//! recent event per phase is considered; events for phases outside the
//! canonical list are ignored.

use std::collections::HashMap;

use crate::core::schema::PhaseSchema;
use crate::core::types::{CompletionErrorType, CompletionResult, PhaseEvent, PhaseStatus};

#[derive(Debug, Clone)]
pub struct StepCompletionValidator<'a> {
    schema: &'a PhaseSchema,
}

impl Default for StepCompletionValidator<'static> {
    fn default() -> Self {
        Self::new(PhaseSchema::canonical())
    }
}

impl<'a> StepCompletionValidator<'a> {
    pub fn new(schema: &'a PhaseSchema) -> Self {
        Self { schema }
    }

    /// Validate the events of a single step.
    ///
    /// `step_id` is only used in operator-facing messages; callers filter
    /// events before calling.
    pub fn validate(&self, step_id: &str, events: &[PhaseEvent]) -> CompletionResult {
        if events.is_empty() {
            return silent_completion(step_id);
        }

        let latest = latest_by_phase(events);
        let mut result = CompletionResult::default();
        let mut terminal_failures = Vec::new();
        let mut blocked_skips = Vec::new();

        for phase in &self.schema.phases {
            let Some(event) = latest.get(phase.as_str()) else {
                result.missing_phases.push(phase.clone());
                result
                    .error_messages
                    .push(format!("Phase {phase} was never recorded (abandoned)"));
                continue;
            };

            match &event.status {
                PhaseStatus::Executed => {
                    if !self.schema.is_valid_outcome(&event.outcome) {
                        result.invalid_outcomes.push(phase.clone());
                        result.error_messages.push(format!(
                            "Phase {phase} executed with invalid outcome '{}' (expected PASS or FAIL)",
                            event.outcome
                        ));
                    } else if self.schema.is_terminal(phase) && event.outcome != "PASS" {
                        result.invalid_outcomes.push(phase.clone());
                        terminal_failures.push(phase.clone());
                        result.error_messages.push(format!(
                            "Terminal phase {phase} completed with outcome {}; it must PASS",
                            event.outcome
                        ));
                    }
                }
                PhaseStatus::Skipped => {
                    if let Some(prefix) = self.schema.blocking_skip_prefix(&event.outcome) {
                        result.invalid_skips.push(phase.clone());
                        blocked_skips.push(phase.clone());
                        result.error_messages.push(format!(
                            "Phase {phase} skipped with blocking reason '{}' ({prefix} is not allowed at completion)",
                            event.outcome
                        ));
                    } else if !self.schema.has_allowed_skip_prefix(&event.outcome) {
                        result.invalid_skips.push(phase.clone());
                        result.error_messages.push(format!(
                            "Phase {phase} skipped without a valid reason prefix: '{}'",
                            event.outcome
                        ));
                    }
                }
                other => {
                    result.invalid_outcomes.push(phase.clone());
                    result.error_messages.push(format!(
                        "Phase {phase} has non-terminal status {other}"
                    ));
                }
            }
        }

        result.error_type = classify(&result);
        result.is_valid = result.error_type.is_none();
        result.recovery_suggestions =
            self.recovery_suggestions(&result, &terminal_failures, &blocked_skips);
        result
    }

    fn recovery_suggestions(
        &self,
        result: &CompletionResult,
        terminal_failures: &[String],
        blocked_skips: &[String],
    ) -> Vec<String> {
        let mut suggestions = Vec::new();
        if !result.missing_phases.is_empty() {
            suggestions.push(format!(
                "Resume execution to complete: {}",
                result.missing_phases.join(", ")
            ));
        }

        let plain_invalid: Vec<&str> = result
            .invalid_outcomes
            .iter()
            .filter(|phase| !terminal_failures.contains(phase))
            .map(String::as_str)
            .collect();
        if !plain_invalid.is_empty() {
            suggestions.push(format!(
                "Finish phase(s) {} and record EXECUTED with a PASS or FAIL outcome",
                plain_invalid.join(", ")
            ));
        }
        if !terminal_failures.is_empty() {
            suggestions.push(format!(
                "Fix the failures behind {} and re-run it until it records PASS",
                terminal_failures.join(", ")
            ));
        }

        if !blocked_skips.is_empty() {
            suggestions.push(format!(
                "Deferred phases block completion; execute {} before finishing the step",
                blocked_skips.join(", ")
            ));
        }
        let unprefixed: Vec<&str> = result
            .invalid_skips
            .iter()
            .filter(|phase| !blocked_skips.contains(phase))
            .map(String::as_str)
            .collect();
        if !unprefixed.is_empty() {
            let allowed: Vec<&str> = self
                .schema
                .valid_skip_prefixes
                .iter()
                .filter(|prefix| self.schema.blocking_skip_prefix(prefix).is_none())
                .map(String::as_str)
                .collect();
            suggestions.push(format!(
                "Execute {} or record the skip with one of: {}",
                unprefixed.join(", "),
                allowed.join(" ")
            ));
        }
        suggestions
    }
}

fn silent_completion(step_id: &str) -> CompletionResult {
    CompletionResult {
        is_valid: false,
        error_type: Some(CompletionErrorType::SilentCompletion),
        error_messages: vec![format!(
            "Step {step_id} finished without recording any phase activity"
        )],
        recovery_suggestions: vec![
            format!("Confirm the agent received the TDD phase protocol for step {step_id}"),
            "Check that the agent appends phase events to the execution log, then re-dispatch the step"
                .to_string(),
        ],
        ..CompletionResult::default()
    }
}

fn latest_by_phase(events: &[PhaseEvent]) -> HashMap<&str, &PhaseEvent> {
    let mut latest = HashMap::new();
    for event in events {
        latest.insert(event.phase_name.as_str(), event);
    }
    latest
}

fn classify(result: &CompletionResult) -> Option<CompletionErrorType> {
    let categories = [
        (!result.missing_phases.is_empty()).then_some(CompletionErrorType::AbandonedPhase),
        (!result.invalid_outcomes.is_empty()).then_some(CompletionErrorType::InvalidOutcome),
        (!result.invalid_skips.is_empty()).then_some(CompletionErrorType::InvalidSkip),
    ];
    let mut present = categories.into_iter().flatten();
    let first = present.next()?;
    if present.next().is_some() {
        return Some(CompletionErrorType::MultipleErrors);
    }
    Some(first)
}
