//! Recording phase transitions for a running step.
//!
//! One transition appends an event to the execution log, optionally updates
//! the step state file (status, timestamps, turn count) and emits the
//! matching audit event.

use std::path::PathBuf;

use anyhow::{Result, bail};
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, instrument};

use crate::core::schema::PhaseSchema;
use crate::core::types::{PhaseEvent, PhaseStatus};
use crate::io::audit::{AuditEvent, AuditEventType, AuditWriter};
use crate::io::execution_log::{append_phase_event, init_execution_log};
use crate::io::step_state::{StepState, update_step_state, write_step_state};

#[derive(Debug, Clone)]
pub struct PhaseTransition {
    pub execution_log_path: PathBuf,
    pub project_id: String,
    pub step_id: String,
    pub phase: String,
    pub status: PhaseStatus,
    pub outcome: String,
    /// Step state file to keep in sync; created on first use.
    pub step_state_path: Option<PathBuf>,
}

/// Apply `transition` and return the event written to the log.
#[instrument(skip_all, fields(step_id = %transition.step_id, phase = %transition.phase, status = %transition.status))]
pub fn record_phase(
    transition: &PhaseTransition,
    audit: &AuditWriter,
    now: DateTime<Utc>,
) -> Result<PhaseEvent> {
    let schema = PhaseSchema::canonical();
    check_field("step id", &transition.step_id)?;
    check_field("phase", &transition.phase)?;
    if schema.phase_index(&transition.phase).is_none() {
        bail!(
            "unknown phase '{}'; expected one of {}",
            transition.phase,
            schema.phases.join(", ")
        );
    }
    if matches!(transition.status, PhaseStatus::Unknown(_)) {
        bail!("unknown phase status '{}'", transition.status);
    }

    init_execution_log(&transition.execution_log_path, &transition.project_id)?;
    let event = PhaseEvent::new(
        transition.step_id.as_str(),
        transition.phase.as_str(),
        transition.status.clone(),
        transition.outcome.as_str(),
        now.to_rfc3339_opts(SecondsFormat::Secs, true),
    );
    append_phase_event(&transition.execution_log_path, &event)?;

    let mut turn = None;
    if let Some(path) = &transition.step_state_path {
        let state = if path.exists() {
            update_step_state(path, |state| apply(state, transition, now))?
        } else {
            let mut state = StepState::new(transition.step_id.as_str(), schema);
            state.project_id = Some(transition.project_id.clone());
            apply(&mut state, transition, now)?;
            write_step_state(path, &state)?;
            state
        };
        turn = Some(state.turn_counter().get(&transition.phase));
        debug!(path = %path.display(), "step state updated");
    }

    let mut audit_event = AuditEvent::new(audit_kind(&transition.status, &transition.outcome))
        .project(transition.project_id.as_str())
        .step(transition.step_id.as_str())
        .with("phase", transition.phase.as_str())
        .with("status", transition.status.as_str())
        .with("outcome", transition.outcome.as_str());
    if let Some(turn) = turn {
        audit_event = audit_event.with("turn", turn);
    }
    audit.record(audit_event);

    if schema.is_terminal(&transition.phase) && transition.status == PhaseStatus::Executed {
        let kind = if transition.outcome == "PASS" {
            AuditEventType::CommitSucceeded
        } else {
            AuditEventType::CommitFailed
        };
        audit.record(
            AuditEvent::new(kind)
                .project(transition.project_id.as_str())
                .step(transition.step_id.as_str())
                .with("outcome", transition.outcome.as_str()),
        );
    }
    Ok(event)
}

/// Event lines are pipe-delimited, one per line.
fn check_field(name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        bail!("{name} must not be empty");
    }
    if value.contains(['|', '\n', '\r']) {
        bail!("{name} '{}' must not contain '|' or line breaks", value.escape_debug());
    }
    Ok(())
}

fn apply(state: &mut StepState, transition: &PhaseTransition, now: DateTime<Utc>) -> Result<()> {
    if state.step_id != transition.step_id {
        bail!(
            "step state belongs to {} but transition is for {}",
            state.step_id,
            transition.step_id
        );
    }
    if transition.status == PhaseStatus::InProgress {
        let mut counter = state.turn_counter();
        counter.increment(&transition.phase);
        state.apply_turn_counter(&counter);
    }
    let outcome = Some(transition.outcome.clone()).filter(|o| !o.is_empty());
    state.set_phase_status(&transition.phase, transition.status.clone(), outcome, now)
}

fn audit_kind(status: &PhaseStatus, outcome: &str) -> AuditEventType {
    match status {
        PhaseStatus::InProgress => AuditEventType::PhaseStarted,
        PhaseStatus::Skipped => AuditEventType::PhaseSkipped,
        PhaseStatus::Executed if outcome == "FAIL" => AuditEventType::PhaseFailed,
        _ => AuditEventType::PhaseExecuted,
    }
}
