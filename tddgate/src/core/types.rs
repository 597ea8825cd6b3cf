//! Shared deterministic types for the compliance core.
//!
//! These types define stable contracts between core components. They do not
//! depend on external state or I/O.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Recorded status of a single phase.
///
/// Unknown values are kept verbatim so the completion validator can report
/// them instead of the log reader rejecting the whole file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PhaseStatus {
    Executed,
    Skipped,
    InProgress,
    NotExecuted,
    Unknown(String),
}

impl PhaseStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Executed => "EXECUTED",
            Self::Skipped => "SKIPPED",
            Self::InProgress => "IN_PROGRESS",
            Self::NotExecuted => "NOT_EXECUTED",
            Self::Unknown(raw) => raw,
        }
    }
}

impl From<&str> for PhaseStatus {
    fn from(raw: &str) -> Self {
        match raw.trim() {
            "EXECUTED" => Self::Executed,
            "SKIPPED" => Self::Skipped,
            "IN_PROGRESS" => Self::InProgress,
            "NOT_EXECUTED" => Self::NotExecuted,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl From<String> for PhaseStatus {
    fn from(raw: String) -> Self {
        Self::from(raw.as_str())
    }
}

impl From<PhaseStatus> for String {
    fn from(status: PhaseStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of the execution log: `stepId|phase|status|outcomeOrReason|timestamp`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseEvent {
    pub step_id: String,
    pub phase_name: String,
    pub status: PhaseStatus,
    /// `PASS`/`FAIL` for executed phases, the justification for skipped ones.
    pub outcome: String,
    pub timestamp: String,
}

impl PhaseEvent {
    pub fn new(
        step_id: impl Into<String>,
        phase_name: impl Into<String>,
        status: PhaseStatus,
        outcome: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            phase_name: phase_name.into(),
            status,
            outcome: outcome.into(),
            timestamp: timestamp.into(),
        }
    }

    /// Parse a pipe-delimited event line.
    ///
    /// The outcome field may itself contain `|`; the timestamp is always the
    /// last field.
    pub fn parse_line(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let mut head = line.splitn(4, '|');
        let step_id = head.next().unwrap_or_default();
        let phase_name = head.next();
        let status = head.next();
        let rest = head.next();
        let (Some(phase_name), Some(status), Some(rest)) = (phase_name, status, rest) else {
            return Err(format!("expected 5 '|'-separated fields in '{line}'"));
        };
        let Some((outcome, timestamp)) = rest.rsplit_once('|') else {
            return Err(format!("expected 5 '|'-separated fields in '{line}'"));
        };
        if step_id.trim().is_empty() || phase_name.trim().is_empty() {
            return Err(format!("empty step id or phase name in '{line}'"));
        }
        Ok(Self {
            step_id: step_id.trim().to_string(),
            phase_name: phase_name.trim().to_string(),
            status: PhaseStatus::from(status),
            outcome: outcome.trim().to_string(),
            timestamp: timestamp.trim().to_string(),
        })
    }

    pub fn to_line(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.step_id, self.phase_name, self.status, self.outcome, self.timestamp
        )
    }
}

/// Category tag for a failed completion check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletionErrorType {
    /// No phase activity at all for the step.
    SilentCompletion,
    AbandonedPhase,
    InvalidOutcome,
    InvalidSkip,
    MultipleErrors,
}

impl CompletionErrorType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SilentCompletion => "SILENT_COMPLETION",
            Self::AbandonedPhase => "ABANDONED_PHASE",
            Self::InvalidOutcome => "INVALID_OUTCOME",
            Self::InvalidSkip => "INVALID_SKIP",
            Self::MultipleErrors => "MULTIPLE_ERRORS",
        }
    }
}

/// Verdict of the step completion check. Never cached across calls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompletionResult {
    pub is_valid: bool,
    pub error_type: Option<CompletionErrorType>,
    /// Canonical phases with no event at all.
    pub missing_phases: Vec<String>,
    /// Phases executed with an illegal outcome or left in a non-terminal status.
    pub invalid_outcomes: Vec<String>,
    /// Phases skipped with an unknown or blocking reason.
    pub invalid_skips: Vec<String>,
    pub error_messages: Vec<String>,
    pub recovery_suggestions: Vec<String>,
}

impl CompletionResult {
    pub fn error_count(&self) -> usize {
        self.missing_phases.len() + self.invalid_outcomes.len() + self.invalid_skips.len()
    }

    pub fn is_silent_completion(&self) -> bool {
        self.error_type == Some(CompletionErrorType::SilentCompletion)
    }
}

/// Outcome of comparing modified files against the scope allow-list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScopeCheckResult {
    pub has_violations: bool,
    pub out_of_scope_files: Vec<String>,
    /// True when the diff could not be obtained; never a violation.
    pub skipped: bool,
    pub skip_reason: Option<String>,
}

impl ScopeCheckResult {
    pub fn clean() -> Self {
        Self::default()
    }

    pub fn violations(files: Vec<String>) -> Self {
        Self {
            has_violations: !files.is_empty(),
            out_of_scope_files: files,
            ..Self::default()
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            skipped: true,
            skip_reason: Some(reason.into()),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_event_line() {
        let event =
            PhaseEvent::parse_line("01-01|GREEN|EXECUTED|PASS|2026-01-10T12:00:00Z").expect("parse");
        assert_eq!(
            event,
            PhaseEvent::new(
                "01-01",
                "GREEN",
                PhaseStatus::Executed,
                "PASS",
                "2026-01-10T12:00:00Z"
            )
        );
    }

    #[test]
    fn outcome_may_contain_pipes() {
        let event = PhaseEvent::parse_line(
            "01-02|REVIEW|SKIPPED|NOT_APPLICABLE: a|b|2026-01-10T12:00:00Z",
        )
        .expect("parse");
        assert_eq!(event.outcome, "NOT_APPLICABLE: a|b");
        assert_eq!(event.timestamp, "2026-01-10T12:00:00Z");
    }

    #[test]
    fn rejects_short_lines() {
        let err = PhaseEvent::parse_line("01-01|GREEN|EXECUTED").expect_err("short line");
        assert!(err.contains("expected 5"));
    }

    #[test]
    fn unknown_status_is_preserved() {
        assert_eq!(
            PhaseStatus::from("DONE"),
            PhaseStatus::Unknown("DONE".to_string())
        );
        assert_eq!(PhaseStatus::from("DONE").as_str(), "DONE");
    }

    #[test]
    fn skipped_scope_result_is_not_a_violation() {
        let result = ScopeCheckResult::skipped("git unavailable");
        assert!(result.skipped);
        assert!(!result.has_violations);
        assert_eq!(ScopeCheckResult::violations(Vec::new()), ScopeCheckResult::clean());
    }
}
