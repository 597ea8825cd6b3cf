//! Canonical TDD phase schema.
//!
//! The schema is static configuration: one ordered phase list, the terminal
//! subset that must end in `PASS`, legal statuses and skip-reason prefixes,
//! and the mandatory prompt sections. Older layouts (14-phase and 8-phase)
//! are exposed only as [`SchemaVersion`] adapters that translate their phase
//! names onto the canonical list.

use std::fmt;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// Canonical phases in execution order.
pub const CANONICAL_PHASES: &[&str] = &[
    "PREPARE",
    "RED_ACCEPTANCE",
    "RED_UNIT",
    "GREEN",
    "REVIEW",
    "REFACTOR_CONTINUOUS",
    "COMMIT",
];

const TERMINAL_PHASES: &[&str] = &["COMMIT"];

const VALID_STATUSES: &[&str] = &["EXECUTED", "SKIPPED", "IN_PROGRESS", "NOT_EXECUTED"];

const VALID_OUTCOMES: &[&str] = &["PASS", "FAIL"];

const VALID_SKIP_PREFIXES: &[&str] = &[
    "NOT_APPLICABLE:",
    "APPROVED_SKIP:",
    "CHECKPOINT_PENDING:",
    "BLOCKED_BY_DEPENDENCY:",
    "DEFERRED:",
];

/// Prefixes that look like a legal skip but always block completion.
const BLOCKING_SKIP_PREFIXES: &[&str] = &["DEFERRED:"];

const MANDATORY_SECTIONS: &[&str] = &[
    "STEP_METADATA",
    "AGENT_IDENTITY",
    "TASK_CONTEXT",
    "TDD_PHASES",
    "QUALITY_GATES",
    "OUTCOME_RECORDING",
    "BOUNDARY_RULES",
    "TIMEOUT_INSTRUCTION",
];

const V1_PHASES: &[&str] = &[
    "PREPARE",
    "RED_ACCEPTANCE",
    "RED_UNIT",
    "GREEN_UNIT",
    "CHECK_ACCEPTANCE",
    "GREEN_ACCEPTANCE",
    "REVIEW",
    "REFACTOR_L1",
    "REFACTOR_L2",
    "REFACTOR_L3",
    "REFACTOR_L4",
    "POST_REFACTOR_REVIEW",
    "FINAL_VALIDATE",
    "COMMIT",
];

const V2_PHASES: &[&str] = &[
    "PREPARE",
    "RED_ACCEPTANCE",
    "RED_UNIT",
    "GREEN",
    "REVIEW",
    "REFACTOR_CONTINUOUS",
    "REFACTOR_L4",
    "COMMIT",
];

/// Read-only phase protocol shared by every validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseSchema {
    pub version: SchemaVersion,
    pub phases: Vec<String>,
    pub terminal_phases: Vec<String>,
    pub valid_statuses: Vec<String>,
    pub valid_outcomes: Vec<String>,
    pub valid_skip_prefixes: Vec<String>,
    pub blocking_skip_prefixes: Vec<String>,
    pub mandatory_sections: Vec<String>,
}

impl PhaseSchema {
    /// The canonical schema, built once per process.
    pub fn canonical() -> &'static PhaseSchema {
        static SCHEMA: OnceLock<PhaseSchema> = OnceLock::new();
        SCHEMA.get_or_init(|| PhaseSchema {
            version: SchemaVersion::V3,
            phases: owned(CANONICAL_PHASES),
            terminal_phases: owned(TERMINAL_PHASES),
            valid_statuses: owned(VALID_STATUSES),
            valid_outcomes: owned(VALID_OUTCOMES),
            valid_skip_prefixes: owned(VALID_SKIP_PREFIXES),
            blocking_skip_prefixes: owned(BLOCKING_SKIP_PREFIXES),
            mandatory_sections: owned(MANDATORY_SECTIONS),
        })
    }

    pub fn phase_count(&self) -> usize {
        self.phases.len()
    }

    pub fn is_terminal(&self, phase: &str) -> bool {
        self.terminal_phases.iter().any(|p| p == phase)
    }

    pub fn is_valid_outcome(&self, outcome: &str) -> bool {
        self.valid_outcomes.iter().any(|o| o == outcome)
    }

    /// Position of `phase` in the canonical order, if it is a known phase.
    pub fn phase_index(&self, phase: &str) -> Option<usize> {
        self.phases.iter().position(|p| p == phase)
    }

    pub fn has_allowed_skip_prefix(&self, reason: &str) -> bool {
        self.valid_skip_prefixes
            .iter()
            .any(|prefix| reason.starts_with(prefix.as_str()))
    }

    /// Returns the blocking prefix `reason` starts with, if any.
    pub fn blocking_skip_prefix(&self, reason: &str) -> Option<&str> {
        self.blocking_skip_prefixes
            .iter()
            .find(|prefix| reason.starts_with(prefix.as_str()))
            .map(String::as_str)
    }
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

/// Phase layouts that have existed over time.
///
/// Only [`SchemaVersion::V3`] carries rules. V1 and V2 map their phase names
/// onto V3 through [`SchemaVersion::to_canonical_phase`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemaVersion {
    /// 14-phase layout.
    #[serde(rename = "1.0")]
    V1,
    /// 8-phase layout.
    #[serde(rename = "2.0")]
    V2,
    /// Canonical 7-phase layout.
    #[default]
    #[serde(rename = "3.0")]
    V3,
}

impl SchemaVersion {
    /// Parse a declared version such as `3`, `3.0` or `v2.0`.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim().trim_matches(|c| c == '"' || c == '\'');
        let trimmed = trimmed.strip_prefix(['v', 'V']).unwrap_or(trimmed);
        let major = trimmed.split('.').next()?;
        match major {
            "1" => Some(Self::V1),
            "2" => Some(Self::V2),
            "3" => Some(Self::V3),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::V1 => "1.0",
            Self::V2 => "2.0",
            Self::V3 => "3.0",
        }
    }

    /// Phase names as written by agents following this layout.
    pub fn phase_names(self) -> &'static [&'static str] {
        match self {
            Self::V1 => V1_PHASES,
            Self::V2 => V2_PHASES,
            Self::V3 => CANONICAL_PHASES,
        }
    }

    /// Translate a phase name of this layout into its canonical name.
    ///
    /// Unknown names pass through unchanged so the validator can report them.
    pub fn to_canonical_phase(self, phase: &str) -> String {
        let mapped = match (self, phase) {
            (Self::V3, _) => None,
            (Self::V1, "GREEN_UNIT" | "CHECK_ACCEPTANCE" | "GREEN_ACCEPTANCE") => Some("GREEN"),
            (Self::V1, "REFACTOR_L1" | "REFACTOR_L2" | "REFACTOR_L3" | "REFACTOR_L4") => {
                Some("REFACTOR_CONTINUOUS")
            }
            (Self::V1, "POST_REFACTOR_REVIEW" | "FINAL_VALIDATE") => Some("REVIEW"),
            (Self::V2, "REFACTOR_L4") => Some("REFACTOR_CONTINUOUS"),
            _ => None,
        };
        mapped.unwrap_or(phase).to_string()
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
