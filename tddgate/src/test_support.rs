//! Test-only helpers for prompts, phase events and fixtures on disk.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};

use crate::core::schema::CANONICAL_PHASES;
use crate::core::types::{PhaseEvent, PhaseStatus};
use crate::io::git::{DiffOutcome, DiffSource};

const FIXED_TIMESTAMP: &str = "2026-01-10T12:00:00Z";

/// Instruction prompt with every mandatory section and all canonical phases,
/// one numbered phase per line.
pub fn complete_prompt(step_id: &str) -> String {
    let phases: Vec<String> = CANONICAL_PHASES
        .iter()
        .enumerate()
        .map(|(idx, phase)| format!("{}. {phase}", idx + 1))
        .collect();
    format!(
        "## STEP_METADATA\n\
         Step: {step_id}\n\
         \n\
         ## AGENT_IDENTITY\n\
         You are the software crafter for this step.\n\
         \n\
         ## TASK_CONTEXT\n\
         Implement the parser described in the roadmap.\n\
         \n\
         ## TDD_PHASES\n\
         {}\n\
         \n\
         ## QUALITY_GATES\n\
         All tests green before the step ends.\n\
         \n\
         ## OUTCOME_RECORDING\n\
         Append one event per phase to the execution log.\n\
         \n\
         ## BOUNDARY_RULES\n\
         Only touch files under src/ and tests/.\n\
         \n\
         ## TIMEOUT_INSTRUCTION\n\
         Stop and report after 50 turns.\n",
        phases.join("\n")
    )
}

/// Phase event with a fixed timestamp.
pub fn event(step_id: &str, phase: &str, status: &str, outcome: &str) -> PhaseEvent {
    PhaseEvent::new(
        step_id,
        phase,
        PhaseStatus::from(status),
        outcome,
        FIXED_TIMESTAMP,
    )
}

/// Every canonical phase executed with `PASS`, in order.
pub fn all_phases_passed(step_id: &str) -> Vec<PhaseEvent> {
    CANONICAL_PHASES
        .iter()
        .map(|phase| event(step_id, phase, "EXECUTED", "PASS"))
        .collect()
}

/// Write a canonical execution log (creating parent directories).
pub fn write_execution_log(path: &Path, project_id: &str, events: &[PhaseEvent]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create log dir");
    }
    let mut contents = format!(
        "project_id: {}\nschema_version: \"3.0\"\nevents:\n",
        serde_json::to_string(project_id).expect("quote project id")
    );
    for event in events {
        contents.push_str(&format!(
            "  - {}\n",
            serde_json::to_string(&event.to_line()).expect("quote event")
        ));
    }
    fs::write(path, contents).expect("write execution log");
}

/// Parse an RFC 3339 timestamp.
pub fn utc(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .expect("timestamp")
        .with_timezone(&Utc)
}

/// Diff source returning a fixed list of files.
#[derive(Debug, Clone)]
pub struct FixedDiff(pub Vec<String>);

impl DiffSource for FixedDiff {
    fn modified_files(&self, _root: &Path) -> DiffOutcome {
        DiffOutcome::Files(self.0.clone())
    }
}

/// Diff source that is always unavailable.
#[derive(Debug, Clone)]
pub struct FailingDiff(pub String);

impl DiffSource for FailingDiff {
    fn modified_files(&self, _root: &Path) -> DiffOutcome {
        DiffOutcome::Unavailable(self.0.clone())
    }
}

/// Initialise a git repository with one committed file.
pub fn init_git_repo(root: &Path) {
    let run = |args: &[&str]| {
        let status = std::process::Command::new("git")
            .args(args)
            .current_dir(root)
            .status()
            .expect("spawn git");
        assert!(status.success(), "git {args:?} failed");
    };
    run(&["init", "-q"]);
    run(&["config", "user.email", "test@example.com"]);
    run(&["config", "user.name", "Test"]);
    fs::write(root.join("README.md"), "fixture\n").expect("write readme");
    run(&["add", "README.md"]);
    run(&["commit", "-q", "-m", "init"]);
}
