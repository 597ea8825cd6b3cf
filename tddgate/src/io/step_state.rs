//! Step state records (`<steps dir>/<step>.json`).
//!
//! The execution environment owns these files. The engine reads them and only
//! rewrites phase status and turn-count fields, atomically.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use jsonschema::validator_for;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::core::schema::PhaseSchema;
use crate::core::turns::TurnCounter;
use crate::core::types::PhaseStatus;

const STEP_STATE_SCHEMA: &str = include_str!("../../schemas/step_state.schema.json");

#[derive(Debug, Error)]
pub enum StepStateError {
    #[error("read step state {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse step state {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("step state {} failed schema validation: {}", path.display(), messages.join("; "))]
    Schema { path: PathBuf, messages: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase_name: String,
    pub status: PhaseStatus,
    #[serde(default)]
    pub outcome: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub turn_count: u32,
}

impl PhaseRecord {
    pub fn not_executed(phase_name: impl Into<String>) -> Self {
        Self {
            phase_name: phase_name.into(),
            status: PhaseStatus::NotExecuted,
            outcome: None,
            started_at: None,
            ended_at: None,
            turn_count: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepState {
    pub step_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub phases: Vec<PhaseRecord>,
}

impl StepState {
    /// Fresh state with every schema phase `NOT_EXECUTED`.
    pub fn new(step_id: impl Into<String>, schema: &PhaseSchema) -> Self {
        Self {
            step_id: step_id.into(),
            project_id: None,
            phases: schema.phases.iter().map(PhaseRecord::not_executed).collect(),
        }
    }

    pub fn phase(&self, name: &str) -> Option<&PhaseRecord> {
        self.phases.iter().find(|p| p.phase_name == name)
    }

    fn phase_mut(&mut self, name: &str) -> Result<&mut PhaseRecord> {
        let step_id = self.step_id.clone();
        self.phases
            .iter_mut()
            .find(|p| p.phase_name == name)
            .ok_or_else(|| anyhow!("step {step_id} has no phase {name}"))
    }

    /// Move `phase` to `status`, stamping start/end times.
    pub fn set_phase_status(
        &mut self,
        phase: &str,
        status: PhaseStatus,
        outcome: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let record = self.phase_mut(phase)?;
        match status {
            PhaseStatus::InProgress => {
                record.started_at = Some(now);
                record.ended_at = None;
            }
            PhaseStatus::Executed | PhaseStatus::Skipped => {
                record.started_at.get_or_insert(now);
                record.ended_at = Some(now);
            }
            PhaseStatus::NotExecuted | PhaseStatus::Unknown(_) => {}
        }
        record.status = status;
        record.outcome = outcome;
        Ok(())
    }

    pub fn turn_counter(&self) -> TurnCounter {
        TurnCounter::from_map(
            self.phases
                .iter()
                .filter(|p| p.turn_count > 0)
                .map(|p| (p.phase_name.clone(), p.turn_count))
                .collect(),
        )
    }

    /// Copy counts from `counter` into the matching phase records.
    pub fn apply_turn_counter(&mut self, counter: &TurnCounter) {
        for record in &mut self.phases {
            record.turn_count = counter.get(&record.phase_name);
        }
    }
}

/// Load and validate a step state file (JSON Schema + struct).
pub fn load_step_state(path: &Path) -> Result<StepState, StepStateError> {
    let contents = fs::read_to_string(path).map_err(|source| StepStateError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let value: Value = serde_json::from_str(&contents).map_err(|source| StepStateError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    let messages = schema_errors(&value);
    if !messages.is_empty() {
        return Err(StepStateError::Schema {
            path: path.to_path_buf(),
            messages,
        });
    }
    let state: StepState =
        serde_json::from_value(value).map_err(|source| StepStateError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    debug!(path = %path.display(), step_id = %state.step_id, "step state loaded");
    Ok(state)
}

fn schema_errors(value: &Value) -> Vec<String> {
    let schema: Value = match serde_json::from_str(STEP_STATE_SCHEMA) {
        Ok(schema) => schema,
        Err(err) => return vec![format!("embedded schema is invalid: {err}")],
    };
    match validator_for(&schema) {
        Ok(compiled) => compiled.iter_errors(value).map(|e| e.to_string()).collect(),
        Err(err) => vec![format!("embedded schema is invalid: {err}")],
    }
}

/// Atomically write step state to disk (temp file + rename).
pub fn write_step_state(path: &Path, state: &StepState) -> Result<()> {
    debug!(path = %path.display(), step_id = %state.step_id, "writing step state");
    let mut buf = serde_json::to_string_pretty(state)?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Load, mutate and atomically rewrite a step state file.
pub fn update_step_state<F>(path: &Path, update: F) -> Result<StepState>
where
    F: FnOnce(&mut StepState) -> Result<()>,
{
    let mut state = load_step_state(path)?;
    update(&mut state)?;
    write_step_state(path, &state)?;
    Ok(state)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("step state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp step state {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace step state {}", path.display()))?;
    Ok(())
}
