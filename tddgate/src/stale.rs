//! Detection of phases abandoned in `IN_PROGRESS`.
//!
//! A crashed or abandoned run leaves a phase in progress forever. Before a new
//! step is dispatched, every step state file is scanned and dispatch is
//! refused while any phase has been in progress longer than the threshold.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::core::schema::PhaseSchema;
use crate::core::timeout::TimeoutMonitor;
use crate::core::types::PhaseStatus;
use crate::io::step_state::load_step_state;

pub const DEFAULT_STALE_THRESHOLD_MINUTES: u32 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StaleExecution {
    pub step_file: PathBuf,
    pub step_id: String,
    pub phase_name: String,
    pub age_minutes: i64,
}

impl StaleExecution {
    pub fn describe(&self) -> String {
        format!(
            "Step {} ({}) phase {} has been IN_PROGRESS for {} minutes",
            self.step_id,
            self.step_file.display(),
            self.phase_name,
            self.age_minutes
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StaleScanResult {
    pub is_blocked: bool,
    pub stale_executions: Vec<StaleExecution>,
    /// Files that could not be read or parsed.
    pub skipped_files: Vec<PathBuf>,
    /// Elapsed-time warnings for phases still under the stale threshold.
    pub warnings: Vec<String>,
}

impl StaleScanResult {
    pub fn alert_message(&self) -> Option<String> {
        if !self.is_blocked {
            return None;
        }
        let details: Vec<String> = self.stale_executions.iter().map(|s| s.describe()).collect();
        Some(format!(
            "Stale execution detected; resolve before dispatching new work:\n- {}",
            details.join("\n- ")
        ))
    }
}

#[derive(Debug, Clone)]
pub struct StaleExecutionDetector {
    threshold_minutes: u32,
    warning_minutes: Vec<u32>,
}

impl Default for StaleExecutionDetector {
    fn default() -> Self {
        Self::new(DEFAULT_STALE_THRESHOLD_MINUTES)
    }
}

impl StaleExecutionDetector {
    pub fn new(threshold_minutes: u32) -> Self {
        Self {
            threshold_minutes,
            warning_minutes: Vec::new(),
        }
    }

    /// Report the highest crossed warning threshold for in-progress phases
    /// that are not yet stale.
    pub fn with_warning_minutes(mut self, warning_minutes: Vec<u32>) -> Self {
        self.warning_minutes = warning_minutes;
        self
    }

    pub fn threshold_minutes(&self) -> u32 {
        self.threshold_minutes
    }

    /// Scan every `*.json` step state file in `steps_dir`.
    ///
    /// A missing directory means no steps yet. Unreadable files are skipped.
    #[instrument(skip_all, fields(steps_dir = %steps_dir.display(), threshold = self.threshold_minutes))]
    pub fn scan(&self, steps_dir: &Path, now: DateTime<Utc>) -> Result<StaleScanResult> {
        let mut result = StaleScanResult::default();
        if !steps_dir.is_dir() {
            debug!("steps directory missing; nothing to scan");
            return Ok(result);
        }

        let mut files = Vec::new();
        for entry in fs::read_dir(steps_dir)
            .with_context(|| format!("read steps dir {}", steps_dir.display()))?
        {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        files.sort();

        let schema = PhaseSchema::canonical();
        for path in files {
            let state = match load_step_state(&path) {
                Ok(state) => state,
                Err(err) => {
                    warn!(path = %path.display(), err = %err, "skipping unreadable step state");
                    result.skipped_files.push(path);
                    continue;
                }
            };
            let mut stale = Vec::new();
            for phase in &state.phases {
                if phase.status != PhaseStatus::InProgress {
                    continue;
                }
                let Some(started) = phase.started_at else {
                    continue;
                };
                let age_minutes = (now - started).num_minutes();
                if age_minutes > i64::from(self.threshold_minutes) {
                    stale.push(StaleExecution {
                        step_file: path.clone(),
                        step_id: state.step_id.clone(),
                        phase_name: phase.phase_name.clone(),
                        age_minutes,
                    });
                    continue;
                }
                let monitor = TimeoutMonitor::new(started);
                if let Some(&crossed) = monitor.crossed_thresholds(&self.warning_minutes, now).last() {
                    result.warnings.push(format!(
                        "Step {}: {}",
                        state.step_id,
                        monitor.warning_message(&phase.phase_name, crossed, now)
                    ));
                }
            }
            stale.sort_by_key(|s| schema.phase_index(&s.phase_name).unwrap_or(usize::MAX));
            result.stale_executions.extend(stale);
        }

        result.is_blocked = !result.stale_executions.is_empty();
        debug!(
            stale = result.stale_executions.len(),
            skipped = result.skipped_files.len(),
            "stale scan finished"
        );
        Ok(result)
    }
}
