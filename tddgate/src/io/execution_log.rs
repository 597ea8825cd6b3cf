//! Execution log access.
//!
//! The log is a YAML document owned by the execution environment:
//!
//! ```yaml
//! project_id: "checkout-flow"
//! schema_version: "3.0"
//! events:
//!   - "01-01|PREPARE|EXECUTED|PASS|2026-01-10T12:00:00Z"
//! ```
//!
//! `events` is always the last key so new events are appended as one list
//! item per line and history is never rewritten.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::core::schema::SchemaVersion;
use crate::core::types::PhaseEvent;

/// Failure to obtain events from the execution log.
#[derive(Debug, Error)]
pub enum LogReadError {
    #[error("execution log not found: {}", path.display())]
    NotFound { path: PathBuf },
    #[error("execution log {} is corrupted: {reason}", path.display())]
    Corrupted { path: PathBuf, reason: String },
}

/// Failure to append to the execution log.
#[derive(Debug, Error)]
pub enum LogAppendError {
    #[error("open execution log {}: {source}", path.display())]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("append execution log {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("execution log {} cannot be appended to: {reason}", path.display())]
    NotAppendable { path: PathBuf, reason: String },
}

/// Parsed execution log, optionally restricted to one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionLog {
    pub project_id: String,
    pub schema_version: SchemaVersion,
    /// Events in append order, with phase names in canonical form.
    pub events: Vec<PhaseEvent>,
}

#[derive(Debug, Deserialize)]
struct LogDocument {
    project_id: Option<String>,
    schema_version: Option<serde_yaml::Value>,
    events: Option<Vec<String>>,
}

/// Read the whole execution log.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn read_execution_log(path: &Path) -> Result<ExecutionLog, LogReadError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(LogReadError::NotFound {
                path: path.to_path_buf(),
            });
        }
        Err(err) => return Err(corrupted(path, format!("unreadable: {err}"))),
    };
    let log = parse_execution_log(&contents).map_err(|reason| corrupted(path, reason))?;
    debug!(project_id = %log.project_id, events = log.events.len(), "execution log loaded");
    Ok(log)
}

/// Read the log and keep only events for `step_id`.
///
/// Other steps may be interleaved in the same log.
pub fn read_step_events(path: &Path, step_id: &str) -> Result<ExecutionLog, LogReadError> {
    let mut log = read_execution_log(path)?;
    log.events.retain(|event| event.step_id == step_id);
    debug!(step_id, events = log.events.len(), "filtered step events");
    Ok(log)
}

/// Parse log contents.
///
/// When the full contents do not parse and the last line has no newline, that
/// line is treated as a write in progress and parsing is retried without it.
pub fn parse_execution_log(contents: &str) -> Result<ExecutionLog, String> {
    let err = match parse_document(contents) {
        Ok(log) => return Ok(log),
        Err(err) => err,
    };
    match contents.rfind('\n') {
        Some(idx) if idx + 1 < contents.len() => {
            let log = parse_document(&contents[..=idx]).map_err(|_| err)?;
            debug!("ignored unterminated trailing line");
            Ok(log)
        }
        _ => Err(err),
    }
}

fn parse_document(contents: &str) -> Result<ExecutionLog, String> {
    if contents.trim().is_empty() {
        return Err("log is empty".to_string());
    }
    let doc: LogDocument =
        serde_yaml::from_str(contents).map_err(|err| format!("invalid YAML: {err}"))?;
    let project_id = doc
        .project_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| "missing project_id".to_string())?;
    let schema_version = match doc.schema_version {
        None => SchemaVersion::default(),
        Some(raw) => {
            let raw = yaml_scalar(&raw);
            SchemaVersion::parse(&raw)
                .ok_or_else(|| format!("unsupported schema_version '{raw}'"))?
        }
    };

    let mut events = Vec::new();
    for (idx, line) in doc.events.unwrap_or_default().iter().enumerate() {
        let mut event = PhaseEvent::parse_line(line).map_err(|err| format!("event {idx}: {err}"))?;
        event.phase_name = schema_version.to_canonical_phase(&event.phase_name);
        events.push(event);
    }

    Ok(ExecutionLog {
        project_id,
        schema_version,
        events,
    })
}

fn yaml_scalar(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Number(n) => n.to_string(),
        other => format!("{other:?}"),
    }
}

fn corrupted(path: &Path, reason: String) -> LogReadError {
    LogReadError::Corrupted {
        path: path.to_path_buf(),
        reason,
    }
}

/// Create an empty execution log for `project_id` unless one already exists.
pub fn init_execution_log(path: &Path, project_id: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(()),
        Err(err) => {
            return Err(err).with_context(|| format!("create execution log {}", path.display()));
        }
    };
    let header = format!(
        "project_id: {}\nschema_version: \"{}\"\nevents:\n",
        serde_json::to_string(project_id)?,
        SchemaVersion::V3
    );
    file.write_all(header.as_bytes())
        .with_context(|| format!("write execution log {}", path.display()))
}

/// Append one event as a new list item. Never rewrites earlier lines.
///
/// The log must end with `events` as a block sequence; a missing final
/// newline is supplied before the new item.
#[instrument(skip_all, fields(path = %path.display(), step_id = %event.step_id, phase = %event.phase_name))]
pub fn append_phase_event(path: &Path, event: &PhaseEvent) -> Result<(), LogAppendError> {
    let mut file = OpenOptions::new()
        .read(true)
        .append(true)
        .open(path)
        .map_err(|source| LogAppendError::Open {
            path: path.to_path_buf(),
            source,
        })?;
    let mut existing = String::new();
    file.read_to_string(&mut existing)
        .map_err(|source| LogAppendError::Open {
            path: path.to_path_buf(),
            source,
        })?;
    let indent = trailing_events_indent(&existing).map_err(|reason| LogAppendError::NotAppendable {
        path: path.to_path_buf(),
        reason,
    })?;

    let mut line = String::new();
    if !existing.is_empty() && !existing.ends_with('\n') {
        line.push('\n');
    }
    line.push_str(&format!(
        "{indent}- {}\n",
        serde_json::Value::from(event.to_line())
    ));
    file.write_all(line.as_bytes())
        .map_err(|source| LogAppendError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    debug!("phase event appended");
    Ok(())
}

/// Indentation of the items under a trailing `events:` block sequence.
///
/// Errors when another top-level key follows `events` or when `events` is
/// written in flow style.
fn trailing_events_indent(contents: &str) -> Result<String, String> {
    let mut in_events = false;
    let mut indent = None;
    for line in contents.lines() {
        let body = line.trim_start();
        if body.is_empty() || body.starts_with('#') {
            continue;
        }
        let top_level = body.len() == line.len();
        if top_level && !body.starts_with('-') {
            let Some(rest) = body.strip_prefix("events:") else {
                in_events = false;
                indent = None;
                continue;
            };
            let rest = rest.trim();
            if !rest.is_empty() && !rest.starts_with('#') {
                return Err(format!("'events' is not a block sequence: '{rest}'"));
            }
            in_events = true;
            continue;
        }
        if in_events && indent.is_none() && body.starts_with('-') {
            indent = Some(line[..line.len() - body.len()].to_string());
        }
    }
    if !in_events {
        return Err("'events' is not the last top-level key".to_string());
    }
    Ok(indent.unwrap_or_else(|| "  ".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::PhaseStatus;
    use crate::test_support::{all_phases_passed, event, write_execution_log};

    #[test]
    fn missing_file_is_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = read_execution_log(&temp.path().join("execution-log.yaml"))
            .expect_err("missing log");
        assert!(matches!(err, LogReadError::NotFound { .. }));
    }

    #[test]
    fn invalid_yaml_is_corrupted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("execution-log.yaml");
        fs::write(&path, "project_id: [unclosed\nevents:\n").expect("write");
        let err = read_execution_log(&path).expect_err("corrupted");
        assert!(matches!(err, LogReadError::Corrupted { .. }));
    }

    #[test]
    fn missing_project_id_is_corrupted() {
        let err = parse_execution_log("events:\n  - \"01-01|PREPARE|EXECUTED|PASS|t\"\n")
            .expect_err("no project id");
        assert_eq!(err, "missing project_id");
    }

    #[test]
    fn malformed_event_is_corrupted() {
        let err = parse_execution_log("project_id: p\nevents:\n  - \"01-01|PREPARE\"\n")
            .expect_err("bad event");
        assert!(err.starts_with("event 0:"));
    }

    #[test]
    fn filters_interleaved_steps() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("execution-log.yaml");
        write_execution_log(
            &path,
            "proj",
            &[
                event("01-01", "PREPARE", "EXECUTED", "PASS"),
                event("01-02", "PREPARE", "EXECUTED", "PASS"),
                event("01-01", "RED_ACCEPTANCE", "EXECUTED", "FAIL"),
            ],
        );

        let log = read_step_events(&path, "01-01").expect("read");
        assert_eq!(log.project_id, "proj");
        let phases: Vec<&str> = log.events.iter().map(|e| e.phase_name.as_str()).collect();
        assert_eq!(phases, vec!["PREPARE", "RED_ACCEPTANCE"]);
    }

    #[test]
    fn empty_events_key_yields_no_events() {
        let log = parse_execution_log("project_id: p\nevents:\n").expect("parse");
        assert!(log.events.is_empty());
        assert_eq!(log.schema_version, SchemaVersion::V3);
    }

    #[test]
    fn partial_trailing_line_is_ignored() {
        let contents = "project_id: p\nevents:\n  - \"01-01|PREPARE|EXECUTED|PASS|t\"\n  - \"01-01|GR";
        let log = parse_execution_log(contents).expect("parse");
        assert_eq!(log.events.len(), 1);
    }

    #[test]
    fn legacy_phase_names_are_translated() {
        let contents = "project_id: p\nschema_version: 1.0\nevents:\n  - \"01-01|REFACTOR_L3|EXECUTED|PASS|t\"\n";
        let log = parse_execution_log(contents).expect("parse");
        assert_eq!(log.schema_version, SchemaVersion::V1);
        assert_eq!(log.events[0].phase_name, "REFACTOR_CONTINUOUS");
    }

    #[test]
    fn init_then_append_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("execution-log.yaml");
        init_execution_log(&path, "proj").expect("init");
        append_phase_event(&path, &event("01-01", "PREPARE", "EXECUTED", "PASS")).expect("append");
        append_phase_event(
            &path,
            &event("01-01", "RED_UNIT", "SKIPPED", "NOT_APPLICABLE: \"quoted\" | piped"),
        )
        .expect("append");

        let before = fs::read_to_string(&path).expect("read");
        init_execution_log(&path, "other").expect("init is idempotent");
        assert_eq!(fs::read_to_string(&path).expect("read"), before);

        let log = read_execution_log(&path).expect("read log");
        assert_eq!(log.project_id, "proj");
        assert_eq!(log.events.len(), 2);
        assert_eq!(log.events[1].status, PhaseStatus::Skipped);
        assert_eq!(log.events[1].outcome, "NOT_APPLICABLE: \"quoted\" | piped");
    }

    #[test]
    fn complete_log_without_final_newline_keeps_every_event() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("execution-log.yaml");
        write_execution_log(&path, "proj", &all_phases_passed("01-01"));
        let trimmed = fs::read_to_string(&path).expect("read").trim_end().to_string();
        fs::write(&path, trimmed).expect("write");

        let log = read_execution_log(&path).expect("read log");
        assert_eq!(log.events.len(), 7);
        assert_eq!(log.events[6].phase_name, "COMMIT");
    }

    #[test]
    fn flow_style_events_are_read() {
        let log = parse_execution_log("project_id: p\nevents: [\"01-01|PREPARE|EXECUTED|PASS|t\"]")
            .expect("parse");
        assert_eq!(log.events.len(), 1);
        assert_eq!(log.events[0].phase_name, "PREPARE");
    }

    #[test]
    fn append_supplies_missing_newline() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("execution-log.yaml");
        fs::write(&path, "project_id: p\nevents:\n  - \"01-01|PREPARE|EXECUTED|PASS|t\"")
            .expect("write");
        append_phase_event(&path, &event("01-01", "RED_ACCEPTANCE", "EXECUTED", "FAIL"))
            .expect("append");

        let log = read_execution_log(&path).expect("read log");
        let phases: Vec<&str> = log.events.iter().map(|e| e.phase_name.as_str()).collect();
        assert_eq!(phases, vec!["PREPARE", "RED_ACCEPTANCE"]);
    }

    #[test]
    fn append_follows_existing_item_indent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("execution-log.yaml");
        fs::write(&path, "project_id: p\nevents:\n- \"01-01|PREPARE|EXECUTED|PASS|t\"\n")
            .expect("write");
        append_phase_event(&path, &event("01-01", "RED_UNIT", "EXECUTED", "PASS")).expect("append");
        assert_eq!(read_execution_log(&path).expect("read log").events.len(), 2);
    }

    #[test]
    fn append_refuses_logs_it_would_corrupt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cases = [
            "events:\n  - \"01-01|PREPARE|EXECUTED|PASS|t\"\nproject_id: p\n",
            "project_id: p\nevents: [\"01-01|PREPARE|EXECUTED|PASS|t\"]\n",
            "project_id: p\n",
        ];
        for (idx, contents) in cases.iter().enumerate() {
            let path = temp.path().join(format!("log-{idx}.yaml"));
            fs::write(&path, contents).expect("write");
            let err = append_phase_event(&path, &event("01-01", "GREEN", "EXECUTED", "PASS"))
                .expect_err("not appendable");
            assert!(matches!(err, LogAppendError::NotAppendable { .. }), "{err}");
            assert_eq!(fs::read_to_string(&path).expect("read"), *contents);
        }
    }

    #[test]
    fn append_requires_existing_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = append_phase_event(
            &temp.path().join("missing.yaml"),
            &event("01-01", "PREPARE", "EXECUTED", "PASS"),
        )
        .expect_err("missing log");
        assert!(matches!(err, LogAppendError::Open { .. }));
        assert!(err.to_string().contains("open execution log"));
    }
}
