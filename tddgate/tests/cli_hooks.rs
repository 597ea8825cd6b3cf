//! CLI tests for the hook commands.
//!
//! Spawns the tddgate binary and verifies exit codes and stdout verdicts.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use serde_json::{Value, json};
use tddgate::core::schema::PhaseSchema;
use tddgate::core::types::PhaseStatus;
use tddgate::exit_codes;
use tddgate::io::step_state::{StepState, write_step_state};
use tddgate::test_support::{all_phases_passed, complete_prompt, write_execution_log};

fn tddgate(root: &Path, args: &[&str], stdin: &str) -> Output {
    let mut child = Command::new(env!("CARGO_BIN_EXE_tddgate"))
        .current_dir(root)
        .env("TDDGATE_AUDIT_LOG_DIR", root.join("audit"))
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn tddgate");
    child
        .stdin
        .take()
        .expect("stdin")
        .write_all(stdin.as_bytes())
        .expect("write stdin");
    child.wait_with_output().expect("tddgate output")
}

fn verdict(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("json verdict")
}

#[test]
fn pre_task_allows_complete_prompt() {
    let temp = tempfile::tempdir().expect("tempdir");
    let input = json!({ "prompt": complete_prompt("01-01") }).to_string();
    let output = tddgate(temp.path(), &["pre-task"], &input);
    assert_eq!(output.status.code(), Some(exit_codes::ALLOW));
    assert_eq!(verdict(&output)["decision"], "allow");
    assert!(temp.path().join("audit").is_dir());
}

#[test]
fn pre_task_blocks_incomplete_prompt() {
    let temp = tempfile::tempdir().expect("tempdir");
    let input = json!({ "prompt": "## TASK_CONTEXT\nfix it\n" }).to_string();
    let output = tddgate(temp.path(), &["pre-task"], &input);
    assert_eq!(output.status.code(), Some(exit_codes::BLOCK));
    let body = verdict(&output);
    assert_eq!(body["reason"], "PROMPT_INVALID");
    let errors = body["validation"]["errors"].as_array().expect("errors");
    assert!(errors.iter().any(|e| e == "MISSING: Mandatory section 'STEP_METADATA' not found"));
}

#[test]
fn malformed_stdin_is_an_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = tddgate(temp.path(), &["pre-task"], "not json");
    assert_eq!(output.status.code(), Some(exit_codes::ERROR));
    assert!(String::from_utf8_lossy(&output.stderr).contains("parse stdin json"));
}

#[test]
fn subagent_stop_allows_finished_step() {
    let temp = tempfile::tempdir().expect("tempdir");
    let log = temp.path().join("execution-log.yaml");
    write_execution_log(&log, "proj", &all_phases_passed("01-01"));
    let input = json!({
        "execution_log_path": log,
        "project_id": "proj",
        "step_id": "01-01",
        "project_root": temp.path(),
        "allowed_patterns": ["src/**"],
        "modified_files": ["src/lib.rs"],
    })
    .to_string();
    let output = tddgate(temp.path(), &["subagent-stop"], &input);
    assert_eq!(output.status.code(), Some(exit_codes::ALLOW));
    assert_eq!(verdict(&output)["completion"]["is_valid"], true);
}

#[test]
fn subagent_stop_blocks_missing_log() {
    let temp = tempfile::tempdir().expect("tempdir");
    let input = json!({
        "execution_log_path": temp.path().join("absent.yaml"),
        "project_id": "proj",
        "step_id": "01-01",
        "project_root": temp.path(),
    })
    .to_string();
    let output = tddgate(temp.path(), &["subagent-stop"], &input);
    assert_eq!(output.status.code(), Some(exit_codes::BLOCK));
    assert_eq!(verdict(&output)["reason"], "LOG_NOT_FOUND");
}

#[test]
fn stale_respects_threshold_override() {
    let temp = tempfile::tempdir().expect("tempdir");
    let steps = temp.path().join("steps");
    let mut state = StepState::new("01-01", PhaseSchema::canonical());
    let started = chrono::Utc::now() - chrono::Duration::minutes(20);
    state
        .set_phase_status("GREEN", PhaseStatus::InProgress, None, started)
        .expect("status");
    write_step_state(&steps.join("01-01.json"), &state).expect("write");

    let args = ["stale", "--steps-dir", "steps"];
    let output = tddgate(temp.path(), &args, "");
    assert_eq!(output.status.code(), Some(exit_codes::ALLOW));

    let output = Command::new(env!("CARGO_BIN_EXE_tddgate"))
        .current_dir(temp.path())
        .env("TDDGATE_STALE_THRESHOLD_MINUTES", "15")
        .args(args)
        .output()
        .expect("tddgate stale");
    assert_eq!(output.status.code(), Some(exit_codes::BLOCK));
    let body = verdict(&output);
    assert_eq!(body["stale_executions"][0]["phase_name"], "GREEN");
}

#[test]
fn record_appends_event_line() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = tddgate(
        temp.path(),
        &[
            "record", "--log", "log.yaml", "--project-id", "proj", "--step", "01-01", "--phase",
            "PREPARE", "--status", "EXECUTED", "--outcome", "PASS",
        ],
        "",
    );
    assert_eq!(output.status.code(), Some(exit_codes::ALLOW));
    let line = String::from_utf8_lossy(&output.stdout);
    assert!(line.starts_with("01-01|PREPARE|EXECUTED|PASS|"), "{line}");
    let log = tddgate::io::execution_log::read_execution_log(&temp.path().join("log.yaml"))
        .expect("read log");
    assert_eq!(log.events.len(), 1);
}
