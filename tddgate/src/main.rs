//! Hook entry points for the TDD phase compliance engine.
//!
//! Each subcommand reads its request from stdin (JSON), prints a JSON verdict
//! to stdout and exits with a stable code: allow, block or error.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tddgate::core::types::PhaseStatus;
use tddgate::exit_codes;
use tddgate::io::config::{load_settings, settings_path};
use tddgate::orchestrator::{StepCompletionContext, SubagentStopService, audit_writer_for};
use tddgate::record::{PhaseTransition, record_phase};
use tddgate::stale::StaleExecutionDetector;

#[derive(Parser)]
#[command(name = "tddgate", version, about = "TDD phase compliance gate")]
struct Cli {
    /// Project root holding `.tddgate/` (defaults to the current directory).
    #[arg(long, global = true)]
    project_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a prompt before dispatch. Reads `{"prompt": "..."}` from stdin.
    PreTask {
        /// Directory of step state files checked for stale phases.
        #[arg(long)]
        steps_dir: Option<PathBuf>,
    },
    /// Validate a finished step. Reads the completion context from stdin.
    SubagentStop,
    /// Report phases stuck in progress.
    Stale {
        #[arg(long)]
        steps_dir: Option<PathBuf>,
    },
    /// Record a phase transition in the execution log and step state.
    Record {
        #[arg(long)]
        log: PathBuf,
        #[arg(long)]
        project_id: String,
        #[arg(long)]
        step: String,
        #[arg(long)]
        phase: String,
        /// EXECUTED, SKIPPED or IN_PROGRESS.
        #[arg(long)]
        status: String,
        #[arg(long, default_value = "")]
        outcome: String,
        /// Step state file to keep in sync.
        #[arg(long)]
        state: Option<PathBuf>,
    },
}

#[derive(Debug, Deserialize)]
struct PreTaskInput {
    prompt: String,
}

fn main() {
    tddgate::logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::ERROR);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = match cli.project_root {
        Some(root) => root,
        None => std::env::current_dir().context("resolve current directory")?,
    };
    let settings = load_settings(&settings_path(&root))?.with_env_overrides(env_lookup);

    match cli.command {
        Command::PreTask { steps_dir } => {
            let input: PreTaskInput = read_stdin_json()?;
            let steps_dir = steps_dir.unwrap_or_else(|| default_steps_dir(&root));
            let service = SubagentStopService::from_settings(&settings, Some(root.as_path()), env_lookup);
            let decision = service.guard_dispatch(&input.prompt, &steps_dir);
            print_json(&decision)?;
            Ok(verdict_code(decision.is_allowed()))
        }
        Command::SubagentStop => {
            let context: StepCompletionContext = read_stdin_json()?;
            let service = SubagentStopService::from_settings(
                &settings,
                Some(context.project_root.as_path()),
                env_lookup,
            );
            let decision = service.on_step_complete(&context);
            print_json(&decision)?;
            Ok(verdict_code(decision.is_allowed()))
        }
        Command::Stale { steps_dir } => {
            let steps_dir = steps_dir.unwrap_or_else(|| default_steps_dir(&root));
            let scan = StaleExecutionDetector::new(settings.stale_threshold_minutes)
                .with_warning_minutes(settings.phase_warning_minutes.clone())
                .scan(&steps_dir, Utc::now())?;
            print_json(&scan)?;
            Ok(verdict_code(!scan.is_blocked))
        }
        Command::Record {
            log,
            project_id,
            step,
            phase,
            status,
            outcome,
            state,
        } => {
            let transition = PhaseTransition {
                execution_log_path: log,
                project_id,
                step_id: step,
                phase,
                status: PhaseStatus::from(status.as_str()),
                outcome,
                step_state_path: state,
            };
            let audit = audit_writer_for(&settings, Some(root.as_path()), env_lookup);
            let event = record_phase(&transition, &audit, Utc::now())?;
            println!("{}", event.to_line());
            Ok(exit_codes::ALLOW)
        }
    }
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn default_steps_dir(root: &Path) -> PathBuf {
    root.join(".tddgate").join("steps")
}

fn verdict_code(allowed: bool) -> i32 {
    if allowed {
        exit_codes::ALLOW
    } else {
        exit_codes::BLOCK
    }
}

fn read_stdin_json<T: DeserializeOwned>() -> Result<T> {
    let mut raw = String::new();
    std::io::stdin()
        .read_to_string(&mut raw)
        .context("read stdin")?;
    serde_json::from_str(&raw).context("parse stdin json")
}

/// Serialize `value` to pretty-printed JSON on stdout.
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize verdict")?;
    println!("{payload}");
    Ok(())
}
