//! Git adapter used to discover files modified during a step.
//!
//! Every call runs under a hard timeout. When git is missing, slow or fails,
//! the diff is reported as unavailable instead of as an error so scope checks
//! degrade to "skipped".

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument, warn};

use super::process::{Limits, Termination, run_bounded};

pub const DEFAULT_DIFF_TIMEOUT: Duration = Duration::from_secs(5);
const GIT_OUTPUT_LIMIT_BYTES: u64 = 1_000_000;

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Modified files, or the reason they could not be determined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffOutcome {
    Files(Vec<String>),
    Unavailable(String),
}

/// Source of the files modified in a working tree.
pub trait DiffSource {
    fn modified_files(&self, root: &Path) -> DiffOutcome;
}

/// Diff source backed by `git status`, bounded by a timeout.
#[derive(Debug, Clone)]
pub struct GitDiffSource {
    pub timeout: Duration,
}

impl Default for GitDiffSource {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_DIFF_TIMEOUT,
        }
    }
}

impl DiffSource for GitDiffSource {
    fn modified_files(&self, root: &Path) -> DiffOutcome {
        match Git::new(root, self.timeout).status_porcelain() {
            Ok(entries) => DiffOutcome::Files(entries.into_iter().map(|e| e.path).collect()),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "git diff unavailable");
                DiffOutcome::Unavailable(format!("{err:#}"))
            }
        }
    }
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    timeout: Duration,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            workdir: workdir.into(),
            timeout,
        }
    }

    /// Changed, staged and untracked files in porcelain format.
    #[instrument(skip_all, fields(workdir = %self.workdir.display()))]
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        debug!(changed = entries.len(), "git status parsed");
        Ok(entries)
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        let limits = Limits {
            timeout: self.timeout,
            max_output_bytes: GIT_OUTPUT_LIMIT_BYTES,
        };
        let output = run_bounded(cmd, limits)?;
        match output.termination {
            Termination::TimedOut => Err(anyhow!(
                "git {} timed out after {}ms",
                args.join(" "),
                self.timeout.as_millis()
            )),
            Termination::Exited(status) if !status.success() => Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                output.stderr.trim()
            )),
            Termination::Exited(_) if output.truncated => {
                Err(anyhow!("git {} output exceeded {GIT_OUTPUT_LIMIT_BYTES} bytes", args.join(" ")))
            }
            Termination::Exited(_) => Ok(output.stdout),
        }
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: unquote(path.trim()),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry {
        code,
        path: unquote(&path),
    })
}

/// Git quotes paths containing spaces or special characters.
fn unquote(path: &str) -> String {
    path.strip_prefix('"')
        .and_then(|p| p.strip_suffix('"'))
        .unwrap_or(path)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_untracked_line() {
        let e = parse_status_line("?? foo.txt").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: "??".to_string(),
                path: "foo.txt".to_string()
            }
        );
    }

    #[test]
    fn parses_modified_line() {
        let e = parse_status_line(" M src/main.rs").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: " M".to_string(),
                path: "src/main.rs".to_string()
            }
        );
    }

    #[test]
    fn parses_rename_line_uses_new_path() {
        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.path, "new.txt");
    }

    #[test]
    fn strips_quotes_from_paths() {
        let e = parse_status_line("?? \"with space.txt\"").expect("parse");
        assert_eq!(e.path, "with space.txt");
    }

    #[test]
    fn outside_a_repository_diff_is_unavailable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let outcome = GitDiffSource::default().modified_files(temp.path());
        assert!(matches!(outcome, DiffOutcome::Unavailable(_)), "{outcome:?}");
    }
}
