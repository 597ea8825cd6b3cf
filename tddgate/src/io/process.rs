//! Subprocess execution under a hard deadline with capped output capture.

use std::io::{self, Read};
use std::process::{Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Deadline and capture ceiling for one subprocess.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub timeout: Duration,
    /// Bytes kept per stream; the rest is drained and discarded.
    pub max_output_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(ExitStatus),
    /// Killed after the deadline passed.
    TimedOut,
}

#[derive(Debug)]
pub struct BoundedOutput {
    pub termination: Termination,
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
}

impl BoundedOutput {
    pub fn succeeded(&self) -> bool {
        matches!(self.termination, Termination::Exited(status) if status.success())
    }
}

/// Run `cmd` with stdin closed, draining both pipes concurrently so a chatty
/// child cannot block on a full pipe.
#[instrument(skip_all, fields(timeout_ms = limits.timeout.as_millis() as u64))]
pub fn run_bounded(mut cmd: Command, limits: Limits) -> Result<BoundedOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn().context("spawn command")?;

    let stdout = child.stdout.take().ok_or_else(|| anyhow!("stdout not piped"))?;
    let stderr = child.stderr.take().ok_or_else(|| anyhow!("stderr not piped"))?;
    let stdout = capture(stdout, limits.max_output_bytes);
    let stderr = capture(stderr, limits.max_output_bytes);

    let termination = match child.wait_timeout(limits.timeout).context("wait for command")? {
        Some(status) => Termination::Exited(status),
        None => {
            warn!("deadline passed; killing child");
            child.kill().context("kill command")?;
            child.wait().context("reap killed command")?;
            Termination::TimedOut
        }
    };

    let (stdout, stdout_cut) = collect(stdout).context("collect stdout")?;
    let (stderr, stderr_cut) = collect(stderr).context("collect stderr")?;
    debug!(?termination, "command finished");
    Ok(BoundedOutput {
        termination,
        stdout,
        stderr,
        truncated: stdout_cut || stderr_cut,
    })
}

type Capture = JoinHandle<io::Result<(Vec<u8>, bool)>>;

fn capture<R: Read + Send + 'static>(reader: R, limit: u64) -> Capture {
    thread::spawn(move || read_capped(reader, limit))
}

fn read_capped<R: Read>(reader: R, limit: u64) -> io::Result<(Vec<u8>, bool)> {
    let mut kept = Vec::new();
    let mut limited = reader.take(limit);
    limited.read_to_end(&mut kept)?;
    let dropped = io::copy(&mut limited.into_inner(), &mut io::sink())?;
    Ok((kept, dropped > 0))
}

fn collect(handle: Capture) -> Result<(String, bool)> {
    let (bytes, truncated) = handle
        .join()
        .map_err(|_| anyhow!("capture thread panicked"))??;
    Ok((String::from_utf8_lossy(&bytes).into_owned(), truncated))
}
