//! Engine settings stored under `.tddgate/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const STALE_THRESHOLD_ENV: &str = "TDDGATE_STALE_THRESHOLD_MINUTES";

/// Engine settings (TOML).
///
/// Missing fields default to the values below; environment overrides are
/// applied on top by [`Settings::with_env_overrides`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    /// Write audit events at all.
    pub audit_logging_enabled: bool,

    /// Explicit audit directory; wins over every other source.
    pub audit_dir: Option<PathBuf>,

    /// Age after which an `IN_PROGRESS` phase counts as stale.
    pub stale_threshold_minutes: u32,

    /// Hard ceiling for the version-control diff.
    pub diff_timeout_secs: u64,

    /// Elapsed-time warnings for a running phase, in minutes.
    pub phase_warning_minutes: Vec<u32>,

    /// Default scope allow-patterns when a request carries none.
    pub allowed_patterns: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            audit_logging_enabled: true,
            audit_dir: None,
            stale_threshold_minutes: 30,
            diff_timeout_secs: 5,
            phase_warning_minutes: vec![5, 10, 15],
            allowed_patterns: Vec::new(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.stale_threshold_minutes == 0 {
            return Err(anyhow!("stale_threshold_minutes must be > 0"));
        }
        if self.diff_timeout_secs == 0 {
            return Err(anyhow!("diff_timeout_secs must be > 0"));
        }
        if self.phase_warning_minutes.contains(&0) {
            return Err(anyhow!("phase_warning_minutes entries must be > 0"));
        }
        Ok(())
    }

    /// Apply environment overrides. Invalid values are ignored with a warning.
    pub fn with_env_overrides<F>(mut self, env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = env(STALE_THRESHOLD_ENV) {
            match raw.trim().parse::<u32>() {
                Ok(minutes) if minutes > 0 => self.stale_threshold_minutes = minutes,
                _ => warn!(value = %raw, "ignoring invalid {STALE_THRESHOLD_ENV}"),
            }
        }
        self
    }
}

/// Canonical settings path for a project root.
pub fn settings_path(root: &Path) -> PathBuf {
    root.join(".tddgate").join("config.toml")
}

/// Load settings from a TOML file.
///
/// If the file is missing, returns `Settings::default()`.
pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        let cfg = Settings::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: Settings =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write settings to disk (temp file + rename).
pub fn write_settings(path: &Path, cfg: &Settings) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize settings toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("settings path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp settings {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace settings {}", path.display()))?;
    Ok(())
}
