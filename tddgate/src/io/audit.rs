//! Append-only audit trail under `<audit dir>/audit-YYYY-MM-DD.log`.
//!
//! One JSON object per line, one file per UTC day. Entries are never edited or
//! removed; writers open in append mode and emit each line with a single
//! write so concurrent hook processes cannot interleave partial entries.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

pub const AUDIT_DIR_ENV: &str = "TDDGATE_AUDIT_LOG_DIR";
const AUDIT_FILE_PREFIX: &str = "audit-";
const AUDIT_FILE_SUFFIX: &str = ".log";

/// Closed set of audit event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    TaskInvocationStarted,
    TaskInvocationValidated,
    TaskInvocationRejected,
    PhaseStarted,
    PhaseExecuted,
    PhaseSkipped,
    PhaseFailed,
    SubagentStopPassed,
    SubagentStopFailed,
    ScopeViolation,
    CommitSucceeded,
    CommitFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event: AuditEventType,
    #[serde(with = "millis_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Free-form payload; keys serialize sorted.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, Value>,
}

impl AuditEvent {
    pub fn new(event: AuditEventType) -> Self {
        Self {
            event,
            timestamp: Utc::now(),
            project_id: None,
            step_id: None,
            data: BTreeMap::new(),
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Serialize as a single line (no trailing newline).
    pub fn to_line(&self) -> Result<String> {
        serde_json::to_string(self).context("serialize audit event")
    }
}

mod millis_timestamp {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&ts.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// Audit file name for a UTC calendar day.
pub fn audit_file_name(date: NaiveDate) -> String {
    format!("{AUDIT_FILE_PREFIX}{}{AUDIT_FILE_SUFFIX}", date.format("%Y-%m-%d"))
}

/// Pick the audit directory.
///
/// Order: explicit override, `TDDGATE_AUDIT_LOG_DIR` (skipped unless it is a
/// writable directory), `<project>/.tddgate/audit`, `$HOME/.tddgate/audit`.
/// `env` is the variable lookup, normally `|k| std::env::var(k).ok()`.
pub fn resolve_audit_dir<F>(
    explicit: Option<&Path>,
    project_root: Option<&Path>,
    env: F,
) -> Option<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(dir) = explicit {
        return Some(dir.to_path_buf());
    }

    if let Some(raw) = env(AUDIT_DIR_ENV).filter(|v| !v.trim().is_empty()) {
        let dir = PathBuf::from(raw.trim());
        match ensure_writable_dir(&dir) {
            Ok(()) => return Some(dir),
            Err(err) => warn!(dir = %dir.display(), err = %err, "ignoring {AUDIT_DIR_ENV}"),
        }
    }

    let mut candidates = Vec::new();
    if let Some(root) = project_root {
        candidates.push(root.join(".tddgate").join("audit"));
    }
    if let Some(home) = env("HOME").or_else(|| env("USERPROFILE")) {
        candidates.push(PathBuf::from(home).join(".tddgate").join("audit"));
    }
    for dir in candidates {
        match ensure_writable_dir(&dir) {
            Ok(()) => return Some(dir),
            Err(err) => debug!(dir = %dir.display(), err = %err, "audit dir candidate rejected"),
        }
    }
    warn!("no writable audit directory found; audit logging disabled");
    None
}

fn ensure_writable_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    let meta = fs::metadata(dir).with_context(|| format!("stat {}", dir.display()))?;
    if !meta.is_dir() {
        anyhow::bail!("{} is not a directory", dir.display());
    }
    // Permission bits do not tell whether this process may create files here.
    tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("{} is not writable", dir.display()))?;
    Ok(())
}

/// Appends audit events. A writer without a directory drops events.
#[derive(Debug, Clone)]
pub struct AuditWriter {
    dir: Option<PathBuf>,
}

impl AuditWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
        }
    }

    pub fn disabled() -> Self {
        Self { dir: None }
    }

    pub fn from_resolved(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    pub fn is_enabled(&self) -> bool {
        self.dir.is_some()
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Append `event` to the file of its UTC day.
    pub fn append(&self, event: &AuditEvent) -> Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        fs::create_dir_all(dir).with_context(|| format!("create audit dir {}", dir.display()))?;
        let path = dir.join(audit_file_name(event.timestamp.date_naive()));
        let mut line = event.to_line()?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open audit log {}", path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append audit log {}", path.display()))?;
        debug!(event = ?event.event, path = %path.display(), "audit event written");
        Ok(())
    }

    /// Append `event`, logging instead of failing. Verdicts never depend on
    /// the audit trail being writable.
    pub fn record(&self, event: AuditEvent) {
        if let Err(err) = self.append(&event) {
            warn!(event = ?event.event, err = %format!("{err:#}"), "failed to write audit event");
        }
    }
}

/// Read-only access to the audit trail.
#[derive(Debug, Clone)]
pub struct AuditReader {
    dir: PathBuf,
}

impl AuditReader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Audit files, oldest day first.
    pub fn files(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("read audit dir {}", self.dir.display()))?
        {
            let path = entry?.path();
            let is_audit = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(AUDIT_FILE_PREFIX) && n.ends_with(AUDIT_FILE_SUFFIX));
            if is_audit && path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    pub fn entries_for_date(&self, date: NaiveDate) -> Result<Vec<AuditEvent>> {
        let path = self.dir.join(audit_file_name(date));
        if !path.exists() {
            return Ok(Vec::new());
        }
        read_entries(&path)
    }

    /// All entries of `kind`, oldest first.
    pub fn entries_of_type(&self, kind: AuditEventType) -> Result<Vec<AuditEvent>> {
        let mut out = Vec::new();
        for path in self.files()? {
            out.extend(read_entries(&path)?.into_iter().filter(|e| e.event == kind));
        }
        Ok(out)
    }

    /// Most recent entry satisfying `predicate`, scanning from the newest file
    /// backwards.
    pub fn latest_matching<P>(&self, predicate: P) -> Result<Option<AuditEvent>>
    where
        P: Fn(&AuditEvent) -> bool,
    {
        for path in self.files()?.iter().rev() {
            let found = read_entries(path)?.into_iter().rev().find(|e| predicate(e));
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }
}

/// Parse one audit file, skipping malformed or partially written lines.
fn read_entries(path: &Path) -> Result<Vec<AuditEvent>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read audit log {}", path.display()))?;
    let mut entries = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<AuditEvent>(line) {
            Ok(entry) => entries.push(entry),
            Err(err) => debug!(path = %path.display(), line = idx + 1, err = %err, "skipping audit line"),
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::utc;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn writable_check_leaves_no_files_behind() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("audit");
        ensure_writable_dir(&dir).expect("writable");
        assert_eq!(fs::read_dir(&dir).expect("read dir").count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn directory_without_write_access_is_rejected() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("locked");
        fs::create_dir(&dir).expect("mkdir");
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o555)).expect("chmod");
        // Privileged users bypass permission bits; nothing to assert then.
        let can_write = fs::write(dir.join("check"), "x").is_ok();
        let result = ensure_writable_dir(&dir);
        let env_value = dir.to_string_lossy().to_string();
        let env = |key: &str| (key == AUDIT_DIR_ENV).then(|| env_value.clone());
        let resolved = resolve_audit_dir(None, Some(temp.path()), env);
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o755)).expect("chmod");
        if !can_write {
            assert!(result.is_err());
            assert_eq!(resolved, Some(temp.path().join(".tddgate").join("audit")));
        }
    }

    #[test]
    fn serializes_deterministically_with_millis() {
        let event = AuditEvent::new(AuditEventType::ScopeViolation)
            .at(utc("2026-01-10T12:00:00.123456Z"))
            .project("proj")
            .step("01-01")
            .with("zeta", 1)
            .with("alpha", "a");
        assert_eq!(
            event.to_line().expect("line"),
            r#"{"event":"SCOPE_VIOLATION","timestamp":"2026-01-10T12:00:00.123Z","project_id":"proj","step_id":"01-01","data":{"alpha":"a","zeta":1}}"#
        );
    }

    #[test]
    fn optional_fields_are_omitted() {
        let event = AuditEvent::new(AuditEventType::CommitSucceeded).at(utc("2026-01-10T00:00:00Z"));
        assert_eq!(
            event.to_line().expect("line"),
            r#"{"event":"COMMIT_SUCCEEDED","timestamp":"2026-01-10T00:00:00.000Z"}"#
        );
    }

    #[test]
    fn rotates_files_by_utc_day() {
        let temp = tempfile::tempdir().expect("tempdir");
        let writer = AuditWriter::new(temp.path());
        writer
            .append(&AuditEvent::new(AuditEventType::PhaseStarted).at(utc("2026-01-10T23:59:59Z")))
            .expect("append");
        writer
            .append(&AuditEvent::new(AuditEventType::PhaseExecuted).at(utc("2026-01-11T00:00:01Z")))
            .expect("append");

        let reader = AuditReader::new(temp.path());
        let files = reader.files().expect("files");
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().expect("name").to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["audit-2026-01-10.log", "audit-2026-01-11.log"]);
        let day = NaiveDate::from_ymd_opt(2026, 1, 11).expect("date");
        assert_eq!(reader.entries_for_date(day).expect("entries").len(), 1);
    }

    #[test]
    fn appends_never_rewrite_existing_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let writer = AuditWriter::new(temp.path());
        let ts = utc("2026-01-10T08:00:00Z");
        writer
            .append(&AuditEvent::new(AuditEventType::PhaseStarted).at(ts))
            .expect("append");
        let path = temp.path().join("audit-2026-01-10.log");
        let first = fs::read_to_string(&path).expect("read");
        writer
            .append(&AuditEvent::new(AuditEventType::PhaseFailed).at(ts))
            .expect("append");
        let second = fs::read_to_string(&path).expect("read");
        assert!(second.starts_with(&first));
        assert_eq!(second.lines().count(), 2);
    }

    #[test]
    fn reader_filters_by_type_and_finds_latest() {
        let temp = tempfile::tempdir().expect("tempdir");
        let writer = AuditWriter::new(temp.path());
        for (kind, ts, step) in [
            (AuditEventType::SubagentStopFailed, "2026-01-09T10:00:00Z", "01-01"),
            (AuditEventType::SubagentStopPassed, "2026-01-10T10:00:00Z", "01-01"),
            (AuditEventType::SubagentStopFailed, "2026-01-10T11:00:00Z", "01-02"),
            (AuditEventType::ScopeViolation, "2026-01-10T12:00:00Z", "01-02"),
        ] {
            writer
                .append(&AuditEvent::new(kind).at(utc(ts)).step(step))
                .expect("append");
        }

        let reader = AuditReader::new(temp.path());
        let failed = reader
            .entries_of_type(AuditEventType::SubagentStopFailed)
            .expect("entries");
        let steps: Vec<_> = failed.iter().map(|e| e.step_id.as_deref()).collect();
        assert_eq!(steps, vec![Some("01-01"), Some("01-02")]);

        let latest = reader
            .latest_matching(|e| e.step_id.as_deref() == Some("01-01"))
            .expect("scan")
            .expect("found");
        assert_eq!(latest.event, AuditEventType::SubagentStopPassed);
        assert!(reader.latest_matching(|e| e.step_id.as_deref() == Some("09-09")).expect("scan").is_none());
    }

    #[test]
    fn reader_skips_malformed_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("audit-2026-01-10.log");
        fs::write(
            &path,
            "{\"event\":\"PHASE_STARTED\",\"timestamp\":\"2026-01-10T00:00:00.000Z\"}\nnot json\n{\"event\":\"PHASE_",
        )
        .expect("write");
        let reader = AuditReader::new(temp.path());
        assert_eq!(reader.entries_of_type(AuditEventType::PhaseStarted).expect("read").len(), 1);
    }

    #[test]
    fn missing_dir_reads_as_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let reader = AuditReader::new(temp.path().join("absent"));
        assert!(reader.files().expect("files").is_empty());
    }

    #[test]
    fn disabled_writer_drops_events() {
        let writer = AuditWriter::disabled();
        assert!(!writer.is_enabled());
        writer
            .append(&AuditEvent::new(AuditEventType::PhaseStarted))
            .expect("no-op");
    }

    #[test]
    fn resolution_prefers_explicit_then_env_then_project() {
        let temp = tempfile::tempdir().expect("tempdir");
        let explicit = temp.path().join("explicit");
        let env_dir = temp.path().join("from-env");
        let env_value = env_dir.to_string_lossy().to_string();
        let env = |key: &str| (key == AUDIT_DIR_ENV).then(|| env_value.clone());

        assert_eq!(
            resolve_audit_dir(Some(&explicit), Some(temp.path()), env),
            Some(explicit.clone())
        );
        assert_eq!(resolve_audit_dir(None, Some(temp.path()), env), Some(env_dir));
        assert_eq!(
            resolve_audit_dir(None, Some(temp.path()), no_env),
            Some(temp.path().join(".tddgate").join("audit"))
        );
    }

    #[test]
    fn unusable_env_dir_falls_through() {
        let temp = tempfile::tempdir().expect("tempdir");
        let blocker = temp.path().join("file");
        fs::write(&blocker, "x").expect("write");
        let env_value = blocker.join("sub").to_string_lossy().to_string();
        let env = |key: &str| (key == AUDIT_DIR_ENV).then(|| env_value.clone());
        assert_eq!(
            resolve_audit_dir(None, Some(temp.path()), env),
            Some(temp.path().join(".tddgate").join("audit"))
        );
    }

    #[test]
    fn falls_back_to_home() {
        let temp = tempfile::tempdir().expect("tempdir");
        let home = temp.path().to_string_lossy().to_string();
        let env = |key: &str| (key == "HOME").then(|| home.clone());
        assert_eq!(
            resolve_audit_dir(None, None, env),
            Some(temp.path().join(".tddgate").join("audit"))
        );
    }
}
