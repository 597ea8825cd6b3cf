//! Scope checks for files touched during a step.

use std::path::{Path, PathBuf};

use tracing::{debug, instrument};

use crate::core::scope::{ScopeError, ScopeMatcher};
use crate::core::types::ScopeCheckResult;
use crate::io::git::{DiffOutcome, DiffSource};

/// Inputs for one scope check.
#[derive(Debug, Clone)]
pub struct ScopeRequest {
    pub root: PathBuf,
    pub allowed_patterns: Vec<String>,
    /// Pre-supplied modified files; when `None` the diff source is asked.
    pub modified_files: Option<Vec<String>>,
    /// Step tracking artifact (the execution log), always in scope.
    pub tracking_artifact: Option<String>,
}

/// Compares modified files against allow-patterns.
#[derive(Debug, Clone)]
pub struct ScopeChecker<D: DiffSource> {
    diff: D,
}

impl<D: DiffSource> ScopeChecker<D> {
    pub fn new(diff: D) -> Self {
        Self { diff }
    }

    /// Run the check. Only an invalid pattern is an error; an unavailable
    /// diff yields a skipped result.
    #[instrument(skip_all, fields(root = %request.root.display(), patterns = request.allowed_patterns.len()))]
    pub fn check(&self, request: &ScopeRequest) -> Result<ScopeCheckResult, ScopeError> {
        let matcher = ScopeMatcher::new(
            &request.allowed_patterns,
            request.tracking_artifact.as_deref(),
        )?;

        let files = match &request.modified_files {
            Some(files) => files.clone(),
            None => match self.diff.modified_files(&request.root) {
                DiffOutcome::Files(files) => files,
                DiffOutcome::Unavailable(reason) => {
                    debug!(reason = %reason, "scope check skipped");
                    return Ok(ScopeCheckResult::skipped(reason));
                }
            },
        };

        let out_of_scope = matcher.out_of_scope(&files);
        debug!(modified = files.len(), violations = out_of_scope.len(), "scope checked");
        Ok(ScopeCheckResult::violations(out_of_scope))
    }
}

/// Express `artifact` relative to `root` when it lives inside it.
pub fn relative_artifact(root: &Path, artifact: &Path) -> String {
    artifact
        .strip_prefix(root)
        .unwrap_or(artifact)
        .to_string_lossy()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FailingDiff, FixedDiff};

    fn request(patterns: &[&str], files: Option<&[&str]>) -> ScopeRequest {
        ScopeRequest {
            root: PathBuf::from("/repo"),
            allowed_patterns: patterns.iter().map(|p| p.to_string()).collect(),
            modified_files: files.map(|f| f.iter().map(|p| p.to_string()).collect()),
            tracking_artifact: Some("docs/feature/execution-log.yaml".to_string()),
        }
    }

    #[test]
    fn injected_files_bypass_diff_source() {
        let checker = ScopeChecker::new(FailingDiff("should not run".to_string()));
        let result = checker
            .check(&request(&["src/**"], Some(&["src/lib.rs", "Cargo.toml"])))
            .expect("check");
        assert!(result.has_violations);
        assert_eq!(result.out_of_scope_files, vec!["Cargo.toml"]);
        assert!(!result.skipped);
    }

    #[test]
    fn diff_files_are_checked() {
        let checker = ScopeChecker::new(FixedDiff(vec![
            "src/core/a.rs".to_string(),
            "docs/feature/execution-log.yaml".to_string(),
        ]));
        let result = checker.check(&request(&["src/**/*.rs"], None)).expect("check");
        assert_eq!(result, ScopeCheckResult::clean());
    }

    #[test]
    fn failing_diff_is_skipped_not_violation() {
        let checker = ScopeChecker::new(FailingDiff("git status failed: exit 128".to_string()));
        let result = checker.check(&request(&["src/**"], None)).expect("check");
        assert!(result.skipped);
        assert!(!result.has_violations);
        assert_eq!(result.skip_reason.as_deref(), Some("git status failed: exit 128"));
    }

    #[test]
    fn tracking_artifact_never_violates_with_empty_patterns() {
        let checker = ScopeChecker::new(FixedDiff(Vec::new()));
        let result = checker
            .check(&request(&[], Some(&["docs/feature/execution-log.yaml"])))
            .expect("check");
        assert!(!result.has_violations);
    }

    #[test]
    fn invalid_pattern_is_error() {
        let checker = ScopeChecker::new(FixedDiff(Vec::new()));
        assert!(checker.check(&request(&["a/[b"], Some(&[]))).is_err());
    }

    #[test]
    fn artifact_path_is_made_relative() {
        assert_eq!(
            relative_artifact(Path::new("/repo"), Path::new("/repo/docs/log.yaml")),
            "docs/log.yaml"
        );
        assert_eq!(
            relative_artifact(Path::new("/repo"), Path::new("/elsewhere/log.yaml")),
            "/elsewhere/log.yaml"
        );
    }
}
