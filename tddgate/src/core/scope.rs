//! Allow-list matching for files modified during a step.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScopeError {
    #[error("invalid scope pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        source: globset::Error,
    },
}

/// Compiled allow-patterns plus the always-allowed tracking artifact.
///
/// `*` stays within a path segment and `**` spans any depth.
#[derive(Debug, Clone)]
pub struct ScopeMatcher {
    set: GlobSet,
    tracking_artifact: Option<String>,
}

impl ScopeMatcher {
    pub fn new<S: AsRef<str>>(
        patterns: &[S],
        tracking_artifact: Option<&str>,
    ) -> Result<Self, ScopeError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let glob = GlobBuilder::new(&normalize_path(pattern))
                .literal_separator(true)
                .build()
                .map_err(|source| ScopeError::InvalidPattern {
                    pattern: pattern.to_string(),
                    source,
                })?;
            builder.add(glob);
        }
        let set = builder.build().map_err(|source| ScopeError::InvalidPattern {
            pattern: patterns
                .iter()
                .map(|p| p.as_ref())
                .collect::<Vec<_>>()
                .join(", "),
            source,
        })?;
        Ok(Self {
            set,
            tracking_artifact: tracking_artifact
                .map(normalize_path)
                .filter(|p| !p.is_empty()),
        })
    }

    pub fn is_allowed(&self, path: &str) -> bool {
        let path = normalize_path(path);
        self.is_tracking_artifact(&path) || self.set.is_match(&path)
    }

    /// Modified files that match no pattern, in input order.
    pub fn out_of_scope<S: AsRef<str>>(&self, files: &[S]) -> Vec<String> {
        files
            .iter()
            .map(|f| f.as_ref())
            .filter(|f| !f.trim().is_empty() && !self.is_allowed(f))
            .map(normalize_path)
            .collect()
    }

    fn is_tracking_artifact(&self, path: &str) -> bool {
        let Some(artifact) = &self.tracking_artifact else {
            return false;
        };
        path == artifact
            || path.ends_with(&format!("/{artifact}"))
            || artifact.ends_with(&format!("/{path}"))
    }
}

/// Forward slashes, no leading `./`, no surrounding whitespace.
pub fn normalize_path(path: &str) -> String {
    let replaced = path.trim().replace('\\', "/");
    let mut trimmed = replaced.as_str();
    while let Some(rest) = trimmed.strip_prefix("./") {
        trimmed = rest;
    }
    trimmed.to_string()
}
