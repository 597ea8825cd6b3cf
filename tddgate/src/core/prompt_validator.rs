//! Pre-dispatch prompt checks.
//!
//! A prompt may only be dispatched when it carries every mandatory section
//! heading and names every TDD phase of its schema layout. Defects are
//! returned as an ordered list of stable strings; the caller decides whether
//! to block.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::core::schema::{PhaseSchema, SchemaVersion};

pub const MISSING_PREFIX: &str = "MISSING:";
pub const INCOMPLETE_PREFIX: &str = "INCOMPLETE:";

/// Result of checking one prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptValidation {
    pub schema_version: SchemaVersion,
    pub errors: Vec<String>,
}

impl PromptValidation {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct PromptValidator<'a> {
    schema: &'a PhaseSchema,
}

impl Default for PromptValidator<'static> {
    fn default() -> Self {
        Self::new(PhaseSchema::canonical())
    }
}

impl<'a> PromptValidator<'a> {
    pub fn new(schema: &'a PhaseSchema) -> Self {
        Self { schema }
    }

    /// Check `prompt` for mandatory sections and phase coverage.
    ///
    /// When `declared` is `None` the version is taken from a
    /// `schema_version: X` hint in the prompt, falling back to the canonical
    /// layout.
    pub fn validate(&self, prompt: &str, declared: Option<SchemaVersion>) -> PromptValidation {
        let version = declared
            .or_else(|| detect_schema_version(prompt))
            .unwrap_or(self.schema.version);
        let mut errors = Vec::new();

        for section in &self.schema.mandatory_sections {
            if !has_section_heading(prompt, section) {
                errors.push(format!(
                    "{MISSING_PREFIX} Mandatory section '{section}' not found"
                ));
            }
        }

        let phases = version.phase_names();
        if !declares_all_phases(prompt, phases.len()) {
            for phase in phases {
                if !mentions_phase(prompt, phase) {
                    errors.push(format!(
                        "{INCOMPLETE_PREFIX} TDD phase '{phase}' not mentioned"
                    ));
                }
            }
        }

        PromptValidation {
            schema_version: version,
            errors,
        }
    }
}

/// Find a `schema_version: X` hint anywhere in the prompt.
pub fn detect_schema_version(prompt: &str) -> Option<SchemaVersion> {
    static VERSION_RE: OnceLock<Regex> = OnceLock::new();
    let re = VERSION_RE.get_or_init(|| {
        Regex::new(r#"(?i)schema[_ ]version["']?\s*[:=]\s*["']?v?([0-9]+(?:\.[0-9]+)?)"#)
            .expect("schema version regex should be valid")
    });
    re.captures(prompt)
        .and_then(|caps| caps.get(1))
        .and_then(|m| SchemaVersion::parse(m.as_str()))
}

fn declares_all_phases(prompt: &str, expected: usize) -> bool {
    static SHORTHAND_RE: OnceLock<Regex> = OnceLock::new();
    let re = SHORTHAND_RE.get_or_init(|| {
        Regex::new(r"(?i)\ball\s+(\d+)\s+phases\s+listed\b")
            .expect("phase shorthand regex should be valid")
    });
    re.captures_iter(prompt)
        .filter_map(|caps| caps.get(1))
        .any(|m| m.as_str().parse::<usize>().ok() == Some(expected))
}

fn has_section_heading(prompt: &str, section: &str) -> bool {
    prompt.lines().any(|line| {
        let trimmed = line.trim_start();
        if !trimmed.starts_with('#') {
            return false;
        }
        let heading = trimmed.trim_start_matches('#').trim();
        let normalized: String = heading
            .chars()
            .map(|c| match c {
                ' ' | '-' => '_',
                other => other.to_ascii_uppercase(),
            })
            .collect();
        match normalized.strip_prefix(section) {
            Some(rest) => !rest.starts_with(is_word_char),
            None => false,
        }
    })
}

/// True when `phase` appears as a whole word on a line that is not
/// commentary about missing phases.
fn mentions_phase(prompt: &str, phase: &str) -> bool {
    prompt
        .lines()
        .filter(|line| !line.to_ascii_lowercase().contains("missing"))
        .any(|line| contains_word(line, phase))
}

fn contains_word(haystack: &str, word: &str) -> bool {
    haystack.match_indices(word).any(|(start, matched)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + matched.len()..].chars().next();
        !before.is_some_and(is_word_char) && !after.is_some_and(is_word_char)
    })
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}
