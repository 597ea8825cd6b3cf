//! Per-phase turn counting.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Monotonic turn counts keyed by phase name.
///
/// Serializes as a plain `{phase: count}` map so counts survive a resumed
/// execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TurnCounter {
    counts: BTreeMap<String, u32>,
}

impl TurnCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one turn to `phase` and return the new count.
    pub fn increment(&mut self, phase: &str) -> u32 {
        let count = self.counts.entry(phase.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    pub fn get(&self, phase: &str) -> u32 {
        self.counts.get(phase).copied().unwrap_or(0)
    }

    pub fn reset(&mut self, phase: &str) {
        self.counts.remove(phase);
    }

    pub fn total(&self) -> u32 {
        self.counts.values().fold(0u32, |acc, c| acc.saturating_add(*c))
    }

    pub fn to_map(&self) -> BTreeMap<String, u32> {
        self.counts.clone()
    }

    pub fn from_map(counts: BTreeMap<String, u32>) -> Self {
        Self { counts }
    }
}
