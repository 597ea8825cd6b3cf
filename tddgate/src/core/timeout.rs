//! Elapsed-time thresholds for a running phase.

use chrono::{DateTime, Utc};

/// Tracks how long a phase has been running relative to `started_at`.
///
/// Stateless: every call reports all crossed thresholds, so callers
/// de-duplicate warnings they have already emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutMonitor {
    started_at: DateTime<Utc>,
}

impl TimeoutMonitor {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self { started_at }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Seconds since start; clock skew never yields a negative value.
    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.started_at).num_seconds().max(0)
    }

    /// Thresholds (in minutes) that `now` has reached, in ascending order.
    pub fn crossed_thresholds(&self, thresholds_minutes: &[u32], now: DateTime<Utc>) -> Vec<u32> {
        let elapsed = self.elapsed_seconds(now);
        let mut crossed: Vec<u32> = thresholds_minutes
            .iter()
            .copied()
            .filter(|minutes| elapsed >= i64::from(*minutes) * 60)
            .collect();
        crossed.sort_unstable();
        crossed.dedup();
        crossed
    }

    pub fn warning_message(&self, phase: &str, threshold_minutes: u32, now: DateTime<Utc>) -> String {
        let elapsed_minutes = self.elapsed_seconds(now) / 60;
        format!(
            "Phase {phase} has been running for {elapsed_minutes} minutes (threshold {threshold_minutes} minutes)"
        )
    }
}
