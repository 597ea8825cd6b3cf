//! Stable exit codes for tddgate hook commands.

/// The hook allows the action (prompt valid, step complete, nothing stale).
pub const ALLOW: i32 = 0;
/// Malformed input, unreadable configuration, or another transport error.
pub const ERROR: i32 = 1;
/// The hook blocks the action; the verdict on stdout says why.
pub const BLOCK: i32 = 2;
