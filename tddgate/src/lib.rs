//! TDD phase compliance engine.
//!
//! Validates that delegated work follows a fixed sequence of TDD phases: the
//! instruction prompt is checked before dispatch, and the execution log is
//! checked when the step finishes. The architecture keeps a strict split:
//!
//! - **[`core`]**: Pure, deterministic logic (phase schema, prompt and
//!   completion validation, scope matching, turn and time accounting).
//! - **[`io`]**: Side-effecting operations (execution log, step state, audit
//!   trail, configuration, git).
//!
//! Orchestration modules ([`orchestrator`], [`record`], [`scope`], [`stale`]) combine
//! core logic with I/O to implement the hook commands of the CLI.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod record;
pub mod scope;
pub mod stale;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
