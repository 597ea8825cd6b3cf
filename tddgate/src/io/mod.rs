//! I/O adapters for the compliance engine.

pub mod audit;
pub mod config;
pub mod execution_log;
pub mod git;
pub mod process;
pub mod step_state;
