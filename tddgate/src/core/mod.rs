//! Deterministic, pure logic shared by the compliance engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod completion;
pub mod prompt_validator;
pub mod schema;
pub mod scope;
pub mod timeout;
pub mod turns;
pub mod types;
