//! Deterministic, pure logic shared by the evolver.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod baseline;
pub mod diagnostics;
pub mod governor;
pub mod precheck;
pub mod strategy;
pub mod types;
