//! Self-evolving project loop.
//!
//! Each cycle asks a proposer for a small change to an engine project, runs
//! it through a validation pipeline, and either commits it together with its
//! narrative or restores the workspace to HEAD. The architecture keeps a
//! strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (diagnostics parsing, static
//!   pre-checks, complexity governance, strategy selection). No I/O.
//! - **[`io`]**: Side-effecting operations (filesystem, git, engine and
//!   proposer processes). Each external system sits behind a trait so tests
//!   can script it.
//!
//! Orchestration modules ([`pipeline`], [`transaction`], [`cycle`],
//! [`looping`]) coordinate core logic with I/O to implement CLI commands.

pub mod core;
pub mod cycle;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod pipeline;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod transaction;
