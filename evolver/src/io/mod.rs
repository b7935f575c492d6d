//! Side-effecting collaborators: filesystem, git, child processes.

pub mod capabilities;
pub mod codebase;
pub mod config;
pub mod cycle_log;
pub mod git;
pub mod harness;
pub mod init;
pub mod intent;
pub mod narrative;
pub mod notifier;
pub mod process;
pub mod prompt;
pub mod proposer;
pub mod static_check;
pub mod workspace;
