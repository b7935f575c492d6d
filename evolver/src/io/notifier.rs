//! Announcement sink for committed changes.

use anyhow::Result;
use tracing::info;

/// Receives the patch notes of each committed cycle.
pub trait Notifier {
    fn announce(&self, sequence: u64, notes: &str) -> Result<()>;
}

/// Notifier that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn announce(&self, sequence: u64, notes: &str) -> Result<()> {
        info!(sequence, notes, "patch notes");
        Ok(())
    }
}
