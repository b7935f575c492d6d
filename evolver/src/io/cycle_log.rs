//! Cycle log: the active window plus an append-only archive.
//!
//! The active log (`cycles.json`) holds the most recent records as a JSON
//! array and is replaced atomically. Records pushed out of the window are
//! appended verbatim to `cycles.archive.jsonl` before the active log is
//! rewritten, so a crash between the two steps can duplicate a record in the
//! archive but never lose one.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{SecondsFormat, Utc};
use tracing::{debug, instrument};

use crate::core::types::CycleRecord;
use crate::io::config::{Layout, write_atomic};

#[derive(Debug, Clone)]
pub struct CycleLog {
    active_path: PathBuf,
    archive_path: PathBuf,
    active_limit: usize,
}

impl CycleLog {
    pub fn new(active_path: PathBuf, archive_path: PathBuf, active_limit: usize) -> Self {
        Self {
            active_path,
            archive_path,
            active_limit: active_limit.max(1),
        }
    }

    pub fn from_layout(layout: &Layout, active_limit: usize) -> Self {
        Self::new(
            layout.active_log_path.clone(),
            layout.archive_log_path.clone(),
            active_limit,
        )
    }

    pub fn active_path(&self) -> &Path {
        &self.active_path
    }

    /// Records in the active window, oldest first. Missing file → empty.
    pub fn read_active(&self) -> Result<Vec<CycleRecord>> {
        if !self.active_path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.active_path)
            .with_context(|| format!("read cycle log {}", self.active_path.display()))?;
        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&contents)
            .with_context(|| format!("parse cycle log {}", self.active_path.display()))
    }

    /// All archived records, oldest first.
    pub fn read_archive(&self) -> Result<Vec<CycleRecord>> {
        if !self.archive_path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.archive_path)
            .with_context(|| format!("read cycle archive {}", self.archive_path.display()))?;
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(idx, line)| {
                serde_json::from_str(line).with_context(|| {
                    format!(
                        "parse cycle archive {} line {}",
                        self.archive_path.display(),
                        idx + 1
                    )
                })
            })
            .collect()
    }

    fn last_sequence(&self, active: &[CycleRecord]) -> Result<u64> {
        if let Some(max) = active.iter().map(|r| r.sequence).max() {
            return Ok(max);
        }
        Ok(self
            .read_archive()?
            .iter()
            .map(|r| r.sequence)
            .max()
            .unwrap_or(0))
    }

    /// Sequence number for the next record.
    pub fn next_sequence(&self) -> Result<u64> {
        let active = self.read_active()?;
        Ok(self.last_sequence(&active)? + 1)
    }

    /// Append one record, archiving overflow beyond the active limit.
    ///
    /// Stamps `recorded_at` when unset. Rejects a sequence that does not
    /// increase.
    #[instrument(skip_all, fields(sequence = record.sequence, result = ?record.result))]
    pub fn append(&self, mut record: CycleRecord) -> Result<()> {
        let mut active = self.read_active()?;
        let last = self.last_sequence(&active)?;
        if record.sequence <= last {
            return Err(anyhow!(
                "cycle sequence must increase: got {} after {last}",
                record.sequence
            ));
        }
        if record.recorded_at.is_none() {
            record.recorded_at = Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));
        }
        active.push(record);

        if active.len() > self.active_limit {
            let overflow: Vec<CycleRecord> =
                active.drain(..active.len() - self.active_limit).collect();
            self.archive(&overflow)?;
            debug!(archived = overflow.len(), "moved records to archive");
        }

        let mut buf = serde_json::to_string_pretty(&active).context("serialize cycle log")?;
        buf.push('\n');
        write_atomic(&self.active_path, &buf)
    }

    fn archive(&self, records: &[CycleRecord]) -> Result<()> {
        if let Some(parent) = self.archive_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.archive_path)
            .with_context(|| format!("open cycle archive {}", self.archive_path.display()))?;
        let mut buf = String::new();
        for record in records {
            buf.push_str(&serde_json::to_string(record).context("serialize archived record")?);
            buf.push('\n');
        }
        file.write_all(buf.as_bytes())
            .with_context(|| format!("append cycle archive {}", self.archive_path.display()))?;
        file.sync_all()
            .with_context(|| format!("sync cycle archive {}", self.archive_path.display()))?;
        Ok(())
    }
}
