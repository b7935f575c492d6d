//! Pre-existing diagnostics captured before a cycle mutates anything.

use std::collections::HashSet;

use crate::core::diagnostics::DiagnosticRecord;

/// Diagnostics that existed before mutation, keyed by `(file, line, message)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BaselineSet {
    keys: HashSet<(String, u32, String)>,
}

impl BaselineSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_records(records: &[DiagnosticRecord]) -> Self {
        Self {
            keys: records.iter().map(key).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, record: &DiagnosticRecord) -> bool {
        self.keys.contains(&key(record))
    }

    /// Records not present in the baseline, in their original order.
    pub fn new_failures(&self, records: Vec<DiagnosticRecord>) -> Vec<DiagnosticRecord> {
        records
            .into_iter()
            .filter(|record| !self.contains(record))
            .collect()
    }
}

fn key(record: &DiagnosticRecord) -> (String, u32, String) {
    (record.file.clone(), record.line, record.message.clone())
}
