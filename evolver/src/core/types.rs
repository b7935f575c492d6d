//! Shared deterministic types for the evolver core.
//!
//! These types define stable contracts between the cycle components. They do
//! not depend on external state or I/O.

use std::fmt;

use serde::{Deserialize, Serialize};

/// How a proposed file edit relates to the existing project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditMode {
    Create,
    Edit,
}

/// One proposed file write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEdit {
    /// Path relative to the project dir (a leading `<project>/` is tolerated).
    pub path: String,
    pub mode: EditMode,
    /// Complete file contents after the edit.
    pub content: String,
}

impl FileEdit {
    /// Line count as seen by the complexity governor (newlines + 1).
    pub fn line_count(&self) -> usize {
        self.content.matches('\n').count() + 1
    }
}

/// Narrative side channel carried by a bundle.
///
/// None of these fields affect validation; they are persisted only when the
/// bundle commits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Narrative {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lore_entry: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch_notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub learning: Option<String>,
    /// Full replacement for the learnings file, when the proposer curated it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub curated_learnings: Option<String>,
}

/// One proposed change set for one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeBundle {
    /// Short verb describing the change (e.g. `add`, `fix`).
    pub action: String,
    /// What the change is about (e.g. `slime_enemy`).
    pub target: String,
    /// Ordered file edits.
    pub files: Vec<FileEdit>,
    #[serde(flatten)]
    pub narrative: Narrative,
}

impl ChangeBundle {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_lines(&self) -> usize {
        self.files.iter().map(FileEdit::line_count).sum()
    }

    pub fn created_count(&self) -> usize {
        self.files
            .iter()
            .filter(|edit| edit.mode == EditMode::Create)
            .count()
    }
}

/// Outcome of one cycle as persisted in the cycle log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleResult {
    Success,
    Fail,
}

/// Typed classification of a failed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Proposal,
    EmptyBundle,
    Governance,
    Sandbox,
    PreCheck,
    Functional,
    Smoke,
    Intent,
    Timeout,
    ProcessNotFound,
    Transaction,
    Internal,
}

/// One durable log entry summarizing a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub sequence: u64,
    pub action: String,
    pub target: String,
    pub result: CycleResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<String>,
}

impl CycleRecord {
    pub fn success(sequence: u64, action: &str, target: &str, note: Option<String>) -> Self {
        Self {
            sequence,
            action: action.to_string(),
            target: target.to_string(),
            result: CycleResult::Success,
            error: None,
            note: note.filter(|n| !n.trim().is_empty()),
            kind: None,
            recorded_at: None,
        }
    }

    pub fn failure(
        sequence: u64,
        action: &str,
        target: &str,
        kind: FailureKind,
        error: impl Into<String>,
    ) -> Self {
        Self {
            sequence,
            action: action.to_string(),
            target: target.to_string(),
            result: CycleResult::Fail,
            error: Some(error.into()),
            note: None,
            kind: Some(kind),
            recorded_at: None,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.result == CycleResult::Fail
    }
}

/// Strategy chosen for the next cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Explore,
    Retry,
    Pivot,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Explore => "explore",
            Strategy::Retry => "retry",
            Strategy::Pivot => "pivot",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pass/fail stages of the validation pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    PreCheck,
    Functional,
    Smoke,
    Intent,
}

impl Stage {
    pub const ORDER: [Stage; 4] = [Stage::PreCheck, Stage::Functional, Stage::Smoke, Stage::Intent];

    pub fn label(self) -> &'static str {
        match self {
            Stage::PreCheck => "Pre-check",
            Stage::Functional => "Functional test",
            Stage::Smoke => "Smoke test",
            Stage::Intent => "Intent check",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Every way a cycle can end without committing.
///
/// Each variant is reduced to exactly one failed [`CycleRecord`] by the cycle
/// controller; none of them escape a cycle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CycleFailure {
    #[error("Proposal failed: {0}")]
    Proposal(String),
    #[error("Proposer returned no files")]
    EmptyBundle,
    #[error("Complexity budget: {0}")]
    Governance(String),
    #[error("Sandbox violation: {0}")]
    Sandbox(String),
    #[error("{stage}: {summary}")]
    Diagnostic { stage: Stage, summary: String },
    #[error("Intent check: {0}")]
    Intent(String),
    #[error("{stage}: engine timed out after {secs}s")]
    Timeout { stage: Stage, secs: u64 },
    #[error("{stage}: engine executable not found: {program}")]
    ProcessNotFound { stage: Stage, program: String },
    #[error("Commit failed: {0}")]
    Transaction(String),
}

impl CycleFailure {
    pub fn kind(&self) -> FailureKind {
        match self {
            CycleFailure::Proposal(_) => FailureKind::Proposal,
            CycleFailure::EmptyBundle => FailureKind::EmptyBundle,
            CycleFailure::Governance(_) => FailureKind::Governance,
            CycleFailure::Sandbox(_) => FailureKind::Sandbox,
            CycleFailure::Diagnostic { stage, .. } => match stage {
                Stage::PreCheck => FailureKind::PreCheck,
                Stage::Functional => FailureKind::Functional,
                Stage::Smoke => FailureKind::Smoke,
                Stage::Intent => FailureKind::Intent,
            },
            CycleFailure::Intent(_) => FailureKind::Intent,
            CycleFailure::Timeout { .. } => FailureKind::Timeout,
            CycleFailure::ProcessNotFound { .. } => FailureKind::ProcessNotFound,
            CycleFailure::Transaction(_) => FailureKind::Transaction,
        }
    }

    /// True when the workspace was (or may have been) written before the failure.
    pub fn requires_rollback(&self) -> bool {
        !matches!(
            self,
            CycleFailure::Proposal(_) | CycleFailure::EmptyBundle | CycleFailure::Governance(_)
        )
    }
}
