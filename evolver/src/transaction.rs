//! Transaction manager: apply, validate, then commit or roll back.
//!
//! The workspace is never left half-mutated: every path out of
//! [`Transaction::execute`] either commits the project and narrative dirs
//! together, or restores the project dir (and the narrative dir, once it was
//! written) to HEAD.

use std::fs;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::baseline::BaselineSet;
use crate::core::types::{ChangeBundle, CycleFailure, Stage};
use crate::io::config::{Layout, write_atomic};
use crate::io::git::VersionControl;
use crate::io::narrative::{LearningTag, NarrativeStore};
use crate::io::workspace::Workspace;
use crate::pipeline::{PipelineInput, PipelineOutcome, ValidationPipeline};

const TRUNCATION_NOTICE: &str = "\n... (truncated)\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOutcome {
    Committed {
        /// Project-relative paths written by the bundle.
        written: Vec<String>,
        stages_run: Vec<Stage>,
    },
    /// The change was discarded; the workspace matches HEAD again.
    RolledBack(CycleFailure),
}

pub struct Transaction<'a> {
    vcs: &'a dyn VersionControl,
    layout: &'a Layout,
    workspace: Workspace,
    narrative: &'a NarrativeStore,
    failed_diff_limit: usize,
}

impl<'a> Transaction<'a> {
    pub fn new(
        vcs: &'a dyn VersionControl,
        layout: &'a Layout,
        narrative: &'a NarrativeStore,
        failed_diff_limit: usize,
    ) -> Self {
        Self {
            vcs,
            layout,
            workspace: Workspace::new(&layout.project_dir, &layout.project_rel),
            narrative,
            failed_diff_limit,
        }
    }

    /// Apply `bundle`, validate it, and commit it or restore HEAD.
    ///
    /// `Err` means an internal fault (write or rollback failure). The project
    /// dir has been restored on a best-effort basis when one is returned.
    #[instrument(skip_all, fields(sequence = sequence, action = %bundle.action, target = %bundle.target))]
    pub fn execute(
        &self,
        sequence: u64,
        bundle: &ChangeBundle,
        pipeline: &ValidationPipeline<'_>,
        baseline: &BaselineSet,
    ) -> Result<TxOutcome> {
        let plan = match self.workspace.plan(bundle) {
            Ok(plan) => plan,
            Err(failure) => {
                warn!(reason = %failure, "bundle rejected before write");
                return Ok(TxOutcome::RolledBack(failure));
            }
        };

        if let Err(err) = self.workspace.apply(bundle, &plan) {
            self.restore_after_fault(false);
            return Err(err).context("apply bundle");
        }

        let input = PipelineInput {
            project_dir: self.workspace.project_dir(),
            bundle,
            written: &plan.paths,
            baseline,
        };
        let stages_run = match pipeline.run(&input) {
            Ok(PipelineOutcome::Passed { stages_run }) => stages_run,
            Ok(PipelineOutcome::Failed(failure)) => {
                self.save_failed_diff();
                self.restore(false).context("roll back failed change")?;
                info!(reason = %failure, "change rolled back");
                return Ok(TxOutcome::RolledBack(failure));
            }
            Err(err) => {
                self.restore_after_fault(false);
                return Err(err).context("run validation pipeline");
            }
        };

        if let Err(err) = self.write_narrative(sequence, bundle) {
            self.restore(true).context("roll back after narrative failure")?;
            return Ok(TxOutcome::RolledBack(CycleFailure::Transaction(format!(
                "narrative write: {err:#}"
            ))));
        }

        let message = format!("cycle {sequence}: {} {}", bundle.action, bundle.target);
        let paths = [
            self.layout.project_rel.as_str(),
            self.layout.narrative_rel.as_str(),
        ];
        match self.vcs.commit_paths(&paths, &message) {
            Ok(committed) => {
                debug!(committed, "commit finished");
            }
            Err(err) => {
                self.restore(true).context("roll back after commit failure")?;
                return Ok(TxOutcome::RolledBack(CycleFailure::Transaction(format!(
                    "{err:#}"
                ))));
            }
        }

        self.clear_failed_diff();
        info!(files = plan.paths.len(), "change committed");
        Ok(TxOutcome::Committed {
            written: plan.paths,
            stages_run,
        })
    }

    fn write_narrative(&self, sequence: u64, bundle: &ChangeBundle) -> Result<()> {
        let narrative = &bundle.narrative;
        if let Some(entry) = narrative.lore_entry.as_deref() {
            self.narrative.append_chronicle(sequence, entry)?;
        }
        if let Some(curated) = narrative.curated_learnings.as_deref() {
            self.narrative.replace_learnings(curated)?;
        }
        if let Some(learning) = narrative.learning.as_deref() {
            self.narrative
                .append_learning(sequence, &bundle.action, learning, LearningTag::Discovery)?;
        }
        Ok(())
    }

    /// Restore the project dir, plus the narrative dir when `narrative` is set.
    fn restore(&self, narrative: bool) -> Result<()> {
        let mut paths = vec![self.layout.project_rel.as_str()];
        if narrative {
            paths.push(self.layout.narrative_rel.as_str());
        }
        self.vcs.discard_paths(&paths)
    }

    fn restore_after_fault(&self, narrative: bool) {
        if let Err(err) = self.restore(narrative) {
            warn!(err = %format!("{err:#}"), "best-effort rollback failed");
        }
    }

    /// Snapshot the discarded change for the next cycle's prompt. Best effort.
    fn save_failed_diff(&self) {
        let diff = match self.vcs.diff_paths(&[self.layout.project_rel.as_str()]) {
            Ok(diff) => diff,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "could not capture failed diff");
                return;
            }
        };
        if diff.trim().is_empty() {
            return;
        }
        let capped = cap_diff(&diff, self.failed_diff_limit);
        if let Err(err) = write_atomic(&self.layout.failed_diff_path, &capped) {
            warn!(err = %format!("{err:#}"), "could not save failed diff");
        }
    }

    fn clear_failed_diff(&self) {
        let path = &self.layout.failed_diff_path;
        if let Err(e) = fs::remove_file(path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %path.display(), err = %e, "could not remove stale failed diff");
        }
    }
}

fn cap_diff(diff: &str, limit: usize) -> String {
    if diff.len() <= limit {
        return diff.to_string();
    }
    let mut cut = limit;
    while !diff.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{TRUNCATION_NOTICE}", &diff[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_long_diffs_on_char_boundary() {
        assert_eq!(cap_diff("short", 3000), "short");
        let capped = cap_diff(&"é".repeat(10), 5);
        assert_eq!(capped, format!("éé{TRUNCATION_NOTICE}"));
    }
}
