//! Validation pipeline: ordered, short-circuiting stages over a written bundle.
//!
//! Stages run in [`Stage::ORDER`]; each is toggled by [`ValidationConfig`].
//! The first failing stage ends the run with its [`CycleFailure`].

use std::path::Path;

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::core::baseline::BaselineSet;
use crate::core::diagnostics::summarize;
use crate::core::types::{ChangeBundle, CycleFailure, Stage};
use crate::io::config::ValidationConfig;
use crate::io::harness::{HarnessOutcome, RuntimeHarness};
use crate::io::intent::{IntentChecker, IntentVerdict};
use crate::io::static_check::check_written_files;

/// Result of running every enabled stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Passed { stages_run: Vec<Stage> },
    Failed(CycleFailure),
}

impl PipelineOutcome {
    pub fn is_passed(&self) -> bool {
        matches!(self, PipelineOutcome::Passed { .. })
    }
}

/// Inputs that stay fixed across the stages of one run.
pub struct PipelineInput<'a> {
    pub project_dir: &'a Path,
    pub bundle: &'a ChangeBundle,
    /// Paths written this cycle, relative to the project dir.
    pub written: &'a [String],
    pub baseline: &'a BaselineSet,
}

pub struct ValidationPipeline<'a> {
    settings: &'a ValidationConfig,
    harness: &'a dyn RuntimeHarness,
    intent: Option<&'a dyn IntentChecker>,
}

impl<'a> ValidationPipeline<'a> {
    pub fn new(
        settings: &'a ValidationConfig,
        harness: &'a dyn RuntimeHarness,
        intent: Option<&'a dyn IntentChecker>,
    ) -> Self {
        Self {
            settings,
            harness,
            intent,
        }
    }

    fn enabled(&self, stage: Stage) -> bool {
        match stage {
            Stage::PreCheck => self.settings.pre_check,
            Stage::Functional => self.settings.functional_test,
            Stage::Smoke => self.settings.smoke_test,
            Stage::Intent => self.settings.intent_check,
        }
    }

    /// Run enabled stages in order, stopping at the first failure.
    ///
    /// `Err` is reserved for faults of the pipeline itself (e.g. the engine
    /// process could not be waited on); a failing change is `Ok(Failed)`.
    #[instrument(skip_all, fields(files = input.written.len()))]
    pub fn run(&self, input: &PipelineInput<'_>) -> Result<PipelineOutcome> {
        let mut stages_run = Vec::new();
        for stage in Stage::ORDER {
            if !self.enabled(stage) {
                debug!(%stage, "stage disabled");
                continue;
            }
            if let Err(failure) = self.run_stage(stage, input)? {
                warn!(%stage, reason = %failure, "validation stage failed");
                return Ok(PipelineOutcome::Failed(failure));
            }
            info!(%stage, "validation stage passed");
            stages_run.push(stage);
        }
        Ok(PipelineOutcome::Passed { stages_run })
    }

    fn run_stage(&self, stage: Stage, input: &PipelineInput<'_>) -> Result<Result<(), CycleFailure>> {
        match stage {
            Stage::PreCheck => Ok(self.pre_check(input)),
            Stage::Functional => {
                let outcome = self
                    .harness
                    .functional_test(input.project_dir, input.baseline)?;
                Ok(self.judge(stage, outcome))
            }
            Stage::Smoke => {
                let outcome = self.harness.smoke_test(input.project_dir)?;
                Ok(self.judge(stage, outcome))
            }
            Stage::Intent => Ok(self.intent_check(input)),
        }
    }

    fn pre_check(&self, input: &PipelineInput<'_>) -> Result<(), CycleFailure> {
        let records = check_written_files(
            input.project_dir,
            input.written,
            self.settings.scene_ref_check,
        );
        if records.is_empty() {
            return Ok(());
        }
        Err(CycleFailure::Diagnostic {
            stage: Stage::PreCheck,
            summary: summarize(&records, self.settings.max_errors_in_prompt, ""),
        })
    }

    fn judge(&self, stage: Stage, outcome: HarnessOutcome) -> Result<(), CycleFailure> {
        match outcome {
            HarnessOutcome::Pass { warnings } => {
                for warning in &warnings {
                    debug!(%stage, warning = %warning, "engine warning");
                }
                Ok(())
            }
            HarnessOutcome::Fail {
                diagnostics,
                raw_output,
            } => Err(CycleFailure::Diagnostic {
                stage,
                summary: summarize(&diagnostics, self.settings.max_errors_in_prompt, &raw_output),
            }),
            HarnessOutcome::Timeout { secs } => Err(CycleFailure::Timeout { stage, secs }),
            HarnessOutcome::NotFound { program } => {
                Err(CycleFailure::ProcessNotFound { stage, program })
            }
        }
    }

    fn intent_check(&self, input: &PipelineInput<'_>) -> Result<(), CycleFailure> {
        let Some(checker) = self.intent else {
            warn!("intent check enabled without a checker; passing");
            return Ok(());
        };
        match checker.check(input.bundle) {
            Ok(IntentVerdict::Pass(note)) => {
                debug!(note = ?note, "intent check passed");
                Ok(())
            }
            Ok(IntentVerdict::Fail(reason)) => Err(CycleFailure::Intent(reason)),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "intent check unavailable; passing");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::diagnostics::{DiagnosticCategory, DiagnosticRecord};
    use crate::core::types::{EditMode, FileEdit, Narrative};
    use crate::test_support::{ScriptedHarness, ScriptedIntent};
    use std::fs;

    fn bundle() -> ChangeBundle {
        ChangeBundle {
            action: "add".to_string(),
            target: "bat".to_string(),
            files: vec![FileEdit {
                path: "scripts/bat.gd".to_string(),
                mode: EditMode::Create,
                content: "extends Node\n".to_string(),
            }],
            narrative: Narrative::default(),
        }
    }

    fn all_stages() -> ValidationConfig {
        ValidationConfig {
            pre_check: true,
            scene_ref_check: true,
            functional_test: true,
            smoke_test: true,
            intent_check: true,
            max_errors_in_prompt: 5,
        }
    }

    fn project_with(script: &str) -> tempfile::TempDir {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("project.godot"), "").expect("project");
        fs::create_dir_all(temp.path().join("scripts")).expect("scripts");
        fs::write(temp.path().join("scripts/bat.gd"), script).expect("script");
        temp
    }

    fn run(
        settings: &ValidationConfig,
        harness: &ScriptedHarness,
        intent: &ScriptedIntent,
        project: &Path,
    ) -> PipelineOutcome {
        let b = bundle();
        let written = vec!["scripts/bat.gd".to_string()];
        let baseline = BaselineSet::empty();
        ValidationPipeline::new(settings, harness, Some(intent))
            .run(&PipelineInput {
                project_dir: project,
                bundle: &b,
                written: &written,
                baseline: &baseline,
            })
            .expect("pipeline")
    }

    #[test]
    fn all_stages_pass_in_order() {
        let project = project_with("extends Node\n");
        let harness = ScriptedHarness::passing();
        let intent = ScriptedIntent::new(vec![Ok(IntentVerdict::Pass(None))]);
        let outcome = run(&all_stages(), &harness, &intent, project.path());
        assert_eq!(
            outcome,
            PipelineOutcome::Passed {
                stages_run: Stage::ORDER.to_vec()
            }
        );
    }

    #[test]
    fn pre_check_failure_skips_the_engine() {
        let project = project_with("func f():\n  if (a == b:\n    pass\n");
        let harness = ScriptedHarness::passing();
        let intent = ScriptedIntent::new(Vec::new());
        let outcome = run(&all_stages(), &harness, &intent, project.path());
        let PipelineOutcome::Failed(CycleFailure::Diagnostic { stage, summary }) = outcome else {
            panic!("expected pre-check failure, got {outcome:?}");
        };
        assert_eq!(stage, Stage::PreCheck);
        assert!(summary.contains("Unclosed '('"), "{summary}");
        assert_eq!(harness.functional_calls(), 0);
    }

    #[test]
    fn functional_failure_short_circuits_smoke_and_intent() {
        let project = project_with("extends Node\n");
        let harness = ScriptedHarness::new(vec![HarnessOutcome::Fail {
            diagnostics: vec![DiagnosticRecord::new(
                DiagnosticCategory::ParseError,
                "res://scripts/bat.gd",
                3,
                "Expected end of statement",
            )],
            raw_output: String::new(),
        }]);
        let intent = ScriptedIntent::new(Vec::new());
        let outcome = run(&all_stages(), &harness, &intent, project.path());
        let PipelineOutcome::Failed(failure) = outcome else {
            panic!("expected failure");
        };
        assert_eq!(failure.kind(), crate::core::types::FailureKind::Functional);
        assert!(failure.to_string().starts_with("Functional test: [parse_error]"));
        assert_eq!(harness.smoke_calls(), 0);
        assert_eq!(intent.calls(), 0);
    }

    #[test]
    fn engine_timeout_and_missing_engine_map_to_typed_failures() {
        let project = project_with("extends Node\n");
        let intent = ScriptedIntent::new(Vec::new());
        let harness = ScriptedHarness::new(vec![HarnessOutcome::Timeout { secs: 10 }]);
        assert_eq!(
            run(&all_stages(), &harness, &intent, project.path()),
            PipelineOutcome::Failed(CycleFailure::Timeout {
                stage: Stage::Functional,
                secs: 10
            })
        );

        let harness = ScriptedHarness::new(vec![HarnessOutcome::NotFound {
            program: "godot".to_string(),
        }]);
        assert_eq!(
            run(&all_stages(), &harness, &intent, project.path()),
            PipelineOutcome::Failed(CycleFailure::ProcessNotFound {
                stage: Stage::Functional,
                program: "godot".to_string()
            })
        );
    }

    #[test]
    fn intent_fails_closed_on_verdict_and_open_on_error() {
        let project = project_with("extends Node\n");
        let harness = ScriptedHarness::passing();
        let intent = ScriptedIntent::new(vec![Ok(IntentVerdict::Fail("stub only".to_string()))]);
        assert_eq!(
            run(&all_stages(), &harness, &intent, project.path()),
            PipelineOutcome::Failed(CycleFailure::Intent("stub only".to_string()))
        );

        let intent = ScriptedIntent::new(vec![Err("judge offline".to_string())]);
        assert!(run(&all_stages(), &harness, &intent, project.path()).is_passed());
    }

    #[test]
    fn disabled_stages_are_skipped() {
        let project = project_with("func f(:\n");
        let settings = ValidationConfig {
            pre_check: false,
            functional_test: false,
            smoke_test: false,
            intent_check: false,
            ..all_stages()
        };
        let harness = ScriptedHarness::passing();
        let intent = ScriptedIntent::new(Vec::new());
        assert_eq!(
            run(&settings, &harness, &intent, project.path()),
            PipelineOutcome::Passed {
                stages_run: Vec::new()
            }
        );
    }
}
