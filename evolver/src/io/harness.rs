//! Runtime harness: runs the engine headless and reports structured outcomes.
//!
//! The [`RuntimeHarness`] trait decouples the validation pipeline from the
//! actual engine binary. Tests use scripted harnesses that return
//! predetermined outcomes without spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::core::baseline::BaselineSet;
use crate::core::diagnostics::{DiagnosticCategory, DiagnosticRecord, parse_output};
use crate::io::config::EvolverConfig;
use crate::io::process::{CommandOutput, is_not_found, run_command_with_timeout};

const SMOKE_SCRIPT: &str = include_str!("engine/smoke_test.gd");
/// Project-relative path of the injected smoke script. Bundles may not write it.
pub const SMOKE_SCRIPT_REL: &str = "scripts/_smoke_test.gd";
const SMOKE_SCRIPT_RES: &str = "res://scripts/_smoke_test.gd";
const SMOKE_OK: &str = "SMOKE_RESULT: OK";
const SMOKE_FAIL_PREFIX: &str = "SMOKE_FAIL:";

/// Result of one engine run. Process-level problems are outcomes, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HarnessOutcome {
    Pass {
        warnings: Vec<String>,
    },
    Fail {
        diagnostics: Vec<DiagnosticRecord>,
        /// Raw output, used when no diagnostic could be extracted.
        raw_output: String,
    },
    Timeout {
        secs: u64,
    },
    NotFound {
        program: String,
    },
}

impl HarnessOutcome {
    pub fn is_pass(&self) -> bool {
        matches!(self, HarnessOutcome::Pass { .. })
    }
}

/// Abstraction over the engine process.
pub trait RuntimeHarness {
    /// Diagnostics present before mutation. Any failure yields an empty set.
    fn baseline(&self, project_dir: &Path) -> BaselineSet;

    /// Run the project briefly; fails on non-zero exit or diagnostics not in `baseline`.
    fn functional_test(&self, project_dir: &Path, baseline: &BaselineSet)
    -> Result<HarnessOutcome>;

    /// Run the injected smoke script against the project.
    fn smoke_test(&self, project_dir: &Path) -> Result<HarnessOutcome>;
}

/// Harness that spawns the configured engine executable.
#[derive(Debug, Clone)]
pub struct EngineHarness {
    pub executable: String,
    pub baseline_timeout: Duration,
    pub test_timeout: Duration,
    pub smoke_timeout: Duration,
    pub quit_after: u32,
    pub output_limit_bytes: usize,
}

impl EngineHarness {
    pub fn from_config(cfg: &EvolverConfig) -> Self {
        Self {
            executable: cfg.engine.executable.clone(),
            baseline_timeout: Duration::from_secs(cfg.engine.baseline_timeout_secs),
            test_timeout: Duration::from_secs(cfg.engine.test_timeout_secs),
            smoke_timeout: Duration::from_secs(cfg.engine.smoke_timeout_secs),
            quit_after: cfg.functional_quit_after(),
            output_limit_bytes: cfg.engine.output_limit_bytes,
        }
    }

    fn command(&self, project_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.executable);
        cmd.arg("--path").arg(project_dir).arg("--headless");
        cmd
    }

    fn quit_after_command(&self, project_dir: &Path, frames: u32) -> Command {
        let mut cmd = self.command(project_dir);
        cmd.arg("--quit-after").arg(frames.to_string());
        cmd
    }

    /// Run `cmd`, folding spawn-not-found and timeouts into outcomes.
    fn run(&self, cmd: Command, timeout: Duration) -> Result<RunResult> {
        match run_command_with_timeout(cmd, None, timeout, self.output_limit_bytes) {
            Ok(output) if output.timed_out => Ok(RunResult::Timeout(timeout_secs(timeout))),
            Ok(output) => Ok(RunResult::Finished(output)),
            Err(err) if is_not_found(&err) => {
                warn!(program = %self.executable, "engine executable not found");
                Ok(RunResult::NotFound)
            }
            Err(err) => Err(err).context("run engine"),
        }
    }

    fn not_found(&self) -> HarnessOutcome {
        HarnessOutcome::NotFound {
            program: self.executable.clone(),
        }
    }
}

enum RunResult {
    Finished(CommandOutput),
    Timeout(u64),
    NotFound,
}

fn timeout_secs(timeout: Duration) -> u64 {
    timeout.as_secs().max(1)
}

impl RuntimeHarness for EngineHarness {
    #[instrument(skip_all, fields(project = %project_dir.display()))]
    fn baseline(&self, project_dir: &Path) -> BaselineSet {
        let cmd = self.quit_after_command(project_dir, 1);
        match self.run(cmd, self.baseline_timeout) {
            Ok(RunResult::Finished(output)) => {
                let records = parse_output(&output.combined_text());
                debug!(count = records.len(), "captured baseline diagnostics");
                BaselineSet::from_records(&records)
            }
            Ok(_) => {
                debug!("baseline run did not finish; using empty baseline");
                BaselineSet::empty()
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "baseline run failed; using empty baseline");
                BaselineSet::empty()
            }
        }
    }

    #[instrument(skip_all, fields(project = %project_dir.display(), quit_after = self.quit_after))]
    fn functional_test(
        &self,
        project_dir: &Path,
        baseline: &BaselineSet,
    ) -> Result<HarnessOutcome> {
        let cmd = self.quit_after_command(project_dir, self.quit_after);
        let output = match self.run(cmd, self.test_timeout)? {
            RunResult::Finished(output) => output,
            RunResult::Timeout(secs) => return Ok(HarnessOutcome::Timeout { secs }),
            RunResult::NotFound => return Ok(self.not_found()),
        };

        let text = output.combined_text();
        let diagnostics = baseline.new_failures(parse_output(&text));
        let warnings = collect_warnings(&text);
        if !warnings.is_empty() {
            debug!(count = warnings.len(), "engine reported warnings");
        }

        if output.status.success() && diagnostics.is_empty() {
            return Ok(HarnessOutcome::Pass { warnings });
        }
        let exit = output
            .status
            .code()
            .map_or_else(|| "signal".to_string(), |code| code.to_string());
        Ok(HarnessOutcome::Fail {
            diagnostics,
            raw_output: format!("Exit code {exit}\n{text}"),
        })
    }

    #[instrument(skip_all, fields(project = %project_dir.display()))]
    fn smoke_test(&self, project_dir: &Path) -> Result<HarnessOutcome> {
        let _guard = SmokeScriptGuard::install(project_dir)?;

        let mut cmd = self.command(project_dir);
        cmd.arg("--script").arg(SMOKE_SCRIPT_RES);
        let output = match self.run(cmd, self.smoke_timeout)? {
            RunResult::Finished(output) => output,
            RunResult::Timeout(secs) => return Ok(HarnessOutcome::Timeout { secs }),
            RunResult::NotFound => return Ok(self.not_found()),
        };

        let text = output.combined_text();
        if text.contains(SMOKE_OK) {
            return Ok(HarnessOutcome::Pass {
                warnings: collect_warnings(&text),
            });
        }
        Ok(HarnessOutcome::Fail {
            diagnostics: smoke_failures(&text),
            raw_output: text,
        })
    }
}

fn collect_warnings(text: &str) -> Vec<String> {
    text.lines()
        .filter(|line| line.to_ascii_uppercase().contains("WARNING"))
        .map(|line| line.trim().to_string())
        .collect()
}

fn smoke_failures(text: &str) -> Vec<DiagnosticRecord> {
    text.lines()
        .filter_map(|line| line.strip_prefix(SMOKE_FAIL_PREFIX))
        .map(|message| {
            DiagnosticRecord::new(DiagnosticCategory::SmokeTest, "smoke_test", 0, message.trim())
        })
        .collect()
}

/// Smoke script installed into the project for the duration of one run.
///
/// Dropping the guard removes the script, and the `scripts/` dir when the
/// guard created it.
struct SmokeScriptGuard {
    script_path: PathBuf,
    created_dir: Option<PathBuf>,
}

impl SmokeScriptGuard {
    fn install(project_dir: &Path) -> Result<Self> {
        let scripts_dir = project_dir.join("scripts");
        let created_dir = if scripts_dir.is_dir() {
            None
        } else {
            fs::create_dir_all(&scripts_dir)
                .with_context(|| format!("create {}", scripts_dir.display()))?;
            Some(scripts_dir.clone())
        };
        let guard = Self {
            script_path: project_dir.join(SMOKE_SCRIPT_REL),
            created_dir,
        };
        fs::write(&guard.script_path, SMOKE_SCRIPT)
            .with_context(|| format!("write smoke script {}", guard.script_path.display()))?;
        Ok(guard)
    }
}

impl Drop for SmokeScriptGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.script_path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.script_path.display(), err = %e, "failed to remove smoke script");
        }
        if let Some(dir) = &self.created_dir {
            // Only removes the dir when nothing else was written into it.
            let _ = fs::remove_dir(dir);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::write_fake_engine;

    fn harness(exe: &Path) -> EngineHarness {
        EngineHarness {
            executable: exe.display().to_string(),
            baseline_timeout: Duration::from_secs(5),
            test_timeout: Duration::from_secs(5),
            smoke_timeout: Duration::from_secs(5),
            quit_after: 2,
            output_limit_bytes: 64 * 1024,
        }
    }

    #[test]
    fn functional_pass_collects_warnings() {
        let temp = tempfile::tempdir().expect("tempdir");
        let exe = write_fake_engine(temp.path(), "echo 'WARNING: unused variable'\nexit 0\n");
        let outcome = harness(&exe)
            .functional_test(temp.path(), &BaselineSet::empty())
            .expect("run");
        assert_eq!(
            outcome,
            HarnessOutcome::Pass {
                warnings: vec!["WARNING: unused variable".to_string()]
            }
        );
    }

    #[test]
    fn functional_fails_on_new_diagnostics() {
        let temp = tempfile::tempdir().expect("tempdir");
        let exe = write_fake_engine(
            temp.path(),
            "echo 'res://scripts/a.gd:4 - Parse Error: Expected end of statement' >&2\nexit 0\n",
        );
        let outcome = harness(&exe)
            .functional_test(temp.path(), &BaselineSet::empty())
            .expect("run");
        let HarnessOutcome::Fail { diagnostics, .. } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].file, "res://scripts/a.gd");
    }

    #[test]
    fn baseline_diagnostics_do_not_fail_the_test() {
        let temp = tempfile::tempdir().expect("tempdir");
        let exe = write_fake_engine(
            temp.path(),
            "echo 'res://scripts/old.gd:9 - Parse Error: legacy'\nexit 0\n",
        );
        let h = harness(&exe);
        let baseline = h.baseline(temp.path());
        assert_eq!(baseline.len(), 1);
        let outcome = h.functional_test(temp.path(), &baseline).expect("run");
        assert!(outcome.is_pass());
    }

    #[test]
    fn non_zero_exit_without_diagnostics_fails_with_raw_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let exe = write_fake_engine(temp.path(), "echo crashed\nexit 3\n");
        let outcome = harness(&exe)
            .functional_test(temp.path(), &BaselineSet::empty())
            .expect("run");
        let HarnessOutcome::Fail {
            diagnostics,
            raw_output,
        } = outcome
        else {
            panic!("expected failure");
        };
        assert!(diagnostics.is_empty());
        assert!(raw_output.starts_with("Exit code 3\ncrashed"));
    }

    #[test]
    fn slow_engine_times_out() {
        let temp = tempfile::tempdir().expect("tempdir");
        let exe = write_fake_engine(temp.path(), "sleep 5\n");
        let mut h = harness(&exe);
        h.test_timeout = Duration::from_millis(300);
        let outcome = h
            .functional_test(temp.path(), &BaselineSet::empty())
            .expect("run");
        assert_eq!(outcome, HarnessOutcome::Timeout { secs: 1 });
    }

    #[test]
    fn missing_engine_is_reported_not_raised() {
        let temp = tempfile::tempdir().expect("tempdir");
        let h = harness(&temp.path().join("no-such-engine"));
        let outcome = h.functional_test(temp.path(), &BaselineSet::empty()).expect("run");
        assert!(matches!(outcome, HarnessOutcome::NotFound { .. }));
        assert!(h.baseline(temp.path()).is_empty());
    }

    #[test]
    fn smoke_script_is_removed_after_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        let project = temp.path().join("game");
        fs::create_dir_all(&project).expect("project dir");
        let exe = write_fake_engine(
            temp.path(),
            "if [ -f \"$2/scripts/_smoke_test.gd\" ]; then echo 'SMOKE_RESULT: OK'; fi\n",
        );
        let outcome = harness(&exe).smoke_test(&project).expect("run");
        assert!(outcome.is_pass());
        assert!(!project.join("scripts/_smoke_test.gd").exists());
        assert!(!project.join("scripts").exists());
    }

    #[test]
    fn smoke_failures_become_records() {
        let temp = tempfile::tempdir().expect("tempdir");
        let project = temp.path().join("game");
        fs::create_dir_all(project.join("scripts")).expect("scripts dir");
        let exe = write_fake_engine(
            temp.path(),
            "echo 'SMOKE_FAIL: Autoload not found: Events'\necho 'SMOKE_RESULT: FAIL'\n",
        );
        let outcome = harness(&exe).smoke_test(&project).expect("run");
        let HarnessOutcome::Fail { diagnostics, .. } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(diagnostics[0].category, DiagnosticCategory::SmokeTest);
        assert_eq!(diagnostics[0].message, "Autoload not found: Events");
        assert!(project.join("scripts").is_dir());
        assert!(!project.join("scripts/_smoke_test.gd").exists());
    }
}
