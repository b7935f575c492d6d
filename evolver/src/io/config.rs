//! Evolver configuration stored under `.evolver/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::governor::ComplexityLimits;

/// Config location relative to the repository root.
pub const CONFIG_RELATIVE_PATH: &str = ".evolver/config.toml";

/// Evolver configuration (TOML).
///
/// Edited by humans and re-read every cycle. Missing fields default to the
/// values below.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EvolverConfig {
    pub paths: PathsConfig,
    pub engine: EngineConfig,
    pub complexity: ComplexityLimits,
    pub validation: ValidationConfig,
    pub proposer: ProposerConfig,
    pub intent: IntentConfig,
    pub cycle: CycleConfig,
    pub narrative: NarrativeConfig,
}

/// Directory layout, relative to the repository root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    /// Project subtree the proposer is allowed to mutate.
    pub project: String,
    /// Narrative files committed alongside successful changes.
    pub narrative: String,
    /// Out-of-band state (cycle log, failed diffs). Never committed.
    pub state_dir: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            project: "game".to_string(),
            narrative: "lore".to_string(),
            state_dir: ".evolver".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine executable (looked up on `PATH` when not absolute).
    pub executable: String,
    pub baseline_timeout_secs: u64,
    pub test_timeout_secs: u64,
    pub smoke_timeout_secs: u64,
    /// Frames to run for the functional test.
    pub quit_after: u32,
    /// Frames to run for the functional test when the smoke test is enabled.
    pub extended_quit_after: u32,
    pub output_limit_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            executable: "godot".to_string(),
            baseline_timeout_secs: 10,
            test_timeout_secs: 10,
            smoke_timeout_secs: 15,
            quit_after: 2,
            extended_quit_after: 5,
            output_limit_bytes: 200_000,
        }
    }
}

/// Stage toggles for the validation pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ValidationConfig {
    pub pre_check: bool,
    /// Also check `path="res://..."` references in written scenes.
    pub scene_ref_check: bool,
    pub functional_test: bool,
    pub smoke_test: bool,
    pub intent_check: bool,
    /// Diagnostics rendered into failure reasons.
    pub max_errors_in_prompt: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            pre_check: true,
            scene_ref_check: true,
            functional_test: true,
            smoke_test: false,
            intent_check: false,
            max_errors_in_prompt: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProposerConfig {
    /// Command that turns a prompt (stdin) into a bundle file.
    ///
    /// `{schema}` and `{output}` are replaced with the schema and output paths.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub retry_backoff_secs: u64,
    pub output_limit_bytes: usize,
    /// Upper bound for the rendered prompt.
    pub context_budget_bytes: usize,
    /// Include the last failed diff when retrying.
    pub post_mortem_diff: bool,
}

impl Default for ProposerConfig {
    fn default() -> Self {
        Self {
            command: [
                "codex",
                "exec",
                "--skip-git-repo-check",
                "--output-schema",
                "{schema}",
                "--output-last-message",
                "{output}",
                "-",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            timeout_secs: 15 * 60,
            max_attempts: 3,
            retry_backoff_secs: 10,
            output_limit_bytes: 200_000,
            context_budget_bytes: 320_000,
            post_mortem_diff: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IntentConfig {
    /// Command that answers `PASS` or `FAIL: reason` for a bundle on stdin.
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CycleConfig {
    pub interval_secs: u64,
    /// Stop after this many cycles; run forever when unset.
    pub max_cycles: Option<u64>,
    /// Records kept in the active cycle log before archiving.
    pub active_log_limit: usize,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            max_cycles: None,
            active_log_limit: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NarrativeConfig {
    pub max_learnings: usize,
    /// Ask the proposer to curate learnings every N cycles (0 disables).
    pub curate_every: u64,
    pub failed_diff_limit_bytes: usize,
}

impl Default for NarrativeConfig {
    fn default() -> Self {
        Self {
            max_learnings: 50,
            curate_every: 10,
            failed_diff_limit_bytes: 3000,
        }
    }
}

impl EvolverConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("paths.project", &self.paths.project),
            ("paths.narrative", &self.paths.narrative),
            ("paths.state_dir", &self.paths.state_dir),
        ] {
            if value.trim().is_empty() {
                return Err(anyhow!("{name} must not be empty"));
            }
        }
        if self.engine.executable.trim().is_empty() {
            return Err(anyhow!("engine.executable must not be empty"));
        }
        for (name, value) in [
            ("engine.baseline_timeout_secs", self.engine.baseline_timeout_secs),
            ("engine.test_timeout_secs", self.engine.test_timeout_secs),
            ("engine.smoke_timeout_secs", self.engine.smoke_timeout_secs),
            ("proposer.timeout_secs", self.proposer.timeout_secs),
            ("intent.timeout_secs", self.intent.timeout_secs),
        ] {
            if value == 0 {
                return Err(anyhow!("{name} must be > 0"));
            }
        }
        if self.engine.quit_after == 0 || self.engine.extended_quit_after == 0 {
            return Err(anyhow!("engine quit_after values must be > 0"));
        }
        if self.engine.output_limit_bytes == 0 || self.proposer.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.complexity.max_files_touched == 0 || self.complexity.max_total_lines == 0 {
            return Err(anyhow!("complexity limits must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.complexity.max_new_file_ratio) {
            return Err(anyhow!("complexity.max_new_file_ratio must be within 0.0..=1.0"));
        }
        if self.proposer.command.is_empty() || self.proposer.command[0].trim().is_empty() {
            return Err(anyhow!("proposer.command must be a non-empty array"));
        }
        if self.proposer.max_attempts == 0 {
            return Err(anyhow!("proposer.max_attempts must be > 0"));
        }
        if self.proposer.context_budget_bytes == 0 {
            return Err(anyhow!("proposer.context_budget_bytes must be > 0"));
        }
        if self.validation.intent_check
            && self.intent.command.first().is_none_or(|c| c.trim().is_empty())
        {
            return Err(anyhow!(
                "intent.command must be set when validation.intent_check is enabled"
            ));
        }
        if self.cycle.active_log_limit == 0 {
            return Err(anyhow!("cycle.active_log_limit must be > 0"));
        }
        if self.narrative.max_learnings == 0 {
            return Err(anyhow!("narrative.max_learnings must be > 0"));
        }
        Ok(())
    }

    /// Frames the functional test runs, accounting for the smoke test toggle.
    pub fn functional_quit_after(&self) -> u32 {
        if self.validation.smoke_test {
            self.engine.extended_quit_after
        } else {
            self.engine.quit_after
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.cycle.interval_secs)
    }

    pub fn layout(&self, root: &Path) -> Layout {
        Layout::new(root, &self.paths)
    }
}

/// Absolute paths derived from the repository root and [`PathsConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub root: PathBuf,
    /// Project dir relative to `root`, as used in git pathspecs.
    pub project_rel: String,
    /// Narrative dir relative to `root`.
    pub narrative_rel: String,
    pub project_dir: PathBuf,
    pub narrative_dir: PathBuf,
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub active_log_path: PathBuf,
    pub archive_log_path: PathBuf,
    pub failed_diff_path: PathBuf,
    pub schema_path: PathBuf,
    pub proposal_path: PathBuf,
    pub chronicle_path: PathBuf,
    pub learnings_path: PathBuf,
}

impl Layout {
    pub fn new(root: &Path, paths: &PathsConfig) -> Self {
        let root = root.to_path_buf();
        let project_rel = trim_rel(&paths.project);
        let narrative_rel = trim_rel(&paths.narrative);
        let project_dir = root.join(&project_rel);
        let narrative_dir = root.join(&narrative_rel);
        let state_dir = root.join(&paths.state_dir);
        Self {
            config_path: root.join(CONFIG_RELATIVE_PATH),
            active_log_path: state_dir.join("cycles.json"),
            archive_log_path: state_dir.join("cycles.archive.jsonl"),
            failed_diff_path: state_dir.join("last_failed_diff.patch"),
            schema_path: state_dir.join("change_bundle.schema.json"),
            proposal_path: state_dir.join("proposal.json"),
            chronicle_path: narrative_dir.join("chronicle.md"),
            learnings_path: narrative_dir.join("learnings.md"),
            root,
            project_rel,
            narrative_rel,
            project_dir,
            narrative_dir,
            state_dir,
        }
    }
}

fn trim_rel(path: &str) -> String {
    path.trim().trim_start_matches("./").trim_end_matches('/').to_string()
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EvolverConfig::default()`.
pub fn load_config(path: &Path) -> Result<EvolverConfig> {
    if !path.exists() {
        let cfg = EvolverConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EvolverConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EvolverConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Write `contents` to `path` via a sibling temp file and rename.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents).with_context(|| format!("write temp {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
