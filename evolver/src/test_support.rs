//! Test-only helpers: a scratch git repository and scripted collaborators.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;
use walkdir::WalkDir;

use crate::core::baseline::BaselineSet;
use crate::core::types::{ChangeBundle, EditMode, FileEdit, Narrative};
use crate::io::config::{EvolverConfig, Layout, load_config, write_config};
use crate::io::harness::{HarnessOutcome, RuntimeHarness};
use crate::io::init::{InitOptions, init_workspace};
use crate::io::intent::{IntentChecker, IntentVerdict};
use crate::io::notifier::Notifier;
use crate::io::proposer::{ProposalError, ProposalRequest, Proposer};

/// Initialized evolver workspace inside a fresh git repository.
///
/// The initial commit holds the config, the narrative files and an empty
/// project.
pub struct TestRepo {
    dir: TempDir,
    layout: Layout,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create tempdir")?;
        let root = dir.path();
        git(root, &["init", "--quiet"])?;
        git(root, &["config", "user.email", "test@example.com"])?;
        git(root, &["config", "user.name", "test"])?;
        git(root, &["config", "commit.gpgsign", "false"])?;
        let layout = init_workspace(root, &InitOptions { force: false })?;
        git(root, &["add", "-A"])?;
        git(root, &["commit", "--quiet", "-m", "init"])?;
        Ok(Self { dir, layout })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn config(&self) -> Result<EvolverConfig> {
        load_config(&self.layout.config_path)
    }

    /// Overwrite the config and commit it.
    pub fn write_config(&self, cfg: &EvolverConfig) -> Result<()> {
        write_config(&self.layout.config_path, cfg)?;
        self.commit_all("update config")
    }

    /// Write `contents` at `rel` (relative to the repo root) and commit it.
    pub fn commit_file(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, contents)?;
        self.commit_all(&format!("add {rel}"))
    }

    pub fn commit_all(&self, message: &str) -> Result<()> {
        git(self.path(), &["add", "-A"])?;
        git(self.path(), &["commit", "--quiet", "--allow-empty", "-m", message])
    }

    pub fn head(&self) -> Result<String> {
        Ok(git_output(self.path(), &["rev-parse", "HEAD"])?.trim().to_string())
    }

    pub fn commit_count(&self) -> Result<usize> {
        let out = git_output(self.path(), &["rev-list", "--count", "HEAD"])?;
        out.trim()
            .parse()
            .with_context(|| format!("parse commit count {out:?}"))
    }

    /// `git status --porcelain` for `rel`.
    pub fn status(&self, rel: &str) -> Result<String> {
        git_output(self.path(), &["status", "--porcelain", "--", rel])
    }
}

fn git(root: &Path, args: &[&str]) -> Result<()> {
    git_output(root, args).map(|_| ())
}

fn git_output(root: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(root)
        .output()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !output.status.success() {
        return Err(anyhow!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Every file under `dir` with its contents, keyed by relative path.
pub fn snapshot(dir: &Path) -> BTreeMap<String, String> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let rel = entry.path().strip_prefix(dir).ok()?.to_string_lossy().replace('\\', "/");
            let contents = fs::read_to_string(entry.path()).unwrap_or_default();
            Some((rel, contents))
        })
        .collect()
}

/// Write an executable `#!/bin/sh` script.
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}")).expect("write script");
    let mut perms = fs::metadata(&path).expect("script metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("chmod script");
    path
}

/// Fake engine executable. It is invoked as `--path <project> --headless ...`.
#[cfg(unix)]
pub fn write_fake_engine(dir: &Path, body: &str) -> PathBuf {
    write_script(dir, "fake-engine.sh", body)
}

/// Single-file bundle creating `path` with `content`.
pub fn bundle(action: &str, target: &str, path: &str, content: &str) -> ChangeBundle {
    ChangeBundle {
        action: action.to_string(),
        target: target.to_string(),
        files: vec![FileEdit {
            path: path.to_string(),
            mode: EditMode::Create,
            content: content.to_string(),
        }],
        narrative: Narrative::default(),
    }
}

/// Proposer that replays queued results and records the prompts it saw.
///
/// An exhausted queue answers with an invalid-proposal error.
#[derive(Default)]
pub struct ScriptedProposer {
    queue: RefCell<VecDeque<Result<ChangeBundle, ProposalError>>>,
    prompts: RefCell<Vec<String>>,
}

impl ScriptedProposer {
    pub fn new(results: Vec<Result<ChangeBundle, ProposalError>>) -> Self {
        Self {
            queue: RefCell::new(results.into()),
            prompts: RefCell::new(Vec::new()),
        }
    }

    pub fn returning(bundle: ChangeBundle) -> Self {
        Self::new(vec![Ok(bundle)])
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }
}

impl Proposer for ScriptedProposer {
    fn propose(&self, request: &ProposalRequest) -> Result<ChangeBundle, ProposalError> {
        self.prompts.borrow_mut().push(request.prompt.clone());
        self.queue
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Err(ProposalError::Invalid("no scripted proposal".to_string())))
    }
}

/// Harness that replays queued outcomes. Empty queues pass.
#[derive(Default)]
pub struct ScriptedHarness {
    baseline: BaselineSet,
    functional: RefCell<VecDeque<HarnessOutcome>>,
    smoke: RefCell<VecDeque<HarnessOutcome>>,
    functional_calls: Cell<usize>,
    smoke_calls: Cell<usize>,
}

impl ScriptedHarness {
    pub fn passing() -> Self {
        Self::default()
    }

    pub fn new(functional: Vec<HarnessOutcome>) -> Self {
        Self {
            functional: RefCell::new(functional.into()),
            ..Self::default()
        }
    }

    pub fn with_smoke(mut self, smoke: Vec<HarnessOutcome>) -> Self {
        self.smoke = RefCell::new(smoke.into());
        self
    }

    pub fn with_baseline(mut self, baseline: BaselineSet) -> Self {
        self.baseline = baseline;
        self
    }

    pub fn functional_calls(&self) -> usize {
        self.functional_calls.get()
    }

    pub fn smoke_calls(&self) -> usize {
        self.smoke_calls.get()
    }
}

fn next_outcome(queue: &RefCell<VecDeque<HarnessOutcome>>) -> HarnessOutcome {
    queue.borrow_mut().pop_front().unwrap_or(HarnessOutcome::Pass {
        warnings: Vec::new(),
    })
}

impl RuntimeHarness for ScriptedHarness {
    fn baseline(&self, _project_dir: &Path) -> BaselineSet {
        self.baseline.clone()
    }

    fn functional_test(
        &self,
        _project_dir: &Path,
        _baseline: &BaselineSet,
    ) -> Result<HarnessOutcome> {
        self.functional_calls.set(self.functional_calls.get() + 1);
        Ok(next_outcome(&self.functional))
    }

    fn smoke_test(&self, _project_dir: &Path) -> Result<HarnessOutcome> {
        self.smoke_calls.set(self.smoke_calls.get() + 1);
        Ok(next_outcome(&self.smoke))
    }
}

/// Intent checker that replays queued verdicts; `Err` entries become errors.
/// An empty queue passes.
pub struct ScriptedIntent {
    queue: RefCell<VecDeque<Result<IntentVerdict, String>>>,
    calls: Cell<usize>,
}

impl ScriptedIntent {
    pub fn new(verdicts: Vec<Result<IntentVerdict, String>>) -> Self {
        Self {
            queue: RefCell::new(verdicts.into()),
            calls: Cell::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl IntentChecker for ScriptedIntent {
    fn check(&self, _bundle: &ChangeBundle) -> Result<IntentVerdict> {
        self.calls.set(self.calls.get() + 1);
        match self.queue.borrow_mut().pop_front() {
            Some(Ok(verdict)) => Ok(verdict),
            Some(Err(err)) => Err(anyhow!(err)),
            None => Ok(IntentVerdict::Pass(None)),
        }
    }
}

/// Notifier that keeps every announcement.
#[derive(Default)]
pub struct RecordingNotifier {
    announced: RefCell<Vec<(u64, String)>>,
}

impl RecordingNotifier {
    pub fn announced(&self) -> Vec<(u64, String)> {
        self.announced.borrow().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn announce(&self, sequence: u64, notes: &str) -> Result<()> {
        self.announced
            .borrow_mut()
            .push((sequence, notes.to_string()));
        Ok(())
    }
}
