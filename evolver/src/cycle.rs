//! One mutate, validate, commit-or-rollback cycle.
//!
//! Every cycle that gets past reading its history appends exactly one
//! [`CycleRecord`], whatever the outcome. Internal faults are recorded as
//! `internal` failures and then returned to the caller.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, instrument, warn};

use crate::core::baseline::BaselineSet;
use crate::core::governor::{Verdict, evaluate};
use crate::core::strategy::{CapabilitiesSnapshot, StrategyDecision, choose, focus_domains};
use crate::core::types::{ChangeBundle, CycleFailure, CycleRecord, FailureKind};
use crate::io::capabilities::scan_capabilities;
use crate::io::codebase::{focused_file_contents, summarize_codebase};
use crate::io::config::{EvolverConfig, Layout};
use crate::io::cycle_log::CycleLog;
use crate::io::git::{Git, VersionControl};
use crate::io::harness::{EngineHarness, RuntimeHarness};
use crate::io::intent::{CommandIntentChecker, IntentChecker};
use crate::io::narrative::{LearningTag, NarrativeStore};
use crate::io::notifier::{LogNotifier, Notifier};
use crate::io::prompt::{PromptBuilder, PromptInputs};
use crate::io::proposer::{CommandProposer, ProposalRequest, Proposer, propose_with_retry};
use crate::pipeline::ValidationPipeline;
use crate::transaction::{Transaction, TxOutcome};

/// Cycle records shown to the proposer.
const PROMPT_HISTORY: usize = 10;
/// Chronicle entries shown to the proposer.
const PROMPT_LORE: usize = 5;

/// Collaborators for one cycle.
pub struct CycleDeps<'a> {
    pub proposer: &'a dyn Proposer,
    pub harness: &'a dyn RuntimeHarness,
    pub intent: Option<&'a dyn IntentChecker>,
    pub vcs: &'a dyn VersionControl,
    pub notifier: &'a dyn Notifier,
}

/// Production collaborators built from config.
pub struct Collaborators {
    proposer: CommandProposer,
    harness: EngineHarness,
    intent: Option<CommandIntentChecker>,
    vcs: Git,
    notifier: LogNotifier,
}

impl Collaborators {
    pub fn from_config(root: &Path, cfg: &EvolverConfig) -> Self {
        let intent = cfg.validation.intent_check.then(|| {
            CommandIntentChecker::new(
                cfg.intent.command.clone(),
                root.to_path_buf(),
                Duration::from_secs(cfg.intent.timeout_secs),
            )
        });
        Self {
            proposer: CommandProposer::new(cfg.proposer.command.clone()),
            harness: EngineHarness::from_config(cfg),
            intent,
            vcs: Git::new(root),
            notifier: LogNotifier,
        }
    }

    pub fn deps(&self) -> CycleDeps<'_> {
        CycleDeps {
            proposer: &self.proposer,
            harness: &self.harness,
            intent: self
                .intent
                .as_ref()
                .map(|checker| checker as &dyn IntentChecker),
            vcs: &self.vcs,
            notifier: &self.notifier,
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub record: CycleRecord,
    pub decision: StrategyDecision,
}

impl CycleReport {
    pub fn committed(&self) -> bool {
        !self.record.is_failure()
    }
}

/// Run one cycle rooted at `root` with config `cfg`.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn run_cycle(root: &Path, cfg: &EvolverConfig, deps: &CycleDeps<'_>) -> Result<CycleReport> {
    let layout = cfg.layout(root);
    let log = CycleLog::from_layout(&layout, cfg.cycle.active_log_limit);
    let history = log.read_active().context("read cycle history")?;
    let sequence = log.next_sequence().context("next cycle sequence")?;

    let caps = scan_capabilities(&layout.project_dir);
    let decision = choose(&history, Some(&caps));
    info!(
        sequence,
        strategy = %decision.strategy,
        explanation = %decision.explanation,
        "cycle starting"
    );

    let ctx = CycleContext {
        cfg,
        layout: &layout,
        deps,
        narrative: NarrativeStore::from_layout(&layout, cfg.narrative.max_learnings),
        sequence,
    };
    let record = match ctx.run(&history, &decision, &caps) {
        Ok(record) => record,
        Err(err) => {
            error!(sequence, err = %format!("{err:#}"), "cycle fault");
            if let Err(rollback) = deps.vcs.discard_paths(&[layout.project_rel.as_str()]) {
                warn!(err = %format!("{rollback:#}"), "best-effort rollback failed");
            }
            let record = CycleRecord::failure(
                sequence,
                "cycle",
                "internal",
                FailureKind::Internal,
                format!("{err:#}"),
            );
            if let Err(log_err) = log.append(record) {
                warn!(err = %format!("{log_err:#}"), "could not record cycle fault");
            }
            return Err(err);
        }
    };

    log.append(record.clone()).context("append cycle record")?;
    if record.is_failure() {
        info!(sequence, error = ?record.error, "cycle failed");
    } else {
        info!(sequence, action = %record.action, target = %record.target, "cycle committed");
        if let Some(notes) = record.note.as_deref()
            && let Err(err) = deps.notifier.announce(sequence, notes)
        {
            warn!(err = %format!("{err:#}"), "announcement failed");
        }
    }
    Ok(CycleReport { record, decision })
}

struct CycleContext<'a> {
    cfg: &'a EvolverConfig,
    layout: &'a Layout,
    deps: &'a CycleDeps<'a>,
    narrative: NarrativeStore,
    sequence: u64,
}

impl CycleContext<'_> {
    fn run(
        &self,
        history: &[CycleRecord],
        decision: &StrategyDecision,
        caps: &CapabilitiesSnapshot,
    ) -> Result<CycleRecord> {
        let prompt = self.build_prompt(history, decision, caps)?;

        let request = ProposalRequest {
            workdir: self.layout.root.clone(),
            prompt,
            schema_path: self.layout.schema_path.clone(),
            output_path: self.layout.proposal_path.clone(),
            log_path: self.layout.state_dir.join("proposer.log"),
            timeout: Duration::from_secs(self.cfg.proposer.timeout_secs),
            output_limit_bytes: self.cfg.proposer.output_limit_bytes,
        };
        let bundle = match propose_with_retry(
            self.deps.proposer,
            &request,
            self.cfg.proposer.max_attempts,
            Duration::from_secs(self.cfg.proposer.retry_backoff_secs),
        ) {
            Ok(bundle) => bundle,
            Err(err) => {
                let failure = CycleFailure::Proposal(err.to_string());
                return Ok(self.failure_record("propose", "proposer", &failure));
            }
        };
        info!(
            action = %bundle.action,
            target = %bundle.target,
            files = bundle.files.len(),
            lines = bundle.total_lines(),
            "proposal received"
        );

        if let Err(failure) = self.gate(&bundle) {
            self.record_correction(&bundle);
            return Ok(self.failure_record(&bundle.action, &bundle.target, &failure));
        }

        let baseline = if self.cfg.validation.functional_test {
            self.deps.harness.baseline(&self.layout.project_dir)
        } else {
            BaselineSet::empty()
        };

        let pipeline =
            ValidationPipeline::new(&self.cfg.validation, self.deps.harness, self.deps.intent);
        let tx = Transaction::new(
            self.deps.vcs,
            self.layout,
            &self.narrative,
            self.cfg.narrative.failed_diff_limit_bytes,
        );
        match tx.execute(self.sequence, &bundle, &pipeline, &baseline)? {
            TxOutcome::Committed { .. } => Ok(CycleRecord::success(
                self.sequence,
                &bundle.action,
                &bundle.target,
                bundle.narrative.patch_notes.clone(),
            )),
            TxOutcome::RolledBack(failure) => {
                self.record_correction(&bundle);
                Ok(self.failure_record(&bundle.action, &bundle.target, &failure))
            }
        }
    }

    /// Checks that run before anything touches the workspace.
    fn gate(&self, bundle: &ChangeBundle) -> Result<(), CycleFailure> {
        if bundle.is_empty() {
            return Err(CycleFailure::EmptyBundle);
        }
        match evaluate(bundle, &self.cfg.complexity) {
            Verdict::Accept => Ok(()),
            Verdict::Reject(reason) => {
                warn!(reason = %reason, "complexity governor rejected bundle");
                Err(CycleFailure::Governance(reason))
            }
        }
    }

    fn failure_record(&self, action: &str, target: &str, failure: &CycleFailure) -> CycleRecord {
        CycleRecord::failure(
            self.sequence,
            action,
            target,
            failure.kind(),
            failure.to_string(),
        )
    }

    /// Keep the bundle's lesson even though its change was discarded.
    ///
    /// The entry stays uncommitted until the next successful cycle commits
    /// the narrative dir.
    fn record_correction(&self, bundle: &ChangeBundle) {
        let Some(learning) = bundle.narrative.learning.as_deref() else {
            return;
        };
        if let Err(err) = self.narrative.append_learning(
            self.sequence,
            &bundle.action,
            learning,
            LearningTag::Correction,
        ) {
            warn!(err = %format!("{err:#}"), "could not record correction learning");
        }
    }

    fn build_prompt(
        &self,
        history: &[CycleRecord],
        decision: &StrategyDecision,
        caps: &CapabilitiesSnapshot,
    ) -> Result<String> {
        let project_dir = &self.layout.project_dir;
        let last_failure = history.last().filter(|r| r.is_failure());
        let last_error = last_failure.and_then(|r| r.error.clone());
        let last_diff = if last_failure.is_some() && self.cfg.proposer.post_mortem_diff {
            read_if_exists(&self.layout.failed_diff_path)?
        } else {
            None
        };

        let learnings = self.narrative.read_learnings()?;
        let curate_every = self.cfg.narrative.curate_every;
        let curate = curate_every > 0
            && self.sequence % curate_every == 0
            && learnings.lines().any(|line| line.starts_with("- "));

        let inputs = PromptInputs {
            sequence: self.sequence,
            strategy: decision.strategy,
            explanation: decision.explanation.clone(),
            project: self.layout.project_rel.clone(),
            limits: self.cfg.complexity,
            capabilities: caps.summary(),
            history: history[history.len().saturating_sub(PROMPT_HISTORY)..].to_vec(),
            last_error,
            last_diff,
            codebase: summarize_codebase(project_dir),
            files: focused_file_contents(project_dir, &focus_domains(history, decision.strategy)),
            learnings,
            lore: self.narrative.recent_chronicle(PROMPT_LORE)?,
            curate,
        };
        if curate {
            info!("curation cycle; asking for condensed learnings");
        }
        let pack = PromptBuilder::new(self.cfg.proposer.context_budget_bytes).build(&inputs)?;
        info!(prompt_bytes = pack.len(), "prompt built");
        Ok(pack.render())
    }
}

fn read_if_exists(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    fs::read_to_string(path)
        .map(Some)
        .with_context(|| format!("read {}", path.display()))
}
