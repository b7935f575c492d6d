//! Change proposer abstraction.
//!
//! The [`Proposer`] trait decouples the cycle from the generative backend.
//! [`CommandProposer`] spawns a configured command (by default `codex exec`),
//! feeds it the prompt on stdin and reads the bundle it writes. Tests use
//! scripted proposers that return predetermined bundles.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use jsonschema::{Draft, Validator};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::types::ChangeBundle;
use crate::io::config::write_atomic;
use crate::io::process::{CommandOutput, is_not_found, run_command_with_timeout};

pub const CHANGE_BUNDLE_SCHEMA: &str = include_str!("../../schemas/change_bundle.schema.json");

static BUNDLE_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(CHANGE_BUNDLE_SCHEMA).expect("bundle schema should be valid JSON");
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .expect("bundle schema should compile")
});

/// Why a proposal produced no usable bundle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProposalError {
    /// The backend failed in a way a later attempt may not (timeout, crash, no output).
    #[error("{0}")]
    Transient(String),
    /// The backend answered, but the answer is unusable.
    #[error("{0}")]
    Invalid(String),
}

impl ProposalError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProposalError::Transient(_))
    }
}

/// Parameters for one proposer invocation.
#[derive(Debug, Clone)]
pub struct ProposalRequest {
    /// Working directory for the proposer process.
    pub workdir: PathBuf,
    pub prompt: String,
    /// Where the bundle schema is written for the proposer to read.
    pub schema_path: PathBuf,
    /// Where the proposer must write its bundle JSON.
    pub output_path: PathBuf,
    /// Stdout/stderr log of the last invocation.
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

pub trait Proposer {
    fn propose(&self, request: &ProposalRequest) -> Result<ChangeBundle, ProposalError>;
}

/// Proposer that spawns a configured command.
///
/// `{schema}` and `{output}` in the arguments are replaced with the request's
/// schema and output paths.
#[derive(Debug, Clone)]
pub struct CommandProposer {
    command: Vec<String>,
}

impl CommandProposer {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    fn build_command(&self, request: &ProposalRequest) -> Result<Command, ProposalError> {
        let schema = request.schema_path.display().to_string();
        let output = request.output_path.display().to_string();
        let mut args = self
            .command
            .iter()
            .map(|arg| arg.replace("{schema}", &schema).replace("{output}", &output));
        let program = args
            .next()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| ProposalError::Invalid("proposer command is empty".to_string()))?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&request.workdir);
        Ok(cmd)
    }

    fn prepare(&self, request: &ProposalRequest) -> Result<()> {
        write_atomic(&request.schema_path, CHANGE_BUNDLE_SCHEMA)?;
        if request.output_path.exists() {
            fs::remove_file(&request.output_path).with_context(|| {
                format!("remove stale proposal {}", request.output_path.display())
            })?;
        }
        Ok(())
    }
}

impl Proposer for CommandProposer {
    #[instrument(skip_all, fields(program = ?self.command.first(), timeout_secs = request.timeout.as_secs()))]
    fn propose(&self, request: &ProposalRequest) -> Result<ChangeBundle, ProposalError> {
        self.prepare(request)
            .map_err(|err| ProposalError::Transient(format!("{err:#}")))?;
        let cmd = self.build_command(request)?;

        info!(prompt_bytes = request.prompt.len(), "invoking proposer");
        let output = match run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
        ) {
            Ok(output) => output,
            Err(err) if is_not_found(&err) => {
                return Err(ProposalError::Invalid(format!(
                    "proposer command not found: {}",
                    self.command.first().map(String::as_str).unwrap_or_default()
                )));
            }
            Err(err) => return Err(ProposalError::Transient(format!("{err:#}"))),
        };

        if let Err(err) = write_proposer_log(&request.log_path, &output, request.output_limit_bytes)
        {
            warn!(err = %format!("{err:#}"), "failed to write proposer log");
        }

        if output.timed_out {
            return Err(ProposalError::Transient(format!(
                "proposer timed out after {}s",
                request.timeout.as_secs()
            )));
        }
        if !output.status.success() {
            return Err(ProposalError::Transient(format!(
                "proposer exited with status {:?}",
                output.status.code()
            )));
        }
        if !request.output_path.exists() {
            return Err(ProposalError::Transient(format!(
                "proposer wrote no output to {}",
                request.output_path.display()
            )));
        }

        let raw = fs::read_to_string(&request.output_path).map_err(|err| {
            ProposalError::Transient(format!(
                "read proposal {}: {err}",
                request.output_path.display()
            ))
        })?;
        let bundle = parse_bundle(&raw)?;
        debug!(files = bundle.files.len(), action = %bundle.action, "parsed proposal");
        Ok(bundle)
    }
}

/// Parse and schema-validate a bundle. A surrounding Markdown code fence is tolerated.
pub fn parse_bundle(raw: &str) -> Result<ChangeBundle, ProposalError> {
    let text = strip_code_fence(raw);
    let value: Value = serde_json::from_str(text)
        .map_err(|err| ProposalError::Invalid(format!("proposal is not JSON: {err}")))?;
    let messages: Vec<String> = BUNDLE_VALIDATOR
        .iter_errors(&value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(ProposalError::Invalid(format!(
            "proposal failed schema validation: {}",
            messages.join("; ")
        )));
    }
    serde_json::from_value(value)
        .map_err(|err| ProposalError::Invalid(format!("deserialize proposal: {err}")))
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Call `proposer` up to `max_attempts` times, retrying transient errors only.
pub fn propose_with_retry<P: Proposer + ?Sized>(
    proposer: &P,
    request: &ProposalRequest,
    max_attempts: u32,
    backoff: Duration,
) -> Result<ChangeBundle, ProposalError> {
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match proposer.propose(request) {
            Ok(bundle) => return Ok(bundle),
            Err(err) if err.is_transient() && attempt < max_attempts => {
                warn!(attempt, max_attempts, err = %err, "proposal failed; retrying");
                thread::sleep(backoff);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn write_proposer_log(path: &Path, output: &CommandOutput, output_limit: usize) -> Result<()> {
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stdout));
    if output.stdout_truncated > 0 {
        buf.push_str(&format!("\n[stdout truncated {} bytes]\n", output.stdout_truncated));
    }
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stderr));
    if output.stderr_truncated > 0 {
        buf.push_str(&format!("\n[stderr truncated {} bytes]\n", output.stderr_truncated));
    }
    if output.timed_out {
        buf.push_str("\n[proposer timed out]\n");
    }
    if buf.len() > output_limit {
        let mut cut = output_limit;
        while !buf.is_char_boundary(cut) {
            cut -= 1;
        }
        let dropped = buf.len() - cut;
        buf.truncate(cut);
        buf.push_str(&format!("\n[truncated {dropped} bytes]\n"));
    }
    write_atomic(path, &buf)
}
