//! Intent check: asks an external judge whether a bundle does what it claims.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument};

use crate::core::types::ChangeBundle;
use crate::io::process::run_command_with_timeout;

const OUTPUT_LIMIT_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntentVerdict {
    Pass(Option<String>),
    Fail(String),
}

/// Judges whether the written files implement the bundle's action and target.
///
/// Errors mean the judge could not answer; callers treat them as a pass.
pub trait IntentChecker {
    fn check(&self, bundle: &ChangeBundle) -> Result<IntentVerdict>;
}

/// Intent checker that pipes a question to a configured command.
///
/// The first non-blank stdout line must be `PASS[: note]` or `FAIL[: reason]`.
#[derive(Debug, Clone)]
pub struct CommandIntentChecker {
    command: Vec<String>,
    workdir: PathBuf,
    timeout: Duration,
}

impl CommandIntentChecker {
    pub fn new(command: Vec<String>, workdir: PathBuf, timeout: Duration) -> Self {
        Self {
            command,
            workdir,
            timeout,
        }
    }
}

impl IntentChecker for CommandIntentChecker {
    #[instrument(skip_all, fields(action = %bundle.action, target = %bundle.target))]
    fn check(&self, bundle: &ChangeBundle) -> Result<IntentVerdict> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("intent command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&self.workdir);

        let question = intent_question(bundle);
        let output = run_command_with_timeout(
            cmd,
            Some(question.as_bytes()),
            self.timeout,
            OUTPUT_LIMIT_BYTES,
        )?;
        if output.timed_out {
            return Err(anyhow!(
                "intent command timed out after {}s",
                self.timeout.as_secs()
            ));
        }
        if !output.status.success() {
            return Err(anyhow!(
                "intent command exited with status {:?}",
                output.status.code()
            ));
        }
        let verdict = parse_verdict(&output.stdout_text())?;
        debug!(?verdict, "intent verdict");
        Ok(verdict)
    }
}

fn intent_question(bundle: &ChangeBundle) -> String {
    let mut text = format!(
        "Does this change actually implement \"{} {}\"? \
         Answer on the first line with PASS or FAIL: <reason>.\n\n",
        bundle.action, bundle.target
    );
    for edit in &bundle.files {
        text.push_str(&format!("### {}\n```\n{}\n```\n\n", edit.path, edit.content.trim_end()));
    }
    text
}

/// Parse the judge's first non-blank line.
pub fn parse_verdict(output: &str) -> Result<IntentVerdict> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or_else(|| anyhow!("intent command printed nothing"))?;
    let (word, rest) = match line.split_once(':') {
        Some((word, rest)) => (word.trim(), rest.trim()),
        None => (line, ""),
    };
    let note = (!rest.is_empty()).then(|| rest.to_string());
    match word.to_ascii_uppercase().as_str() {
        "PASS" => Ok(IntentVerdict::Pass(note)),
        "FAIL" => Ok(IntentVerdict::Fail(
            note.unwrap_or_else(|| "change does not match its stated intent".to_string()),
        )),
        _ => Err(anyhow!("unrecognized intent verdict: {line}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pass_and_fail_lines() {
        assert_eq!(parse_verdict("\nPASS\n").expect("pass"), IntentVerdict::Pass(None));
        assert_eq!(
            parse_verdict("pass: adds the bat").expect("pass"),
            IntentVerdict::Pass(Some("adds the bat".to_string()))
        );
        assert_eq!(
            parse_verdict("FAIL: only a stub\nmore text").expect("fail"),
            IntentVerdict::Fail("only a stub".to_string())
        );
        assert!(parse_verdict("maybe").is_err());
        assert!(parse_verdict("  \n").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn command_checker_reads_first_line() {
        use crate::core::types::Narrative;
        use crate::test_support::write_script;

        let temp = tempfile::tempdir().expect("tempdir");
        let judge = write_script(
            temp.path(),
            "judge.sh",
            "grep -q 'add bat' && echo 'FAIL: no bat scene' || echo PASS\n",
        );
        let checker = CommandIntentChecker::new(
            vec![judge.display().to_string()],
            temp.path().to_path_buf(),
            Duration::from_secs(5),
        );
        let bundle = ChangeBundle {
            action: "add".to_string(),
            target: "bat".to_string(),
            files: Vec::new(),
            narrative: Narrative::default(),
        };
        assert_eq!(
            checker.check(&bundle).expect("check"),
            IntentVerdict::Fail("no bat scene".to_string())
        );
    }
}
