//! Git adapter for the transaction manager.
//!
//! Version control is the durability boundary: a cycle's changes exist only
//! once committed, and every rollback is a path-scoped restore to HEAD. We
//! keep a small, explicit wrapper around `git` subprocess calls.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// The version-control verbs the transaction manager relies on.
///
/// Paths are pathspecs relative to the repository root.
pub trait VersionControl {
    /// Current HEAD commit id.
    fn head(&self) -> Result<String>;

    /// Stage everything under `paths` and commit it.
    ///
    /// Returns `Ok(false)` when there was nothing to commit.
    fn commit_paths(&self, paths: &[&str], message: &str) -> Result<bool>;

    /// Restore `paths` to HEAD, deleting untracked files under them.
    fn discard_paths(&self, paths: &[&str]) -> Result<()>;

    /// Diff of `paths` against HEAD, including untracked file contents.
    fn diff_paths(&self, paths: &[&str]) -> Result<String>;
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// True when `workdir` is inside a git work tree.
    pub fn is_repo(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    fn has_head(&self) -> Result<bool> {
        Ok(self
            .run(&["rev-parse", "--verify", "--quiet", "HEAD"])?
            .status
            .success())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Paths git knows about in HEAD under `path`.
    fn tracked_in_head(&self, path: &str) -> Result<bool> {
        if !self.has_head()? {
            return Ok(false);
        }
        let out = self.run_capture(&["ls-tree", "-r", "--name-only", "HEAD", "--", path])?;
        Ok(!out.trim().is_empty())
    }

    fn in_index(&self, path: &str) -> Result<bool> {
        let out = self.run_capture(&["ls-files", "--", path])?;
        Ok(!out.trim().is_empty())
    }

    /// Pathspecs that git can resolve: present on disk or known to the index.
    fn known_pathspecs<'a>(&self, paths: &[&'a str]) -> Result<Vec<&'a str>> {
        let mut known = Vec::new();
        for path in paths {
            if self.workdir.join(path).exists() || self.in_index(path)? {
                known.push(*path);
            }
        }
        Ok(known)
    }

    fn untracked_files(&self, path: &str) -> Result<Vec<String>> {
        let out = self.run_capture(&["ls-files", "--others", "--exclude-standard", "--", path])?;
        Ok(out
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

impl VersionControl for Git {
    fn head(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    #[instrument(skip_all, fields(paths = ?paths))]
    fn commit_paths(&self, paths: &[&str], message: &str) -> Result<bool> {
        let known = self.known_pathspecs(paths)?;
        if known.is_empty() {
            debug!("no known paths to stage");
            return Ok(false);
        }
        let mut args = vec!["add", "-A", "--"];
        args.extend(known);
        self.run_checked(&args)?;

        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-q", "-m", message])?;
        Ok(true)
    }

    #[instrument(skip_all, fields(paths = ?paths))]
    fn discard_paths(&self, paths: &[&str]) -> Result<()> {
        for path in paths {
            if self.in_index(path)? {
                self.run_checked(&["reset", "-q", "--", path])?;
            }
            if self.tracked_in_head(path)? {
                self.run_checked(&["checkout", "HEAD", "--", path])?;
            }
            if self.workdir.join(path).exists() {
                self.run_checked(&["clean", "-fdq", "--", path])?;
            }
        }
        debug!("paths restored to HEAD");
        Ok(())
    }

    fn diff_paths(&self, paths: &[&str]) -> Result<String> {
        let known = self.known_pathspecs(paths)?;
        if known.is_empty() {
            return Ok(String::new());
        }
        let mut diff = String::new();
        if self.has_head()? {
            let mut args = vec!["diff", "HEAD", "--"];
            args.extend(known.iter().copied());
            diff.push_str(&self.run_capture(&args)?);
        }
        for path in known {
            for file in self.untracked_files(path)? {
                match fs::read_to_string(self.workdir.join(&file)) {
                    Ok(contents) => diff.push_str(&untracked_diff(&file, &contents)),
                    Err(e) => warn!(file = %file, err = %e, "skip unreadable untracked file"),
                }
            }
        }
        Ok(diff)
    }
}

/// Render a new file as a unified diff against `/dev/null`.
fn untracked_diff(path: &str, contents: &str) -> String {
    let mut out = format!(
        "diff --git a/{path} b/{path}\nnew file\n--- /dev/null\n+++ b/{path}\n@@ -0,0 +1,{} @@\n",
        contents.lines().count()
    );
    for line in contents.lines() {
        out.push('+');
        out.push_str(line);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_untracked_file_as_addition() {
        let diff = untracked_diff("game/a.gd", "extends Node\nfunc f():\n");
        assert!(diff.contains("+++ b/game/a.gd"));
        assert!(diff.contains("@@ -0,0 +1,2 @@"));
        assert!(diff.ends_with("+extends Node\n+func f():\n"));
    }
}
