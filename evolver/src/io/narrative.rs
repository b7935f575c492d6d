//! Narrative files: the chronicle and the learnings list.
//!
//! Both live in the narrative dir and are committed together with the
//! project change that produced them.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::io::config::Layout;

const CHRONICLE_HEADER: &str = "# Chronicle\n\n";
const LEARNINGS_TITLE: &str = "# Learnings";
const ENTRY_PREFIX: &str = "- **Cycle";

/// Whether a learning came from a committed or a rolled-back cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LearningTag {
    Discovery,
    Correction,
}

impl LearningTag {
    fn as_str(self) -> &'static str {
        match self {
            LearningTag::Discovery => "discovery",
            LearningTag::Correction => "correction",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NarrativeStore {
    chronicle_path: PathBuf,
    learnings_path: PathBuf,
    max_learnings: usize,
}

impl NarrativeStore {
    pub fn new(chronicle_path: PathBuf, learnings_path: PathBuf, max_learnings: usize) -> Self {
        Self {
            chronicle_path,
            learnings_path,
            max_learnings: max_learnings.max(1),
        }
    }

    pub fn from_layout(layout: &Layout, max_learnings: usize) -> Self {
        Self::new(
            layout.chronicle_path.clone(),
            layout.learnings_path.clone(),
            max_learnings,
        )
    }

    pub fn read_learnings(&self) -> Result<String> {
        read_optional(&self.learnings_path)
    }

    /// Last `count` chronicle entries, oldest first.
    pub fn recent_chronicle(&self, count: usize) -> Result<Vec<String>> {
        let contents = read_optional(&self.chronicle_path)?;
        let entries: Vec<String> = contents
            .lines()
            .filter(|line| line.starts_with(ENTRY_PREFIX))
            .map(str::to_string)
            .collect();
        let skip = entries.len().saturating_sub(count);
        Ok(entries.into_iter().skip(skip).collect())
    }

    pub fn append_chronicle(&self, sequence: u64, entry: &str) -> Result<()> {
        let entry = entry.trim();
        if entry.is_empty() {
            return Ok(());
        }
        let mut contents = read_optional(&self.chronicle_path)?;
        if contents.is_empty() {
            contents.push_str(CHRONICLE_HEADER);
        } else if !contents.ends_with('\n') {
            contents.push('\n');
        }
        contents.push_str(&format!(
            "{ENTRY_PREFIX} {sequence}**: {}\n",
            single_line(entry)
        ));
        write_file(&self.chronicle_path, &contents)?;
        debug!(sequence, "chronicle entry appended");
        Ok(())
    }

    /// Append one learning.
    ///
    /// Past `max_learnings` entries the file is rebuilt from the newest
    /// entries only; free text (e.g. a curated preamble) is dropped then.
    pub fn append_learning(
        &self,
        sequence: u64,
        action: &str,
        learning: &str,
        tag: LearningTag,
    ) -> Result<()> {
        let learning = learning.trim();
        if learning.is_empty() {
            return Ok(());
        }
        let mut contents = read_optional(&self.learnings_path)?;
        if contents.is_empty() {
            contents = format!("{LEARNINGS_TITLE}\n\n");
        } else if !contents.ends_with('\n') {
            contents.push('\n');
        }
        contents.push_str(&format!(
            "{ENTRY_PREFIX} {sequence}** [{}] ({action}): {}\n",
            tag.as_str(),
            single_line(learning)
        ));

        let entries: Vec<&str> = contents
            .lines()
            .filter(|line| line.starts_with(ENTRY_PREFIX))
            .collect();
        if entries.len() > self.max_learnings {
            let mut trimmed = format!("{LEARNINGS_TITLE}\n\n");
            for entry in &entries[entries.len() - self.max_learnings..] {
                trimmed.push_str(entry);
                trimmed.push('\n');
            }
            contents = trimmed;
        }
        write_file(&self.learnings_path, &contents)?;
        debug!(sequence, tag = tag.as_str(), "learning appended");
        Ok(())
    }

    /// Replace the learnings file with a curated version.
    pub fn replace_learnings(&self, curated: &str) -> Result<()> {
        let curated = curated.trim();
        if curated.is_empty() {
            return Ok(());
        }
        let mut contents = if curated.starts_with(LEARNINGS_TITLE) {
            curated.to_string()
        } else {
            format!("{LEARNINGS_TITLE}\n\n{curated}")
        };
        contents.push('\n');
        write_file(&self.learnings_path, &contents)?;
        info!("learnings replaced with curated version");
        Ok(())
    }
}

fn single_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn read_optional(path: &Path) -> Result<String> {
    if !path.exists() {
        return Ok(String::new());
    }
    fs::read_to_string(path).with_context(|| format!("read {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}
