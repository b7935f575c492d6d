//! Cycle prompt builder for the change proposer.
//!
//! The template is rendered once, split into sections by HTML comment
//! markers, and trimmed to the configured byte budget by dropping the
//! least critical sections first.

use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};
use regex::Regex;
use tracing::debug;

use crate::core::governor::ComplexityLimits;
use crate::core::types::{CycleRecord, Strategy};

const CYCLE_TEMPLATE: &str = include_str!("prompts/cycle.md");

/// Sections dropped, in this order, when the prompt exceeds its budget.
const DROP_ORDER: [&str; 5] = ["lore", "learnings", "files", "history", "diff"];

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section marker pattern must compile")
});

/// Everything the proposer sees for one cycle.
#[derive(Debug, Clone)]
pub struct PromptInputs {
    pub sequence: u64,
    pub strategy: Strategy,
    pub explanation: String,
    /// Project dir relative to the repository root.
    pub project: String,
    pub limits: ComplexityLimits,
    pub capabilities: String,
    /// Recent cycle records, oldest first.
    pub history: Vec<CycleRecord>,
    pub last_error: Option<String>,
    /// Diff of the last rolled-back change.
    pub last_diff: Option<String>,
    pub codebase: String,
    pub files: String,
    pub learnings: String,
    /// Recent chronicle entries, oldest first.
    pub lore: Vec<String>,
    /// Ask the proposer to return a curated learnings file.
    pub curate: bool,
}

struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("cycle", CYCLE_TEMPLATE)
            .expect("cycle template should be valid");
        Self { env }
    }

    fn render(&self, input: &PromptInputs) -> Result<String> {
        let non_blank = |s: &str| {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        };
        let template = self.env.get_template("cycle")?;
        let rendered = template.render(context! {
            sequence => input.sequence,
            strategy => input.strategy.as_str(),
            explanation => input.explanation.trim(),
            project => input.project.as_str(),
            limits => &input.limits,
            capabilities => input.capabilities.trim(),
            history => &input.history,
            last_error => input.last_error.as_deref().and_then(non_blank),
            last_diff => input.last_diff.as_deref().and_then(non_blank),
            codebase => input.codebase.trim(),
            files => non_blank(&input.files),
            learnings => non_blank(&input.learnings),
            lore => &input.lore,
            curate => input.curate,
        })?;
        Ok(rendered)
    }
}

#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Split rendered output at `<!-- section:KEY required|droppable -->` markers.
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();

    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let required = kind.as_str() == "required";
        let content = rendered[whole.end()..end].trim().to_string();
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }

    sections
}

fn total_len(sections: &[ParsedSection]) -> usize {
    sections.iter().map(|s| s.content.len()).sum()
}

fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    if total_len(sections) <= budget {
        return;
    }

    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            break;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    if total_len(sections) <= budget {
        return;
    }
    let Some((last, others)) = sections.split_last_mut() else {
        return;
    };
    let allowed = budget.saturating_sub(total_len(others));
    let before_len = last.content.len();
    if before_len > allowed {
        const MARKER: &str = "\n[truncated]";
        let keep = if allowed > MARKER.len() {
            allowed - MARKER.len()
        } else {
            allowed
        };
        let cut = floor_char_boundary(&last.content, keep);
        last.content.truncate(cut);
        if allowed > MARKER.len() {
            last.content.push_str(MARKER);
        }
        debug!(
            section = %last.key,
            before_len,
            after_len = last.content.len(),
            "truncated section for budget"
        );
    }
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    (0..=index).rev().find(|&i| text.is_char_boundary(i)).unwrap_or(0)
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Builds the cycle prompt within a byte budget.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    pub fn build(&self, input: &PromptInputs) -> Result<PromptPack> {
        let rendered = PromptEngine::new().render(input)?;
        let mut sections = parse_sections(&rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes);
        Ok(PromptPack {
            content: render_sections(&sections),
        })
    }
}

/// A rendered prompt ready to send to the proposer.
#[derive(Debug, Clone)]
pub struct PromptPack {
    content: String,
}

impl PromptPack {
    pub fn render(&self) -> String {
        self.content.clone()
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}
