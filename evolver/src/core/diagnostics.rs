//! Structured diagnostics extracted from free-text engine output.
//!
//! Parsing is two passes over the same text:
//!
//! 1. An ordered rule table, applied line by line. The first rule whose
//!    pattern matches a line claims it; later rules are not tried.
//! 2. A one-slot state machine for two-line `SCRIPT ERROR:` blocks, where the
//!    message and its `at: ...(res://file:line)` location arrive on separate
//!    lines.
//!
//! Block records never override a single-line record for the same
//! `(file, line)`.

use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

/// Closed set of diagnostic categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticCategory {
    ParseError,
    MissingNode,
    MethodError,
    NullAccess,
    MissingResource,
    SceneError,
    ScriptLoadError,
    Validation,
    SmokeTest,
}

impl DiagnosticCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            DiagnosticCategory::ParseError => "parse_error",
            DiagnosticCategory::MissingNode => "missing_node",
            DiagnosticCategory::MethodError => "method_error",
            DiagnosticCategory::NullAccess => "null_access",
            DiagnosticCategory::MissingResource => "missing_resource",
            DiagnosticCategory::SceneError => "scene_error",
            DiagnosticCategory::ScriptLoadError => "script_load_error",
            DiagnosticCategory::Validation => "validation",
            DiagnosticCategory::SmokeTest => "smoke_test",
        }
    }

    /// Fix template for runtime-reported categories.
    ///
    /// Placeholders: `{file}`, `{line}`, `{message}`.
    fn suggestion_template(self) -> Option<&'static str> {
        let template = match self {
            DiagnosticCategory::ParseError => {
                "Check syntax at line {line}. Common issues: missing colon, unmatched brackets, wrong indentation."
            }
            DiagnosticCategory::MissingNode => {
                "Node '{message}' doesn't exist in the scene tree. Check node names and paths."
            }
            DiagnosticCategory::MethodError => {
                "Function '{message}' doesn't exist on this object. Check method name and class."
            }
            DiagnosticCategory::NullAccess => {
                "Accessing a property/method on null in {file}. Ensure the node exists and is initialized."
            }
            DiagnosticCategory::MissingResource => {
                "Resource {file} doesn't exist on disk. Check the path and ensure the file was created."
            }
            DiagnosticCategory::SceneError => {
                "Scene {file} is malformed. Check .tscn format, ext_resource paths, and node structure."
            }
            DiagnosticCategory::ScriptLoadError => {
                "Script failed to load: {message}. Fix errors in this file; scripts depending on its class_name will also break."
            }
            DiagnosticCategory::Validation | DiagnosticCategory::SmokeTest => return None,
        };
        Some(template)
    }

    /// Render the category's fix suggestion for one record.
    pub fn suggest(self, file: &str, line: u32, message: &str) -> Option<String> {
        self.suggestion_template().map(|template| {
            template
                .replace("{file}", file)
                .replace("{line}", &line.to_string())
                .replace("{message}", message)
        })
    }
}

impl fmt::Display for DiagnosticCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One categorized problem found in engine output or by static inspection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiagnosticRecord {
    pub category: DiagnosticCategory,
    pub file: String,
    /// 1-based line, or 0 when unknown.
    pub line: u32,
    pub message: String,
    pub suggestion: Option<String>,
}

impl DiagnosticRecord {
    pub fn new(
        category: DiagnosticCategory,
        file: impl Into<String>,
        line: u32,
        message: impl Into<String>,
    ) -> Self {
        let file = file.into();
        let message = message.into();
        let suggestion = category.suggest(&file, line, &message);
        Self {
            category,
            file,
            line,
            message,
            suggestion,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

impl fmt::Display for DiagnosticRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}:{} - {}",
            self.category, self.file, self.line, self.message
        )?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, "\n  Fix: {suggestion}")?;
        }
        Ok(())
    }
}

/// One entry of the single-line rule table.
struct Rule {
    pattern: Regex,
    category: DiagnosticCategory,
}

impl Rule {
    fn new(pattern: &str, category: DiagnosticCategory) -> Self {
        Self {
            pattern: Regex::new(pattern).expect("diagnostic rule pattern must compile"),
            category,
        }
    }

    fn classify(&self, line: &str) -> Option<DiagnosticRecord> {
        let caps = self.pattern.captures(line)?;
        Some(record_from_captures(self.category, &caps, line))
    }
}

// Order matters: a line matching several patterns is claimed by the first.
static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        Rule::new(
            r"(?i)res://(?P<file>[^:]+):(?P<line>\d+)\s*-\s*Parse Error:\s*(?P<msg>.+)",
            DiagnosticCategory::ParseError,
        ),
        Rule::new(
            r#"(?i)res://(?P<file>[^:]+):(?P<line>\d+)\s*-\s*.*Node not found:\s*"?(?P<msg>[^"]+)"?"#,
            DiagnosticCategory::MissingNode,
        ),
        Rule::new(
            r"(?i)res://(?P<file>[^:]+):(?P<line>\d+)\s*-\s*Invalid call.*Nonexistent function\s+'(?P<msg>\w+)'",
            DiagnosticCategory::MethodError,
        ),
        Rule::new(
            r"(?i)res://(?P<file>[^:]+):(?P<line>\d+)\s*-\s*.*null instance.*",
            DiagnosticCategory::NullAccess,
        ),
        Rule::new(
            r"(?i)Failed loading resource:\s*res://(?P<file>.+)",
            DiagnosticCategory::MissingResource,
        ),
        Rule::new(
            r"(?i)scene/resources/packed_scene.*res://(?P<file>[^:]+).*error",
            DiagnosticCategory::SceneError,
        ),
        Rule::new(
            r#"(?i)Failed to load script "res://(?P<file>[^"]+)".*error\s+"(?P<msg>[^"]+)""#,
            DiagnosticCategory::ScriptLoadError,
        ),
    ]
});

static BLOCK_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"SCRIPT ERROR:\s*(.+)").expect("marker pattern must compile"));
static BLOCK_LOCATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"at:.*\(res://([^:)]+):(\d+)\)").expect("location pattern must compile")
});

fn record_from_captures(
    category: DiagnosticCategory,
    caps: &Captures<'_>,
    line: &str,
) -> DiagnosticRecord {
    let file = caps
        .name("file")
        .map(|m| format!("res://{}", m.as_str().trim()))
        .unwrap_or_else(|| "unknown".to_string());
    let line_no = caps
        .name("line")
        .and_then(|m| m.as_str().parse::<u32>().ok())
        .unwrap_or(0);
    let message = caps
        .name("msg")
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_else(|| line.trim().to_string());
    DiagnosticRecord::new(category, file, line_no, message)
}

/// Single-line pass: first matching rule per line wins.
fn parse_single_lines(output: &str) -> Vec<DiagnosticRecord> {
    output
        .lines()
        .filter_map(|line| RULES.iter().find_map(|rule| rule.classify(line)))
        .collect()
}

/// Correlation state for two-line `SCRIPT ERROR` blocks.
#[derive(Debug, Default)]
enum BlockState {
    #[default]
    Idle,
    Pending(String),
}

/// Block pass: a marker line opens the slot, the next location line closes it.
fn parse_blocks(output: &str) -> Vec<DiagnosticRecord> {
    let mut records = Vec::new();
    let mut state = BlockState::Idle;

    for line in output.lines() {
        if let Some(caps) = BLOCK_MARKER.captures(line) {
            state = BlockState::Pending(caps[1].trim().to_string());
            continue;
        }
        let BlockState::Pending(message) = &state else {
            continue;
        };
        if let Some(caps) = BLOCK_LOCATION.captures(line) {
            let file = format!("res://{}", &caps[1]);
            let line_no = caps[2].parse::<u32>().unwrap_or(0);
            let category = if message.to_ascii_lowercase().contains("parse error") {
                DiagnosticCategory::ParseError
            } else {
                DiagnosticCategory::ScriptLoadError
            };
            records.push(DiagnosticRecord::new(
                category,
                file,
                line_no,
                message.clone(),
            ));
            state = BlockState::Idle;
        } else if !line.trim().is_empty() {
            state = BlockState::Idle;
        }
    }

    records
}

/// Parse raw engine output into structured diagnostics.
///
/// Deterministic: identical input always yields identical ordered output.
pub fn parse_output(output: &str) -> Vec<DiagnosticRecord> {
    let mut records = parse_single_lines(output);
    let mut seen: HashSet<(String, u32)> = records
        .iter()
        .map(|record| (record.file.clone(), record.line))
        .collect();

    for record in parse_blocks(output) {
        if seen.insert((record.file.clone(), record.line)) {
            records.push(record);
        }
    }

    records
}

/// Render at most `max` records for logs and proposer context.
///
/// With no records, falls back to the head of the raw output.
pub fn summarize(records: &[DiagnosticRecord], max: usize, raw_output: &str) -> String {
    if records.is_empty() {
        let raw = raw_output.trim();
        if raw.is_empty() {
            return "unknown error".to_string();
        }
        return truncate_chars(raw, 500);
    }
    let mut lines: Vec<String> = records.iter().take(max).map(ToString::to_string).collect();
    if records.len() > max {
        lines.push(format!("... and {} more errors", records.len() - max));
    }
    lines.join("\n")
}

fn truncate_chars(input: &str, max: usize) -> String {
    match input.char_indices().nth(max) {
        Some((idx, _)) => input[..idx].to_string(),
        None => input.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_parse_error_line() {
        let out = "ERROR: res://scripts/player.gd:12 - Parse Error: Expected ':' after 'if'\n";
        let records = parse_output(out);
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.category, DiagnosticCategory::ParseError);
        assert_eq!(record.file, "res://scripts/player.gd");
        assert_eq!(record.line, 12);
        assert_eq!(record.message, "Expected ':' after 'if'");
        assert!(
            record
                .suggestion
                .as_deref()
                .expect("suggestion")
                .contains("line 12")
        );
    }

    #[test]
    fn parses_missing_node_message_without_quotes() {
        let out = r#"res://scripts/hud.gd:40 - Node not found: "HealthBar" (relative to "/root/Main")."#;
        let records = parse_output(out);
        assert_eq!(records[0].category, DiagnosticCategory::MissingNode);
        assert_eq!(records[0].message, "HealthBar");
        assert!(
            records[0]
                .suggestion
                .as_deref()
                .expect("suggestion")
                .contains("'HealthBar'")
        );
    }

    #[test]
    fn null_access_uses_whole_line_as_message() {
        let line = "res://scripts/enemy.gd:7 - Invalid get index 'hp' (on base: 'null instance').";
        let records = parse_output(line);
        assert_eq!(records[0].category, DiagnosticCategory::NullAccess);
        assert_eq!(records[0].line, 7);
        assert_eq!(records[0].message, line);
    }

    #[test]
    fn missing_resource_has_unknown_line() {
        let records = parse_output("ERROR: Failed loading resource: res://art/slime.png");
        assert_eq!(records[0].category, DiagnosticCategory::MissingResource);
        assert_eq!(records[0].file, "res://art/slime.png");
        assert_eq!(records[0].line, 0);
    }

    #[test]
    fn script_load_error_captures_quoted_message() {
        let out = r#"ERROR: Failed to load script "res://scripts/boss.gd" with error "Parse error"."#;
        let records = parse_output(out);
        assert_eq!(records[0].category, DiagnosticCategory::ScriptLoadError);
        assert_eq!(records[0].file, "res://scripts/boss.gd");
        assert_eq!(records[0].message, "Parse error");
    }

    #[test]
    fn first_matching_rule_claims_the_line() {
        // Matches both the parse_error and null_access patterns.
        let out = "res://a.gd:3 - Parse Error: null instance here";
        let records = parse_output(out);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].category, DiagnosticCategory::ParseError);
    }

    #[test]
    fn unmatched_lines_yield_nothing() {
        assert!(parse_output("Godot Engine v4.6.stable\nall good\n").is_empty());
    }

    #[test]
    fn correlates_script_error_block() {
        let out = "SCRIPT ERROR: Parse Error: Could not find type \"Foo\" in the current scope.\n   at: GDScript::reload (res://scripts/bar.gd:3)\n";
        let records = parse_output(out);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].file, "res://scripts/bar.gd");
        assert_eq!(records[0].line, 3);
        assert_eq!(records[0].category, DiagnosticCategory::ParseError);
        assert!(records[0].message.contains("Could not find type"));
    }

    #[test]
    fn blank_lines_keep_pending_block() {
        let out = "SCRIPT ERROR: Invalid call\n\n   at: Node::_ready (res://scripts/x.gd:9)\n";
        let records = parse_output(out);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].category, DiagnosticCategory::ScriptLoadError);
    }

    #[test]
    fn intervening_line_clears_pending_block() {
        let out = "SCRIPT ERROR: something\nunrelated noise\n   at: Node::_ready (res://scripts/x.gd:9)\n";
        assert!(parse_output(out).is_empty());
    }

    #[test]
    fn single_line_record_wins_over_block_for_same_location() {
        let out = "res://scripts/bar.gd:3 - Parse Error: bad token\nSCRIPT ERROR: Parse Error: bad token\n   at: GDScript::reload (res://scripts/bar.gd:3)\n";
        let records = parse_output(out);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "bad token");
        assert!(
            records[0]
                .suggestion
                .as_deref()
                .expect("suggestion")
                .starts_with("Check syntax")
        );
    }

    #[test]
    fn parsing_is_idempotent() {
        let out = "res://a.gd:1 - Parse Error: x\nERROR: Failed loading resource: res://b.png\nSCRIPT ERROR: boom\n at: f (res://c.gd:2)\n";
        assert_eq!(parse_output(out), parse_output(out));
    }

    #[test]
    fn summary_caps_record_count() {
        let records: Vec<_> = (1..=7)
            .map(|n| DiagnosticRecord::new(DiagnosticCategory::Validation, "a.gd", n, "bad"))
            .collect();
        let summary = summarize(&records, 5, "");
        assert_eq!(summary.lines().count(), 6);
        assert!(summary.ends_with("... and 2 more errors"));
    }

    #[test]
    fn summary_falls_back_to_raw_output() {
        assert_eq!(summarize(&[], 5, "  exit code 1  "), "exit code 1");
        assert_eq!(summarize(&[], 5, ""), "unknown error");
    }
}
