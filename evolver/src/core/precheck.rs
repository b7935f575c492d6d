//! Static script checks that run before the engine is launched.
//!
//! Everything here is pure text inspection; resolving references against the
//! disk happens in `io::static_check`.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::diagnostics::{DiagnosticCategory, DiagnosticRecord};

static PRELOAD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"preload\(\s*"(res://[^"]+)"\s*\)"#).expect("preload pattern must compile")
});
static EXT_RESOURCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"path\s*=\s*"(res://[^"]+)""#).expect("ext_resource pattern must compile")
});

fn closer_for(open: char) -> Option<char> {
    match open {
        '(' => Some(')'),
        '[' => Some(']'),
        '{' => Some('}'),
        _ => None,
    }
}

fn opener_for(close: char) -> Option<char> {
    match close {
        ')' => Some('('),
        ']' => Some('['),
        '}' => Some('{'),
        _ => None,
    }
}

fn opens_triple(chars: &[char], at: usize, quote: char) -> bool {
    chars[at..].starts_with(&[quote, quote, quote])
}

/// True when `path` names a script the bracket scan applies to.
pub fn is_script(path: &str) -> bool {
    path.ends_with(".gd")
}

/// True when `path` names a scene whose ext_resource paths are checked.
pub fn is_scene(path: &str) -> bool {
    path.ends_with(".tscn")
}

/// Scan a script for unbalanced brackets, parens and braces.
///
/// `#` starts a comment and quoted strings are skipped. Single-quoted and
/// double-quoted strings end with their line; triple-quoted strings may span
/// lines.
pub fn check_brackets(file: &str, content: &str) -> Vec<DiagnosticRecord> {
    let mut records = Vec::new();
    let mut stack: Vec<(char, u32)> = Vec::new();
    let mut multiline: Option<char> = None;

    for (idx, line) in content.lines().enumerate() {
        let line_no = idx as u32 + 1;
        let chars: Vec<char> = line.chars().collect();
        let mut quote: Option<char> = None;
        let mut escaped = false;
        let mut i = 0;

        while i < chars.len() {
            let ch = chars[i];
            if let Some(q) = multiline.or(quote) {
                if escaped {
                    escaped = false;
                } else if ch == '\\' {
                    escaped = true;
                } else if multiline.is_some() && opens_triple(&chars, i, q) {
                    multiline = None;
                    i += 3;
                    continue;
                } else if multiline.is_none() && ch == q {
                    quote = None;
                }
                i += 1;
                continue;
            }
            match ch {
                '#' => break,
                '"' | '\'' if opens_triple(&chars, i, ch) => {
                    multiline = Some(ch);
                    i += 3;
                    continue;
                }
                '"' | '\'' => quote = Some(ch),
                '(' | '[' | '{' => stack.push((ch, line_no)),
                ')' | ']' | '}' => match stack.last().copied() {
                    None => records.push(
                        DiagnosticRecord::new(
                            DiagnosticCategory::Validation,
                            file,
                            line_no,
                            format!("Unmatched closing '{ch}'"),
                        )
                        .with_suggestion("Check for missing opening bracket/paren."),
                    ),
                    Some((open, open_line)) => {
                        if opener_for(ch) != Some(open) {
                            let expected = closer_for(open).unwrap_or(open);
                            records.push(
                                DiagnosticRecord::new(
                                    DiagnosticCategory::Validation,
                                    file,
                                    line_no,
                                    format!(
                                        "Mismatched bracket: expected '{expected}' but got '{ch}'"
                                    ),
                                )
                                .with_suggestion(format!(
                                    "Opening '{open}' was at line {open_line}."
                                )),
                            );
                        }
                        stack.pop();
                    }
                },
                _ => {}
            }
            i += 1;
        }
    }

    for (open, line_no) in stack {
        records.push(
            DiagnosticRecord::new(
                DiagnosticCategory::Validation,
                file,
                line_no,
                format!("Unclosed '{open}'"),
            )
            .with_suggestion("Add the matching closing bracket/paren."),
        );
    }

    records
}

/// How a file refers to another project resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    Preload,
    ExtResource,
}

/// A `res://` path mentioned by a script or scene.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceReference {
    pub kind: ReferenceKind,
    pub line: u32,
    pub res_path: String,
}

impl ResourceReference {
    /// Path relative to the project root.
    pub fn relative_path(&self) -> &str {
        self.res_path
            .strip_prefix("res://")
            .unwrap_or(&self.res_path)
    }

    /// Record reported when the reference does not resolve.
    pub fn missing(&self, file: &str) -> DiagnosticRecord {
        let (message, suggestion) = match self.kind {
            ReferenceKind::Preload => (
                format!("preload path not found: {}", self.res_path),
                "Ensure the referenced file exists before preloading.",
            ),
            ReferenceKind::ExtResource => (
                format!("ext_resource path not found: {}", self.res_path),
                "Ensure the referenced script/scene/resource exists.",
            ),
        };
        DiagnosticRecord::new(DiagnosticCategory::MissingResource, file, self.line, message)
            .with_suggestion(suggestion)
    }
}

/// Collect resource references: `preload(...)` in scripts, `path="..."` in scenes.
pub fn find_references(file: &str, content: &str) -> Vec<ResourceReference> {
    let (pattern, kind) = if is_script(file) {
        (&*PRELOAD_RE, ReferenceKind::Preload)
    } else if is_scene(file) {
        (&*EXT_RESOURCE_RE, ReferenceKind::ExtResource)
    } else {
        return Vec::new();
    };

    content
        .lines()
        .enumerate()
        .flat_map(|(idx, line)| {
            pattern.captures_iter(line).map(move |caps| ResourceReference {
                kind,
                line: idx as u32 + 1,
                res_path: caps[1].to_string(),
            })
        })
        .collect()
}
