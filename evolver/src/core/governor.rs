//! Complexity governor: rejects oversized bundles before they touch disk.

use serde::{Deserialize, Serialize};

use crate::core::types::ChangeBundle;

/// Size caps for a single bundle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplexityLimits {
    pub max_files_touched: usize,
    pub max_total_lines: usize,
    /// Upper bound on `created / touched`, applied only when more than one file is touched.
    pub max_new_file_ratio: f64,
}

impl Default for ComplexityLimits {
    fn default() -> Self {
        Self {
            max_files_touched: 3,
            max_total_lines: 400,
            max_new_file_ratio: 0.75,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject(String),
}

impl Verdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept)
    }
}

/// Check a bundle against the limits. Checks run in a fixed order and the
/// first violated limit is reported.
pub fn evaluate(bundle: &ChangeBundle, limits: &ComplexityLimits) -> Verdict {
    let touched = bundle.files.len();
    if touched > limits.max_files_touched {
        return Verdict::Reject(format!(
            "Too many files ({touched} > {}). Keep changes smaller.",
            limits.max_files_touched
        ));
    }

    let total_lines = bundle.total_lines();
    if total_lines > limits.max_total_lines {
        return Verdict::Reject(format!(
            "Too many lines ({total_lines} > {}). Simplify the change.",
            limits.max_total_lines
        ));
    }

    if touched > 1 {
        let created = bundle.created_count();
        let ratio = created as f64 / touched as f64;
        if ratio > limits.max_new_file_ratio {
            return Verdict::Reject(format!(
                "Too many new files ({created}/{touched} = {:.0}% > {:.0}%). Prefer editing existing files or create fewer new ones.",
                ratio * 100.0,
                limits.max_new_file_ratio * 100.0
            ));
        }
    }

    Verdict::Accept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{EditMode, FileEdit, Narrative};

    fn bundle(files: Vec<(EditMode, &str)>) -> ChangeBundle {
        ChangeBundle {
            action: "add".to_string(),
            target: "thing".to_string(),
            files: files
                .into_iter()
                .enumerate()
                .map(|(i, (mode, content))| FileEdit {
                    path: format!("scripts/f{i}.gd"),
                    mode,
                    content: content.to_string(),
                })
                .collect(),
            narrative: Narrative::default(),
        }
    }

    #[test]
    fn rejects_too_many_files_naming_both_numbers() {
        let b = bundle(vec![(EditMode::Edit, "x"); 4]);
        let Verdict::Reject(reason) = evaluate(&b, &ComplexityLimits::default()) else {
            panic!("expected rejection");
        };
        assert!(reason.contains('4'));
        assert!(reason.contains('3'));
        assert!(reason.starts_with("Too many files"));
    }

    #[test]
    fn counts_lines_as_newlines_plus_one() {
        let limits = ComplexityLimits {
            max_total_lines: 4,
            ..ComplexityLimits::default()
        };
        assert!(evaluate(&bundle(vec![(EditMode::Edit, "a\nb\nc\nd")]), &limits).is_accept());
        let verdict = evaluate(&bundle(vec![(EditMode::Edit, "a\nb\nc\nd\n")]), &limits);
        assert_eq!(
            verdict,
            Verdict::Reject("Too many lines (5 > 4). Simplify the change.".to_string())
        );
    }

    #[test]
    fn single_new_file_ignores_ratio() {
        assert!(
            evaluate(
                &bundle(vec![(EditMode::Create, "x")]),
                &ComplexityLimits::default()
            )
            .is_accept()
        );
    }

    #[test]
    fn rejects_all_new_files() {
        let b = bundle(vec![(EditMode::Create, "x"), (EditMode::Create, "y")]);
        let Verdict::Reject(reason) = evaluate(&b, &ComplexityLimits::default()) else {
            panic!("expected rejection");
        };
        assert!(reason.contains("2/2 = 100% > 75%"));
    }

    #[test]
    fn mixed_bundle_within_ratio_is_accepted() {
        let b = bundle(vec![
            (EditMode::Create, "x"),
            (EditMode::Create, "y"),
            (EditMode::Create, "z"),
        ]);
        let limits = ComplexityLimits {
            max_new_file_ratio: 1.0,
            ..ComplexityLimits::default()
        };
        assert!(evaluate(&b, &limits).is_accept());
        let b = bundle(vec![(EditMode::Create, "x"), (EditMode::Edit, "y")]);
        assert!(evaluate(&b, &ComplexityLimits::default()).is_accept());
    }
}
