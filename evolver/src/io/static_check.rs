//! Static pre-check of files written this cycle.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, instrument};

use crate::core::diagnostics::{DiagnosticCategory, DiagnosticRecord};
use crate::core::precheck::{check_brackets, find_references, is_scene, is_script};

const PROJECT_MARKER: &str = "project.godot";
const MAX_ROOT_SEARCH_DEPTH: usize = 10;

/// Walk upward from `start` to the nearest dir containing `project.godot`.
pub fn find_project_root(start: &Path) -> Option<PathBuf> {
    let mut current = start;
    for _ in 0..MAX_ROOT_SEARCH_DEPTH {
        if current.join(PROJECT_MARKER).is_file() {
            return Some(current.to_path_buf());
        }
        current = current.parent()?;
    }
    None
}

/// Check `written` (paths relative to `project_dir`).
///
/// Scripts get the bracket scan and `preload` resolution. Scenes get
/// `ext_resource` resolution when `scene_refs` is set.
#[instrument(skip_all, fields(files = written.len(), scene_refs))]
pub fn check_written_files(
    project_dir: &Path,
    written: &[String],
    scene_refs: bool,
) -> Vec<DiagnosticRecord> {
    let written_set: HashSet<&str> = written.iter().map(String::as_str).collect();
    let mut records = Vec::new();

    for rel in written {
        let script = is_script(rel);
        let scene = scene_refs && is_scene(rel);
        if !script && !scene {
            continue;
        }

        let full = project_dir.join(rel);
        let content = match fs::read_to_string(&full) {
            Ok(content) => content,
            Err(e) => {
                records.push(DiagnosticRecord::new(
                    DiagnosticCategory::Validation,
                    rel.as_str(),
                    0,
                    format!("Cannot read file: {e}"),
                ));
                continue;
            }
        };

        if script {
            records.extend(check_brackets(rel, &content));
        }

        let root = full
            .parent()
            .and_then(find_project_root)
            .unwrap_or_else(|| project_dir.to_path_buf());
        for reference in find_references(rel, &content) {
            let target = reference.relative_path();
            if root.join(target).exists() || written_set.contains(target) {
                continue;
            }
            records.push(reference.missing(rel));
        }
    }

    debug!(count = records.len(), "static check finished");
    records
}
