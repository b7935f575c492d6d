//! Workspace mutator: writes bundle files into the project subtree.
//!
//! Paths are validated for the whole bundle before the first byte is
//! written, so a sandbox violation never leaves a partial change behind.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, instrument};

use crate::core::types::{ChangeBundle, CycleFailure};
use crate::io::harness::SMOKE_SCRIPT_REL;

/// Project paths owned by the evolver itself.
const RESERVED_PATHS: [&str; 1] = [SMOKE_SCRIPT_REL];

/// The mutable project subtree.
#[derive(Debug, Clone)]
pub struct Workspace {
    project_dir: PathBuf,
    /// Project dir name relative to the repository root (e.g. `game`).
    project_rel: String,
}

/// Files a bundle will write, relative to the project dir, in bundle order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WritePlan {
    pub paths: Vec<String>,
}

impl Workspace {
    pub fn new(project_dir: impl Into<PathBuf>, project_rel: impl Into<String>) -> Self {
        Self {
            project_dir: project_dir.into(),
            project_rel: project_rel.into(),
        }
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn project_rel(&self) -> &str {
        &self.project_rel
    }

    /// Validate every path in the bundle without touching disk.
    pub fn plan(&self, bundle: &ChangeBundle) -> Result<WritePlan, CycleFailure> {
        if bundle.is_empty() {
            return Err(CycleFailure::EmptyBundle);
        }
        let paths = bundle
            .files
            .iter()
            .map(|edit| normalize_path(&self.project_rel, &edit.path))
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(reserved) = paths.iter().find(|p| RESERVED_PATHS.contains(&p.as_str())) {
            return Err(CycleFailure::Sandbox(format!(
                "{reserved} is reserved for the smoke test"
            )));
        }
        Ok(WritePlan { paths })
    }

    /// Write the planned files. Parent dirs are created as needed.
    #[instrument(skip_all, fields(files = plan.paths.len()))]
    pub fn apply(&self, bundle: &ChangeBundle, plan: &WritePlan) -> Result<()> {
        for (edit, rel) in bundle.files.iter().zip(&plan.paths) {
            let path = self.project_dir.join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create directory {}", parent.display()))?;
            }
            fs::write(&path, &edit.content)
                .with_context(|| format!("write {}", path.display()))?;
            debug!(path = %rel, mode = ?edit.mode, "wrote file");
        }
        Ok(())
    }
}

/// Normalize a proposed path to one relative to the project dir.
///
/// A leading `./`, `res://` or `<project>/` is stripped. Absolute paths and
/// `..` components are rejected.
pub fn normalize_path(project_rel: &str, raw: &str) -> Result<String, CycleFailure> {
    let trimmed = raw.trim().replace('\\', "/");
    if trimmed.is_empty() {
        return Err(CycleFailure::Sandbox("empty file path".to_string()));
    }
    if trimmed.starts_with('/') || Path::new(&trimmed).is_absolute() {
        return Err(CycleFailure::Sandbox(format!("absolute path not allowed: {raw}")));
    }

    let mut rel = trimmed.as_str();
    rel = rel.strip_prefix("res://").unwrap_or(rel);
    while let Some(rest) = rel.strip_prefix("./") {
        rel = rest;
    }
    if !project_rel.is_empty()
        && let Some(rest) = rel.strip_prefix(project_rel).and_then(|r| r.strip_prefix('/'))
    {
        rel = rest;
    }

    let mut parts = Vec::new();
    for component in Path::new(rel).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(CycleFailure::Sandbox(format!(
                    "path escapes the project: {raw}"
                )));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(CycleFailure::Sandbox(format!("absolute path not allowed: {raw}")));
            }
        }
    }
    if parts.is_empty() {
        return Err(CycleFailure::Sandbox(format!("path names no file: {raw}")));
    }
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{EditMode, FileEdit, Narrative};

    fn bundle(paths: &[&str]) -> ChangeBundle {
        ChangeBundle {
            action: "add".to_string(),
            target: "slime".to_string(),
            files: paths
                .iter()
                .map(|p| FileEdit {
                    path: p.to_string(),
                    mode: EditMode::Create,
                    content: format!("# {p}\n"),
                })
                .collect(),
            narrative: Narrative::default(),
        }
    }

    #[test]
    fn strips_project_prefix() {
        assert_eq!(
            normalize_path("game", "game/scripts/a.gd").expect("ok"),
            "scripts/a.gd"
        );
        assert_eq!(normalize_path("game", "./scripts/a.gd").expect("ok"), "scripts/a.gd");
        assert_eq!(normalize_path("game", "res://scenes/b.tscn").expect("ok"), "scenes/b.tscn");
        assert_eq!(normalize_path("game", "gamer/a.gd").expect("ok"), "gamer/a.gd");
    }

    #[test]
    fn rejects_escapes_and_absolute_paths() {
        for bad in ["../etc/passwd", "scripts/../../x", "/etc/passwd", "", "game/"] {
            let err = normalize_path("game", bad).expect_err(bad);
            assert!(matches!(err, CycleFailure::Sandbox(_)), "{bad}: {err:?}");
        }
    }

    #[test]
    fn sandbox_violation_is_detected_before_any_write() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ws = Workspace::new(temp.path().join("game"), "game");
        let b = bundle(&["scripts/ok.gd", "../escape.gd"]);
        assert!(matches!(ws.plan(&b), Err(CycleFailure::Sandbox(_))));
        assert!(!temp.path().join("game").exists());
    }

    #[test]
    fn smoke_script_path_is_reserved() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ws = Workspace::new(temp.path().join("game"), "game");
        for path in ["scripts/_smoke_test.gd", "game/scripts/_smoke_test.gd", "res://scripts/_smoke_test.gd"] {
            let err = ws.plan(&bundle(&["scripts/ok.gd", path])).expect_err(path);
            assert!(
                matches!(&err, CycleFailure::Sandbox(reason) if reason.contains("reserved")),
                "{path}: {err:?}"
            );
        }
        assert!(!temp.path().join("game").exists());
    }

    #[test]
    fn empty_bundle_never_plans() {
        let ws = Workspace::new("/nowhere", "game");
        assert_eq!(ws.plan(&bundle(&[])), Err(CycleFailure::EmptyBundle));
    }

    #[test]
    fn applies_files_creating_parents() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ws = Workspace::new(temp.path().join("game"), "game");
        let b = bundle(&["game/scripts/enemies/slime.gd"]);
        let plan = ws.plan(&b).expect("plan");
        ws.apply(&b, &plan).expect("apply");
        let written = fs::read_to_string(temp.path().join("game/scripts/enemies/slime.gd"))
            .expect("read");
        assert_eq!(written, "# game/scripts/enemies/slime.gd\n");
    }
}
