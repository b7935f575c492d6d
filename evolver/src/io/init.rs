//! Scaffolding for `evolver init`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing::info;

use super::config::{EvolverConfig, Layout, write_config};

/// Options for [`init_workspace`].
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Overwrite evolver-owned files (config, state `.gitignore`).
    pub force: bool,
}

/// Create the state dir, default config, narrative files and an empty project.
///
/// Narrative files and the project are only created when missing; `force`
/// never touches them.
pub fn init_workspace(root: &Path, options: &InitOptions) -> Result<Layout> {
    let cfg = EvolverConfig::default();
    let layout = cfg.layout(root);
    if layout.config_path.exists() && !options.force {
        return Err(anyhow!(
            "evolver init: {} already exists (use --force to overwrite)",
            layout.config_path.display()
        ));
    }
    if layout.state_dir.exists() && !layout.state_dir.is_dir() {
        return Err(anyhow!(
            "evolver init: {} exists but is not a directory",
            layout.state_dir.display()
        ));
    }

    create_dir(&layout.state_dir)?;
    write_config(&layout.config_path, &cfg)?;
    write_file(&layout.state_dir.join(".gitignore"), STATE_GITIGNORE)?;

    create_dir(&layout.narrative_dir)?;
    write_if_missing(&layout.chronicle_path, CHRONICLE_PLACEHOLDER)?;
    write_if_missing(&layout.learnings_path, LEARNINGS_PLACEHOLDER)?;

    create_dir(&layout.project_dir)?;
    write_if_missing(&layout.project_dir.join("project.godot"), PROJECT_PLACEHOLDER)?;

    info!(root = %root.display(), "initialized evolver workspace");
    Ok(layout)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

fn write_if_missing(path: &Path, contents: &str) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    write_file(path, contents)
}

const STATE_GITIGNORE: &str = "*\n!.gitignore\n!config.toml\n";
const CHRONICLE_PLACEHOLDER: &str = "# Chronicle\n\n";
const LEARNINGS_PLACEHOLDER: &str = "# Learnings\n\n";
const PROJECT_PLACEHOLDER: &str = "; Engine configuration file.\n\nconfig_version=5\n\n[application]\n\nconfig/name=\"Evolver Project\"\n";
