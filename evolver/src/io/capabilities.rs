//! Scan the project tree into a [`CapabilitiesSnapshot`].

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, instrument};
use walkdir::WalkDir;

use crate::core::strategy::{CapabilitiesSnapshot, Domain, classify_domain};

static AUTOLOAD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(\w+)\s*=\s*").expect("autoload pattern must compile"));

/// Files under `dir` with `extension`, sorted by path.
pub(crate) fn files_with_extension(dir: &Path, extension: &str) -> Vec<std::path::PathBuf> {
    if !dir.is_dir() {
        return Vec::new();
    }
    let mut files: Vec<_> = WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| path.extension().is_some_and(|ext| ext == extension))
        .collect();
    files.sort();
    files
}

fn stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Domain of a script, considering its `extends` line for enemy subclasses.
fn script_domain(name: &str, content: &str) -> Domain {
    let extends_enemy = content
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("extends"))
        .is_some_and(|line| line.to_ascii_lowercase().contains("enemy_base"));
    if extends_enemy {
        return Domain::Enemies;
    }
    classify_domain(name)
}

/// Autoload names declared in `project.godot`'s `[autoload]` section.
fn autoloads(project_file: &str) -> Vec<String> {
    let mut in_section = false;
    let mut names = Vec::new();
    for line in project_file.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('[') {
            in_section = trimmed == "[autoload]";
            continue;
        }
        if in_section && let Some(caps) = AUTOLOAD_RE.captures(trimmed) {
            names.push(caps[1].to_string());
        }
    }
    names
}

#[instrument(skip_all, fields(project = %project_dir.display()))]
pub fn scan_capabilities(project_dir: &Path) -> CapabilitiesSnapshot {
    let mut caps = CapabilitiesSnapshot::default();

    for script in files_with_extension(&project_dir.join("scripts"), "gd") {
        let name = stem(&script);
        let Ok(content) = fs::read_to_string(&script) else {
            continue;
        };
        if name.eq_ignore_ascii_case("enemy_base") {
            continue;
        }
        match script_domain(&name, &content) {
            Domain::Enemies => caps.enemies.push(name),
            Domain::Items => caps.items.push(name),
            Domain::Rooms => caps.rooms.push(name),
            Domain::Ui => caps.ui.push(name),
            Domain::Mechanics => caps.mechanics.push(name),
            Domain::Autoloads | Domain::Core | Domain::Other => {}
        }
    }

    for scene in files_with_extension(&project_dir.join("scenes"), "tscn") {
        let name = stem(&scene);
        let lower = name.to_ascii_lowercase();
        if lower.contains("room") && !caps.rooms.iter().any(|r| r.to_ascii_lowercase() == lower) {
            caps.rooms.push(name);
        }
    }

    if let Ok(project_file) = fs::read_to_string(project_dir.join("project.godot")) {
        caps.autoloads = autoloads(&project_file);
    }

    debug!(
        enemies = caps.enemies.len(),
        items = caps.items.len(),
        rooms = caps.rooms.len(),
        "scanned capabilities"
    );
    caps
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, rel: &str, contents: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, contents).expect("write");
    }

    #[test]
    fn classifies_project_content() {
        let temp = tempfile::tempdir().expect("tempdir");
        let project = temp.path();
        write(project, "scripts/enemy_base.gd", "extends CharacterBody2D\n");
        write(project, "scripts/enemies/bat.gd", "extends \"res://scripts/enemy_base.gd\"\n");
        write(project, "scripts/health_potion.gd", "extends Area2D\n");
        write(project, "scripts/player.gd", "extends CharacterBody2D\n");
        write(project, "scripts/hud.gd", "extends CanvasLayer\n");
        write(project, "scenes/cave_room.tscn", "[gd_scene]\n");
        write(
            project,
            "project.godot",
            "[application]\nconfig/name=\"x\"\n\n[autoload]\nEvents=\"*res://scripts/events.gd\"\nSave=\"*res://scripts/save.gd\"\n",
        );

        let caps = scan_capabilities(project);
        assert_eq!(caps.enemies, vec!["bat".to_string()]);
        assert_eq!(caps.items, vec!["health_potion".to_string()]);
        assert_eq!(caps.ui, vec!["hud".to_string()]);
        assert_eq!(caps.rooms, vec!["cave_room".to_string()]);
        assert_eq!(caps.autoloads, vec!["Events".to_string(), "Save".to_string()]);
    }

    #[test]
    fn empty_project_summarizes_as_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let caps = scan_capabilities(temp.path());
        assert_eq!(caps, CapabilitiesSnapshot::default());
        assert!(caps.summary().contains("nothing built yet"));
    }
}
