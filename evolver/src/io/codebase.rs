//! Codebase summary and focused file contents for the proposer prompt.

use std::fs;
use std::path::Path;

use walkdir::WalkDir;

use crate::core::strategy::{Domain, classify_domain};
use crate::io::capabilities::files_with_extension;

fn rel_display(project_dir: &Path, path: &Path) -> String {
    path.strip_prefix(project_dir)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

/// First `##` doc comment or `extends` line, as a one-line summary.
fn script_summary(content: &str) -> String {
    for line in content.lines() {
        let trimmed = line.trim();
        if let Some(doc) = trimmed.strip_prefix("##") {
            return doc.trim_start_matches('#').trim().to_string();
        }
        if trimmed.starts_with("extends") {
            return trimmed.to_string();
        }
        if !trimmed.is_empty() && !trimmed.starts_with('#') {
            break;
        }
    }
    content
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("extends"))
        .map_or_else(|| "(no summary)".to_string(), str::to_string)
}

/// Markdown listing of scripts (with summaries), scenes and the asset count.
pub fn summarize_codebase(project_dir: &Path) -> String {
    let mut sections = Vec::new();

    let scripts = files_with_extension(&project_dir.join("scripts"), "gd");
    if !scripts.is_empty() {
        sections.push("## Scripts".to_string());
        for script in &scripts {
            let summary = fs::read_to_string(script)
                .map(|content| script_summary(&content))
                .unwrap_or_else(|_| "(unreadable)".to_string());
            sections.push(format!("- **{}**: {summary}", rel_display(project_dir, script)));
        }
    }

    let scenes = files_with_extension(&project_dir.join("scenes"), "tscn");
    if !scenes.is_empty() {
        sections.push("## Scenes".to_string());
        for scene in &scenes {
            sections.push(format!("- **{}**", rel_display(project_dir, scene)));
        }
    }

    let assets_dir = project_dir.join("assets");
    if assets_dir.is_dir() {
        let count = WalkDir::new(&assets_dir)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .count();
        if count > 0 {
            sections.push(format!("## Assets ({count} files)"));
        }
    }

    if sections.is_empty() {
        "Empty project - no scripts or scenes yet.".to_string()
    } else {
        sections.join("\n")
    }
}

/// Full contents of scripts in the focus domains.
pub fn focused_file_contents(project_dir: &Path, focus: &[Domain]) -> String {
    let mut parts = Vec::new();
    for script in files_with_extension(&project_dir.join("scripts"), "gd") {
        let rel = rel_display(project_dir, &script);
        if !focus.contains(&classify_domain(&rel)) {
            continue;
        }
        let Ok(content) = fs::read_to_string(&script) else {
            continue;
        };
        parts.push(format!("### {rel}\n```gdscript\n{}\n```", content.trim_end()));
    }
    parts.join("\n\n")
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
    fn summary_prefers_doc_comment() {
        assert_eq!(script_summary("## Player movement\nextends Node\n"), "Player movement");
        assert_eq!(script_summary("extends Area2D\n"), "extends Area2D");
        assert_eq!(script_summary("var x = 1\n"), "(no summary)");
    }

    #[test]
    fn lists_scripts_scenes_and_assets() {
        let temp = tempfile::tempdir().expect("tempdir");
        let project = temp.path();
        write(project, "scripts/player.gd", "## The hero\nextends CharacterBody2D\n");
        write(project, "scenes/main.tscn", "[gd_scene]\n");
        write(project, "assets/a.png", "");
        write(project, "assets/b.png", "");
        let summary = summarize_codebase(project);
        assert_eq!(
            summary,
            "## Scripts\n- **scripts/player.gd**: The hero\n## Scenes\n- **scenes/main.tscn**\n## Assets (2 files)"
        );
    }

    #[test]
    fn empty_project_has_placeholder() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(summarize_codebase(temp.path()).starts_with("Empty project"));
    }

    #[test]
    fn focus_selects_domain_scripts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let project = temp.path();
        write(project, "scripts/player.gd", "extends CharacterBody2D\n");
        write(project, "scripts/slime_enemy.gd", "extends Node\n");
        let core_only = focused_file_contents(project, &[Domain::Core]);
        assert!(core_only.contains("### scripts/player.gd"));
        assert!(!core_only.contains("slime_enemy"));
        let both = focused_file_contents(project, &[Domain::Enemies, Domain::Core]);
        assert!(both.contains("### scripts/slime_enemy.gd"));
    }
}
