//! Strategy selection: EXPLORE / RETRY / PIVOT from cycle history.
//!
//! Pure: the decision is recomputed from the cycle log every cycle and
//! nothing about it is stored.

use std::fmt;

use serde::Serialize;

use crate::core::types::{CycleRecord, FailureKind, Strategy};

/// Window for "recent" history (domain nudges, failure counts, hints).
const LOOKBACK: usize = 5;
/// Window for consecutive same-target failures.
const STREAK_WINDOW: usize = 3;
const PIVOT_STREAK: usize = 3;
const PIVOT_RECENT_FAILS: usize = 4;
const HINT_MIN_COUNT: usize = 2;

/// Content domains the project is classified into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Enemies,
    Items,
    Rooms,
    Mechanics,
    Ui,
    Autoloads,
    Core,
    Other,
}

impl Domain {
    pub fn as_str(self) -> &'static str {
        match self {
            Domain::Enemies => "enemies",
            Domain::Items => "items",
            Domain::Rooms => "rooms",
            Domain::Mechanics => "mechanics",
            Domain::Ui => "ui",
            Domain::Autoloads => "autoloads",
            Domain::Core => "core",
            Domain::Other => "other",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const ITEM_KEYWORDS: &[&str] = &["pickup", "item", "loot", "potion", "shrine", "key"];
const UI_KEYWORDS: &[&str] = &["hud", "menu", "ui", "health_bar", "dialog"];
const CORE_NAMES: &[&str] = &["player", "game_manager", "main"];

/// Classify a script stem, scene stem or cycle target into a domain.
pub fn classify_domain(name: &str) -> Domain {
    let name = name.to_ascii_lowercase();
    let stem = name.rsplit('/').next().unwrap_or(&name);
    let stem = stem.split('.').next().unwrap_or(stem);

    if stem.contains("enemy") {
        Domain::Enemies
    } else if ITEM_KEYWORDS.iter().any(|kw| stem.contains(kw)) {
        Domain::Items
    } else if stem.contains("room") || stem.contains("door") {
        Domain::Rooms
    } else if UI_KEYWORDS.iter().any(|kw| stem.contains(kw)) {
        Domain::Ui
    } else if CORE_NAMES.contains(&stem) {
        Domain::Core
    } else if stem.contains("projectile") || stem.contains("camera") {
        Domain::Mechanics
    } else {
        Domain::Other
    }
}

/// What the project currently contains, grouped by domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CapabilitiesSnapshot {
    pub enemies: Vec<String>,
    pub items: Vec<String>,
    pub rooms: Vec<String>,
    pub mechanics: Vec<String>,
    pub ui: Vec<String>,
    pub autoloads: Vec<String>,
}

impl CapabilitiesSnapshot {
    pub fn entries(&self, domain: Domain) -> &[String] {
        match domain {
            Domain::Enemies => &self.enemies,
            Domain::Items => &self.items,
            Domain::Rooms => &self.rooms,
            Domain::Mechanics => &self.mechanics,
            Domain::Ui => &self.ui,
            Domain::Autoloads => &self.autoloads,
            Domain::Core | Domain::Other => &[],
        }
    }

    /// Markdown summary for the proposer prompt.
    pub fn summary(&self) -> String {
        let sections = [
            ("Enemies", &self.enemies),
            ("Items", &self.items),
            ("Rooms", &self.rooms),
            ("Mechanics", &self.mechanics),
            ("UI", &self.ui),
            ("Autoloads", &self.autoloads),
        ];
        let lines: Vec<String> = sections
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(label, entries)| format!("- **{label}**: {}", entries.join(", ")))
            .collect();
        if lines.is_empty() {
            "(empty project - nothing built yet)".to_string()
        } else {
            lines.join("\n")
        }
    }
}

/// Recurring failure categories that earn a standing hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HintCategory {
    ComplexityBudget,
    IntentCheck,
    PreValidation,
    NoOutput,
}

impl HintCategory {
    pub fn advice(self) -> &'static str {
        match self {
            HintCategory::ComplexityBudget => {
                "PATTERN: Recent failures are hitting the complexity budget. Keep it to 2 files max, under 300 lines total. Edit existing files rather than creating new ones."
            }
            HintCategory::IntentCheck => {
                "PATTERN: Recent code didn't match the stated intent. Be precise about what you're building and make sure the code actually does it."
            }
            HintCategory::PreValidation => {
                "PATTERN: Recent failures have bad resource paths or syntax errors. Double-check all res:// paths and bracket matching."
            }
            HintCategory::NoOutput => {
                "PATTERN: Recent attempts produced no files. Make sure to include concrete file changes, not just descriptions."
            }
        }
    }
}

/// Error-text classifiers for records that predate the typed `kind` field.
/// Order matters: the first matching predicate decides.
const TEXT_CLASSIFIERS: &[(fn(&str) -> bool, HintCategory)] = &[
    (
        |e| e.contains("Complexity budget"),
        HintCategory::ComplexityBudget,
    ),
    (|e| e.contains("Intent check"), HintCategory::IntentCheck),
    (
        |e| e.contains("Pre-check") || e.contains("Pre-validation") || e.to_lowercase().contains("preload"),
        HintCategory::PreValidation,
    ),
    (|e| e.contains("no files"), HintCategory::NoOutput),
];

/// Hint category of a failed record, if it has one.
pub fn classify_failure(record: &CycleRecord) -> Option<HintCategory> {
    if !record.is_failure() {
        return None;
    }
    if let Some(kind) = record.kind {
        return match kind {
            FailureKind::Governance => Some(HintCategory::ComplexityBudget),
            FailureKind::Intent => Some(HintCategory::IntentCheck),
            FailureKind::PreCheck => Some(HintCategory::PreValidation),
            FailureKind::EmptyBundle => Some(HintCategory::NoOutput),
            _ => None,
        };
    }
    let error = record.error.as_deref().unwrap_or("");
    TEXT_CLASSIFIERS
        .iter()
        .find(|(matches, _)| matches(error))
        .map(|(_, category)| *category)
}

/// Most frequent hint category among recent failures, earliest on ties.
fn recurring_hint(recent: &[CycleRecord]) -> Option<HintCategory> {
    let mut counts: Vec<(HintCategory, usize)> = Vec::new();
    for category in recent.iter().filter_map(classify_failure) {
        match counts.iter_mut().find(|(c, _)| *c == category) {
            Some((_, n)) => *n += 1,
            None => counts.push((category, 1)),
        }
    }
    let mut best: Option<(HintCategory, usize)> = None;
    for (category, count) in counts {
        if count >= HINT_MIN_COUNT && best.is_none_or(|(_, b)| count > b) {
            best = Some((category, count));
        }
    }
    best.map(|(category, _)| category)
}

/// Prerequisite domains for known feature names.
const FEATURE_DEPENDENCIES: &[(&str, &[Domain])] = &[
    ("boss", &[Domain::Enemies]),
    ("shop", &[Domain::Items]),
    ("inventory", &[Domain::Items]),
    ("equipment", &[Domain::Items]),
    ("crafting", &[Domain::Items]),
    ("quest", &[Domain::Rooms, Domain::Items]),
    ("npc_dialog", &[Domain::Rooms]),
    ("minimap", &[Domain::Rooms]),
];

/// Prerequisite domains that `target` needs but the project lacks.
pub fn missing_prerequisites(target: &str, caps: &CapabilitiesSnapshot) -> Vec<Domain> {
    let target = target.to_ascii_lowercase();
    let tokens: Vec<&str> = target
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();

    let mut missing = Vec::new();
    for (feature, deps) in FEATURE_DEPENDENCIES {
        let matched = target == *feature || tokens.iter().any(|t| t == feature);
        if !matched {
            continue;
        }
        for dep in *deps {
            if caps.entries(*dep).is_empty() && !missing.contains(dep) {
                missing.push(*dep);
            }
        }
    }
    missing
}

/// Least represented of the four buildable domains not touched recently.
fn underrepresented_domain(caps: &CapabilitiesSnapshot, recent: &[CycleRecord]) -> Option<Domain> {
    let touched: Vec<Domain> = recent
        .iter()
        .filter(|r| !r.target.is_empty())
        .map(|r| classify_domain(&r.target))
        .collect();
    [Domain::Enemies, Domain::Items, Domain::Rooms, Domain::Ui]
        .into_iter()
        .filter(|d| !touched.contains(d))
        .min_by_key(|d| caps.entries(*d).len())
}

/// The selector's output for one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StrategyDecision {
    pub strategy: Strategy,
    pub explanation: String,
    pub hint: Option<HintCategory>,
}

fn tail(history: &[CycleRecord], n: usize) -> &[CycleRecord] {
    &history[history.len().saturating_sub(n)..]
}

/// Choose the strategy for the next cycle.
pub fn choose(history: &[CycleRecord], caps: Option<&CapabilitiesSnapshot>) -> StrategyDecision {
    let Some(last) = history.last() else {
        return StrategyDecision {
            strategy: Strategy::Explore,
            explanation: "No history yet - start building.".to_string(),
            hint: None,
        };
    };

    let recent = tail(history, LOOKBACK);
    let hint = recurring_hint(recent);
    let with_hint = |mut explanation: String| {
        if let Some(hint) = hint {
            explanation.push(' ');
            explanation.push_str(hint.advice());
        }
        explanation
    };

    if !last.is_failure() {
        let mut explanation = "Last cycle succeeded. Try something new and ambitious.".to_string();
        if let Some(domain) = caps.and_then(|c| underrepresented_domain(c, recent)) {
            explanation.push_str(&format!(
                " Consider adding something in the '{domain}' domain - it's underrepresented."
            ));
        }
        return StrategyDecision {
            strategy: Strategy::Explore,
            explanation: with_hint(explanation),
            hint,
        };
    }

    let target = last.target.as_str();
    let streak = tail(history, STREAK_WINDOW)
        .iter()
        .rev()
        .take_while(|r| r.target == target && r.is_failure())
        .count();
    let recent_fails = recent.iter().filter(|r| r.is_failure()).count();

    if streak >= PIVOT_STREAK {
        return StrategyDecision {
            strategy: Strategy::Pivot,
            explanation: with_hint(format!(
                "Failed at '{target}' {streak} times. Abandon it and try something completely different."
            )),
            hint,
        };
    }

    if recent_fails >= PIVOT_RECENT_FAILS {
        return StrategyDecision {
            strategy: Strategy::Pivot,
            explanation: with_hint(format!(
                "Too many recent failures ({recent_fails}/{LOOKBACK}). Pick something simple and small that's likely to succeed."
            )),
            hint,
        };
    }

    let error = last.error.as_deref().unwrap_or("unknown");
    let mut explanation = with_hint(format!(
        "Last attempt at '{target}' failed: {error}. Try a different approach to the same thing."
    ));
    if let Some(caps) = caps {
        let missing = missing_prerequisites(target, caps);
        if !missing.is_empty() {
            let names: Vec<&str> = missing.iter().map(|d| d.as_str()).collect();
            explanation.push_str(&format!(
                " WARNING: '{target}' may need [{}] first.",
                names.join(", ")
            ));
        }
    }
    StrategyDecision {
        strategy: Strategy::Retry,
        explanation,
        hint,
    }
}

/// Domains whose file contents are worth showing the proposer.
///
/// Exploration gets core context only; retry and pivot add the domain of the
/// last target.
pub fn focus_domains(history: &[CycleRecord], strategy: Strategy) -> Vec<Domain> {
    let Some(last) = history.last() else {
        return vec![Domain::Core];
    };
    if strategy == Strategy::Explore {
        return vec![Domain::Core];
    }
    match classify_domain(&last.target) {
        Domain::Other | Domain::Core => vec![Domain::Core],
        domain => vec![domain, Domain::Core],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(seq: u64, target: &str) -> CycleRecord {
        CycleRecord::success(seq, "add", target, None)
    }

    fn fail(seq: u64, target: &str, kind: FailureKind, error: &str) -> CycleRecord {
        CycleRecord::failure(seq, "add", target, kind, error)
    }

    fn functional_fail(seq: u64, target: &str) -> CycleRecord {
        fail(seq, target, FailureKind::Functional, "Functional test: boom")
    }

    #[test]
    fn empty_history_explores() {
        let decision = choose(&[], None);
        assert_eq!(decision.strategy, Strategy::Explore);
        assert_eq!(decision.hint, None);
    }

    #[test]
    fn three_trailing_fails_on_same_target_pivot() {
        let history = vec![
            functional_fail(1, "boss"),
            functional_fail(2, "boss"),
            functional_fail(3, "boss"),
        ];
        let decision = choose(&history, None);
        assert_eq!(decision.strategy, Strategy::Pivot);
        assert!(decision.explanation.contains("'boss' 3 times"));
    }

    #[test]
    fn four_of_last_five_failing_pivots() {
        let history = vec![
            ok(1, "slime"),
            functional_fail(2, "a"),
            functional_fail(3, "b"),
            functional_fail(4, "c"),
            functional_fail(5, "d"),
        ];
        assert_eq!(choose(&history, None).strategy, Strategy::Pivot);
    }

    #[test]
    fn single_failure_retries_with_prerequisite_warning() {
        let history = vec![ok(1, "slime"), functional_fail(2, "boss")];
        let caps = CapabilitiesSnapshot::default();
        let decision = choose(&history, Some(&caps));
        assert_eq!(decision.strategy, Strategy::Retry);
        assert!(decision.explanation.contains("Functional test: boom"));
        assert!(
            decision
                .explanation
                .contains("WARNING: 'boss' may need [enemies] first.")
        );
    }

    #[test]
    fn prerequisite_matches_target_tokens() {
        let caps = CapabilitiesSnapshot {
            rooms: vec!["dungeon_room".to_string()],
            ..CapabilitiesSnapshot::default()
        };
        assert_eq!(
            missing_prerequisites("village-quest", &caps),
            vec![Domain::Items]
        );
        assert!(missing_prerequisites("bossy_theme", &caps).is_empty());
    }

    #[test]
    fn success_nudges_toward_untouched_sparse_domain() {
        let history = vec![ok(1, "slime_enemy"), ok(2, "health_potion")];
        let caps = CapabilitiesSnapshot {
            enemies: vec!["slime_enemy".to_string()],
            items: vec!["health_potion".to_string()],
            rooms: vec!["start_room".to_string(), "cave_room".to_string()],
            ..CapabilitiesSnapshot::default()
        };
        let decision = choose(&history, Some(&caps));
        assert_eq!(decision.strategy, Strategy::Explore);
        assert!(decision.explanation.contains("'ui' domain"));
    }

    #[test]
    fn repeated_governance_failures_add_complexity_hint() {
        let history = vec![
            fail(1, "a", FailureKind::Governance, "Complexity budget: Too many files"),
            fail(2, "b", FailureKind::Governance, "Complexity budget: Too many lines"),
            ok(3, "c"),
        ];
        let decision = choose(&history, None);
        assert_eq!(decision.strategy, Strategy::Explore);
        assert_eq!(decision.hint, Some(HintCategory::ComplexityBudget));
        assert!(decision.explanation.contains("complexity budget"));
    }

    #[test]
    fn hint_ties_go_to_the_earliest_category() {
        let history = vec![
            fail(1, "a", FailureKind::Intent, "Intent check: nope"),
            fail(2, "b", FailureKind::EmptyBundle, "Proposer returned no files"),
            fail(3, "c", FailureKind::Intent, "Intent check: nope"),
            fail(4, "d", FailureKind::EmptyBundle, "Proposer returned no files"),
        ];
        assert_eq!(recurring_hint(&history), Some(HintCategory::IntentCheck));
    }

    #[test]
    fn legacy_records_classify_by_error_text() {
        let mut record = fail(1, "a", FailureKind::Internal, "Pre-validation: preload path not found");
        record.kind = None;
        assert_eq!(classify_failure(&record), Some(HintCategory::PreValidation));
        record.error = Some("LLM returned no files".to_string());
        assert_eq!(classify_failure(&record), Some(HintCategory::NoOutput));
    }

    #[test]
    fn classifies_domains_by_name() {
        assert_eq!(classify_domain("scripts/slime_enemy.gd"), Domain::Enemies);
        assert_eq!(classify_domain("gold_key"), Domain::Items);
        assert_eq!(classify_domain("locked_door"), Domain::Rooms);
        assert_eq!(classify_domain("pause_menu"), Domain::Ui);
        assert_eq!(classify_domain("player"), Domain::Core);
        assert_eq!(classify_domain("arrow_projectile"), Domain::Mechanics);
        assert_eq!(classify_domain("weather"), Domain::Other);
    }

    #[test]
    fn retry_focuses_on_last_target_domain() {
        let history = vec![functional_fail(1, "slime_enemy")];
        assert_eq!(
            focus_domains(&history, Strategy::Retry),
            vec![Domain::Enemies, Domain::Core]
        );
        assert_eq!(focus_domains(&history, Strategy::Explore), vec![Domain::Core]);
    }
}
