//! System-prompt optimization: smart > safe > truncate > passthrough.
//!
//! `safe` removes whole sections by tier and validates that critical
//! patterns survive, falling back to `truncate` when they do not. `truncate`
//! keeps a head-of-prompt line budget plus important sections. `smart` is a
//! three-layer pipeline: sentence dedup into a template library, hierarchical
//! tool docs, and a final budget clamp. Strategies are mutually exclusive
//! except for the safe→truncate fallback.

mod sections;

use crate::context::TokenEstimator;
use sections::{split_sections, Section};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Optimization strategy, highest priority first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    Smart,
    Safe,
    Truncate,
    Passthrough,
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "smart" => Ok(Strategy::Smart),
            "safe" => Ok(Strategy::Safe),
            "truncate" => Ok(Strategy::Truncate),
            "passthrough" | "none" => Ok(Strategy::Passthrough),
            other => Err(format!("unknown optimizer strategy: {other}")),
        }
    }
}

/// Filtering aggressiveness for the safe strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Minimal,
    Moderate,
    Aggressive,
    Extreme,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Minimal => "minimal",
            Tier::Moderate => "moderate",
            Tier::Aggressive => "aggressive",
            Tier::Extreme => "extreme",
        }
    }

    /// Auto tier by estimated prompt size.
    pub fn auto(tokens: u64) -> Tier {
        if tokens < 5_000 {
            Tier::Minimal
        } else if tokens < 10_000 {
            Tier::Moderate
        } else if tokens < 20_000 {
            Tier::Aggressive
        } else {
            Tier::Extreme
        }
    }

    /// Sections at or above this level get dropped.
    fn drop_level(&self) -> u8 {
        match self {
            Tier::Minimal => 3,
            Tier::Moderate => 2,
            Tier::Aggressive => 2,
            Tier::Extreme => 1,
        }
    }
}

/// Optimizer knobs resolved from per-backend config.
#[derive(Clone, Debug)]
pub struct OptimizerConfig {
    pub strategy: Strategy,
    /// Safe filter toggle. `None` auto-enables for local mode.
    pub safe_system_filter: Option<bool>,
    /// Explicit tier; `None` selects by estimated tokens.
    pub tier: Option<Tier>,
    pub system_prompt_max_tokens: usize,
    /// Current mode routes to a local backend.
    pub mode_is_local: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Passthrough,
            safe_system_filter: None,
            tier: None,
            system_prompt_max_tokens: 8_192,
            mode_is_local: false,
        }
    }
}

/// Stats reported alongside the optimized text.
#[derive(Clone, Debug, Serialize)]
pub struct OptimizeStats {
    pub original_tokens: u64,
    pub final_tokens: u64,
    pub reduction_percent: f64,
    pub applied_tier: Option<&'static str>,
    pub validation_ok: bool,
}

/// The optimized prompt plus its stats.
#[derive(Clone, Debug)]
pub struct OptimizeOutcome {
    pub text: String,
    pub stats: OptimizeStats,
}

/// Patterns that must survive safe filtering when present in the original.
/// Losing any of these means the filter cut behavioural instructions.
const CRITICAL_PATTERNS: &[&str] = &[
    "tool_use",
    "tool call",
    "IMPORTANT",
    "NEVER",
    "ALWAYS",
    "You are",
];

/// Headings whose sections survive the truncate strategy beyond the head
/// line budget.
const IMPORTANT_SECTION_HEADINGS: &[&str] = &[
    "tool",
    "instruction",
    "output",
    "format",
    "security",
    "safety",
];

/// Lines kept from the top of the prompt by the truncate strategy.
const TRUNCATE_HEAD_LINES: usize = 100;

/// Sentence-dedup bounds for the smart strategy.
const DEDUP_MIN_LEN: usize = 25;
const DEDUP_MAX_LEN: usize = 300;
const DEDUP_MIN_OCCURRENCES: usize = 3;

/// Runs the configured strategy over the system prompt.
pub fn optimize(system: &str, cfg: &OptimizerConfig, est: &TokenEstimator) -> OptimizeOutcome {
    let original_tokens = est.count_text(system);

    let safe_enabled = cfg
        .safe_system_filter
        .unwrap_or(cfg.mode_is_local);

    let (text, applied_tier, validation_ok) = match cfg.strategy {
        Strategy::Smart => {
            let tier = cfg.tier.unwrap_or_else(|| Tier::auto(original_tokens));
            (smart_optimize(system, cfg, est), Some(tier.as_str()), true)
        }
        Strategy::Safe if safe_enabled => {
            let tier = cfg.tier.unwrap_or_else(|| Tier::auto(original_tokens));
            match safe_filter(system, tier) {
                Some(filtered) => (filtered, Some(tier.as_str()), true),
                None => {
                    warn!(tier = tier.as_str(), "safe filter failed validation, falling back to truncate");
                    (truncate_prompt(system, cfg), Some(tier.as_str()), false)
                }
            }
        }
        Strategy::Truncate => (truncate_prompt(system, cfg), None, true),
        Strategy::Safe | Strategy::Passthrough => (system.to_string(), None, true),
    };

    let final_tokens = est.count_text(&text);
    let reduction_percent = if original_tokens == 0 {
        0.0
    } else {
        (1.0 - final_tokens as f64 / original_tokens as f64) * 100.0
    };
    debug!(
        original_tokens,
        final_tokens,
        reduction = format!("{reduction_percent:.1}%"),
        "system prompt optimized"
    );

    OptimizeOutcome {
        text,
        stats: OptimizeStats {
            original_tokens,
            final_tokens,
            reduction_percent,
            applied_tier,
            validation_ok,
        },
    }
}

/// Safe strategy: drop sections by tier, then validate critical patterns.
/// Returns `None` when validation fails (caller falls back to truncate).
fn safe_filter(system: &str, tier: Tier) -> Option<String> {
    let sections = split_sections(system);
    let drop_level = tier.drop_level();
    let kept: Vec<&Section> = sections.iter().filter(|s| s.tier < drop_level).collect();
    let filtered = kept
        .iter()
        .map(|s| s.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    if validate_critical(system, &filtered) {
        Some(filtered)
    } else {
        None
    }
}

/// Every critical pattern present in the original must survive filtering.
fn validate_critical(original: &str, filtered: &str) -> bool {
    CRITICAL_PATTERNS
        .iter()
        .all(|p| !original.contains(p) || filtered.contains(p))
}

/// Truncate strategy: first [`TRUNCATE_HEAD_LINES`] lines plus any line
/// inside an important section, stopping at the char budget derived from
/// `system_prompt_max_tokens * 4`.
fn truncate_prompt(system: &str, cfg: &OptimizerConfig) -> String {
    let char_budget = cfg.system_prompt_max_tokens.saturating_mul(4);
    let mut out = String::new();
    let mut in_important = false;

    for (i, line) in system.lines().enumerate() {
        if let Some(heading) = heading_text(line) {
            let lowered = heading.to_lowercase();
            in_important = IMPORTANT_SECTION_HEADINGS
                .iter()
                .any(|h| lowered.contains(h));
        }
        if i < TRUNCATE_HEAD_LINES || in_important {
            if out.len() + line.len() + 1 > char_budget {
                break;
            }
            out.push_str(line);
            out.push('\n');
        }
    }

    if out.is_empty() {
        // Degenerate budget: keep at least the first line fragment.
        system.chars().take(char_budget.max(1)).collect()
    } else {
        out
    }
}

/// Smart strategy, layer 1: dedup repeated sentences into a template library.
fn dedup_sentences(text: &str) -> String {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for sentence in sentences(text) {
        if (DEDUP_MIN_LEN..=DEDUP_MAX_LEN).contains(&sentence.len()) {
            *counts.entry(sentence).or_insert(0) += 1;
        }
    }
    let mut templates: Vec<&str> = counts
        .iter()
        .filter(|(_, &c)| c >= DEDUP_MIN_OCCURRENCES)
        .map(|(&s, _)| s)
        .collect();
    if templates.is_empty() {
        return text.to_string();
    }
    templates.sort();

    let ids: HashMap<&str, usize> = templates
        .iter()
        .enumerate()
        .map(|(i, &s)| (s, i + 1))
        .collect();

    let mut seen: HashMap<&str, bool> = HashMap::new();
    let mut out = String::with_capacity(text.len());
    for sentence in sentences(text) {
        if let Some(&id) = ids.get(sentence) {
            if seen.insert(sentence, true).is_some() {
                out.push_str(&format!("[T{id}]"));
                out.push(' ');
                continue;
            }
        }
        out.push_str(sentence);
        out.push(' ');
    }

    out.push_str("\n\n## Template Library\n");
    for template in &templates {
        out.push_str(&format!("[T{}]: {}\n", ids[template], template));
    }
    out
}

/// Smart strategy, layer 2: regroup tool bullet lines under category headings
/// derived from the tool-name prefix (`fs_read` → `fs`).
fn hierarchical_tool_docs(text: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut bullets: Vec<(String, String)> = Vec::new();

    let flush = |bullets: &mut Vec<(String, String)>, out: &mut Vec<String>| {
        if bullets.len() < 4 {
            // Too few to be worth restructuring.
            for (_, line) in bullets.drain(..) {
                out.push(line);
            }
            return;
        }
        let mut by_category: HashMap<String, Vec<String>> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for (name, line) in bullets.drain(..) {
            let category = name.split('_').next().unwrap_or(&name).to_string();
            if !by_category.contains_key(&category) {
                order.push(category.clone());
            }
            by_category.entry(category).or_default().push(line);
        }
        for category in order {
            out.push(format!("### {category} tools"));
            for line in &by_category[&category] {
                out.push(line.clone());
            }
        }
    };

    for line in text.lines() {
        if let Some(name) = tool_bullet_name(line) {
            bullets.push((name, line.to_string()));
        } else {
            flush(&mut bullets, &mut out);
            out.push(line.to_string());
        }
    }
    flush(&mut bullets, &mut out);
    out.join("\n")
}

/// Smart strategy, layer 3 inside [`optimize`]: clamp to the token budget.
fn smart_optimize(system: &str, cfg: &OptimizerConfig, est: &TokenEstimator) -> String {
    let deduped = dedup_sentences(system);
    let restructured = hierarchical_tool_docs(&deduped);
    if est.count_text(&restructured) as usize <= cfg.system_prompt_max_tokens {
        restructured
    } else {
        let char_budget = cfg.system_prompt_max_tokens.saturating_mul(4);
        restructured.chars().take(char_budget).collect()
    }
}

fn heading_text(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    trimmed
        .strip_prefix('#')
        .map(|rest| rest.trim_start_matches('#').trim())
        .filter(|t| !t.is_empty())
}

/// `- tool_name: description` bullet detection for the tool-docs layer.
fn tool_bullet_name(line: &str) -> Option<String> {
    let rest = line.trim_start().strip_prefix("- ")?;
    let (name, _) = rest.split_once(':')?;
    let name = name.trim();
    if !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        Some(name.to_string())
    } else {
        None
    }
}

fn sentences(text: &str) -> impl Iterator<Item = &str> {
    text.split_inclusive(['.', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
}
