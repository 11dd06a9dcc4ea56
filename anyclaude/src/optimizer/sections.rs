//! Section splitting and tier classification for the safe strategy.
//!
//! A section is a heading line plus everything until the next heading; text
//! before the first heading forms a preamble section. Tiers: 0 critical,
//! 1 important, 2 optional, 3 droppable.

/// One classified section of the system prompt.
#[derive(Clone, Debug)]
pub struct Section {
    pub heading: Option<String>,
    pub text: String,
    pub tier: u8,
}

/// Heading keywords per tier; unknown headings default to tier 2.
const TIER0_KEYWORDS: &[&str] = &["tool", "security", "safety", "identity"];
const TIER1_KEYWORDS: &[&str] = &["instruction", "guideline", "policy", "output", "format"];
const TIER2_KEYWORDS: &[&str] = &["example", "style", "tone", "context"];
const TIER3_KEYWORDS: &[&str] = &["changelog", "notes", "misc", "deprecated", "history"];

pub fn split_sections(text: &str) -> Vec<Section> {
    let mut sections: Vec<Section> = Vec::new();
    let mut current_heading: Option<String> = None;
    let mut current_lines: Vec<&str> = Vec::new();

    let flush = |heading: Option<String>, lines: &mut Vec<&str>, out: &mut Vec<Section>| {
        if lines.is_empty() && heading.is_none() {
            return;
        }
        let tier = classify(heading.as_deref());
        out.push(Section {
            heading,
            text: lines.join("\n"),
            tier,
        });
        lines.clear();
    };

    for line in text.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with('#') {
            flush(current_heading.take(), &mut current_lines, &mut sections);
            current_heading = Some(trimmed.trim_start_matches('#').trim().to_string());
        }
        current_lines.push(line);
    }
    flush(current_heading.take(), &mut current_lines, &mut sections);
    sections
}

/// Classifies a heading (or the preamble) into a tier.
///
/// The preamble (no heading) is critical: it usually carries identity and
/// role instructions.
fn classify(heading: Option<&str>) -> u8 {
    let Some(heading) = heading else {
        return 0;
    };
    let lowered = heading.to_lowercase();
    if TIER0_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        0
    } else if TIER1_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        1
    } else if TIER3_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        3
    } else if TIER2_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        2
    } else {
        2
    }
}
