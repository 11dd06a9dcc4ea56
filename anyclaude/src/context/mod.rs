//! Approximate token counting and context-window management.
//!
//! Counting uses the `o200k_base` BPE when it can be built, else the
//! `ceil(len/4)` heuristic; both are approximations. Limits come from a substring table
//! over model names, with env and backend-reported overrides, and a 0.8
//! headroom factor on top.

use crate::translate::{Block, NeutralMessage};
use once_cell::sync::Lazy;
use thiserror::Error;
use tiktoken_rs::CoreBPE;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("context too large: fixed overhead {overhead} tokens exceeds usable limit {limit}")]
    ContextTooLarge { overhead: u64, limit: u64 },
}

static BPE: Lazy<Option<CoreBPE>> = Lazy::new(|| tiktoken_rs::o200k_base().ok());

/// Approximate token counter. Stateless; cheap to construct anywhere.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokenEstimator;

impl TokenEstimator {
    pub fn count_text(&self, text: &str) -> u64 {
        match BPE.as_ref() {
            Some(bpe) => bpe.encode_with_special_tokens(text).len() as u64,
            None => text.len().div_ceil(4) as u64,
        }
    }

    /// Counts one neutral message: role overhead plus every block's content.
    pub fn count_message(&self, message: &NeutralMessage) -> u64 {
        // Small per-message framing overhead, in line with chat templates.
        let mut total = 4u64;
        for block in &message.blocks {
            total += match block {
                Block::Text(t) => self.count_text(t),
                Block::ToolCall { name, input, .. } => {
                    self.count_text(name) + self.count_text(&input.to_string())
                }
                Block::ToolResult { content, .. } => self.count_text(content),
                // Images are opaque to the counter; charge a flat cost.
                Block::Image { .. } => 1_000,
            };
        }
        total
    }

    /// Counts the serialized tools array.
    pub fn count_tools_json(&self, tools_json: &str) -> u64 {
        self.count_text(tools_json)
    }
}

/// Model-name substrings (matched case-insensitively) to native context
/// windows. First match wins; order longest-prefix-ish on purpose.
static MODEL_CONTEXT_TABLE: &[(&str, u64)] = &[
    ("claude", 200_000),
    ("gpt-4.1", 1_047_576),
    ("gpt-4o", 128_000),
    ("o3", 200_000),
    ("o4-mini", 200_000),
    ("llama", 131_072),
    ("qwen", 32_768),
    ("mixtral", 32_768),
    ("mistral", 32_768),
    ("deepseek", 65_536),
    ("glm", 131_072),
    ("gemma", 8_192),
];

const DEFAULT_CONTEXT: u64 = 32_768;
const CONTEXT_HEADROOM: f64 = 0.8;

/// Resolves the native context window for a model.
///
/// Precedence: env override (`ANYCLAUDE_CONTEXT_LENGTH` or
/// `<MODEL>_CONTEXT_LENGTH` with the model name uppercased and
/// non-alphanumerics mapped to `_`) > backend-reported length > substring
/// table > conservative default.
pub fn native_context_limit(model: &str, reported: Option<u64>) -> u64 {
    if let Some(v) = env_context_override(model) {
        return v;
    }
    if let Some(v) = reported {
        if v > 0 {
            return v;
        }
    }
    let lowered = model.to_lowercase();
    for (needle, limit) in MODEL_CONTEXT_TABLE {
        if lowered.contains(needle) {
            return *limit;
        }
    }
    DEFAULT_CONTEXT
}

/// Usable limit: `floor(native * 0.8)` to leave headroom for the reply.
pub fn usable_context_limit(native: u64) -> u64 {
    (native as f64 * CONTEXT_HEADROOM).floor() as u64
}

fn env_context_override(model: &str) -> Option<u64> {
    let model_key: String = model
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    for key in [format!("{model_key}_CONTEXT_LENGTH"), "ANYCLAUDE_CONTEXT_LENGTH".to_string()] {
        if let Ok(v) = std::env::var(&key) {
            if let Ok(parsed) = v.trim().parse::<u64>() {
                if parsed > 0 {
                    return Some(parsed);
                }
            }
        }
    }
    None
}

/// Result of a truncation pass.
#[derive(Debug)]
pub struct TruncationOutcome {
    pub messages: Vec<NeutralMessage>,
    /// Messages dropped from the front of history.
    pub removed: usize,
}

/// Minimum number of most-recent messages kept unconditionally.
const KEEP_RECENT: usize = 3;

/// Truncates history so `overhead + kept messages` fits `usable_limit`.
///
/// System prompt and tools are fixed overhead and always survive. The 3 most
/// recent messages are kept unconditionally; older messages are walked
/// newest-first and admitted only while they fit. Errors when the fixed
/// overhead alone exceeds the limit.
pub fn truncate_messages(
    messages: Vec<NeutralMessage>,
    overhead_tokens: u64,
    usable_limit: u64,
    cost: impl Fn(&NeutralMessage) -> u64,
) -> Result<TruncationOutcome, ContextError> {
    if overhead_tokens > usable_limit {
        return Err(ContextError::ContextTooLarge {
            overhead: overhead_tokens,
            limit: usable_limit,
        });
    }

    let total: u64 = overhead_tokens + messages.iter().map(&cost).sum::<u64>();
    if total <= usable_limit {
        return Ok(TruncationOutcome {
            messages,
            removed: 0,
        });
    }

    let split = messages.len().saturating_sub(KEEP_RECENT);
    let recent_cost: u64 = messages[split..].iter().map(&cost).sum();
    let mut budget = (usable_limit - overhead_tokens).saturating_sub(recent_cost);

    // Walk older messages newest-first, admitting each only if it fits.
    let mut keep_older_rev: Vec<NeutralMessage> = Vec::new();
    let mut removed = 0usize;
    let mut older: Vec<NeutralMessage> = messages[..split].to_vec();
    let recent: Vec<NeutralMessage> = messages[split..].to_vec();
    while let Some(msg) = older.pop() {
        let c = cost(&msg);
        if c <= budget {
            budget -= c;
            keep_older_rev.push(msg);
        } else {
            removed += 1;
        }
    }

    let mut kept: Vec<NeutralMessage> = keep_older_rev.into_iter().rev().collect();
    kept.extend(recent);

    Ok(TruncationOutcome {
        messages: kept,
        removed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::Role;

    fn msg(text: &str) -> NeutralMessage {
        NeutralMessage::text(Role::User, text)
    }

    // Cost function used by tests: the leading number in the text.
    fn marker_cost(m: &NeutralMessage) -> u64 {
        match &m.blocks[0] {
            Block::Text(t) => t.split(':').next().unwrap().parse().unwrap(),
            _ => 0,
        }
    }

    /// **Scenario**: oversized history keeps the 3 most recent
    /// unconditionally; each 10k older message overflows and is removed.
    #[test]
    fn keeps_three_recent_drops_oversized_older() {
        // usable 26_214, overhead 5_000, recent 3 total 8_000, older 10k each
        let mut messages = Vec::new();
        for i in 0..19 {
            messages.push(msg(&format!("10000:older-{i}")));
        }
        messages.push(msg("3000:recent-a"));
        messages.push(msg("3000:recent-b"));
        messages.push(msg("2000:recent-c"));

        let out = truncate_messages(messages, 5_000, 26_214, marker_cost).unwrap();
        assert_eq!(out.removed, 19);
        assert_eq!(out.messages.len(), 3);
        assert!(matches!(
            &out.messages[0].blocks[0],
            Block::Text(t) if t.contains("recent-a")
        ));
    }

    /// **Scenario**: older messages that fit are admitted newest-first.
    #[test]
    fn admits_older_messages_that_fit() {
        let messages = vec![
            msg("100:old-big"),
            msg("10:old-small"),
            msg("5:r1"),
            msg("5:r2"),
            msg("5:r3"),
        ];
        // budget after overhead+recent: 40 - 0 - 15 = 25 → old-small fits, old-big not
        let out = truncate_messages(messages, 0, 40, marker_cost).unwrap();
        assert_eq!(out.removed, 1);
        assert_eq!(out.messages.len(), 4);
        assert!(matches!(
            &out.messages[0].blocks[0],
            Block::Text(t) if t.contains("old-small")
        ));
    }

    /// **Scenario**: nothing to do when everything fits.
    #[test]
    fn no_op_when_under_limit() {
        let messages = vec![msg("5:a"), msg("5:b")];
        let out = truncate_messages(messages.clone(), 10, 100, marker_cost).unwrap();
        assert_eq!(out.removed, 0);
        assert_eq!(out.messages, messages);
    }

    /// **Scenario**: fixed overhead over the limit is a hard error.
    #[test]
    fn overhead_over_limit_errors() {
        let err = truncate_messages(vec![msg("5:a")], 200, 100, marker_cost).unwrap_err();
        assert!(matches!(
            err,
            ContextError::ContextTooLarge {
                overhead: 200,
                limit: 100
            }
        ));
    }

    /// **Scenario**: a non-empty input never truncates to empty (the recent
    /// tail is unconditional even when it overflows).
    #[test]
    fn recent_tail_survives_even_if_over() {
        let messages = vec![msg("500:a"), msg("500:b")];
        let out = truncate_messages(messages, 0, 100, marker_cost).unwrap();
        assert_eq!(out.messages.len(), 2);
        assert_eq!(out.removed, 0);
    }

    #[test]
    fn limit_table_and_default() {
        assert_eq!(native_context_limit("claude-sonnet-4", None), 200_000);
        assert_eq!(native_context_limit("Meta-Llama-3.1-8B", None), 131_072);
        assert_eq!(native_context_limit("totally-unknown", None), 32_768);
        // backend-reported beats the table
        assert_eq!(native_context_limit("qwen-2.5", Some(65_536)), 65_536);
    }

    #[test]
    fn env_override_beats_reported() {
        std::env::set_var("CTX_TEST_MODEL_CONTEXT_LENGTH", "12345");
        assert_eq!(native_context_limit("ctx-test.model", Some(99)), 12_345);
        std::env::remove_var("CTX_TEST_MODEL_CONTEXT_LENGTH");
    }

    #[test]
    fn usable_limit_applies_headroom() {
        assert_eq!(usable_context_limit(32_768), 26_214);
        assert_eq!(usable_context_limit(0), 0);
    }

    #[test]
    fn estimator_counts_are_positive_and_monotonic() {
        let est = TokenEstimator;
        let short = est.count_text("hello world");
        let long = est.count_text(&"hello world ".repeat(100));
        assert!(short > 0);
        assert!(long > short);
    }
}
