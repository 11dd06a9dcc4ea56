//! Prompt fingerprints: sha-256 over the canonicalised `(system, tools)` pair.
//!
//! The fingerprint keys the cache monitor ledger and drives cache-affinity
//! routing, so it must be a pure function of its inputs: tools are sorted by
//! name before hashing so request-side tool order never changes the result.

use crate::anthropic::ToolDefinition;
use sha2::{Digest, Sha256};

/// Computes the fingerprint for a request's system prompt and tool set.
pub fn prompt_fingerprint(system: Option<&str>, tools: &[ToolDefinition]) -> String {
    let mut sorted: Vec<&ToolDefinition> = tools.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let canonical = serde_json::json!({
        "system": system.unwrap_or(""),
        "tools": sorted
            .iter()
            .map(|t| serde_json::json!({
                "name": t.name,
                "input_schema": t.input_schema,
            }))
            .collect::<Vec<_>>(),
    });

    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    hex(&hasher.finalize())
}

/// Short content hash used to key skill files: `sha256(text)[..12]`.
pub fn short_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let full = hex(&hasher.finalize());
    full[..12].to_string()
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.to_string(),
            description: Some(format!("{name} tool")),
            input_schema: json!({"type": "object"}),
        }
    }

    /// **Scenario**: identical inputs in any tool order yield identical
    /// fingerprints; different inputs yield different ones.
    #[test]
    fn fingerprint_is_order_insensitive_and_pure() {
        let ab = prompt_fingerprint(Some("sys"), &[tool("a"), tool("b")]);
        let ba = prompt_fingerprint(Some("sys"), &[tool("b"), tool("a")]);
        assert_eq!(ab, ba);
        assert_eq!(ab, prompt_fingerprint(Some("sys"), &[tool("a"), tool("b")]));

        let other_system = prompt_fingerprint(Some("sys2"), &[tool("a"), tool("b")]);
        assert_ne!(ab, other_system);
        let other_tools = prompt_fingerprint(Some("sys"), &[tool("a")]);
        assert_ne!(ab, other_tools);
    }

    /// **Scenario**: description changes do not move the fingerprint (only
    /// name + schema are canonical), so stubbing descriptions keeps affinity.
    #[test]
    fn description_does_not_affect_fingerprint() {
        let mut t1 = tool("a");
        let mut t2 = tool("a");
        t1.description = Some("long description".into());
        t2.description = None;
        assert_eq!(
            prompt_fingerprint(None, &[t1]),
            prompt_fingerprint(None, &[t2])
        );
    }

    #[test]
    fn short_hash_is_12_hex_chars() {
        let h = short_hash("hello");
        assert_eq!(h.len(), 12);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(h, short_hash("hello"));
    }
}
