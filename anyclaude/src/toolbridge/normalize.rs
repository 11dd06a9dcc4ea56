//! Per-provider JSON-Schema fixups.
//!
//! Each normalizer is a pure function on the schema tree: strip fields the
//! provider rejects, drop vendor extensions, cap description lengths. The
//! table keys on the provider name; unknown providers get the conservative
//! default.

use serde_json::Value;

/// Keys stripped from every level of the schema for all providers.
const ALWAYS_STRIP: &[&str] = &["examples", "$schema", "additionalProperties"];

/// One provider's normalization rules.
#[derive(Clone, Copy, Debug)]
pub struct SchemaNormalizer {
    pub description_cap: usize,
    /// Strip `format` values the provider does not understand.
    pub strip_format: bool,
}

/// Provider table; the name → normalizer mapping.
pub fn normalizer_for(provider: &str) -> SchemaNormalizer {
    match provider {
        "openai" => SchemaNormalizer {
            description_cap: 1_024,
            strip_format: false,
        },
        "openrouter" => SchemaNormalizer {
            description_cap: 1_024,
            strip_format: false,
        },
        // Local inference servers choke on the most schema surface.
        "mlx" | "local" => SchemaNormalizer {
            description_cap: 512,
            strip_format: true,
        },
        _ => SchemaNormalizer {
            description_cap: 512,
            strip_format: true,
        },
    }
}

impl SchemaNormalizer {
    /// Normalizes a schema tree in place.
    pub fn normalize(&self, schema: &mut Value) {
        match schema {
            Value::Object(map) => {
                map.retain(|key, _| !ALWAYS_STRIP.contains(&key.as_str()) && !key.starts_with("x-"));
                if self.strip_format {
                    map.remove("format");
                }
                if let Some(Value::String(desc)) = map.get_mut("description") {
                    if desc.chars().count() > self.description_cap {
                        *desc = desc.chars().take(self.description_cap).collect();
                    }
                }
                for value in map.values_mut() {
                    self.normalize(value);
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.normalize(item);
                }
            }
            _ => {}
        }
    }

    /// Caps a top-level tool description to the provider limit.
    pub fn cap_description(&self, description: &str) -> String {
        if description.chars().count() > self.description_cap {
            description.chars().take(self.description_cap).collect()
        } else {
            description.to_string()
        }
    }
}
