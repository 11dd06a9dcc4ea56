//! Tool schema bridge: Anthropic tool definitions → OpenAI function specs.
//!
//! Per-provider schema normalization is table-driven and pure. Tools are
//! sorted by name so fingerprints are deterministic, server-side tools
//! (dated-suffix names like `web_search_20250305`) are filtered before
//! non-Anthropic backends, and the last non-empty tools array is cached so a
//! caller that omits tools on a later turn still gets them restored. Long
//! descriptions can be stubbed, with the full text persisted to the skill
//! store and re-injected on demand.

mod normalize;
mod skills;

pub use normalize::{normalizer_for, SchemaNormalizer};
pub use skills::{SkillStore, SKILL_INJECTION_BUDGET};

use crate::anthropic::ToolDefinition;
use crate::error::ProxyError;
use crate::openai::{FunctionSpec, ToolSpec};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Descriptions longer than this get stubbed when stubbing is enabled.
const STUB_THRESHOLD: usize = 200;

/// Bridge knobs resolved from per-backend config.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// Provider key for schema normalization ("openai", "openrouter", "mlx").
    pub provider: String,
    pub stub_descriptions: bool,
    pub inject_skills: bool,
}

/// The translated tool set for one request.
#[derive(Debug)]
pub struct PreparedTools {
    /// OpenAI-shaped tools, sorted by name.
    pub tools: Vec<ToolSpec>,
    /// Canonical (sorted, filtered) definitions; fingerprint input.
    pub canonical: Vec<ToolDefinition>,
    /// A server-side web-search tool was requested this turn (or earlier).
    pub web_search_requested: bool,
    /// Skill sections to append to the system prompt, budgeted to 5 KB.
    pub skill_injection: Option<String>,
}

/// The bridge. One instance per process; internally synchronised.
pub struct ToolBridge {
    config: BridgeConfig,
    skills: Option<Arc<SkillStore>>,
    last_tools: Mutex<Vec<ToolDefinition>>,
    web_search_seen: AtomicBool,
}

static SERVER_TOOL_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"_20\d{6}$").expect("server tool suffix regex"));

impl ToolBridge {
    pub fn new(config: BridgeConfig, skills: Option<Arc<SkillStore>>) -> Self {
        Self {
            config,
            skills,
            last_tools: Mutex::new(Vec::new()),
            web_search_seen: AtomicBool::new(false),
        }
    }

    /// Whether any earlier turn requested a server-side web search.
    pub fn web_search_requested(&self) -> bool {
        self.web_search_seen.load(Ordering::Relaxed)
    }

    /// Translates the request's tools for the backend.
    ///
    /// `previous_tool_names` are tools called in the previous assistant turn
    /// and `latest_user_text` drives keyword triggers; both feed skill
    /// selection.
    pub fn prepare(
        &self,
        request_tools: Option<&[ToolDefinition]>,
        previous_tool_names: &[String],
        latest_user_text: &str,
    ) -> Result<PreparedTools, ProxyError> {
        // Callers cache tools client-side and may omit them on later turns;
        // restore the last non-empty array in that case.
        let tools: Vec<ToolDefinition> = match request_tools {
            Some(tools) if !tools.is_empty() => {
                let mut cache = self.lock_last_tools();
                *cache = tools.to_vec();
                tools.to_vec()
            }
            _ => self.lock_last_tools().clone(),
        };

        let mut seen: HashSet<&str> = HashSet::new();
        for tool in &tools {
            if !seen.insert(tool.name.as_str()) {
                return Err(ProxyError::BadRequest(format!(
                    "duplicate tool name: {}",
                    tool.name
                )));
            }
        }

        let mut web_search_requested = self.web_search_seen.load(Ordering::Relaxed);
        let mut canonical: Vec<ToolDefinition> = Vec::with_capacity(tools.len());
        for tool in tools {
            if tool.name.starts_with("web_search") {
                web_search_requested = true;
                self.web_search_seen.store(true, Ordering::Relaxed);
            }
            if is_server_side_tool(&tool.name) {
                debug!(tool = %tool.name, "filtering server-side tool before backend");
                continue;
            }
            canonical.push(tool);
        }
        canonical.sort_by(|a, b| a.name.cmp(&b.name));

        let normalizer = normalizer_for(&self.config.provider);
        let mut specs: Vec<ToolSpec> = Vec::with_capacity(canonical.len());
        for tool in &canonical {
            let mut schema = tool.input_schema.clone();
            normalizer.normalize(&mut schema);

            let description = match &tool.description {
                Some(d) if self.config.stub_descriptions && d.len() > STUB_THRESHOLD => {
                    if let Some(skills) = &self.skills {
                        skills.put_background(tool.name.clone(), d.clone());
                    }
                    Some(stub_description(&tool.name, d))
                }
                Some(d) => Some(normalizer.cap_description(d)),
                None => None,
            };

            specs.push(ToolSpec {
                kind: "function".into(),
                function: FunctionSpec {
                    name: tool.name.clone(),
                    description,
                    parameters: schema,
                },
            });
        }

        let skill_injection = if self.config.inject_skills {
            self.skills
                .as_ref()
                .and_then(|s| s.select(previous_tool_names, latest_user_text))
        } else {
            None
        };

        Ok(PreparedTools {
            tools: specs,
            canonical,
            web_search_requested,
            skill_injection,
        })
    }

    fn lock_last_tools(&self) -> std::sync::MutexGuard<'_, Vec<ToolDefinition>> {
        match self.last_tools.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Server-side tools carry a dated version suffix (`…_20250305`).
pub fn is_server_side_tool(name: &str) -> bool {
    SERVER_TOOL_SUFFIX.is_match(name)
}

/// Short fixed stub replacing a long description; the full body lives in the
/// skill store.
fn stub_description(name: &str, full: &str) -> String {
    let first_line = full.lines().next().unwrap_or("");
    let head: String = first_line.chars().take(120).collect();
    format!("{head} (full usage notes for {name} are injected on demand)")
}
