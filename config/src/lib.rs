//! Load proxy configuration from `~/.anyclaude/config.json` and the process
//! environment, then resolve the backend mode with priority:
//! **CLI flag > env (`ANYCLAUDE_MODE`) > config file > default (`anthropic`)**.
//!
//! Everything is read once at startup; changing a knob requires a restart.

mod file;
mod mode;

pub use file::{load_file, FileConfig};
pub use mode::Mode;

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("read config file: {0}")]
    Read(std::io::Error),
    #[error("parse config json: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unknown mode: {0} (use anthropic, local, openrouter, or mlx-cluster)")]
    UnknownMode(String),
    #[error("invalid cluster node spec: {0}")]
    InvalidNodeSpec(String),
}

/// Fully-resolved proxy configuration: one mode, one backend table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub mode: Mode,
    pub debug: bool,
    pub anthropic: BackendConfig,
    pub local: BackendConfig,
    pub openrouter: BackendConfig,
    pub cluster: ClusterConfig,
}

impl ProxyConfig {
    /// The backend config for the resolved mode. Cluster mode shares the
    /// local backend's prompt knobs; node addressing lives in `cluster`.
    pub fn active_backend(&self) -> &BackendConfig {
        match self.mode {
            Mode::Anthropic => &self.anthropic,
            Mode::Local | Mode::MlxCluster => &self.local,
            Mode::OpenRouter => &self.openrouter,
        }
    }
}

/// One backend endpoint: base URL, credentials, model, prompt knobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: Option<String>,
    /// Native context length override; env `*_CONTEXT_LENGTH` wins over this.
    pub context_length: Option<u64>,
    pub prompt: PromptOptions,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: None,
            model: None,
            context_length: None,
            prompt: PromptOptions::default(),
        }
    }
}

/// System-prompt handling knobs, per backend.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptOptions {
    /// Optimizer strategy: "smart" | "safe" | "truncate" | "passthrough".
    pub strategy: Option<String>,
    /// When unset, the safe system filter auto-enables for local mode.
    pub safe_system_filter: Option<bool>,
    /// Token budget for the optimized system prompt.
    pub system_prompt_max_tokens: Option<usize>,
    /// Replace long tool descriptions with stubs backed by the skill store.
    pub stub_tool_descriptions: bool,
    /// Re-inject relevant skill sections into the system prompt.
    pub inject_tool_skills: bool,
}

/// Cluster sub-config: nodes, routing, discovery, health.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub enabled: bool,
    pub nodes: Vec<NodeSpec>,
    /// "round-robin" | "least-loaded" | "cache-aware" | "latency".
    pub strategy: String,
    pub discovery_interval_ms: u64,
    pub health: HealthOptions,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            nodes: Vec::new(),
            strategy: "cache-aware".to_string(),
            discovery_interval_ms: 30_000,
            health: HealthOptions::default(),
        }
    }
}

/// Health-loop knobs for cluster nodes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthOptions {
    pub check_interval_ms: u64,
    pub timeout_ms: u64,
    pub max_consecutive_failures: u32,
}

impl Default for HealthOptions {
    fn default() -> Self {
        Self {
            check_interval_ms: 10_000,
            timeout_ms: 2_000,
            max_consecutive_failures: 3,
        }
    }
}

/// A statically configured cluster node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    pub url: String,
}

const DEFAULT_ANTHROPIC_BASE: &str = "https://api.anthropic.com";
const DEFAULT_LOCAL_BASE: &str = "http://127.0.0.1:8080/v1";
const DEFAULT_OPENROUTER_BASE: &str = "https://openrouter.ai/api/v1";

/// Loads the config file (when present), applies env overrides, and resolves
/// the mode from `cli_mode` per the precedence chain.
///
/// `path` overrides the default `~/.anyclaude/config.json` location.
pub fn resolve(cli_mode: Option<Mode>, path: Option<&Path>) -> Result<ProxyConfig, ConfigError> {
    let file = load_file(path)?;
    let env_mode = std::env::var("ANYCLAUDE_MODE").ok();
    let mode = resolve_mode(cli_mode, env_mode.as_deref(), file.backend.as_deref())?;

    let debug = match std::env::var("ANYCLAUDE_DEBUG") {
        Ok(v) => is_truthy(&v),
        Err(_) => file.debug.unwrap_or(false),
    };

    let mut anthropic = file
        .backend_config("anthropic")
        .unwrap_or_default();
    if anthropic.base_url.is_empty() {
        anthropic.base_url = DEFAULT_ANTHROPIC_BASE.to_string();
    }
    apply_backend_env(&mut anthropic, "ANTHROPIC");

    let mut local = file.backend_config("local").unwrap_or_default();
    if local.base_url.is_empty() {
        local.base_url = DEFAULT_LOCAL_BASE.to_string();
    }
    apply_backend_env(&mut local, "LOCAL");

    let mut openrouter = file.backend_config("openrouter").unwrap_or_default();
    if openrouter.base_url.is_empty() {
        openrouter.base_url = DEFAULT_OPENROUTER_BASE.to_string();
    }
    apply_backend_env(&mut openrouter, "OPENROUTER");

    let mut cluster = file.cluster_config().unwrap_or_default();
    apply_cluster_env(&mut cluster)?;

    Ok(ProxyConfig {
        mode,
        debug,
        anthropic,
        local,
        openrouter,
        cluster,
    })
}

/// Pure precedence chain: flag > env > file > default.
pub fn resolve_mode(
    cli: Option<Mode>,
    env: Option<&str>,
    file: Option<&str>,
) -> Result<Mode, ConfigError> {
    if let Some(m) = cli {
        return Ok(m);
    }
    if let Some(s) = env {
        return s.parse();
    }
    if let Some(s) = file {
        return s.parse();
    }
    Ok(Mode::Anthropic)
}

fn apply_backend_env(backend: &mut BackendConfig, prefix: &str) {
    if let Ok(v) = std::env::var(format!("{prefix}_BASE_URL")) {
        if !v.is_empty() {
            backend.base_url = v;
        }
    }
    if let Ok(v) = std::env::var(format!("{prefix}_API_KEY")) {
        if !v.is_empty() {
            backend.api_key = Some(v);
        }
    }
    if let Ok(v) = std::env::var(format!("{prefix}_MODEL")) {
        if !v.is_empty() {
            backend.model = Some(v);
        }
    }
}

fn apply_cluster_env(cluster: &mut ClusterConfig) -> Result<(), ConfigError> {
    if let Ok(v) = std::env::var("MLX_CLUSTER_ENABLED") {
        cluster.enabled = is_truthy(&v);
    }
    if let Ok(v) = std::env::var("MLX_CLUSTER_STRATEGY") {
        if !v.is_empty() {
            cluster.strategy = v;
        }
    }
    if let Ok(v) = std::env::var("MLX_CLUSTER_HEALTH_INTERVAL") {
        if let Ok(ms) = v.parse::<u64>() {
            cluster.health.check_interval_ms = ms;
        }
    }
    if let Ok(v) = std::env::var("MLX_CLUSTER_NODES") {
        if !v.is_empty() {
            cluster.nodes = parse_node_list(&v)?;
        }
    }
    Ok(())
}

/// Parses `MLX_CLUSTER_NODES`: comma-separated `id=url` pairs or bare URLs
/// (bare URLs get ids `node-0`, `node-1`, …).
pub fn parse_node_list(raw: &str) -> Result<Vec<NodeSpec>, ConfigError> {
    let mut nodes = Vec::new();
    for (i, part) in raw.split(',').map(str::trim).enumerate() {
        if part.is_empty() {
            continue;
        }
        let spec = match part.split_once('=') {
            Some((id, url)) => {
                let (id, url) = (id.trim(), url.trim());
                if id.is_empty() || url.is_empty() {
                    return Err(ConfigError::InvalidNodeSpec(part.to_string()));
                }
                NodeSpec {
                    id: id.to_string(),
                    url: url.trim_end_matches('/').to_string(),
                }
            }
            None => {
                if !part.starts_with("http://") && !part.starts_with("https://") {
                    return Err(ConfigError::InvalidNodeSpec(part.to_string()));
                }
                NodeSpec {
                    id: format!("node-{i}"),
                    url: part.trim_end_matches('/').to_string(),
                }
            }
        };
        nodes.push(spec);
    }
    Ok(nodes)
}

fn is_truthy(v: &str) -> bool {
    matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes" | "on")
}
