//! Read `~/.anyclaude/config.json` into an untyped-then-typed shape.
//!
//! Keys: `backend` (mode name), `debug`, `backends.{name}` with base URL,
//! API key, model and the cluster sub-config. A missing file is not an
//! error; a malformed one is.

use crate::{BackendConfig, ClusterConfig, ConfigError};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Raw config file contents before env overrides and mode resolution.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub backend: Option<String>,
    pub debug: Option<bool>,
    pub backends: HashMap<String, serde_json::Value>,
}

impl FileConfig {
    /// Typed view of `backends.{name}`, when present and well-formed.
    pub fn backend_config(&self, name: &str) -> Option<BackendConfig> {
        let raw = self.backends.get(name)?;
        serde_json::from_value(raw.clone()).ok()
    }

    /// Typed view of `backends.mlx-cluster`, when present.
    pub fn cluster_config(&self) -> Option<ClusterConfig> {
        let raw = self.backends.get("mlx-cluster")?;
        serde_json::from_value(raw.clone()).ok()
    }
}

/// Default config file location: `~/.anyclaude/config.json`.
pub fn default_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".anyclaude").join("config.json"))
}

/// Loads the config file from `path` (or the default location). A missing
/// file yields `FileConfig::default()`; unreadable or malformed JSON is an
/// error so typos do not silently fall back to defaults.
pub fn load_file(path: Option<&Path>) -> Result<FileConfig, ConfigError> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => match default_path() {
            Some(p) => p,
            None => return Ok(FileConfig::default()),
        },
    };
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    let text = std::fs::read_to_string(&path).map_err(ConfigError::Read)?;
    let cfg: FileConfig = serde_json::from_str(&text)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_file(Some(&dir.path().join("nope.json"))).unwrap();
        assert!(cfg.backend.is_none());
        assert!(cfg.backends.is_empty());
    }

    #[test]
    fn parses_backend_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "backend": "local",
                "debug": true,
                "backends": {
                    "local": {
                        "base_url": "http://127.0.0.1:9090/v1",
                        "model": "qwen3-30b",
                        "prompt": { "strategy": "safe" }
                    },
                    "mlx-cluster": {
                        "enabled": true,
                        "nodes": [{ "id": "m1", "url": "http://m1:8080" }],
                        "strategy": "cache-aware"
                    }
                }
            }"#,
        )
        .unwrap();

        let cfg = load_file(Some(&path)).unwrap();
        assert_eq!(cfg.backend.as_deref(), Some("local"));
        assert_eq!(cfg.debug, Some(true));

        let local = cfg.backend_config("local").unwrap();
        assert_eq!(local.base_url, "http://127.0.0.1:9090/v1");
        assert_eq!(local.model.as_deref(), Some("qwen3-30b"));
        assert_eq!(local.prompt.strategy.as_deref(), Some("safe"));

        let cluster = cfg.cluster_config().unwrap();
        assert!(cluster.enabled);
        assert_eq!(cluster.nodes.len(), 1);
        assert_eq!(cluster.nodes[0].id, "m1");
    }

    #[test]
    fn malformed_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ backend: local").unwrap();
        assert!(matches!(
            load_file(Some(&path)),
            Err(ConfigError::Parse(_))
        ));
    }
}
