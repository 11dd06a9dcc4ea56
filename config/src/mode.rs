//! Backend mode: which family of backends the proxy dispatches to.

use crate::ConfigError;
use serde::{Deserialize, Serialize};

/// Backend mode. `local` is any OpenAI-compatible single endpoint;
/// `mlx-cluster` is the horizontally scaled variant with cache-affinity
/// routing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    Anthropic,
    Local,
    #[serde(rename = "openrouter")]
    OpenRouter,
    MlxCluster,
}

impl Mode {
    /// Stable label used in CLI output, logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Anthropic => "anthropic",
            Mode::Local => "local",
            Mode::OpenRouter => "openrouter",
            Mode::MlxCluster => "mlx-cluster",
        }
    }

    /// True for backends that speak OpenAI `chat/completions`.
    pub fn is_openai_style(&self) -> bool {
        !matches!(self, Mode::Anthropic)
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "anthropic" => Ok(Mode::Anthropic),
            "local" => Ok(Mode::Local),
            "openrouter" => Ok(Mode::OpenRouter),
            "mlx-cluster" | "mlx_cluster" | "cluster" => Ok(Mode::MlxCluster),
            other => Err(ConfigError::UnknownMode(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_all_modes() {
        assert_eq!("anthropic".parse::<Mode>().unwrap(), Mode::Anthropic);
        assert_eq!("local".parse::<Mode>().unwrap(), Mode::Local);
        assert_eq!("OPENROUTER".parse::<Mode>().unwrap(), Mode::OpenRouter);
        assert_eq!("mlx-cluster".parse::<Mode>().unwrap(), Mode::MlxCluster);
        assert_eq!("cluster".parse::<Mode>().unwrap(), Mode::MlxCluster);
    }

    #[test]
    fn display_round_trips() {
        for m in [Mode::Anthropic, Mode::Local, Mode::OpenRouter, Mode::MlxCluster] {
            assert_eq!(m.to_string().parse::<Mode>().unwrap(), m);
        }
    }

    #[test]
    fn openai_style_split() {
        assert!(!Mode::Anthropic.is_openai_style());
        assert!(Mode::Local.is_openai_style());
        assert!(Mode::OpenRouter.is_openai_style());
        assert!(Mode::MlxCluster.is_openai_style());
    }
}
