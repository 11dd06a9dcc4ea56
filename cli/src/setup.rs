//! `--check-setup` and `--test-model`: connectivity and round-trip probes.

use anyclaude::backend::{ChatBackend, HttpChatBackend};
use anyclaude::openai::{ChatCompletionRequest, ChatMessage, StreamOptions};
use config::{Mode, ProxyConfig};
use futures_util::StreamExt;
use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Probes `{base}/models` on the active backend. Exit code 0/1.
pub async fn check_setup(config: &ProxyConfig) -> i32 {
    let backend = config.active_backend();
    let url = format!("{}/models", probe_base(config, backend));
    let client = reqwest::Client::new();
    let mut request = client.get(&url).timeout(PROBE_TIMEOUT);
    if let Some(key) = &backend.api_key {
        request = match config.mode {
            Mode::Anthropic => request.header("x-api-key", key),
            _ => request.bearer_auth(key),
        };
    }

    match request.send().await {
        Ok(response) if response.status().is_success() => {
            println!("ok: {} answered {}", url, response.status());
            0
        }
        Ok(response) => {
            eprintln!("error: {} answered {}", url, response.status());
            1
        }
        Err(e) => {
            eprintln!("error: {url}: {e}");
            1
        }
    }
}

/// One tiny completion through the configured backend. For anthropic mode the
/// proxy is a pass-through, so the models probe is the meaningful check.
pub async fn test_model(config: &ProxyConfig) -> i32 {
    if config.mode == Mode::Anthropic {
        return check_setup(config).await;
    }

    let backend_config = config.active_backend();
    let Some(model) = backend_config.model.clone() else {
        eprintln!("error: no model configured for mode {}", config.mode);
        return 1;
    };
    let backend = HttpChatBackend::new(
        reqwest::Client::new(),
        probe_base(config, backend_config),
        backend_config.api_key.clone(),
        PROBE_TIMEOUT,
    );
    let request = ChatCompletionRequest {
        model: model.clone(),
        messages: vec![ChatMessage::text("user", "Reply with the single word: ok")],
        tools: None,
        max_completion_tokens: Some(8),
        temperature: Some(0.0),
        stream: true,
        stream_options: Some(StreamOptions { include_usage: true }),
        parallel_tool_calls: None,
        cache_prompt: None,
    };

    let mut stream = match backend.open_stream(&request).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: {e}");
            return 1;
        }
    };
    let mut reply = String::new();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(chunk) => {
                for choice in &chunk.choices {
                    if let Some(content) = &choice.delta.content {
                        reply.push_str(content);
                    }
                }
            }
            Err(e) => {
                eprintln!("error: {e}");
                return 1;
            }
        }
    }
    if reply.trim().is_empty() {
        eprintln!("error: {model} returned an empty completion");
        return 1;
    }
    println!("ok: {model} replied: {}", reply.trim());
    0
}

/// Base URL for probes, normalised to include `/v1`. The anthropic base URL
/// is a bare host; local/openrouter base URLs already carry `/v1`; cluster
/// mode probes the first configured node.
fn probe_base(config: &ProxyConfig, backend: &config::BackendConfig) -> String {
    if config.mode == Mode::MlxCluster {
        if let Some(node) = config.cluster.nodes.first() {
            return format!("{}/v1", node.url.trim_end_matches('/'));
        }
    }
    let base = backend.base_url.trim_end_matches('/');
    if config.mode == Mode::Anthropic {
        format!("{base}/v1")
    } else {
        base.to_string()
    }
}
