//! `POST /v1/messages`: the translating request handler.
//!
//! Owns the per-request lifecycle: size cap, parse, mode dispatch, node
//! selection, context management, prompt optimization, tool translation,
//! backend call, and the streaming/non-streaming reply paths. Completion
//! feeds the circuit breaker, cluster router, and cache monitor.

use crate::app::{AppState, MAX_REQUEST_BODY_SIZE};
use crate::passthrough;
use crate::streaming;
use anyclaude::anthropic::MessagesRequest;
use anyclaude::backend::{new_message_id, ChatBackend, HttpChatBackend};
use anyclaude::openai::{ChatCompletionRequest, StreamOptions};
use anyclaude::translate::{self, Block, Role, TranslatedRequest};
use anyclaude::{
    context, optimizer, prompt_fingerprint, CacheUsage, ProxyError, SelectedNode,
    StreamTranslator, TranslatorOptions,
};
use axum::extract::State;
use bytes::Bytes;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use config::Mode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub(crate) async fn handle_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let services = state.services.clone();

    if let Some(err) = oversized(&headers, body.len()) {
        return error_response(&err);
    }
    let request: MessagesRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return error_response(&ProxyError::BadRequest(format!("invalid body: {e}"))),
    };

    if services.config.mode == Mode::Anthropic {
        return passthrough::relay_request(&services, "POST", "/v1/messages", &headers, body).await;
    }

    let model_label = request.model.clone();
    let streaming = request.stream;
    let started = Instant::now();
    match dispatch(&services, &headers, request).await {
        Ok(response) => {
            services
                .metrics
                .observe_request(services.config.mode.as_str(), &model_label, "ok", started);
            response
        }
        Err(err) => {
            warn!(error = %err, streaming, "request failed before streaming began");
            services.metrics.observe_request(
                services.config.mode.as_str(),
                &model_label,
                "error",
                started,
            );
            error_response(&err)
        }
    }
}

/// Everything after parse for OpenAI-style modes. Errors returned here are
/// pre-stream by construction: the streaming path only starts writing after
/// the backend stream opened successfully.
async fn dispatch(
    services: &Arc<crate::Services>,
    headers: &HeaderMap,
    request: MessagesRequest,
) -> Result<Response, ProxyError> {
    if !services.breaker.should_allow_request() {
        return Err(ProxyError::UpstreamUnavailable(
            "circuit breaker open".to_string(),
        ));
    }

    let translated =
        translate::to_neutral(&request).map_err(|e| ProxyError::BadRequest(e.to_string()))?;

    let prepared = services.bridge.prepare(
        request.tools.as_deref(),
        &previous_tool_names(&translated),
        &latest_user_text(&translated),
    )?;

    let fingerprint =
        prompt_fingerprint(translated.system.as_deref(), &prepared.canonical);

    // Cluster mode: pick a node before any token work so selection failures
    // stay cheap 503s.
    let node = match &services.cluster {
        Some(cluster) => Some(cluster.select_node(
            Some(&fingerprint),
            headers.get("x-session-id").and_then(|v| v.to_str().ok()),
        )?),
        None => None,
    };

    let backend_config = services.config.active_backend();
    let backend_model = backend_config
        .model
        .clone()
        .unwrap_or_else(|| request.model.clone());

    // Context management: system + tools are fixed overhead; history shrinks.
    let system_text = translated.system.clone().unwrap_or_default();
    let tools_json = serde_json::to_string(&prepared.canonical).unwrap_or_default();
    let overhead = services.estimator.count_text(&system_text)
        + services.estimator.count_tools_json(&tools_json);
    let native = context::native_context_limit(&backend_model, backend_config.context_length);
    let usable = context::usable_context_limit(native);
    let estimator = services.estimator;
    let truncation = context::truncate_messages(translated.messages.clone(), overhead, usable, |m| {
        estimator.count_message(m)
    })
    .map_err(|e| match e {
        context::ContextError::ContextTooLarge { overhead, limit } => {
            ProxyError::ContextTooLarge { overhead, limit }
        }
    })?;
    if truncation.removed > 0 {
        warn!(
            removed = truncation.removed,
            usable_limit = usable,
            model = %backend_model,
            "context limit exceeded, dropped oldest messages"
        );
    }
    let translated = TranslatedRequest {
        system: translated.system,
        messages: truncation.messages,
    };

    // System prompt: optimize, then append any skill sections.
    let prompt_options = &backend_config.prompt;
    let optimizer_config = optimizer::OptimizerConfig {
        strategy: prompt_options
            .strategy
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(optimizer::Strategy::Passthrough),
        safe_system_filter: prompt_options.safe_system_filter,
        tier: None,
        system_prompt_max_tokens: prompt_options.system_prompt_max_tokens.unwrap_or(8_192),
        mode_is_local: matches!(services.config.mode, Mode::Local | Mode::MlxCluster),
    };
    let optimized = optimizer::optimize(&system_text, &optimizer_config, &services.estimator);
    let mut final_system = optimized.text;
    if let Some(skills) = &prepared.skill_injection {
        final_system.push_str(skills);
    }

    let chat_request = ChatCompletionRequest {
        model: backend_model.clone(),
        messages: translate::to_openai_messages(&translated, Some(&final_system)),
        tools: (!prepared.tools.is_empty()).then(|| prepared.tools.clone()),
        max_completion_tokens: request.max_tokens,
        temperature: request.temperature,
        stream: true,
        stream_options: Some(StreamOptions { include_usage: true }),
        parallel_tool_calls: Some(false),
        cache_prompt: matches!(services.config.mode, Mode::Local | Mode::MlxCluster)
            .then_some(true),
    };

    let base_url = match &node {
        Some(n) => format!("{}/v1", n.url.trim_end_matches('/')),
        None => backend_config.base_url.clone(),
    };
    let backend = HttpChatBackend::new(
        services.http.clone(),
        base_url,
        backend_config.api_key.clone(),
        Duration::from_millis(services.breaker.config().request_timeout_ms),
    );

    let started = Instant::now();
    let stream = match backend.open_stream(&chat_request).await {
        Ok(s) => s,
        Err(e) => {
            record_failure(services, &node, &e);
            return Err(e);
        }
    };

    let translator = StreamTranslator::new(TranslatorOptions {
        message_id: new_message_id(),
        model: request.model.clone(),
        skip_first_message_start: request.stream,
        strip_web_search_calls: prepared.web_search_requested,
    });

    let ctx = RequestContext {
        node,
        fingerprint,
        system_prompt_len: system_text.len(),
        tool_count: prepared.canonical.len(),
        started,
    };

    if request.stream {
        Ok(streaming::sse_response(
            services.clone(),
            translator,
            stream,
            ctx,
        ))
    } else {
        non_streaming_reply(services, translator, stream, ctx, &request.model).await
    }
}

/// Per-request bookkeeping shared by both reply paths.
pub(crate) struct RequestContext {
    pub node: Option<SelectedNode>,
    pub fingerprint: String,
    pub system_prompt_len: usize,
    pub tool_count: usize,
    pub started: Instant,
}

/// Drains the whole backend stream into one Anthropic message.
async fn non_streaming_reply(
    services: &Arc<crate::Services>,
    mut translator: StreamTranslator,
    mut stream: anyclaude::ChunkStream,
    ctx: RequestContext,
    client_model: &str,
) -> Result<Response, ProxyError> {
    use futures_util::StreamExt;

    let mut events = Vec::new();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(chunk) => events.extend(translator.feed(&chunk)),
            Err(e) => {
                record_failure(services, &ctx.node, &e);
                return Err(e);
            }
        }
    }
    events.extend(translator.finish());

    let message = translate::assemble_message(&events, client_model);
    record_success(services, &ctx, &message.usage);

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        serde_json::to_string(&message).unwrap_or_default(),
    )
        .into_response())
}

pub(crate) fn record_success(
    services: &Arc<crate::Services>,
    ctx: &RequestContext,
    usage: &stream_event::Usage,
) {
    let latency_ms = ctx.started.elapsed().as_secs_f64() * 1_000.0;
    services.breaker.record_success();
    services.breaker.record_latency(latency_ms);

    if let (Some(cluster), Some(node)) = (&services.cluster, &ctx.node) {
        cluster.record_node_success(&node.id, latency_ms);
        cluster.update_node_cache(&node.id, &ctx.fingerprint, usage.input_tokens);
    }

    let cache_usage = if usage.cache_read_input_tokens > 0 || usage.cache_creation_input_tokens > 0
    {
        CacheUsage::Explicit {
            cache_read_tokens: usage.cache_read_input_tokens,
            cache_creation_tokens: usage.cache_creation_input_tokens,
        }
    } else {
        CacheUsage::Inferred {
            input_tokens: usage.input_tokens,
        }
    };
    services.monitor.record(
        &ctx.fingerprint,
        ctx.system_prompt_len,
        ctx.tool_count,
        cache_usage,
    );
    services.metrics.set_cache_hit_rate(services.monitor.hit_rate());
    info!(
        latency_ms = format!("{latency_ms:.0}"),
        input_tokens = usage.input_tokens,
        output_tokens = usage.output_tokens,
        "completed request"
    );
}

pub(crate) fn record_failure(
    services: &Arc<crate::Services>,
    node: &Option<SelectedNode>,
    error: &ProxyError,
) {
    services.breaker.record_failure();
    if let (Some(cluster), Some(node)) = (&services.cluster, node) {
        cluster.record_node_failure(&node.id, &error.to_string());
    }
}

/// Last user text in the conversation (skill keyword triggers).
fn latest_user_text(translated: &TranslatedRequest) -> String {
    translated
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| {
            m.blocks
                .iter()
                .filter_map(|b| match b {
                    Block::Text(t) => Some(t.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

/// Tool names called in the last assistant turn (skill selection).
fn previous_tool_names(translated: &TranslatedRequest) -> Vec<String> {
    translated
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant)
        .map(|m| {
            m.blocks
                .iter()
                .filter_map(|b| match b {
                    Block::ToolCall { name, .. } => Some(name.clone()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

fn oversized(headers: &HeaderMap, body_len: usize) -> Option<ProxyError> {
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    let size = declared.max(body_len as u64);
    (size > MAX_REQUEST_BODY_SIZE as u64).then(|| ProxyError::BodyTooLarge {
        size,
        limit: MAX_REQUEST_BODY_SIZE as u64,
    })
}

/// Pre-stream error representation: one JSON response, Anthropic error shape.
pub(crate) fn error_response(error: &ProxyError) -> Response {
    let status =
        StatusCode::from_u16(error.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        error.to_body().to_string(),
    )
        .into_response()
}
