//! Transparent relay to the upstream Anthropic API.
//!
//! In anthropic mode, `/v1/messages` and every unmatched route are relayed
//! verbatim: method, path, query, headers (minus `Host`) and body. The
//! response streams back without buffering, so SSE passes through untouched.

use crate::app::AppState;
use crate::messages::error_response;
use crate::Services;
use anyclaude::ProxyError;
use axum::body::Body;
use axum::extract::{Request, State};
use bytes::Bytes;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use config::Mode;
use std::sync::Arc;
use tracing::debug;

/// Fallback handler for unmatched routes.
pub(crate) async fn relay(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let services = state.services.clone();
    if services.config.mode != Mode::Anthropic {
        return (
            StatusCode::NOT_FOUND,
            [(header::CONTENT_TYPE, "application/json")],
            ProxyError::BadRequest("unknown route".to_string())
                .to_body()
                .to_string(),
        )
            .into_response();
    }

    let (parts, body) = request.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());
    let body = match axum::body::to_bytes(body, crate::app::MAX_REQUEST_BODY_SIZE).await {
        Ok(b) => b,
        Err(e) => {
            return error_response(&ProxyError::BadRequest(format!("unreadable body: {e}")))
        }
    };

    relay_request(
        &services,
        parts.method.as_str(),
        &path_and_query,
        &parts.headers,
        body,
    )
    .await
}

/// Relays one request to the configured Anthropic base URL and pipes the
/// response back, preserving streaming.
pub(crate) async fn relay_request(
    services: &Arc<Services>,
    method: &str,
    path_and_query: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Response {
    let base = services.config.anthropic.base_url.trim_end_matches('/');
    let url = format!("{base}{path_and_query}");
    debug!(method, url = %url, "relaying to upstream");

    let method = match reqwest::Method::from_bytes(method.as_bytes()) {
        Ok(m) => m,
        Err(_) => return error_response(&ProxyError::BadRequest("bad method".to_string())),
    };

    let mut builder = services.http.request(method, &url);
    for (name, value) in headers {
        if name == header::HOST || name == header::CONTENT_LENGTH {
            continue;
        }
        builder = builder.header(name, value);
    }
    if let Some(key) = &services.config.anthropic.api_key {
        if !headers.contains_key("x-api-key") {
            builder = builder.header("x-api-key", key);
        }
    }

    let upstream = match builder.body(body).send().await {
        Ok(r) => r,
        Err(e) => return error_response(&ProxyError::from_transport(&e)),
    };

    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = Response::builder().status(status);
    for (name, value) in upstream.headers() {
        if name == header::TRANSFER_ENCODING || name == header::CONNECTION {
            continue;
        }
        response = response.header(name, value);
    }
    response
        .body(Body::from_stream(upstream.bytes_stream()))
        .unwrap_or_else(|_| {
            error_response(&ProxyError::Internal("relay response build failed".into()))
        })
}
