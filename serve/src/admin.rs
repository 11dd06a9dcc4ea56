//! Admin endpoints: liveness, readiness, Prometheus metrics, breaker snapshot.

use crate::app::AppState;
use anyclaude::BreakerState;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::sync::Arc;

/// `GET /health/live` → always 200 while the process runs.
pub(crate) async fn live() -> Response {
    Json(json!({ "status": "alive" })).into_response()
}

/// `GET /health/ready` → 200 when the breaker is not OPEN (and, in cluster
/// mode, a healthy node exists); otherwise 503 with the reason.
pub(crate) async fn ready(State(state): State<Arc<AppState>>) -> Response {
    let services = &state.services;
    let breaker = services.breaker.metrics();

    if breaker.state == BreakerState::Open {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "breaker_state": breaker.state.as_str(),
                "failure_count": breaker.failure_count,
            })),
        )
            .into_response();
    }
    if let Some(cluster) = &services.cluster {
        if !cluster.has_healthy_node() {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "not_ready",
                    "reason": "no healthy cluster node",
                })),
            )
                .into_response();
        }
    }
    Json(json!({ "status": "ready" })).into_response()
}

/// `GET /v1/metrics` → Prometheus text format.
pub(crate) async fn prometheus_metrics(State(state): State<Arc<AppState>>) -> Response {
    let services = &state.services;
    let text = services.metrics.render(services);
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        text,
    )
        .into_response()
}

/// `GET /v1/circuit-breaker/metrics` → JSON snapshot.
pub(crate) async fn breaker_metrics(State(state): State<Arc<AppState>>) -> Response {
    Json(state.services.breaker.metrics()).into_response()
}
