//! HTTP proxy surface for anyclaude (axum).
//!
//! Routes: `POST /v1/messages` (the translating handler), the admin
//! endpoints (`/health/live`, `/health/ready`, `/v1/metrics`,
//! `/v1/circuit-breaker/metrics`), and a pass-through fallback that relays
//! everything else to the upstream Anthropic API in anthropic mode.
//!
//! **Public API**: [`run_serve`], [`run_serve_on_listener`],
//! [`build_services`], [`Services`].

mod admin;
mod app;
mod messages;
mod metrics;
mod passthrough;
mod streaming;

pub use app::{build_services, build_services_with_paths, AppState, Services};
pub use metrics::Metrics;

use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8787";

/// Runs the proxy on an existing listener. Used by tests (bind to
/// `127.0.0.1:0`, then pass the listener). Returns when `shutdown` fires and
/// in-flight connections have drained.
pub async fn run_serve_on_listener(
    listener: TcpListener,
    services: Arc<Services>,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = listener.local_addr()?;
    info!(mode = %services.config.mode, "anyclaude proxy listening on http://{}", addr);

    let state = Arc::new(AppState { services });
    let app = app::router(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
        })
        .await?;
    Ok(())
}

/// Runs the proxy. Listens on `addr` (default `127.0.0.1:8787`).
pub async fn run_serve(
    addr: Option<&str>,
    services: Arc<Services>,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = addr.unwrap_or(DEFAULT_LISTEN_ADDR);
    let listener = TcpListener::bind(addr).await?;
    run_serve_on_listener(listener, services, shutdown).await
}
