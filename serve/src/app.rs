//! Axum app: service container, state, and router.
//!
//! Every long-lived collaborator (breaker, cluster router, cache monitor,
//! tool bridge) is constructed once in [`build_services`] and passed into
//! handlers through [`AppState`]; nothing hides in globals.

use crate::metrics::Metrics;
use anyclaude::{
    BreakerConfig, BridgeConfig, CacheMonitor, CircuitBreaker, ClusterRouter, SkillStore,
    TokenEstimator, ToolBridge,
};
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use config::{Mode, ProxyConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Maximum accepted request body: 10 MiB.
pub const MAX_REQUEST_BODY_SIZE: usize = 10 * 1024 * 1024;

/// How often the cache monitor flushes its ledger.
const MONITOR_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// All long-lived services for one proxy process.
pub struct Services {
    pub config: ProxyConfig,
    pub breaker: Arc<CircuitBreaker>,
    pub cluster: Option<Arc<ClusterRouter>>,
    pub monitor: Arc<CacheMonitor>,
    pub bridge: Arc<ToolBridge>,
    pub estimator: TokenEstimator,
    pub http: reqwest::Client,
    pub metrics: Metrics,
    shutdown: CancellationToken,
}

impl Services {
    /// Stops background loops (cluster discovery/health, monitor flush) and
    /// prints the cache report via the monitor's final flush.
    pub fn shutdown(&self) {
        if let Some(cluster) = &self.cluster {
            cluster.shutdown();
        }
        self.shutdown.cancel();
    }
}

/// Builds the service container for the resolved config and spawns the
/// background loops. Call once at startup.
pub fn build_services(config: ProxyConfig) -> Arc<Services> {
    build_services_with_paths(
        config,
        CacheMonitor::default_path(),
        SkillStore::default_dir(),
    )
}

/// [`build_services`] with explicit persistence locations (tests use temp
/// dirs; `None` disables the respective store).
pub fn build_services_with_paths(
    config: ProxyConfig,
    monitor_path: Option<std::path::PathBuf>,
    skills_dir: Option<std::path::PathBuf>,
) -> Arc<Services> {
    let shutdown = CancellationToken::new();
    let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default()));

    let monitor = Arc::new(CacheMonitor::open(monitor_path));
    monitor.spawn_flush_loop(MONITOR_FLUSH_INTERVAL, shutdown.clone());

    let backend = config.active_backend();
    let skills = skills_dir.map(|dir| Arc::new(SkillStore::open(dir)));
    let bridge = Arc::new(ToolBridge::new(
        BridgeConfig {
            provider: match config.mode {
                Mode::OpenRouter => "openrouter".to_string(),
                Mode::MlxCluster => "mlx".to_string(),
                _ => "local".to_string(),
            },
            stub_descriptions: backend.prompt.stub_tool_descriptions,
            inject_skills: backend.prompt.inject_tool_skills,
        },
        skills,
    ));

    let cluster = if config.mode == Mode::MlxCluster {
        let router = ClusterRouter::new(config.cluster.clone(), Default::default());
        router.spawn_loops();
        Some(router)
    } else {
        None
    };

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_default();

    Arc::new(Services {
        config,
        breaker,
        cluster,
        monitor,
        bridge,
        estimator: TokenEstimator,
        http,
        metrics: Metrics::new(),
        shutdown,
    })
}

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub services: Arc<Services>,
}

pub(crate) fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/messages", post(crate::messages::handle_messages))
        .route("/health/live", get(crate::admin::live))
        .route("/health/ready", get(crate::admin::ready))
        .route("/v1/metrics", get(crate::admin::prometheus_metrics))
        .route(
            "/v1/circuit-breaker/metrics",
            get(crate::admin::breaker_metrics),
        )
        .fallback(crate::passthrough::relay)
        // Slightly above the documented cap so the handler's own size check
        // answers with the Anthropic error shape instead of a bare 413.
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_SIZE + 1024))
        .with_state(state)
}
