//! Cluster router: node discovery, health tracking, and selection strategies
//! for a horizontally scaled set of OpenAI-compatible inference nodes.
//!
//! The router owns every [`NodeRecord`]; handlers only ever hold a
//! [`SelectedNode`] (id + url) for the duration of one request and report
//! back through [`ClusterRouter::record_node_success`] /
//! [`ClusterRouter::record_node_failure`]. Nodes are keyed by id, never by
//! pointer, which keeps the node↔breaker↔router relation acyclic.

mod loops;

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::error::ProxyError;
use config::ClusterConfig;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Exponential smoothing factor for error rate and response time.
const EMA_ALPHA: f64 = 0.3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Initializing,
    Healthy,
    Degraded,
    Unhealthy,
    Offline,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct NodeHealth {
    pub last_check_at_ms: u64,
    pub consecutive_failures: u32,
    pub avg_response_time_ms: f64,
    /// Exponentially smoothed failure rate in [0, 1].
    pub error_rate: f64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct NodeCacheState {
    pub tokens: u64,
    pub system_prompt_hash: Option<String>,
    pub last_updated_at_ms: u64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct NodeMetricsState {
    pub requests_in_flight: u32,
    pub total_requests: u64,
    pub cache_hit_rate: f64,
    pub avg_latency_ms: f64,
}

/// One cluster node. Exclusively owned by the router; mutated only by the
/// health loop and request-completion hooks.
#[derive(Clone, Debug, Serialize)]
pub struct NodeRecord {
    pub id: String,
    pub url: String,
    pub status: NodeStatus,
    pub health: NodeHealth,
    pub cache: NodeCacheState,
    pub metrics: NodeMetricsState,
}

impl NodeRecord {
    fn new(id: String, url: String) -> Self {
        Self {
            id,
            url,
            status: NodeStatus::Initializing,
            health: NodeHealth::default(),
            cache: NodeCacheState::default(),
            metrics: NodeMetricsState::default(),
        }
    }
}

/// Transient, non-owning handle to the selected node.
#[derive(Clone, Debug)]
pub struct SelectedNode {
    pub id: String,
    pub url: String,
}

/// Node selection strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoutingStrategy {
    RoundRobin,
    LeastLoaded,
    CacheAware,
    LatencyBased,
}

impl std::str::FromStr for RoutingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "round-robin" | "round_robin" => Ok(RoutingStrategy::RoundRobin),
            "least-loaded" | "least_loaded" => Ok(RoutingStrategy::LeastLoaded),
            "cache-aware" | "cache_aware" => Ok(RoutingStrategy::CacheAware),
            "latency" | "latency-based" => Ok(RoutingStrategy::LatencyBased),
            other => Err(format!("unknown routing strategy: {other}")),
        }
    }
}

/// Lifecycle callbacks. Errors (panics) inside a callback are contained and
/// never corrupt router state.
#[derive(Default)]
pub struct ClusterCallbacks {
    pub on_node_discovered: Option<Box<dyn Fn(&str) + Send + Sync>>,
    pub on_node_lost: Option<Box<dyn Fn(&str) + Send + Sync>>,
    pub on_discovery_error: Option<Box<dyn Fn(&str, &str) + Send + Sync>>,
}

impl ClusterCallbacks {
    fn fire(&self, which: &Option<Box<dyn Fn(&str) + Send + Sync>>, arg: &str) {
        if let Some(cb) = which {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(arg)));
            if result.is_err() {
                warn!(node = %arg, "cluster lifecycle callback panicked");
            }
        }
    }

    fn fire_error(&self, node: &str, error: &str) {
        if let Some(cb) = &self.on_discovery_error {
            let result =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(node, error)));
            if result.is_err() {
                warn!(node = %node, "discovery-error callback panicked");
            }
        }
    }
}

/// The router. One per process in cluster mode.
pub struct ClusterRouter {
    config: ClusterConfig,
    strategy: RoutingStrategy,
    nodes: RwLock<HashMap<String, NodeRecord>>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    sessions: DashMap<String, String>,
    rr_counter: AtomicUsize,
    is_discovering: AtomicBool,
    callbacks: ClusterCallbacks,
    http: reqwest::Client,
    cancel: CancellationToken,
}

impl ClusterRouter {
    pub fn new(config: ClusterConfig, callbacks: ClusterCallbacks) -> Arc<Self> {
        let strategy = config
            .strategy
            .parse()
            .unwrap_or(RoutingStrategy::CacheAware);
        let router = Arc::new(Self {
            strategy,
            nodes: RwLock::new(HashMap::new()),
            breakers: DashMap::new(),
            sessions: DashMap::new(),
            rr_counter: AtomicUsize::new(0),
            is_discovering: AtomicBool::new(false),
            callbacks,
            http: reqwest::Client::new(),
            cancel: CancellationToken::new(),
            config,
        });
        router.seed_configured_nodes();
        router
    }

    pub fn strategy(&self) -> RoutingStrategy {
        self.strategy
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stops the discovery and health loops.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn seed_configured_nodes(&self) {
        let mut nodes = self.write_nodes();
        for spec in &self.config.nodes {
            nodes
                .entry(spec.id.clone())
                .or_insert_with(|| NodeRecord::new(spec.id.clone(), spec.url.clone()));
            self.breakers
                .entry(spec.id.clone())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(BreakerConfig::default())));
        }
    }

    /// Picks a node for a request. Only `Healthy` nodes whose breaker allows
    /// traffic are candidates; the chosen node's in-flight counter is bumped.
    pub fn select_node(
        &self,
        fingerprint: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<SelectedNode, ProxyError> {
        let mut nodes = self.write_nodes();
        let mut candidates: Vec<&str> = nodes
            .values()
            .filter(|n| n.status == NodeStatus::Healthy)
            .filter(|n| {
                self.breakers
                    .get(&n.id)
                    .map(|b| b.should_allow_request())
                    .unwrap_or(true)
            })
            .map(|n| n.id.as_str())
            .collect();
        candidates.sort();
        if candidates.is_empty() {
            return Err(ProxyError::NoHealthyNode);
        }

        // Session affinity (cache-aware only): reuse the previous node while
        // it is healthy.
        let affinity = session_id.filter(|_| self.strategy == RoutingStrategy::CacheAware);
        let chosen_id: String = affinity
            .and_then(|sid| self.sessions.get(sid).map(|e| e.value().clone()))
            .filter(|prev| candidates.contains(&prev.as_str()))
            .unwrap_or_else(|| self.pick(&candidates, &nodes, fingerprint));

        if let Some(sid) = affinity {
            self.sessions.insert(sid.to_string(), chosen_id.clone());
        }

        let node = nodes
            .get_mut(&chosen_id)
            .ok_or(ProxyError::NoHealthyNode)?;
        node.metrics.requests_in_flight += 1;
        node.metrics.total_requests += 1;
        debug!(node = %node.id, strategy = ?self.strategy, "selected cluster node");
        Ok(SelectedNode {
            id: node.id.clone(),
            url: node.url.clone(),
        })
    }

    fn pick(
        &self,
        candidates: &[&str],
        nodes: &HashMap<String, NodeRecord>,
        fingerprint: Option<&str>,
    ) -> String {
        match self.strategy {
            RoutingStrategy::RoundRobin => {
                let i = self.rr_counter.fetch_add(1, Ordering::Relaxed);
                candidates[i % candidates.len()].to_string()
            }
            RoutingStrategy::LeastLoaded => least_loaded(candidates, nodes),
            RoutingStrategy::LatencyBased => candidates
                .iter()
                .min_by(|a, b| {
                    let la = nodes[**a].metrics.avg_latency_ms;
                    let lb = nodes[**b].metrics.avg_latency_ms;
                    la.partial_cmp(&lb).unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|s| s.to_string())
                .unwrap_or_else(|| candidates[0].to_string()),
            RoutingStrategy::CacheAware => {
                let matches: Vec<&str> = fingerprint
                    .map(|fp| {
                        candidates
                            .iter()
                            .copied()
                            .filter(|id| {
                                nodes[*id].cache.system_prompt_hash.as_deref() == Some(fp)
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                if matches.is_empty() {
                    least_loaded(candidates, nodes)
                } else {
                    least_loaded(&matches, nodes)
                }
            }
        }
    }

    /// Completion hook: updates latency EMA, breaker, and health.
    pub fn record_node_success(&self, id: &str, latency_ms: f64) {
        if let Some(breaker) = self.breakers.get(id) {
            breaker.record_success();
            breaker.record_latency(latency_ms);
        }
        let mut nodes = self.write_nodes();
        if let Some(node) = nodes.get_mut(id) {
            node.metrics.requests_in_flight = node.metrics.requests_in_flight.saturating_sub(1);
            node.metrics.avg_latency_ms = ema(node.metrics.avg_latency_ms, latency_ms);
            node.health.consecutive_failures = 0;
            node.health.error_rate = ema(node.health.error_rate, 0.0);
            if node.status == NodeStatus::Degraded {
                node.status = NodeStatus::Healthy;
            }
        }
    }

    /// Completion hook for failures: feeds the per-node breaker and degrades
    /// or unhealthies the node.
    pub fn record_node_failure(&self, id: &str, error: &str) {
        if let Some(breaker) = self.breakers.get(id) {
            breaker.record_failure();
        }
        let mut nodes = self.write_nodes();
        if let Some(node) = nodes.get_mut(id) {
            node.metrics.requests_in_flight = node.metrics.requests_in_flight.saturating_sub(1);
            node.health.consecutive_failures += 1;
            node.health.error_rate = ema(node.health.error_rate, 1.0);
            node.status = if node.health.consecutive_failures
                >= self.config.health.max_consecutive_failures
            {
                NodeStatus::Unhealthy
            } else {
                NodeStatus::Degraded
            };
            warn!(node = %id, error = %error, status = ?node.status, "cluster node request failed");
        }
    }

    /// Records the prompt fingerprint now warm in a node's KV cache.
    pub fn update_node_cache(&self, id: &str, fingerprint: &str, tokens: u64) {
        let mut nodes = self.write_nodes();
        if let Some(node) = nodes.get_mut(id) {
            node.cache.system_prompt_hash = Some(fingerprint.to_string());
            node.cache.tokens = tokens;
            node.cache.last_updated_at_ms = now_ms();
        }
    }

    /// True when at least one node is selectable.
    pub fn has_healthy_node(&self) -> bool {
        self.read_nodes()
            .values()
            .any(|n| n.status == NodeStatus::Healthy)
    }

    /// Copy-out snapshot of every node, for metrics and admin endpoints.
    pub fn snapshot(&self) -> Vec<NodeRecord> {
        let mut nodes: Vec<NodeRecord> = self.read_nodes().values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    fn read_nodes(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, NodeRecord>> {
        match self.nodes.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_nodes(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, NodeRecord>> {
        match self.nodes.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn least_loaded(candidates: &[&str], nodes: &HashMap<String, NodeRecord>) -> String {
    candidates
        .iter()
        .min_by(|a, b| {
            let na = &nodes[**a].metrics;
            let nb = &nodes[**b].metrics;
            na.requests_in_flight
                .cmp(&nb.requests_in_flight)
                .then_with(|| {
                    na.avg_latency_ms
                        .partial_cmp(&nb.avg_latency_ms)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
        })
        .map(|s| s.to_string())
        .unwrap_or_else(|| candidates[0].to_string())
}

fn ema(current: f64, sample: f64) -> f64 {
    if current == 0.0 {
        sample
    } else {
        current * (1.0 - EMA_ALPHA) + sample * EMA_ALPHA
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
