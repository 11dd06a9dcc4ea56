//! Discovery and health background loops.
//!
//! Discovery refreshes the node set from the configured list and probes
//! `${url}/v1/models`; refreshes never overlap (guarded by `is_discovering`).
//! The health loop probes every known node each `check_interval_ms` and
//! flips status on consecutive failures. Both loops stop on the router's
//! cancellation token, and errors inside them never reach the request path.

use super::{ema, now_ms, ClusterRouter, NodeRecord, NodeStatus};
use serde::Deserialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Minimal shape check for `GET /v1/models`: `{"data":[…]}`.
#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<serde_json::Value>,
}

impl ClusterRouter {
    /// Spawns the discovery and health loops; they run until shutdown.
    pub fn spawn_loops(self: &Arc<Self>) {
        let discovery = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(
                discovery.config.discovery_interval_ms.max(1_000),
            ));
            loop {
                tokio::select! {
                    _ = discovery.cancel.cancelled() => break,
                    _ = interval.tick() => {
                        discovery.refresh_once().await;
                    }
                }
            }
            debug!("cluster discovery loop stopped");
        });

        let health = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(
                health.config.health.check_interval_ms.max(250),
            ));
            loop {
                tokio::select! {
                    _ = health.cancel.cancelled() => break,
                    _ = interval.tick() => {
                        health.health_check_once().await;
                    }
                }
            }
            debug!("cluster health loop stopped");
        });
    }

    /// One discovery refresh. Serialised: a refresh that would overlap a
    /// running one returns immediately.
    pub async fn refresh_once(self: &Arc<Self>) {
        if self
            .is_discovering
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("discovery refresh already running, skipping");
            return;
        }

        let specs = self.config.nodes.clone();
        for spec in &specs {
            let known = self.read_nodes().contains_key(&spec.id);
            match self.probe(&spec.url).await {
                Ok(latency_ms) => {
                    let mut nodes = self.write_nodes();
                    let node = nodes
                        .entry(spec.id.clone())
                        .or_insert_with(|| NodeRecord::new(spec.id.clone(), spec.url.clone()));
                    let was_offline = matches!(
                        node.status,
                        NodeStatus::Initializing | NodeStatus::Offline
                    );
                    node.status = NodeStatus::Healthy;
                    node.health.last_check_at_ms = now_ms();
                    node.health.consecutive_failures = 0;
                    node.health.avg_response_time_ms =
                        ema(node.health.avg_response_time_ms, latency_ms);
                    drop(nodes);
                    if !known || was_offline {
                        info!(node = %spec.id, url = %spec.url, "cluster node discovered");
                        self.callbacks
                            .fire(&self.callbacks.on_node_discovered, &spec.id);
                    }
                }
                Err(e) => {
                    warn!(node = %spec.id, error = %e, "discovery probe failed");
                    self.callbacks.fire_error(&spec.id, &e);
                }
            }
        }

        // Nodes no longer configured are lost.
        let lost: Vec<String> = {
            let nodes = self.read_nodes();
            nodes
                .keys()
                .filter(|id| !specs.iter().any(|s| &s.id == *id))
                .cloned()
                .collect()
        };
        for id in lost {
            self.write_nodes().remove(&id);
            self.breakers.remove(&id);
            info!(node = %id, "cluster node lost");
            self.callbacks.fire(&self.callbacks.on_node_lost, &id);
        }

        self.is_discovering.store(false, Ordering::SeqCst);
    }

    /// One health pass over every known node. Probes run concurrently.
    pub async fn health_check_once(self: &Arc<Self>) {
        let targets: Vec<(String, String)> = self
            .read_nodes()
            .values()
            .map(|n| (n.id.clone(), n.url.clone()))
            .collect();

        let probes = targets.into_iter().map(|(id, url)| {
            let router = Arc::clone(self);
            async move {
                let result = router.probe(&url).await;
                (id, result)
            }
        });
        let results = futures::future::join_all(probes).await;

        let max_failures = self.config.health.max_consecutive_failures;
        let mut nodes = self.write_nodes();
        for (id, result) in results {
            let Some(node) = nodes.get_mut(&id) else {
                continue;
            };
            node.health.last_check_at_ms = now_ms();
            match result {
                Ok(latency_ms) => {
                    node.health.consecutive_failures = 0;
                    node.health.error_rate = ema(node.health.error_rate, 0.0);
                    node.health.avg_response_time_ms =
                        ema(node.health.avg_response_time_ms, latency_ms);
                    if node.status != NodeStatus::Healthy {
                        info!(node = %id, "cluster node recovered");
                        node.status = NodeStatus::Healthy;
                    }
                }
                Err(e) => {
                    node.health.consecutive_failures += 1;
                    node.health.error_rate = ema(node.health.error_rate, 1.0);
                    if node.health.consecutive_failures >= max_failures {
                        if node.status != NodeStatus::Unhealthy {
                            warn!(node = %id, error = %e, "cluster node unhealthy");
                        }
                        node.status = NodeStatus::Unhealthy;
                    }
                }
            }
        }
    }

    /// Probes `${url}/v1/models` with the configured timeout. Healthy means
    /// 2xx plus a well-formed `{"data":[…]}` payload.
    async fn probe(&self, url: &str) -> Result<f64, String> {
        let started = Instant::now();
        let response = self
            .http
            .get(format!("{}/v1/models", url.trim_end_matches('/')))
            .timeout(Duration::from_millis(self.config.health.timeout_ms))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("status {}", response.status()));
        }
        response
            .json::<ModelsResponse>()
            .await
            .map_err(|e| format!("malformed models payload: {e}"))?;
        Ok(started.elapsed().as_secs_f64() * 1_000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{ClusterConfig, HealthOptions, NodeSpec};

    fn router_with_unroutable_node() -> Arc<ClusterRouter> {
        ClusterRouter::new(
            ClusterConfig {
                enabled: true,
                nodes: vec![NodeSpec {
                    id: "a".into(),
                    // RFC 5737 TEST-NET address: never routable.
                    url: "http://192.0.2.1:9".into(),
                }],
                strategy: "round-robin".into(),
                discovery_interval_ms: 30_000,
                health: HealthOptions {
                    check_interval_ms: 10_000,
                    timeout_ms: 50,
                    max_consecutive_failures: 2,
                },
            },
            Default::default(),
        )
    }

    /// **Scenario**: overlapping refreshes are skipped via the
    /// `is_discovering` guard.
    #[tokio::test]
    async fn refresh_guard_serialises() {
        let router = router_with_unroutable_node();
        router.is_discovering.store(true, Ordering::SeqCst);
        // Returns immediately instead of probing for timeout_ms.
        let started = Instant::now();
        router.refresh_once().await;
        assert!(started.elapsed() < Duration::from_millis(40));
        router.is_discovering.store(false, Ordering::SeqCst);
    }

    /// **Scenario**: failed probes mark the node unhealthy after
    /// max_consecutive_failures and fire the discovery-error callback.
    #[tokio::test]
    async fn failing_probes_mark_unhealthy() {
        let router = router_with_unroutable_node();
        {
            let mut nodes = router.write_nodes();
            nodes.get_mut("a").unwrap().status = NodeStatus::Healthy;
        }
        router.health_check_once().await;
        assert_eq!(router.snapshot()[0].health.consecutive_failures, 1);
        assert_eq!(router.snapshot()[0].status, NodeStatus::Healthy);
        router.health_check_once().await;
        assert_eq!(router.snapshot()[0].status, NodeStatus::Unhealthy);
        assert!(router.snapshot()[0].health.error_rate > 0.9);
    }

    /// **Scenario**: shutdown cancels the loops.
    #[tokio::test]
    async fn shutdown_cancels_loops() {
        let router = router_with_unroutable_node();
        router.spawn_loops();
        router.shutdown();
        assert!(router.cancellation_token().is_cancelled());
    }
}
