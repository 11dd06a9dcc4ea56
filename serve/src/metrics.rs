//! Prometheus registry for the proxy.
//!
//! Counters and histograms are updated on the request path; gauges
//! (breaker state, node health, cache hit rate) are refreshed at scrape time
//! from the owning services, so scrapes read current values without the
//! request path paying for them.

use crate::Services;
use anyclaude::{BreakerState, NodeStatus};
use prometheus::{
    histogram_opts, opts, Gauge, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Registry,
    TextEncoder,
};
use std::time::Instant;
use tracing::warn;

pub struct Metrics {
    registry: Registry,
    requests_total: IntCounterVec,
    request_duration_seconds: HistogramVec,
    breaker_state: IntGauge,
    node_healthy: IntGaugeVec,
    cache_hit_rate: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            opts!(
                "anyclaude_requests_total",
                "Requests handled, by mode, model, and outcome"
            ),
            &["mode", "model", "outcome"],
        )
        .expect("requests_total metric");
        let request_duration_seconds = HistogramVec::new(
            histogram_opts!(
                "anyclaude_request_duration_seconds",
                "Request wall time, by mode",
                vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
            ),
            &["mode"],
        )
        .expect("request_duration metric");
        let breaker_state = IntGauge::new(
            "anyclaude_circuit_breaker_state",
            "Breaker state: 0 closed, 1 half-open, 2 open",
        )
        .expect("breaker_state metric");
        let node_healthy = IntGaugeVec::new(
            opts!("anyclaude_node_healthy", "Cluster node health (1 healthy)"),
            &["node"],
        )
        .expect("node_healthy metric");
        let cache_hit_rate = Gauge::new(
            "anyclaude_cache_hit_rate",
            "Prompt-cache hit rate across all fingerprints",
        )
        .expect("cache_hit_rate metric");

        for collector in [
            Box::new(requests_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(request_duration_seconds.clone()),
            Box::new(breaker_state.clone()),
            Box::new(node_healthy.clone()),
            Box::new(cache_hit_rate.clone()),
        ] {
            if let Err(e) = registry.register(collector) {
                warn!(error = %e, "metric registration failed");
            }
        }

        Self {
            registry,
            requests_total,
            request_duration_seconds,
            breaker_state,
            node_healthy,
            cache_hit_rate,
        }
    }

    /// Request-path hook: one counter bump plus one histogram observation.
    pub fn observe_request(&self, mode: &str, model: &str, outcome: &str, started: Instant) {
        self.requests_total
            .with_label_values(&[mode, model, outcome])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[mode])
            .observe(started.elapsed().as_secs_f64());
    }

    pub fn set_cache_hit_rate(&self, rate: f64) {
        self.cache_hit_rate.set(rate);
    }

    /// Scrape-time render: refresh gauges from the services, then encode.
    pub fn render(&self, services: &Services) -> String {
        self.breaker_state.set(match services.breaker.state() {
            BreakerState::Closed => 0,
            BreakerState::HalfOpen => 1,
            BreakerState::Open => 2,
        });
        if let Some(cluster) = &services.cluster {
            for node in cluster.snapshot() {
                self.node_healthy
                    .with_label_values(&[&node.id])
                    .set((node.status == NodeStatus::Healthy) as i64);
            }
        }
        self.cache_hit_rate.set(services.monitor.hit_rate());

        let encoder = TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
