//! Three-state circuit breaker with rolling latency samples.
//!
//! CLOSED routes to the backend, OPEN fails fast, HALF_OPEN probes.
//! Opens on consecutive failures or on sustained high latency. Metrics reads
//! copy out under the lock so they never block recorders for long.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// Millisecond clock seam; tests advance a manual clock instead of sleeping.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Wall-clock milliseconds since the Unix epoch.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Breaker thresholds. `latency_threshold_ms = 0` disables latency tripping.
#[derive(Clone, Debug)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub retry_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub latency_threshold_ms: f64,
    pub latency_consecutive_checks: u32,
    pub latency_window_ms: u64,
    pub max_latency_samples: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            retry_timeout_ms: 30_000,
            request_timeout_ms: 120_000,
            latency_threshold_ms: 0.0,
            latency_consecutive_checks: 3,
            latency_window_ms: 60_000,
            max_latency_samples: 1_000,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::Open => "OPEN",
            BreakerState::HalfOpen => "HALF_OPEN",
        }
    }
}

/// Owned snapshot returned by [`CircuitBreaker::metrics`].
#[derive(Clone, Debug, Serialize)]
pub struct BreakerMetrics {
    pub state: BreakerState,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub consecutive_high_latency: u32,
    pub sample_count: usize,
    pub latency_min_ms: Option<f64>,
    pub latency_max_ms: Option<f64>,
    pub latency_avg_ms: Option<f64>,
    pub latency_p50_ms: Option<f64>,
    pub latency_p95_ms: Option<f64>,
    pub latency_p99_ms: Option<f64>,
    pub next_attempt_at_ms: Option<u64>,
}

#[derive(Clone, Copy, Debug)]
struct LatencySample {
    timestamp_ms: u64,
    latency_ms: f64,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    half_open_successes: u32,
    success_count: u64,
    failure_count: u64,
    consecutive_high_latency: u32,
    next_attempt_at_ms: Option<u64>,
    samples: VecDeque<LatencySample>,
}

/// The breaker. Cheap to share (`Arc`); all operations are `&self`.
pub struct CircuitBreaker {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

const MAX_VALID_LATENCY_MS: f64 = 86_400_000.0;

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                success_count: 0,
                failure_count: 0,
                consecutive_high_latency: 0,
                next_attempt_at_ms: None,
                samples: VecDeque::new(),
            }),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// In OPEN, returns false until the retry timeout elapses, then flips to
    /// HALF_OPEN and returns true. CLOSED and HALF_OPEN allow requests.
    pub fn should_allow_request(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let now = self.clock.now_ms();
                match inner.next_attempt_at_ms {
                    Some(at) if now >= at => {
                        inner.state = BreakerState::HalfOpen;
                        inner.half_open_successes = 0;
                        true
                    }
                    _ => false,
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.success_count += 1;
        inner.consecutive_failures = 0;
        if inner.state == BreakerState::HalfOpen {
            inner.half_open_successes += 1;
            if inner.half_open_successes >= self.config.success_threshold {
                inner.state = BreakerState::Closed;
                inner.next_attempt_at_ms = None;
                inner.consecutive_high_latency = 0;
            }
        }
    }

    pub fn record_failure(&self) {
        let now = self.clock.now_ms();
        let mut inner = self.lock();
        inner.failure_count += 1;
        match inner.state {
            BreakerState::HalfOpen => self.open(&mut inner, now),
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.open(&mut inner, now);
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Records one latency sample. Rejects non-finite, non-positive, or
    /// longer-than-a-day values. May trip the breaker when the last
    /// `latency_consecutive_checks` samples inside the rolling window all
    /// exceed the threshold.
    pub fn record_latency(&self, latency_ms: f64) {
        if !latency_ms.is_finite() || latency_ms <= 0.0 || latency_ms > MAX_VALID_LATENCY_MS {
            return;
        }
        let now = self.clock.now_ms();
        let mut inner = self.lock();

        inner.samples.push_back(LatencySample {
            timestamp_ms: now,
            latency_ms,
        });
        while inner.samples.len() > self.config.max_latency_samples {
            inner.samples.pop_front();
        }

        if self.config.latency_threshold_ms <= 0.0 {
            return;
        }
        if latency_ms > self.config.latency_threshold_ms {
            inner.consecutive_high_latency += 1;
        } else {
            inner.consecutive_high_latency = 0;
        }

        let checks = self.config.latency_consecutive_checks as usize;
        if checks == 0 || inner.state != BreakerState::Closed {
            return;
        }
        let window_start = now.saturating_sub(self.config.latency_window_ms);
        let recent: Vec<f64> = inner
            .samples
            .iter()
            .rev()
            .take(checks)
            .filter(|s| s.timestamp_ms >= window_start)
            .map(|s| s.latency_ms)
            .collect();
        if recent.len() >= checks
            && recent.iter().all(|&l| l > self.config.latency_threshold_ms)
        {
            self.open(&mut inner, now);
        }
    }

    /// Manually forces OPEN (admin/test).
    pub fn trip(&self) {
        let now = self.clock.now_ms();
        let mut inner = self.lock();
        self.open(&mut inner, now);
    }

    /// Resets to CLOSED and clears counters and samples (admin/test).
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.half_open_successes = 0;
        inner.success_count = 0;
        inner.failure_count = 0;
        inner.consecutive_high_latency = 0;
        inner.next_attempt_at_ms = None;
        inner.samples.clear();
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Copy-out snapshot; percentiles use linear interpolation between sorted
    /// ranks over samples inside the rolling window.
    pub fn metrics(&self) -> BreakerMetrics {
        let now = self.clock.now_ms();
        let inner = self.lock();
        let window_start = now.saturating_sub(self.config.latency_window_ms);
        let mut windowed: Vec<f64> = inner
            .samples
            .iter()
            .filter(|s| s.timestamp_ms >= window_start)
            .map(|s| s.latency_ms)
            .collect();
        windowed.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let (min, max, avg) = if windowed.is_empty() {
            (None, None, None)
        } else {
            let sum: f64 = windowed.iter().sum();
            (
                Some(windowed[0]),
                Some(windowed[windowed.len() - 1]),
                Some(sum / windowed.len() as f64),
            )
        };

        BreakerMetrics {
            state: inner.state,
            success_count: inner.success_count,
            failure_count: inner.failure_count,
            consecutive_failures: inner.consecutive_failures,
            consecutive_high_latency: inner.consecutive_high_latency,
            sample_count: windowed.len(),
            latency_min_ms: min,
            latency_max_ms: max,
            latency_avg_ms: avg,
            latency_p50_ms: percentile(&windowed, 0.50),
            latency_p95_ms: percentile(&windowed, 0.95),
            latency_p99_ms: percentile(&windowed, 0.99),
            next_attempt_at_ms: if inner.state == BreakerState::Open {
                inner.next_attempt_at_ms
            } else {
                None
            },
        }
    }

    fn open(&self, inner: &mut Inner, now: u64) {
        inner.state = BreakerState::Open;
        inner.next_attempt_at_ms = Some(now + self.config.retry_timeout_ms);
        inner.consecutive_failures = 0;
        inner.half_open_successes = 0;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only happens if a recorder panicked; the state is
        // plain counters, safe to keep using.
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Linear-interpolation percentile over an already sorted slice.
fn percentile(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    if sorted.len() == 1 {
        return Some(sorted[0]);
    }
    let rank = q * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct ManualClock(AtomicU64);

    impl ManualClock {
        fn new() -> Arc<Self> {
            Arc::new(Self(AtomicU64::new(1_000_000)))
        }
        fn advance(&self, ms: u64) {
            self.0.fetch_add(ms, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_ms(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            retry_timeout_ms: 1_000,
            ..BreakerConfig::default()
        }
    }

    /// **Scenario**: 3 consecutive failures open the breaker; after the retry
    /// timeout one probe is allowed (HALF_OPEN); a failure there re-opens.
    #[test]
    fn open_half_open_reopen_cycle() {
        let clock = ManualClock::new();
        let cb = CircuitBreaker::with_clock(config(), clock.clone());

        cb.record_failure();
        cb.record_failure();
        assert!(cb.should_allow_request(), "still closed below threshold");
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.should_allow_request());

        clock.advance(1_000);
        assert!(cb.should_allow_request(), "retry timeout elapsed");
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.should_allow_request());
    }

    /// **Scenario**: success_threshold successes in HALF_OPEN close the breaker.
    #[test]
    fn half_open_closes_after_successes() {
        let clock = ManualClock::new();
        let cb = CircuitBreaker::with_clock(config(), clock.clone());
        cb.trip();
        clock.advance(1_000);
        assert!(cb.should_allow_request());
        cb.record_success();
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    /// **Scenario**: the sample buffer never exceeds max_latency_samples.
    #[test]
    fn sample_buffer_is_bounded() {
        let cb = CircuitBreaker::with_clock(
            BreakerConfig {
                max_latency_samples: 10,
                ..config()
            },
            ManualClock::new(),
        );
        for i in 0..100 {
            cb.record_latency(10.0 + i as f64);
        }
        assert_eq!(cb.metrics().sample_count, 10);
        // oldest evicted: min is from the last ten samples
        assert_eq!(cb.metrics().latency_min_ms, Some(100.0));
    }

    /// **Scenario**: invalid latencies are rejected outright.
    #[test]
    fn invalid_latencies_rejected() {
        let cb = CircuitBreaker::with_clock(config(), ManualClock::new());
        cb.record_latency(0.0);
        cb.record_latency(-5.0);
        cb.record_latency(f64::NAN);
        cb.record_latency(f64::INFINITY);
        cb.record_latency(86_400_001.0);
        assert_eq!(cb.metrics().sample_count, 0);
    }

    /// **Scenario**: N consecutive over-threshold samples inside the window
    /// trip the breaker; a fast sample resets the streak.
    #[test]
    fn latency_trip_requires_consecutive_highs() {
        let clock = ManualClock::new();
        let cb = CircuitBreaker::with_clock(
            BreakerConfig {
                latency_threshold_ms: 100.0,
                latency_consecutive_checks: 3,
                ..config()
            },
            clock.clone(),
        );
        cb.record_latency(200.0);
        cb.record_latency(200.0);
        cb.record_latency(50.0); // resets
        cb.record_latency(200.0);
        cb.record_latency(200.0);
        assert_eq!(cb.state(), BreakerState::Closed);
        cb.record_latency(200.0);
        assert_eq!(cb.state(), BreakerState::Open);
    }

    /// **Scenario**: percentiles interpolate linearly between sorted ranks.
    #[test]
    fn percentile_linear_interpolation() {
        let sorted = vec![10.0, 20.0, 30.0, 40.0];
        assert_eq!(percentile(&sorted, 0.50), Some(25.0));
        assert_eq!(percentile(&sorted, 0.0), Some(10.0));
        assert_eq!(percentile(&sorted, 1.0), Some(40.0));
        let p95 = percentile(&sorted, 0.95).unwrap();
        assert!((p95 - 38.5).abs() < 1e-9);
        assert_eq!(percentile(&[], 0.5), None);
        assert_eq!(percentile(&[7.0], 0.99), Some(7.0));
    }

    /// **Scenario**: metrics returns an owned copy including next_attempt_at
    /// only while OPEN; reset clears everything.
    #[test]
    fn metrics_snapshot_and_reset() {
        let clock = ManualClock::new();
        let cb = CircuitBreaker::with_clock(config(), clock.clone());
        cb.record_success();
        cb.record_latency(42.0);
        cb.trip();

        let m = cb.metrics();
        assert_eq!(m.state, BreakerState::Open);
        assert_eq!(m.success_count, 1);
        assert_eq!(m.next_attempt_at_ms, Some(clock.now_ms() + 1_000));
        assert_eq!(m.latency_avg_ms, Some(42.0));

        cb.reset();
        let m = cb.metrics();
        assert_eq!(m.state, BreakerState::Closed);
        assert_eq!(m.success_count, 0);
        assert_eq!(m.sample_count, 0);
        assert_eq!(m.next_attempt_at_ms, None);
    }
}
