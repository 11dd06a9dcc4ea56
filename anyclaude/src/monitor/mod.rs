//! Cache monitor: per-prompt hit/miss ledger keyed by prompt fingerprint.
//!
//! Anthropic-style responses carry explicit cache usage and are recorded
//! verbatim. OpenAI-style backends report nothing, so the monitor infers: a
//! repeated fingerprint is a hit, a first sighting is a miss, both valued at
//! `0.7 × input_tokens`. The ledger is flushed to disk periodically
//! (write-then-rename, off the request path) and reported on shutdown.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Heuristic share of input tokens assumed cached for OpenAI-style backends.
/// Replace when backends surface explicit cache usage.
pub const INFERRED_CACHE_RATIO: f64 = 0.7;

/// One ledger entry. `hits + misses >= 1` from the moment it exists.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CacheEntry {
    pub hits: u64,
    pub misses: u64,
    pub hit_tokens: u64,
    pub miss_tokens: u64,
    pub first_seen_at_ms: u64,
    pub last_seen_at_ms: u64,
    pub system_prompt_len: usize,
    pub tool_count: usize,
}

/// Cache telemetry for one completed request.
#[derive(Clone, Copy, Debug)]
pub enum CacheUsage {
    /// Backend reported cache fields (Anthropic, or OpenAI with
    /// `prompt_tokens_details.cached_tokens`).
    Explicit {
        cache_read_tokens: u64,
        cache_creation_tokens: u64,
    },
    /// No telemetry; infer from fingerprint recurrence.
    Inferred { input_tokens: u64 },
}

/// What the monitor concluded for this request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheOutcome {
    pub hit: bool,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
}

/// Summary for logs and the shutdown report.
#[derive(Clone, Debug, Serialize)]
pub struct CacheReport {
    pub entries: usize,
    pub total_hits: u64,
    pub total_misses: u64,
    pub hit_rate: f64,
    pub hit_tokens: u64,
    pub miss_tokens: u64,
}

/// The monitor. One per process; map guarded by a mutex, persistence on a
/// background task.
pub struct CacheMonitor {
    entries: Mutex<HashMap<String, CacheEntry>>,
    path: Option<PathBuf>,
}

impl CacheMonitor {
    /// Opens the monitor, loading a previous snapshot when present. Missing
    /// or corrupt snapshots start an empty ledger.
    pub fn open(path: Option<PathBuf>) -> Self {
        let entries = path
            .as_ref()
            .and_then(|p| std::fs::read_to_string(p).ok())
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default();
        Self {
            entries: Mutex::new(entries),
            path,
        }
    }

    /// Default snapshot location: `~/.anyclaude/cache-monitor.json`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".anyclaude").join("cache-monitor.json"))
    }

    /// Records one completed request against its fingerprint.
    pub fn record(
        &self,
        fingerprint: &str,
        system_prompt_len: usize,
        tool_count: usize,
        usage: CacheUsage,
    ) -> CacheOutcome {
        let now = now_ms();
        let mut entries = self.lock_entries();
        let known = entries.contains_key(fingerprint);
        let entry = entries.entry(fingerprint.to_string()).or_insert_with(|| {
            CacheEntry {
                first_seen_at_ms: now,
                system_prompt_len,
                tool_count,
                ..CacheEntry::default()
            }
        });
        entry.last_seen_at_ms = now;

        let outcome = match usage {
            CacheUsage::Explicit {
                cache_read_tokens,
                cache_creation_tokens,
            } => {
                let hit = cache_read_tokens > 0;
                if hit {
                    entry.hits += 1;
                    entry.hit_tokens += cache_read_tokens;
                } else {
                    entry.misses += 1;
                    entry.miss_tokens += cache_creation_tokens;
                }
                CacheOutcome {
                    hit,
                    cache_read_tokens,
                    cache_creation_tokens,
                }
            }
            CacheUsage::Inferred { input_tokens } => {
                let estimated = (input_tokens as f64 * INFERRED_CACHE_RATIO) as u64;
                if known {
                    entry.hits += 1;
                    entry.hit_tokens += estimated;
                    CacheOutcome {
                        hit: true,
                        cache_read_tokens: estimated,
                        cache_creation_tokens: 0,
                    }
                } else {
                    entry.misses += 1;
                    entry.miss_tokens += estimated;
                    CacheOutcome {
                        hit: false,
                        cache_read_tokens: 0,
                        cache_creation_tokens: estimated,
                    }
                }
            }
        };
        debug!(
            fingerprint = %&fingerprint[..fingerprint.len().min(12)],
            hit = outcome.hit,
            "cache monitor recorded request"
        );
        outcome
    }

    /// Overall hit rate in [0, 1]; 0 when nothing was recorded yet.
    pub fn hit_rate(&self) -> f64 {
        let entries = self.lock_entries();
        let (hits, misses) = entries
            .values()
            .fold((0u64, 0u64), |(h, m), e| (h + e.hits, m + e.misses));
        if hits + misses == 0 {
            0.0
        } else {
            hits as f64 / (hits + misses) as f64
        }
    }

    pub fn report(&self) -> CacheReport {
        let entries = self.lock_entries();
        let mut report = CacheReport {
            entries: entries.len(),
            total_hits: 0,
            total_misses: 0,
            hit_rate: 0.0,
            hit_tokens: 0,
            miss_tokens: 0,
        };
        for entry in entries.values() {
            report.total_hits += entry.hits;
            report.total_misses += entry.misses;
            report.hit_tokens += entry.hit_tokens;
            report.miss_tokens += entry.miss_tokens;
        }
        let total = report.total_hits + report.total_misses;
        if total > 0 {
            report.hit_rate = report.total_hits as f64 / total as f64;
        }
        report
    }

    /// Serialises the ledger and writes it atomically. Blocking; call from
    /// `spawn_blocking` or at shutdown.
    pub fn flush_blocking(&self) -> std::io::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let snapshot = {
            let entries = self.lock_entries();
            serde_json::to_string_pretty(&*entries).unwrap_or_default()
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, snapshot)?;
        std::fs::rename(&tmp, path)
    }

    /// Spawns the periodic flush task; it stops on the token and flushes one
    /// last time. Flush errors are logged, never propagated.
    pub fn spawn_flush_loop(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let m = Arc::clone(&monitor);
                        let result = tokio::task::spawn_blocking(move || m.flush_blocking()).await;
                        if let Ok(Err(e)) = result {
                            warn!(error = %e, "cache monitor flush failed");
                        }
                    }
                }
            }
            if let Err(e) = monitor.flush_blocking() {
                warn!(error = %e, "final cache monitor flush failed");
            }
            let report = monitor.report();
            info!(
                entries = report.entries,
                hits = report.total_hits,
                misses = report.total_misses,
                hit_rate = format!("{:.1}%", report.hit_rate * 100.0),
                "cache monitor report"
            );
        });
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry>> {
        match self.entries.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
