use crate::timing::TimingStats;
use callgate_core::{CacheStats, DedupStats, GateStats};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct CallCounters {
    pub calls: AtomicU64,
    pub successes: AtomicU64,
    pub failures: AtomicU64,
    pub cache_hits: AtomicU64,
    pub network_calls: AtomicU64,
    pub retries: AtomicU64,
    pub total_latency_us: AtomicU64,
}

impl CallCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time view of everything the engine measures
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub cache_hits: u64,
    /// Executions that reached the transport path (after cache and dedup)
    pub network_calls: u64,
    pub retries: u64,
    pub average_latency_ms: f64,
    pub cache: CacheStats,
    pub gate: GateStats,
    pub dedup: DedupStats,
    /// Per-method latency for methods registered with `timed()`
    pub timings: BTreeMap<String, TimingStats>,
}

impl EngineStats {
    pub(crate) fn from_counters(
        counters: &CallCounters,
        cache: CacheStats,
        gate: GateStats,
        dedup: DedupStats,
        timings: BTreeMap<String, TimingStats>,
    ) -> Self {
        let calls = counters.calls.load(Ordering::Relaxed);
        let total_us = counters.total_latency_us.load(Ordering::Relaxed);
        EngineStats {
            calls,
            successes: counters.successes.load(Ordering::Relaxed),
            failures: counters.failures.load(Ordering::Relaxed),
            cache_hits: counters.cache_hits.load(Ordering::Relaxed),
            network_calls: counters.network_calls.load(Ordering::Relaxed),
            retries: counters.retries.load(Ordering::Relaxed),
            average_latency_ms: if calls == 0 {
                0.0
            } else {
                total_us as f64 / calls as f64 / 1000.0
            },
            cache,
            gate,
            dedup,
            timings,
        }
    }

    /// Share of calls answered from cache
    pub fn cache_hit_rate(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.cache_hits as f64 / self.calls as f64
        }
    }
}
