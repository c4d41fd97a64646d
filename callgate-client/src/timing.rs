// Latency recording for named operations.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TimingStats {
    pub count: u64,
    pub total_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub last_ms: f64,
}

impl TimingStats {
    pub fn average_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_ms / self.count as f64
        }
    }

    fn record(&mut self, ms: f64) {
        if self.count == 0 || ms < self.min_ms {
            self.min_ms = ms;
        }
        if ms > self.max_ms {
            self.max_ms = ms;
        }
        self.count += 1;
        self.total_ms += ms;
        self.last_ms = ms;
    }
}

/// Per-metric latency aggregates
#[derive(Debug, Default)]
pub struct TimingRecorder {
    metrics: DashMap<String, TimingStats>,
}

impl TimingRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, metric: &str, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        debug!("{} took {:.2}ms", metric, ms);
        self.metrics.entry(metric.to_string()).or_default().record(ms);
    }

    pub fn get(&self, metric: &str) -> Option<TimingStats> {
        self.metrics.get(metric).map(|s| *s)
    }

    pub fn snapshot(&self) -> BTreeMap<String, TimingStats> {
        self.metrics
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    pub fn clear(&self) {
        self.metrics.clear();
    }
}

/// Await `fut` and record how long it took under `metric`, whatever it returned
pub async fn with_timing<F: Future>(recorder: &TimingRecorder, metric: &str, fut: F) -> F::Output {
    let started = Instant::now();
    let output = fut.await;
    recorder.record(metric, started.elapsed());
    output
}
