use anyhow::{Context, Result};
use callgate_core::{CacheConfig, GateConfig, KeyConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Engine configuration.
///
/// Timeouts compose additively. The worst-case latency of one call is roughly
/// `gate.queue_timeout_ms + (retry.max_retries + 1) * transport_timeout_ms`
/// plus the sum of the retry delays.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub gate: GateConfig,
    pub retry: RetryConfig,
    pub key: KeyConfig,
    /// Request timeout for the built-in HTTP transport
    pub transport_timeout_ms: u64,
    /// How often stale in-flight dedup entries are swept; 0 disables the sweep
    pub dedup_cleanup_interval_ms: u64,
    /// Age after which an in-flight dedup entry is considered stale. The
    /// sweep never uses less than [`EngineConfig::worst_case_latency`], so a
    /// call still inside its queue, retry and transport bounds is not cut off.
    /// Methods with a larger retry override need a larger value here.
    pub dedup_max_age_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            gate: GateConfig::default(),
            retry: RetryConfig::default(),
            key: KeyConfig::default(),
            transport_timeout_ms: 30000,
            dedup_cleanup_interval_ms: 30000,
            dedup_max_age_ms: 120_000,
        }
    }
}

fn env_override<T>(name: &str, target: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Ok(raw) = std::env::var(name) {
        *target = raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {:?}", name, raw))?;
    }
    Ok(())
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse engine configuration")
    }

    /// Defaults overridden by `CALLGATE_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `CALLGATE_*` environment overrides on top of this config
    pub fn apply_env(&mut self) -> Result<()> {
        env_override("CALLGATE_MAX_CONCURRENT", &mut self.gate.max_concurrent)?;
        env_override("CALLGATE_MAX_QUEUE_SIZE", &mut self.gate.max_queue_size)?;
        env_override("CALLGATE_QUEUE_TIMEOUT_MS", &mut self.gate.queue_timeout_ms)?;
        env_override("CALLGATE_BOOST_INTERVAL_MS", &mut self.gate.boost_interval_ms)?;
        env_override("CALLGATE_CACHE_MAX_SIZE", &mut self.cache.max_size)?;
        env_override("CALLGATE_CACHE_TTL_MS", &mut self.cache.default_ttl_ms)?;
        env_override("CALLGATE_MAX_RETRIES", &mut self.retry.max_retries)?;
        env_override("CALLGATE_RETRY_INITIAL_DELAY_MS", &mut self.retry.initial_delay_ms)?;
        env_override("CALLGATE_RETRY_MAX_DELAY_MS", &mut self.retry.max_delay_ms)?;
        env_override("CALLGATE_TRANSPORT_TIMEOUT_MS", &mut self.transport_timeout_ms)?;
        Ok(())
    }

    pub fn default_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache.default_ttl_ms)
    }

    pub fn transport_timeout(&self) -> Duration {
        Duration::from_millis(self.transport_timeout_ms)
    }

    /// Longest a call can legitimately stay in flight with the engine-wide
    /// retry config: queue wait, every attempt at the transport timeout and
    /// all retry delays. `None` when the queue or transport wait is unbounded.
    pub fn worst_case_latency(&self) -> Option<Duration> {
        if self.gate.queue_timeout_ms == 0 || self.transport_timeout_ms == 0 {
            return None;
        }
        let attempts = self.retry.max_retries.saturating_add(1);
        let backoff: Duration = (1..=self.retry.max_retries)
            .map(|attempt| self.retry.base_delay(attempt))
            .sum();
        Some(
            Duration::from_millis(self.gate.queue_timeout_ms)
                + self.transport_timeout().saturating_mul(attempts)
                + backoff,
        )
    }

    /// Age used by the stale dedup sweep: `dedup_max_age_ms`, raised to the
    /// worst-case latency when that is larger
    pub fn effective_dedup_max_age(&self) -> Duration {
        let configured = Duration::from_millis(self.dedup_max_age_ms);
        match self.worst_case_latency() {
            Some(worst) => configured.max(worst),
            None => configured,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{
                "gate": { "max_concurrent": 2 },
                "retry": { "max_retries": 5, "strategy": "linear" },
                "transport_timeout_ms": 1500
            }"#,
        )
        .unwrap();

        assert_eq!(config.gate.max_concurrent, 2);
        assert_eq!(config.gate.max_queue_size, GateConfig::default().max_queue_size);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.initial_delay_ms, 1000);
        assert_eq!(config.transport_timeout(), Duration::from_millis(1500));
        assert_eq!(config.cache.max_size, 100);
    }

    #[test]
    fn test_invalid_json_is_reported() {
        assert!(EngineConfig::from_json_str(r#"{"gate": {"max_concurrent": "many"}}"#).is_err());
    }

    #[test]
    fn test_dedup_max_age_covers_worst_case_latency() {
        let mut config = EngineConfig {
            gate: GateConfig {
                queue_timeout_ms: 1_000,
                ..Default::default()
            },
            retry: RetryConfig {
                max_retries: 2,
                initial_delay_ms: 100,
                strategy: callgate_core::BackoffStrategy::Fixed,
                ..Default::default()
            },
            transport_timeout_ms: 500,
            dedup_max_age_ms: 1_000,
            ..Default::default()
        };

        assert_eq!(config.worst_case_latency(), Some(Duration::from_millis(2_700)));
        assert_eq!(config.effective_dedup_max_age(), Duration::from_millis(2_700));

        config.dedup_max_age_ms = 5_000;
        assert_eq!(config.effective_dedup_max_age(), Duration::from_millis(5_000));

        config.gate.queue_timeout_ms = 0;
        assert_eq!(config.worst_case_latency(), None);
        assert_eq!(config.effective_dedup_max_age(), Duration::from_millis(5_000));
    }

    #[test]
    fn test_default_dedup_max_age_outlasts_default_bounds() {
        let config = EngineConfig::default();
        // 30s queue + 4 x 30s attempts + 1s + 2s + 4s backoff
        assert_eq!(config.worst_case_latency(), Some(Duration::from_millis(157_000)));
        assert_eq!(config.effective_dedup_max_age(), Duration::from_millis(157_000));
    }

    // Environment variables are process-global, so all env cases share one test
    #[test]
    fn test_env_overrides() {
        std::env::set_var("CALLGATE_MAX_CONCURRENT", "3");
        std::env::set_var("CALLGATE_CACHE_MAX_SIZE", " 42 ");
        std::env::set_var("CALLGATE_MAX_RETRIES", "0");
        let config = EngineConfig::from_env().unwrap();
        assert_eq!(config.gate.max_concurrent, 3);
        assert_eq!(config.cache.max_size, 42);
        assert_eq!(config.retry.max_retries, 0);

        std::env::set_var("CALLGATE_QUEUE_TIMEOUT_MS", "soon");
        let err = EngineConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("CALLGATE_QUEUE_TIMEOUT_MS"));

        for name in [
            "CALLGATE_MAX_CONCURRENT",
            "CALLGATE_CACHE_MAX_SIZE",
            "CALLGATE_MAX_RETRIES",
            "CALLGATE_QUEUE_TIMEOUT_MS",
        ] {
            std::env::remove_var(name);
        }
    }
}
