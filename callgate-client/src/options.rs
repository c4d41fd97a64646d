use callgate_core::{CachePolicy, MiddlewareChain, Priority, RetryConfig};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Per-call overrides. Anything left unset falls back to the method config,
/// then to the engine config.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Neither read from nor write to the cache
    pub skip_cache: bool,
    pub skip_debounce: bool,
    pub skip_deduplication: bool,
    pub cache: Option<CachePolicy>,
    pub retry: Option<RetryConfig>,
    /// Extra chains that run after the engine-wide middleware
    pub middlewares: Option<Arc<MiddlewareChain>>,
    pub priority: Option<Priority>,
    pub signal: Option<CancellationToken>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skip_cache(mut self) -> Self {
        self.skip_cache = true;
        self
    }

    pub fn skip_debounce(mut self) -> Self {
        self.skip_debounce = true;
        self
    }

    pub fn skip_deduplication(mut self) -> Self {
        self.skip_deduplication = true;
        self
    }

    pub fn with_cache(mut self, policy: CachePolicy) -> Self {
        self.cache = Some(policy);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_middlewares(mut self, chain: Arc<MiddlewareChain>) -> Self {
        self.middlewares = Some(chain);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }
}
