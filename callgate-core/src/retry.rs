use crate::error::CallError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub type RetryPredicate = Arc<dyn Fn(&CallError, u32) -> bool + Send + Sync>;
pub type DelayCalculator = Arc<dyn Fn(u32, &RetryConfig) -> Duration + Send + Sync>;

/// How the base delay grows between attempts
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    #[default]
    Exponential,
    Linear,
    Fixed,
    #[serde(skip)]
    Custom(DelayCalculator),
}

impl std::fmt::Debug for BackoffStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackoffStrategy::Exponential => f.write_str("Exponential"),
            BackoffStrategy::Linear => f.write_str("Linear"),
            BackoffStrategy::Fixed => f.write_str("Fixed"),
            BackoffStrategy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub enable_jitter: bool,
    pub strategy: BackoffStrategy,
    /// Overrides [`CallError::is_retryable`] when set
    #[serde(skip)]
    pub should_retry: Option<RetryPredicate>,
}

impl std::fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_retries", &self.max_retries)
            .field("initial_delay_ms", &self.initial_delay_ms)
            .field("max_delay_ms", &self.max_delay_ms)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("enable_jitter", &self.enable_jitter)
            .field("strategy", &self.strategy)
            .field("should_retry", &self.should_retry.is_some())
            .finish()
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            enable_jitter: true,
            strategy: BackoffStrategy::Exponential,
            should_retry: None,
        }
    }
}

impl RetryConfig {
    /// A config that never retries
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn with_should_retry(
        mut self,
        predicate: impl Fn(&CallError, u32) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    pub fn with_delay_calculator(
        mut self,
        calculator: impl Fn(u32, &RetryConfig) -> Duration + Send + Sync + 'static,
    ) -> Self {
        self.strategy = BackoffStrategy::Custom(Arc::new(calculator));
        self
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-based),
    /// before jitter is applied
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let max = self.max_delay_ms as f64;
        let millis = match &self.strategy {
            BackoffStrategy::Exponential => {
                let exp = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exp)
            }
            BackoffStrategy::Linear => self.initial_delay_ms as f64 * f64::from(attempt),
            BackoffStrategy::Fixed => self.initial_delay_ms as f64,
            BackoffStrategy::Custom(calc) => return calc(attempt, self),
        };
        Duration::from_millis(millis.min(max).max(0.0) as u64)
    }

    /// Delay including jitter, a uniform factor in `[0.5, 1.0]`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.enable_jitter {
            let factor: f64 = rand::rng().random_range(0.5..=1.0);
            base.mul_f64(factor)
        } else {
            base
        }
    }

    pub fn should_retry(&self, error: &CallError, attempt: u32) -> bool {
        match &self.should_retry {
            Some(predicate) => predicate(error, attempt),
            None => error.is_retryable(),
        }
    }
}

/// Bookkeeping for one `execute_with_retry` call
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    pub attempt: u32,
    pub total_delay: Duration,
    pub errors: Vec<CallError>,
}

#[derive(Debug, Clone, Default)]
pub struct RetryEngine;

impl RetryEngine {
    pub fn new() -> Self {
        Self
    }

    /// Run `operation` until it succeeds, the error is not retryable, or
    /// `max_retries` retries have been spent. The most recent error is returned.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        config: &RetryConfig,
        operation: F,
    ) -> Result<T, CallError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        self.execute_with_state(config, operation).await.0
    }

    /// Same as [`RetryEngine::execute_with_retry`], also returning the retry bookkeeping
    pub async fn execute_with_state<T, F, Fut>(
        &self,
        config: &RetryConfig,
        mut operation: F,
    ) -> (Result<T, CallError>, RetryState)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let mut state = RetryState::default();

        loop {
            state.attempt += 1;
            match operation(state.attempt).await {
                Ok(value) => return (Ok(value), state),
                Err(err) => {
                    state.errors.push(err.clone());

                    if state.attempt > config.max_retries {
                        if config.max_retries > 0 {
                            warn!(
                                "Giving up after {} attempts: {}",
                                state.attempt, err
                            );
                        }
                        return (Err(err), state);
                    }
                    if !config.should_retry(&err, state.attempt) {
                        debug!("Error is not retryable: {}", err);
                        return (Err(err), state);
                    }

                    let delay = config.delay_for(state.attempt);
                    state.total_delay += delay;
                    debug!(
                        "Attempt {} failed ({}), retrying in {:?}",
                        state.attempt, err, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
