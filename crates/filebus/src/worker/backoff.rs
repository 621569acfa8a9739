//! Idle and error backoff for the primary reader
//!
//! Consecutive empty reads stretch the wait from `min_interval` up to
//! `max_interval`; finding a message resets it.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::{duration_millis, ConfigError};

/// Backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackoffConfig {
    /// First wait after an empty read
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Longest wait after repeated empty reads
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Growth factor between consecutive empty reads
    pub backoff_multiplier: f64,

    /// Wait after a failed read
    #[serde(with = "duration_millis")]
    pub error_delay: Duration,

    /// Random extra wait, as a fraction of the interval (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(1),
            backoff_multiplier: 1.5,
            error_delay: Duration::from_secs(5),
            jitter: 0.0,
        }
    }
}

impl BackoffConfig {
    /// Create a new backoff configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set minimum interval
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Set maximum interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set backoff multiplier
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    /// Set error delay
    pub fn with_error_delay(mut self, delay: Duration) -> Self {
        self.error_delay = delay;
        self
    }

    /// Set jitter
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_interval > self.max_interval {
            return Err(ConfigError::invalid_option(
                "backoff.min_interval",
                "must not exceed max_interval",
            ));
        }
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid_option(
                "backoff.backoff_multiplier",
                "must be at least 1.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::invalid_option(
                "backoff.jitter",
                "must be between 0.0 and 1.0",
            ));
        }
        Ok(())
    }
}

/// Pluggable wait policy used by the primary reader
///
/// Wait methods return `true` when cancellation interrupted the wait.
#[async_trait]
pub trait BackoffStrategy: Send + Sync {
    /// Wait after a read that found nothing
    async fn wait_no_message(&self, cancel: &CancellationToken) -> bool;

    /// Wait after a read that failed
    async fn wait_error(&self, cancel: &CancellationToken) -> bool;

    /// Forget accumulated backoff
    fn reset(&self);
}

/// Increasing-then-capped backoff
pub struct IncreasingBackoff {
    config: BackoffConfig,
    current: Mutex<Duration>,
}

impl IncreasingBackoff {
    /// Create a new backoff starting at `min_interval`
    pub fn new(config: BackoffConfig) -> Self {
        let current = Mutex::new(config.min_interval);
        Self { config, current }
    }

    /// Interval the next empty read will wait (before jitter)
    pub fn current_interval(&self) -> Duration {
        *self.current.lock()
    }

    /// Take the current interval and grow it for next time
    fn next_idle_delay(&self) -> Duration {
        let mut current = self.current.lock();
        let delay = *current;
        let grown = Duration::try_from_secs_f64(current.as_secs_f64() * self.config.backoff_multiplier)
            .unwrap_or(self.config.max_interval);
        *current = grown.min(self.config.max_interval).max(self.config.min_interval);
        self.with_jitter(delay)
    }

    /// Jitter only ever adds, never shortens the wait
    fn with_jitter(&self, delay: Duration) -> Duration {
        if self.config.jitter <= 0.0 {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(0.0..=self.config.jitter);
        delay.saturating_add(delay.mul_f64(factor))
    }
}

impl Default for IncreasingBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => {
            debug!("Shutdown signal received during backoff");
            true
        }
        _ = tokio::time::sleep(delay) => false,
    }
}

#[async_trait]
impl BackoffStrategy for IncreasingBackoff {
    async fn wait_no_message(&self, cancel: &CancellationToken) -> bool {
        let delay = self.next_idle_delay();
        trace!(delay_ms = delay.as_millis() as u64, "No message, backing off");
        sleep_or_cancel(delay, cancel).await
    }

    async fn wait_error(&self, cancel: &CancellationToken) -> bool {
        let delay = self.with_jitter(self.config.error_delay);
        debug!(delay_ms = delay.as_millis() as u64, "Read failed, backing off");
        sleep_or_cancel(delay, cancel).await
    }

    fn reset(&self) {
        *self.current.lock() = self.config.min_interval;
    }
}
