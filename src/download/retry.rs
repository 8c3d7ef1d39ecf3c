//! Retry schedule for downloads

use crate::core::config::{Config, DEFAULT_RETRY_DELAY};
use crate::error::ArchiveError;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Attempt budget and backoff delay table
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, at least 1
    pub attempts: u32,
    /// Delay after failed attempt k is `delays[k-1]`, clamped to the last entry
    pub delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, delays: Vec<Duration>) -> Self {
        Self {
            attempts: attempts.max(1),
            delays,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.retries, config.retry_delays.clone())
    }

    /// Delay to wait after failed attempt `attempt` (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if self.delays.is_empty() {
            return DEFAULT_RETRY_DELAY;
        }
        let index = (attempt.max(1) as usize - 1).min(self.delays.len() - 1);
        self.delays[index]
    }

    /// Check if another attempt follows `attempt`
    pub fn has_next(&self, attempt: u32) -> bool {
        attempt < self.attempts
    }

    /// Sleep the backoff for `attempt`, returning early with `Cancelled`
    /// when the token fires
    pub async fn backoff(&self, attempt: u32, token: &CancellationToken) -> Result<(), ArchiveError> {
        let delay = self.delay_for_attempt(attempt);
        debug!("Backing off {:?} after attempt {}", delay, attempt);
        sleep_or_cancel(delay, token).await
    }
}

/// Sleep for `delay` unless the token fires first
pub async fn sleep_or_cancel(delay: Duration, token: &CancellationToken) -> Result<(), ArchiveError> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(ArchiveError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
