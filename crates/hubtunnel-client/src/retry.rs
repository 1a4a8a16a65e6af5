//! Connect retry with linear backoff

use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Retry configuration for the connect step
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay added per failed attempt
    pub step: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Maximum number of retries (None = unlimited)
    pub max_attempts: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            step: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            max_attempts: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("Max connect attempts reached")]
    MaxAttemptsReached,

    #[error("Retry cancelled")]
    Cancelled,
}

/// Retry state for one connect cycle.
///
/// The n-th wait sleeps `min((n + 1) * step, max_delay)`, so the defaults
/// give 2, 3, 4, 5, 5... seconds.
pub struct RetryPolicy {
    config: RetryConfig,
    attempt: usize,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Wait before the next attempt, or fail when attempts are exhausted
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<(), RetryError> {
        self.attempt += 1;

        if let Some(max_attempts) = self.config.max_attempts {
            if self.attempt > max_attempts {
                return Err(RetryError::MaxAttemptsReached);
            }
        }

        let delay = self.current_delay();
        debug!(
            "Waiting {}ms before connect attempt {}",
            delay.as_millis(),
            self.attempt + 1
        );

        tokio::select! {
            _ = cancel.cancelled() => Err(RetryError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Number of waits taken so far
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Delay for the current attempt number
    pub fn current_delay(&self) -> Duration {
        let attempt = u32::try_from(self.attempt.max(1).saturating_add(1)).unwrap_or(u32::MAX);
        self.config
            .step
            .checked_mul(attempt)
            .unwrap_or(self.config.max_delay)
            .min(self.config.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> RetryConfig {
        RetryConfig {
            step: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            max_attempts: None,
        }
    }

    #[tokio::test]
    async fn test_linear_backoff_caps() {
        let mut policy = RetryPolicy::new(fast_config());
        let cancel = CancellationToken::new();

        let mut delays = Vec::new();
        for _ in 0..5 {
            policy.wait(&cancel).await.unwrap();
            delays.push(policy.current_delay());
        }

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(20),
                Duration::from_millis(30),
                Duration::from_millis(40),
                Duration::from_millis(40),
                Duration::from_millis(40),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_waits_two_to_five_seconds() {
        let config = RetryConfig::default();
        assert!(config.max_attempts.is_none());

        let mut policy = RetryPolicy::new(config);
        let cancel = CancellationToken::new();

        let mut waited = Vec::new();
        for _ in 0..5 {
            let start = tokio::time::Instant::now();
            policy.wait(&cancel).await.unwrap();
            waited.push(start.elapsed().as_secs());
        }
        assert_eq!(waited, vec![2, 3, 4, 5, 5]);
        assert_eq!(policy.attempt(), 5);
    }

    #[tokio::test]
    async fn test_max_attempts() {
        let mut policy = RetryPolicy::new(RetryConfig {
            max_attempts: Some(2),
            ..fast_config()
        });
        let cancel = CancellationToken::new();

        assert!(policy.wait(&cancel).await.is_ok());
        assert!(policy.wait(&cancel).await.is_ok());
        assert!(matches!(
            policy.wait(&cancel).await,
            Err(RetryError::MaxAttemptsReached)
        ));
    }

    #[tokio::test]
    async fn test_wait_is_cancellable() {
        let mut policy = RetryPolicy::new(RetryConfig {
            step: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            max_attempts: None,
        });
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(matches!(
            policy.wait(&cancel).await,
            Err(RetryError::Cancelled)
        ));
    }
}
