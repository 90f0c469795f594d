use std::cmp::min;
use std::future::Future;
use tokio::time::{sleep, Duration};

use crate::errors::AppResult;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(120),
            exponential_base: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let delay_ms = self.base_delay.as_millis() as f64
            * self.exponential_base.powi(attempt.saturating_sub(1) as i32);

        let delay = Duration::from_millis(delay_ms as u64);
        min(delay, self.max_delay)
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or the
/// retry budget is spent. Intermediate failures are only logged.
pub async fn with_backoff<T, F, Fut>(
    config: &RetryConfig,
    label: &str,
    mut operation: F,
) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if e.is_retryable() && attempt <= config.max_retries {
                    // Throttled responses carry the server's own wait.
                    let delay = e
                        .retry_after()
                        .map(|wait| min(wait, config.max_delay))
                        .unwrap_or_else(|| config.backoff_delay(attempt));
                    log::warn!(
                        "{} attempt {} failed, retrying in {:?}: {}",
                        label,
                        attempt,
                        delay,
                        e
                    );
                    sleep(delay).await;
                    continue;
                }

                if e.is_retryable() {
                    log::error!(
                        "{} giving up after {} attempts: {}",
                        label,
                        attempt,
                        e
                    );
                } else if e.is_permanent() {
                    log::debug!("{} failed permanently, not retrying: {}", label, e);
                }
                return Err(e);
            }
        }
    }
}
