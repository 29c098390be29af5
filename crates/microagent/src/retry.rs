use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::errors::LlmError;

/// Exponential backoff with random jitter for model calls
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            min_delay,
            max_delay,
        }
    }

    /// A policy that tries once and never sleeps
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Random delay in `[min, min(max, min * 2^attempt)]`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.min_delay.as_secs_f64().max(0.001);
        let ceiling = (base * 2f64.powi(attempt.min(32) as i32)).min(self.max_delay.as_secs_f64());
        if ceiling <= 0.0 {
            return self.min_delay;
        }
        let jittered = rand::thread_rng().gen_range(0.0..=ceiling);
        Duration::from_secs_f64(jittered).max(self.min_delay)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or attempts run out
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, LlmError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(attempt, error = %err, ?delay, "model call failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
