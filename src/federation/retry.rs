//! Retry with exponential backoff for transport failures.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

/// Bounded exponential backoff: the delay before retry `n` (0-based) is
/// `base * 2^n`, capped at `max_delay`, optionally with up to 50% jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts (tests).
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Delay before retry number `retry` (0 for the first retry).
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        let delay = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        if self.jitter && !delay.is_zero() {
            let spread = rand::thread_rng().gen_range(0.0..0.5);
            delay.mul_f64(1.0 - spread)
        } else {
            delay
        }
    }

    /// Longest time one call can take when every attempt runs into
    /// `request_timeout`, counting the full backoff between attempts.
    pub fn worst_case(&self, request_timeout: Duration) -> Duration {
        let attempts = self.max_attempts.max(1);
        let backoff: Duration = (0..attempts - 1)
            .map(|retry| {
                self.base_delay
                    .checked_mul(2u32.saturating_pow(retry))
                    .unwrap_or(self.max_delay)
                    .min(self.max_delay)
            })
            .sum();
        request_timeout.saturating_mul(attempts) + backoff
    }

    /// Run `f` until it succeeds or the attempts are used up. Returns the
    /// last error and the number of attempts made.
    pub async fn run<F, Fut, T, E>(&self, mut f: F) -> Result<T, (E, u32)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    if attempt >= attempts {
                        return Err((e, attempt));
                    }
                    let delay = self.delay(attempt - 1);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying after transport failure");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
