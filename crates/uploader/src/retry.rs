//! Bounded retry with exponential backoff.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::TransportError;

/// How many times a failed call is attempted and how long to wait in between.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Backoff cap.
    pub max_delay: Duration,
    /// Multiplier for each subsequent attempt.
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            backoff_factor: 2.0,
        }
    }
}

/// Why [`RetryPolicy::run`] gave up.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryError {
    /// The cancellation token fired.
    Cancelled,
    /// A non-retriable error ended the loop early.
    Fatal { attempts: u32, error: TransportError },
    /// Every allowed attempt failed with a retriable error.
    Exhausted { attempts: u32, error: TransportError },
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
    }

    /// Runs `attempt_fn` until it succeeds, fails fatally, runs out of
    /// attempts or `cancel` fires.
    ///
    /// `attempt_fn` receives the 1-based attempt number. Cancellation
    /// interrupts both an attempt in progress and a backoff sleep.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut attempt_fn: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                r = attempt_fn(attempt) => r,
            };

            let error = match result {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !error.is_retriable() {
                return Err(RetryError::Fatal {
                    attempts: attempt,
                    error,
                });
            }
            if attempt >= max_attempts {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    error,
                });
            }

            let delay = self.delay_for_attempt(attempt);
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "transient failure, retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}
