//! Bounded retry with a fixed delay
//!
//! Wraps any fallible async operation. Only errors reporting
//! [`Retryable::is_transient`] are retried; anything else ends the loop at
//! once. An operation gets `1 + max_retries` attempts in total.

use crate::error::Retryable;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

/// Final error of an operation together with the number of attempts spent
#[derive(Debug)]
pub struct Exhausted<E> {
    pub error: E,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    /// Single attempt, no waiting
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Run `op` until it succeeds, fails permanently or runs out of attempts.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, Exhausted<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(what, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                },
                Err(error) if error.is_transient() && attempt < max_attempts => {
                    warn!(
                        what,
                        attempt,
                        max_attempts,
                        delay_ms = self.delay.as_millis() as u64,
                        error = %error,
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                },
                Err(error) => {
                    return Err(Exhausted {
                        error,
                        attempts: attempt,
                    })
                },
            }
        }
    }
}
