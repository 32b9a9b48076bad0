//! Exponential backoff retry with bounded random jitter.
//!
//! Delay before retry `n` (1-based) is
//! `min(max_delay, initial_delay * multiplier^(n-1)) + uniform(0, max_jitter)`.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;

use crate::error::{CallError, Retryable};

/// Configuration for the retry handler.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, counting the first try.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap on the exponential part of the delay.
    pub max_delay: Duration,
    /// Multiplier applied per retry.
    pub backoff_multiplier: f64,
    /// Upper bound of the uniform jitter added to every delay.
    pub max_jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            max_jitter: Duration::from_millis(100),
        }
    }
}

impl RetryConfig {
    /// Backoff before retry `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_ms = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exp);
        let cap_ms = self.max_delay.as_millis() as f64;
        Duration::from_millis(base_ms.min(cap_ms).max(0.0) as u64)
    }

    /// Backoff before retry `attempt` (1-based), with jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay(attempt) + jitter(self.max_jitter)
    }
}

/// Uniform jitter in `[0, max)`.
fn jitter(max: Duration) -> Duration {
    let max_ns = max.as_nanos().min(u64::MAX as u128) as u64;
    if max_ns == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rand::thread_rng().gen_range(0..max_ns))
}

/// Outcome of the handler's most recent run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryMetrics {
    pub total_attempts: u32,
    pub succeeded: bool,
}

/// Runs an async operation, retrying failures with backoff.
///
/// Admission-control outcomes ([`CallError::RateLimited`],
/// [`CallError::CircuitOpen`]) are returned immediately and never retried.
#[derive(Debug)]
pub struct RetryHandler {
    config: RetryConfig,
    last_run: Mutex<RetryMetrics>,
}

impl RetryHandler {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            last_run: Mutex::new(RetryMetrics::default()),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Metrics for the most recently finished run.
    pub fn last_run(&self) -> RetryMetrics {
        *self.last_run.lock()
    }

    /// Retry every failure until attempts run out.
    pub async fn retry<F, Fut, T, E>(&self, f: F) -> Result<T, CallError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError<E>>>,
        E: std::fmt::Display,
    {
        self.retry_if(f, |_: &E| true).await
    }

    /// Retry failures the error type itself classifies as transient.
    pub async fn retry_classified<F, Fut, T, E>(&self, f: F) -> Result<T, CallError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError<E>>>,
        E: std::fmt::Display + Retryable,
    {
        self.retry_if(f, |e: &E| e.is_retryable()).await
    }

    /// Retry failures accepted by `predicate`.
    pub async fn retry_if<F, Fut, T, E, P>(&self, mut f: F, predicate: P) -> Result<T, CallError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError<E>>>,
        E: std::fmt::Display,
        P: Fn(&E) -> bool,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match f().await {
                Ok(value) => {
                    self.finish(attempt, true);
                    return Ok(value);
                }
                Err(err) => err,
            };

            let retryable = match &err {
                CallError::Failed(e) => predicate(e),
                _ => false,
            };
            if !retryable || attempt >= max_attempts {
                if retryable {
                    tracing::error!(attempt, error = %err, "max retry attempts exceeded");
                }
                self.finish(attempt, false);
                return Err(err);
            }

            let delay = self.config.delay_for_attempt(attempt);
            tracing::warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying operation"
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn finish(&self, total_attempts: u32, succeeded: bool) {
        *self.last_run.lock() = RetryMetrics {
            total_attempts,
            succeeded,
        };
    }
}

impl Default for RetryHandler {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
