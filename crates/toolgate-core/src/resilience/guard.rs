//! Composition of breaker, retry and rate limiter around one downstream call.
//!
//! ```text
//! call(key, f) = breaker.execute(key,
//!                    retry(|| { limiter.check_limit(key)?; f() }))
//! ```
//!
//! Rate-limit and open-circuit outcomes are deliberate backpressure and are
//! never retried; a whole retry sequence counts as one outcome for the breaker.

use std::future::Future;
use std::sync::Arc;

use futures::future::{self, Either};
use futures::TryFutureExt;

use super::circuit_breaker::CircuitBreaker;
use super::rate_limiter::RateLimiter;
use super::retry::RetryHandler;
use crate::error::{CallError, RateLimitExceeded, Retryable};

/// A fully resilient wrapper for downstream calls, shared via `Arc`.
#[derive(Clone)]
pub struct ResilienceGuard {
    breaker: CircuitBreaker,
    retry: Arc<RetryHandler>,
    limiter: Option<Arc<dyn RateLimiter>>,
}

impl ResilienceGuard {
    /// Guard with a breaker and retry handler, no rate limiting.
    pub fn new(breaker: CircuitBreaker, retry: Arc<RetryHandler>) -> Self {
        Self {
            breaker,
            retry,
            limiter: None,
        }
    }

    /// Check `limiter` before every attempt.
    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn retry_handler(&self) -> &RetryHandler {
        &self.retry
    }

    pub fn rate_limiter(&self) -> Option<&Arc<dyn RateLimiter>> {
        self.limiter.as_ref()
    }

    fn admit(&self, key: &str) -> Result<(), RateLimitExceeded> {
        match &self.limiter {
            Some(limiter) => limiter.check_limit(key),
            None => Ok(()),
        }
    }

    /// Run `f` under the guard, retrying failures the error classifies as
    /// transient.
    pub async fn call<F, Fut, T, E>(&self, key: &str, f: F) -> Result<T, CallError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display + Retryable,
    {
        self.call_if(key, f, |e: &E| e.is_retryable()).await
    }

    /// Run `f` under the guard, retrying failures accepted by `predicate`.
    pub async fn call_if<F, Fut, T, E, P>(
        &self,
        key: &str,
        mut f: F,
        predicate: P,
    ) -> Result<T, CallError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        P: Fn(&E) -> bool,
    {
        let attempt = || match self.admit(key) {
            Ok(()) => Either::Left(f().map_err(CallError::Failed)),
            Err(limited) => Either::Right(future::ready(Err(CallError::RateLimited(limited)))),
        };
        self.breaker
            .execute(key, || self.retry.retry_if(attempt, predicate))
            .await
    }
}

impl std::fmt::Debug for ResilienceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceGuard")
            .field("breaker", &self.breaker)
            .field("retry", &self.retry.config())
            .field("rate_limited", &self.limiter.is_some())
            .finish()
    }
}
