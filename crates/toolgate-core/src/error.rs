//! Typed outcomes for guarded downstream calls.
//!
//! Admission-control signals (an exhausted rate limit, an open circuit) are
//! first-class variants rather than opaque errors, so callers can branch on
//! them and read the structured retry metadata directly.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// A rate limiter rejected the request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rate limit exceeded for '{key}' (retry after {}ms)", .retry_after.as_millis())]
pub struct RateLimitExceeded {
    /// Limiter key that ran out of capacity.
    pub key: String,
    /// Time until enough capacity is available for one request.
    pub retry_after: Duration,
}

/// A circuit breaker short-circuited the request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit open for '{key}' (next attempt at {next_attempt_at})")]
pub struct CircuitOpenError {
    /// Circuit key that is open.
    pub key: String,
    /// Wall-clock time at which the circuit will admit a probe.
    pub next_attempt_at: DateTime<Utc>,
    /// Time remaining until `next_attempt_at`.
    pub retry_after: Duration,
}

/// Outcome of a call made through the resilience primitives.
///
/// `E` is the caller's own error type for genuine downstream failures.
#[derive(Debug, Clone, Error)]
pub enum CallError<E> {
    /// Rejected by a rate limiter; never retried.
    #[error(transparent)]
    RateLimited(#[from] RateLimitExceeded),

    /// Rejected by an open circuit; never retried.
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    /// The downstream call itself failed.
    #[error("{0}")]
    Failed(E),
}

impl<E> CallError<E> {
    /// Returns `true` for deliberate backpressure (rate limit, open circuit).
    pub fn is_admission_control(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::CircuitOpen(_))
    }

    /// Suggested wait before the next attempt, when the outcome carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited(e) => Some(e.retry_after),
            Self::CircuitOpen(e) => Some(e.retry_after),
            Self::Failed(_) => None,
        }
    }

    /// The downstream failure, if this is one.
    pub fn failure(&self) -> Option<&E> {
        match self {
            Self::Failed(e) => Some(e),
            _ => None,
        }
    }

    /// Convert the failure payload, keeping admission-control variants.
    pub fn map_failure<F>(self, f: impl FnOnce(E) -> F) -> CallError<F> {
        match self {
            Self::RateLimited(e) => CallError::RateLimited(e),
            Self::CircuitOpen(e) => CallError::CircuitOpen(e),
            Self::Failed(e) => CallError::Failed(f(e)),
        }
    }
}

/// Classifies an error as transient (worth retrying) or permanent.
pub trait Retryable {
    /// Returns `true` if a later attempt may succeed.
    fn is_retryable(&self) -> bool;
}

impl<E: Retryable> Retryable for CallError<E> {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Failed(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Errors surfaced by [`IdempotencyStore::with_idempotency`].
///
/// [`IdempotencyStore::with_idempotency`]: crate::idempotency::IdempotencyStore::with_idempotency
#[derive(Debug, Clone, Error)]
pub enum IdempotencyError<E> {
    /// Another caller holds a pending record for this key.
    #[error("operation '{key}' is already in progress")]
    InProgress { key: String },

    /// An earlier execution failed; its error is replayed verbatim.
    #[error("cached failure for '{key}': {error}")]
    CachedFailure { key: String, error: E },

    /// This call executed the operation and it failed.
    #[error("{0}")]
    Failed(E),
}

impl<E> IdempotencyError<E> {
    /// The underlying operation error, whether fresh or replayed.
    pub fn operation_error(&self) -> Option<&E> {
        match self {
            Self::InProgress { .. } => None,
            Self::CachedFailure { error, .. } => Some(error),
            Self::Failed(e) => Some(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct Flaky(bool);

    impl std::fmt::Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "flaky({})", self.0)
        }
    }

    impl Retryable for Flaky {
        fn is_retryable(&self) -> bool {
            self.0
        }
    }

    #[test]
    fn admission_control_is_never_retryable() {
        let limited: CallError<Flaky> = RateLimitExceeded {
            key: "github".into(),
            retry_after: Duration::from_millis(250),
        }
        .into();
        assert!(limited.is_admission_control());
        assert!(!limited.is_retryable());
        assert_eq!(limited.retry_after(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn failure_defers_to_inner_classification() {
        assert!(CallError::Failed(Flaky(true)).is_retryable());
        assert!(!CallError::Failed(Flaky(false)).is_retryable());
        assert!(CallError::Failed(Flaky(true)).retry_after().is_none());
    }

    #[test]
    fn map_failure_keeps_admission_variants() {
        let open: CallError<Flaky> = CircuitOpenError {
            key: "jira".into(),
            next_attempt_at: Utc::now(),
            retry_after: Duration::from_secs(1),
        }
        .into();
        let mapped = open.map_failure(|f| f.to_string());
        assert!(matches!(mapped, CallError::CircuitOpen(ref e) if e.key == "jira"));
    }
}
