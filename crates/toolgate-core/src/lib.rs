//! toolgate-core: resilience primitives for the toolgate gateway.
//!
//! # Overview
//!
//! Every call a workflow makes to an external tool provider can be wrapped in
//! the primitives defined here:
//!
//! - [`resilience`] module: circuit breaker, token-bucket and sliding-window
//!   rate limiters, retry with jittered backoff, and [`ResilienceGuard`]
//!   composing them
//! - [`idempotency`] module: at-most-once execution ledger keyed by
//!   [`IdempotencyKey`]
//! - [`CallError`]: typed outcome separating admission control (rate limited,
//!   circuit open) from genuine downstream failures
//! - [`hash_input`]: short stable digest of a JSON input
//!
//! All state is in-process and keyed by caller-chosen strings, typically a
//! connector or provider id.

pub mod error;
pub mod hashing;
pub mod idempotency;
pub mod resilience;

pub use error::{CallError, CircuitOpenError, IdempotencyError, RateLimitExceeded, Retryable};
pub use hashing::hash_input;
pub use idempotency::{
    Idempotent, IdempotencyKey, IdempotencyOptions, IdempotencyRecord, IdempotencyStatus,
    IdempotencyStore, RecordOutcome,
};
pub use resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, RateLimitStrategy, RateLimiter,
    ResilienceGuard, RetryConfig, RetryHandler,
};
