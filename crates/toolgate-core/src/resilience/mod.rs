//! Resilience primitives for downstream calls.
//!
//! Composed by [`ResilienceGuard`] in this order:
//! ```text
//! Request → [CircuitBreaker] → [Retry] → [RateLimiter] → downstream
//! ```

pub mod circuit_breaker;
pub mod guard;
mod keyed;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
pub use guard::ResilienceGuard;
pub use rate_limiter::{
    RateLimitMetrics, RateLimitStrategy, RateLimiter, SlidingWindowConfig, SlidingWindowLimiter,
    TokenBucketConfig, TokenBucketLimiter,
};
pub use retry::{RetryConfig, RetryHandler, RetryMetrics};
