//! Per-key rate limiters: token bucket and sliding window.
//!
//! Both strategies compute capacity from elapsed time at the moment a request
//! is checked; there is no background refill task. A rejected request gets a
//! [`RateLimitExceeded`] carrying the key and how long to wait.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::Instant;

use super::keyed::Keyed;
use crate::error::RateLimitExceeded;

/// Per-key admission counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitMetrics {
    /// Every `check_limit` call, admitted or not.
    pub total_requests: u64,
    /// Calls rejected for lack of capacity.
    pub rate_limited_requests: u64,
    /// Reported retry-after on rejections plus time blocked in `handle_rate_limit`.
    pub total_wait_time_ms: u64,
}

/// Common interface of the rate-limiting strategies.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Admit one request for `key`, or reject it with the time to wait.
    fn check_limit(&self, key: &str) -> Result<(), RateLimitExceeded>;

    /// React to a downstream retry-after signal: exhaust local capacity for
    /// `key`, then block the caller for `retry_after`.
    async fn handle_rate_limit(&self, key: &str, retry_after: Duration);

    /// Counters for `key` (zeroed for unknown keys).
    fn metrics(&self, key: &str) -> RateLimitMetrics;

    /// Forget all state for `key`.
    fn reset(&self, key: &str);
}

fn at_least_one_ms(d: Duration) -> Duration {
    d.max(Duration::from_millis(1))
}

// ─── Token bucket ─────────────────────────────────────────────────────────────

/// Token bucket configuration.
#[derive(Debug, Clone)]
pub struct TokenBucketConfig {
    /// Bucket capacity; a fresh bucket starts full.
    pub max_tokens: u64,
    /// Tokens credited per elapsed `refill_interval`.
    pub refill_rate: u64,
    /// Refill granularity.
    pub refill_interval: Duration,
    /// Tokens consumed by one request.
    pub tokens_per_request: u64,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            max_tokens: 60,
            refill_rate: 1,
            refill_interval: Duration::from_secs(1),
            tokens_per_request: 1,
        }
    }
}

struct Bucket {
    tokens: u64,
    last_refill: Instant,
    metrics: RateLimitMetrics,
}

impl Bucket {
    fn new(config: &TokenBucketConfig) -> Self {
        Self {
            tokens: config.max_tokens,
            last_refill: Instant::now(),
            metrics: RateLimitMetrics::default(),
        }
    }

    /// Credit whole elapsed intervals. Partial progress toward the next
    /// interval is kept by advancing `last_refill` in whole intervals only.
    fn refill(&mut self, config: &TokenBucketConfig) {
        let now = Instant::now();
        if self.tokens >= config.max_tokens {
            self.last_refill = now;
            return;
        }
        let interval = config.refill_interval.as_nanos();
        if interval == 0 {
            self.tokens = config.max_tokens;
            self.last_refill = now;
            return;
        }
        let intervals = now.duration_since(self.last_refill).as_nanos() / interval;
        if intervals == 0 {
            return;
        }
        let credited = intervals.saturating_mul(u128::from(config.refill_rate));
        let tokens = (u128::from(self.tokens) + credited).min(u128::from(config.max_tokens));
        self.tokens = tokens as u64;
        if self.tokens >= config.max_tokens {
            self.last_refill = now;
        } else {
            self.last_refill += Duration::from_nanos((intervals * interval) as u64);
        }
    }

    fn wait_time(&self, config: &TokenBucketConfig) -> Duration {
        let deficit = config.tokens_per_request.saturating_sub(self.tokens);
        if deficit == 0 {
            return Duration::ZERO;
        }
        let rate = config.refill_rate.max(1);
        let intervals_needed = (deficit + rate - 1) / rate;
        let into_interval = self.last_refill.elapsed();
        let total = config
            .refill_interval
            .saturating_mul(u32::try_from(intervals_needed).unwrap_or(u32::MAX));
        at_least_one_ms(total.saturating_sub(into_interval))
    }
}

/// Token bucket limiter: bursts up to `max_tokens`, sustained
/// `refill_rate / refill_interval`.
pub struct TokenBucketLimiter {
    config: TokenBucketConfig,
    buckets: Keyed<Bucket>,
}

impl TokenBucketLimiter {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            config,
            buckets: Keyed::new(),
        }
    }

    /// Tokens currently available for `key` after refill.
    pub fn available_tokens(&self, key: &str) -> u64 {
        match self.buckets.get(key) {
            Some(bucket) => {
                let mut bucket = bucket.lock();
                bucket.refill(&self.config);
                bucket.tokens
            }
            None => self.config.max_tokens,
        }
    }

    /// Estimated wait before one request for `key` would be admitted.
    pub fn wait_time(&self, key: &str) -> Duration {
        match self.buckets.get(key) {
            Some(bucket) => {
                let mut bucket = bucket.lock();
                bucket.refill(&self.config);
                bucket.wait_time(&self.config)
            }
            None => Duration::ZERO,
        }
    }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    fn check_limit(&self, key: &str) -> Result<(), RateLimitExceeded> {
        let bucket = self.buckets.get_or_insert_with(key, || Bucket::new(&self.config));
        let mut bucket = bucket.lock();
        bucket.refill(&self.config);
        bucket.metrics.total_requests += 1;

        if bucket.tokens >= self.config.tokens_per_request {
            bucket.tokens -= self.config.tokens_per_request;
            return Ok(());
        }

        let retry_after = bucket.wait_time(&self.config);
        bucket.metrics.rate_limited_requests += 1;
        bucket.metrics.total_wait_time_ms += retry_after.as_millis() as u64;
        tracing::debug!(
            key = %key,
            tokens = bucket.tokens,
            retry_after_ms = retry_after.as_millis() as u64,
            "token bucket exhausted"
        );
        Err(RateLimitExceeded {
            key: key.to_string(),
            retry_after,
        })
    }

    async fn handle_rate_limit(&self, key: &str, retry_after: Duration) {
        {
            let bucket = self.buckets.get_or_insert_with(key, || Bucket::new(&self.config));
            let mut bucket = bucket.lock();
            bucket.tokens = 0;
            bucket.last_refill = Instant::now();
            bucket.metrics.total_wait_time_ms += retry_after.as_millis() as u64;
        }
        tracing::warn!(
            key = %key,
            retry_after_ms = retry_after.as_millis() as u64,
            "downstream rate limit, draining bucket and backing off"
        );
        tokio::time::sleep(retry_after).await;
    }

    fn metrics(&self, key: &str) -> RateLimitMetrics {
        self.buckets
            .get(key)
            .map(|b| b.lock().metrics.clone())
            .unwrap_or_default()
    }

    fn reset(&self, key: &str) {
        self.buckets.remove(key);
    }
}

// ─── Sliding window ───────────────────────────────────────────────────────────

/// Sliding window configuration.
#[derive(Debug, Clone)]
pub struct SlidingWindowConfig {
    /// Requests admitted per trailing `window`.
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for SlidingWindowConfig {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window: Duration::from_secs(60),
        }
    }
}

struct Window {
    admitted: VecDeque<Instant>,
    metrics: RateLimitMetrics,
}

impl Window {
    fn new() -> Self {
        Self {
            admitted: VecDeque::new(),
            metrics: RateLimitMetrics::default(),
        }
    }

    fn purge(&mut self, window: Duration) {
        let now = Instant::now();
        while let Some(&oldest) = self.admitted.front() {
            if now.duration_since(oldest) >= window {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Sliding window limiter: at most `max_requests` admissions in any trailing
/// `window`.
pub struct SlidingWindowLimiter {
    config: SlidingWindowConfig,
    windows: Keyed<Window>,
}

impl SlidingWindowLimiter {
    pub fn new(config: SlidingWindowConfig) -> Self {
        Self {
            config,
            windows: Keyed::new(),
        }
    }

    /// Admissions still available for `key` in the current window.
    pub fn remaining(&self, key: &str) -> u32 {
        match self.windows.get(key) {
            Some(window) => {
                let mut window = window.lock();
                window.purge(self.config.window);
                self.config
                    .max_requests
                    .saturating_sub(window.admitted.len() as u32)
            }
            None => self.config.max_requests,
        }
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowLimiter {
    fn check_limit(&self, key: &str) -> Result<(), RateLimitExceeded> {
        let window = self.windows.get_or_insert_with(key, Window::new);
        let mut window = window.lock();
        window.purge(self.config.window);
        window.metrics.total_requests += 1;

        if window.admitted.len() < self.config.max_requests as usize {
            window.admitted.push_back(Instant::now());
            return Ok(());
        }

        let retry_after = match window.admitted.front() {
            Some(oldest) => at_least_one_ms(self.config.window.saturating_sub(oldest.elapsed())),
            // max_requests == 0: nothing will ever be admitted
            None => self.config.window,
        };
        window.metrics.rate_limited_requests += 1;
        window.metrics.total_wait_time_ms += retry_after.as_millis() as u64;
        tracing::debug!(
            key = %key,
            admitted = window.admitted.len(),
            retry_after_ms = retry_after.as_millis() as u64,
            "sliding window full"
        );
        Err(RateLimitExceeded {
            key: key.to_string(),
            retry_after,
        })
    }

    async fn handle_rate_limit(&self, key: &str, retry_after: Duration) {
        {
            let window = self.windows.get_or_insert_with(key, Window::new);
            let mut window = window.lock();
            window.admitted.clear();
            window.metrics.total_wait_time_ms += retry_after.as_millis() as u64;
        }
        tracing::warn!(
            key = %key,
            retry_after_ms = retry_after.as_millis() as u64,
            "downstream rate limit, clearing window and backing off"
        );
        tokio::time::sleep(retry_after).await;
    }

    fn metrics(&self, key: &str) -> RateLimitMetrics {
        self.windows
            .get(key)
            .map(|w| w.lock().metrics.clone())
            .unwrap_or_default()
    }

    fn reset(&self, key: &str) {
        self.windows.remove(key);
    }
}

/// Strategy selector used when building a limiter from configuration.
#[derive(Debug, Clone)]
pub enum RateLimitStrategy {
    TokenBucket(TokenBucketConfig),
    SlidingWindow(SlidingWindowConfig),
}

impl RateLimitStrategy {
    /// Build the configured limiter behind a shared trait object.
    pub fn build(self) -> Arc<dyn RateLimiter> {
        match self {
            Self::TokenBucket(config) => Arc::new(TokenBucketLimiter::new(config)),
            Self::SlidingWindow(config) => Arc::new(SlidingWindowLimiter::new(config)),
        }
    }
}

impl Default for RateLimitStrategy {
    fn default() -> Self {
        Self::TokenBucket(TokenBucketConfig::default())
    }
}
