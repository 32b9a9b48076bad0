//! Gateway configuration, loaded from YAML or JSON.
//!
//! Durations are integer milliseconds on the wire (`*Ms` fields) and are
//! converted into the runtime `*Config` types of `toolgate-core`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use toolgate_core::resilience::{
    CircuitBreakerConfig, RateLimitStrategy, RetryConfig, SlidingWindowConfig, TokenBucketConfig,
};
use toolgate_core::{CircuitBreaker, IdempotencyOptions, RateLimiter, ResilienceGuard, RetryHandler};

use crate::audit::{AuditSink, JsonlAuditSink, TracingAuditSink};
use crate::error::ConfigError;

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

fn bool_true() -> bool {
    true
}

// ─── Circuit breaker ──────────────────────────────────────────────────────────

fn default_failure_threshold() -> f64 {
    50.0
}
fn default_minimum_requests() -> u32 {
    10
}
fn default_window_ms() -> u64 {
    60_000
}
fn default_window_capacity() -> usize {
    1_000
}
fn default_reset_timeout_ms() -> u64 {
    30_000
}
fn default_success_threshold() -> u32 {
    2
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CircuitBreakerSection {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold_percentage: f64,
    #[serde(default = "default_minimum_requests")]
    pub minimum_requests: u32,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_window_capacity")]
    pub window_capacity: usize,
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold_percentage: default_failure_threshold(),
            minimum_requests: default_minimum_requests(),
            window_ms: default_window_ms(),
            window_capacity: default_window_capacity(),
            reset_timeout_ms: default_reset_timeout_ms(),
            success_threshold: default_success_threshold(),
        }
    }
}

impl CircuitBreakerSection {
    pub fn to_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold_percentage: self.failure_threshold_percentage,
            minimum_requests: self.minimum_requests,
            window: ms(self.window_ms),
            window_capacity: self.window_capacity,
            reset_timeout: ms(self.reset_timeout_ms),
            success_threshold: self.success_threshold,
        }
    }
}

// ─── Rate limiter ─────────────────────────────────────────────────────────────

fn default_max_tokens() -> u64 {
    60
}
fn default_refill_rate() -> u64 {
    1
}
fn default_refill_interval_ms() -> u64 {
    1_000
}
fn default_tokens_per_request() -> u64 {
    1
}
fn default_max_requests() -> u32 {
    60
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBucketSection {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,
    #[serde(default = "default_refill_rate")]
    pub refill_rate: u64,
    #[serde(default = "default_refill_interval_ms")]
    pub refill_interval_ms: u64,
    #[serde(default = "default_tokens_per_request")]
    pub tokens_per_request: u64,
}

impl Default for TokenBucketSection {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            refill_rate: default_refill_rate(),
            refill_interval_ms: default_refill_interval_ms(),
            tokens_per_request: default_tokens_per_request(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlidingWindowSection {
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
}

impl Default for SlidingWindowSection {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_ms: default_window_ms(),
        }
    }
}

/// Rate limiter selection, tagged by `strategy`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RateLimiterSection {
    TokenBucket(TokenBucketSection),
    SlidingWindow(SlidingWindowSection),
    Disabled,
}

impl Default for RateLimiterSection {
    fn default() -> Self {
        Self::TokenBucket(TokenBucketSection::default())
    }
}

impl RateLimiterSection {
    /// Runtime strategy, or `None` when disabled.
    pub fn to_strategy(&self) -> Option<RateLimitStrategy> {
        match self {
            Self::TokenBucket(s) => Some(RateLimitStrategy::TokenBucket(TokenBucketConfig {
                max_tokens: s.max_tokens,
                refill_rate: s.refill_rate,
                refill_interval: ms(s.refill_interval_ms),
                tokens_per_request: s.tokens_per_request,
            })),
            Self::SlidingWindow(s) => Some(RateLimitStrategy::SlidingWindow(SlidingWindowConfig {
                max_requests: s.max_requests,
                window: ms(s.window_ms),
            })),
            Self::Disabled => None,
        }
    }
}

// ─── Retry ────────────────────────────────────────────────────────────────────

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay_ms() -> u64 {
    100
}
fn default_max_delay_ms() -> u64 {
    10_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_jitter_ms() -> u64 {
    100
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_jitter_ms: default_max_jitter_ms(),
        }
    }
}

impl RetrySection {
    pub fn to_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            initial_delay: ms(self.initial_delay_ms),
            max_delay: ms(self.max_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
            max_jitter: ms(self.max_jitter_ms),
        }
    }
}

// ─── Idempotency ──────────────────────────────────────────────────────────────

fn default_ttl_ms() -> u64 {
    24 * 60 * 60 * 1_000
}
fn default_sweep_interval_ms() -> u64 {
    5 * 60 * 1_000
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IdempotencySection {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
    /// Report a duplicate of a still-running step as a successful in-flight
    /// hit with `null` output instead of an in-progress error.
    #[serde(default)]
    pub allow_pending: bool,
    /// `0` disables the background sweeper.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for IdempotencySection {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_ms: default_ttl_ms(),
            allow_pending: false,
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl IdempotencySection {
    pub fn to_options(&self) -> IdempotencyOptions {
        IdempotencyOptions {
            ttl: ms(self.ttl_ms),
            allow_pending: self.allow_pending,
        }
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_ms > 0).then(|| ms(self.sweep_interval_ms))
    }
}

// ─── Audit / log ──────────────────────────────────────────────────────────────

fn default_audit_timeout_ms() -> u64 {
    2_000
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AuditSection {
    #[serde(default = "default_audit_timeout_ms")]
    pub timeout_ms: u64,
    /// JSON Lines file; entries go to the log when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            timeout_ms: default_audit_timeout_ms(),
            path: None,
        }
    }
}

impl AuditSection {
    pub fn timeout(&self) -> Duration {
        ms(self.timeout_ms)
    }

    pub fn build_sink(&self) -> Arc<dyn AuditSink> {
        match &self.path {
            Some(path) => Arc::new(JsonlAuditSink::new(path)),
            None => Arc::new(TracingAuditSink),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LogSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Per-target directives, e.g. `toolgate_core=debug`.
    #[serde(default)]
    pub components: Vec<String>,
    #[serde(default)]
    pub json: bool,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            components: Vec::new(),
            json: false,
        }
    }
}

// ─── Root ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSection,
    #[serde(default)]
    pub rate_limiter: RateLimiterSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub idempotency: IdempotencySection,
    #[serde(default)]
    pub audit: AuditSection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_path: Option<PathBuf>,
    #[serde(default)]
    pub log: LogSection,
}

impl GatewayConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file; `.json` is parsed as JSON, anything else as YAML.
    ///
    /// A relative `policyPath` is resolved against the config file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        let mut config = if is_json {
            Self::from_json_str(&text)?
        } else {
            Self::from_yaml_str(&text)?
        };
        if let (Some(policy), Some(dir)) = (&config.policy_path, path.parent()) {
            if policy.is_relative() {
                config.policy_path = Some(dir.join(policy));
            }
        }
        Ok(config)
    }

    /// Reject values the runtime types cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let cb = &self.circuit_breaker;
        if !(cb.failure_threshold_percentage > 0.0 && cb.failure_threshold_percentage <= 100.0) {
            return Err(ConfigError::Invalid(format!(
                "circuitBreaker.failureThresholdPercentage must be in (0, 100], got {}",
                cb.failure_threshold_percentage
            )));
        }
        if cb.success_threshold == 0 {
            return Err(ConfigError::Invalid(
                "circuitBreaker.successThreshold must be at least 1".into(),
            ));
        }
        if cb.window_capacity == 0 {
            return Err(ConfigError::Invalid(
                "circuitBreaker.windowCapacity must be at least 1".into(),
            ));
        }
        if cb.window_capacity < cb.minimum_requests as usize {
            return Err(ConfigError::Invalid(format!(
                "circuitBreaker.windowCapacity ({}) is below minimumRequests ({}), the circuit could never open",
                cb.window_capacity, cb.minimum_requests
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.maxAttempts must be at least 1".into()));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "retry.backoffMultiplier must be at least 1.0".into(),
            ));
        }
        match &self.rate_limiter {
            RateLimiterSection::TokenBucket(s) => {
                if s.max_tokens == 0 || s.refill_rate == 0 || s.refill_interval_ms == 0 {
                    return Err(ConfigError::Invalid(
                        "rateLimiter.maxTokens, refillRate and refillIntervalMs must be positive".into(),
                    ));
                }
                if s.tokens_per_request > s.max_tokens {
                    return Err(ConfigError::Invalid(
                        "rateLimiter.tokensPerRequest exceeds maxTokens".into(),
                    ));
                }
            }
            RateLimiterSection::SlidingWindow(s) => {
                if s.max_requests == 0 || s.window_ms == 0 {
                    return Err(ConfigError::Invalid(
                        "rateLimiter.maxRequests and windowMs must be positive".into(),
                    ));
                }
            }
            RateLimiterSection::Disabled => {}
        }
        Ok(())
    }

    /// Breaker, retry handler and optional limiter, composed.
    pub fn build_guard(&self) -> ResilienceGuard {
        let breaker = CircuitBreaker::new(self.circuit_breaker.to_config());
        let retry = Arc::new(RetryHandler::new(self.retry.to_config()));
        let guard = ResilienceGuard::new(breaker, retry);
        match self.rate_limiter.to_strategy() {
            Some(strategy) => {
                let limiter: Arc<dyn RateLimiter> = strategy.build();
                guard.with_rate_limiter(limiter)
            }
            None => guard,
        }
    }
}
