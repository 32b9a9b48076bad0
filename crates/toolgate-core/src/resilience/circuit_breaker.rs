//! Per-key three-state circuit breaker: Closed → Open → Half-Open.
//!
//! State transitions:
//! - `Closed` → `Open`:     at least `minimum_requests` calls in the trailing
//!   `window` and the failure rate reaches `failure_threshold_percentage`
//! - `Open` → `Half-Open`:  `reset_timeout` has elapsed (checked lazily on the
//!   next call), or a health-check probe succeeds
//! - `Half-Open` → `Closed`: `success_threshold` consecutive successes
//! - `Half-Open` → `Open`:   any failure

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use super::keyed::Keyed;
use crate::error::{CallError, CircuitOpenError};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// All requests rejected until `reset_timeout` elapses.
    Open,
    /// Requests admitted to test whether the downstream has recovered.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration shared by every circuit of a [`CircuitBreaker`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failure rate (0–100) at or above which a closed circuit opens.
    pub failure_threshold_percentage: f64,
    /// Calls required in the window before the failure rate is considered.
    pub minimum_requests: u32,
    /// Trailing window of call outcomes used for the failure rate.
    pub window: Duration,
    /// Hard cap on records kept per circuit; oldest are dropped first.
    pub window_capacity: usize,
    /// How long to stay open before admitting half-open probes.
    pub reset_timeout: Duration,
    /// Consecutive half-open successes needed to close.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold_percentage: 50.0,
            minimum_requests: 10,
            window: Duration::from_secs(60),
            window_capacity: 1_000,
            reset_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

/// Point-in-time view of one circuit, for health endpoints and logs.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    pub key: String,
    pub state: CircuitState,
    pub window_size: usize,
    pub failure_rate: f64,
    pub consecutive_successes: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub rejected_requests: u64,
}

#[derive(Debug, Clone, Copy)]
struct CallRecord {
    at: Instant,
    success: bool,
}

struct Circuit {
    state: CircuitState,
    window: VecDeque<CallRecord>,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    total_requests: u64,
    total_successes: u64,
    total_failures: u64,
    rejected_requests: u64,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            window: VecDeque::new(),
            consecutive_successes: 0,
            opened_at: None,
            opened_at_wall: None,
            total_requests: 0,
            total_successes: 0,
            total_failures: 0,
            rejected_requests: 0,
        }
    }

    /// Current state, moving Open → HalfOpen once the reset timeout has passed.
    fn poll_state(&mut self, config: &CircuitBreakerConfig, key: &str) -> CircuitState {
        if self.state == CircuitState::Open {
            if let Some(opened_at) = self.opened_at {
                if opened_at.elapsed() >= config.reset_timeout {
                    self.half_open(key);
                }
            }
        }
        self.state
    }

    fn purge(&mut self, config: &CircuitBreakerConfig) {
        let now = Instant::now();
        while let Some(front) = self.window.front() {
            if now.duration_since(front.at) > config.window {
                self.window.pop_front();
            } else {
                break;
            }
        }
        while self.window.len() > config.window_capacity {
            self.window.pop_front();
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|r| !r.success).count();
        failures as f64 * 100.0 / self.window.len() as f64
    }

    fn record(&mut self, success: bool, config: &CircuitBreakerConfig, key: &str) {
        if success {
            self.total_successes += 1;
        } else {
            self.total_failures += 1;
        }

        match self.poll_state(config, key) {
            CircuitState::Closed => {
                self.window.push_back(CallRecord {
                    at: Instant::now(),
                    success,
                });
                self.purge(config);
                if self.window.len() >= config.minimum_requests as usize {
                    let rate = self.failure_rate();
                    if rate >= config.failure_threshold_percentage {
                        tracing::warn!(
                            key = %key,
                            failure_rate = rate,
                            window = self.window.len(),
                            "circuit breaker → open"
                        );
                        self.trip();
                    }
                }
            }
            CircuitState::HalfOpen => {
                if success {
                    self.consecutive_successes += 1;
                    if self.consecutive_successes >= config.success_threshold {
                        self.close();
                        tracing::info!(key = %key, "circuit breaker → closed");
                    }
                } else {
                    tracing::warn!(
                        key = %key,
                        streak = self.consecutive_successes,
                        "circuit breaker probe failed → open"
                    );
                    self.trip();
                }
            }
            // Outcome of a call admitted before the circuit opened.
            CircuitState::Open => {}
        }
    }

    fn trip(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.opened_at_wall = Some(Utc::now());
        self.consecutive_successes = 0;
    }

    fn half_open(&mut self, key: &str) {
        self.state = CircuitState::HalfOpen;
        self.consecutive_successes = 0;
        tracing::info!(key = %key, "circuit breaker → half-open");
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.window.clear();
        self.consecutive_successes = 0;
        self.opened_at = None;
        self.opened_at_wall = None;
    }

    fn open_error(&self, key: &str, config: &CircuitBreakerConfig) -> CircuitOpenError {
        let elapsed = self.opened_at.map(|t| t.elapsed()).unwrap_or_default();
        let retry_after = config.reset_timeout.saturating_sub(elapsed);
        let next_attempt_at = Utc::now()
            + chrono::Duration::from_std(retry_after).unwrap_or_else(|_| chrono::Duration::zero());
        CircuitOpenError {
            key: key.to_string(),
            next_attempt_at,
            retry_after,
        }
    }

    fn snapshot(&self, key: &str) -> CircuitSnapshot {
        CircuitSnapshot {
            key: key.to_string(),
            state: self.state,
            window_size: self.window.len(),
            failure_rate: self.failure_rate(),
            consecutive_successes: self.consecutive_successes,
            opened_at: self.opened_at_wall,
            total_requests: self.total_requests,
            total_successes: self.total_successes,
            total_failures: self.total_failures,
            rejected_requests: self.rejected_requests,
        }
    }
}

/// Thread-safe, per-key circuit breaker.
///
/// Circuits are created lazily on first use of a key. Each circuit sits behind
/// its own lock, so traffic on one key never waits on another.
#[derive(Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    circuits: Arc<Keyed<Circuit>>,
}

impl CircuitBreaker {
    /// Create a breaker with no circuits yet.
    ///
    /// `window_capacity` is raised to `minimum_requests` when set below it,
    /// otherwise the window could never hold enough calls to open.
    pub fn new(mut config: CircuitBreakerConfig) -> Self {
        let floor = (config.minimum_requests as usize).max(1);
        if config.window_capacity < floor {
            tracing::warn!(
                window_capacity = config.window_capacity,
                minimum_requests = config.minimum_requests,
                "circuit breaker window capacity raised to minimum requests"
            );
            config.window_capacity = floor;
        }
        Self {
            config,
            circuits: Arc::new(Keyed::new()),
        }
    }

    /// The configuration applied to every circuit.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn circuit(&self, key: &str) -> Arc<Mutex<Circuit>> {
        self.circuits.get_or_insert_with(key, Circuit::new)
    }

    fn existing(&self, key: &str) -> Option<Arc<Mutex<Circuit>>> {
        self.circuits.get(key)
    }

    /// Run `f` through the circuit for `key`.
    ///
    /// Fails fast with [`CallError::CircuitOpen`] while the circuit is open.
    /// Only [`CallError::Failed`] outcomes count as failures; rate-limit or
    /// open-circuit outcomes from an inner layer are passed through unrecorded.
    pub async fn execute<F, Fut, T, E>(&self, key: &str, f: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CallError<E>>>,
    {
        self.try_acquire(key)?;
        let result = f().await;
        match &result {
            Ok(_) => self.record_success(key),
            Err(CallError::Failed(_)) => self.record_failure(key),
            Err(_) => {}
        }
        result
    }

    /// Admit or reject one request for `key` without running anything.
    ///
    /// Callers using this directly must report the outcome with
    /// [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure).
    pub fn try_acquire(&self, key: &str) -> Result<(), CircuitOpenError> {
        let circuit = self.circuit(key);
        let mut circuit = circuit.lock();
        circuit.total_requests += 1;
        if circuit.poll_state(&self.config, key) == CircuitState::Open {
            circuit.rejected_requests += 1;
            let err = circuit.open_error(key, &self.config);
            tracing::debug!(key = %key, retry_after_ms = err.retry_after.as_millis() as u64, "circuit open, rejecting");
            return Err(err);
        }
        Ok(())
    }

    /// Record a successful call for `key`.
    pub fn record_success(&self, key: &str) {
        self.circuit(key).lock().record(true, &self.config, key);
    }

    /// Record a failed call for `key`.
    pub fn record_failure(&self, key: &str) {
        self.circuit(key).lock().record(false, &self.config, key);
    }

    /// Current state of `key`. Unknown keys are closed.
    pub fn state(&self, key: &str) -> CircuitState {
        match self.existing(key) {
            Some(circuit) => circuit.lock().poll_state(&self.config, key),
            None => CircuitState::Closed,
        }
    }

    /// Returns `true` if a request for `key` would be admitted now.
    pub fn is_allowed(&self, key: &str) -> bool {
        self.state(key) != CircuitState::Open
    }

    /// Snapshot of `key`'s circuit, if it has been used.
    pub fn snapshot(&self, key: &str) -> Option<CircuitSnapshot> {
        let circuit = self.existing(key)?;
        let mut circuit = circuit.lock();
        circuit.poll_state(&self.config, key);
        circuit.purge(&self.config);
        Some(circuit.snapshot(key))
    }

    /// Snapshots of every known circuit, sorted by key.
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        self.circuits
            .keys()
            .iter()
            .filter_map(|k| self.snapshot(k))
            .collect()
    }

    /// Force `key` open, e.g. on an operator's instruction.
    pub fn open(&self, key: &str) {
        self.circuit(key).lock().trip();
        tracing::warn!(key = %key, "circuit breaker manually opened");
    }

    /// Force `key` closed and clear its window.
    pub fn close(&self, key: &str) {
        self.circuit(key).lock().close();
        tracing::info!(key = %key, "circuit breaker manually closed");
    }

    /// Discard all state for `key`, counters included.
    pub fn reset(&self, key: &str) {
        self.circuits.remove(key);
    }

    /// Discard all circuits.
    pub fn reset_all(&self) {
        self.circuits.clear();
    }

    /// Run `probe`; if it reports healthy while `key` is open, move to half-open.
    ///
    /// Returns the probe's result.
    pub async fn health_check<F, Fut>(&self, key: &str, probe: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = bool>,
    {
        let healthy = probe().await;
        if healthy {
            if let Some(circuit) = self.existing(key) {
                let mut circuit = circuit.lock();
                if circuit.poll_state(&self.config, key) == CircuitState::Open {
                    circuit.half_open(key);
                }
            }
        }
        healthy
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("circuits", &self.circuits.len())
            .finish()
    }
}
