//! Idempotency ledger: run an operation at most once per key.
//!
//! The first caller for a key inserts a pending record and executes; later
//! callers receive the cached result, the cached error, or an in-progress
//! signal. Claiming a key is a single locked check-and-insert, so two
//! concurrent callers can never both execute.
//!
//! Records expire `ttl` after creation. Expiry is passive: an expired record
//! reads as absent. [`IdempotencyStore::cleanup`] (or a task started with
//! [`IdempotencyStore::spawn_sweeper`]) reclaims the memory.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::IdempotencyError;
use crate::hashing::hash_input;

/// Default record lifetime: 24 hours.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Composite key identifying one logical side effect of a workflow step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyKey {
    pub run_id: String,
    pub step_id: String,
    pub operation: String,
    pub input_hash: String,
}

impl IdempotencyKey {
    pub fn new(
        run_id: impl Into<String>,
        step_id: impl Into<String>,
        operation: impl Into<String>,
        input_hash: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            step_id: step_id.into(),
            operation: operation.into(),
            input_hash: input_hash.into(),
        }
    }

    /// Key whose hash component is derived from `input`.
    pub fn for_input(
        run_id: impl Into<String>,
        step_id: impl Into<String>,
        operation: impl Into<String>,
        input: &Value,
    ) -> Self {
        Self::new(run_id, step_id, operation, hash_input(input))
    }
}

/// Components joined with `:`. A `:` or `%` inside a component is written as
/// `%3A` / `%25`, so distinct keys never render to the same string.
impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = [&self.run_id, &self.step_id, &self.operation, &self.input_hash];
        for (i, part) in parts.into_iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write_escaped(f, part)?;
        }
        Ok(())
    }
}

fn write_escaped(f: &mut fmt::Formatter<'_>, part: &str) -> fmt::Result {
    let mut rest = part;
    while let Some(at) = rest.find([':', '%']) {
        f.write_str(&rest[..at])?;
        f.write_str(if rest.as_bytes()[at] == b':' { "%3A" } else { "%25" })?;
        rest = &rest[at + 1..];
    }
    f.write_str(rest)
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdempotencyStatus {
    Pending,
    Completed,
    Failed,
}

/// Stored outcome of an operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "value", rename_all = "lowercase")]
pub enum RecordOutcome<T, E> {
    Pending,
    Completed(T),
    Failed(E),
}

/// A ledger entry as seen by readers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord<T, E> {
    pub key: String,
    pub outcome: RecordOutcome<T, E>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl<T, E> IdempotencyRecord<T, E> {
    pub fn status(&self) -> IdempotencyStatus {
        match self.outcome {
            RecordOutcome::Pending => IdempotencyStatus::Pending,
            RecordOutcome::Completed(_) => IdempotencyStatus::Completed,
            RecordOutcome::Failed(_) => IdempotencyStatus::Failed,
        }
    }
}

struct Entry<T, E> {
    record: IdempotencyRecord<T, E>,
    /// `None` when the TTL overflows the clock.
    deadline: Option<Instant>,
    /// Identifies the execution that owns a pending record.
    token: u64,
}

impl<T, E> Entry<T, E> {
    fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }
}

/// Per-call options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyOptions {
    pub ttl: Duration,
    /// Return [`Idempotent::InFlight`] instead of
    /// [`IdempotencyError::InProgress`] when another caller holds the key.
    pub allow_pending: bool,
}

impl Default for IdempotencyOptions {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            allow_pending: false,
        }
    }
}

/// Successful result of [`IdempotencyStore::with_idempotency`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Idempotent<T> {
    /// This call executed the operation.
    Executed(T),
    /// A previous execution's result was replayed.
    Cached(T),
    /// Another caller is executing; only with `allow_pending`.
    InFlight,
}

impl<T> Idempotent<T> {
    pub fn is_cached(&self) -> bool {
        matches!(self, Self::Cached(_))
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Executed(v) | Self::Cached(v) => Some(v),
            Self::InFlight => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

type Records<T, E> = Mutex<HashMap<String, Entry<T, E>>>;

/// In-memory idempotency ledger.
///
/// `T` is the operation's success value, `E` its error. Both are cloned when
/// replayed to later callers.
pub struct IdempotencyStore<T, E> {
    records: Records<T, E>,
    defaults: IdempotencyOptions,
    next_token: AtomicU64,
}

impl<T, E> IdempotencyStore<T, E>
where
    T: Clone,
    E: Clone,
{
    pub fn new() -> Self {
        Self::with_defaults(IdempotencyOptions::default())
    }

    /// Store whose [`execute`](Self::execute) uses `defaults`.
    pub fn with_defaults(defaults: IdempotencyOptions) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            defaults,
            next_token: AtomicU64::new(1),
        }
    }

    pub fn defaults(&self) -> &IdempotencyOptions {
        &self.defaults
    }

    /// [`with_idempotency`](Self::with_idempotency) with the store defaults.
    pub async fn execute<F, Fut>(&self, key: &str, f: F) -> Result<Idempotent<T>, IdempotencyError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let options = self.defaults.clone();
        self.with_idempotency(key, &options, f).await
    }

    /// Execute `f` at most once for `key` while its record is live.
    ///
    /// - no live record: insert pending, run `f`, persist the outcome
    /// - completed: replay the result as [`Idempotent::Cached`]
    /// - failed: replay the error as [`IdempotencyError::CachedFailure`]
    /// - pending: [`IdempotencyError::InProgress`], or
    ///   [`Idempotent::InFlight`] with `allow_pending`
    ///
    /// If the returned future is dropped before `f` finishes, the pending
    /// record is released so the key can be claimed again.
    pub async fn with_idempotency<F, Fut>(
        &self,
        key: &str,
        options: &IdempotencyOptions,
        f: F,
    ) -> Result<Idempotent<T>, IdempotencyError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let token = match self.claim(key, options) {
            Claim::Owned(token) => token,
            Claim::Replay(outcome) => return outcome,
        };

        let mut release = PendingRelease {
            records: &self.records,
            key,
            token,
            armed: true,
        };
        let outcome = f().await;
        release.armed = false;

        let mut records = self.records.lock();
        let owned = records.get_mut(key).filter(|e| e.token == token);
        match outcome {
            Ok(value) => {
                if let Some(entry) = owned {
                    entry.record.outcome = RecordOutcome::Completed(value.clone());
                }
                tracing::debug!(key = %key, "idempotent operation completed");
                Ok(Idempotent::Executed(value))
            }
            Err(error) => {
                if let Some(entry) = owned {
                    entry.record.outcome = RecordOutcome::Failed(error.clone());
                }
                tracing::debug!(key = %key, "idempotent operation failed, caching error");
                Err(IdempotencyError::Failed(error))
            }
        }
    }

    fn claim(&self, key: &str, options: &IdempotencyOptions) -> Claim<T, E> {
        let mut records = self.records.lock();
        let now = Instant::now();
        if let Some(entry) = records.get(key).filter(|e| !e.is_expired(now)) {
            let replay = match &entry.record.outcome {
                RecordOutcome::Completed(value) => Ok(Idempotent::Cached(value.clone())),
                RecordOutcome::Failed(error) => Err(IdempotencyError::CachedFailure {
                    key: key.to_string(),
                    error: error.clone(),
                }),
                RecordOutcome::Pending if options.allow_pending => Ok(Idempotent::InFlight),
                RecordOutcome::Pending => Err(IdempotencyError::InProgress {
                    key: key.to_string(),
                }),
            };
            tracing::debug!(key = %key, status = ?entry.record.status(), "idempotency hit");
            return Claim::Replay(replay);
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let created_at = Utc::now();
        let expires_at = chrono::Duration::from_std(options.ttl)
            .ok()
            .and_then(|ttl| created_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        records.insert(
            key.to_string(),
            Entry {
                record: IdempotencyRecord {
                    key: key.to_string(),
                    outcome: RecordOutcome::Pending,
                    created_at,
                    expires_at,
                },
                deadline: now.checked_add(options.ttl),
                token,
            },
        );
        Claim::Owned(token)
    }

    /// The live record for `key`, if any.
    pub fn get(&self, key: &str) -> Option<IdempotencyRecord<T, E>> {
        let now = Instant::now();
        self.records
            .lock()
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.record.clone())
    }

    /// Forget `key`. Returns `true` if a record was removed.
    pub fn delete(&self, key: &str) -> bool {
        self.records.lock().remove(key).is_some()
    }

    /// Number of stored records, expired ones included until swept.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired records. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, e| !e.is_expired(now));
        let removed = before - records.len();
        if removed > 0 {
            tracing::debug!(removed, "swept expired idempotency records");
        }
        removed
    }
}

impl<T, E> IdempotencyStore<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Spawn a task calling [`cleanup`](Self::cleanup) every `interval`.
    ///
    /// The task exits once the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match store.upgrade() {
                    Some(store) => {
                        store.cleanup();
                    }
                    None => break,
                }
            }
        })
    }
}

impl<T: Clone, E: Clone> Default for IdempotencyStore<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> fmt::Debug for IdempotencyStore<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdempotencyStore")
            .field("records", &self.records.lock().len())
            .field("defaults", &self.defaults)
            .finish()
    }
}

enum Claim<T, E> {
    Owned(u64),
    Replay(Result<Idempotent<T>, IdempotencyError<E>>),
}

/// Removes a still-pending record if its execution is abandoned.
struct PendingRelease<'a, T, E> {
    records: &'a Records<T, E>,
    key: &'a str,
    token: u64,
    armed: bool,
}

impl<T, E> Drop for PendingRelease<'_, T, E> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut records = self.records.lock();
        let abandoned = records.get(self.key).is_some_and(|e| {
            e.token == self.token && matches!(e.record.outcome, RecordOutcome::Pending)
        });
        if abandoned {
            records.remove(self.key);
            tracing::debug!(key = %self.key, "released abandoned idempotency claim");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    type Store = IdempotencyStore<String, String>;

    fn ttl(secs: u64) -> IdempotencyOptions {
        IdempotencyOptions {
            ttl: Duration::from_secs(secs),
            allow_pending: false,
        }
    }

    #[test]
    fn key_renders_colon_joined() {
        let key = IdempotencyKey::new("run-1", "step-2", "github.commit", "abcd");
        assert_eq!(key.to_string(), "run-1:step-2:github.commit:abcd");

        let hashed = IdempotencyKey::for_input("r", "s", "op", &json!({"a": 1}));
        assert_eq!(hashed.input_hash, hash_input(&json!({"a": 1})));
    }

    #[test]
    fn separators_inside_components_are_escaped() {
        let a = IdempotencyKey::new("run:a", "s", "jira.create_issue", "h");
        let b = IdempotencyKey::new("run", "a:s", "jira.create_issue", "h");
        assert_eq!(a.to_string(), "run%3Aa:s:jira.create_issue:h");
        assert_eq!(b.to_string(), "run:a%3As:jira.create_issue:h");

        // an escape sequence typed literally stays distinct from the escape
        let literal = IdempotencyKey::new("run%3Aa", "s", "jira.create_issue", "h");
        assert_eq!(literal.to_string(), "run%253Aa:s:jira.create_issue:h");
        assert_ne!(literal.to_string(), a.to_string());
    }

    #[tokio::test]
    async fn second_call_replays_cached_result() {
        let store = Store::new();
        let calls = AtomicU32::new(0);
        let run = || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, String>("sha-123".to_string()) }
        };

        let first = store.execute("k", run).await.unwrap();
        let second = store.execute("k", run).await.unwrap();

        assert_eq!(first, Idempotent::Executed("sha-123".into()));
        assert_eq!(second, Idempotent::Cached("sha-123".into()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.get("k").unwrap().status(), IdempotencyStatus::Completed);
    }

    #[tokio::test]
    async fn failure_is_cached_and_replayed() {
        let store = Store::new();
        let calls = AtomicU32::new(0);
        let run = || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<String, _>("merge conflict".to_string()) }
        };

        let first = store.execute("k", run).await.unwrap_err();
        assert!(matches!(first, IdempotencyError::Failed(ref e) if e == "merge conflict"));

        let second = store.execute("k", run).await.unwrap_err();
        assert!(
            matches!(second, IdempotencyError::CachedFailure { ref error, .. } if error == "merge conflict")
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_execute_once() {
        let store = Store::new();
        let calls = AtomicU32::new(0);
        let slow = || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, String>("done".to_string())
            }
        };

        let (a, b) = tokio::join!(store.execute("k", slow), store.execute("k", slow));

        assert_eq!(a.unwrap(), Idempotent::Executed("done".into()));
        assert!(matches!(b, Err(IdempotencyError::InProgress { ref key }) if key == "k"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn allow_pending_reports_in_flight() {
        let store = Store::new();
        let opts = IdempotencyOptions {
            allow_pending: true,
            ..Default::default()
        };
        let slow = || async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, String>("done".to_string())
        };

        let (a, b) = tokio::join!(
            store.with_idempotency("k", &opts, slow),
            store.with_idempotency("k", &opts, slow)
        );
        assert!(matches!(a, Ok(Idempotent::Executed(_))));
        assert_eq!(b.unwrap(), Idempotent::InFlight);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_record_is_executed_again() {
        let store = Store::new();
        let calls = AtomicU32::new(0);
        let run = || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, String>("v".to_string()) }
        };

        store.with_idempotency("k", &ttl(10), run).await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(store.get("k").is_none());

        let again = store.with_idempotency("k", &ttl(10), run).await.unwrap();
        assert_eq!(again, Idempotent::Executed("v".into()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_removes_only_expired() {
        let store = Store::new();
        store
            .with_idempotency("short", &ttl(1), || async { Ok("a".to_string()) })
            .await
            .unwrap();
        store
            .with_idempotency("long", &ttl(100), || async { Ok("b".to_string()) })
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(store.len(), 2);
        assert_eq!(store.cleanup(), 1);
        assert!(store.get("long").is_some());
        assert!(store.get("short").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_reclaims_expired_records() {
        let store = Arc::new(Store::new());
        store
            .with_idempotency("k", &ttl(1), || async { Ok("a".to_string()) })
            .await
            .unwrap();

        let sweeper = store.spawn_sweeper(Duration::from_secs(2));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(store.is_empty());
        sweeper.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_execution_releases_the_key() {
        let store = Store::new();
        let never = || async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, String>("late".to_string())
        };
        let timed_out =
            tokio::time::timeout(Duration::from_millis(10), store.execute("k", never)).await;
        assert!(timed_out.is_err());
        assert!(store.get("k").is_none());

        let retried = store
            .execute("k", || async { Ok("now".to_string()) })
            .await
            .unwrap();
        assert_eq!(retried, Idempotent::Executed("now".into()));
    }

    #[tokio::test]
    async fn delete_forgets_record() {
        let store = Store::new();
        store
            .execute("k", || async { Ok("a".to_string()) })
            .await
            .unwrap();
        assert!(store.delete("k"));
        assert!(!store.delete("k"));
        assert!(store.is_empty());
    }
}
