//! Audit trail of tool invocations.
//!
//! The pipeline emits one entry per stage it reaches. Sinks are external
//! collaborators reached through an [`AuditDispatcher`]: entries are queued
//! and delivered by a background task, so a slow or failing sink never
//! delays or changes the outcome of a call.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::AuditError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Requested,
    PolicyChecked,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: AuditAction,
    pub details: Value,
}

impl AuditEntry {
    pub fn new(actor: impl Into<String>, action: AuditAction, details: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            actor: actor.into(),
            action,
            details,
        }
    }
}

/// Destination for audit entries.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, run_id: &str, entry: &AuditEntry) -> Result<(), AuditError>;
}

// ─── Memory ───────────────────────────────────────────────────────────────────

/// Keeps entries in memory. Useful for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<(String, AuditEntry)>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries for `run_id`, in append order.
    pub fn entries(&self, run_id: &str) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|(run, _)| run == run_id)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Actions for `run_id`, in append order.
    pub fn actions(&self, run_id: &str) -> Vec<AuditAction> {
        self.entries(run_id).into_iter().map(|e| e.action).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, run_id: &str, entry: &AuditEntry) -> Result<(), AuditError> {
        self.entries.lock().push((run_id.to_string(), entry.clone()));
        Ok(())
    }
}

// ─── JSON Lines file ──────────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonlRecord<'a> {
    run_id: &'a str,
    #[serde(flatten)]
    entry: &'a AuditEntry,
}

/// Append-only file sink writing one JSON object per line.
#[derive(Debug)]
pub struct JsonlAuditSink {
    path: PathBuf,
    // serialises appends so lines never interleave
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn append(&self, run_id: &str, entry: &AuditEntry) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(&JsonlRecord { run_id, entry })?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

// ─── Tracing ──────────────────────────────────────────────────────────────────

/// Writes entries to the `toolgate::audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn append(&self, run_id: &str, entry: &AuditEntry) -> Result<(), AuditError> {
        tracing::info!(
            target: "toolgate::audit",
            run_id = %run_id,
            id = %entry.id,
            actor = %entry.actor,
            action = ?entry.action,
            details = %entry.details,
            "audit"
        );
        Ok(())
    }
}

// ─── Dispatch ─────────────────────────────────────────────────────────────────

enum Command {
    Append { run_id: String, entry: AuditEntry },
    Flush(oneshot::Sender<()>),
}

/// Delivers entries to a sink from a background task, in emission order.
///
/// Each append is bounded by `timeout`. Failed or timed-out appends are
/// logged and the entry is dropped. The task exits once every dispatcher
/// handle is gone and the queue is drained.
#[derive(Clone)]
pub struct AuditDispatcher {
    tx: mpsc::UnboundedSender<Command>,
}

impl AuditDispatcher {
    /// Spawn the delivery task. Must be called within a Tokio runtime.
    pub fn spawn(sink: Arc<dyn AuditSink>, timeout: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(deliver_loop(rx, sink, timeout));
        Self { tx }
    }

    /// Queue `entry` without waiting. Returns `false` if the delivery task
    /// has stopped.
    pub fn dispatch(&self, run_id: &str, entry: AuditEntry) -> bool {
        self.tx
            .send(Command::Append {
                run_id: run_id.to_string(),
                entry,
            })
            .is_ok()
    }

    /// Wait until every entry queued before this call was delivered or dropped.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

impl std::fmt::Debug for AuditDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditDispatcher")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

async fn deliver_loop(
    mut rx: mpsc::UnboundedReceiver<Command>,
    sink: Arc<dyn AuditSink>,
    timeout: Duration,
) {
    while let Some(command) = rx.recv().await {
        let (run_id, entry) = match command {
            Command::Append { run_id, entry } => (run_id, entry),
            Command::Flush(done) => {
                let _ = done.send(());
                continue;
            }
        };
        match tokio::time::timeout(timeout, sink.append(&run_id, &entry)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(
                run_id = %run_id,
                id = %entry.id,
                action = ?entry.action,
                error = %e,
                "audit emission failed"
            ),
            Err(_) => tracing::warn!(
                run_id = %run_id,
                id = %entry.id,
                action = ?entry.action,
                timeout_ms = timeout.as_millis() as u64,
                "audit emission timed out"
            ),
        }
    }
}
