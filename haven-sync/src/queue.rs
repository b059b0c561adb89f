//! Sync Queue.
//!
//! An ordered, persisted set of operations waiting for the network. The
//! encrypted store is the source of truth: every mutation writes the full
//! snapshot and only then updates the in-memory copy, so a failed write
//! leaves the queue exactly as it was.
//!
//! Mutations are serialized by an async mutex held across the write, so
//! persisted snapshots never interleave.

use crate::clock::Clock;
use crate::config::HavenConfig;
use crate::error::{Result, SyncError};
use crate::persist::blocking;
use haven_store::{EncryptedStore, StorageKey};
use haven_types::{OperationId, OperationKind, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// A queued mutation.
///
/// Only `retry_count`, `last_attempt_at` and `last_error` change after
/// enqueue, and only through [`SyncQueue`]. Values handed out by the queue
/// are copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation<T = Value> {
    pub id: OperationId,
    #[serde(rename = "type")]
    pub kind: OperationKind,
    pub data: T,
    pub enqueued_at: Timestamp,
    pub retry_count: u32,
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Insertion order, the final tie-breaker.
    #[serde(default)]
    pub sequence: u64,
}

impl<T> PendingOperation<T> {
    /// Drain order: descending priority, then ascending enqueue time, then
    /// insertion order.
    pub fn drain_order(a: &Self, b: &Self) -> Ordering {
        b.priority
            .cmp(&a.priority)
            .then(a.enqueued_at.cmp(&b.enqueued_at))
            .then(a.sequence.cmp(&b.sequence))
    }

    /// When the next attempt is allowed, or `None` if it is due now.
    pub fn next_attempt_at(&self, retry_delays: &[Duration]) -> Option<Timestamp> {
        if self.retry_count == 0 {
            return None;
        }
        let last_attempt = self.last_attempt_at?;
        let last = retry_delays.len().checked_sub(1)?;
        let index = (self.retry_count as usize - 1).min(last);
        Some(last_attempt.saturating_add(retry_delays[index]))
    }

    pub fn is_due(&self, now: Timestamp, retry_delays: &[Duration]) -> bool {
        self.next_attempt_at(retry_delays)
            .is_none_or(|due| due <= now)
    }
}

/// The mutable subset of a [`PendingOperation`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationPatch {
    pub retry_count: Option<u32>,
    pub last_attempt_at: Option<Timestamp>,
    /// `Some(None)` clears the error.
    pub last_error: Option<Option<String>>,
}

const IMMUTABLE_FIELDS: [&str; 6] = ["id", "type", "data", "enqueued_at", "priority", "sequence"];

impl OperationPatch {
    /// Builds a patch from a partial JSON object. Naming an immutable
    /// field fails with [`SyncError::ImmutableField`].
    pub fn from_json(partial: &Map<String, Value>) -> Result<Self> {
        let mut patch = Self::default();
        for (field, value) in partial {
            match field.as_str() {
                "retry_count" => patch.retry_count = Some(serde_json::from_value(value.clone())?),
                "last_attempt_at" => {
                    patch.last_attempt_at = Some(serde_json::from_value(value.clone())?)
                }
                "last_error" => patch.last_error = Some(serde_json::from_value(value.clone())?),
                name if IMMUTABLE_FIELDS.contains(&name) => {
                    return Err(SyncError::ImmutableField(name.to_string()));
                }
                other => {
                    return Err(SyncError::InvalidUpdate(format!("unknown field `{other}`")));
                }
            }
        }
        Ok(patch)
    }
}

struct QueueState {
    operations: Vec<PendingOperation>,
    next_sequence: u64,
}

impl QueueState {
    fn new(operations: Vec<PendingOperation>) -> Self {
        let next_sequence = operations
            .iter()
            .map(|op| op.sequence + 1)
            .max()
            .unwrap_or(0);
        Self {
            operations,
            next_sequence,
        }
    }

    fn position(&self, id: OperationId) -> Result<usize> {
        self.operations
            .iter()
            .position(|op| op.id == id)
            .ok_or(SyncError::OperationNotFound(id))
    }
}

/// Persisted queue of pending operations.
pub struct SyncQueue {
    store: Arc<EncryptedStore>,
    config: Arc<HavenConfig>,
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState>,
}

impl SyncQueue {
    /// Opens the queue, recovering whatever the store holds.
    pub async fn open(
        store: Arc<EncryptedStore>,
        config: Arc<HavenConfig>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let operations = load(&store).await?;
        if !operations.is_empty() {
            info!("Recovered {} pending operations", operations.len());
        }
        Ok(Self {
            store,
            config,
            clock,
            state: Mutex::new(QueueState::new(operations)),
        })
    }

    async fn persist(&self, snapshot: Vec<PendingOperation>) -> Result<Vec<PendingOperation>> {
        let saved = snapshot.clone();
        blocking(&self.store, move |store| {
            store.set_json(StorageKey::SyncQueue, &snapshot)
        })
        .await?;
        Ok(saved)
    }

    /// Enqueues a new operation with the configured priority for `kind`.
    pub async fn add_operation(&self, kind: OperationKind, data: Value) -> Result<PendingOperation> {
        let mut state = self.state.lock().await;
        let op = PendingOperation {
            id: OperationId::new(),
            kind,
            data,
            enqueued_at: self.clock.now(),
            retry_count: 0,
            priority: self.config.sync.priority_for(kind),
            last_attempt_at: None,
            last_error: None,
            sequence: state.next_sequence,
        };

        let mut snapshot = state.operations.clone();
        snapshot.push(op.clone());
        state.operations = self.persist(snapshot).await?;
        state.next_sequence += 1;

        debug!(op_id = %op.id, kind = %kind, priority = op.priority, "enqueued operation");
        Ok(op)
    }

    /// Puts back an operation that already has an identity, keeping its
    /// id, priority and enqueue time.
    pub async fn restore_operation(&self, op: PendingOperation) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.operations.iter().any(|existing| existing.id == op.id) {
            return Err(SyncError::InvalidUpdate(format!(
                "operation {} is already queued",
                op.id
            )));
        }
        let sequence = op.sequence;
        let mut snapshot = state.operations.clone();
        snapshot.push(op);
        state.operations = self.persist(snapshot).await?;
        state.next_sequence = state.next_sequence.max(sequence + 1);
        Ok(())
    }

    /// All pending operations in insertion order.
    pub async fn get_queue(&self) -> Vec<PendingOperation> {
        self.state.lock().await.operations.clone()
    }

    /// All pending operations in drain order.
    pub async fn get_sorted_queue(&self) -> Vec<PendingOperation> {
        let mut operations = self.get_queue().await;
        operations.sort_by(PendingOperation::drain_order);
        operations
    }

    pub async fn get(&self, id: OperationId) -> Option<PendingOperation> {
        self.state
            .lock()
            .await
            .operations
            .iter()
            .find(|op| op.id == id)
            .cloned()
    }

    pub async fn get_operations_by_type(&self, kind: OperationKind) -> Vec<PendingOperation> {
        self.state
            .lock()
            .await
            .operations
            .iter()
            .filter(|op| op.kind == kind)
            .cloned()
            .collect()
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.operations.len()
    }

    /// Removes an operation. Returns it if it was queued.
    pub async fn remove_operation(&self, id: OperationId) -> Result<Option<PendingOperation>> {
        let mut state = self.state.lock().await;
        let Ok(index) = state.position(id) else {
            return Ok(None);
        };
        let mut snapshot = state.operations.clone();
        let removed = snapshot.remove(index);
        state.operations = self.persist(snapshot).await?;
        debug!(op_id = %id, "removed operation");
        Ok(Some(removed))
    }

    pub async fn clear_queue(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.operations = self.persist(Vec::new()).await?;
        info!("Cleared sync queue");
        Ok(())
    }

    /// Records one more failed attempt.
    ///
    /// Fails with [`SyncError::MaxRetriesExceeded`] when the count is
    /// already at `max_retry_attempts`.
    pub async fn increment_retry_count(&self, id: OperationId) -> Result<PendingOperation> {
        let max = self.config.sync.max_retry_attempts;
        let mut state = self.state.lock().await;
        let index = state.position(id)?;
        let mut snapshot = state.operations.clone();
        let op = &mut snapshot[index];
        if op.retry_count >= max {
            return Err(SyncError::MaxRetriesExceeded {
                attempts: op.retry_count,
            });
        }
        op.retry_count += 1;
        op.last_attempt_at = Some(self.clock.now());
        let updated = op.clone();
        state.operations = self.persist(snapshot).await?;
        debug!(op_id = %id, retry_count = updated.retry_count, "incremented retry count");
        Ok(updated)
    }

    /// Applies a patch to the mutable fields.
    ///
    /// `retry_count` may not decrease or exceed `max_retry_attempts`.
    pub async fn update_operation(
        &self,
        id: OperationId,
        patch: OperationPatch,
    ) -> Result<PendingOperation> {
        let max = self.config.sync.max_retry_attempts;
        let mut state = self.state.lock().await;
        let index = state.position(id)?;
        let mut snapshot = state.operations.clone();
        let op = &mut snapshot[index];

        if let Some(retry_count) = patch.retry_count {
            if retry_count < op.retry_count {
                return Err(SyncError::InvalidUpdate(format!(
                    "retry_count cannot decrease from {} to {retry_count}",
                    op.retry_count
                )));
            }
            if retry_count > max {
                return Err(SyncError::InvalidUpdate(format!(
                    "retry_count {retry_count} exceeds the maximum of {max}"
                )));
            }
            op.retry_count = retry_count;
        }
        if let Some(at) = patch.last_attempt_at {
            op.last_attempt_at = Some(at);
        }
        if let Some(error) = patch.last_error {
            op.last_error = error;
        }

        let updated = op.clone();
        state.operations = self.persist(snapshot).await?;
        Ok(updated)
    }

    /// Re-reads the queue from the store, discarding the in-memory copy.
    pub async fn reload(&self) -> Result<usize> {
        let operations = load(&self.store).await?;
        let count = operations.len();
        *self.state.lock().await = QueueState::new(operations);
        Ok(count)
    }
}

async fn load(store: &Arc<EncryptedStore>) -> Result<Vec<PendingOperation>> {
    let operations = blocking(store, |store| {
        store.get_json::<Vec<PendingOperation>>(StorageKey::SyncQueue)
    })
    .await?
    .unwrap_or_default();

    let mut seen = HashSet::with_capacity(operations.len());
    Ok(operations
        .into_iter()
        .filter(|op| seen.insert(op.id))
        .collect())
}
