//! Permanently failed operations kept for manual inspection.

use crate::error::{Result, SyncError};
use crate::persist::blocking;
use crate::queue::PendingOperation;
use haven_store::{EncryptedStore, StorageKey};
use haven_types::{OperationId, Timestamp};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

/// An abandoned operation and why it was abandoned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedOperation {
    pub operation: PendingOperation,
    pub error: String,
    pub failed_at: Timestamp,
}

/// Persisted list under the `failed_operations` key.
pub(crate) struct FailedLedger {
    store: Arc<EncryptedStore>,
    entries: Mutex<Vec<FailedOperation>>,
}

impl FailedLedger {
    pub(crate) async fn open(store: Arc<EncryptedStore>) -> Result<Self> {
        let entries = load(&store).await?;
        Ok(Self {
            store,
            entries: Mutex::new(entries),
        })
    }

    async fn persist(&self, snapshot: Vec<FailedOperation>) -> Result<Vec<FailedOperation>> {
        let saved = snapshot.clone();
        blocking(&self.store, move |store| {
            store.set_json(StorageKey::FailedOperations, &snapshot)
        })
        .await?;
        Ok(saved)
    }

    pub(crate) async fn list(&self) -> Vec<FailedOperation> {
        self.entries.lock().await.clone()
    }

    /// Appends an entry, replacing one with the same id and dropping the
    /// oldest beyond `cap`.
    pub(crate) async fn push(&self, failed: FailedOperation, cap: usize) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let mut snapshot = entries.clone();
        snapshot.retain(|existing| existing.operation.id != failed.operation.id);
        snapshot.push(failed);
        let excess = snapshot.len().saturating_sub(cap);
        if excess > 0 {
            for dropped in snapshot.drain(..excess) {
                warn!(
                    op_id = %dropped.operation.id,
                    kind = %dropped.operation.kind,
                    "failed operations full, dropping oldest"
                );
            }
        }
        *entries = self.persist(snapshot).await?;
        Ok(())
    }

    pub(crate) async fn get(&self, id: OperationId) -> Result<FailedOperation> {
        self.entries
            .lock()
            .await
            .iter()
            .find(|entry| entry.operation.id == id)
            .cloned()
            .ok_or(SyncError::OperationNotFound(id))
    }

    /// Returns whether the entry existed.
    pub(crate) async fn remove(&self, id: OperationId) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        if !entries.iter().any(|entry| entry.operation.id == id) {
            return Ok(false);
        }
        let snapshot = entries
            .iter()
            .filter(|entry| entry.operation.id != id)
            .cloned()
            .collect();
        *entries = self.persist(snapshot).await?;
        Ok(true)
    }

    /// Re-reads the ledger from the store.
    pub(crate) async fn reload(&self) -> Result<()> {
        let entries = load(&self.store).await?;
        *self.entries.lock().await = entries;
        Ok(())
    }
}

async fn load(store: &Arc<EncryptedStore>) -> Result<Vec<FailedOperation>> {
    Ok(blocking(store, |store| {
        store.get_json::<Vec<FailedOperation>>(StorageKey::FailedOperations)
    })
    .await?
    .unwrap_or_default())
}
