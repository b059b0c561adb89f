//! Drain results, the published status, and host hooks.

use crate::queue::PendingOperation;
use async_trait::async_trait;
use haven_types::{OperationId, OperationKind, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;

/// Outcome of one dispatch attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub id: OperationId,
    pub success: bool,
    pub operation_type: OperationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: Timestamp,
}

impl SyncResult {
    pub fn succeeded(op: &PendingOperation, timestamp: Timestamp) -> Self {
        Self {
            id: op.id,
            success: true,
            operation_type: op.kind,
            error: None,
            timestamp,
        }
    }

    pub fn failed(op: &PendingOperation, error: impl Into<String>, timestamp: Timestamp) -> Self {
        Self {
            id: op.id,
            success: false,
            operation_type: op.kind,
            error: Some(error.into()),
            timestamp,
        }
    }
}

/// The state exposed to observers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub is_syncing: bool,
    pub pending_count: usize,
    pub last_sync_time: Option<Timestamp>,
    /// Most recent failed results, oldest first.
    pub errors: VecDeque<SyncResult>,
}

impl SyncStatus {
    /// Appends failures, dropping the oldest beyond `max_errors`.
    pub fn record_errors<'a>(
        &mut self,
        results: impl IntoIterator<Item = &'a SyncResult>,
        max_errors: usize,
    ) {
        for result in results.into_iter().filter(|r| !r.success) {
            self.errors.push_back(result.clone());
        }
        while self.errors.len() > max_errors {
            self.errors.pop_front();
        }
    }
}

/// Side effects the host attaches to a drain.
#[async_trait]
pub trait SyncHooks: Send + Sync {
    /// Cached reads named in the endpoint's `invalidates` list.
    async fn invalidate(&self, _keys: &[String]) {}

    /// The authoritative value after a conflict. The host applies it
    /// locally and may enqueue a follow-up write.
    async fn apply_resolved(&self, _operation: &PendingOperation, _resolved: &Value) {}
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl SyncHooks for NoopHooks {}
