//! Error types for the sync layer.

use crate::status::SyncResult;
use haven_store::StorageError;
use haven_types::OperationId;
use std::sync::Arc;
use thiserror::Error;

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Dispatch attempted while the device is offline.
    #[error("network unavailable")]
    NetworkUnavailable,

    /// The server rejected the request.
    #[error("HTTP error: status {status}")]
    Http { status: u16 },

    /// The server holds a diverging version. Resolved inside the drain.
    #[error("conflict detected")]
    ConflictDetected,

    /// The operation was abandoned.
    #[error("max retries exceeded after {attempts} attempts")]
    MaxRetriesExceeded { attempts: u32 },

    /// Persistence failed. The mutation in progress was not applied.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Missing or invalid configuration, including an operation kind with
    /// no endpoint mapping.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The per-minute dispatch budget is spent. The drain pauses.
    #[error("rate limit exceeded")]
    RateLimitExceeded,

    /// Dispatch exceeded the connection timeout.
    #[error("operation timed out")]
    Timeout,

    /// Attempt to change a field that is fixed at enqueue time.
    #[error("field `{0}` is immutable once enqueued")]
    ImmutableField(String),

    /// A mutable field was given a value it may not take.
    #[error("invalid operation update: {0}")]
    InvalidUpdate(String),

    /// No queued or failed operation with this id.
    #[error("operation not found: {0}")]
    OperationNotFound(OperationId),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A blocking storage task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),

    /// A drain stopped early. `completed` holds the operations it settled
    /// before `source` occurred; they are already reflected in the status.
    /// Every caller sharing the drain receives the same `source`.
    #[error("drain interrupted after {} results: {source}", .completed.len())]
    DrainInterrupted {
        completed: Vec<SyncResult>,
        source: Arc<SyncError>,
    },
}

impl SyncError {
    /// Whether the failure is worth retrying later.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NetworkUnavailable | Self::Timeout => true,
            Self::Http { status } => is_transient_status(*status),
            _ => false,
        }
    }

    /// The underlying failure, looking through [`SyncError::DrainInterrupted`].
    pub fn root_cause(&self) -> &SyncError {
        match self {
            Self::DrainInterrupted { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// 408, 429 and 5xx are retried; every other status is final.
pub(crate) fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500..=599)
}

/// Errors raised by a [`MutationDispatcher`](crate::MutationDispatcher).
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The request never reached the server.
    #[error("network error: {0}")]
    Network(String),

    /// The request timed out.
    #[error("request timed out")]
    Timeout,

    /// The server answered with a non-success status other than a conflict.
    #[error("server returned status {0}")]
    Status(u16),

    /// The response body could not be parsed.
    #[error("invalid response: {0}")]
    InvalidResponse(#[from] serde_json::Error),
}

impl From<DispatchError> for SyncError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Network(_) => Self::NetworkUnavailable,
            DispatchError::Timeout => Self::Timeout,
            DispatchError::Status(status) => Self::Http { status },
            DispatchError::InvalidResponse(e) => Self::Serialization(e),
        }
    }
}
