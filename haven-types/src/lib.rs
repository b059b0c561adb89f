//! Core type definitions for Haven.
//!
//! This crate defines the small, dependency-light types shared by the
//! storage and sync crates:
//! - Operation identifiers (UUID v7)
//! - Millisecond wall-clock timestamps
//! - The closed set of operation kinds the app can queue while offline
//!
//! Domain payloads (incident reports, appointments, safety plans) are opaque
//! JSON to the core and are never modelled here.

mod ids;
mod operation;
mod timestamp;

pub use ids::OperationId;
pub use operation::OperationKind;
pub use timestamp::Timestamp;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("unknown operation kind: {0}")]
    UnknownOperationKind(String),
}
