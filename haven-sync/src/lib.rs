//! Offline-first sync engine for Haven.
//!
//! Field workers keep using the app with unreliable or absent connectivity.
//! Mutations made offline are queued, replayed when the network returns,
//! and reconciled with the server's copy when the two have diverged.
//!
//! # Architecture
//!
//! ## Components
//!
//! - **Network Monitor**: classifies platform connectivity events into a
//!   [`NetworkState`] and publishes it
//! - **Sync Queue**: the persisted, priority-ordered list of
//!   [`PendingOperation`]s
//! - **Conflict Resolver**: pure strategies for divergent records
//! - **Dispatcher**: sends one operation to its configured endpoint
//! - **Orchestrator**: drains the queue, applies backoff and rate limits,
//!   routes conflicts, and publishes [`SyncStatus`]
//!
//! Persistence goes through [`haven_store::EncryptedStore`], which encrypts
//! the queue at rest.
//!
//! ## Sync Process
//!
//! 1. **Enqueue**: the host calls [`SyncOrchestrator::queue_operation`]
//! 2. **Trigger**: a manual sync, a background tick, or reconnection
//! 3. **Drain**: operations are dispatched in priority order
//! 4. **Settle**: each is removed, retried later, resolved, or abandoned
//!
//! # Example
//!
//! ```no_run
//! use haven_crypto::{KeyEncryptor, MemoryKeyVault, StoreKey};
//! use haven_store::{EncryptedStore, SqliteBackend};
//! use haven_sync::{HavenConfig, HttpDispatcher, NetworkMonitor, SyncOrchestrator, SystemClock};
//! use haven_types::OperationKind;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Arc::new(HavenConfig::load("haven.toml")?);
//! let key = StoreKey::load_or_create(&MemoryKeyVault::new(), "encryption_key")?;
//! let store = Arc::new(EncryptedStore::open(
//!     Arc::new(SqliteBackend::open("haven.db")?),
//!     Arc::new(KeyEncryptor::new(key)),
//!     config.store_options(),
//! )?);
//! let network = Arc::new(NetworkMonitor::new(Arc::new(SystemClock)).with_store(store.clone()));
//! let dispatcher = Arc::new(HttpDispatcher::new(
//!     config.mutations.base_url.clone(),
//!     config.network.connection_timeout,
//! )?);
//!
//! let orchestrator = SyncOrchestrator::builder(config, store, network, dispatcher)
//!     .build()
//!     .await?;
//! orchestrator
//!     .queue_operation(OperationKind::CreateIncident, json!({ "title": "X" }))
//!     .await?;
//! let background = orchestrator.spawn_background();
//! # background.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod conflict;
pub mod dispatch;
mod error;
mod failed;
pub mod network;
pub mod observer;
mod orchestrator;
mod persist;
pub mod queue;
pub mod rate_limit;
pub mod status;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    BackgroundConfig, ConflictConfig, Endpoint, FieldPriorities, HavenConfig, HttpMethod,
    ManualConfig, MutationConfig, NetworkConfig, RateLimitConfig, SecurityConfig, StorageConfig,
    SyncConfig, DEFAULT_PRIORITY,
};
pub use conflict::{ConflictData, ConflictResolver, ConflictStrategy, Mergeable};
pub use dispatch::{
    DispatchOutcome, DispatchRequest, HttpDispatcher, MutationDispatcher, TokenProvider,
};
pub use error::{DispatchError, Result, SyncError};
pub use failed::FailedOperation;
pub use network::{
    CellularGeneration, ConnectivityProbe, NetworkMonitor, NetworkState, PollingHandle,
    QualityTier, RawConnectivity, TransportType,
};
pub use observer::{ObserverList, SubscriptionId};
pub use orchestrator::{BackgroundHandle, OrchestratorBuilder, SyncOrchestrator};
pub use queue::{OperationPatch, PendingOperation, SyncQueue};
pub use rate_limit::RateLimiter;
pub use status::{NoopHooks, SyncHooks, SyncResult, SyncStatus};
