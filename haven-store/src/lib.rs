//! Encrypted key-value storage for Haven.
//!
//! The sync engine treats this store as its single source of truth: the
//! pending queue, failed operations, last sync time and cached network state
//! all live here and survive process restarts.
//!
//! # Architecture
//!
//! - [`KeyValueBackend`] is a flat byte store. [`SqliteBackend`] persists to
//!   a SQLite file on device; [`MemoryBackend`] serves tests.
//! - [`EncryptedStore`] namespaces every logical key with the app prefix and
//!   a cache-buster version, seals values for sensitive keys through a
//!   [`haven_crypto::DataEncryptor`], and purges entries written under an
//!   older cache-buster when it opens.
//! - Every read or write failure surfaces as a [`StorageError`]; nothing is
//!   swallowed.

mod backend;
mod error;
mod keys;
mod store;

pub use backend::{KeyValueBackend, MemoryBackend, SqliteBackend};
pub use error::{StorageError, StorageResult};
pub use keys::{Namespace, StorageKey};
pub use store::{EncryptedStore, StoreOptions};
