//! The encrypted key-value store.

use crate::backend::KeyValueBackend;
use crate::error::{StorageError, StorageResult};
use crate::keys::{Namespace, StorageKey};
use haven_crypto::DataEncryptor;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Leading byte of every stored value.
const PLAIN_MARKER: u8 = b'P';
const SEALED_MARKER: u8 = b'S';

/// Options fixed when the store opens.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub namespace: Namespace,
    /// Logical keys whose values are encrypted at rest.
    pub sensitive_keys: Vec<String>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            namespace: Namespace::default(),
            sensitive_keys: vec![
                StorageKey::SyncQueue.as_str().to_string(),
                StorageKey::FailedOperations.as_str().to_string(),
            ],
        }
    }
}

/// Namespaced, selectively encrypted key-value store.
///
/// Values for sensitive keys are sealed with the storage key bound as
/// associated data. A sensitive key holding a plaintext value is treated as
/// tampering and rejected.
pub struct EncryptedStore {
    backend: Arc<dyn KeyValueBackend>,
    encryptor: Arc<dyn DataEncryptor>,
    namespace: Namespace,
    sensitive: HashSet<String>,
}

impl EncryptedStore {
    /// Opens the store and deletes entries left by older cache-busters.
    pub fn open(
        backend: Arc<dyn KeyValueBackend>,
        encryptor: Arc<dyn DataEncryptor>,
        options: StoreOptions,
    ) -> StorageResult<Self> {
        let store = Self {
            backend,
            encryptor,
            namespace: options.namespace,
            sensitive: options.sensitive_keys.into_iter().collect(),
        };
        let purged = store.purge_stale()?;
        if purged > 0 {
            info!(
                purged,
                cache_buster = store.namespace.cache_buster(),
                "purged stale persisted entries"
            );
        }
        Ok(store)
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Whether values under this logical key are encrypted.
    pub fn is_sensitive(&self, key: &str) -> bool {
        self.sensitive.contains(key)
    }

    /// Stores `value` under the logical `key`.
    pub fn set_item(&self, key: impl AsRef<str>, value: &str) -> StorageResult<()> {
        let key = key.as_ref();
        let physical = self.namespace.qualify(key);

        let mut encoded;
        if self.is_sensitive(key) {
            let sealed = self
                .encryptor
                .encrypt_bytes(&physical, value.as_bytes())
                .map_err(|e| StorageError::Encryption(e.to_string()))?;
            encoded = Vec::with_capacity(sealed.len() + 1);
            encoded.push(SEALED_MARKER);
            encoded.extend_from_slice(&sealed);
        } else {
            encoded = Vec::with_capacity(value.len() + 1);
            encoded.push(PLAIN_MARKER);
            encoded.extend_from_slice(value.as_bytes());
        }

        self.backend.set(&physical, &encoded)?;
        debug!(key, bytes = encoded.len(), "stored item");
        Ok(())
    }

    /// Reads the value under the logical `key`.
    pub fn get_item(&self, key: impl AsRef<str>) -> StorageResult<Option<String>> {
        let key = key.as_ref();
        let physical = self.namespace.qualify(key);

        let Some(raw) = self.backend.get(&physical)? else {
            return Ok(None);
        };
        let Some((&marker, body)) = raw.split_first() else {
            return Err(StorageError::InvalidData(format!("empty value for {key}")));
        };

        let bytes = match marker {
            SEALED_MARKER => self
                .encryptor
                .decrypt_bytes(&physical, body)
                .map_err(|e| StorageError::Encryption(e.to_string()))?,
            PLAIN_MARKER if self.is_sensitive(key) => {
                warn!(key, "plaintext value found under sensitive key");
                return Err(StorageError::Encryption(format!(
                    "expected sealed value for {key}"
                )));
            }
            PLAIN_MARKER => body.to_vec(),
            other => {
                return Err(StorageError::InvalidData(format!(
                    "unknown value marker {other:#04x} for {key}"
                )));
            }
        };

        String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| StorageError::InvalidData(format!("invalid UTF-8 for {key}: {e}")))
    }

    /// Removes the logical `key`. Returns whether it existed.
    pub fn remove_item(&self, key: impl AsRef<str>) -> StorageResult<bool> {
        let key = key.as_ref();
        let removed = self.backend.remove(&self.namespace.qualify(key))?;
        debug!(key, removed, "removed item");
        Ok(removed)
    }

    /// Removes several logical keys, e.g. the `clear_on_logout` set.
    /// Returns how many existed.
    pub fn remove_items<I, K>(&self, keys: I) -> StorageResult<usize>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let mut removed = 0;
        for key in keys {
            if self.remove_item(key)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Removes every entry under the app prefix, whatever its version.
    pub fn clear(&self) -> StorageResult<usize> {
        let mut removed = 0;
        for physical in self.backend.keys()? {
            if self.namespace.owns(&physical) && self.backend.remove(&physical)? {
                removed += 1;
            }
        }
        info!(removed, "cleared store");
        Ok(removed)
    }

    /// Deletes entries written under another cache-buster.
    pub fn purge_stale(&self) -> StorageResult<usize> {
        let mut removed = 0;
        for physical in self.backend.keys()? {
            if self.namespace.is_stale(&physical) && self.backend.remove(&physical)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Lists logical keys present under the current namespace.
    pub fn keys(&self) -> StorageResult<Vec<String>> {
        Ok(self
            .backend
            .keys()?
            .iter()
            .filter_map(|physical| self.namespace.logical(physical).map(str::to_string))
            .collect())
    }

    /// Serializes `value` as JSON and stores it.
    pub fn set_json<T: Serialize + ?Sized>(
        &self,
        key: impl AsRef<str>,
        value: &T,
    ) -> StorageResult<()> {
        let json = serde_json::to_string(value)?;
        self.set_item(key, &json)
    }

    /// Reads and deserializes a JSON value.
    pub fn get_json<T: DeserializeOwned>(&self, key: impl AsRef<str>) -> StorageResult<Option<T>> {
        match self.get_item(key)? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}
