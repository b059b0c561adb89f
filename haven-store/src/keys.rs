//! Logical storage keys and their on-disk namespacing.
//!
//! Physical keys look like `haven:v3:sync_queue`. Bumping the cache-buster
//! makes every entry written under the previous version stale, and the store
//! deletes stale entries when it opens.

use std::fmt;

/// Fixed logical keys used by the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKey {
    SyncQueue,
    EncryptionKey,
    NetworkState,
    LastSync,
    FailedOperations,
}

impl StorageKey {
    pub const ALL: [StorageKey; 5] = [
        Self::SyncQueue,
        Self::EncryptionKey,
        Self::NetworkState,
        Self::LastSync,
        Self::FailedOperations,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SyncQueue => "sync_queue",
            Self::EncryptionKey => "encryption_key",
            Self::NetworkState => "network_state",
            Self::LastSync => "last_sync",
            Self::FailedOperations => "failed_operations",
        }
    }
}

impl AsRef<str> for StorageKey {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// App prefix plus cache-buster version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    prefix: String,
    cache_buster: String,
}

impl Namespace {
    pub fn new(prefix: impl Into<String>, cache_buster: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            cache_buster: cache_buster.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn cache_buster(&self) -> &str {
        &self.cache_buster
    }

    /// Physical key for a logical key.
    pub fn qualify(&self, logical: &str) -> String {
        format!("{}:{}:{}", self.prefix, self.cache_buster, logical)
    }

    /// Strips this namespace from a physical key, if it belongs to it.
    pub fn logical<'a>(&self, physical: &'a str) -> Option<&'a str> {
        physical
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix(':')?
            .strip_prefix(self.cache_buster.as_str())?
            .strip_prefix(':')
    }

    /// True for keys under the same prefix but another cache-buster.
    pub fn is_stale(&self, physical: &str) -> bool {
        let Some(rest) = physical
            .strip_prefix(self.prefix.as_str())
            .and_then(|r| r.strip_prefix(':'))
        else {
            return false;
        };
        match rest.split_once(':') {
            Some((version, _)) => version != self.cache_buster,
            None => false,
        }
    }

    /// True for any key under this prefix, whatever its version.
    pub fn owns(&self, physical: &str) -> bool {
        physical
            .strip_prefix(self.prefix.as_str())
            .is_some_and(|r| r.starts_with(':'))
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new("haven", "v1")
    }
}
