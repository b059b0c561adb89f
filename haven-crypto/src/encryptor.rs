//! Abstract encryption interface used by the encrypted store.
//!
//! The store depends on `Arc<dyn DataEncryptor>` and never sees raw keys.
//! `KeyEncryptor` is the production implementation; `PassthroughEncryptor`
//! lets tests inspect what reaches the backend.

use crate::cipher::{self, SealedValue};
use crate::key::StoreKey;
use thiserror::Error;

/// Errors from the encryption layer.
#[derive(Debug, Error)]
pub enum EncryptorError {
    /// No key is loaded (device locked).
    #[error("encryptor unavailable (store locked)")]
    Unavailable,
    /// Underlying crypto failure.
    #[error("crypto error: {0}")]
    Crypto(String),
}

pub type EncryptorResult<T> = Result<T, EncryptorError>;

/// Encrypts and decrypts opaque byte slices bound to a context string.
pub trait DataEncryptor: Send + Sync {
    /// Encrypt `data` for the given storage context.
    fn encrypt_bytes(&self, context: &str, data: &[u8]) -> EncryptorResult<Vec<u8>>;

    /// Decrypt a blob produced by `encrypt_bytes` with the same context.
    fn decrypt_bytes(&self, context: &str, data: &[u8]) -> EncryptorResult<Vec<u8>>;

    /// Whether a key is loaded.
    fn is_available(&self) -> bool;
}

/// ChaCha20-Poly1305 encryptor holding the device store key.
pub struct KeyEncryptor {
    key: StoreKey,
}

impl KeyEncryptor {
    pub fn new(key: StoreKey) -> Self {
        Self { key }
    }
}

impl DataEncryptor for KeyEncryptor {
    fn encrypt_bytes(&self, context: &str, data: &[u8]) -> EncryptorResult<Vec<u8>> {
        cipher::seal(&self.key, data, context.as_bytes())
            .map(|sealed| sealed.to_bytes())
            .map_err(|e| EncryptorError::Crypto(e.to_string()))
    }

    fn decrypt_bytes(&self, context: &str, data: &[u8]) -> EncryptorResult<Vec<u8>> {
        let sealed =
            SealedValue::from_bytes(data).map_err(|e| EncryptorError::Crypto(e.to_string()))?;
        cipher::open(&self.key, &sealed, context.as_bytes())
            .map_err(|e| EncryptorError::Crypto(e.to_string()))
    }

    fn is_available(&self) -> bool {
        true
    }
}

/// No-op encryptor. Data passes through unchanged.
pub struct PassthroughEncryptor;

impl DataEncryptor for PassthroughEncryptor {
    fn encrypt_bytes(&self, _context: &str, data: &[u8]) -> EncryptorResult<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decrypt_bytes(&self, _context: &str, data: &[u8]) -> EncryptorResult<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn is_available(&self) -> bool {
        true
    }
}
