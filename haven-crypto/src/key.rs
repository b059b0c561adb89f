//! Device store keys.
//!
//! The usual path is a random key generated on first launch and parked in
//! the platform keychain behind [`KeyVault`]. Devices without a usable
//! keychain can derive the key from the worker's PIN with Argon2id instead.

use crate::error::{CryptoError, CryptoResult};
use argon2::{Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Mutex;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of store keys in bytes (256 bits for ChaCha20).
pub const KEY_SIZE: usize = 32;

/// Size of salt in bytes.
pub const SALT_SIZE: usize = 16;

/// A 256-bit store key, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct StoreKey {
    bytes: [u8; KEY_SIZE],
}

impl StoreKey {
    /// Wraps raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Returns the key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Generates a random key from the OS RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Derives a key from a PIN or passphrase using Argon2id.
    pub fn derive_from_pin(pin: &str, salt: &Salt, params: &KdfParams) -> CryptoResult<Self> {
        let argon2_params = Params::new(
            params.memory_cost,
            params.time_cost,
            params.parallelism,
            Some(KEY_SIZE),
        )
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

        let argon2 = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, argon2_params);

        let mut bytes = [0u8; KEY_SIZE];
        argon2
            .hash_password_into(pin.as_bytes(), salt.as_bytes(), &mut bytes)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

        Ok(Self { bytes })
    }

    /// Encodes the key for storage in a keychain entry.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.bytes)
    }

    /// Decodes a key previously produced by [`StoreKey::to_base64`].
    pub fn from_base64(encoded: &str) -> CryptoResult<Self> {
        let mut decoded = STANDARD
            .decode(encoded)
            .map_err(|e| CryptoError::Decryption(format!("invalid base64 key: {e}")))?;

        if decoded.len() != KEY_SIZE {
            let actual = decoded.len();
            decoded.zeroize();
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual,
            });
        }

        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&decoded);
        decoded.zeroize();
        Ok(Self { bytes })
    }

    /// Loads the key stored under `name`, generating and saving a fresh one
    /// on first use.
    pub fn load_or_create(vault: &dyn KeyVault, name: &str) -> CryptoResult<Self> {
        if let Some(encoded) = vault.load_key(name)? {
            return Self::from_base64(&encoded);
        }

        let key = Self::generate();
        vault.save_key(name, &key.to_base64())?;
        Ok(key)
    }
}

impl std::fmt::Debug for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Salt for PIN derivation.
#[derive(Clone, Debug)]
pub struct Salt {
    bytes: [u8; SALT_SIZE],
}

impl Salt {
    /// Generates a random salt.
    pub fn random() -> Self {
        let mut bytes = [0u8; SALT_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Creates a salt from raw bytes.
    pub fn from_bytes(bytes: [u8; SALT_SIZE]) -> Self {
        Self { bytes }
    }

    /// Returns the salt bytes.
    pub fn as_bytes(&self) -> &[u8; SALT_SIZE] {
        &self.bytes
    }
}

/// Argon2id cost parameters.
#[derive(Clone, Debug)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub memory_cost: u32,
    /// Time cost (iterations).
    pub time_cost: u32,
    /// Parallelism factor.
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        // OWASP Argon2id baseline; stays under a second on mid-range phones
        Self {
            memory_cost: 19 * 1024,
            time_cost: 2,
            parallelism: 1,
        }
    }
}

/// Platform keychain holding the store key.
///
/// On device this is backed by the OS secure enclave/keystore; the core only
/// needs string get/set/delete.
pub trait KeyVault: Send + Sync {
    /// Saves a secret under `name`, replacing any previous value.
    fn save_key(&self, name: &str, secret: &str) -> CryptoResult<()>;

    /// Loads the secret under `name`, if any.
    fn load_key(&self, name: &str) -> CryptoResult<Option<String>>;

    /// Deletes the secret under `name`. Deleting a missing entry is not an error.
    fn delete_key(&self, name: &str) -> CryptoResult<()>;
}

/// In-memory vault for tests and simulators.
#[derive(Debug, Default)]
pub struct MemoryKeyVault {
    keys: Mutex<HashMap<String, String>>,
}

impl MemoryKeyVault {
    /// Creates an empty vault.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> CryptoResult<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.keys
            .lock()
            .map_err(|_| CryptoError::Vault("vault mutex poisoned".to_string()))
    }
}

impl KeyVault for MemoryKeyVault {
    fn save_key(&self, name: &str, secret: &str) -> CryptoResult<()> {
        self.lock()?.insert(name.to_string(), secret.to_string());
        Ok(())
    }

    fn load_key(&self, name: &str) -> CryptoResult<Option<String>> {
        Ok(self.lock()?.get(name).cloned())
    }

    fn delete_key(&self, name: &str) -> CryptoResult<()> {
        self.lock()?.remove(name);
        Ok(())
    }
}
