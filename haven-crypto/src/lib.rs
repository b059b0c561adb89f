//! At-rest encryption for Haven.
//!
//! Values the sync engine persists on the device (the pending operation
//! queue, failed operations, cached case data) are sealed with
//! ChaCha20-Poly1305 before they reach disk. The storage key name is bound
//! as associated data, so a ciphertext copied under another key fails to
//! open.
//!
//! - [`StoreKey`] is the 256-bit device key, either random (kept in the
//!   platform keychain through [`KeyVault`]) or derived from a PIN with
//!   Argon2id.
//! - [`DataEncryptor`] is the seam the store depends on; it never sees raw
//!   key bytes.

mod cipher;
mod encryptor;
mod error;
mod key;

pub use cipher::{open, open_string, seal, seal_string, SealedValue, NONCE_SIZE, TAG_SIZE};
pub use encryptor::{
    DataEncryptor, EncryptorError, EncryptorResult, KeyEncryptor, PassthroughEncryptor,
};
pub use error::{CryptoError, CryptoResult};
pub use key::{KdfParams, KeyVault, MemoryKeyVault, Salt, StoreKey, KEY_SIZE, SALT_SIZE};
