//! Value sealing using ChaCha20-Poly1305.
//!
//! Every sealed value carries its own random nonce. The caller supplies
//! associated data (the storage key) which is authenticated but not stored.

use crate::error::{CryptoError, CryptoResult};
use crate::key::StoreKey;
use base64::{engine::general_purpose::STANDARD, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Size of nonce in bytes (96 bits for ChaCha20-Poly1305).
pub const NONCE_SIZE: usize = 12;

/// Size of authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// A sealed value: nonce plus ciphertext (auth tag appended).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedValue {
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
}

impl SealedValue {
    /// Total encoded size in bytes.
    pub fn len(&self) -> usize {
        NONCE_SIZE + self.ciphertext.len()
    }

    /// Returns true if the ciphertext is empty.
    pub fn is_empty(&self) -> bool {
        self.ciphertext.is_empty()
    }

    /// Concatenates nonce and ciphertext.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.len());
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.ciphertext);
        bytes
    }

    /// Splits a `nonce || ciphertext` buffer.
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::Decryption("data too short".to_string()));
        }

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[..NONCE_SIZE]);
        Ok(Self {
            nonce,
            ciphertext: bytes[NONCE_SIZE..].to_vec(),
        })
    }

    /// Encodes to base64 for string-valued storage.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.to_bytes())
    }

    /// Decodes from base64.
    pub fn from_base64(encoded: &str) -> CryptoResult<Self> {
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| CryptoError::Decryption(format!("invalid base64: {e}")))?;
        Self::from_bytes(&bytes)
    }
}

/// Seals `plaintext`, authenticating `context` alongside it.
pub fn seal(key: &StoreKey, plaintext: &[u8], context: &[u8]) -> CryptoResult<SealedValue> {
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: context,
            },
        )
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    Ok(SealedValue {
        nonce: nonce_bytes,
        ciphertext,
    })
}

/// Opens a sealed value. Fails if the key, the context or the bytes differ
/// from what was sealed.
pub fn open(key: &StoreKey, sealed: &SealedValue, context: &[u8]) -> CryptoResult<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
    let nonce = Nonce::from_slice(&sealed.nonce);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: sealed.ciphertext.as_ref(),
                aad: context,
            },
        )
        .map_err(|_| {
            CryptoError::Decryption("wrong key, wrong context or tampered data".to_string())
        })
}

/// Seals a string and returns the base64 encoding.
pub fn seal_string(key: &StoreKey, plaintext: &str, context: &str) -> CryptoResult<String> {
    Ok(seal(key, plaintext.as_bytes(), context.as_bytes())?.to_base64())
}

/// Opens a base64-encoded sealed string.
pub fn open_string(key: &StoreKey, encoded: &str, context: &str) -> CryptoResult<String> {
    let sealed = SealedValue::from_base64(encoded)?;
    let plaintext = open(key, &sealed, context.as_bytes())?;
    String::from_utf8(plaintext)
        .map_err(|e| CryptoError::Decryption(format!("invalid UTF-8: {e}")))
}
