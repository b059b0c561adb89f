use haven_crypto::{DataEncryptor, EncryptorError, KeyEncryptor, PassthroughEncryptor, StoreKey};

#[test]
fn key_encryptor_roundtrip() {
    let enc = KeyEncryptor::new(StoreKey::generate());
    let blob = enc.encrypt_bytes("sync_queue", b"[1,2,3]").unwrap();
    assert_ne!(blob, b"[1,2,3]");
    assert_eq!(enc.decrypt_bytes("sync_queue", &blob).unwrap(), b"[1,2,3]");
}

#[test]
fn key_encryptor_binds_context() {
    let enc = KeyEncryptor::new(StoreKey::generate());
    let blob = enc.encrypt_bytes("sync_queue", b"data").unwrap();
    let err = enc.decrypt_bytes("failed_operations", &blob).unwrap_err();
    assert!(matches!(err, EncryptorError::Crypto(_)));
}

#[test]
fn key_encryptor_rejects_truncated_blob() {
    let enc = KeyEncryptor::new(StoreKey::generate());
    assert!(enc.decrypt_bytes("ctx", &[1, 2, 3]).is_err());
}

#[test]
fn key_encryptor_is_available() {
    assert!(KeyEncryptor::new(StoreKey::generate()).is_available());
}

#[test]
fn passthrough_is_identity() {
    let enc = PassthroughEncryptor;
    assert_eq!(enc.encrypt_bytes("ctx", b"plain").unwrap(), b"plain");
    assert_eq!(enc.decrypt_bytes("ctx", b"plain").unwrap(), b"plain");
    assert!(enc.is_available());
}

#[test]
fn encryptor_error_display() {
    assert!(EncryptorError::Unavailable.to_string().contains("store locked"));
    assert!(EncryptorError::Crypto("bad".into()).to_string().contains("bad"));
}
