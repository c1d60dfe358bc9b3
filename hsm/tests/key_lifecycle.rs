//! Key lifecycle through the public KeyManager interface

use hsm::{
    FileKeyStore, HsmConfig, HsmError, KeyManager, KeyRegistry, MasterKey, MemoryHsm, SoftwareHsm,
};
use proptest::prelude::*;
use security::{AuditEventType, AuditLog, MemoryAuditSink};
use std::sync::Arc;
use tempfile::tempdir;

#[test]
fn test_open_from_environment() {
    let dir = tempdir().unwrap();
    let config = HsmConfig {
        master_secret_env: "HSM_LIFECYCLE_TEST_SECRET".to_string(),
        ..HsmConfig::for_testing(dir.path().join("keys"))
    };
    std::env::set_var("HSM_LIFECYCLE_TEST_SECRET", "correct horse battery staple");

    let hsm = SoftwareHsm::open(config.clone(), AuditLog::tracing()).unwrap();
    assert_eq!(hsm.list_keys().len(), 3);
    assert!(dir.path().join("keys").join("user_encryption.key").exists());

    let sealed = hsm.encrypt_data("user_encryption", b"cak-0001").unwrap();
    drop(hsm);

    let reopened = SoftwareHsm::open(config, AuditLog::tracing()).unwrap();
    assert_eq!(reopened.decrypt_data("user_encryption", &sealed).unwrap(), b"cak-0001");
}

#[test]
fn test_delete_and_regenerate_persists() {
    let dir = tempdir().unwrap();
    let config = HsmConfig::for_testing(dir.path());
    let sink = MemoryAuditSink::new();

    let build = |sink: &MemoryAuditSink| {
        let master =
            MasterKey::derive(b"secret", config.master_salt.as_bytes(), &config.master_kdf).unwrap();
        let hsm = SoftwareHsm::new(
            config.clone(),
            Arc::new(KeyRegistry::new()),
            Arc::new(FileKeyStore::open(dir.path()).unwrap()),
            master,
            AuditLog::new(Arc::new(sink.clone())),
        );
        hsm.initialize().unwrap();
        hsm
    };

    let hsm = build(&sink);
    hsm.delete_key("card_signing").unwrap();
    hsm.generate_key_pair("card_signing").unwrap();
    let registry = hsm.registry();
    assert_eq!(registry.active_count(), 3);
    drop(hsm);

    let reopened = build(&sink);
    assert_eq!(reopened.list_keys().len(), 3);
    assert_eq!(sink.count(AuditEventType::KeyDeleted), 1);
}

#[test]
fn test_signature_detects_any_changed_byte() {
    let hsm = MemoryHsm::new();
    let data = b"v1|tx-001|1700000000|1234567890|0987654321|3000|NGN|1|DEBIT".to_vec();
    let sig = hsm.sign("transaction_signing", &data).unwrap();

    for i in 0..data.len() {
        let mut altered = data.clone();
        altered[i] ^= 0x20;
        assert!(!hsm.verify("transaction_signing", &altered, &sig).unwrap());
    }
}

#[test]
fn test_unknown_key_errors() {
    let hsm = MemoryHsm::new();
    assert!(matches!(hsm.public_key("nope"), Err(HsmError::KeyNotFound(_))));
    assert!(matches!(hsm.verify("nope", b"x", b"y"), Err(HsmError::KeyNotFound(_))));
    assert!(matches!(hsm.decrypt_data("nope", b"x"), Err(HsmError::KeyNotFound(_))));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_sign_then_verify(data in prop::collection::vec(any::<u8>(), 0..512)) {
        let hsm = MemoryHsm::new();
        for key in hsm.list_keys() {
            let sig = hsm.sign(&key.id, &data).unwrap();
            prop_assert!(hsm.verify(&key.id, &data, &sig).unwrap());
        }
    }

    #[test]
    fn prop_encrypt_then_decrypt(data in prop::collection::vec(any::<u8>(), 0..512)) {
        let hsm = MemoryHsm::new();
        let sealed = hsm.encrypt_data("user_encryption", &data).unwrap();
        prop_assert_eq!(hsm.decrypt_data("user_encryption", &sealed).unwrap(), data);
    }
}
