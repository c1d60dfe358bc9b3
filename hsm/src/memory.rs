//! In-memory test double

use crate::config::HsmConfig;
use crate::error::Result;
use crate::kdf::MasterKey;
use crate::key::KeyInfo;
use crate::manager::{KeyManager, RotatedKey};
use crate::registry::KeyRegistry;
use crate::software::SoftwareHsm;
use crate::store::MemoryKeyStore;
use security::AuditLog;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Key manager with no persistence, a random master key and cheap KDF costs.
///
/// Behaves like [`SoftwareHsm`] and adds hooks tests need: forcing a key
/// inactive and counting cryptographic calls.
#[derive(Debug)]
pub struct MemoryHsm {
    inner: SoftwareHsm,
    registry: Arc<KeyRegistry>,
    sign_calls: AtomicUsize,
    decrypt_calls: AtomicUsize,
}

impl MemoryHsm {
    /// Double holding the default key set
    pub fn new() -> Self {
        Self::with_audit(AuditLog::tracing())
    }

    pub fn with_audit(audit: AuditLog) -> Self {
        let config = HsmConfig::for_testing("memory");
        let registry = Arc::new(KeyRegistry::new());
        let inner = SoftwareHsm::new(
            config,
            registry.clone(),
            Arc::new(MemoryKeyStore::new()),
            MasterKey::random(),
            audit,
        );
        if let Err(e) = inner.initialize() {
            tracing::warn!(error = %e, "Memory HSM initialisation failed");
        }
        Self {
            inner,
            registry,
            sign_calls: AtomicUsize::new(0),
            decrypt_calls: AtomicUsize::new(0),
        }
    }

    /// Mark a key inactive without rotating it
    pub fn deactivate(&self, key_id: &str) -> bool {
        match self.registry.write().get_mut(key_id) {
            Some(key) => {
                key.active = false;
                true
            }
            None => false,
        }
    }

    pub fn sign_calls(&self) -> usize {
        self.sign_calls.load(Ordering::Relaxed)
    }

    pub fn decrypt_calls(&self) -> usize {
        self.decrypt_calls.load(Ordering::Relaxed)
    }
}

impl Default for MemoryHsm {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyManager for MemoryHsm {
    fn generate_key_pair(&self, key_id: &str) -> Result<KeyInfo> {
        self.inner.generate_key_pair(key_id)
    }

    fn public_key(&self, key_id: &str) -> Result<Vec<u8>> {
        self.inner.public_key(key_id)
    }

    fn sign(&self, key_id: &str, data: &[u8]) -> Result<Vec<u8>> {
        self.sign_calls.fetch_add(1, Ordering::Relaxed);
        self.inner.sign(key_id, data)
    }

    fn verify(&self, key_id: &str, data: &[u8], signature: &[u8]) -> Result<bool> {
        self.inner.verify(key_id, data, signature)
    }

    fn encrypt_data(&self, key_id: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.inner.encrypt_data(key_id, plaintext)
    }

    fn decrypt_data(&self, key_id: &str, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.decrypt_calls.fetch_add(1, Ordering::Relaxed);
        self.inner.decrypt_data(key_id, ciphertext)
    }

    fn rotate_keys(&self) -> Result<Vec<RotatedKey>> {
        self.inner.rotate_keys()
    }

    fn delete_key(&self, key_id: &str) -> Result<()> {
        self.inner.delete_key(key_id)
    }

    fn hash_pin(&self, pin: &str) -> Result<String> {
        self.inner.hash_pin(pin)
    }

    fn verify_pin(&self, pin: &str, hash: &str) -> Result<bool> {
        self.inner.verify_pin(pin, hash)
    }

    fn key_info(&self, key_id: &str) -> Result<KeyInfo> {
        self.inner.key_info(key_id)
    }

    fn list_keys(&self) -> Vec<KeyInfo> {
        self.inner.list_keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HsmError;

    #[test]
    fn test_memory_hsm_defaults() {
        let hsm = MemoryHsm::new();
        assert_eq!(hsm.list_keys().len(), 3);
        let sig = hsm.sign("card_signing", b"x").unwrap();
        assert!(hsm.verify("card_signing", b"x", &sig).unwrap());
        assert_eq!(hsm.sign_calls(), 1);
    }

    #[test]
    fn test_deactivate() {
        let hsm = MemoryHsm::new();
        assert!(hsm.deactivate("card_signing"));
        assert!(!hsm.deactivate("missing"));
        assert!(matches!(hsm.sign("card_signing", b"x"), Err(HsmError::KeyInactive(_))));
    }
}
