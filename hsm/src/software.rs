//! Software HSM: Ed25519 key pairs sealed at rest under an Argon2id-derived
//! master key.

use crate::config::HsmConfig;
use crate::error::{HsmError, Result};
use crate::kdf::MasterKey;
use crate::key::{validate_key_id, KeyInfo, KeyPair, KeyRecord};
use crate::manager::{KeyManager, RotatedKey};
use crate::pin::PinHasher;
use crate::registry::KeyRegistry;
use crate::store::{FileKeyStore, KeyStore};
use chrono::Utc;
use security::{AuditEventType, AuditLog};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

/// Production key manager
pub struct SoftwareHsm {
    config: HsmConfig,
    registry: Arc<KeyRegistry>,
    store: Arc<dyn KeyStore>,
    master: MasterKey,
    pins: PinHasher,
    audit: AuditLog,
}

impl std::fmt::Debug for SoftwareHsm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareHsm")
            .field("keys", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl SoftwareHsm {
    /// Open the file key store from config, deriving the master key from the
    /// configured environment variable, and load or create the key set.
    pub fn open(config: HsmConfig, audit: AuditLog) -> Result<Self> {
        let secret = Zeroizing::new(config.master_secret()?);
        let master = MasterKey::derive(secret.as_bytes(), config.master_salt.as_bytes(), &config.master_kdf)?;
        let store = Arc::new(FileKeyStore::open(&config.key_store_path)?);
        let hsm = Self::new(config, Arc::new(KeyRegistry::new()), store, master, audit);
        hsm.initialize()?;
        Ok(hsm)
    }

    /// Assemble from parts; call [`SoftwareHsm::initialize`] before use
    pub fn new(
        config: HsmConfig,
        registry: Arc<KeyRegistry>,
        store: Arc<dyn KeyStore>,
        master: MasterKey,
        audit: AuditLog,
    ) -> Self {
        let pins = PinHasher::new(config.pin_kdf.clone());
        Self {
            config,
            registry,
            store,
            master,
            pins,
            audit,
        }
    }

    /// Load every stored key, then create the default set if none exist
    pub fn initialize(&self) -> Result<()> {
        let loaded = self.load_keys()?;
        info!(keys = loaded, "Key store loaded");

        if self.registry.is_empty() {
            for key_id in self.config.default_keys.clone() {
                self.generate_key_pair(&key_id)?;
            }
            info!(keys = self.registry.len(), "Default keys generated");
        }
        Ok(())
    }

    pub fn registry(&self) -> Arc<KeyRegistry> {
        self.registry.clone()
    }

    fn load_keys(&self) -> Result<usize> {
        let mut keys = self.registry.write();
        let mut loaded = 0;

        for (key_id, sealed) in self.store.load_all()? {
            let plaintext = self.master.open(&sealed).map_err(|e| {
                error!(key_id = %key_id, "Stored key failed authentication");
                e
            })?;
            let record: KeyRecord = bincode::deserialize(&plaintext)?;
            if record.id != key_id {
                warn!(key_id = %key_id, record_id = %record.id, "Key file name does not match record, skipping");
                continue;
            }
            keys.insert(key_id, KeyPair::from_record(&record)?);
            loaded += 1;
        }
        Ok(loaded)
    }

    fn persist(&self, key: &KeyPair) -> Result<()> {
        let record = key.to_record();
        let plaintext = Zeroizing::new(bincode::serialize(&record)?);
        let sealed = self.master.seal(&plaintext)?;
        self.store.save(&key.id, &sealed)
    }

    fn crypto_failure(&self, operation: &str, key_id: &str, err: &HsmError) {
        self.audit.security(
            AuditEventType::CryptoFailure,
            None,
            None,
            json!({ "operation": operation, "key_id": key_id, "error": err.to_string() }),
        );
    }
}

impl KeyManager for SoftwareHsm {
    fn generate_key_pair(&self, key_id: &str) -> Result<KeyInfo> {
        validate_key_id(key_id)?;

        let mut keys = self.registry.write();
        if keys.contains_key(key_id) {
            return Err(HsmError::KeyExists(key_id.to_string()));
        }

        let key = KeyPair::generate(key_id.to_string(), Utc::now(), self.config.key_validity());
        self.persist(&key)?;
        let key_info = key.info();
        keys.insert(key_id.to_string(), key);
        drop(keys);

        info!(key_id, expires_at = %key_info.expires_at, "Key pair generated");
        self.audit.security(
            AuditEventType::KeyGenerated,
            None,
            None,
            json!({ "key_id": key_id, "expires_at": key_info.expires_at }),
        );
        Ok(key_info)
    }

    fn public_key(&self, key_id: &str) -> Result<Vec<u8>> {
        let keys = self.registry.read();
        let key = keys
            .get(key_id)
            .ok_or_else(|| HsmError::KeyNotFound(key_id.to_string()))?;
        if !key.is_usable_at(Utc::now()) {
            return Err(HsmError::KeyInactive(key_id.to_string()));
        }
        Ok(key.public_key().to_bytes().to_vec())
    }

    fn sign(&self, key_id: &str, data: &[u8]) -> Result<Vec<u8>> {
        let keys = self.registry.read();
        let key = keys
            .get(key_id)
            .ok_or_else(|| HsmError::KeyNotFound(key_id.to_string()))?;
        if !key.is_usable_at(Utc::now()) {
            drop(keys);
            let err = HsmError::KeyInactive(key_id.to_string());
            self.crypto_failure("sign", key_id, &err);
            return Err(err);
        }
        Ok(key.sign_digest(data))
    }

    fn verify(&self, key_id: &str, data: &[u8], signature: &[u8]) -> Result<bool> {
        let keys = self.registry.read();
        let key = keys
            .get(key_id)
            .ok_or_else(|| HsmError::KeyNotFound(key_id.to_string()))?;
        Ok(key.verify_digest(data, signature))
    }

    fn encrypt_data(&self, key_id: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        if !self.registry.contains(key_id) {
            return Err(HsmError::KeyNotFound(key_id.to_string()));
        }
        self.master.seal(plaintext)
    }

    fn decrypt_data(&self, key_id: &str, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if !self.registry.contains(key_id) {
            return Err(HsmError::KeyNotFound(key_id.to_string()));
        }
        match self.master.open(ciphertext) {
            Ok(plaintext) => Ok(plaintext.to_vec()),
            Err(e) => {
                self.crypto_failure("decrypt", key_id, &e);
                Err(e)
            }
        }
    }

    fn rotate_keys(&self) -> Result<Vec<RotatedKey>> {
        let now = Utc::now();
        let validity = self.config.key_validity();
        let mut rotated = Vec::new();

        let mut keys = self.registry.write();
        let mut due: Vec<String> = keys
            .values()
            .filter(|k| k.rotated_to.is_none() && (!k.active || k.is_expired_at(now)))
            .map(|k| k.id.clone())
            .collect();
        due.sort();

        for old_id in due {
            let new_id = format!("{}_{}", old_id, now.timestamp());
            if validate_key_id(&new_id).is_err() || keys.contains_key(&new_id) {
                warn!(key_id = %old_id, new_id = %new_id, "Cannot mint successor id, skipping");
                continue;
            }

            let successor = KeyPair::generate(new_id.clone(), now, validity);
            if let Err(e) = self.persist(&successor) {
                error!(key_id = %old_id, error = %e, "Failed to persist rotated key");
                self.audit.error("rotate_key", None, &e);
                continue;
            }

            if let Some(old) = keys.get_mut(&old_id) {
                old.active = false;
                old.rotated_to = Some(new_id.clone());
                if let Err(e) = self.persist(old) {
                    error!(key_id = %old_id, error = %e, "Failed to persist retired key");
                }
            }
            keys.insert(new_id.clone(), successor);

            info!(old_id = %old_id, new_id = %new_id, "Key rotated");
            self.audit.security(
                AuditEventType::KeyRotated,
                None,
                None,
                json!({ "old_key_id": old_id, "new_key_id": new_id }),
            );
            rotated.push(RotatedKey { old_id, new_id });
        }
        drop(keys);

        self.audit.security(
            AuditEventType::KeyRotationComplete,
            None,
            None,
            json!({ "rotated_keys": rotated }),
        );
        debug!(rotated = rotated.len(), "Key rotation pass finished");
        Ok(rotated)
    }

    fn delete_key(&self, key_id: &str) -> Result<()> {
        validate_key_id(key_id)?;
        let mut keys = self.registry.write();
        if !keys.contains_key(key_id) {
            return Err(HsmError::KeyNotFound(key_id.to_string()));
        }
        self.store.delete(key_id)?;
        keys.remove(key_id);
        drop(keys);

        info!(key_id, "Key deleted");
        self.audit
            .security(AuditEventType::KeyDeleted, None, None, json!({ "key_id": key_id }));
        Ok(())
    }

    fn hash_pin(&self, pin: &str) -> Result<String> {
        self.pins.hash_pin(pin)
    }

    fn verify_pin(&self, pin: &str, hash: &str) -> Result<bool> {
        let valid = self.pins.verify_pin(pin, hash)?;
        if !valid {
            self.audit
                .security(AuditEventType::PinVerificationFailed, None, None, json!({}));
        }
        Ok(valid)
    }

    fn key_info(&self, key_id: &str) -> Result<KeyInfo> {
        self.registry
            .info(key_id)
            .ok_or_else(|| HsmError::KeyNotFound(key_id.to_string()))
    }

    fn list_keys(&self) -> Vec<KeyInfo> {
        self.registry.infos()
    }
}
