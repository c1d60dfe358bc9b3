//! Key-management capability interface

use crate::error::{HsmError, Result};
use crate::key::KeyInfo;
use serde::{Deserialize, Serialize};

/// Outcome of rotating one key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotatedKey {
    pub old_id: String,
    pub new_id: String,
}

/// HSM operations available to the rest of the system.
///
/// `SoftwareHsm` is the production implementation; `MemoryHsm` is the test
/// double. Private key bytes never leave an implementation.
pub trait KeyManager: Send + Sync {
    /// Create a key pair; fails if the identifier already exists
    fn generate_key_pair(&self, key_id: &str) -> Result<KeyInfo>;

    /// Public key bytes of an active key
    fn public_key(&self, key_id: &str) -> Result<Vec<u8>>;

    /// Hash-then-sign with an active key
    fn sign(&self, key_id: &str, data: &[u8]) -> Result<Vec<u8>>;

    /// Verify a signature; permitted on inactive keys
    fn verify(&self, key_id: &str, data: &[u8], signature: &[u8]) -> Result<bool>;

    /// Seal data under the master key for the purpose named by `key_id`
    fn encrypt_data(&self, key_id: &str, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Open data sealed by [`KeyManager::encrypt_data`]
    fn decrypt_data(&self, key_id: &str, ciphertext: &[u8]) -> Result<Vec<u8>>;

    /// Replace expired or inactive keys with fresh successors
    fn rotate_keys(&self) -> Result<Vec<RotatedKey>>;

    /// Remove a key entirely
    fn delete_key(&self, key_id: &str) -> Result<()>;

    fn hash_pin(&self, pin: &str) -> Result<String>;

    fn verify_pin(&self, pin: &str, hash: &str) -> Result<bool>;

    fn key_info(&self, key_id: &str) -> Result<KeyInfo>;

    fn list_keys(&self) -> Vec<KeyInfo>;

    /// Follow the rotation chain from `key_id` to the key currently in use
    fn active_key_id(&self, key_id: &str) -> Result<String> {
        let mut current = self.key_info(key_id)?;
        // bounded walk, a chain can't be longer than the registry
        for _ in 0..=self.list_keys().len() {
            if current.active {
                return Ok(current.id);
            }
            match current.rotated_to.as_deref() {
                Some(next) => current = self.key_info(next)?,
                None => return Err(HsmError::KeyInactive(current.id)),
            }
        }
        Err(HsmError::KeyInactive(key_id.to_string()))
    }
}
