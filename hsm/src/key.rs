//! Key pairs and their at-rest record

use crate::error::{HsmError, Result};
use chrono::{DateTime, TimeZone, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

/// Longest accepted key identifier
pub const MAX_KEY_ID_LEN: usize = 128;

/// Reject identifiers that could escape the key-store directory.
///
/// Only `[A-Za-z0-9_-]` is allowed, which rules out separators, `..`, and
/// absolute paths.
pub fn validate_key_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(HsmError::InvalidKeyId("empty".to_string()));
    }
    if id.len() > MAX_KEY_ID_LEN {
        return Err(HsmError::InvalidKeyId(format!("longer than {} characters", MAX_KEY_ID_LEN)));
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(HsmError::InvalidKeyId(id.to_string()));
    }
    Ok(())
}

/// Ed25519 key pair managed by the HSM
pub struct KeyPair {
    pub id: String,
    signing_key: SigningKey,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
    /// Successor minted when this key was rotated
    pub rotated_to: Option<String>,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .field("active", &self.active)
            .field("rotated_to", &self.rotated_to)
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    /// Generate a fresh key valid for `validity` from `now`
    pub fn generate(id: String, now: DateTime<Utc>, validity: chrono::Duration) -> Self {
        let mut seed = [0u8; 32];
        rand::RngCore::fill_bytes(&mut OsRng, &mut seed);
        let signing_key = SigningKey::from_bytes(&seed);
        seed.zeroize();

        Self {
            id,
            signing_key,
            created_at: now,
            expires_at: now + validity,
            active: true,
            rotated_to: None,
        }
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Active and not yet expired
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        self.active && !self.is_expired_at(now)
    }

    /// Hash-then-sign: Ed25519 over the SHA-256 digest of `data`
    pub fn sign_digest(&self, data: &[u8]) -> Vec<u8> {
        let digest = Sha256::digest(data);
        let signature: Signature = self.signing_key.sign(&digest);
        signature.to_bytes().to_vec()
    }

    /// Counterpart of [`KeyPair::sign_digest`]; malformed signatures verify false
    pub fn verify_digest(&self, data: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        let digest = Sha256::digest(data);
        self.public_key().verify(&digest, &signature).is_ok()
    }

    pub fn info(&self) -> KeyInfo {
        KeyInfo {
            id: self.id.clone(),
            public_key: hex::encode(self.public_key().to_bytes()),
            created_at: self.created_at,
            expires_at: self.expires_at,
            active: self.active,
            rotated_to: self.rotated_to.clone(),
        }
    }

    pub(crate) fn to_record(&self) -> KeyRecord {
        KeyRecord {
            id: self.id.clone(),
            secret: self.signing_key.to_bytes().to_vec(),
            created_at: self.created_at.timestamp(),
            expires_at: self.expires_at.timestamp(),
            active: self.active,
            rotated_to: self.rotated_to.clone(),
        }
    }

    pub(crate) fn from_record(record: &KeyRecord) -> Result<Self> {
        let secret: [u8; 32] = record
            .secret
            .as_slice()
            .try_into()
            .map_err(|_| HsmError::InvalidKeyMaterial(format!("bad secret length for {}", record.id)))?;

        Ok(Self {
            id: record.id.clone(),
            signing_key: SigningKey::from_bytes(&secret),
            created_at: timestamp(record.created_at)?,
            expires_at: timestamp(record.expires_at)?,
            active: record.active,
            rotated_to: record.rotated_to.clone(),
        })
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| HsmError::InvalidKeyMaterial(format!("bad timestamp {}", secs)))
}

/// Serialized form of a key pair; only ever stored sealed under the master key
#[derive(Serialize, Deserialize)]
pub(crate) struct KeyRecord {
    pub id: String,
    pub secret: Vec<u8>,
    pub created_at: i64,
    pub expires_at: i64,
    pub active: bool,
    pub rotated_to: Option<String>,
}

impl Drop for KeyRecord {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// Public view of a key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub id: String,
    /// Hex-encoded Ed25519 public key
    pub public_key: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
    pub rotated_to: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_validate_key_id() {
        assert!(validate_key_id("card_signing").is_ok());
        assert!(validate_key_id("card_signing_1700000000").is_ok());
        assert!(validate_key_id("key-01").is_ok());

        assert!(validate_key_id("").is_err());
        assert!(validate_key_id("../etc/passwd").is_err());
        assert!(validate_key_id("/abs").is_err());
        assert!(validate_key_id("a/b").is_err());
        assert!(validate_key_id("..").is_err());
        assert!(validate_key_id("key.key").is_err());
        assert!(validate_key_id(&"k".repeat(MAX_KEY_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_sign_verify() {
        let key = KeyPair::generate("k".into(), Utc::now(), chrono::Duration::days(1));
        let sig = key.sign_digest(b"hello");
        assert!(key.verify_digest(b"hello", &sig));
        assert!(!key.verify_digest(b"hellO", &sig));
        assert!(!key.verify_digest(b"hello", &sig[..10]));
    }

    #[test]
    fn test_record_round_trip_keeps_key() {
        let key = KeyPair::generate("k".into(), Utc::now(), chrono::Duration::days(1));
        let restored = KeyPair::from_record(&key.to_record()).unwrap();
        let sig = key.sign_digest(b"data");
        assert!(restored.verify_digest(b"data", &sig));
        assert_eq!(restored.expires_at.timestamp(), key.expires_at.timestamp());
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        let key = KeyPair::generate("k".into(), now, chrono::Duration::days(365));
        assert!(key.is_usable_at(now));
        assert!(!key.is_usable_at(now + chrono::Duration::days(366)));
    }

    proptest! {
        #[test]
        fn prop_sign_verify(data in prop::collection::vec(any::<u8>(), 0..256)) {
            let key = KeyPair::generate("k".into(), Utc::now(), chrono::Duration::days(1));
            let sig = key.sign_digest(&data);
            prop_assert!(key.verify_digest(&data, &sig));
        }
    }
}
