//! Master key derivation and envelope sealing.
//!
//! The master key is derived from the operator secret with Argon2id and a
//! fixed salt, lives only in memory, and seals both stored key records and
//! caller data with AES-256-GCM. Sealed output is `nonce (12 bytes) || ciphertext`.

use crate::config::KdfParams;
use crate::error::{HsmError, Result};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use zeroize::Zeroizing;

/// AES-GCM nonce length
pub const NONCE_LEN: usize = 12;

/// Master key length (AES-256)
pub const MASTER_KEY_LEN: usize = 32;

/// In-memory master key
pub struct MasterKey {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

impl MasterKey {
    /// Derive the master key from an operator secret
    pub fn derive(secret: &[u8], salt: &[u8], params: &KdfParams) -> Result<Self> {
        let mut key = Zeroizing::new([0u8; MASTER_KEY_LEN]);
        params
            .argon2(MASTER_KEY_LEN)?
            .hash_password_into(secret, salt, &mut key[..])?;
        Ok(Self::from_bytes(&key))
    }

    /// Use raw key bytes directly
    pub fn from_bytes(key: &[u8; MASTER_KEY_LEN]) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(key);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Random master key, for test doubles
    pub fn random() -> Self {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        Self {
            cipher: Aes256Gcm::new(&key),
        }
    }

    /// Encrypt with a fresh random nonce, prepended to the ciphertext
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| HsmError::Encryption(e.to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt `nonce || ciphertext`
    pub fn open(&self, sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if sealed.len() < NONCE_LEN {
            return Err(HsmError::Decryption);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| HsmError::Decryption)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cheap() -> KdfParams {
        KdfParams {
            t_cost: 1,
            m_cost_kib: 64,
            parallelism: 1,
        }
    }

    #[test]
    fn test_seal_open() {
        let master = MasterKey::derive(b"operator-secret", b"fixed-salt-value", &cheap()).unwrap();
        let sealed = master.seal(b"card authentication key").unwrap();
        assert_eq!(&master.open(&sealed).unwrap()[..], b"card authentication key");
    }

    #[test]
    fn test_nonce_is_random() {
        let master = MasterKey::random();
        let a = master.seal(b"same").unwrap();
        let b = master.seal(b"same").unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let a = MasterKey::derive(b"secret", b"fixed-salt-value", &cheap()).unwrap();
        let b = MasterKey::derive(b"secret", b"fixed-salt-value", &cheap()).unwrap();
        let sealed = a.seal(b"payload").unwrap();
        assert!(b.open(&sealed).is_ok());
    }

    #[test]
    fn test_wrong_secret_fails() {
        let a = MasterKey::derive(b"secret-a", b"fixed-salt-value", &cheap()).unwrap();
        let b = MasterKey::derive(b"secret-b", b"fixed-salt-value", &cheap()).unwrap();
        let sealed = a.seal(b"payload").unwrap();
        assert!(matches!(b.open(&sealed), Err(HsmError::Decryption)));
    }

    #[test]
    fn test_truncated_and_tampered() {
        let master = MasterKey::random();
        assert!(matches!(master.open(&[0u8; 5]), Err(HsmError::Decryption)));

        let mut sealed = master.seal(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(master.open(&sealed), Err(HsmError::Decryption)));
    }
}
