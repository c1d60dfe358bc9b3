//! PIN hashing.
//!
//! Argon2id with a random 16-byte salt per hash, encoded as
//! `base64(salt || hash)`. Verification compares in constant time.

use crate::config::KdfParams;
use crate::error::{HsmError, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

pub const PIN_SALT_LEN: usize = 16;
pub const PIN_HASH_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct PinHasher {
    params: KdfParams,
}

impl PinHasher {
    pub fn new(params: KdfParams) -> Self {
        Self { params }
    }

    pub fn hash_pin(&self, pin: &str) -> Result<String> {
        let mut salt = [0u8; PIN_SALT_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);

        let hash = self.derive(pin, &salt)?;

        let mut encoded = Vec::with_capacity(PIN_SALT_LEN + PIN_HASH_LEN);
        encoded.extend_from_slice(&salt);
        encoded.extend_from_slice(&hash[..]);
        Ok(STANDARD.encode(encoded))
    }

    /// Errors only when the stored hash is malformed; a wrong PIN is `Ok(false)`
    pub fn verify_pin(&self, pin: &str, stored: &str) -> Result<bool> {
        let decoded = STANDARD
            .decode(stored)
            .map_err(|e| HsmError::PinHash(format!("malformed hash: {}", e)))?;
        if decoded.len() != PIN_SALT_LEN + PIN_HASH_LEN {
            return Err(HsmError::PinHash("malformed hash: bad length".to_string()));
        }
        let (salt, expected) = decoded.split_at(PIN_SALT_LEN);

        let computed = self.derive(pin, salt)?;
        Ok(computed[..].ct_eq(expected).into())
    }

    fn derive(&self, pin: &str, salt: &[u8]) -> Result<Zeroizing<[u8; PIN_HASH_LEN]>> {
        let mut out = Zeroizing::new([0u8; PIN_HASH_LEN]);
        self.params
            .argon2(PIN_HASH_LEN)?
            .hash_password_into(pin.as_bytes(), salt, &mut out[..])
            .map_err(|e| HsmError::PinHash(e.to_string()))?;
        Ok(out)
    }
}
