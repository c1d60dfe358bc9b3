//! Error types for the key-management core

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, HsmError>;

/// HSM errors
#[derive(Error, Debug)]
pub enum HsmError {
    /// Identifier outside the allowed character set or escaping the key store
    #[error("Invalid key id: {0}")]
    InvalidKeyId(String),

    /// Key identifier already taken
    #[error("Key already exists: {0}")]
    KeyExists(String),

    /// Unknown key identifier
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// Key is inactive or expired and may not be used for this operation
    #[error("Key is not active: {0}")]
    KeyInactive(String),

    /// Master secret missing from the environment
    #[error("Master secret not set: {0}")]
    MasterSecretMissing(String),

    /// Key derivation failed
    #[error("Key derivation error: {0}")]
    KeyDerivation(String),

    /// Encryption failed
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Ciphertext malformed or failed authentication
    #[error("Decryption failed")]
    Decryption,

    /// Stored key material could not be decoded
    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),

    /// PIN hashing or decoding failed
    #[error("PIN hash error: {0}")]
    PinHash(String),

    /// Key store I/O error
    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<bincode::Error> for HsmError {
    fn from(err: bincode::Error) -> Self {
        HsmError::Serialization(err.to_string())
    }
}

impl From<argon2::Error> for HsmError {
    fn from(err: argon2::Error) -> Self {
        HsmError::KeyDerivation(err.to_string())
    }
}
