//! # Key-Management Core
//!
//! Software HSM protecting signing keys and sensitive data at rest.
//!
//! ## Architecture
//!
//! ```text
//! operator secret --Argon2id(fixed salt)--> MasterKey (memory only)
//!                                              |
//!        KeyRegistry (RwLock) <--load/seal--> KeyStore (<id>.key, nonce || AES-256-GCM)
//!                |
//!           SoftwareHsm  (implements KeyManager)
//! ```
//!
//! ## Invariants
//!
//! - At most one active key per identifier; rotation mints `<id>_<unix ts>`
//!   and retires the old key, which stays available for verification.
//! - Signing and public-key export require an active, unexpired key.
//! - Key identifiers are limited to `[A-Za-z0-9_-]` so they cannot resolve
//!   outside the key-store directory.
//! - Plaintext key material and the master secret never reach storage.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod kdf;
pub mod key;
pub mod manager;
pub mod memory;
pub mod pin;
pub mod registry;
pub mod software;
pub mod store;

pub use config::{HsmConfig, KdfParams, DEFAULT_KEYS};
pub use error::{HsmError, Result};
pub use kdf::MasterKey;
pub use key::{validate_key_id, KeyInfo};
pub use manager::{KeyManager, RotatedKey};
pub use memory::MemoryHsm;
pub use registry::KeyRegistry;
pub use software::SoftwareHsm;
pub use store::{FileKeyStore, KeyStore, MemoryKeyStore};
