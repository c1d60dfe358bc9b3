//! Per-account authentication keys
//!
//! Each source account shares an HMAC key with its terminal. Keys rest in
//! the store sealed under the HSM `user_encryption` purpose and are unsealed
//! only for the duration of a verification.

use crate::error::{Result, TransactionError};
use async_trait::async_trait;
use dashmap::DashMap;
use hsm::KeyManager;
use ledger_core::LedgerStore;
use std::sync::Arc;
use tracing::debug;
use zeroize::Zeroizing;

/// Purpose key used to seal authentication keys
pub const SEALING_KEY: &str = "user_encryption";

/// Source of per-account HMAC keys
#[async_trait]
pub trait AuthKeyProvider: Send + Sync {
    /// `Ok(None)` when the account has no key provisioned
    async fn auth_key(&self, account_id: &str) -> Result<Option<Zeroizing<Vec<u8>>>>;
}

/// Keys sealed by the HSM and persisted in the ledger store
#[derive(Clone)]
pub struct SealedAuthKeys {
    store: Arc<dyn LedgerStore>,
    keys: Arc<dyn KeyManager>,
}

impl std::fmt::Debug for SealedAuthKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedAuthKeys").finish_non_exhaustive()
    }
}

impl SealedAuthKeys {
    pub fn new(store: Arc<dyn LedgerStore>, keys: Arc<dyn KeyManager>) -> Self {
        Self { store, keys }
    }

    /// Seal and persist `key` for `account_id`, replacing any previous key
    pub async fn provision(&self, account_id: &str, key: &[u8]) -> Result<()> {
        if key.len() < 16 {
            return Err(TransactionError::Validation(
                "authentication key must be at least 16 bytes".to_string(),
            ));
        }
        let sealed = self.keys.encrypt_data(SEALING_KEY, key)?;
        self.store.store_auth_key(account_id, &sealed).await?;
        debug!(account = %security::mask_account(account_id), "Authentication key provisioned");
        Ok(())
    }
}

#[async_trait]
impl AuthKeyProvider for SealedAuthKeys {
    async fn auth_key(&self, account_id: &str) -> Result<Option<Zeroizing<Vec<u8>>>> {
        let Some(sealed) = self.store.auth_key(account_id).await? else {
            return Ok(None);
        };
        let key = self.keys.decrypt_data(SEALING_KEY, &sealed)?;
        Ok(Some(Zeroizing::new(key)))
    }
}

/// Plaintext keys held in memory
#[derive(Debug, Default)]
pub struct StaticAuthKeys {
    keys: DashMap<String, Zeroizing<Vec<u8>>>,
}

impl StaticAuthKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, account_id: impl Into<String>, key: impl Into<Vec<u8>>) {
        self.keys.insert(account_id.into(), Zeroizing::new(key.into()));
    }
}

#[async_trait]
impl AuthKeyProvider for StaticAuthKeys {
    async fn auth_key(&self, account_id: &str) -> Result<Option<Zeroizing<Vec<u8>>>> {
        Ok(self.keys.get(account_id).map(|k| k.value().clone()))
    }
}
