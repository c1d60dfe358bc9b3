//! HSM configuration

use crate::error::{HsmError, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default key identifiers created on first start
pub const DEFAULT_KEYS: [&str; 3] = ["card_signing", "transaction_signing", "user_encryption"];

/// Key-management configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HsmConfig {
    /// Directory holding one sealed `<id>.key` file per key
    pub key_store_path: PathBuf,

    /// Environment variable carrying the operator master secret
    pub master_secret_env: String,

    /// Fixed salt for the master-key derivation
    pub master_salt: String,

    /// Validity period of generated key pairs
    pub key_validity_days: i64,

    /// Cost of the master-key derivation
    pub master_kdf: KdfParams,

    /// Cost of PIN hashing
    pub pin_kdf: KdfParams,

    /// Keys generated when the store is empty
    pub default_keys: Vec<String>,
}

impl Default for HsmConfig {
    fn default() -> Self {
        Self {
            key_store_path: PathBuf::from("./data/keys"),
            master_secret_env: "HSM_MASTER_KEY".to_string(),
            master_salt: "payment-hsm-master-salt-v1".to_string(),
            key_validity_days: 365,
            master_kdf: KdfParams {
                t_cost: 3,
                m_cost_kib: 32 * 1024, // 32 MiB
                parallelism: 4,
            },
            pin_kdf: KdfParams {
                t_cost: 1,
                m_cost_kib: 64 * 1024, // 64 MiB
                parallelism: 4,
            },
            default_keys: DEFAULT_KEYS.iter().map(|k| k.to_string()).collect(),
        }
    }
}

impl HsmConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| HsmError::Config(format!("Failed to read config: {}", e)))?;
        toml::from_str(&content).map_err(|e| HsmError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Cheap derivation costs for tests
    pub fn for_testing(key_store_path: impl Into<PathBuf>) -> Self {
        let cheap = KdfParams {
            t_cost: 1,
            m_cost_kib: 64,
            parallelism: 1,
        };
        Self {
            key_store_path: key_store_path.into(),
            master_kdf: cheap.clone(),
            pin_kdf: cheap,
            ..Default::default()
        }
    }

    /// Read the master secret from the configured environment variable
    pub fn master_secret(&self) -> Result<String> {
        match std::env::var(&self.master_secret_env) {
            Ok(secret) if !secret.is_empty() => Ok(secret),
            _ => Err(HsmError::MasterSecretMissing(self.master_secret_env.clone())),
        }
    }

    pub fn key_validity(&self) -> chrono::Duration {
        chrono::Duration::days(self.key_validity_days)
    }
}

/// Argon2id cost parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub t_cost: u32,
    pub m_cost_kib: u32,
    pub parallelism: u32,
}

impl KdfParams {
    /// Argon2id instance producing `output_len` bytes
    pub fn argon2(&self, output_len: usize) -> Result<Argon2<'static>> {
        let params = Params::new(self.m_cost_kib, self.t_cost, self.parallelism, Some(output_len))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HsmConfig::default();
        assert_eq!(config.key_validity_days, 365);
        assert_eq!(config.master_kdf.t_cost, 3);
        assert_eq!(config.pin_kdf.m_cost_kib, 65536);
        assert_eq!(config.default_keys.len(), 3);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: HsmConfig = toml::from_str("key_validity_days = 30").unwrap();
        assert_eq!(config.key_validity_days, 30);
        assert_eq!(config.master_secret_env, "HSM_MASTER_KEY");
    }

    #[test]
    fn test_missing_master_secret() {
        let config = HsmConfig {
            master_secret_env: "HSM_TEST_SECRET_THAT_IS_NOT_SET".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.master_secret(), Err(HsmError::MasterSecretMissing(_))));
    }
}
