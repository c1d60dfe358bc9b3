//! Service configuration
//!
//! Every section has working defaults. `from_file` reads TOML; `from_env`
//! overlays environment variables (and `.env`) on top of the defaults.

use crate::error::{Result, TransactionError};
use crate::fees::FeeSchedule;
use crate::validator::FreshnessPolicy;
use hsm::HsmConfig;
use ledger_core::LedgerConfig;
use rust_decimal::Decimal;
use security::AuditLogConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Transaction engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub ledger: LedgerConfig,
    pub hsm: HsmConfig,
    pub redis: RedisConfig,
    pub audit: AuditLogConfig,
    pub fees: FeeSchedule,
    pub freshness: FreshnessConfig,
    pub limits: LimitsConfig,
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ledger: LedgerConfig::default(),
            hsm: HsmConfig::default(),
            redis: RedisConfig::default(),
            audit: AuditLogConfig::default(),
            fees: FeeSchedule::default(),
            freshness: FreshnessConfig::default(),
            limits: LimitsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

/// Timestamp windows; live and batch are deliberately separate policies
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FreshnessConfig {
    pub live: FreshnessPolicy,
    pub batch: FreshnessPolicy,
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        Self {
            live: FreshnessPolicy::live(),
            batch: FreshnessPolicy::batch(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Largest accepted batch
    pub max_batch_size: usize,

    /// Lifetime of cached transaction outcomes (seconds)
    pub idempotency_ttl_secs: u64,

    /// Lifetime of cached per-account counters (seconds)
    pub counter_ttl_secs: u64,

    /// Bounded post-commit job queue
    pub hook_queue_capacity: usize,

    /// Bounded audit-file write queue
    pub audit_queue_capacity: usize,

    /// Interval between background key-rotation sweeps (seconds)
    pub key_rotation_interval_secs: u64,

    /// Time allowed for queued jobs to drain on shutdown (seconds)
    pub shutdown_grace_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            idempotency_ttl_secs: 24 * 60 * 60,
            counter_ttl_secs: 5 * 60,
            hook_queue_capacity: 1024,
            audit_queue_capacity: 4096,
            key_rotation_interval_secs: 60 * 60,
            shutdown_grace_secs: 10,
        }
    }
}

impl LimitsConfig {
    pub fn key_rotation_interval(&self) -> Duration {
        Duration::from_secs(self.key_rotation_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = TransactionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            other => Err(TransactionError::Config(format!("unknown log format {:?}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,

    /// Default `EnvFilter` directive when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            filter: "info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TransactionError::Config(format!("Failed to read config: {}", e)))?;
        toml::from_str(&content).map_err(|e| TransactionError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load from environment variables (and `.env` if present)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let mut config = EngineConfig {
            ledger: LedgerConfig::from_env().map_err(|e| TransactionError::Config(e.to_string()))?,
            ..EngineConfig::default()
        };

        if let Ok(url) = std::env::var("REDIS_URL") {
            config.redis.url = url;
        }
        if let Ok(path) = std::env::var("HSM_KEY_STORE_PATH") {
            config.hsm.key_store_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("AUDIT_LOG_PATH") {
            config.audit.log_path = PathBuf::from(path);
        }
        if let Ok(pct) = std::env::var("TRANSFER_FEE_PERCENTAGE") {
            config.fees.percentage = parse_env::<Decimal>("TRANSFER_FEE_PERCENTAGE", &pct)?;
        }
        if let Ok(fixed) = std::env::var("TRANSFER_FEE_FIXED") {
            config.fees.fixed = parse_env("TRANSFER_FEE_FIXED", &fixed)?;
        }
        if let Ok(size) = std::env::var("MAX_BATCH_SIZE") {
            config.limits.max_batch_size = parse_env("MAX_BATCH_SIZE", &size)?;
        }
        if let Ok(format) = std::env::var("LOG_FORMAT") {
            config.logging.format = format.parse()?;
        }

        Ok(config)
    }
}

fn parse_env<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| TransactionError::Config(format!("{} has invalid value {:?}", name, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.limits.max_batch_size, 100);
        assert_eq!(config.limits.idempotency_ttl_secs, 86_400);
        assert_eq!(config.limits.counter_ttl_secs, 300);
        assert_eq!(config.limits.hook_queue_capacity, 1024);
        assert_eq!(config.limits.audit_queue_capacity, 4096);
        assert_eq!(config.fees.fixed, 50);
        assert_eq!(config.freshness.live.past_tolerance_secs, 300);
        assert_eq!(config.freshness.batch.past_tolerance_secs, 7 * 86_400);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_from_file_overrides_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(
            &path,
            r#"
[fees]
percentage = "1.25"
fixed = 10

[freshness.live]
future_tolerance_secs = 5
past_tolerance_secs = 60

[limits]
max_batch_size = 20

[logging]
format = "pretty"
"#,
        )
        .unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.fees.percentage, Decimal::new(125, 2));
        assert_eq!(config.fees.fixed, 10);
        assert_eq!(config.freshness.live.future_tolerance_secs, 5);
        assert_eq!(config.freshness.batch.past_tolerance_secs, 7 * 86_400);
        assert_eq!(config.limits.max_batch_size, 20);
        assert_eq!(config.limits.counter_ttl_secs, 300);
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
