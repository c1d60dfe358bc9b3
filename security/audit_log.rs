//! Audit Logging
//!
//! Append-only trail for every ledger and key-management operation:
//! - Transfers (completed, failed, replayed)
//! - Integrity events (signature mismatch, double-spend)
//! - Key lifecycle (generation, rotation, deletion)
//! - Cryptographic failures (sign on inactive key, decryption failure)
//!
//! Events written by [`AuditLogger`] form a SHA-256 hash chain: every JSON
//! line carries the hash of the line before it, so a removed or edited line
//! is detected by [`AuditLogger::verify_integrity`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Audit log errors
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Integrity check failed: {0}")]
    IntegrityFailure(String),
}

pub type Result<T> = std::result::Result<T, AuditError>;

/// Audit event type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    // Ledger events
    Transfer,
    TransferFailed,
    IdempotentReplay,
    BatchCompleted,
    SettlementQueued,
    SettlementFailed,

    // Validation and integrity
    ValidationFailed,
    SignatureMismatch,
    DoubleSpend,

    // Key management
    KeyGenerated,
    KeyRotated,
    KeyRotationComplete,
    KeyDeleted,
    CryptoFailure,
    PinVerificationFailed,

    // Enquiries
    Enquiry,

    // System
    Operation,
    Error,
}

impl AuditEventType {
    /// Stable wire name, also fed into the event hash
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::Transfer => "TRANSFER",
            AuditEventType::TransferFailed => "TRANSFER_FAILED",
            AuditEventType::IdempotentReplay => "IDEMPOTENT_REPLAY",
            AuditEventType::BatchCompleted => "BATCH_COMPLETED",
            AuditEventType::SettlementQueued => "SETTLEMENT_QUEUED",
            AuditEventType::SettlementFailed => "SETTLEMENT_FAILED",
            AuditEventType::ValidationFailed => "VALIDATION_FAILED",
            AuditEventType::SignatureMismatch => "SIGNATURE_MISMATCH",
            AuditEventType::DoubleSpend => "DOUBLE_SPEND",
            AuditEventType::KeyGenerated => "KEY_GENERATED",
            AuditEventType::KeyRotated => "KEY_ROTATED",
            AuditEventType::KeyRotationComplete => "KEY_ROTATION_COMPLETE",
            AuditEventType::KeyDeleted => "KEY_DELETED",
            AuditEventType::CryptoFailure => "CRYPTO_FAILURE",
            AuditEventType::PinVerificationFailed => "PIN_VERIFICATION_FAILED",
            AuditEventType::Enquiry => "ENQUIRY",
            AuditEventType::Operation => "OPERATION",
            AuditEventType::Error => "ERROR",
        }
    }

    /// Integrity and key events are security relevant
    pub fn is_security_event(&self) -> bool {
        matches!(
            self,
            AuditEventType::SignatureMismatch
                | AuditEventType::DoubleSpend
                | AuditEventType::KeyGenerated
                | AuditEventType::KeyRotated
                | AuditEventType::KeyRotationComplete
                | AuditEventType::KeyDeleted
                | AuditEventType::CryptoFailure
                | AuditEventType::PinVerificationFailed
        )
    }
}

/// Audit severity level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl AuditSeverity {
    fn as_str(&self) -> &'static str {
        match self {
            AuditSeverity::Debug => "debug",
            AuditSeverity::Info => "info",
            AuditSeverity::Warning => "warning",
            AuditSeverity::Error => "error",
            AuditSeverity::Critical => "critical",
        }
    }
}

/// Audit event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event ID
    pub event_id: Uuid,

    /// Event timestamp
    pub timestamp: DateTime<Utc>,

    /// Event type
    pub event_type: AuditEventType,

    /// Severity level
    pub severity: AuditSeverity,

    /// Transaction the event refers to
    pub transaction_id: Option<String>,

    /// Account identifier, already masked by the producer
    pub account_id: Option<String>,

    /// Amount in minor units
    pub amount: Option<i64>,

    /// Outcome or terminal status
    pub status: String,

    /// Free-form structured details
    pub details: serde_json::Value,

    /// Previous event hash (for hash chain)
    pub previous_hash: String,

    /// Current event hash
    pub hash: String,
}

impl AuditEvent {
    /// Create new audit event
    pub fn new(event_type: AuditEventType, severity: AuditSeverity, status: impl Into<String>) -> Self {
        let mut event = Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type,
            severity,
            transaction_id: None,
            account_id: None,
            amount: None,
            status: status.into(),
            details: serde_json::Value::Null,
            previous_hash: String::new(),
            hash: String::new(),
        };

        event.hash = event.compute_hash();
        event
    }

    /// Compute event hash
    fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();

        // Include all fields except hash itself
        hasher.update(self.event_id.as_bytes());
        hasher.update(self.timestamp.to_rfc3339().as_bytes());
        hasher.update(self.event_type.as_str().as_bytes());
        hasher.update(self.severity.as_str().as_bytes());
        if let Some(tx) = &self.transaction_id {
            hasher.update(tx.as_bytes());
        }
        if let Some(account) = &self.account_id {
            hasher.update(account.as_bytes());
        }
        if let Some(amount) = self.amount {
            hasher.update(amount.to_be_bytes());
        }
        hasher.update(self.status.as_bytes());
        hasher.update(self.details.to_string().as_bytes());
        hasher.update(self.previous_hash.as_bytes());

        hex::encode(hasher.finalize())
    }

    /// Verify event hash
    pub fn verify_hash(&self) -> bool {
        self.hash == self.compute_hash()
    }

    /// Set previous hash (for hash chain)
    pub fn set_previous_hash(&mut self, previous_hash: String) {
        self.previous_hash = previous_hash;
        self.hash = self.compute_hash();
    }

    /// Builder methods
    pub fn with_transaction(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self.hash = self.compute_hash();
        self
    }

    pub fn with_account(mut self, masked_account: impl Into<String>) -> Self {
        self.account_id = Some(masked_account.into());
        self.hash = self.compute_hash();
        self
    }

    pub fn with_amount(mut self, amount: i64) -> Self {
        self.amount = Some(amount);
        self.hash = self.compute_hash();
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self.hash = self.compute_hash();
        self
    }
}

/// Audit log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditLogConfig {
    /// Log file path
    pub log_path: PathBuf,

    /// Enable hash chain
    pub enable_hash_chain: bool,

    /// Minimum severity to log
    pub min_severity: AuditSeverity,
}

impl Default for AuditLogConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from("./data/audit.log"),
            enable_hash_chain: true,
            min_severity: AuditSeverity::Info,
        }
    }
}

/// Hash-chained JSON-lines audit file
#[derive(Debug)]
pub struct AuditLogger {
    config: AuditLogConfig,
    // Guards both the file handle and the chain head so appends stay ordered.
    state: Mutex<ChainState>,
}

#[derive(Debug)]
struct ChainState {
    file: File,
    last_hash: String,
}

impl AuditLogger {
    /// Create new audit logger
    pub fn new(config: AuditLogConfig) -> Result<Self> {
        if let Some(parent) = config.log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let last_hash = Self::get_last_hash(&config.log_path)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.log_path)?;

        Ok(Self {
            config,
            state: Mutex::new(ChainState { file, last_hash }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.config.log_path
    }

    /// Get last hash from log file
    fn get_last_hash(path: &Path) -> Result<String> {
        if !path.exists() {
            return Ok(String::new());
        }

        let reader = BufReader::new(File::open(path)?);
        let mut last = None;
        for line in reader.lines() {
            let line = line?;
            if !line.trim().is_empty() {
                last = Some(line);
            }
        }

        match last {
            Some(line) => {
                let event: AuditEvent = serde_json::from_str(&line)
                    .map_err(|e| AuditError::Serialization(e.to_string()))?;
                Ok(event.hash)
            }
            None => Ok(String::new()),
        }
    }

    /// Log audit event
    pub async fn log(&self, mut event: AuditEvent) -> Result<()> {
        if event.severity < self.config.min_severity {
            return Ok(());
        }

        let mut state = self.state.lock().await;

        if self.config.enable_hash_chain {
            event.set_previous_hash(state.last_hash.clone());
        }

        let mut json = serde_json::to_string(&event)
            .map_err(|e| AuditError::Serialization(e.to_string()))?;
        json.push('\n');

        state.file.write_all(json.as_bytes())?;
        state.file.flush()?;

        if self.config.enable_hash_chain {
            state.last_hash = event.hash;
        }

        Ok(())
    }

    /// Verify log integrity (hash chain)
    pub async fn verify_integrity(&self) -> Result<bool> {
        if !self.config.enable_hash_chain {
            return Ok(true);
        }

        // Hold the append lock so the file is not read mid-write.
        let _state = self.state.lock().await;
        let reader = BufReader::new(File::open(&self.config.log_path)?);

        let mut previous_hash = String::new();

        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            let event: AuditEvent = serde_json::from_str(&line)
                .map_err(|e| AuditError::Serialization(e.to_string()))?;

            if !event.verify_hash() {
                return Err(AuditError::IntegrityFailure(format!(
                    "Event hash mismatch at line {}",
                    i + 1
                )));
            }

            if event.previous_hash != previous_hash {
                return Err(AuditError::IntegrityFailure(format!(
                    "Hash chain broken at line {}",
                    i + 1
                )));
            }

            previous_hash = event.hash.clone();
        }

        Ok(true)
    }

    /// Search audit log
    pub async fn search(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>> {
        let _state = self.state.lock().await;
        let reader = BufReader::new(File::open(&self.config.log_path)?);

        let mut results = Vec::new();
        for line in reader.lines() {
            let line = line?;
            let event: AuditEvent = serde_json::from_str(&line)
                .map_err(|e| AuditError::Serialization(e.to_string()))?;
            if filter.matches(&event) {
                results.push(event);
            }
        }

        Ok(results)
    }
}

/// Search criteria for [`AuditLogger::search`]
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub event_type: Option<AuditEventType>,
    pub transaction_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl AuditFilter {
    pub fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(et) = self.event_type {
            if event.event_type != et {
                return false;
            }
        }
        if let Some(ref tx) = self.transaction_id {
            if event.transaction_id.as_deref() != Some(tx.as_str()) {
                return false;
            }
        }
        if let Some(start) = self.start_time {
            if event.timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end_time {
            if event.timestamp > end {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn transfer_event(tx: &str) -> AuditEvent {
        AuditEvent::new(AuditEventType::Transfer, AuditSeverity::Info, "COMPLETED")
            .with_transaction(tx)
            .with_account("******7890")
            .with_amount(3000)
    }

    fn logger_at(path: PathBuf, chain: bool) -> AuditLogger {
        AuditLogger::new(AuditLogConfig {
            log_path: path,
            enable_hash_chain: chain,
            min_severity: AuditSeverity::Info,
        })
        .unwrap()
    }

    #[test]
    fn test_audit_event_hash() {
        let event = transfer_event("tx-1");
        assert!(event.verify_hash());

        let mut tampered = event.clone();
        tampered.amount = Some(1);
        assert!(!tampered.verify_hash());
    }

    #[tokio::test]
    async fn test_hash_chain() {
        let temp_dir = tempdir().unwrap();
        let log_path = temp_dir.path().join("audit.log");
        let logger = logger_at(log_path.clone(), true);

        for i in 0..5 {
            logger.log(transfer_event(&format!("tx-{}", i))).await.unwrap();
        }

        assert!(log_path.exists());
        assert!(logger.verify_integrity().await.unwrap());
    }

    #[tokio::test]
    async fn test_chain_resumes_after_reopen() {
        let temp_dir = tempdir().unwrap();
        let log_path = temp_dir.path().join("audit.log");

        {
            let logger = logger_at(log_path.clone(), true);
            logger.log(transfer_event("tx-a")).await.unwrap();
        }

        let logger = logger_at(log_path, true);
        logger.log(transfer_event("tx-b")).await.unwrap();
        assert!(logger.verify_integrity().await.unwrap());
    }

    #[tokio::test]
    async fn test_tampering_detected() {
        let temp_dir = tempdir().unwrap();
        let log_path = temp_dir.path().join("audit.log");
        let logger = logger_at(log_path.clone(), true);

        for i in 0..3 {
            logger.log(transfer_event(&format!("tx-{}", i))).await.unwrap();
        }

        let content = std::fs::read_to_string(&log_path).unwrap();
        let edited = content.replacen("\"amount\":3000", "\"amount\":9000", 1);
        std::fs::write(&log_path, edited).unwrap();

        let result = logger.verify_integrity().await;
        assert!(matches!(result, Err(AuditError::IntegrityFailure(_))));
    }

    #[tokio::test]
    async fn test_search() {
        let temp_dir = tempdir().unwrap();
        let logger = logger_at(temp_dir.path().join("audit.log"), false);

        for i in 0..3 {
            logger.log(transfer_event(&format!("tx-{}", i))).await.unwrap();
        }
        logger
            .log(AuditEvent::new(AuditEventType::KeyRotated, AuditSeverity::Warning, "ROTATED"))
            .await
            .unwrap();

        let results = logger
            .search(&AuditFilter {
                transaction_id: Some("tx-1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].transaction_id.as_deref(), Some("tx-1"));

        let results = logger
            .search(&AuditFilter {
                event_type: Some(AuditEventType::Transfer),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
    }

    #[tokio::test]
    async fn test_min_severity_filters() {
        let temp_dir = tempdir().unwrap();
        let logger = logger_at(temp_dir.path().join("audit.log"), true);

        logger
            .log(AuditEvent::new(AuditEventType::Operation, AuditSeverity::Debug, "NOISE"))
            .await
            .unwrap();

        let all = logger.search(&AuditFilter::default()).await.unwrap();
        assert!(all.is_empty());
    }
}
