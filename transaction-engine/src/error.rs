//! Error types for the transaction pipeline

use hsm::HsmError;
use ledger_core::{LedgerError, TransactionStatus};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransactionError>;

/// Failure classes, in the order callers usually branch on them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input or failed business rule; reported, never retried
    Validation,
    /// Lost a race or ran out of time; safe to retry with fresh reads
    Concurrency,
    /// Forged or replayed request; terminal and audited
    Integrity,
    /// Store, cache or settlement service unavailable
    Infrastructure,
    /// Key missing, inactive or ciphertext rejected
    Cryptographic,
}

#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Account not found: {}", security::mask_account(.0))]
    AccountNotFound(String),

    #[error("Account not active: {}", security::mask_account(.0))]
    AccountNotActive(String),

    #[error("Insufficient balance in {}: required {required}, available {available}", security::mask_account(.account))]
    InsufficientBalance {
        account: String,
        required: i64,
        available: i64,
    },

    #[error("Timestamp outside accepted window: {0}")]
    Freshness(String),

    #[error("Caller does not own account {0}")]
    Forbidden(String),

    #[error("Transaction not found: {0}")]
    NotFound(String),

    #[error("Reference {0} belongs to another transfer")]
    ReferenceConflict(String),

    #[error("Batch rejected: {0}")]
    BatchRejected(String),

    #[error("Signature verification failed")]
    SignatureMismatch,

    #[error("Double spend detected: {0}")]
    DoubleSpend(String),

    #[error("Optimistic lock conflict on account {}", security::mask_account(.0))]
    Conflict(String),

    #[error("Timed out after {0} ms")]
    Timeout(u64),

    #[error("Ledger error: {0}")]
    Ledger(LedgerError),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Settlement error: {0}")]
    Settlement(String),

    #[error("No authentication key for account {0}")]
    AuthKeyUnavailable(String),

    #[error("Key management error: {0}")]
    Hsm(#[from] HsmError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl TransactionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransactionError::Validation(_)
            | TransactionError::AccountNotFound(_)
            | TransactionError::AccountNotActive(_)
            | TransactionError::InsufficientBalance { .. }
            | TransactionError::Freshness(_)
            | TransactionError::Forbidden(_)
            | TransactionError::NotFound(_)
            | TransactionError::ReferenceConflict(_)
            | TransactionError::BatchRejected(_) => ErrorKind::Validation,
            TransactionError::SignatureMismatch | TransactionError::DoubleSpend(_) => ErrorKind::Integrity,
            TransactionError::Conflict(_) | TransactionError::Timeout(_) => ErrorKind::Concurrency,
            TransactionError::Ledger(_)
            | TransactionError::Cache(_)
            | TransactionError::Settlement(_)
            | TransactionError::Config(_) => ErrorKind::Infrastructure,
            TransactionError::AuthKeyUnavailable(_) | TransactionError::Hsm(_) => ErrorKind::Cryptographic,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            TransactionError::Ledger(e) => e.is_retryable(),
            other => other.kind() == ErrorKind::Concurrency,
        }
    }

    /// Status recorded when this error ends a transaction inside the ledger
    /// unit of work; `None` for errors that leave no record behind
    pub fn failure_status(&self) -> Option<TransactionStatus> {
        match self {
            TransactionError::AccountNotFound(_) => Some(TransactionStatus::FailedAccountNotFound),
            TransactionError::AccountNotActive(_) => Some(TransactionStatus::FailedAccountNotActive),
            TransactionError::InsufficientBalance { .. } => Some(TransactionStatus::FailedInsufficientBalance),
            TransactionError::Ledger(e) if !e.is_retryable() => Some(TransactionStatus::FailedDebitError),
            _ => None,
        }
    }
}

impl From<LedgerError> for TransactionError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::AccountNotFound(id) => TransactionError::AccountNotFound(id),
            LedgerError::AccountNotActive(id) => TransactionError::AccountNotActive(id),
            LedgerError::InsufficientBalance {
                account,
                required,
                available,
            } => TransactionError::InsufficientBalance {
                account,
                required,
                available,
            },
            LedgerError::OptimisticLockConflict(id) => TransactionError::Conflict(id),
            LedgerError::Timeout(ms) => TransactionError::Timeout(ms),
            LedgerError::InvalidPosting(msg) => TransactionError::Validation(msg),
            other => TransactionError::Ledger(other),
        }
    }
}

impl From<redis::RedisError> for TransactionError {
    fn from(err: redis::RedisError) -> Self {
        TransactionError::Cache(err.to_string())
    }
}

impl From<serde_json::Error> for TransactionError {
    fn from(err: serde_json::Error) -> Self {
        TransactionError::Cache(format!("serialization failed: {}", err))
    }
}

impl From<prometheus::Error> for TransactionError {
    fn from(err: prometheus::Error) -> Self {
        TransactionError::Config(format!("metrics registration failed: {}", err))
    }
}

impl From<regex::Error> for TransactionError {
    fn from(err: regex::Error) -> Self {
        TransactionError::Config(format!("invalid pattern: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_follow_taxonomy() {
        assert_eq!(TransactionError::Freshness("old".into()).kind(), ErrorKind::Validation);
        assert_eq!(TransactionError::SignatureMismatch.kind(), ErrorKind::Integrity);
        assert_eq!(TransactionError::DoubleSpend("counter 3".into()).kind(), ErrorKind::Integrity);
        assert_eq!(TransactionError::Conflict("a".into()).kind(), ErrorKind::Concurrency);
        assert_eq!(TransactionError::Cache("down".into()).kind(), ErrorKind::Infrastructure);
        assert_eq!(
            TransactionError::Hsm(HsmError::KeyNotFound("k".into())).kind(),
            ErrorKind::Cryptographic
        );
    }

    #[test]
    fn test_ledger_errors_map_to_specific_variants() {
        let err: TransactionError = LedgerError::OptimisticLockConflict("a".into()).into();
        assert!(matches!(err, TransactionError::Conflict(_)));
        assert!(err.is_retryable());

        let err: TransactionError = LedgerError::Unavailable("pool".into()).into();
        assert!(err.is_retryable());
        assert_eq!(err.failure_status(), None);

        let err: TransactionError = LedgerError::Database("boom".into()).into();
        assert!(!err.is_retryable());
        assert_eq!(err.failure_status(), Some(TransactionStatus::FailedDebitError));
    }

    #[test]
    fn test_failure_status_only_for_ledger_stage_errors() {
        assert_eq!(
            TransactionError::InsufficientBalance {
                account: "a".into(),
                required: 2,
                available: 1
            }
            .failure_status(),
            Some(TransactionStatus::FailedInsufficientBalance)
        );
        assert_eq!(TransactionError::SignatureMismatch.failure_status(), None);
        assert_eq!(TransactionError::Timeout(5000).failure_status(), None);
    }
}
