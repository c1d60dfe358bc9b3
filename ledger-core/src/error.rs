//! Error types for the ledger

use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, LedgerError>;

/// PostgreSQL SQLSTATE for unique constraint violations
const UNIQUE_VIOLATION: &str = "23505";

/// Ledger errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Account does not exist
    #[error("Account not found: {}", security::mask_account(.0))]
    AccountNotFound(String),

    /// Account exists but its status forbids money movement
    #[error("Account not active: {}", security::mask_account(.0))]
    AccountNotActive(String),

    /// Debited account would go below zero
    #[error("Insufficient balance in {}: required {required}, available {available}", security::mask_account(.account))]
    InsufficientBalance {
        account: String,
        required: i64,
        available: i64,
    },

    /// Version-conditioned update affected no row
    #[error("Optimistic lock conflict on account {}", security::mask_account(.0))]
    OptimisticLockConflict(String),

    /// Legs do not form a balanced posting
    #[error("Invalid posting: {0}")]
    InvalidPosting(String),

    /// Unique constraint violated (transaction id or source counter)
    #[error("Duplicate record: {0}")]
    Duplicate(String),

    /// Unit of work exceeded its deadline and was rolled back
    #[error("Ledger operation timed out after {0} ms")]
    Timeout(u64),

    /// Store temporarily unreachable (pool exhausted, connection lost)
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Other database error
    #[error("Database error: {0}")]
    Database(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl LedgerError {
    /// Safe to retry with fresh reads
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::OptimisticLockConflict(_) | LedgerError::Timeout(_) | LedgerError::Unavailable(_)
        )
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
                LedgerError::Duplicate(db.message().to_string())
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                LedgerError::Unavailable(err.to_string())
            }
            other => LedgerError::Database(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for LedgerError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        LedgerError::Database(format!("migration failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(LedgerError::OptimisticLockConflict("a".into()).is_retryable());
        assert!(LedgerError::Timeout(5000).is_retryable());
        assert!(LedgerError::Unavailable("pool".into()).is_retryable());

        assert!(!LedgerError::AccountNotFound("a".into()).is_retryable());
        assert!(!LedgerError::InsufficientBalance {
            account: "a".into(),
            required: 10,
            available: 5
        }
        .is_retryable());
        assert!(!LedgerError::Duplicate("tx".into()).is_retryable());
    }

    #[test]
    fn test_pool_timeout_is_unavailable() {
        let err: LedgerError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, LedgerError::Unavailable(_)));
    }
}
