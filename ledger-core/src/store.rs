//! Persistence boundary.
//!
//! A [`UnitOfWork`] is one atomic database transaction. Everything written
//! through it becomes visible together on [`UnitOfWork::commit`]; dropping it
//! without committing discards every write and releases every row lock.

use crate::types::{Account, LedgerEntry, PaymentState, TransactionRecord, TransactionStatus, VersionedUpdate};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Durable ledger store
#[async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    /// Start an atomic unit of work
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>>;

    /// Insert a new account (provisioning)
    async fn create_account(&self, account: &Account) -> Result<()>;

    async fn get_account(&self, id: &str) -> Result<Option<Account>>;

    async fn entries_for_transaction(&self, transaction_id: &str) -> Result<Vec<LedgerEntry>>;

    /// Most recent entries first
    async fn entries_for_account(&self, account_id: &str, limit: usize) -> Result<Vec<LedgerEntry>>;

    async fn get_transaction(&self, id: &str) -> Result<Option<TransactionRecord>>;

    /// Transactions where the account is source or destination, newest first
    async fn recent_transactions(&self, account_id: &str, limit: usize) -> Result<Vec<TransactionRecord>>;

    /// Whether `(source, counter)` has been recorded
    async fn counter_used(&self, source_account: &str, counter: i64) -> Result<bool>;

    /// Highest counter recorded for `source`
    async fn max_counter(&self, source_account: &str) -> Result<Option<i64>>;

    async fn payment_states(&self, transaction_id: &str) -> Result<Vec<PaymentState>>;

    /// Sealed per-account authentication key
    async fn auth_key(&self, account_id: &str) -> Result<Option<Vec<u8>>>;

    /// Store (or replace) a sealed per-account authentication key
    async fn store_auth_key(&self, account_id: &str, sealed_key: &[u8]) -> Result<()>;
}

/// One atomic transaction against the store
#[async_trait]
pub trait UnitOfWork: Send {
    /// Take an exclusive row lock and read the account (`SELECT ... FOR UPDATE`)
    async fn lock_account(&mut self, id: &str) -> Result<Option<Account>>;

    async fn insert_entry(&mut self, entry: &LedgerEntry) -> Result<()>;

    /// Set balance and bump version, only if the version still equals `expected_version`
    async fn update_balance(&mut self, id: &str, new_balance: i64, expected_version: i64) -> Result<VersionedUpdate>;

    /// Insert a transaction record; a taken id or `(source, counter)` is
    /// `LedgerError::Duplicate`
    async fn insert_transaction(&mut self, record: &TransactionRecord) -> Result<()>;

    async fn update_transaction_status(
        &mut self,
        id: &str,
        status: TransactionStatus,
        failure_reason: Option<&str>,
        settled_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    async fn get_transaction(&mut self, id: &str) -> Result<Option<TransactionRecord>>;

    async fn counter_used(&mut self, source_account: &str, counter: i64) -> Result<bool>;

    async fn max_counter(&mut self, source_account: &str) -> Result<Option<i64>>;

    async fn append_payment_state(&mut self, state: &PaymentState) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}
