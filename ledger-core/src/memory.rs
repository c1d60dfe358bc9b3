//! In-memory ledger store.
//!
//! Mirrors the PostgreSQL semantics the engine relies on: per-row exclusive
//! locks held until commit or drop, version-conditioned updates, unique
//! transaction ids and `(source, counter)` pairs, and all-or-nothing commit.
//! Used by tests and local runs without a database.

use crate::store::{LedgerStore, UnitOfWork};
use crate::types::{
    Account, LedgerEntry, PaymentState, TransactionRecord, TransactionStatus, VersionedUpdate,
};
use crate::{LedgerError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};

#[derive(Debug, Default)]
struct State {
    accounts: HashMap<String, Account>,
    entries: Vec<LedgerEntry>,
    transactions: HashMap<String, TransactionRecord>,
    /// Insertion order of transaction ids
    transaction_log: Vec<String>,
    counters: HashMap<String, BTreeSet<i64>>,
    payment_states: Vec<PaymentState>,
    auth_keys: HashMap<String, Vec<u8>>,
}

impl State {
    fn check_unique(&self, record: &TransactionRecord) -> Result<()> {
        if self.transactions.contains_key(&record.id) {
            return Err(LedgerError::Duplicate(format!("transaction {}", record.id)));
        }
        if let Some(counter) = record.counter {
            if self.counter_used(&record.source_account, counter) {
                return Err(LedgerError::Duplicate(format!("counter {} for source account", counter)));
            }
        }
        Ok(())
    }

    fn counter_used(&self, source: &str, counter: i64) -> bool {
        self.counters
            .get(source)
            .map_or(false, |set| set.contains(&counter))
    }

    fn max_counter(&self, source: &str) -> Option<i64> {
        self.counters.get(source).and_then(|set| set.iter().next_back().copied())
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    row_locks: Mutex<HashMap<String, Arc<RowLock<()>>>>,
}

/// Row locks held by one unit of work
struct RowGuards {
    inner: Arc<Inner>,
    held: HashMap<String, OwnedMutexGuard<()>>,
}

impl Drop for RowGuards {
    fn drop(&mut self) {
        if self.held.is_empty() {
            return;
        }
        let ids: Vec<String> = self.held.drain().map(|(id, _guard)| id).collect();

        // Forget locks nobody else holds or waits on
        let mut locks = self.inner.row_locks.lock();
        for id in ids {
            if locks.get(&id).map_or(false, |lock| Arc::strong_count(lock) == 1) {
                locks.remove(&id);
            }
        }
    }
}

impl Inner {
    fn row_lock(&self, id: &str) -> Arc<RowLock<()>> {
        self.row_locks
            .lock()
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(RowLock::new(())))
            .clone()
    }
}

/// In-memory [`LedgerStore`]
#[derive(Debug, Clone, Default)]
pub struct MemoryLedgerStore {
    inner: Arc<Inner>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum of every account balance
    pub fn total_balance(&self) -> i64 {
        self.inner.state.lock().accounts.values().map(|a| a.balance).sum()
    }

    /// Every committed ledger entry
    pub fn all_entries(&self) -> Vec<LedgerEntry> {
        self.inner.state.lock().entries.clone()
    }

    /// Row locks currently tracked (held or awaited)
    pub fn row_lock_count(&self) -> usize {
        self.inner.row_locks.lock().len()
    }

    /// Overwrite an account's status
    pub fn set_status(&self, id: &str, status: crate::types::AccountStatus) -> bool {
        match self.inner.state.lock().accounts.get_mut(id) {
            Some(account) => {
                account.status = status;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        Ok(Box::new(MemoryUnitOfWork {
            inner: self.inner.clone(),
            guards: RowGuards {
                inner: self.inner.clone(),
                held: HashMap::new(),
            },
            read_versions: HashMap::new(),
            staged_accounts: HashMap::new(),
            entries: Vec::new(),
            transactions: Vec::new(),
            status_updates: Vec::new(),
            payment_states: Vec::new(),
        }))
    }

    async fn create_account(&self, account: &Account) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.accounts.contains_key(&account.id) {
            return Err(LedgerError::Duplicate(format!("account {}", account.id)));
        }
        state.accounts.insert(account.id.clone(), account.clone());
        Ok(())
    }

    async fn get_account(&self, id: &str) -> Result<Option<Account>> {
        Ok(self.inner.state.lock().accounts.get(id).cloned())
    }

    async fn entries_for_transaction(&self, transaction_id: &str) -> Result<Vec<LedgerEntry>> {
        Ok(self
            .inner
            .state
            .lock()
            .entries
            .iter()
            .filter(|e| e.transaction_id == transaction_id)
            .cloned()
            .collect())
    }

    async fn entries_for_account(&self, account_id: &str, limit: usize) -> Result<Vec<LedgerEntry>> {
        Ok(self
            .inner
            .state
            .lock()
            .entries
            .iter()
            .rev()
            .filter(|e| e.account_id == account_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_transaction(&self, id: &str) -> Result<Option<TransactionRecord>> {
        Ok(self.inner.state.lock().transactions.get(id).cloned())
    }

    async fn recent_transactions(&self, account_id: &str, limit: usize) -> Result<Vec<TransactionRecord>> {
        let state = self.inner.state.lock();
        Ok(state
            .transaction_log
            .iter()
            .rev()
            .filter_map(|id| state.transactions.get(id))
            .filter(|t| t.source_account == account_id || t.destination_account == account_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn counter_used(&self, source_account: &str, counter: i64) -> Result<bool> {
        Ok(self.inner.state.lock().counter_used(source_account, counter))
    }

    async fn max_counter(&self, source_account: &str) -> Result<Option<i64>> {
        Ok(self.inner.state.lock().max_counter(source_account))
    }

    async fn payment_states(&self, transaction_id: &str) -> Result<Vec<PaymentState>> {
        Ok(self
            .inner
            .state
            .lock()
            .payment_states
            .iter()
            .filter(|s| s.transaction_id == transaction_id)
            .cloned()
            .collect())
    }

    async fn auth_key(&self, account_id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.state.lock().auth_keys.get(account_id).cloned())
    }

    async fn store_auth_key(&self, account_id: &str, sealed_key: &[u8]) -> Result<()> {
        self.inner
            .state
            .lock()
            .auth_keys
            .insert(account_id.to_string(), sealed_key.to_vec());
        Ok(())
    }
}

struct StatusUpdate {
    id: String,
    status: TransactionStatus,
    failure_reason: Option<String>,
    settled_at: Option<DateTime<Utc>>,
}

/// Staged writes plus the row locks taken so far
struct MemoryUnitOfWork {
    inner: Arc<Inner>,
    guards: RowGuards,
    /// Version each updated account had when this unit read it
    read_versions: HashMap<String, i64>,
    staged_accounts: HashMap<String, Account>,
    entries: Vec<LedgerEntry>,
    transactions: Vec<TransactionRecord>,
    status_updates: Vec<StatusUpdate>,
    payment_states: Vec<PaymentState>,
}

impl MemoryUnitOfWork {
    fn current_account(&self, id: &str) -> Option<Account> {
        self.staged_accounts
            .get(id)
            .cloned()
            .or_else(|| self.inner.state.lock().accounts.get(id).cloned())
    }

    fn staged_counter_used(&self, source: &str, counter: i64) -> bool {
        self.transactions
            .iter()
            .any(|t| t.source_account == source && t.counter == Some(counter))
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn lock_account(&mut self, id: &str) -> Result<Option<Account>> {
        if !self.guards.held.contains_key(id) {
            let lock = self.inner.row_lock(id);
            let guard = lock.lock_owned().await;
            self.guards.held.insert(id.to_string(), guard);
        }
        Ok(self.current_account(id))
    }

    async fn insert_entry(&mut self, entry: &LedgerEntry) -> Result<()> {
        self.entries.push(entry.clone());
        Ok(())
    }

    async fn update_balance(&mut self, id: &str, new_balance: i64, expected_version: i64) -> Result<VersionedUpdate> {
        let Some(mut account) = self.current_account(id) else {
            return Ok(VersionedUpdate::NotFound);
        };
        if account.version != expected_version {
            return Ok(VersionedUpdate::Conflict);
        }

        self.read_versions.entry(id.to_string()).or_insert(expected_version);
        account.balance = new_balance;
        account.version += 1;
        account.updated_at = Utc::now();
        let new_version = account.version;
        self.staged_accounts.insert(id.to_string(), account);
        Ok(VersionedUpdate::Applied { new_version })
    }

    async fn insert_transaction(&mut self, record: &TransactionRecord) -> Result<()> {
        if self.transactions.iter().any(|t| t.id == record.id)
            || record
                .counter
                .map_or(false, |c| self.staged_counter_used(&record.source_account, c))
        {
            return Err(LedgerError::Duplicate(format!("transaction {}", record.id)));
        }
        self.inner.state.lock().check_unique(record)?;
        self.transactions.push(record.clone());
        Ok(())
    }

    async fn update_transaction_status(
        &mut self,
        id: &str,
        status: TransactionStatus,
        failure_reason: Option<&str>,
        settled_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        if let Some(staged) = self.transactions.iter_mut().find(|t| t.id == id) {
            staged.status = status;
            staged.failure_reason = failure_reason.map(str::to_string);
            staged.settled_at = settled_at.or(staged.settled_at);
            return Ok(());
        }
        if !self.inner.state.lock().transactions.contains_key(id) {
            return Err(LedgerError::Database(format!("transaction {} not found", id)));
        }
        self.status_updates.push(StatusUpdate {
            id: id.to_string(),
            status,
            failure_reason: failure_reason.map(str::to_string),
            settled_at,
        });
        Ok(())
    }

    async fn get_transaction(&mut self, id: &str) -> Result<Option<TransactionRecord>> {
        if let Some(staged) = self.transactions.iter().find(|t| t.id == id) {
            return Ok(Some(staged.clone()));
        }
        Ok(self.inner.state.lock().transactions.get(id).cloned())
    }

    async fn counter_used(&mut self, source_account: &str, counter: i64) -> Result<bool> {
        Ok(self.staged_counter_used(source_account, counter)
            || self.inner.state.lock().counter_used(source_account, counter))
    }

    async fn max_counter(&mut self, source_account: &str) -> Result<Option<i64>> {
        let staged = self
            .transactions
            .iter()
            .filter(|t| t.source_account == source_account)
            .filter_map(|t| t.counter)
            .max();
        let committed = self.inner.state.lock().max_counter(source_account);
        Ok(staged.max(committed))
    }

    async fn append_payment_state(&mut self, state: &PaymentState) -> Result<()> {
        self.payment_states.push(state.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let this = *self;
        let mut state = this.inner.state.lock();

        // Conditioned updates are re-checked against committed state: an
        // unlocked writer that committed first wins.
        for (id, read_version) in &this.read_versions {
            let current = state.accounts.get(id).map(|a| a.version);
            if current != Some(*read_version) {
                return Err(LedgerError::OptimisticLockConflict(id.clone()));
            }
        }
        for record in &this.transactions {
            state.check_unique(record)?;
        }

        for (id, account) in this.staged_accounts {
            state.accounts.insert(id, account);
        }
        state.entries.extend(this.entries);
        for record in this.transactions {
            if let Some(counter) = record.counter {
                state
                    .counters
                    .entry(record.source_account.clone())
                    .or_default()
                    .insert(counter);
            }
            state.transaction_log.push(record.id.clone());
            state.transactions.insert(record.id.clone(), record);
        }
        for update in this.status_updates {
            if let Some(record) = state.transactions.get_mut(&update.id) {
                record.status = update.status;
                record.failure_reason = update.failure_reason;
                if update.settled_at.is_some() {
                    record.settled_at = update.settled_at;
                }
            }
        }
        state.payment_states.extend(this.payment_states);

        // row locks are released when `this.guards` drops
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
