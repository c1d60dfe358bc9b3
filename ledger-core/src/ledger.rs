//! Double-entry ledger engine
//!
//! Every posting runs inside one [`UnitOfWork`]: accounts are locked in
//! ascending id order, balances are checked, one entry per leg is inserted
//! and each balance update is conditioned on the version read under the lock.
//! Any failure rolls the whole unit back.
//!
//! # Example
//!
//! ```no_run
//! use ledger_core::{LedgerConfig, LedgerEngine, MemoryLedgerStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> ledger_core::Result<()> {
//!     let engine = LedgerEngine::new(Arc::new(MemoryLedgerStore::new()), &LedgerConfig::default());
//!     let receipt = engine.transfer("1234567890", "0987654321", "tx-1", 3_000).await?;
//!     assert_eq!(receipt.entries.len(), 2);
//!     Ok(())
//! }
//! ```

use crate::config::LedgerConfig;
use crate::store::{LedgerStore, UnitOfWork};
use crate::types::{Account, BalanceChange, EntryType, LedgerEntry, Leg, PostingReceipt, VersionedUpdate};
use crate::{LedgerError, Result};
use chrono::Utc;
use security::mask_account;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Atomic posting of balanced ledger entries
#[derive(Clone)]
pub struct LedgerEngine {
    store: Arc<dyn LedgerStore>,
    deadline: Duration,
}

impl std::fmt::Debug for LedgerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerEngine")
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl LedgerEngine {
    pub fn new(store: Arc<dyn LedgerStore>, config: &LedgerConfig) -> Self {
        Self::with_deadline(store, config.transfer_deadline())
    }

    pub fn with_deadline(store: Arc<dyn LedgerStore>, deadline: Duration) -> Self {
        Self { store, deadline }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Move `amount` from `from` to `to` as one committed unit of work
    pub async fn transfer(&self, from: &str, to: &str, transaction_id: &str, amount: i64) -> Result<PostingReceipt> {
        let legs = transfer_legs(from, to, amount)?;
        self.post(transaction_id, &legs).await
    }

    /// Post balanced legs as one committed unit of work
    pub async fn post(&self, transaction_id: &str, legs: &[Leg]) -> Result<PostingReceipt> {
        self.within_deadline(async {
            let mut uow = self.store.begin().await?;
            match Self::post_in(uow.as_mut(), transaction_id, legs).await {
                Ok(receipt) => {
                    uow.commit().await?;
                    info!(transaction_id, legs = legs.len(), "Posting committed");
                    Ok(receipt)
                }
                Err(e) => {
                    if let Err(rollback_err) = uow.rollback().await {
                        warn!(transaction_id, error = %rollback_err, "Rollback failed");
                    }
                    Err(e)
                }
            }
        })
        .await
    }

    /// Run `fut` under the request deadline
    ///
    /// On expiry the future is dropped, which drops any open unit of work and
    /// with it every uncommitted write and row lock.
    pub async fn within_deadline<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.deadline, fut).await {
            Ok(result) => result,
            Err(_) => {
                let ms = self.deadline.as_millis() as u64;
                warn!(deadline_ms = ms, "Ledger unit of work exceeded deadline");
                Err(LedgerError::Timeout(ms))
            }
        }
    }

    /// Two-leg transfer inside a caller-owned unit of work
    pub async fn transfer_in(
        uow: &mut dyn UnitOfWork,
        from: &str,
        to: &str,
        transaction_id: &str,
        amount: i64,
    ) -> Result<PostingReceipt> {
        let legs = transfer_legs(from, to, amount)?;
        Self::post_in(uow, transaction_id, &legs).await
    }

    /// Post legs inside a caller-owned unit of work
    ///
    /// Nothing is committed here; the caller commits or rolls back.
    pub async fn post_in(uow: &mut dyn UnitOfWork, transaction_id: &str, legs: &[Leg]) -> Result<PostingReceipt> {
        validate_legs(legs)?;

        // Lock in ascending id order regardless of debit/credit direction
        let mut locked: BTreeMap<&str, Account> = BTreeMap::new();
        let mut order: Vec<&str> = legs.iter().map(|l| l.account_id.as_str()).collect();
        order.sort_unstable();

        for id in order {
            let account = uow
                .lock_account(id)
                .await?
                .ok_or_else(|| LedgerError::AccountNotFound(id.to_string()))?;
            if !account.is_active() {
                return Err(LedgerError::AccountNotActive(id.to_string()));
            }
            debug!(account = %mask_account(id), version = account.version, "Account locked");
            locked.insert(id, account);
        }

        // Every balance is checked before anything is written
        let mut new_balances: BTreeMap<&str, i64> = BTreeMap::new();
        for leg in legs {
            let account = &locked[leg.account_id.as_str()];
            let new_balance = account
                .balance
                .checked_add(leg.amount)
                .ok_or_else(|| {
                    LedgerError::InvalidPosting(format!("balance overflow on {}", mask_account(&account.id)))
                })?;
            if new_balance < 0 {
                return Err(LedgerError::InsufficientBalance {
                    account: account.id.clone(),
                    required: -leg.amount,
                    available: account.balance,
                });
            }
            new_balances.insert(leg.account_id.as_str(), new_balance);
        }

        let now = Utc::now();
        let mut entries = Vec::with_capacity(legs.len());
        for leg in legs {
            let entry = LedgerEntry {
                transaction_id: transaction_id.to_string(),
                account_id: leg.account_id.clone(),
                amount: leg.amount,
                entry_type: EntryType::for_amount(leg.amount),
                balance_after: new_balances[leg.account_id.as_str()],
                created_at: now,
            };
            uow.insert_entry(&entry).await?;
            entries.push(entry);
        }

        let mut balances = Vec::with_capacity(locked.len());
        for (id, account) in &locked {
            let balance = new_balances[id];
            match uow.update_balance(id, balance, account.version).await? {
                VersionedUpdate::Applied { new_version } => balances.push(BalanceChange {
                    account_id: id.to_string(),
                    balance,
                    version: new_version,
                }),
                VersionedUpdate::Conflict => {
                    warn!(transaction_id, account = %mask_account(id), "Version moved under row lock");
                    return Err(LedgerError::OptimisticLockConflict(id.to_string()));
                }
                VersionedUpdate::NotFound => return Err(LedgerError::AccountNotFound(id.to_string())),
            }
        }

        debug!(transaction_id, legs = legs.len(), "Posting staged");
        Ok(PostingReceipt {
            transaction_id: transaction_id.to_string(),
            entries,
            balances,
        })
    }
}

/// Debit `from` and credit `to` by `amount`
pub fn transfer_legs(from: &str, to: &str, amount: i64) -> Result<Vec<Leg>> {
    if amount <= 0 {
        return Err(LedgerError::InvalidPosting(format!("amount must be positive, got {}", amount)));
    }
    if from == to {
        return Err(LedgerError::InvalidPosting("source and destination are the same account".to_string()));
    }
    Ok(vec![Leg::debit(from, amount), Leg::credit(to, amount)])
}

fn validate_legs(legs: &[Leg]) -> Result<()> {
    if legs.len() < 2 {
        return Err(LedgerError::InvalidPosting("a posting needs at least two legs".to_string()));
    }

    let mut seen = HashSet::with_capacity(legs.len());
    let mut sum: i64 = 0;
    for leg in legs {
        if leg.amount == 0 {
            return Err(LedgerError::InvalidPosting(format!(
                "zero amount on {}",
                mask_account(&leg.account_id)
            )));
        }
        if !seen.insert(leg.account_id.as_str()) {
            return Err(LedgerError::InvalidPosting(format!(
                "account {} appears twice",
                mask_account(&leg.account_id)
            )));
        }
        sum = sum
            .checked_add(leg.amount)
            .ok_or_else(|| LedgerError::InvalidPosting("leg amounts overflow".to_string()))?;
    }

    if sum != 0 {
        return Err(LedgerError::InvalidPosting(format!("legs sum to {}, not zero", sum)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryLedgerStore;
    use crate::types::AccountStatus;

    async fn engine_with(accounts: &[(&str, i64)]) -> (LedgerEngine, MemoryLedgerStore) {
        let store = MemoryLedgerStore::new();
        for (id, balance) in accounts {
            store
                .create_account(&Account::new(*id, format!("owner-{}", id), *id, *balance))
                .await
                .unwrap();
        }
        let engine = LedgerEngine::new(Arc::new(store.clone()), &LedgerConfig::default());
        (engine, store)
    }

    #[tokio::test]
    async fn test_transfer_moves_money() {
        let (engine, store) = engine_with(&[("x", 5_000), ("y", 0)]).await;

        let receipt = engine.transfer("x", "y", "tx-1", 3_000).await.unwrap();
        assert_eq!(receipt.balance_of("x"), Some(2_000));
        assert_eq!(receipt.balance_of("y"), Some(3_000));
        assert_eq!(receipt.entries.iter().map(|e| e.amount).sum::<i64>(), 0);

        let x = store.get_account("x").await.unwrap().unwrap();
        assert_eq!(x.balance, 2_000);
        assert_eq!(x.version, 1);
        assert_eq!(store.entries_for_transaction("tx-1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_insufficient_balance_writes_nothing() {
        let (engine, store) = engine_with(&[("x", 5_000), ("y", 0)]).await;

        let err = engine.transfer("x", "y", "tx-1", 6_000).await.unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientBalance {
                account: "x".into(),
                required: 6_000,
                available: 5_000
            }
        );
        assert!(!err.is_retryable());
        assert!(store.all_entries().is_empty());
        assert_eq!(store.get_account("x").await.unwrap().unwrap().balance, 5_000);
        assert_eq!(store.get_account("x").await.unwrap().unwrap().version, 0);
    }

    #[tokio::test]
    async fn test_missing_and_inactive_accounts() {
        let (engine, store) = engine_with(&[("x", 5_000), ("y", 0)]).await;

        let err = engine.transfer("x", "nope", "tx-1", 10).await.unwrap_err();
        assert_eq!(err, LedgerError::AccountNotFound("nope".into()));

        store.set_status("y", AccountStatus::Suspended);
        let err = engine.transfer("x", "y", "tx-2", 10).await.unwrap_err();
        assert_eq!(err, LedgerError::AccountNotActive("y".into()));

        assert_eq!(store.get_account("x").await.unwrap().unwrap().balance, 5_000);
    }

    #[tokio::test]
    async fn test_invalid_postings_rejected() {
        let (engine, _) = engine_with(&[("x", 100), ("y", 0), ("z", 0)]).await;

        assert!(matches!(
            engine.transfer("x", "x", "t", 10).await,
            Err(LedgerError::InvalidPosting(_))
        ));
        assert!(matches!(
            engine.transfer("x", "y", "t", 0).await,
            Err(LedgerError::InvalidPosting(_))
        ));
        assert!(matches!(
            engine.post("t", &[Leg::debit("x", 10), Leg::credit("y", 9)]).await,
            Err(LedgerError::InvalidPosting(_))
        ));
        assert!(matches!(
            engine.post("t", &[Leg::debit("x", 10)]).await,
            Err(LedgerError::InvalidPosting(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_posting_messages_mask_accounts() {
        let (engine, _) = engine_with(&[("1234567890", 100), ("5555554321", i64::MAX)]).await;

        let errors = [
            validate_legs(&[Leg::debit("1234567890", 10), Leg::credit("1234567890", 10)]).unwrap_err(),
            validate_legs(&[Leg::debit("1234567890", 0), Leg::credit("5555554321", 0)]).unwrap_err(),
            engine
                .post("t", &[Leg::debit("1234567890", 10), Leg::credit("5555554321", 10)])
                .await
                .unwrap_err(),
        ];
        for err in errors {
            let message = err.to_string();
            assert!(matches!(err, LedgerError::InvalidPosting(_)), "{message}");
            assert!(!message.contains("1234567890") && !message.contains("5555554321"), "{message}");
            assert!(message.contains("******"), "{message}");
        }
    }

    #[tokio::test]
    async fn test_three_leg_posting() {
        let (engine, store) = engine_with(&[("src", 10_000), ("fees", 0), ("clearing", 0)]).await;

        let legs = [
            Leg::debit("src", 1_050),
            Leg::credit("fees", 50),
            Leg::credit("clearing", 1_000),
        ];
        let receipt = engine.post("ext-1", &legs).await.unwrap();

        assert_eq!(receipt.entries.len(), 3);
        assert_eq!(receipt.balance_of("src"), Some(8_950));
        assert_eq!(store.total_balance(), 10_000);
    }

    #[tokio::test]
    async fn test_caller_unit_of_work_rolls_back() {
        let (_, store) = engine_with(&[("x", 500), ("y", 0)]).await;

        let mut uow = store.begin().await.unwrap();
        LedgerEngine::transfer_in(uow.as_mut(), "x", "y", "tx-1", 200).await.unwrap();
        uow.rollback().await.unwrap();

        assert_eq!(store.get_account("x").await.unwrap().unwrap().balance, 500);
        assert!(store.all_entries().is_empty());
    }

    #[tokio::test]
    async fn test_deadline_releases_locks() {
        let (_, store) = engine_with(&[("x", 500), ("y", 0)]).await;
        let engine = LedgerEngine::with_deadline(Arc::new(store.clone()), Duration::from_millis(50));

        let mut holder = store.begin().await.unwrap();
        holder.lock_account("x").await.unwrap();

        let err = engine.transfer("x", "y", "tx-1", 100).await.unwrap_err();
        assert_eq!(err, LedgerError::Timeout(50));
        assert!(err.is_retryable());

        drop(holder);
        engine.transfer("x", "y", "tx-2", 100).await.unwrap();
        assert_eq!(store.get_account("x").await.unwrap().unwrap().balance, 400);
    }
}
