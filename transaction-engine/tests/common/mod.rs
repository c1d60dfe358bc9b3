//! Shared harness: in-memory store, cache, HSM, audit sink and gateway

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hsm::MemoryHsm;
use ledger_core::{
    Account, LedgerEntry, LedgerError, LedgerStore, MemoryLedgerStore, PaymentState, TransactionRecord,
    TransactionStatus, TransactionType, UnitOfWork, VersionedUpdate,
};
use security::{AuditLog, MemoryAuditSink};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use transaction_engine::{
    sign_request, Collaborators, EngineConfig, HookDispatcher, HookWorker, MemoryCache, MemorySettlementGateway,
    Metrics, NotificationHook, PostCommitHook, SealedAuthKeys, SettlementQueueHook, TransactionOrchestrator,
    TransactionRequest,
};

pub const FEE_ACCOUNT: &str = "0000000001";
pub const CLEARING_ACCOUNT: &str = "0000000002";

pub struct Harness {
    pub engine: TransactionOrchestrator,
    pub store: Arc<MemoryLedgerStore>,
    /// The store the engine sees; shares state with `store`
    pub faults: Arc<FaultyStore>,
    pub cache: Arc<MemoryCache>,
    pub hsm: Arc<MemoryHsm>,
    pub audit: Arc<MemoryAuditSink>,
    pub gateway: Arc<MemorySettlementGateway>,
    pub auth_keys: SealedAuthKeys,
    pub metrics: Arc<Metrics>,
    pub worker: HookWorker,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(EngineConfig::default()).await
    }

    pub async fn with_config(config: EngineConfig) -> Self {
        let store = Arc::new(MemoryLedgerStore::new());
        let faults = Arc::new(FaultyStore::new(store.clone()));
        let cache = Arc::new(MemoryCache::new());
        let hsm = Arc::new(MemoryHsm::new());
        let audit_sink = Arc::new(MemoryAuditSink::new());
        let audit = AuditLog::new(audit_sink.clone());
        let gateway = Arc::new(MemorySettlementGateway::new().unwrap());
        let metrics = Arc::new(Metrics::new().unwrap());
        let auth_keys = SealedAuthKeys::new(store.clone(), hsm.clone());

        let hooks: Vec<Arc<dyn PostCommitHook>> = vec![
            Arc::new(SettlementQueueHook::new(cache.clone(), audit.clone())),
            Arc::new(NotificationHook),
        ];
        let (dispatcher, worker) = HookDispatcher::new(hooks, config.limits.hook_queue_capacity, metrics.clone());

        let engine = TransactionOrchestrator::new(
            &config,
            Collaborators {
                store: faults.clone(),
                cache: cache.clone(),
                keys: hsm.clone(),
                auth_keys: Arc::new(auth_keys.clone()),
                gateway: gateway.clone(),
                hooks: dispatcher,
                audit,
                metrics: metrics.clone(),
            },
        )
        .unwrap();

        let harness = Self {
            engine,
            store,
            faults,
            cache,
            hsm,
            audit: audit_sink,
            gateway,
            auth_keys,
            metrics,
            worker,
        };
        harness.open(FEE_ACCOUNT, "bank", "Fee Income", 0).await;
        harness.open(CLEARING_ACCOUNT, "bank", "Interbank Clearing", 0).await;
        harness
    }

    /// Create an active account and provision its authentication key
    pub async fn open(&self, id: &str, owner: &str, name: &str, balance: i64) {
        self.store
            .create_account(&Account::new(id, owner, name, balance))
            .await
            .unwrap();
        self.auth_keys.provision(id, &auth_key(id)).await.unwrap();
    }

    pub async fn balance(&self, id: &str) -> i64 {
        self.store.get_account(id).await.unwrap().unwrap().balance
    }

    pub async fn entries(&self, transaction_id: &str) -> Vec<ledger_core::LedgerEntry> {
        self.store.entries_for_transaction(transaction_id).await.unwrap()
    }
}

/// Delegates to a [`MemoryLedgerStore`] and injects failures on demand
pub struct FaultyStore {
    inner: Arc<MemoryLedgerStore>,
    fail_reversals: AtomicBool,
    lookup_budget: AtomicUsize,
}

impl FaultyStore {
    pub fn new(inner: Arc<MemoryLedgerStore>) -> Self {
        Self {
            inner,
            fail_reversals: AtomicBool::new(false),
            lookup_budget: AtomicUsize::new(usize::MAX),
        }
    }

    /// Reject ledger entries posted under a `:reversal` id
    pub fn fail_reversals(&self, fail: bool) {
        self.fail_reversals.store(fail, Ordering::SeqCst);
    }

    /// Let `n` more transaction lookups succeed, then fail every one after
    pub fn fail_lookups_after(&self, n: usize) {
        self.lookup_budget.store(n, Ordering::SeqCst);
    }

    fn take_lookup(&self) -> bool {
        self.lookup_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n == usize::MAX {
                    Some(n)
                } else {
                    n.checked_sub(1)
                }
            })
            .is_ok()
    }
}

fn injected() -> LedgerError {
    LedgerError::Unavailable("injected fault".to_string())
}

#[async_trait]
impl LedgerStore for FaultyStore {
    async fn begin(&self) -> ledger_core::Result<Box<dyn UnitOfWork>> {
        Ok(Box::new(FaultyUnitOfWork {
            inner: self.inner.begin().await?,
            fail_reversals: self.fail_reversals.load(Ordering::SeqCst),
        }))
    }

    async fn create_account(&self, account: &Account) -> ledger_core::Result<()> {
        self.inner.create_account(account).await
    }

    async fn get_account(&self, id: &str) -> ledger_core::Result<Option<Account>> {
        self.inner.get_account(id).await
    }

    async fn entries_for_transaction(&self, transaction_id: &str) -> ledger_core::Result<Vec<LedgerEntry>> {
        self.inner.entries_for_transaction(transaction_id).await
    }

    async fn entries_for_account(&self, account_id: &str, limit: usize) -> ledger_core::Result<Vec<LedgerEntry>> {
        self.inner.entries_for_account(account_id, limit).await
    }

    async fn get_transaction(&self, id: &str) -> ledger_core::Result<Option<TransactionRecord>> {
        if !self.take_lookup() {
            return Err(injected());
        }
        self.inner.get_transaction(id).await
    }

    async fn recent_transactions(&self, account_id: &str, limit: usize) -> ledger_core::Result<Vec<TransactionRecord>> {
        self.inner.recent_transactions(account_id, limit).await
    }

    async fn counter_used(&self, source_account: &str, counter: i64) -> ledger_core::Result<bool> {
        self.inner.counter_used(source_account, counter).await
    }

    async fn max_counter(&self, source_account: &str) -> ledger_core::Result<Option<i64>> {
        self.inner.max_counter(source_account).await
    }

    async fn payment_states(&self, transaction_id: &str) -> ledger_core::Result<Vec<PaymentState>> {
        self.inner.payment_states(transaction_id).await
    }

    async fn auth_key(&self, account_id: &str) -> ledger_core::Result<Option<Vec<u8>>> {
        self.inner.auth_key(account_id).await
    }

    async fn store_auth_key(&self, account_id: &str, sealed_key: &[u8]) -> ledger_core::Result<()> {
        self.inner.store_auth_key(account_id, sealed_key).await
    }
}

struct FaultyUnitOfWork {
    inner: Box<dyn UnitOfWork>,
    fail_reversals: bool,
}

#[async_trait]
impl UnitOfWork for FaultyUnitOfWork {
    async fn lock_account(&mut self, id: &str) -> ledger_core::Result<Option<Account>> {
        self.inner.lock_account(id).await
    }

    async fn insert_entry(&mut self, entry: &LedgerEntry) -> ledger_core::Result<()> {
        if self.fail_reversals && entry.transaction_id.ends_with(":reversal") {
            return Err(injected());
        }
        self.inner.insert_entry(entry).await
    }

    async fn update_balance(
        &mut self,
        id: &str,
        new_balance: i64,
        expected_version: i64,
    ) -> ledger_core::Result<VersionedUpdate> {
        self.inner.update_balance(id, new_balance, expected_version).await
    }

    async fn insert_transaction(&mut self, record: &TransactionRecord) -> ledger_core::Result<()> {
        self.inner.insert_transaction(record).await
    }

    async fn update_transaction_status(
        &mut self,
        id: &str,
        status: TransactionStatus,
        failure_reason: Option<&str>,
        settled_at: Option<DateTime<Utc>>,
    ) -> ledger_core::Result<()> {
        self.inner
            .update_transaction_status(id, status, failure_reason, settled_at)
            .await
    }

    async fn get_transaction(&mut self, id: &str) -> ledger_core::Result<Option<TransactionRecord>> {
        self.inner.get_transaction(id).await
    }

    async fn counter_used(&mut self, source_account: &str, counter: i64) -> ledger_core::Result<bool> {
        self.inner.counter_used(source_account, counter).await
    }

    async fn max_counter(&mut self, source_account: &str) -> ledger_core::Result<Option<i64>> {
        self.inner.max_counter(source_account).await
    }

    async fn append_payment_state(&mut self, state: &PaymentState) -> ledger_core::Result<()> {
        self.inner.append_payment_state(state).await
    }

    async fn commit(self: Box<Self>) -> ledger_core::Result<()> {
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> ledger_core::Result<()> {
        self.inner.rollback().await
    }
}

/// Deterministic per-account key
pub fn auth_key(account: &str) -> Vec<u8> {
    let mut key = account.as_bytes().to_vec();
    key.resize(32, 0x5a);
    key
}

/// Request signed with the source account's key
pub fn signed(id: &str, from: &str, to: &str, amount: i64, counter: u32) -> TransactionRequest {
    signed_at(id, from, to, amount, counter, Utc::now().timestamp())
}

pub fn signed_at(id: &str, from: &str, to: &str, amount: i64, counter: u32, timestamp: i64) -> TransactionRequest {
    let mut request = TransactionRequest {
        version: 1,
        id: id.to_string(),
        timestamp,
        source_account: from.to_string(),
        destination_account: to.to_string(),
        amount,
        currency: "NGN".to_string(),
        counter,
        transaction_type: TransactionType::Debit,
        signature: String::new(),
        narration: None,
    };
    resign(&mut request);
    request
}

pub fn resign(request: &mut TransactionRequest) {
    request.signature = sign_request(&auth_key(&request.source_account), request).unwrap();
}
