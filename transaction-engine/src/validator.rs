//! Transaction validation
//!
//! Validation runs as a fixed sequence of checks. The structural and
//! freshness checks are pure functions of the request; the rest read account
//! state, the caller's authentication key and counter history. Nothing here
//! writes: the outcome cache is populated by the orchestrator once a
//! definitive result exists.
//!
//! Order:
//!
//! 1. structure
//! 2. freshness (live or batch policy)
//! 3. source account exists and is active
//! 4. HMAC signature
//! 5. counter unused and strictly above the account's maximum
//! 6. balance pre-check for `DEBIT` requests

use crate::auth_keys::AuthKeyProvider;
use crate::cache::TransactionCache;
use crate::error::{Result, TransactionError};
use crate::signature::verify_request;
use crate::types::{TransactionRequest, CANONICAL_VERSION};
use ledger_core::{Account, LedgerStore, TransactionType};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Accepted timestamp window relative to server time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FreshnessPolicy {
    /// Seconds a timestamp may run ahead of the server clock
    pub future_tolerance_secs: i64,
    /// Seconds a timestamp may lag behind the server clock
    pub past_tolerance_secs: i64,
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self::live()
    }
}

impl FreshnessPolicy {
    /// Online submissions: +30s / -5min
    pub fn live() -> Self {
        Self {
            future_tolerance_secs: 30,
            past_tolerance_secs: 5 * 60,
        }
    }

    /// Offline card reconciliation: +60s / -7 days
    pub fn batch() -> Self {
        Self {
            future_tolerance_secs: 60,
            past_tolerance_secs: 7 * 24 * 60 * 60,
        }
    }

    /// `now - past <= timestamp <= now + future`
    pub fn check(&self, timestamp: i64, now: i64) -> Result<()> {
        if timestamp > now.saturating_add(self.future_tolerance_secs) {
            return Err(TransactionError::Freshness(format!(
                "timestamp {} is more than {}s ahead",
                timestamp, self.future_tolerance_secs
            )));
        }
        if timestamp < now.saturating_sub(self.past_tolerance_secs) {
            return Err(TransactionError::Freshness(format!(
                "timestamp {} is more than {}s old",
                timestamp, self.past_tolerance_secs
            )));
        }
        Ok(())
    }
}

/// Which timestamp window applies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionPath {
    Live,
    Batch,
}

/// Required fields and value ranges
pub fn check_structure(request: &TransactionRequest) -> Result<()> {
    if request.version != CANONICAL_VERSION {
        return Err(invalid(format!("unsupported version {}", request.version)));
    }
    if request.id.trim().is_empty() {
        return Err(invalid("id is required"));
    }
    if request.source_account.trim().is_empty() {
        return Err(invalid("source_account is required"));
    }
    if request.destination_account.trim().is_empty() {
        return Err(invalid("destination_account is required"));
    }
    if request.source_account == request.destination_account {
        return Err(invalid("source and destination must differ"));
    }
    if request.amount <= 0 {
        return Err(invalid("amount must be positive"));
    }
    check_currency(&request.currency)?;
    if request.counter == 0 {
        return Err(invalid("counter must be positive"));
    }
    if request.signature.is_empty() {
        return Err(invalid("signature is required"));
    }
    if request.transaction_type == TransactionType::External {
        return Err(invalid("transaction_type must be DEBIT or CREDIT"));
    }
    Ok(())
}

/// ISO 4217 shape: three upper-case ASCII letters
pub fn check_currency(currency: &str) -> Result<()> {
    if currency.len() == 3 && currency.bytes().all(|b| b.is_ascii_uppercase()) {
        Ok(())
    } else {
        Err(invalid(format!("malformed currency code {:?}", currency)))
    }
}

/// Source account usable for this request
pub fn check_account(request: &TransactionRequest, account: Option<&Account>) -> Result<()> {
    let account = account.ok_or_else(|| TransactionError::AccountNotFound(request.source_account.clone()))?;
    if !account.is_active() {
        return Err(TransactionError::AccountNotActive(account.id.clone()));
    }
    if account.currency != request.currency {
        return Err(invalid(format!(
            "currency {} does not match account currency {}",
            request.currency, account.currency
        )));
    }
    Ok(())
}

/// Counter must be unused and above every counter already committed
pub fn check_counter(counter: i64, used: bool, max_seen: Option<i64>) -> Result<()> {
    if used {
        return Err(TransactionError::DoubleSpend(format!("counter {} already used", counter)));
    }
    if let Some(max) = max_seen {
        if counter <= max {
            return Err(TransactionError::DoubleSpend(format!(
                "counter {} not above last seen {}",
                counter, max
            )));
        }
    }
    Ok(())
}

/// Fast-fail balance check for debit requests
pub fn check_balance(request: &TransactionRequest, account: &Account) -> Result<()> {
    if request.transaction_type == TransactionType::Debit && account.balance < request.amount {
        return Err(TransactionError::InsufficientBalance {
            account: account.id.clone(),
            required: request.amount,
            available: account.balance,
        });
    }
    Ok(())
}

fn invalid(reason: impl Into<String>) -> TransactionError {
    TransactionError::Validation(reason.into())
}

/// Runs every check against live state
#[derive(Clone)]
pub struct TransactionValidator {
    store: Arc<dyn LedgerStore>,
    auth_keys: Arc<dyn AuthKeyProvider>,
    cache: TransactionCache,
    live: FreshnessPolicy,
    batch: FreshnessPolicy,
}

impl std::fmt::Debug for TransactionValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionValidator")
            .field("live", &self.live)
            .field("batch", &self.batch)
            .finish_non_exhaustive()
    }
}

impl TransactionValidator {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        auth_keys: Arc<dyn AuthKeyProvider>,
        cache: TransactionCache,
        live: FreshnessPolicy,
        batch: FreshnessPolicy,
    ) -> Self {
        Self {
            store,
            auth_keys,
            cache,
            live,
            batch,
        }
    }

    pub fn policy(&self, path: SubmissionPath) -> FreshnessPolicy {
        match path {
            SubmissionPath::Live => self.live,
            SubmissionPath::Batch => self.batch,
        }
    }

    /// Validate `request` at server time `now` (unix seconds)
    pub async fn validate(&self, request: &TransactionRequest, path: SubmissionPath, now: i64) -> Result<()> {
        check_structure(request)?;
        self.policy(path).check(request.timestamp, now)?;

        let account = self.store.get_account(&request.source_account).await?;
        check_account(request, account.as_ref())?;

        self.verify_signature(request).await?;
        self.check_double_spend(request).await?;

        if let Some(account) = account.as_ref() {
            check_balance(request, account)?;
        }

        debug!(transaction_id = %request.id, "Request validated");
        Ok(())
    }

    async fn verify_signature(&self, request: &TransactionRequest) -> Result<()> {
        let key = self
            .auth_keys
            .auth_key(&request.source_account)
            .await?
            .ok_or_else(|| TransactionError::AuthKeyUnavailable(security::mask_account(&request.source_account)))?;
        if verify_request(&key, request)? {
            Ok(())
        } else {
            Err(TransactionError::SignatureMismatch)
        }
    }

    async fn check_double_spend(&self, request: &TransactionRequest) -> Result<()> {
        let counter = i64::from(request.counter);

        // Cached counter can only reject; acceptance needs the store
        if let Some(cached) = self.cache.last_counter(&request.source_account).await {
            check_counter(counter, false, Some(cached))?;
        }

        let used = self.store.counter_used(&request.source_account, counter).await?;
        let max_seen = self.store.max_counter(&request.source_account).await?;
        check_counter(counter, used, max_seen)
    }
}
