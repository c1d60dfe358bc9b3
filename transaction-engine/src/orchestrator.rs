//! End-to-end transaction lifecycle
//!
//! A submission is answered from a stored outcome when its id has been seen
//! before. Otherwise it is validated, then posted inside one unit of work
//! that also writes the transaction record and its payment-state trail.
//! Side effects (settlement queue, notifications) run after commit through
//! the [`HookDispatcher`].
//!
//! Failures raised inside the unit of work (account missing or inactive,
//! insufficient funds, store errors) leave a `FAILED_*` record written by a
//! second, independent unit of work; the caller receives that record.
//! Failures raised before posting leave nothing behind and are returned as
//! errors. Retryable errors are never recorded so a retry can still succeed.

use crate::auth_keys::AuthKeyProvider;
use crate::cache::{FastCache, TransactionCache};
use crate::config::EngineConfig;
use crate::error::{ErrorKind, Result, TransactionError};
use crate::fees::FeeSchedule;
use crate::hooks::{HookDispatcher, PostCommitJob};
use crate::metrics::Metrics;
use crate::settlement::{MessageBuilder, SettlementGateway, SettlementMessage};
use crate::signature::sign_record;
use crate::types::{
    BatchFailure, BatchResult, BatchSummary, ExternalTransferRequest, SubmitOutcome, TransactionRequest,
};
use crate::validator::{check_counter, check_currency, SubmissionPath, TransactionValidator};
use chrono::Utc;
use hsm::KeyManager;
use ledger_core::{
    transfer_legs, LedgerEngine, LedgerError, LedgerStore, Leg, PaymentState, PaymentStep, TransactionRecord,
    TransactionStatus, TransactionType, UnitOfWork,
};
use security::{mask_account, AuditEvent, AuditEventType, AuditLog, AuditSeverity};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Everything the orchestrator talks to
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn LedgerStore>,
    pub cache: Arc<dyn FastCache>,
    pub keys: Arc<dyn KeyManager>,
    pub auth_keys: Arc<dyn AuthKeyProvider>,
    pub gateway: Arc<dyn SettlementGateway>,
    pub hooks: HookDispatcher,
    pub audit: AuditLog,
    pub metrics: Arc<Metrics>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Result of staging a transfer inside a unit of work
enum Staged {
    /// New record, ready to commit
    Fresh(TransactionRecord),
    /// Another submission with this id already committed
    Existing(TransactionRecord),
}

/// Result of staging an external transfer
enum ExternalStaged {
    Ready {
        record: TransactionRecord,
        message: SettlementMessage,
    },
    Existing(TransactionRecord),
    /// Attestation or message construction failed after posting
    MessageFailed(TransactionError),
}

/// Composes validation, posting, persistence and hand-off
#[derive(Clone)]
pub struct TransactionOrchestrator {
    ledger: LedgerEngine,
    validator: TransactionValidator,
    cache: TransactionCache,
    keys: Arc<dyn KeyManager>,
    gateway: Arc<dyn SettlementGateway>,
    hooks: HookDispatcher,
    audit: AuditLog,
    metrics: Arc<Metrics>,
    messages: MessageBuilder,
    fees: FeeSchedule,
    fee_account: String,
    clearing_account: String,
    max_batch_size: usize,
    max_history_limit: usize,
}

impl std::fmt::Debug for TransactionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionOrchestrator")
            .field("ledger", &self.ledger)
            .field("max_batch_size", &self.max_batch_size)
            .finish_non_exhaustive()
    }
}

impl TransactionOrchestrator {
    pub fn new(config: &EngineConfig, collaborators: Collaborators) -> Result<Self> {
        let Collaborators {
            store,
            cache,
            keys,
            auth_keys,
            gateway,
            hooks,
            audit,
            metrics,
        } = collaborators;

        let cache = TransactionCache::new(
            cache,
            config.limits.idempotency_ttl_secs,
            config.limits.counter_ttl_secs,
            metrics.clone(),
        );
        let validator = TransactionValidator::new(
            store.clone(),
            auth_keys,
            cache.clone(),
            config.freshness.live,
            config.freshness.batch,
        );

        Ok(Self {
            ledger: LedgerEngine::new(store, &config.ledger),
            validator,
            cache,
            keys,
            gateway,
            hooks,
            audit,
            metrics,
            messages: MessageBuilder::new()?,
            fees: config.fees.clone(),
            fee_account: config.ledger.system_fee_account.clone(),
            clearing_account: config.ledger.clearing_account.clone(),
            max_batch_size: config.limits.max_batch_size,
            max_history_limit: config.ledger.max_history_limit,
        })
    }

    pub fn ledger(&self) -> &LedgerEngine {
        &self.ledger
    }

    fn store(&self) -> &Arc<dyn LedgerStore> {
        self.ledger.store()
    }

    /// Submit one signed transaction
    pub async fn submit(&self, request: &TransactionRequest) -> Result<SubmitOutcome> {
        let outcome = self.process(request, SubmissionPath::Live).await?;
        if !outcome.replayed && outcome.succeeded() {
            self.hooks.dispatch(PostCommitJob::Settle(outcome.record.clone()));
        }
        Ok(outcome)
    }

    /// Submit up to `max_batch_size` transactions, each independently
    ///
    /// Items are validated against the batch freshness window. Newly
    /// committed items are handed to settlement together once the batch ends.
    pub async fn submit_batch(&self, requests: &[TransactionRequest]) -> Result<BatchResult> {
        if requests.is_empty() {
            return Err(TransactionError::BatchRejected("batch is empty".to_string()));
        }
        if requests.len() > self.max_batch_size {
            return Err(TransactionError::BatchRejected(format!(
                "batch of {} exceeds maximum of {}",
                requests.len(),
                self.max_batch_size
            )));
        }
        self.metrics.batch_size.observe(requests.len() as f64);

        let mut processed = Vec::with_capacity(requests.len());
        let mut failed = Vec::new();
        let mut to_settle = Vec::new();

        for request in requests {
            match self.process(request, SubmissionPath::Batch).await {
                Ok(outcome) if outcome.succeeded() => {
                    if !outcome.replayed {
                        to_settle.push(outcome.record.clone());
                    }
                    processed.push(outcome.record);
                }
                Ok(outcome) => failed.push(BatchFailure {
                    transaction_id: request.id.clone(),
                    reason: outcome
                        .record
                        .failure_reason
                        .clone()
                        .unwrap_or_else(|| outcome.record.status.to_string()),
                }),
                Err(e) => failed.push(BatchFailure {
                    transaction_id: request.id.clone(),
                    reason: e.to_string(),
                }),
            }
        }

        let batch_id = Uuid::new_v4();
        if !to_settle.is_empty() {
            self.hooks.dispatch(PostCommitJob::SettleBatch {
                batch_id,
                records: to_settle,
            });
        }

        let summary = BatchSummary {
            total: requests.len(),
            succeeded: processed.len(),
            failed: failed.len(),
        };
        self.audit.record(
            AuditEvent::new(AuditEventType::BatchCompleted, AuditSeverity::Info, "COMPLETED").with_details(json!({
                "batch_id": batch_id,
                "total": summary.total,
                "succeeded": summary.succeeded,
                "failed": summary.failed,
            })),
        );
        info!(batch_id = %batch_id, total = summary.total, succeeded = summary.succeeded, "Batch processed");

        Ok(BatchResult {
            processed,
            failed,
            summary,
        })
    }

    async fn process(&self, request: &TransactionRequest, path: SubmissionPath) -> Result<SubmitOutcome> {
        let _timer = self.metrics.transfer_duration.start_timer();

        if let Some(record) = self.lookup(&request.id).await? {
            return Ok(self.replay(record));
        }

        let now = Utc::now().timestamp();
        if let Err(e) = self.validator.validate(request, path, now).await {
            // A concurrent duplicate may have committed after the lookup
            match self.store().get_transaction(&request.id).await {
                Ok(Some(record)) => return Ok(self.replay(record)),
                Ok(None) => {}
                Err(lookup_err) => warn!(
                    transaction_id = %request.id,
                    error = %lookup_err,
                    "Duplicate re-check failed after validation error"
                ),
            }
            self.reject(&request.id, &request.source_account, &e);
            return Err(e);
        }

        match self.commit_transfer(request).await {
            Ok(Staged::Fresh(record)) => {
                self.completed(&record).await;
                Ok(SubmitOutcome {
                    record,
                    replayed: false,
                })
            }
            Ok(Staged::Existing(record)) => Ok(self.replay(record)),
            Err(e) => match e.failure_status() {
                Some(status) => {
                    let record = request.to_record(status, Some(e.to_string()));
                    self.record_failure(record, &e).await
                }
                None => {
                    self.reject(&request.id, &request.source_account, &e);
                    Err(e)
                }
            },
        }
    }

    /// Stored outcome for `transaction_id`, cache first
    async fn lookup(&self, transaction_id: &str) -> Result<Option<TransactionRecord>> {
        if let Some(record) = self.cache.outcome(transaction_id).await {
            return Ok(Some(record));
        }
        let record = self.store().get_transaction(transaction_id).await?;
        if let Some(record) = &record {
            self.cache.remember(record).await;
        }
        Ok(record)
    }

    fn replay(&self, record: TransactionRecord) -> SubmitOutcome {
        self.metrics.idempotent_replays.inc();
        self.audit.security(
            AuditEventType::IdempotentReplay,
            Some(&record.id),
            Some(&record.source_account),
            json!({ "status": record.status.as_str() }),
        );
        SubmitOutcome {
            record,
            replayed: true,
        }
    }

    /// Audit and count an error that leaves no record
    fn reject(&self, transaction_id: &str, account: &str, err: &TransactionError) {
        self.metrics.record_rejection(err.kind());
        match err {
            TransactionError::SignatureMismatch => self.audit.security(
                AuditEventType::SignatureMismatch,
                Some(transaction_id),
                Some(account),
                json!({}),
            ),
            TransactionError::DoubleSpend(reason) => self.audit.security(
                AuditEventType::DoubleSpend,
                Some(transaction_id),
                Some(account),
                json!({ "reason": reason }),
            ),
            e if e.kind() == ErrorKind::Validation => self.audit.security(
                AuditEventType::ValidationFailed,
                Some(transaction_id),
                Some(account),
                json!({ "reason": e.to_string() }),
            ),
            e => self.audit.error("submit", Some(transaction_id), e),
        }
        warn!(
            transaction_id,
            account = %mask_account(account),
            error = %err,
            retryable = err.is_retryable(),
            "Transaction rejected"
        );
    }

    async fn completed(&self, record: &TransactionRecord) {
        self.audit
            .transfer(&record.id, &record.source_account, record.amount, record.status.as_str());
        self.metrics.record_outcome(record.status.as_str());
        self.cache.remember(record).await;
        self.hooks.dispatch(PostCommitJob::Notify {
            transaction_id: record.id.clone(),
            account_id: record.source_account.clone(),
            amount: record.total,
            status: record.status,
        });
        info!(
            transaction_id = %record.id,
            account = %mask_account(&record.source_account),
            amount = record.amount,
            status = %record.status,
            "Transaction committed"
        );
    }

    async fn within_deadline<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        self.ledger
            .within_deadline(async { Ok::<_, LedgerError>(fut.await) })
            .await?
    }

    async fn commit_transfer(&self, request: &TransactionRequest) -> Result<Staged> {
        let legs = transfer_legs(&request.source_account, &request.destination_account, request.amount)?;
        let staged = self
            .within_deadline(async {
                let mut uow = self.store().begin().await?;
                match Self::stage_transfer(uow.as_mut(), request, &legs).await {
                    Ok(Staged::Fresh(record)) => {
                        uow.commit().await?;
                        Ok(Staged::Fresh(record))
                    }
                    Ok(existing) => {
                        abandon(uow, &request.id).await;
                        Ok(existing)
                    }
                    Err(e) => {
                        abandon(uow, &request.id).await;
                        Err(e)
                    }
                }
            })
            .await;

        match staged {
            Err(TransactionError::Ledger(LedgerError::Duplicate(_))) => self.resolve_duplicate(request).await,
            other => other,
        }
    }

    async fn stage_transfer(uow: &mut dyn UnitOfWork, request: &TransactionRequest, legs: &[Leg]) -> Result<Staged> {
        lock_sorted(uow, legs).await?;

        // Under the source row lock these checks are authoritative
        if let Some(existing) = uow.get_transaction(&request.id).await? {
            return Ok(Staged::Existing(existing));
        }
        let counter = i64::from(request.counter);
        let used = uow.counter_used(&request.source_account, counter).await?;
        let max_seen = uow.max_counter(&request.source_account).await?;
        check_counter(counter, used, max_seen)?;

        LedgerEngine::post_in(uow, &request.id, legs).await?;

        let record = request.to_record(TransactionStatus::Completed, None);
        uow.insert_transaction(&record).await?;
        uow.append_payment_state(&PaymentState::new(&record.id, PaymentStep::Pending, None))
            .await?;
        uow.append_payment_state(&PaymentState::new(&record.id, PaymentStep::Success, None))
            .await?;
        Ok(Staged::Fresh(record))
    }

    /// A unique constraint fired at insert or commit
    async fn resolve_duplicate(&self, request: &TransactionRequest) -> Result<Staged> {
        match self.store().get_transaction(&request.id).await? {
            Some(existing) => Ok(Staged::Existing(existing)),
            None => Err(TransactionError::DoubleSpend(format!(
                "counter {} already used",
                request.counter
            ))),
        }
    }

    /// Persist a failed record in its own unit of work
    async fn record_failure(&self, record: TransactionRecord, cause: &TransactionError) -> Result<SubmitOutcome> {
        let persisted = self
            .within_deadline(async {
                let mut uow = self.store().begin().await?;
                if let Some(existing) = uow.get_transaction(&record.id).await? {
                    abandon(uow, &record.id).await;
                    return Ok(Some(existing));
                }
                let detail = record.failure_reason.clone();
                uow.insert_transaction(&record).await?;
                uow.append_payment_state(&PaymentState::new(&record.id, PaymentStep::Pending, None))
                    .await?;
                uow.append_payment_state(&PaymentState::new(&record.id, PaymentStep::Failed, detail))
                    .await?;
                uow.commit().await?;
                Ok(None)
            })
            .await;

        match persisted {
            Ok(None) => {}
            Ok(Some(existing)) => return Ok(self.replay(existing)),
            Err(TransactionError::Ledger(LedgerError::Duplicate(_))) => {
                if let Some(existing) = self.store().get_transaction(&record.id).await? {
                    return Ok(self.replay(existing));
                }
                return Err(TransactionError::NotFound(record.id));
            }
            Err(e) => {
                error!(transaction_id = %record.id, error = %e, cause = %cause, "Failed to record failure");
                self.metrics.record_rejection(e.kind());
                return Err(e);
            }
        }

        self.audit
            .transfer(&record.id, &record.source_account, record.amount, record.status.as_str());
        self.metrics.record_outcome(record.status.as_str());
        self.cache.remember(&record).await;
        self.hooks.dispatch(PostCommitJob::Notify {
            transaction_id: record.id.clone(),
            account_id: record.source_account.clone(),
            amount: record.total,
            status: record.status,
        });
        warn!(
            transaction_id = %record.id,
            account = %mask_account(&record.source_account),
            status = %record.status,
            cause = %cause,
            "Transaction failed"
        );
        Ok(SubmitOutcome {
            record,
            replayed: false,
        })
    }

    /// Outbound interbank transfer on behalf of `caller`
    ///
    /// Debits amount plus fee, credits the fee account and the clearing
    /// account, then hands a signed message to the settlement gateway. A
    /// failed send reverses the posting.
    pub async fn external_transfer(&self, caller: &str, request: &ExternalTransferRequest) -> Result<SubmitOutcome> {
        let _timer = self.metrics.transfer_duration.start_timer();

        if request.amount <= 0 {
            return Err(TransactionError::Validation("amount must be positive".to_string()));
        }
        check_currency(&request.currency)?;
        if !self.messages.is_valid_bank_code(&request.to_bank_code) {
            return Err(TransactionError::Validation(format!(
                "invalid bank code {:?}",
                request.to_bank_code
            )));
        }
        if request.to_account.trim().is_empty() {
            return Err(TransactionError::Validation("to_account is required".to_string()));
        }
        let id = match &request.reference {
            Some(reference) if !reference.trim().is_empty() => reference.clone(),
            _ => format!("EXT-{}", Uuid::now_v7().simple()),
        };

        // A missing account is left to the posting so it is recorded
        if let Some(account) = self.store().get_account(&request.from_account).await? {
            if account.owner_id != caller {
                let err = TransactionError::Forbidden(mask_account(&request.from_account));
                self.reject(&id, &request.from_account, &err);
                return Err(err);
            }
        }

        if let Some(record) = self.lookup(&id).await? {
            self.check_external_replay(caller, request, &record).await?;
            return Ok(self.replay(record));
        }

        let (fee, total) = self.fees.total(request.amount)?;
        let mut legs = vec![Leg::debit(&request.from_account, total)];
        if fee > 0 {
            legs.push(Leg::credit(&self.fee_account, fee));
        }
        legs.push(Leg::credit(&self.clearing_account, request.amount));

        let template = self.external_record(&id, request, fee, total);
        let staged = self
            .within_deadline(async {
                let mut uow = self.store().begin().await?;
                match self.stage_external(uow.as_mut(), template.clone(), &legs).await {
                    Ok(ExternalStaged::Ready { record, message }) => {
                        uow.commit().await?;
                        Ok(ExternalStaged::Ready { record, message })
                    }
                    Ok(other) => {
                        abandon(uow, &id).await;
                        Ok(other)
                    }
                    Err(e) => {
                        abandon(uow, &id).await;
                        Err(e)
                    }
                }
            })
            .await;

        let (record, message) = match staged {
            Ok(ExternalStaged::Ready { record, message }) => (record, message),
            Ok(ExternalStaged::Existing(record)) => {
                self.check_external_replay(caller, request, &record).await?;
                return Ok(self.replay(record));
            }
            Ok(ExternalStaged::MessageFailed(e)) => {
                let record = failed(template, TransactionStatus::FailedIsoConversion, &e);
                let outcome = self.record_failure(record, &e).await?;
                return self.checked_external_outcome(caller, request, outcome).await;
            }
            Err(TransactionError::Ledger(LedgerError::Duplicate(_))) => {
                return match self.store().get_transaction(&id).await? {
                    Some(existing) => {
                        self.check_external_replay(caller, request, &existing).await?;
                        Ok(self.replay(existing))
                    }
                    None => Err(TransactionError::NotFound(id)),
                };
            }
            Err(e) => {
                return match e.failure_status() {
                    Some(status) => {
                        let record = failed(template, status, &e);
                        let outcome = self.record_failure(record, &e).await?;
                        self.checked_external_outcome(caller, request, outcome).await
                    }
                    None => {
                        self.reject(&id, &request.from_account, &e);
                        Err(e)
                    }
                };
            }
        };

        match self.gateway.send(&message).await {
            Ok(()) => {
                self.completed(&record).await;
                Ok(SubmitOutcome {
                    record,
                    replayed: false,
                })
            }
            Err(e) => self.reverse_external(record, &legs, e).await,
        }
    }

    /// A reference replays only for the transfer that created it, and only
    /// to the owner of its source account
    async fn check_external_replay(
        &self,
        caller: &str,
        request: &ExternalTransferRequest,
        record: &TransactionRecord,
    ) -> Result<()> {
        let err = if record.transaction_type != TransactionType::External
            || record.source_account != request.from_account
        {
            TransactionError::ReferenceConflict(record.id.clone())
        } else {
            match self.store().get_account(&record.source_account).await? {
                Some(account) if account.owner_id != caller => {
                    TransactionError::Forbidden(mask_account(&record.source_account))
                }
                // No owner to protect when the source never existed
                _ => return Ok(()),
            }
        };
        self.reject(&record.id, &request.from_account, &err);
        Err(err)
    }

    async fn checked_external_outcome(
        &self,
        caller: &str,
        request: &ExternalTransferRequest,
        outcome: SubmitOutcome,
    ) -> Result<SubmitOutcome> {
        if outcome.replayed {
            self.check_external_replay(caller, request, &outcome.record).await?;
        }
        Ok(outcome)
    }

    fn external_record(&self, id: &str, request: &ExternalTransferRequest, fee: i64, total: i64) -> TransactionRecord {
        let now = Utc::now();
        TransactionRecord {
            id: id.to_string(),
            source_account: request.from_account.clone(),
            destination_account: request.to_account.clone(),
            amount: request.amount,
            fee,
            total,
            currency: request.currency.clone(),
            counter: None,
            transaction_type: TransactionType::External,
            signature: String::new(),
            status: TransactionStatus::PendingSettlement,
            failure_reason: None,
            destination_bank: Some(request.to_bank_code.clone()),
            submitted_at: now.timestamp(),
            created_at: now,
            processed_at: Some(now),
            settled_at: None,
        }
    }

    async fn stage_external(
        &self,
        uow: &mut dyn UnitOfWork,
        mut record: TransactionRecord,
        legs: &[Leg],
    ) -> Result<ExternalStaged> {
        lock_sorted(uow, legs).await?;
        if let Some(existing) = uow.get_transaction(&record.id).await? {
            return Ok(ExternalStaged::Existing(existing));
        }

        LedgerEngine::post_in(uow, &record.id, legs).await?;

        let message = sign_record(self.keys.as_ref(), &record).and_then(|attestation| {
            record.signature = attestation.signature.clone();
            self.gateway.build_message(&record, attestation)
        });
        let message = match message {
            Ok(message) => message,
            Err(e) => return Ok(ExternalStaged::MessageFailed(e)),
        };

        uow.insert_transaction(&record).await?;
        uow.append_payment_state(&PaymentState::new(&record.id, PaymentStep::Pending, None))
            .await?;
        Ok(ExternalStaged::Ready { record, message })
    }

    /// Undo a committed external posting after the send failed
    ///
    /// If the reversal cannot commit, the record is parked as
    /// `REVERSAL_PENDING` for [`Self::retry_reversal`].
    async fn reverse_external(
        &self,
        mut record: TransactionRecord,
        legs: &[Leg],
        cause: TransactionError,
    ) -> Result<SubmitOutcome> {
        let reason = cause.to_string();

        if let Err(e) = self
            .post_reversal(&record.id, legs, TransactionStatus::PendingSettlement, &reason)
            .await
        {
            error!(
                transaction_id = %record.id,
                error = %e,
                cause = %cause,
                "Reversal after failed settlement send did not commit"
            );
            self.audit.error("external_reversal", Some(&record.id), &e);
            if let Err(mark_err) = self.mark_reversal_pending(&record.id, &reason).await {
                error!(transaction_id = %record.id, error = %mark_err, "Could not park transfer for reversal retry");
                return Err(e);
            }

            record.status = TransactionStatus::ReversalPending;
            record.failure_reason = Some(reason);
            self.audit.security(
                AuditEventType::SettlementFailed,
                Some(&record.id),
                Some(&record.source_account),
                json!({ "error": cause.to_string(), "reversal": "pending" }),
            );
            self.audit
                .transfer(&record.id, &record.source_account, record.total, record.status.as_str());
            self.metrics.record_outcome(record.status.as_str());
            self.cache.remember(&record).await;
            warn!(transaction_id = %record.id, error = %cause, "Settlement send failed, reversal pending");
            return Ok(SubmitOutcome {
                record,
                replayed: false,
            });
        }

        record.status = TransactionStatus::FailedSettlementError;
        record.failure_reason = Some(reason);
        self.audit.security(
            AuditEventType::SettlementFailed,
            Some(&record.id),
            Some(&record.source_account),
            json!({ "error": cause.to_string(), "reversal": format!("{}:reversal", record.id) }),
        );
        self.audit
            .transfer(&record.id, &record.source_account, record.total, record.status.as_str());
        self.metrics.record_outcome(record.status.as_str());
        self.cache.remember(&record).await;
        warn!(transaction_id = %record.id, error = %cause, "Settlement send failed, posting reversed");
        Ok(SubmitOutcome {
            record,
            replayed: false,
        })
    }

    /// Post the negated `legs` and mark the transfer failed, provided it is
    /// still in `expected` state once its accounts are locked
    async fn post_reversal(
        &self,
        transaction_id: &str,
        legs: &[Leg],
        expected: TransactionStatus,
        reason: &str,
    ) -> Result<()> {
        let reversal_id = format!("{}:reversal", transaction_id);
        let reversal: Vec<Leg> = legs
            .iter()
            .map(|leg| Leg {
                account_id: leg.account_id.clone(),
                amount: -leg.amount,
            })
            .collect();

        self.within_deadline(async {
            let mut uow = self.store().begin().await?;
            let staged = async {
                lock_sorted(uow.as_mut(), &reversal).await?;
                let current = uow
                    .get_transaction(transaction_id)
                    .await?
                    .ok_or_else(|| TransactionError::NotFound(transaction_id.to_string()))?;
                if current.status != expected {
                    return Err(TransactionError::Validation(format!(
                        "transaction {} is {}, not {}",
                        transaction_id, current.status, expected
                    )));
                }
                LedgerEngine::post_in(uow.as_mut(), &reversal_id, &reversal).await?;
                uow.update_transaction_status(
                    transaction_id,
                    TransactionStatus::FailedSettlementError,
                    Some(reason),
                    None,
                )
                .await?;
                uow.append_payment_state(&PaymentState::new(
                    transaction_id,
                    PaymentStep::Reversed,
                    Some(reason.to_string()),
                ))
                .await?;
                Ok::<_, TransactionError>(())
            }
            .await;
            match staged {
                Ok(()) => {
                    uow.commit().await?;
                    Ok(())
                }
                Err(e) => {
                    abandon(uow, transaction_id).await;
                    Err(e)
                }
            }
        })
        .await
    }

    async fn mark_reversal_pending(&self, transaction_id: &str, reason: &str) -> Result<()> {
        self.within_deadline(async {
            let mut uow = self.store().begin().await?;
            let staged = async {
                uow.update_transaction_status(
                    transaction_id,
                    TransactionStatus::ReversalPending,
                    Some(reason),
                    None,
                )
                .await?;
                uow.append_payment_state(&PaymentState::new(
                    transaction_id,
                    PaymentStep::Failed,
                    Some(reason.to_string()),
                ))
                .await?;
                Ok::<_, TransactionError>(())
            }
            .await;
            match staged {
                Ok(()) => {
                    uow.commit().await?;
                    Ok(())
                }
                Err(e) => {
                    abandon(uow, transaction_id).await;
                    Err(e)
                }
            }
        })
        .await
    }

    /// Post the reversal of a transfer parked as `REVERSAL_PENDING`
    pub async fn retry_reversal(&self, transaction_id: &str) -> Result<TransactionRecord> {
        let mut record = self.get_transaction(transaction_id).await?;
        if record.status != TransactionStatus::ReversalPending {
            return Err(TransactionError::Validation(format!(
                "transaction {} is {}, not awaiting reversal",
                transaction_id, record.status
            )));
        }

        let legs: Vec<Leg> = self
            .store()
            .entries_for_transaction(transaction_id)
            .await?
            .into_iter()
            .map(|entry| Leg {
                account_id: entry.account_id,
                amount: entry.amount,
            })
            .collect();
        let reason = record
            .failure_reason
            .clone()
            .unwrap_or_else(|| "settlement send failed".to_string());

        if let Err(e) = self
            .post_reversal(transaction_id, &legs, TransactionStatus::ReversalPending, &reason)
            .await
        {
            self.audit.error("external_reversal", Some(transaction_id), &e);
            return Err(e);
        }

        record.status = TransactionStatus::FailedSettlementError;
        record.failure_reason = Some(reason);
        self.audit.operation(
            "reversal_retry",
            json!({ "transaction_id": transaction_id, "reversal": format!("{}:reversal", transaction_id) }),
        );
        self.audit
            .transfer(&record.id, &record.source_account, record.total, record.status.as_str());
        self.metrics.record_outcome(record.status.as_str());
        self.cache.remember(&record).await;
        info!(transaction_id, "Pending reversal posted");
        Ok(record)
    }

    /// Mark an external transfer as cleared by the settlement service
    pub async fn confirm_settlement(&self, transaction_id: &str) -> Result<TransactionRecord> {
        let settled_at = Utc::now();
        let record = self
            .within_deadline(async {
                let mut uow = self.store().begin().await?;
                let Some(mut record) = uow.get_transaction(transaction_id).await? else {
                    abandon(uow, transaction_id).await;
                    return Err(TransactionError::NotFound(transaction_id.to_string()));
                };
                if record.status != TransactionStatus::PendingSettlement {
                    abandon(uow, transaction_id).await;
                    return Err(TransactionError::Validation(format!(
                        "transaction {} is {}, not awaiting settlement",
                        transaction_id, record.status
                    )));
                }
                uow.update_transaction_status(transaction_id, TransactionStatus::Settled, None, Some(settled_at))
                    .await?;
                uow.append_payment_state(&PaymentState::new(transaction_id, PaymentStep::Success, None))
                    .await?;
                uow.commit().await?;
                record.status = TransactionStatus::Settled;
                record.settled_at = Some(settled_at);
                Ok(record)
            })
            .await?;

        self.audit
            .transfer(&record.id, &record.source_account, record.total, record.status.as_str());
        self.metrics.record_outcome(record.status.as_str());
        self.cache.remember(&record).await;
        info!(transaction_id, "Settlement confirmed");
        Ok(record)
    }

    pub async fn get_transaction(&self, transaction_id: &str) -> Result<TransactionRecord> {
        self.store()
            .get_transaction(transaction_id)
            .await?
            .ok_or_else(|| TransactionError::NotFound(transaction_id.to_string()))
    }

    /// Newest first; `limit` is clamped to the configured maximum
    pub async fn recent_transactions(&self, account_id: &str, limit: usize) -> Result<Vec<TransactionRecord>> {
        let limit = limit.clamp(1, self.max_history_limit);
        Ok(self.store().recent_transactions(account_id, limit).await?)
    }
}

/// Take every leg's row lock in ascending id order
async fn lock_sorted(uow: &mut dyn UnitOfWork, legs: &[Leg]) -> Result<()> {
    let mut ids: Vec<&str> = legs.iter().map(|l| l.account_id.as_str()).collect();
    ids.sort_unstable();
    ids.dedup();
    for id in ids {
        uow.lock_account(id).await?;
    }
    Ok(())
}

async fn abandon(uow: Box<dyn UnitOfWork>, transaction_id: &str) {
    if let Err(e) = uow.rollback().await {
        warn!(transaction_id, error = %e, "Rollback failed");
    }
}

fn failed(mut record: TransactionRecord, status: TransactionStatus, cause: &TransactionError) -> TransactionRecord {
    record.status = status;
    record.failure_reason = Some(cause.to_string());
    record.signature = String::new();
    record
}
