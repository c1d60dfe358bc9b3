//! Post-commit side effects
//!
//! Work that follows a committed transfer (settlement hand-off, customer
//! notification) never blocks or fails the caller's response. Jobs go onto a
//! bounded queue drained by one background worker; a full queue drops the job
//! with a warning and a metric rather than applying backpressure to the
//! money path. Dropping every [`HookDispatcher`] lets the worker drain what is
//! queued and exit.

use crate::cache::{keys, FastCache};
use crate::error::Result;
use crate::metrics::Metrics;
use crate::settlement::SettlementTicket;
use async_trait::async_trait;
use ledger_core::{TransactionRecord, TransactionStatus};
use security::{mask_account, AuditEventType, AuditLog};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Unit of post-commit work
#[derive(Debug, Clone)]
pub enum PostCommitJob {
    /// Queue one committed transfer for settlement
    Settle(TransactionRecord),
    /// Queue a batch's committed transfers together
    SettleBatch { batch_id: Uuid, records: Vec<TransactionRecord> },
    /// Tell the account holder about an outcome
    Notify {
        transaction_id: String,
        account_id: String,
        amount: i64,
        status: TransactionStatus,
    },
}

impl PostCommitJob {
    pub fn name(&self) -> &'static str {
        match self {
            PostCommitJob::Settle(_) => "settle",
            PostCommitJob::SettleBatch { .. } => "settle_batch",
            PostCommitJob::Notify { .. } => "notify",
        }
    }
}

/// Independently fallible reaction to a job
#[async_trait]
pub trait PostCommitHook: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, job: &PostCommitJob) -> Result<()>;
}

/// Producer side of the job queue
#[derive(Clone)]
pub struct HookDispatcher {
    tx: mpsc::Sender<PostCommitJob>,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for HookDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookDispatcher")
            .field("capacity", &self.tx.max_capacity())
            .finish_non_exhaustive()
    }
}

impl HookDispatcher {
    /// Create the queue; the worker must be run or drained by the caller
    pub fn new(hooks: Vec<Arc<dyn PostCommitHook>>, capacity: usize, metrics: Arc<Metrics>) -> (Self, HookWorker) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = HookWorker {
            rx,
            hooks,
            metrics: metrics.clone(),
        };
        (Self { tx, metrics }, worker)
    }

    /// Enqueue without waiting; returns false if the job was dropped
    pub fn dispatch(&self, job: PostCommitJob) -> bool {
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(job)) => {
                self.metrics.jobs_dropped.inc();
                warn!(job = job.name(), "Post-commit queue full, job dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                self.metrics.jobs_dropped.inc();
                warn!(job = job.name(), "Post-commit worker stopped, job dropped");
                false
            }
        }
    }
}

/// Consumer side of the job queue
pub struct HookWorker {
    rx: mpsc::Receiver<PostCommitJob>,
    hooks: Vec<Arc<dyn PostCommitHook>>,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for HookWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookWorker")
            .field("hooks", &self.hooks.len())
            .finish_non_exhaustive()
    }
}

impl HookWorker {
    /// Process jobs until every dispatcher is dropped; returns jobs handled
    pub async fn run(mut self) -> usize {
        let mut handled = 0;
        while let Some(job) = self.rx.recv().await {
            self.execute(&job).await;
            handled += 1;
        }
        info!(handled, "Post-commit worker stopped");
        handled
    }

    /// Process whatever is queued right now
    pub async fn drain(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(job) = self.rx.try_recv() {
            self.execute(&job).await;
            handled += 1;
        }
        handled
    }

    async fn execute(&self, job: &PostCommitJob) {
        for hook in &self.hooks {
            if let Err(e) = hook.run(job).await {
                self.metrics.hook_failures.inc();
                warn!(hook = hook.name(), job = job.name(), error = %e, "Post-commit hook failed");
            }
        }
    }
}

/// Pushes committed transfers onto the settlement queue
pub struct SettlementQueueHook {
    cache: Arc<dyn FastCache>,
    audit: AuditLog,
}

impl std::fmt::Debug for SettlementQueueHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettlementQueueHook").finish_non_exhaustive()
    }
}

impl SettlementQueueHook {
    pub fn new(cache: Arc<dyn FastCache>, audit: AuditLog) -> Self {
        Self { cache, audit }
    }

    async fn enqueue(&self, record: &TransactionRecord, batch_id: Option<Uuid>) -> Result<()> {
        let ticket = SettlementTicket::new(record, batch_id);
        let payload = serde_json::to_string(&ticket)?;
        match self.cache.push(keys::SETTLEMENT_QUEUE, &payload).await {
            Ok(()) => {
                self.audit.security(
                    AuditEventType::SettlementQueued,
                    Some(&record.id),
                    Some(&record.source_account),
                    json!({ "amount": record.amount, "batch_id": batch_id }),
                );
                Ok(())
            }
            Err(e) => {
                self.audit.security(
                    AuditEventType::SettlementFailed,
                    Some(&record.id),
                    Some(&record.source_account),
                    json!({ "error": e.to_string() }),
                );
                Err(e)
            }
        }
    }
}

#[async_trait]
impl PostCommitHook for SettlementQueueHook {
    fn name(&self) -> &'static str {
        "settlement_queue"
    }

    async fn run(&self, job: &PostCommitJob) -> Result<()> {
        match job {
            PostCommitJob::Settle(record) => self.enqueue(record, None).await,
            PostCommitJob::SettleBatch { batch_id, records } => {
                let mut first_error = None;
                for record in records {
                    if let Err(e) = self.enqueue(record, Some(*batch_id)).await {
                        first_error.get_or_insert(e);
                    }
                }
                debug!(batch_id = %batch_id, count = records.len(), "Batch queued for settlement");
                first_error.map_or(Ok(()), Err)
            }
            PostCommitJob::Notify { .. } => Ok(()),
        }
    }
}

/// Emits account-holder notifications
#[derive(Debug, Default)]
pub struct NotificationHook;

#[async_trait]
impl PostCommitHook for NotificationHook {
    fn name(&self) -> &'static str {
        "notification"
    }

    async fn run(&self, job: &PostCommitJob) -> Result<()> {
        if let PostCommitJob::Notify {
            transaction_id,
            account_id,
            amount,
            status,
        } = job
        {
            info!(
                transaction_id = %transaction_id,
                account = %mask_account(account_id),
                amount,
                status = %status,
                "Transaction notification"
            );
        }
        Ok(())
    }
}
