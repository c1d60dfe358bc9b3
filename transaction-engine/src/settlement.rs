//! Settlement hand-off
//!
//! Committed transfers are queued for the settlement service, which clears
//! them against external rails. Outbound interbank transfers additionally
//! produce a [`SettlementMessage`] carrying the server attestation; building
//! and sending it are the two steps that can fail after the ledger posting.

use crate::cache::{keys, FastCache};
use crate::error::{Result, TransactionError};
use crate::signature::Attestation;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledger_core::TransactionRecord;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Interbank credit transfer instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementMessage {
    pub message_id: Uuid,
    pub transaction_id: String,
    pub debtor_account: String,
    pub creditor_account: String,
    pub creditor_bank: String,
    /// Principal in minor units
    pub amount: i64,
    pub fee: i64,
    pub currency: String,
    pub created_at: DateTime<Utc>,
    pub attestation: Attestation,
}

/// Builds and delivers interbank messages
#[async_trait]
pub trait SettlementGateway: Send + Sync {
    fn build_message(&self, record: &TransactionRecord, attestation: Attestation) -> Result<SettlementMessage>;

    async fn send(&self, message: &SettlementMessage) -> Result<()>;
}

/// Message construction shared by gateways
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    bank_code: Regex,
}

impl MessageBuilder {
    pub fn new() -> Result<Self> {
        Ok(Self {
            bank_code: Regex::new(r"^[0-9A-Za-z]{3,6}$")?,
        })
    }

    pub fn is_valid_bank_code(&self, code: &str) -> bool {
        self.bank_code.is_match(code)
    }

    pub fn build(&self, record: &TransactionRecord, attestation: Attestation) -> Result<SettlementMessage> {
        let bank = record
            .destination_bank
            .as_deref()
            .ok_or_else(|| TransactionError::Settlement("destination bank missing".to_string()))?;
        if !self.is_valid_bank_code(bank) {
            return Err(TransactionError::Settlement(format!("invalid bank code {:?}", bank)));
        }
        if record.amount <= 0 || record.total != record.amount + record.fee {
            return Err(TransactionError::Settlement("inconsistent amounts".to_string()));
        }
        Ok(SettlementMessage {
            message_id: Uuid::new_v4(),
            transaction_id: record.id.clone(),
            debtor_account: record.source_account.clone(),
            creditor_account: record.destination_account.clone(),
            creditor_bank: bank.to_string(),
            amount: record.amount,
            fee: record.fee,
            currency: record.currency.clone(),
            created_at: Utc::now(),
            attestation,
        })
    }
}

/// Pushes serialised messages onto the outbound cache queue
#[derive(Clone)]
pub struct QueueSettlementGateway {
    cache: Arc<dyn FastCache>,
    builder: MessageBuilder,
}

impl std::fmt::Debug for QueueSettlementGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueSettlementGateway").finish_non_exhaustive()
    }
}

impl QueueSettlementGateway {
    pub fn new(cache: Arc<dyn FastCache>) -> Result<Self> {
        Ok(Self {
            cache,
            builder: MessageBuilder::new()?,
        })
    }
}

#[async_trait]
impl SettlementGateway for QueueSettlementGateway {
    fn build_message(&self, record: &TransactionRecord, attestation: Attestation) -> Result<SettlementMessage> {
        self.builder.build(record, attestation)
    }

    async fn send(&self, message: &SettlementMessage) -> Result<()> {
        let payload = serde_json::to_string(message)?;
        self.cache
            .push(keys::SETTLEMENT_OUTBOUND, &payload)
            .await
            .map_err(|e| TransactionError::Settlement(e.to_string()))?;
        info!(
            transaction_id = %message.transaction_id,
            message_id = %message.message_id,
            bank = %message.creditor_bank,
            "Settlement message sent"
        );
        Ok(())
    }
}

/// Records messages in memory; either step can be made to fail
#[derive(Debug)]
pub struct MemorySettlementGateway {
    builder: MessageBuilder,
    sent: Mutex<Vec<SettlementMessage>>,
    fail_build: AtomicBool,
    fail_send: AtomicBool,
}

impl MemorySettlementGateway {
    pub fn new() -> Result<Self> {
        Ok(Self {
            builder: MessageBuilder::new()?,
            sent: Mutex::new(Vec::new()),
            fail_build: AtomicBool::new(false),
            fail_send: AtomicBool::new(false),
        })
    }

    pub fn fail_build(&self, fail: bool) {
        self.fail_build.store(fail, Ordering::SeqCst);
    }

    pub fn fail_send(&self, fail: bool) {
        self.fail_send.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SettlementMessage> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl SettlementGateway for MemorySettlementGateway {
    fn build_message(&self, record: &TransactionRecord, attestation: Attestation) -> Result<SettlementMessage> {
        if self.fail_build.load(Ordering::SeqCst) {
            return Err(TransactionError::Settlement("message construction failed".to_string()));
        }
        self.builder.build(record, attestation)
    }

    async fn send(&self, message: &SettlementMessage) -> Result<()> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(TransactionError::Settlement("settlement service unreachable".to_string()));
        }
        debug!(transaction_id = %message.transaction_id, "Settlement message recorded");
        self.sent.lock().push(message.clone());
        Ok(())
    }
}

/// Entry on the settlement queue for committed transfers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementTicket {
    pub transaction_id: String,
    pub source_account: String,
    pub destination_account: String,
    pub amount: i64,
    pub currency: String,
    /// Set when the ticket belongs to a batch hand-off
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<Uuid>,
    pub queued_at: DateTime<Utc>,
}

impl SettlementTicket {
    pub fn new(record: &TransactionRecord, batch_id: Option<Uuid>) -> Self {
        Self {
            transaction_id: record.id.clone(),
            source_account: record.source_account.clone(),
            destination_account: record.destination_account.clone(),
            amount: record.amount,
            currency: record.currency.clone(),
            batch_id,
            queued_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use ledger_core::{TransactionStatus, TransactionType};

    fn record() -> TransactionRecord {
        let now = Utc::now();
        TransactionRecord {
            id: "EXT-1".into(),
            source_account: "1234567890".into(),
            destination_account: "5555555555".into(),
            amount: 10_000,
            fee: 100,
            total: 10_100,
            currency: "NGN".into(),
            counter: None,
            transaction_type: TransactionType::External,
            signature: String::new(),
            status: TransactionStatus::PendingSettlement,
            failure_reason: None,
            destination_bank: Some("058".into()),
            submitted_at: now.timestamp(),
            created_at: now,
            processed_at: Some(now),
            settled_at: None,
        }
    }

    fn attestation() -> Attestation {
        Attestation {
            key_id: "transaction_signing".into(),
            signature: "00".into(),
        }
    }

    #[test]
    fn test_build_rejects_bad_bank_code() {
        let builder = MessageBuilder::new().unwrap();
        let mut rec = record();
        assert!(builder.build(&rec, attestation()).is_ok());

        rec.destination_bank = Some("05-8".into());
        assert!(matches!(builder.build(&rec, attestation()), Err(TransactionError::Settlement(_))));
        rec.destination_bank = None;
        assert!(builder.build(&rec, attestation()).is_err());
    }

    #[test]
    fn test_build_rejects_inconsistent_total() {
        let builder = MessageBuilder::new().unwrap();
        let mut rec = record();
        rec.total = rec.amount;
        assert!(builder.build(&rec, attestation()).is_err());
    }

    #[tokio::test]
    async fn test_queue_gateway_pushes_json() {
        let cache = Arc::new(MemoryCache::new());
        let gateway = QueueSettlementGateway::new(cache.clone()).unwrap();
        let message = gateway.build_message(&record(), attestation()).unwrap();
        gateway.send(&message).await.unwrap();

        let queued = cache.queue(keys::SETTLEMENT_OUTBOUND);
        assert_eq!(queued.len(), 1);
        let decoded: SettlementMessage = serde_json::from_str(&queued[0]).unwrap();
        assert_eq!(decoded, message);
    }

    #[tokio::test]
    async fn test_queue_gateway_surfaces_cache_failure() {
        let cache = Arc::new(MemoryCache::new());
        let gateway = QueueSettlementGateway::new(cache.clone()).unwrap();
        let message = gateway.build_message(&record(), attestation()).unwrap();
        cache.set_unavailable(true);
        assert!(matches!(gateway.send(&message).await, Err(TransactionError::Settlement(_))));
    }
}
