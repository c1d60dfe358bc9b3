//! Request and response shapes
//!
//! The authenticated byte layout of a card transaction is fixed per
//! `version`. Version 1 concatenates, with no separators:
//!
//! | field       | encoding          |
//! |-------------|-------------------|
//! | version     | 1 byte            |
//! | id          | UTF-8             |
//! | timestamp   | i64 big-endian    |
//! | source      | UTF-8             |
//! | destination | UTF-8             |
//! | amount      | i64 big-endian    |
//! | currency    | UTF-8             |
//! | counter     | u32 big-endian    |
//! | type        | UTF-8 (`DEBIT`/`CREDIT`) |

use chrono::{DateTime, Utc};
use ledger_core::{TransactionRecord, TransactionStatus, TransactionType};
use serde::{Deserialize, Serialize};

/// Current canonical layout version
pub const CANONICAL_VERSION: u8 = 1;

/// Signed card transaction as submitted by a terminal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRequest {
    #[serde(default = "default_version")]
    pub version: u8,
    /// Idempotency key
    pub id: String,
    /// Unix seconds at the terminal
    pub timestamp: i64,
    pub source_account: String,
    pub destination_account: String,
    /// Minor units
    pub amount: i64,
    pub currency: String,
    /// Per-source strictly increasing counter
    pub counter: u32,
    pub transaction_type: TransactionType,
    /// Hex HMAC-SHA256 over [`TransactionRequest::canonical_bytes`]
    pub signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub narration: Option<String>,
}

fn default_version() -> u8 {
    CANONICAL_VERSION
}

impl TransactionRequest {
    /// Bytes covered by the signature
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(
            1 + self.id.len()
                + 8
                + self.source_account.len()
                + self.destination_account.len()
                + 8
                + self.currency.len()
                + 4
                + 6,
        );
        data.push(self.version);
        data.extend_from_slice(self.id.as_bytes());
        data.extend_from_slice(&self.timestamp.to_be_bytes());
        data.extend_from_slice(self.source_account.as_bytes());
        data.extend_from_slice(self.destination_account.as_bytes());
        data.extend_from_slice(&self.amount.to_be_bytes());
        data.extend_from_slice(self.currency.as_bytes());
        data.extend_from_slice(&self.counter.to_be_bytes());
        data.extend_from_slice(self.transaction_type.as_str().as_bytes());
        data
    }

    /// Record written for this request once its outcome is known
    pub fn to_record(&self, status: TransactionStatus, failure_reason: Option<String>) -> TransactionRecord {
        let now = Utc::now();
        // A failed request does not consume its counter
        let counter = if status.is_failure() {
            None
        } else {
            Some(i64::from(self.counter))
        };
        TransactionRecord {
            id: self.id.clone(),
            source_account: self.source_account.clone(),
            destination_account: self.destination_account.clone(),
            amount: self.amount,
            fee: 0,
            total: self.amount,
            currency: self.currency.clone(),
            counter,
            transaction_type: self.transaction_type,
            signature: self.signature.clone(),
            status,
            failure_reason,
            destination_bank: None,
            submitted_at: self.timestamp,
            created_at: now,
            processed_at: Some(now),
            settled_at: None,
        }
    }
}

/// Outbound interbank transfer, authorised by the caller identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalTransferRequest {
    /// Caller reference; doubles as the idempotency key
    #[serde(default)]
    pub reference: Option<String>,
    pub from_account: String,
    pub to_account: String,
    pub to_bank_code: String,
    /// Minor units
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub narration: Option<String>,
}

/// Outcome of a single submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitOutcome {
    pub record: TransactionRecord,
    /// True when the record was produced by an earlier submission
    pub replayed: bool,
}

impl SubmitOutcome {
    pub fn succeeded(&self) -> bool {
        !self.record.is_failure()
    }
}

/// One rejected batch item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub transaction_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Partition of a processed batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub processed: Vec<TransactionRecord>,
    pub failed: Vec<BatchFailure>,
    pub summary: BatchSummary,
}

/// Name enquiry response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameEnquiry {
    pub account_id: String,
    pub account_name: String,
}

/// Balance enquiry response; `available_balance` is `None` unless the caller
/// owns the account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceEnquiry {
    pub account_id: String,
    pub available_balance: Option<i64>,
    pub display_balance: String,
    pub currency: String,
    pub as_of: DateTime<Utc>,
}
