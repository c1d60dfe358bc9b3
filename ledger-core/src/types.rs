//! Core types for the ledger
//!
//! Money is always an `i64` count of minor currency units. Signed amounts
//! follow the ledger convention: negative for a debit, positive for a credit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Account usability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountStatus {
    /// May send and receive
    Active,
    /// Temporarily blocked
    Inactive,
    /// Frozen by operations
    Suspended,
    /// Closed; kept for history
    Closed,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "ACTIVE",
            AccountStatus::Inactive => "INACTIVE",
            AccountStatus::Suspended => "SUSPENDED",
            AccountStatus::Closed => "CLOSED",
        }
    }
}

impl FromStr for AccountStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(AccountStatus::Active),
            "INACTIVE" => Ok(AccountStatus::Inactive),
            "SUSPENDED" => Ok(AccountStatus::Suspended),
            "CLOSED" => Ok(AccountStatus::Closed),
            other => Err(format!("unknown account status {}", other)),
        }
    }
}

/// Account with versioned balance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Account identifier
    pub id: String,

    /// Identity of the owner, as supplied by the identity middleware
    pub owner_id: String,

    /// Account holder name
    pub name: String,

    /// Balance in minor units
    pub balance: i64,

    /// Incremented exactly once per balance mutation
    pub version: i64,

    /// Usability
    pub status: AccountStatus,

    /// ISO 4217 currency code
    pub currency: String,

    /// Last balance mutation
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// New active account at version 0
    pub fn new(id: impl Into<String>, owner_id: impl Into<String>, name: impl Into<String>, balance: i64) -> Self {
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            name: name.into(),
            balance,
            version: 0,
            status: AccountStatus::Active,
            currency: "NGN".to_string(),
            updated_at: Utc::now(),
        }
    }

    pub fn with_status(mut self, status: AccountStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into();
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }
}

/// Ledger entry side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryType {
    Debit,
    Credit,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Debit => "DEBIT",
            EntryType::Credit => "CREDIT",
        }
    }

    /// Side implied by a signed amount
    pub fn for_amount(amount: i64) -> Self {
        if amount < 0 {
            EntryType::Debit
        } else {
            EntryType::Credit
        }
    }
}

impl FromStr for EntryType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "DEBIT" => Ok(EntryType::Debit),
            "CREDIT" => Ok(EntryType::Credit),
            other => Err(format!("unknown entry type {}", other)),
        }
    }
}

/// Immutable ledger entry, one per leg
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub transaction_id: String,
    pub account_id: String,
    /// Signed amount: negative for debit
    pub amount: i64,
    pub entry_type: EntryType,
    /// Account balance after this entry
    pub balance_after: i64,
    pub created_at: DateTime<Utc>,
}

/// One side of a posting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leg {
    pub account_id: String,
    /// Signed amount: negative for debit
    pub amount: i64,
}

impl Leg {
    pub fn debit(account_id: impl Into<String>, amount: i64) -> Self {
        Self {
            account_id: account_id.into(),
            amount: -amount,
        }
    }

    pub fn credit(account_id: impl Into<String>, amount: i64) -> Self {
        Self {
            account_id: account_id.into(),
            amount,
        }
    }
}

/// Result of a conditioned balance update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionedUpdate {
    /// Row updated; carries the new version
    Applied { new_version: i64 },
    /// Row exists but its version moved on
    Conflict,
    /// No such row
    NotFound,
}

/// Balance snapshot after a posting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceChange {
    pub account_id: String,
    pub balance: i64,
    pub version: i64,
}

/// Outcome of a committed posting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostingReceipt {
    pub transaction_id: String,
    pub entries: Vec<LedgerEntry>,
    pub balances: Vec<BalanceChange>,
}

impl PostingReceipt {
    pub fn balance_of(&self, account_id: &str) -> Option<i64> {
        self.balances
            .iter()
            .find(|b| b.account_id == account_id)
            .map(|b| b.balance)
    }
}

/// Authenticated transaction type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Debit,
    Credit,
    /// Outbound interbank transfer
    External,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Debit => "DEBIT",
            TransactionType::Credit => "CREDIT",
            TransactionType::External => "EXTERNAL",
        }
    }
}

impl FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "DEBIT" => Ok(TransactionType::Debit),
            "CREDIT" => Ok(TransactionType::Credit),
            "EXTERNAL" => Ok(TransactionType::External),
            other => Err(format!("unknown transaction type {}", other)),
        }
    }
}

/// Transaction record status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    /// Accepted, not yet terminal
    Pending,
    /// Internal transfer committed
    Completed,
    /// External transfer debited and handed to the settlement service
    PendingSettlement,
    /// External settlement confirmed
    Settled,
    /// Settlement send failed and the reversal has not committed yet
    ReversalPending,
    FailedAccountNotFound,
    FailedAccountNotActive,
    FailedInsufficientBalance,
    FailedDebitError,
    FailedIsoConversion,
    FailedSettlementError,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Completed => "COMPLETED",
            TransactionStatus::PendingSettlement => "PENDING_SETTLEMENT",
            TransactionStatus::Settled => "SETTLED",
            TransactionStatus::ReversalPending => "REVERSAL_PENDING",
            TransactionStatus::FailedAccountNotFound => "FAILED_ACCOUNT_NOT_FOUND",
            TransactionStatus::FailedAccountNotActive => "FAILED_ACCOUNT_NOT_ACTIVE",
            TransactionStatus::FailedInsufficientBalance => "FAILED_INSUFFICIENT_BALANCE",
            TransactionStatus::FailedDebitError => "FAILED_DEBIT_ERROR",
            TransactionStatus::FailedIsoConversion => "FAILED_ISO_CONVERSION",
            TransactionStatus::FailedSettlementError => "FAILED_SETTLEMENT_ERROR",
        }
    }

    /// The transfer did not go through; a pending reversal counts
    pub fn is_failure(&self) -> bool {
        matches!(self, TransactionStatus::ReversalPending) || self.as_str().starts_with("FAILED_")
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }

    /// Failure status for a ledger error
    pub fn for_ledger_error(err: &crate::LedgerError) -> Self {
        use crate::LedgerError;
        match err {
            LedgerError::AccountNotFound(_) => TransactionStatus::FailedAccountNotFound,
            LedgerError::AccountNotActive(_) => TransactionStatus::FailedAccountNotActive,
            LedgerError::InsufficientBalance { .. } => TransactionStatus::FailedInsufficientBalance,
            _ => TransactionStatus::FailedDebitError,
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let status = match s {
            "PENDING" => TransactionStatus::Pending,
            "COMPLETED" => TransactionStatus::Completed,
            "PENDING_SETTLEMENT" => TransactionStatus::PendingSettlement,
            "SETTLED" => TransactionStatus::Settled,
            "REVERSAL_PENDING" => TransactionStatus::ReversalPending,
            "FAILED_ACCOUNT_NOT_FOUND" => TransactionStatus::FailedAccountNotFound,
            "FAILED_ACCOUNT_NOT_ACTIVE" => TransactionStatus::FailedAccountNotActive,
            "FAILED_INSUFFICIENT_BALANCE" => TransactionStatus::FailedInsufficientBalance,
            "FAILED_DEBIT_ERROR" => TransactionStatus::FailedDebitError,
            "FAILED_ISO_CONVERSION" => TransactionStatus::FailedIsoConversion,
            "FAILED_SETTLEMENT_ERROR" => TransactionStatus::FailedSettlementError,
            other => return Err(format!("unknown transaction status {}", other)),
        };
        Ok(status)
    }
}

/// Persisted transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Caller-supplied idempotency key
    pub id: String,
    pub source_account: String,
    pub destination_account: String,
    /// Principal in minor units
    pub amount: i64,
    pub fee: i64,
    /// Amount debited from the source (amount + fee)
    pub total: i64,
    pub currency: String,
    /// Per-source monotonic counter; absent for external transfers
    pub counter: Option<i64>,
    pub transaction_type: TransactionType,
    /// Hex authentication tag supplied by the caller
    pub signature: String,
    pub status: TransactionStatus,
    /// Specific cause when status is a failure
    pub failure_reason: Option<String>,
    /// Destination institution for external transfers
    pub destination_bank: Option<String>,
    /// Caller timestamp (unix seconds)
    pub submitted_at: i64,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl TransactionRecord {
    pub fn is_failure(&self) -> bool {
        self.status.is_failure()
    }
}

/// Payment-state trail step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStep {
    Pending,
    Success,
    Failed,
    Reversed,
}

impl PaymentStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStep::Pending => "PENDING",
            PaymentStep::Success => "SUCCESS",
            PaymentStep::Failed => "FAILED",
            PaymentStep::Reversed => "REVERSED",
        }
    }
}

impl FromStr for PaymentStep {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(PaymentStep::Pending),
            "SUCCESS" => Ok(PaymentStep::Success),
            "FAILED" => Ok(PaymentStep::Failed),
            "REVERSED" => Ok(PaymentStep::Reversed),
            other => Err(format!("unknown payment step {}", other)),
        }
    }
}

/// Row of the append-only payment-state log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentState {
    pub transaction_id: String,
    pub step: PaymentStep,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PaymentState {
    pub fn new(transaction_id: impl Into<String>, step: PaymentStep, detail: Option<String>) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            step,
            detail,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            TransactionStatus::Completed,
            TransactionStatus::PendingSettlement,
            TransactionStatus::ReversalPending,
            TransactionStatus::FailedInsufficientBalance,
            TransactionStatus::FailedSettlementError,
        ] {
            assert_eq!(status.as_str().parse::<TransactionStatus>().unwrap(), status);
        }
        assert!("FAILED".parse::<TransactionStatus>().is_err());
    }

    #[test]
    fn test_status_classification() {
        assert!(TransactionStatus::FailedDebitError.is_failure());
        assert!(!TransactionStatus::Completed.is_failure());
        assert!(!TransactionStatus::Pending.is_terminal());
        assert!(TransactionStatus::PendingSettlement.is_terminal());
        assert!(TransactionStatus::ReversalPending.is_failure());
    }

    #[test]
    fn test_status_for_ledger_error() {
        use crate::LedgerError;
        assert_eq!(
            TransactionStatus::for_ledger_error(&LedgerError::AccountNotFound("x".into())),
            TransactionStatus::FailedAccountNotFound
        );
        assert_eq!(
            TransactionStatus::for_ledger_error(&LedgerError::Database("boom".into())),
            TransactionStatus::FailedDebitError
        );
    }

    #[test]
    fn test_leg_signs() {
        assert_eq!(Leg::debit("a", 100).amount, -100);
        assert_eq!(Leg::credit("b", 100).amount, 100);
        assert_eq!(EntryType::for_amount(-1), EntryType::Debit);
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&TransactionStatus::FailedAccountNotActive).unwrap();
        assert_eq!(json, "\"FAILED_ACCOUNT_NOT_ACTIVE\"");
    }
}
