//! Transaction Engine
//!
//! Validation, posting and hand-off of signed card transactions and
//! outbound interbank transfers.
//!
//! # Request lifecycle
//!
//! 1. **Idempotency**: a known transaction id is answered with its stored
//!    outcome (cache first, durable store on miss or cache failure)
//! 2. **Validation**: structure, freshness window, account state, HMAC
//!    signature, counter monotonicity, balance pre-check
//! 3. **Posting**: one unit of work locks the accounts in id order, re-checks
//!    the counter, posts balanced entries and writes the record
//! 4. **Hand-off**: settlement queueing and notifications run on a bounded
//!    post-commit queue, never on the caller's path
//!
//! # Example
//!
//! ```rust,no_run
//! use transaction_engine::{Collaborators, EngineConfig, TransactionOrchestrator, TransactionRequest};
//!
//! # async fn example(collaborators: Collaborators, request: TransactionRequest) -> transaction_engine::Result<()> {
//! let engine = TransactionOrchestrator::new(&EngineConfig::default(), collaborators)?;
//! let outcome = engine.submit(&request).await?;
//! println!("{} -> {}", outcome.record.id, outcome.record.status);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, missing_debug_implementations, clippy::all)]

pub mod auth_keys;
pub mod cache;
pub mod config;
pub mod enquiry;
pub mod error;
pub mod fees;
pub mod hooks;
pub mod metrics;
pub mod orchestrator;
pub mod settlement;
pub mod signature;
pub mod types;
pub mod validator;

// Re-exports
pub use auth_keys::{AuthKeyProvider, SealedAuthKeys, StaticAuthKeys};
pub use cache::{FastCache, MemoryCache, RedisCache, TransactionCache};
pub use config::{EngineConfig, LogFormat};
pub use enquiry::AccountEnquiry;
pub use error::{ErrorKind, Result, TransactionError};
pub use fees::FeeSchedule;
pub use hooks::{HookDispatcher, HookWorker, NotificationHook, PostCommitHook, PostCommitJob, SettlementQueueHook};
pub use metrics::Metrics;
pub use orchestrator::{Collaborators, TransactionOrchestrator};
pub use settlement::{
    MemorySettlementGateway, QueueSettlementGateway, SettlementGateway, SettlementMessage, SettlementTicket,
};
pub use signature::{sign_record, sign_request, verify_record, verify_request, Attestation};
pub use types::{
    BalanceEnquiry, BatchFailure, BatchResult, BatchSummary, ExternalTransferRequest, NameEnquiry, SubmitOutcome,
    TransactionRequest,
};
pub use validator::{FreshnessPolicy, SubmissionPath, TransactionValidator};
