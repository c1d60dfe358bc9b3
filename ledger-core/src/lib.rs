//! Ledger Core
//!
//! Double-entry account ledger with versioned balances.
//!
//! # Architecture
//!
//! - **Unit of work**: every posting, its transaction record and its payment
//!   states commit together or not at all
//! - **Ordered row locks**: accounts are locked in ascending id order, so
//!   opposite-direction transfers on the same pair never deadlock
//! - **Versioned balances**: balance updates are conditioned on the version
//!   read under the lock and report a tagged [`VersionedUpdate`]
//! - **Pluggable store**: PostgreSQL in production, an in-memory store with
//!   the same locking semantics for tests
//!
//! # Invariants
//!
//! - Σ(entry amounts) == 0 for every transaction id
//! - No committed balance is ever negative
//! - An account's version increments exactly once per balance mutation
//! - Transaction ids and `(source, counter)` pairs are unique

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, missing_debug_implementations, clippy::all)]

pub mod config;
pub mod error;
pub mod ledger;
pub mod memory;
pub mod postgres;
pub mod store;
pub mod types;

// Re-exports
pub use config::{DatabaseConfig, LedgerConfig};
pub use error::{LedgerError, Result};
pub use ledger::{transfer_legs, LedgerEngine};
pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;
pub use store::{LedgerStore, UnitOfWork};
pub use types::{
    Account, AccountStatus, BalanceChange, EntryType, LedgerEntry, Leg, PaymentState, PaymentStep,
    PostingReceipt, TransactionRecord, TransactionStatus, TransactionType, VersionedUpdate,
};
