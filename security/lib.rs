//! # Security Module
//!
//! Audit trail and identifier masking shared by the key-management core,
//! the ledger and the transaction pipeline.
//!
//! ## Audit Logging
//!
//! ```rust,no_run
//! use security::audit_log::{AuditLogConfig, AuditLogger};
//! use security::sink::{AuditLog, FileAuditSink};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let logger = Arc::new(AuditLogger::new(AuditLogConfig::default())?);
//! let (sink, _writer) = FileAuditSink::spawn(logger.clone(), 1024);
//! let audit = AuditLog::new(Arc::new(sink));
//!
//! audit.transfer("tx-12345", "1234567890", 3000, "COMPLETED");
//!
//! let is_valid = logger.verify_integrity().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Masking
//!
//! Account and card identifiers are reduced to a fixed-length trailing suffix
//! (`******7890`) before reaching any log or audit record.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, clippy::all)]

pub mod audit_log;
pub mod masking;
pub mod sink;

// Re-exports for convenience
pub use audit_log::{
    AuditError, AuditEvent, AuditEventType, AuditFilter, AuditLogConfig, AuditLogger, AuditSeverity,
};
pub use masking::mask_account;
pub use sink::{AuditLog, AuditSink, FanoutAuditSink, FileAuditSink, MemoryAuditSink, TracingAuditSink};
