//! Audit sinks.
//!
//! Producers hand events to an [`AuditSink`] and move on: recording never
//! blocks and never fails the caller. Ledger correctness does not depend on
//! an audit event being persisted.

use crate::audit_log::{AuditEvent, AuditEventType, AuditLogger, AuditSeverity};
use crate::masking::mask_account;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Fire-and-forget destination for audit events
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Emits every event as a structured `AUDIT` tracing record
#[derive(Debug, Default, Clone)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Failed to serialize audit event");
                return;
            }
        };
        match event.severity {
            AuditSeverity::Error | AuditSeverity::Critical => {
                error!(target: "audit", event_type = event.event_type.as_str(), "AUDIT: {}", payload)
            }
            AuditSeverity::Warning => {
                warn!(target: "audit", event_type = event.event_type.as_str(), "AUDIT: {}", payload)
            }
            _ => info!(target: "audit", event_type = event.event_type.as_str(), "AUDIT: {}", payload),
        }
    }
}

/// Keeps events in memory; used by tests to assert on the audit trail
#[derive(Debug, Default, Clone)]
pub struct MemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, event_type: AuditEventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events.lock().push(event);
    }
}

/// Forwards events to a background task that appends them to an [`AuditLogger`]
///
/// The queue is bounded: when the writer falls behind, new events are
/// dropped and counted rather than buffered.
#[derive(Debug, Clone)]
pub struct FileAuditSink {
    tx: mpsc::Sender<AuditEvent>,
    dropped: Arc<AtomicU64>,
}

impl FileAuditSink {
    /// Spawn the writer task with room for `capacity` pending events. It
    /// exits once every sender is dropped and the queue is drained.
    pub fn spawn(logger: Arc<AuditLogger>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<AuditEvent>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = logger.log(event).await {
                    error!(error = %e, path = %logger.path().display(), "Audit append failed");
                }
            }
        });
        let sink = Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (sink, handle)
    }

    /// Events discarded because the queue was full or the writer had stopped
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl AuditSink for FileAuditSink {
    fn record(&self, event: AuditEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(event_type = event.event_type.as_str(), "Audit queue full, event dropped");
            }
            Err(TrySendError::Closed(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(event_type = event.event_type.as_str(), "Audit writer stopped, event dropped");
            }
        }
    }
}

/// Sends each event to several sinks
#[derive(Clone, Default)]
pub struct FanoutAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutAuditSink {
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self { sinks }
    }
}

impl AuditSink for FanoutAuditSink {
    fn record(&self, event: AuditEvent) {
        for sink in &self.sinks {
            sink.record(event.clone());
        }
    }
}

/// Convenience front-end producing well-formed, masked events
#[derive(Clone)]
pub struct AuditLog {
    sink: Arc<dyn AuditSink>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog").finish_non_exhaustive()
    }
}

impl AuditLog {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    /// Audit log that only emits tracing records
    pub fn tracing() -> Self {
        Self::new(Arc::new(TracingAuditSink))
    }

    pub fn record(&self, event: AuditEvent) {
        self.sink.record(event);
    }

    /// Terminal outcome of a money movement
    pub fn transfer(&self, transaction_id: &str, account: &str, amount: i64, status: &str) {
        let succeeded = matches!(status, "COMPLETED" | "PENDING_SETTLEMENT" | "SETTLED");
        let (event_type, severity) = if succeeded {
            (AuditEventType::Transfer, AuditSeverity::Info)
        } else {
            (AuditEventType::TransferFailed, AuditSeverity::Warning)
        };
        self.record(
            AuditEvent::new(event_type, severity, status)
                .with_transaction(transaction_id)
                .with_account(mask_account(account))
                .with_amount(amount),
        );
    }

    /// Failure of a named operation
    pub fn error(&self, operation: &str, transaction_id: Option<&str>, err: &dyn std::fmt::Display) {
        let mut event = AuditEvent::new(AuditEventType::Error, AuditSeverity::Error, "FAILED")
            .with_details(json!({ "operation": operation, "error": err.to_string() }));
        if let Some(tx) = transaction_id {
            event = event.with_transaction(tx);
        }
        self.record(event);
    }

    /// Successful administrative or background operation
    pub fn operation(&self, operation: &str, details: serde_json::Value) {
        self.record(
            AuditEvent::new(AuditEventType::Operation, AuditSeverity::Info, "SUCCESS")
                .with_details(json!({ "operation": operation, "details": details })),
        );
    }

    /// Integrity or key-management event
    pub fn security(
        &self,
        event_type: AuditEventType,
        transaction_id: Option<&str>,
        account: Option<&str>,
        details: serde_json::Value,
    ) {
        let severity = match event_type {
            AuditEventType::SignatureMismatch | AuditEventType::DoubleSpend => AuditSeverity::Critical,
            AuditEventType::CryptoFailure | AuditEventType::PinVerificationFailed => AuditSeverity::Error,
            _ => AuditSeverity::Warning,
        };
        let mut event = AuditEvent::new(event_type, severity, event_type.as_str()).with_details(details);
        if let Some(tx) = transaction_id {
            event = event.with_transaction(tx);
        }
        if let Some(account) = account {
            event = event.with_account(mask_account(account));
        }
        self.record(event);
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::tracing()
    }
}
