//! Metrics collection for observability
//!
//! Prometheus metrics for the transaction pipeline. Each [`Metrics`] owns its
//! registry, so several instances can coexist in one process.
//!
//! # Metrics
//!
//! - `transactions_total{status}` - Terminal outcomes by status
//! - `transactions_rejected_total{kind}` - Requests rejected before posting
//! - `transfer_duration_seconds` - Submission latency
//! - `idempotent_replays_total` - Submissions answered from a stored outcome
//! - `lock_conflicts_total` - Optimistic lock conflicts surfaced to callers
//! - `batch_size` - Histogram of batch sizes
//! - `post_commit_jobs_dropped_total` / `post_commit_hook_failures_total`
//! - `cache_{hits,misses,errors}_total`

use crate::error::{ErrorKind, Result};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Terminal outcomes by status
    pub transactions_total: IntCounterVec,

    /// Rejections by error kind
    pub rejected_total: IntCounterVec,

    /// Submission latency
    pub transfer_duration: Histogram,

    pub idempotent_replays: IntCounter,

    pub lock_conflicts: IntCounter,

    pub batch_size: Histogram,

    /// Post-commit jobs refused because the queue was full
    pub jobs_dropped: IntCounter,

    pub hook_failures: IntCounter,

    pub cache_hits: IntCounter,
    pub cache_misses: IntCounter,
    pub cache_errors: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let transactions_total = IntCounterVec::new(
            Opts::new("transactions_total", "Terminal transaction outcomes by status"),
            &["status"],
        )?;
        registry.register(Box::new(transactions_total.clone()))?;

        let rejected_total = IntCounterVec::new(
            Opts::new("transactions_rejected_total", "Requests rejected before posting"),
            &["kind"],
        )?;
        registry.register(Box::new(rejected_total.clone()))?;

        let transfer_duration = Histogram::with_opts(
            HistogramOpts::new("transfer_duration_seconds", "Histogram of submission latencies")
                .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 5.0]),
        )?;
        registry.register(Box::new(transfer_duration.clone()))?;

        let idempotent_replays = IntCounter::new(
            "idempotent_replays_total",
            "Submissions answered from a stored outcome",
        )?;
        registry.register(Box::new(idempotent_replays.clone()))?;

        let lock_conflicts = IntCounter::new("lock_conflicts_total", "Optimistic lock conflicts")?;
        registry.register(Box::new(lock_conflicts.clone()))?;

        let batch_size = Histogram::with_opts(
            HistogramOpts::new("batch_size", "Histogram of batch sizes")
                .buckets(vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0]),
        )?;
        registry.register(Box::new(batch_size.clone()))?;

        let jobs_dropped = IntCounter::new(
            "post_commit_jobs_dropped_total",
            "Post-commit jobs refused by a full queue",
        )?;
        registry.register(Box::new(jobs_dropped.clone()))?;

        let hook_failures = IntCounter::new("post_commit_hook_failures_total", "Failed post-commit hook runs")?;
        registry.register(Box::new(hook_failures.clone()))?;

        let cache_hits = IntCounter::new("cache_hits_total", "Outcome cache hits")?;
        registry.register(Box::new(cache_hits.clone()))?;
        let cache_misses = IntCounter::new("cache_misses_total", "Outcome cache misses")?;
        registry.register(Box::new(cache_misses.clone()))?;
        let cache_errors = IntCounter::new("cache_errors_total", "Failed cache calls")?;
        registry.register(Box::new(cache_errors.clone()))?;

        Ok(Self {
            transactions_total,
            rejected_total,
            transfer_duration,
            idempotent_replays,
            lock_conflicts,
            batch_size,
            jobs_dropped,
            hook_failures,
            cache_hits,
            cache_misses,
            cache_errors,
            registry,
        })
    }

    /// Record a terminal status
    pub fn record_outcome(&self, status: &str) {
        self.transactions_total.with_label_values(&[status]).inc();
    }

    /// Record a rejection before posting
    pub fn record_rejection(&self, kind: ErrorKind) {
        let label = match kind {
            ErrorKind::Validation => "validation",
            ErrorKind::Concurrency => "concurrency",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Infrastructure => "infrastructure",
            ErrorKind::Cryptographic => "cryptographic",
        };
        self.rejected_total.with_label_values(&[label]).inc();
        if kind == ErrorKind::Concurrency {
            self.lock_conflicts.inc();
        }
    }

    /// Prometheus text exposition of every metric
    pub fn encode(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
