//! Fast key-value cache
//!
//! Holds transaction outcomes for idempotent replay, the last counter seen
//! per source account, and the settlement hand-off queues. The cache is an
//! accelerator only: every decision it feeds is re-checked against the
//! durable store.

use crate::error::Result;
use crate::metrics::Metrics;
use async_trait::async_trait;
use dashmap::DashMap;
use ledger_core::TransactionRecord;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Cache key prefixes and queue names
pub mod keys {
    pub const IDEMPOTENCY: &str = "idempotency";
    pub const COUNTER: &str = "counter";
    pub const SETTLEMENT_QUEUE: &str = "settlement_queue";
    pub const SETTLEMENT_OUTBOUND: &str = "settlement_outbound";

    pub fn idempotency(transaction_id: &str) -> String {
        format!("{}:{}", IDEMPOTENCY, transaction_id)
    }

    pub fn counter(account_id: &str) -> String {
        format!("{}:{}", COUNTER, account_id)
    }
}

/// Minimal cache capability
#[async_trait]
pub trait FastCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;

    /// Append to the tail of a list
    async fn push(&self, queue: &str, value: &str) -> Result<()>;
}

/// Redis-backed cache
#[derive(Clone)]
pub struct RedisCache {
    redis: ConnectionManager,
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache").finish_non_exhaustive()
    }
}

impl RedisCache {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self::new(redis))
    }
}

#[async_trait]
impl FastCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.redis.clone().get::<_, Option<String>>(key).await?)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let _: () = self.redis.clone().set_ex(key, value, ttl_secs).await?;
        Ok(())
    }

    async fn push(&self, queue: &str, value: &str) -> Result<()> {
        let _: () = self.redis.clone().rpush(queue, value).await?;
        Ok(())
    }
}

/// Process-local cache with expiring entries
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, (String, Instant)>,
    queues: DashMap<String, Vec<String>>,
    unavailable: AtomicBool,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail, as if the server went away
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Snapshot of a queue's contents
    pub fn queue(&self, name: &str) -> Vec<String> {
        self.queues.get(name).map(|q| q.clone()).unwrap_or_default()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(crate::error::TransactionError::Cache("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl FastCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_available()?;
        let now = Instant::now();
        let value = match self.entries.get(key) {
            Some(entry) if entry.1 > now => Some(entry.0.clone()),
            Some(_) => None,
            None => return Ok(None),
        };
        if value.is_none() {
            self.entries.remove(key);
        }
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        self.check_available()?;
        let expires = Instant::now() + Duration::from_secs(ttl_secs);
        self.entries.insert(key.to_string(), (value.to_string(), expires));
        Ok(())
    }

    async fn push(&self, queue: &str, value: &str) -> Result<()> {
        self.check_available()?;
        self.queues.entry(queue.to_string()).or_default().push(value.to_string());
        Ok(())
    }
}

/// Outcome and counter caching on top of a [`FastCache`]
///
/// Reads degrade to "miss" when the cache fails; writes are best effort.
#[derive(Clone)]
pub struct TransactionCache {
    cache: Arc<dyn FastCache>,
    outcome_ttl_secs: u64,
    counter_ttl_secs: u64,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for TransactionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCache")
            .field("outcome_ttl_secs", &self.outcome_ttl_secs)
            .field("counter_ttl_secs", &self.counter_ttl_secs)
            .finish_non_exhaustive()
    }
}

impl TransactionCache {
    pub fn new(cache: Arc<dyn FastCache>, outcome_ttl_secs: u64, counter_ttl_secs: u64, metrics: Arc<Metrics>) -> Self {
        Self {
            cache,
            outcome_ttl_secs,
            counter_ttl_secs,
            metrics,
        }
    }

    pub fn inner(&self) -> &Arc<dyn FastCache> {
        &self.cache
    }

    /// Previously recorded outcome for `transaction_id`
    pub async fn outcome(&self, transaction_id: &str) -> Option<TransactionRecord> {
        match self.cache.get(&keys::idempotency(transaction_id)).await {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(record) => {
                    self.metrics.cache_hits.inc();
                    Some(record)
                }
                Err(e) => {
                    warn!(transaction_id, error = %e, "Discarding undecodable cached outcome");
                    self.metrics.cache_misses.inc();
                    None
                }
            },
            Ok(None) => {
                self.metrics.cache_misses.inc();
                None
            }
            Err(e) => {
                warn!(transaction_id, error = %e, "Cache unavailable, falling back to store");
                self.metrics.cache_errors.inc();
                None
            }
        }
    }

    /// Cache a terminal outcome, and the counter it consumed
    pub async fn remember(&self, record: &TransactionRecord) {
        let json = match serde_json::to_string(record) {
            Ok(json) => json,
            Err(e) => {
                warn!(transaction_id = %record.id, error = %e, "Failed to serialise outcome");
                return;
            }
        };
        if let Err(e) = self
            .cache
            .set_ex(&keys::idempotency(&record.id), &json, self.outcome_ttl_secs)
            .await
        {
            warn!(transaction_id = %record.id, error = %e, "Failed to cache outcome");
            self.metrics.cache_errors.inc();
            return;
        }

        if let Some(counter) = record.counter {
            let key = keys::counter(&record.source_account);
            if let Err(e) = self.cache.set_ex(&key, &counter.to_string(), self.counter_ttl_secs).await {
                warn!(transaction_id = %record.id, error = %e, "Failed to cache counter");
                self.metrics.cache_errors.inc();
            }
        }
        debug!(transaction_id = %record.id, "Outcome cached");
    }

    /// Highest counter recently committed for `account_id`, if cached
    pub async fn last_counter(&self, account_id: &str) -> Option<i64> {
        match self.cache.get(&keys::counter(account_id)).await {
            Ok(Some(value)) => value.parse().ok(),
            Ok(None) => None,
            Err(e) => {
                debug!(error = %e, "Counter cache unavailable");
                self.metrics.cache_errors.inc();
                None
            }
        }
    }
}
