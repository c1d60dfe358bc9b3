use anyhow::Context;
use hsm::{KeyManager, SoftwareHsm};
use ledger_core::{LedgerStore, PgLedgerStore};
use security::{AuditLog, AuditLogger, AuditSink, FanoutAuditSink, FileAuditSink, TracingAuditSink};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use transaction_engine::{
    Collaborators, EngineConfig, FastCache, HookDispatcher, LogFormat, Metrics, NotificationHook, PostCommitHook,
    QueueSettlementGateway, RedisCache, SealedAuthKeys, SettlementQueueHook, TransactionOrchestrator,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = match std::env::var("ENGINE_CONFIG") {
        Ok(path) => EngineConfig::from_file(&path).with_context(|| format!("loading {}", path))?,
        Err(_) => EngineConfig::from_env().context("loading configuration from environment")?,
    };

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.filter));
    match config.logging.format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }

    info!("Transaction Engine starting...");

    // Audit trail: hash-chained file plus tracing
    let logger = Arc::new(AuditLogger::new(config.audit.clone()).context("opening audit log")?);
    let (file_sink, audit_writer) = FileAuditSink::spawn(logger.clone(), config.limits.audit_queue_capacity);
    let sinks: Vec<Arc<dyn AuditSink>> = vec![Arc::new(file_sink), Arc::new(TracingAuditSink)];
    let audit = AuditLog::new(Arc::new(FanoutAuditSink::new(sinks)));

    // Durable store
    let pg = PgLedgerStore::connect(&config.ledger.database)
        .await
        .context("connecting to database")?;
    if config.ledger.database.run_migrations {
        pg.migrate().await.context("running migrations")?;
    }
    let store: Arc<dyn LedgerStore> = Arc::new(pg);

    // Fast cache
    let cache: Arc<dyn FastCache> = Arc::new(
        RedisCache::connect(&config.redis.url)
            .await
            .context("connecting to redis")?,
    );

    // Key management
    let keys: Arc<dyn KeyManager> =
        Arc::new(SoftwareHsm::open(config.hsm.clone(), audit.clone()).context("opening key store")?);
    info!(keys = keys.list_keys().len(), "Key store loaded");

    let metrics = Arc::new(Metrics::new()?);
    let hooks: Vec<Arc<dyn PostCommitHook>> = vec![
        Arc::new(SettlementQueueHook::new(cache.clone(), audit.clone())),
        Arc::new(NotificationHook),
    ];
    let (dispatcher, worker) = HookDispatcher::new(hooks, config.limits.hook_queue_capacity, metrics.clone());
    let worker = tokio::spawn(worker.run());

    let engine = TransactionOrchestrator::new(
        &config,
        Collaborators {
            store: store.clone(),
            cache: cache.clone(),
            keys: keys.clone(),
            auth_keys: Arc::new(SealedAuthKeys::new(store.clone(), keys.clone())),
            gateway: Arc::new(QueueSettlementGateway::new(cache.clone())?),
            hooks: dispatcher,
            audit: audit.clone(),
            metrics: metrics.clone(),
        },
    )?;

    // Periodic key rotation
    let rotation_keys = keys.clone();
    let mut interval = tokio::time::interval(config.limits.key_rotation_interval());
    let rotation = tokio::spawn(async move {
        loop {
            interval.tick().await;
            match rotation_keys.rotate_keys() {
                Ok(rotated) if !rotated.is_empty() => info!(count = rotated.len(), "Keys rotated"),
                Ok(_) => {}
                Err(e) => error!(error = %e, "Key rotation failed"),
            }
        }
    });

    info!(deadline = ?engine.ledger().deadline(), "Transaction Engine initialized successfully");

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    rotation.abort();
    drop(engine);

    // Queued post-commit jobs get a grace period to drain
    let grace = config.limits.shutdown_grace();
    match tokio::time::timeout(grace, worker).await {
        Ok(Ok(handled)) => info!(handled, "Post-commit queue drained"),
        Ok(Err(e)) => error!(error = %e, "Post-commit worker panicked"),
        Err(_) => warn!(grace_secs = grace.as_secs(), "Post-commit queue not drained in time"),
    }

    drop(keys);
    drop(audit);
    if tokio::time::timeout(grace, audit_writer).await.is_err() {
        warn!("Audit writer did not finish in time");
    }

    info!(metrics = %metrics.encode(), "Transaction Engine stopped");
    Ok(())
}
