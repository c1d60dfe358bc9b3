//! PostgreSQL ledger store

use crate::config::DatabaseConfig;
use crate::store::{LedgerStore, UnitOfWork};
use crate::types::{
    Account, LedgerEntry, PaymentState, TransactionRecord, TransactionStatus, VersionedUpdate,
};
use crate::{LedgerError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, PgConnection, Postgres, Transaction};
use std::time::Duration;
use tracing::{debug, info};

const TRANSACTION_COLUMNS: &str = r#"
    id, source_account, destination_account, amount, fee, total, currency, counter,
    transaction_type, signature, status, failure_reason, destination_bank,
    submitted_at, created_at, processed_at, settled_at
"#;

/// Connection-pooled PostgreSQL store
#[derive(Debug, Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    /// Connect a pool using the configured limits
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.url)
            .await?;

        info!(max_connections = config.max_connections, "Database pool connected");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply embedded schema migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Ledger migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(FromRow)]
struct AccountRow {
    id: String,
    owner_id: String,
    name: String,
    balance: i64,
    version: i64,
    status: String,
    currency: String,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AccountRow> for Account {
    type Error = LedgerError;

    fn try_from(row: AccountRow) -> Result<Self> {
        Ok(Account {
            status: row.status.parse().map_err(LedgerError::Database)?,
            id: row.id,
            owner_id: row.owner_id,
            name: row.name,
            balance: row.balance,
            version: row.version,
            currency: row.currency,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct EntryRow {
    transaction_id: String,
    account_id: String,
    amount: i64,
    entry_type: String,
    balance_after: i64,
    created_at: DateTime<Utc>,
}

impl TryFrom<EntryRow> for LedgerEntry {
    type Error = LedgerError;

    fn try_from(row: EntryRow) -> Result<Self> {
        Ok(LedgerEntry {
            entry_type: row.entry_type.parse().map_err(LedgerError::Database)?,
            transaction_id: row.transaction_id,
            account_id: row.account_id,
            amount: row.amount,
            balance_after: row.balance_after,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct TransactionRow {
    id: String,
    source_account: String,
    destination_account: String,
    amount: i64,
    fee: i64,
    total: i64,
    currency: String,
    counter: Option<i64>,
    transaction_type: String,
    signature: String,
    status: String,
    failure_reason: Option<String>,
    destination_bank: Option<String>,
    submitted_at: i64,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    settled_at: Option<DateTime<Utc>>,
}

impl TryFrom<TransactionRow> for TransactionRecord {
    type Error = LedgerError;

    fn try_from(row: TransactionRow) -> Result<Self> {
        Ok(TransactionRecord {
            transaction_type: row.transaction_type.parse().map_err(LedgerError::Database)?,
            status: row.status.parse().map_err(LedgerError::Database)?,
            id: row.id,
            source_account: row.source_account,
            destination_account: row.destination_account,
            amount: row.amount,
            fee: row.fee,
            total: row.total,
            currency: row.currency,
            counter: row.counter,
            signature: row.signature,
            failure_reason: row.failure_reason,
            destination_bank: row.destination_bank,
            submitted_at: row.submitted_at,
            created_at: row.created_at,
            processed_at: row.processed_at,
            settled_at: row.settled_at,
        })
    }
}

#[derive(FromRow)]
struct PaymentStateRow {
    transaction_id: String,
    step: String,
    detail: Option<String>,
    created_at: DateTime<Utc>,
}

fn collect<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = LedgerError>,
{
    rows.into_iter().map(T::try_from).collect()
}

// Shared by the pool and by open transactions.

async fn fetch_transaction(conn: &mut PgConnection, id: &str) -> Result<Option<TransactionRecord>> {
    let query = format!("SELECT {} FROM transactions WHERE id = $1", TRANSACTION_COLUMNS);
    sqlx::query_as::<_, TransactionRow>(&query)
        .bind(id)
        .fetch_optional(conn)
        .await?
        .map(TransactionRecord::try_from)
        .transpose()
}

async fn fetch_counter_used(conn: &mut PgConnection, source: &str, counter: i64) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM transactions WHERE source_account = $1 AND counter = $2)",
    )
    .bind(source)
    .bind(counter)
    .fetch_one(conn)
    .await?;
    Ok(exists)
}

async fn fetch_max_counter(conn: &mut PgConnection, source: &str) -> Result<Option<i64>> {
    let max: Option<i64> = sqlx::query_scalar("SELECT MAX(counter) FROM transactions WHERE source_account = $1")
        .bind(source)
        .fetch_one(conn)
        .await?;
    Ok(max)
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgUnitOfWork { tx }))
    }

    async fn create_account(&self, account: &Account) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO accounts (id, owner_id, name, balance, version, status, currency, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&account.id)
        .bind(&account.owner_id)
        .bind(&account.name)
        .bind(account.balance)
        .bind(account.version)
        .bind(account.status.as_str())
        .bind(&account.currency)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_account(&self, id: &str) -> Result<Option<Account>> {
        sqlx::query_as::<_, AccountRow>(
            "SELECT id, owner_id, name, balance, version, status, currency, updated_at FROM accounts WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(Account::try_from)
        .transpose()
    }

    async fn entries_for_transaction(&self, transaction_id: &str) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query_as::<_, EntryRow>(
            r#"
            SELECT transaction_id, account_id, amount, entry_type, balance_after, created_at
            FROM ledger_entries WHERE transaction_id = $1 ORDER BY id
            "#,
        )
        .bind(transaction_id)
        .fetch_all(&self.pool)
        .await?;
        collect(rows)
    }

    async fn entries_for_account(&self, account_id: &str, limit: usize) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query_as::<_, EntryRow>(
            r#"
            SELECT transaction_id, account_id, amount, entry_type, balance_after, created_at
            FROM ledger_entries WHERE account_id = $1 ORDER BY id DESC LIMIT $2
            "#,
        )
        .bind(account_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        collect(rows)
    }

    async fn get_transaction(&self, id: &str) -> Result<Option<TransactionRecord>> {
        let mut conn = self.pool.acquire().await?;
        fetch_transaction(&mut conn, id).await
    }

    async fn recent_transactions(&self, account_id: &str, limit: usize) -> Result<Vec<TransactionRecord>> {
        let query = format!(
            "SELECT {} FROM transactions WHERE source_account = $1 OR destination_account = $1 ORDER BY seq DESC LIMIT $2",
            TRANSACTION_COLUMNS
        );
        let rows = sqlx::query_as::<_, TransactionRow>(&query)
            .bind(account_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        collect(rows)
    }

    async fn counter_used(&self, source_account: &str, counter: i64) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        fetch_counter_used(&mut conn, source_account, counter).await
    }

    async fn max_counter(&self, source_account: &str) -> Result<Option<i64>> {
        let mut conn = self.pool.acquire().await?;
        fetch_max_counter(&mut conn, source_account).await
    }

    async fn payment_states(&self, transaction_id: &str) -> Result<Vec<PaymentState>> {
        let rows = sqlx::query_as::<_, PaymentStateRow>(
            "SELECT transaction_id, step, detail, created_at FROM payment_states WHERE transaction_id = $1 ORDER BY id",
        )
        .bind(transaction_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(PaymentState {
                    step: row.step.parse().map_err(LedgerError::Database)?,
                    transaction_id: row.transaction_id,
                    detail: row.detail,
                    created_at: row.created_at,
                })
            })
            .collect()
    }

    async fn auth_key(&self, account_id: &str) -> Result<Option<Vec<u8>>> {
        let key: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT sealed_key FROM account_auth_keys WHERE account_id = $1")
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(key)
    }

    async fn store_auth_key(&self, account_id: &str, sealed_key: &[u8]) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO account_auth_keys (account_id, sealed_key, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (account_id) DO UPDATE SET sealed_key = EXCLUDED.sealed_key, updated_at = NOW()
            "#,
        )
        .bind(account_id)
        .bind(sealed_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Open PostgreSQL transaction
struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn lock_account(&mut self, id: &str) -> Result<Option<Account>> {
        sqlx::query_as::<_, AccountRow>(
            r#"
            SELECT id, owner_id, name, balance, version, status, currency, updated_at
            FROM accounts WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?
        .map(Account::try_from)
        .transpose()
    }

    async fn insert_entry(&mut self, entry: &LedgerEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_entries (transaction_id, account_id, amount, entry_type, balance_after, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&entry.transaction_id)
        .bind(&entry.account_id)
        .bind(entry.amount)
        .bind(entry.entry_type.as_str())
        .bind(entry.balance_after)
        .bind(entry.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn update_balance(&mut self, id: &str, new_balance: i64, expected_version: i64) -> Result<VersionedUpdate> {
        let new_version: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE accounts
            SET balance = $1, version = version + 1, updated_at = NOW()
            WHERE id = $2 AND version = $3
            RETURNING version
            "#,
        )
        .bind(new_balance)
        .bind(id)
        .bind(expected_version)
        .fetch_optional(&mut *self.tx)
        .await?;

        if let Some(new_version) = new_version {
            return Ok(VersionedUpdate::Applied { new_version });
        }

        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM accounts WHERE id = $1)")
            .bind(id)
            .fetch_one(&mut *self.tx)
            .await?;
        debug!(exists, expected_version, "Conditioned balance update matched no row");
        Ok(if exists {
            VersionedUpdate::Conflict
        } else {
            VersionedUpdate::NotFound
        })
    }

    async fn insert_transaction(&mut self, record: &TransactionRecord) -> Result<()> {
        let query = format!(
            "INSERT INTO transactions ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)",
            TRANSACTION_COLUMNS
        );
        sqlx::query(&query)
            .bind(&record.id)
            .bind(&record.source_account)
            .bind(&record.destination_account)
            .bind(record.amount)
            .bind(record.fee)
            .bind(record.total)
            .bind(&record.currency)
            .bind(record.counter)
            .bind(record.transaction_type.as_str())
            .bind(&record.signature)
            .bind(record.status.as_str())
            .bind(&record.failure_reason)
            .bind(&record.destination_bank)
            .bind(record.submitted_at)
            .bind(record.created_at)
            .bind(record.processed_at)
            .bind(record.settled_at)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn update_transaction_status(
        &mut self,
        id: &str,
        status: TransactionStatus,
        failure_reason: Option<&str>,
        settled_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE transactions
            SET status = $1, failure_reason = $2, settled_at = COALESCE($3, settled_at)
            WHERE id = $4
            "#,
        )
        .bind(status.as_str())
        .bind(failure_reason)
        .bind(settled_at)
        .bind(id)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::Database(format!("transaction {} not found", id)));
        }
        Ok(())
    }

    async fn get_transaction(&mut self, id: &str) -> Result<Option<TransactionRecord>> {
        fetch_transaction(&mut self.tx, id).await
    }

    async fn counter_used(&mut self, source_account: &str, counter: i64) -> Result<bool> {
        fetch_counter_used(&mut self.tx, source_account, counter).await
    }

    async fn max_counter(&mut self, source_account: &str) -> Result<Option<i64>> {
        fetch_max_counter(&mut self.tx, source_account).await
    }

    async fn append_payment_state(&mut self, state: &PaymentState) -> Result<()> {
        sqlx::query(
            "INSERT INTO payment_states (transaction_id, step, detail, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(&state.transaction_id)
        .bind(state.step.as_str())
        .bind(&state.detail)
        .bind(state.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let this = *self;
        this.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let this = *self;
        this.tx.rollback().await?;
        Ok(())
    }
}
