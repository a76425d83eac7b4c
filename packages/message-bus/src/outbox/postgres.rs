//! PostgreSQL outbox repository (feature `postgres`).
//!
//! Writes go through a caller-controlled transaction: `begin`, do business
//! writes on [`PgOutboxRepository::transaction`], `register` messages, then
//! `commit` or `rollback`.
//!
//! Draining claims rows with `FOR UPDATE SKIP LOCKED` and stamps a lease
//! (`locked_by`, `locked_until`) so that a claimed row stays invisible to other
//! workers after the claiming statement commits. A worker that crashes leaves
//! its lease to expire; the row is then claimed again.
//!
//! # Example
//!
//! ```ignore
//! let repo = PgOutboxRepository::connect(&PollerConfig::from_env()?).await?;
//!
//! repo.begin().await?;
//! {
//!     let mut tx = repo.transaction().await?;
//!     sqlx::query("INSERT INTO orders (id) VALUES ($1)")
//!         .bind(order_id)
//!         .execute(&mut **tx)
//!         .await?;
//! }
//! bus.register(&repo, &AnyMessage::event(OrderPlaced { order_id })).await?;
//! repo.commit().await?;
//! ```

use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

use super::{EnvelopeType, OutboxModel, OutboxRecord, OutboxRepository};
use crate::config::PollerConfig;
use crate::error::BusError;

const DEFAULT_BATCH_SIZE: i64 = 100;

/// Run the bundled migrations (creates `message_outbox`).
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("Failed to run outbox migrations")?;
    Ok(())
}

#[derive(Debug, FromRow)]
struct OutboxRow {
    id: Uuid,
    envelope_type: String,
    message_type: String,
    message: serde_json::Value,
    metadata: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl TryFrom<OutboxRow> for OutboxRecord {
    type Error = anyhow::Error;

    fn try_from(row: OutboxRow) -> Result<Self> {
        Ok(OutboxRecord::restore(
            row.id,
            row.envelope_type.parse::<EnvelopeType>()?,
            row.message_type,
            row.message,
            row.metadata,
            row.created_at,
            row.processed_at,
        ))
    }
}

/// sqlx-backed [`OutboxRepository`].
pub struct PgOutboxRepository {
    pool: PgPool,
    tx: Mutex<Option<Transaction<'static, Postgres>>>,
    worker_id: String,
    lease: Duration,
    batch_size: i64,
}

impl PgOutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self::from_config(pool, &PollerConfig::default())
    }

    /// Build a repository whose lease comes from `MESSAGE_BUS_LEASE_MS`.
    pub fn from_config(pool: PgPool, config: &PollerConfig) -> Self {
        Self {
            pool,
            tx: Mutex::new(None),
            worker_id: format!("worker-{}", Uuid::new_v4()),
            lease: config.lease,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Connect to `DATABASE_URL` and apply the configured lease.
    pub async fn connect(config: &PollerConfig) -> Result<Self> {
        let pool = PgPool::connect(config.require_database_url()?)
            .await
            .context("Failed to connect to outbox database")?;
        Ok(Self::from_config(pool, config))
    }

    /// How long a claimed row stays invisible to other workers.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// Maximum rows claimed by one `list_unprocessed` call.
    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Open the transaction that `add` writes into.
    pub async fn begin(&self) -> Result<()> {
        let mut guard = self.tx.lock().await;
        if guard.is_some() {
            return Err(anyhow!("outbox transaction already open"));
        }
        *guard = Some(self.pool.begin().await?);
        Ok(())
    }

    /// Borrow the open transaction for business writes.
    ///
    /// The guard holds the lock that `add` takes, so drop it before calling
    /// `register` on this repository or the call never completes.
    pub async fn transaction(
        &self,
    ) -> Result<MappedMutexGuard<'_, Transaction<'static, Postgres>>, BusError> {
        MutexGuard::try_map(self.tx.lock().await, |tx| tx.as_mut())
            .map_err(|_| BusError::MissingTransaction)
    }

    pub async fn commit(&self) -> Result<()> {
        let tx = self.tx.lock().await.take().ok_or(BusError::MissingTransaction)?;
        tx.commit().await?;
        debug!("outbox transaction committed");
        Ok(())
    }

    pub async fn rollback(&self) -> Result<()> {
        let tx = self.tx.lock().await.take().ok_or(BusError::MissingTransaction)?;
        tx.rollback().await?;
        debug!("outbox transaction rolled back");
        Ok(())
    }

    /// Delete processed records older than `cutoff`.
    pub async fn purge_processed(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM message_outbox
            WHERE processed_at IS NOT NULL
              AND processed_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

impl std::fmt::Debug for PgOutboxRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgOutboxRepository")
            .field("worker_id", &self.worker_id)
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl OutboxRepository for PgOutboxRepository {
    async fn add(&self, record: OutboxRecord) -> Result<()> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or(BusError::MissingTransaction)?;

        sqlx::query(
            r#"
            INSERT INTO message_outbox
                (id, envelope_type, message_type, message, metadata, created_at, processed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(record.id())
        .bind(record.envelope_type().as_str())
        .bind(record.message_type())
        .bind(record.message())
        .bind(record.metadata())
        .bind(record.created_at())
        .bind(record.processed_at())
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Claim unprocessed records using FOR UPDATE SKIP LOCKED.
    /// Also reclaims records whose lease expired.
    async fn list_unprocessed(&self) -> Result<Vec<OutboxRecord>> {
        let rows = sqlx::query_as::<_, OutboxRow>(
            r#"
            WITH next_records AS (
                SELECT id
                FROM message_outbox
                WHERE processed_at IS NULL
                  AND (locked_until IS NULL OR locked_until < NOW())
                ORDER BY created_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE message_outbox
            SET
                locked_by = $2,
                locked_until = NOW() + $3 * INTERVAL '1 millisecond'
            WHERE id IN (SELECT id FROM next_records)
            RETURNING id, envelope_type, message_type, message, metadata, created_at, processed_at
            "#,
        )
        .bind(self.batch_size)
        .bind(&self.worker_id)
        .bind(i64::try_from(self.lease.as_millis()).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let mut records = rows
            .into_iter()
            .map(OutboxRecord::try_from)
            .collect::<Result<Vec<_>>>()?;
        // RETURNING does not preserve the CTE's order
        records.sort_by_key(|record| record.created_at());

        debug!(worker_id = %self.worker_id, count = records.len(), "outbox records claimed");
        Ok(records)
    }

    async fn update_processed(
        &self,
        record: &OutboxRecord,
        processed_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE message_outbox
            SET processed_at = $1,
                locked_by = NULL,
                locked_until = NULL
            WHERE id = $2
              AND processed_at IS NULL
              AND (locked_by = $3 OR locked_by IS NULL)
            "#,
        )
        .bind(processed_at)
        .bind(record.id())
        .bind(&self.worker_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let current = sqlx::query_as::<_, (Option<DateTime<Utc>>, Option<String>)>(
                "SELECT processed_at, locked_by FROM message_outbox WHERE id = $1",
            )
            .bind(record.id())
            .fetch_optional(&self.pool)
            .await?;
            return match current {
                Some((Some(_), _)) => Err(BusError::AlreadyProcessed { id: record.id() }.into()),
                Some((None, Some(owner))) => Err(anyhow!(
                    "outbox record {} is claimed by worker {}",
                    record.id(),
                    owner
                )),
                Some((None, None)) => Err(anyhow!("outbox record {} could not be updated", record.id())),
                None => Err(anyhow!("outbox record {} not found", record.id())),
            };
        }

        Ok(())
    }

    async fn release(&self, record: &OutboxRecord) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE message_outbox
            SET locked_by = NULL,
                locked_until = NULL
            WHERE id = $1
              AND locked_by = $2
              AND processed_at IS NULL
            "#,
        )
        .bind(record.id())
        .bind(&self.worker_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn model(&self) -> OutboxModel {
        OutboxModel::default()
    }
}
