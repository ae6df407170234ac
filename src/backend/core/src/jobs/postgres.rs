//! PostgreSQL provider.
//!
//! Jobs live in one table; claiming uses `FOR UPDATE SKIP LOCKED` so any
//! number of runners across processes and hosts can pop from the same queue
//! without handing out a job twice. State changes are applied through the
//! [`JobRecord`] transitions inside a transaction holding the row lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use std::sync::Arc;
use tracing::instrument;

use super::clock::{Clock, SystemClock};
use super::provider::{Provider, ProviderSettings, QueueStats};
use super::record::{Claim, JobFailure, JobLogEntry, JobRecord, NewJob};
use super::{JobId, JobStatus};
use crate::config::ConnectionConfig;
use crate::db::Database;
use crate::error::{ErrorCode, QueueError, Result};

/// Provider persisting jobs in a PostgreSQL table.
#[derive(Clone)]
pub struct PostgresProvider {
    name: String,
    settings: ProviderSettings,
    db: Database,
    table: String,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for PostgresProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresProvider")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("settings", &self.settings)
            .finish()
    }
}

impl PostgresProvider {
    /// Create a provider over an existing pool.
    ///
    /// `table` must be a plain SQL identifier; it is interpolated into every
    /// statement.
    pub fn new(name: impl Into<String>, db: Database, table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        validate_identifier(&table)?;

        Ok(Self {
            name: name.into(),
            settings: ProviderSettings::default(),
            db,
            table,
            clock: Arc::new(SystemClock),
        })
    }

    /// Connect using a postgres connection config.
    pub async fn connect(name: impl Into<String>, connection: &ConnectionConfig) -> Result<Self> {
        let name = name.into();
        let db = Database::connect(connection).await?;
        tracing::info!(provider = %name, table = %connection.table, "Connected to queue database");

        Ok(Self::new(name, db, connection.table.clone())?.with_settings(connection.settings()))
    }

    pub fn with_settings(mut self, settings: ProviderSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Row helpers
    // ─────────────────────────────────────────────────────────────────────────

    /// Lock one row for the rest of the transaction.
    async fn lock_row(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: JobId,
    ) -> Result<JobRecord> {
        let row = sqlx::query(&format!("SELECT * FROM {} WHERE id = $1 FOR UPDATE", self.table))
            .bind(id.0)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| QueueError::job_not_found(id))?;

        record_from_row(&row)
    }

    /// Write back every mutable column of a record.
    async fn save(&self, tx: &mut Transaction<'_, Postgres>, record: &JobRecord) -> Result<()> {
        sqlx::query(&format!(
            r#"
            UPDATE {}
            SET status = $2, attempts = $3, available_at = $4, lock_until = $5,
                claim_token = $6, started_at = $7, finished_at = $8, failure = $9, log = $10
            WHERE id = $1
            "#,
            self.table
        ))
        .bind(record.id.0)
        .bind(record.status.as_str())
        .bind(record.attempts as i32)
        .bind(record.available_at)
        .bind(record.lock_until)
        .bind(record.claim_token)
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(record.failure.as_ref().map(Json))
        .bind(Json(&record.log))
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Claim up to `limit` eligible rows in one transaction.
    #[instrument(skip(self), fields(provider = %self.name))]
    async fn claim(&self, queue: &str, limit: usize) -> Result<Vec<JobRecord>> {
        let now = self.clock.now();
        let mut tx = self.db.pool().begin().await?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT * FROM {}
            WHERE queue = $1
              AND ((status = 'pending' AND available_at <= $2)
                OR (status = 'processing' AND (lock_until IS NULL OR lock_until <= $2)))
            ORDER BY sequence
            LIMIT $3
            FOR UPDATE SKIP LOCKED
            "#,
            self.table
        ))
        .bind(queue)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut record = record_from_row(row)?;
            if !record.is_eligible(now) {
                continue;
            }
            record.mark_claimed(now, self.settings.lock_timeout);
            self.save(&mut tx, &record).await?;
            claimed.push(record);
        }

        tx.commit().await?;
        Ok(claimed)
    }
}

#[async_trait]
impl Provider for PostgresProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    async fn register(&self) -> Result<()> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id UUID PRIMARY KEY,
                sequence BIGSERIAL NOT NULL,
                queue TEXT NOT NULL,
                job_type TEXT NOT NULL,
                payload JSONB NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                available_at TIMESTAMPTZ NOT NULL,
                lock_until TIMESTAMPTZ,
                claim_token UUID,
                started_at TIMESTAMPTZ,
                finished_at TIMESTAMPTZ,
                failure JSONB,
                log JSONB NOT NULL DEFAULT '[]'::jsonb,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            self.table
        ))
        .execute(self.db.pool())
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {table}_claim_idx ON {table} (queue, status, sequence)",
            table = self.table
        ))
        .execute(self.db.pool())
        .await?;

        tracing::info!(provider = %self.name, table = %self.table, "Queue table ready");
        Ok(())
    }

    async fn push(&self, job: NewJob) -> Result<JobId> {
        if job.queue.is_empty() {
            return Err(QueueError::enqueue_failed("", "queue name must not be empty"));
        }

        let now = self.clock.now();
        let record = JobRecord::pending(JobId::new(), 0, job, now);

        sqlx::query(&format!(
            r#"
            INSERT INTO {} (id, queue, job_type, payload, status, attempts, available_at, log, created_at)
            VALUES ($1, $2, $3, $4, $5, 0, $6, $7, $8)
            "#,
            self.table
        ))
        .bind(record.id.0)
        .bind(&record.queue)
        .bind(&record.job_type)
        .bind(&record.payload)
        .bind(record.status.as_str())
        .bind(record.available_at)
        .bind(Json(&record.log))
        .bind(record.created_at)
        .execute(self.db.pool())
        .await
        .map_err(|e| {
            QueueError::enqueue_failed(&record.queue, e.to_string()).with_source(e)
        })?;

        tracing::debug!(
            provider = %self.name,
            queue = %record.queue,
            job_id = %record.id,
            available_at = %record.available_at,
            "Job pushed"
        );
        Ok(record.id)
    }

    async fn pop(&self, queue: &str) -> Result<Option<JobRecord>> {
        Ok(self.claim(queue, 1).await?.into_iter().next())
    }

    async fn pop_batch(&self, queue: &str, count: usize) -> Result<Vec<JobRecord>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        self.claim(queue, count).await
    }

    #[instrument(skip(self), fields(provider = %self.name, job_id = %claim.job_id))]
    async fn complete(&self, claim: &Claim) -> Result<JobRecord> {
        let now = self.clock.now();
        let mut tx = self.db.pool().begin().await?;

        let mut record = self.lock_row(&mut tx, claim.job_id).await?;
        record.mark_completed(claim, now)?;
        self.save(&mut tx, &record).await?;

        tx.commit().await?;
        Ok(record)
    }

    #[instrument(skip(self, failure), fields(provider = %self.name, job_id = %claim.job_id))]
    async fn fail(
        &self,
        claim: &Claim,
        failure: JobFailure,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<JobRecord> {
        let now = self.clock.now();
        let mut tx = self.db.pool().begin().await?;

        let mut record = self.lock_row(&mut tx, claim.job_id).await?;
        record.mark_failed(claim, failure, retry_at, now)?;
        self.save(&mut tx, &record).await?;

        tx.commit().await?;
        Ok(record)
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>> {
        let row = sqlx::query(&format!("SELECT * FROM {} WHERE id = $1", self.table))
            .bind(id.0)
            .fetch_optional(self.db.pool())
            .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats> {
        let row = sqlx::query(&format!(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending' AND available_at <= $2) AS pending,
                COUNT(*) FILTER (WHERE status = 'pending' AND available_at > $2) AS delayed,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed
            FROM {}
            WHERE queue = $1
            "#,
            self.table
        ))
        .bind(queue)
        .bind(self.clock.now())
        .fetch_one(self.db.pool())
        .await?;

        let count = |column: &str| -> Result<usize> {
            Ok(row.try_get::<i64, _>(column)?.max(0) as usize)
        };

        Ok(QueueStats {
            pending: count("pending")?,
            delayed: count("delayed")?,
            processing: count("processing")?,
            completed: count("completed")?,
            failed: count("failed")?,
        })
    }

    async fn prune(&self, finished_before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE status IN ('completed', 'failed') AND finished_at <= $1",
            self.table
        ))
        .bind(finished_before)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected())
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

/// Decode a full job row.
fn record_from_row(row: &PgRow) -> Result<JobRecord> {
    let status: String = row.try_get("status")?;
    let status = status.parse::<JobStatus>().map_err(|e| {
        QueueError::with_internal(ErrorCode::DeserializationError, "Corrupt job record", e)
    })?;
    let attempts: i32 = row.try_get("attempts")?;
    let failure: Option<Json<JobFailure>> = row.try_get("failure")?;
    let log: Json<Vec<JobLogEntry>> = row.try_get("log")?;

    Ok(JobRecord {
        id: JobId(row.try_get("id")?),
        sequence: row.try_get("sequence")?,
        queue: row.try_get("queue")?,
        job_type: row.try_get("job_type")?,
        payload: row.try_get("payload")?,
        status,
        attempts: attempts.max(0) as u32,
        available_at: row.try_get("available_at")?,
        lock_until: row.try_get("lock_until")?,
        claim_token: row.try_get("claim_token")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        failure: failure.map(|f| f.0),
        log: log.0,
        created_at: row.try_get("created_at")?,
    })
}

/// Accept `[A-Za-z_][A-Za-z0-9_]*` up to the Postgres identifier limit.
fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid_start && valid_rest && name.len() <= 53 {
        Ok(())
    } else {
        Err(QueueError::invalid_configuration(format!(
            "invalid queue table name '{}'",
            name
        )))
    }
}
