//! Postgres-backed outbox, envelope and wallet storage.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (check constraint violation) | `23514` | `Corrupt` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / network / other | N/A | `Storage` |
//!
//! Claims lock candidate rows with `FOR UPDATE SKIP LOCKED` and the update
//! itself is conditional on `locked_by IS NULL`, so two workers never hold the
//! same job. Outcome writes also require `locked_by` to still name the writer.
//! Envelope transitions are compare-and-set on `status`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};
use uuid::Uuid;

use escrowbox_core::{Amount, Digest32, EnvelopeId, JobId, WorkerId};
use escrowbox_envelope::{Envelope, EnvelopeParts, EnvelopeStatus, Transition};

use crate::envelopes::{EnvelopeStore, TransitionOutcome};
use crate::error::StoreError;
use crate::jobs::{Job, JobStats, JobStore, NewJob, OutcomeWrite};
use crate::wallets::WalletDirectory;

const SCHEMA: &str = include_str!("../migrations/0001_outbox.sql");

const JOB_COLUMNS: &str = "id, job_type, payload, run_after, attempts, locked_by, locked_at, \
     processed_at, failed_at, last_error, created_at";

const ENVELOPE_COLUMNS: &str = "id, status, hash, amount::text AS amount, asset, sender, \
     recipient, expiry_ts, message, contract_id, funded_at, opened_at, canceled_at, \
     cancel_reason, claimed_by, created_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: Arc<PgPool>,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    /// Insert a job inside a caller-owned transaction, so producers can write
    /// business rows and the job that serves them atomically.
    pub async fn enqueue_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        job: NewJob,
        now: DateTime<Utc>,
    ) -> Result<JobId, StoreError> {
        let job = job.into_job(now);
        insert_job(tx, &job).await?;
        Ok(job.id)
    }

    /// Explain why a lock-conditional outcome write matched no row.
    async fn classify_missed_write(&self, id: JobId) -> Result<OutcomeWrite, StoreError> {
        let terminal: Option<bool> = sqlx::query(
            "SELECT processed_at IS NOT NULL OR failed_at IS NOT NULL FROM outbox WHERE id = $1",
        )
        .bind(Uuid::from(id))
        .fetch_optional(&*self.pool)
        .await
        .and_then(|row| row.map(|row| row.try_get(0)).transpose())
        .map_err(|e| map_sqlx_error("classify_missed_write", e))?;
        match terminal {
            None => Err(StoreError::JobNotFound(id)),
            Some(true) => Ok(OutcomeWrite::AlreadyTerminal),
            Some(false) => Ok(OutcomeWrite::LockLost),
        }
    }

    async fn fetch_envelope(&self, id: &EnvelopeId) -> Result<Option<Envelope>, StoreError> {
        let sql = format!("SELECT {ENVELOPE_COLUMNS} FROM envelopes WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_envelope", e))?;
        row.map(|row| envelope_from_row(&row)).transpose()
    }
}

#[async_trait]
impl JobStore for PgStore {
    #[instrument(skip(self, job), fields(job_type = %job.job_type), err)]
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> Result<JobId, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        let id = Self::enqueue_in_tx(&mut tx, job, now).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(id)
    }

    #[instrument(skip(self, worker), fields(worker = %worker, claimed = tracing::field::Empty), err)]
    async fn claim_batch(
        &self,
        worker: &WorkerId,
        limit: usize,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            r#"
            WITH candidates AS (
                SELECT id
                FROM outbox
                WHERE run_after <= $2
                  AND locked_by IS NULL
                  AND processed_at IS NULL
                  AND failed_at IS NULL
                  AND attempts < $3
                ORDER BY run_after ASC, created_at ASC
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox
            SET locked_by = $1, locked_at = $2
            FROM candidates
            WHERE outbox.id = candidates.id
              AND outbox.locked_by IS NULL
            RETURNING {}
            "#,
            qualified_job_columns()
        );

        let rows = sqlx::query(&sql)
            .bind(worker.as_str())
            .bind(now)
            .bind(i32::try_from(max_attempts).unwrap_or(i32::MAX))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_batch", e))?;

        // RETURNING order is unspecified.
        let mut jobs = rows
            .iter()
            .map(job_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        jobs.sort_by_key(|job| (job.run_after, job.created_at, job.id));

        Span::current().record("claimed", jobs.len());
        Ok(jobs)
    }

    #[instrument(skip(self), err)]
    async fn release_stale_locks(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET locked_by = NULL, locked_at = NULL
            WHERE locked_at < $1
              AND processed_at IS NULL
              AND failed_at IS NULL
            "#,
        )
        .bind(cutoff)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release_stale_locks", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, worker), fields(job_id = %id, worker = %worker), err)]
    async fn complete(
        &self,
        id: JobId,
        worker: &WorkerId,
        attempts: u32,
        at: DateTime<Utc>,
    ) -> Result<OutcomeWrite, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET attempts = $3, processed_at = $4, locked_by = NULL, locked_at = NULL
            WHERE id = $1 AND locked_by = $2
              AND processed_at IS NULL AND failed_at IS NULL
            "#,
        )
        .bind(Uuid::from(id))
        .bind(worker.as_str())
        .bind(attempts_column(attempts))
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete", e))?;

        if result.rows_affected() == 0 {
            return self.classify_missed_write(id).await;
        }
        Ok(OutcomeWrite::Written)
    }

    #[instrument(skip(self, worker, error), fields(job_id = %id, worker = %worker), err)]
    async fn reschedule(
        &self,
        id: JobId,
        worker: &WorkerId,
        attempts: u32,
        run_after: DateTime<Utc>,
        error: &str,
    ) -> Result<OutcomeWrite, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET attempts = $3, run_after = $4, last_error = $5,
                locked_by = NULL, locked_at = NULL
            WHERE id = $1 AND locked_by = $2
              AND processed_at IS NULL AND failed_at IS NULL
            "#,
        )
        .bind(Uuid::from(id))
        .bind(worker.as_str())
        .bind(attempts_column(attempts))
        .bind(run_after)
        .bind(error)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reschedule", e))?;

        if result.rows_affected() == 0 {
            return self.classify_missed_write(id).await;
        }
        Ok(OutcomeWrite::Written)
    }

    #[instrument(skip(self, worker, error), fields(job_id = %id, worker = %worker), err)]
    async fn fail_permanently(
        &self,
        id: JobId,
        worker: &WorkerId,
        attempts: u32,
        at: DateTime<Utc>,
        error: &str,
    ) -> Result<OutcomeWrite, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET attempts = $3, failed_at = $4, last_error = $5,
                locked_by = NULL, locked_at = NULL
            WHERE id = $1 AND locked_by = $2
              AND processed_at IS NULL AND failed_at IS NULL
            "#,
        )
        .bind(Uuid::from(id))
        .bind(worker.as_str())
        .bind(attempts_column(attempts))
        .bind(at)
        .bind(error)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail_permanently", e))?;

        if result.rows_affected() == 0 {
            return self.classify_missed_write(id).await;
        }
        Ok(OutcomeWrite::Written)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM outbox WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(Uuid::from(id))
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE processed_at IS NULL AND failed_at IS NULL AND locked_by IS NULL) AS pending,
                COUNT(*) FILTER (WHERE processed_at IS NULL AND failed_at IS NULL AND locked_by IS NOT NULL) AS in_flight,
                COUNT(*) FILTER (WHERE processed_at IS NOT NULL) AS processed,
                COUNT(*) FILTER (WHERE failed_at IS NOT NULL) AS failed
            FROM outbox
            "#,
        )
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let count = |column: &str| -> Result<u64, StoreError> {
            let value: i64 = row
                .try_get(column)
                .map_err(|e| map_sqlx_error("stats", e))?;
            Ok(u64::try_from(value).unwrap_or(0))
        };
        Ok(JobStats {
            pending: count("pending")?,
            in_flight: count("in_flight")?,
            processed: count("processed")?,
            failed: count("failed")?,
        })
    }

    #[instrument(skip(self), err)]
    async fn list_terminal_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM outbox
            WHERE COALESCE(processed_at, failed_at) < $1
            ORDER BY COALESCE(processed_at, failed_at) ASC, id ASC
            LIMIT $2
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(cutoff)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_terminal_before", e))?;
        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn delete_terminal(&self, ids: &[JobId]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<Uuid> = ids.iter().copied().map(Uuid::from).collect();
        let result = sqlx::query(
            r#"
            DELETE FROM outbox
            WHERE id = ANY($1)
              AND (processed_at IS NOT NULL OR failed_at IS NOT NULL)
            "#,
        )
        .bind(&ids)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("delete_terminal", e))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl EnvelopeStore for PgStore {
    #[instrument(skip(self), fields(envelope_id = %id), err)]
    async fn get(&self, id: &EnvelopeId) -> Result<Option<Envelope>, StoreError> {
        self.fetch_envelope(id).await
    }

    #[instrument(
        skip(self, transition),
        fields(envelope_id = %id, to = %transition.to_status()),
        err
    )]
    async fn apply(
        &self,
        id: &EnvelopeId,
        transition: &Transition,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut envelope = self
            .fetch_envelope(id)
            .await?
            .ok_or_else(|| StoreError::EnvelopeNotFound(id.clone()))?;
        if envelope.status() != transition.from_status() {
            return Ok(TransitionOutcome::Rejected {
                current: envelope.status(),
            });
        }
        envelope
            .apply(transition)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        let result = sqlx::query(
            r#"
            UPDATE envelopes
            SET status = $2,
                contract_id = $3,
                funded_at = $4,
                opened_at = $5,
                canceled_at = $6,
                cancel_reason = $7,
                claimed_by = $8
            WHERE id = $1 AND status = $9
            "#,
        )
        .bind(id.as_str())
        .bind(envelope.status().as_str())
        .bind(envelope.contract_id())
        .bind(envelope.funded_at())
        .bind(envelope.opened_at())
        .bind(envelope.canceled_at())
        .bind(envelope.cancel_reason())
        .bind(envelope.claimed_by())
        .bind(transition.from_status().as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("apply_transition", e))?;

        if result.rows_affected() == 0 {
            // Lost the race: report what the winner wrote.
            let current = self
                .fetch_envelope(id)
                .await?
                .ok_or_else(|| StoreError::EnvelopeNotFound(id.clone()))?;
            return Ok(TransitionOutcome::Rejected {
                current: current.status(),
            });
        }
        Ok(TransitionOutcome::Applied(envelope))
    }

    #[instrument(skip(self), err)]
    async fn open_candidates(&self, contract_id: &str) -> Result<Vec<Envelope>, StoreError> {
        let sql = format!(
            r#"
            SELECT {ENVELOPE_COLUMNS}
            FROM envelopes
            WHERE (contract_id = $1 AND status IN ('PENDING', 'FUNDED'))
               OR (contract_id IS NULL AND status = 'PENDING')
            ORDER BY created_at ASC
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(contract_id)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("open_candidates", e))?;
        rows.iter().map(envelope_from_row).collect()
    }

    #[instrument(skip(self, envelopes, jobs), fields(envelopes = envelopes.len(), jobs = jobs.len()), err)]
    async fn create_envelopes(
        &self,
        envelopes: &[Envelope],
        jobs: Vec<NewJob>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        for envelope in envelopes {
            insert_envelope(&mut tx, envelope).await?;
        }
        let mut ids = Vec::with_capacity(jobs.len());
        for job in jobs {
            ids.push(Self::enqueue_in_tx(&mut tx, job, now).await?);
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(ids)
    }
}

#[async_trait]
impl WalletDirectory for PgStore {
    #[instrument(skip(self), err)]
    async fn public_key(&self, wallet_id: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT public_key FROM wallets WHERE id = $1")
            .bind(wallet_id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("wallet_public_key", e))?;
        row.map(|row| row.try_get("public_key"))
            .transpose()
            .map_err(|e| map_sqlx_error("wallet_public_key", e))
    }
}

fn qualified_job_columns() -> String {
    JOB_COLUMNS
        .split(',')
        .map(|column| format!("outbox.{}", column.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn attempts_column(attempts: u32) -> i32 {
    i32::try_from(attempts).unwrap_or(i32::MAX)
}

async fn insert_job(tx: &mut Transaction<'_, Postgres>, job: &Job) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO outbox (id, job_type, payload, run_after, attempts, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(Uuid::from(job.id))
    .bind(&job.job_type)
    .bind(&job.payload)
    .bind(job.run_after)
    .bind(attempts_column(job.attempts))
    .bind(job.created_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_job", e))?;
    Ok(())
}

async fn insert_envelope(
    tx: &mut Transaction<'_, Postgres>,
    envelope: &Envelope,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO envelopes (
            id, status, hash, amount, asset, sender, recipient, expiry_ts, message,
            contract_id, funded_at, opened_at, canceled_at, cancel_reason, claimed_by,
            created_at
        )
        VALUES ($1, $2, $3, $4::numeric, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        "#,
    )
    .bind(envelope.id().as_str())
    .bind(envelope.status().as_str())
    .bind(envelope.hash().to_hex())
    .bind(envelope.amount().to_string())
    .bind(envelope.asset())
    .bind(envelope.sender())
    .bind(envelope.recipient())
    .bind(envelope.expiry_ts())
    .bind(envelope.message())
    .bind(envelope.contract_id())
    .bind(envelope.funded_at())
    .bind(envelope.opened_at())
    .bind(envelope.canceled_at())
    .bind(envelope.cancel_reason())
    .bind(envelope.claimed_by())
    .bind(envelope.created_at())
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_envelope", e))?;
    Ok(())
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: Uuid,
    job_type: String,
    payload: serde_json::Value,
    run_after: DateTime<Utc>,
    attempts: i32,
    locked_by: Option<String>,
    locked_at: Option<DateTime<Utc>>,
    processed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            job_type: row.try_get("job_type")?,
            payload: row.try_get("payload")?,
            run_after: row.try_get("run_after")?,
            attempts: row.try_get("attempts")?,
            locked_by: row.try_get("locked_by")?,
            locked_at: row.try_get("locked_at")?,
            processed_at: row.try_get("processed_at")?,
            failed_at: row.try_get("failed_at")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let attempts = u32::try_from(row.attempts)
            .map_err(|_| StoreError::Corrupt(format!("job {}: attempts {}", row.id, row.attempts)))?;
        Ok(Job {
            id: JobId::from_uuid(row.id),
            job_type: row.job_type,
            payload: row.payload,
            run_after: row.run_after,
            attempts,
            locked_by: row.locked_by.map(WorkerId::new),
            locked_at: row.locked_at,
            processed_at: row.processed_at,
            failed_at: row.failed_at,
            last_error: row.last_error,
            created_at: row.created_at,
        })
    }
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<Job, StoreError> {
    JobRow::from_row(row)
        .map_err(|e| StoreError::Corrupt(format!("failed to read job row: {e}")))?
        .try_into()
}

#[derive(Debug)]
struct EnvelopeRow {
    id: String,
    status: String,
    hash: String,
    amount: String,
    asset: String,
    sender: String,
    recipient: Option<String>,
    expiry_ts: DateTime<Utc>,
    message: Option<String>,
    contract_id: Option<String>,
    funded_at: Option<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    canceled_at: Option<DateTime<Utc>>,
    cancel_reason: Option<String>,
    claimed_by: Option<String>,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for EnvelopeRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(EnvelopeRow {
            id: row.try_get("id")?,
            status: row.try_get("status")?,
            hash: row.try_get("hash")?,
            amount: row.try_get("amount")?,
            asset: row.try_get("asset")?,
            sender: row.try_get("sender")?,
            recipient: row.try_get("recipient")?,
            expiry_ts: row.try_get("expiry_ts")?,
            message: row.try_get("message")?,
            contract_id: row.try_get("contract_id")?,
            funded_at: row.try_get("funded_at")?,
            opened_at: row.try_get("opened_at")?,
            canceled_at: row.try_get("canceled_at")?,
            cancel_reason: row.try_get("cancel_reason")?,
            claimed_by: row.try_get("claimed_by")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<EnvelopeRow> for Envelope {
    type Error = StoreError;

    fn try_from(row: EnvelopeRow) -> Result<Self, Self::Error> {
        let corrupt = |what: &str, err: &dyn std::fmt::Display| {
            StoreError::Corrupt(format!("envelope {}: {what}: {err}", row.id))
        };
        let id: EnvelopeId = row.id.parse().map_err(|e| corrupt("id", &e))?;
        let status: EnvelopeStatus = row.status.parse().map_err(|e| corrupt("status", &e))?;
        let hash: Digest32 = row.hash.parse().map_err(|e| corrupt("hash", &e))?;
        let amount: Amount = row.amount.parse().map_err(|e| corrupt("amount", &e))?;

        Envelope::from_parts(EnvelopeParts {
            id,
            status,
            hash,
            amount,
            asset: row.asset,
            sender: row.sender,
            recipient: row.recipient,
            expiry_ts: row.expiry_ts,
            message: row.message,
            contract_id: row.contract_id,
            funded_at: row.funded_at,
            opened_at: row.opened_at,
            canceled_at: row.canceled_at,
            cancel_reason: row.cancel_reason,
            claimed_by: row.claimed_by,
            created_at: row.created_at,
        })
        .map_err(|e| StoreError::Corrupt(e.to_string()))
    }
}

fn envelope_from_row(row: &sqlx::postgres::PgRow) -> Result<Envelope, StoreError> {
    EnvelopeRow::from_row(row)
        .map_err(|e| StoreError::Corrupt(format!("failed to read envelope row: {e}")))?
        .try_into()
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                Some("23514") => StoreError::Corrupt(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => StoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}
