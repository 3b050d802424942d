//! Postgres-backed job store.
//!
//! Claims use `FOR UPDATE SKIP LOCKED`, so concurrent workers (threads or
//! processes) receive disjoint batches without blocking on each other.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `Duplicate` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / Io / other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Row};
use tracing::{debug, instrument};

use afterhours_core::JobId;

use super::store::{JobStore, JobStoreError};
use super::types::{stuck_cutoff, FailureDisposition, JobFilter, JobRecord, JobStats, JobStatus};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const JOB_COLUMNS: &str = "id, task_type, payload, queue, status, attempts, max_attempts, \
     scheduled_at, reserved_at, created_at, finished_at, last_error, schedule, dedupe_key";

/// Open a connection pool.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, JobStoreError> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .map_err(|e| map_sqlx_error("connect", e))
}

/// Apply the bundled schema migrations (`jobs`, `job_settings`).
pub async fn migrate(pool: &PgPool) -> Result<(), JobStoreError> {
    MIGRATOR
        .run(pool)
        .await
        .map_err(|e| JobStoreError::Storage(format!("migration failed: {e}")))
}

/// Postgres-backed job store.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Work out why a conditional update on `id` matched nothing.
    async fn lost_reservation(&self, id: JobId) -> JobStoreError {
        let status: Result<Option<String>, _> =
            sqlx::query_scalar("SELECT status FROM jobs WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&*self.pool)
                .await;

        match status {
            Ok(None) => JobStoreError::NotFound(id),
            Ok(Some(status)) => match status.parse() {
                Ok(status) => JobStoreError::InvalidState {
                    id,
                    status,
                    expected: JobStatus::Reserved,
                },
                Err(e) => JobStoreError::Storage(e),
            },
            Err(e) => map_sqlx_error("lost_reservation", e),
        }
    }

    fn decode_rows(rows: Vec<PgRow>) -> Result<Vec<JobRecord>, JobStoreError> {
        rows.iter()
            .map(|row| {
                JobRow::from_row(row)
                    .map_err(|e| JobStoreError::Storage(format!("failed to decode job row: {e}")))?
                    .try_into()
            })
            .collect()
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, task_type = %job.task_type), err)]
    async fn insert(&self, job: JobRecord) -> Result<JobId, JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, task_type, payload, queue, status, attempts, max_attempts,
                scheduled_at, reserved_at, created_at, finished_at, last_error,
                schedule, dedupe_key
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(&job.task_type)
        .bind(&job.payload)
        .bind(&job.queue)
        .bind(job.status.as_str())
        .bind(to_i32("attempts", job.attempts)?)
        .bind(to_i32("max_attempts", job.max_attempts)?)
        .bind(job.scheduled_at)
        .bind(job.reserved_at)
        .bind(job.created_at)
        .bind(job.finished_at)
        .bind(&job.last_error)
        .bind(&job.schedule)
        .bind(&job.dedupe_key)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert", e))?;

        Ok(job.id)
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|row| {
            JobRow::from_row(&row)
                .map_err(|e| JobStoreError::Storage(format!("failed to decode job row: {e}")))?
                .try_into()
        })
        .transpose()
    }

    #[instrument(skip(self), err)]
    async fn claim_batch(
        &self,
        queue: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            WITH next_jobs AS (
                SELECT id
                FROM jobs
                WHERE status = 'pending' AND queue = $1 AND scheduled_at <= $3
                ORDER BY scheduled_at, created_at, id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'reserved', reserved_at = $3
            WHERE id IN (SELECT id FROM next_jobs) AND status = 'pending'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(queue)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(now)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_batch", e))?;

        // RETURNING does not preserve the CTE order
        let mut claimed = Self::decode_rows(rows)?;
        claimed.sort_by_key(|j| (j.scheduled_at, j.created_at, j.id));
        debug!(claimed = claimed.len(), "claimed jobs");
        Ok(claimed)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn complete(&self, id: JobId, now: DateTime<Utc>) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed', reserved_at = NULL, finished_at = $2
            WHERE id = $1 AND status = 'reserved'
            "#,
        )
        .bind(id.as_uuid())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete", e))?;

        if result.rows_affected() == 0 {
            return Err(self.lost_reservation(id).await);
        }
        Ok(())
    }

    #[instrument(skip(self, message), fields(job_id = %id), err)]
    async fn fail(
        &self,
        id: JobId,
        message: &str,
        disposition: FailureDisposition,
        now: DateTime<Utc>,
    ) -> Result<JobStatus, JobStoreError> {
        let status: Option<String> = match disposition {
            FailureDisposition::Retry { at } => sqlx::query_scalar(
                r#"
                UPDATE jobs
                SET attempts = LEAST(attempts + 1, max_attempts),
                    status = CASE WHEN attempts + 1 < max_attempts THEN 'pending' ELSE 'failed' END,
                    scheduled_at = CASE WHEN attempts + 1 < max_attempts THEN $3 ELSE scheduled_at END,
                    finished_at = CASE WHEN attempts + 1 < max_attempts THEN NULL ELSE $4 END,
                    reserved_at = NULL,
                    last_error = $2
                WHERE id = $1 AND status = 'reserved'
                RETURNING status
                "#,
            )
            .bind(id.as_uuid())
            .bind(message)
            .bind(at)
            .bind(now),
            FailureDisposition::Permanent => sqlx::query_scalar(
                r#"
                UPDATE jobs
                SET status = 'failed',
                    reserved_at = NULL,
                    finished_at = $3,
                    last_error = $2
                WHERE id = $1 AND status = 'reserved'
                RETURNING status
                "#,
            )
            .bind(id.as_uuid())
            .bind(message)
            .bind(now),
        }
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail", e))?;

        match status {
            Some(status) => status.parse().map_err(JobStoreError::Storage),
            None => Err(self.lost_reservation(id).await),
        }
    }

    #[instrument(skip(self), err)]
    async fn release_stuck(
        &self,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending', reserved_at = NULL
            WHERE status = 'reserved' AND reserved_at < $1
            "#,
        )
        .bind(stuck_cutoff(timeout, now))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release_stuck", e))?;

        Ok(result.rows_affected())
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE ($1::uuid IS NULL OR id = $1)
                AND ($2::text IS NULL OR status = $2)
                AND ($3::text IS NULL OR queue = $3)
                AND ($4::text IS NULL OR task_type = $4)
            ORDER BY created_at, id
            LIMIT $5
            "#
        ))
        .bind(filter.id.map(|id| *id.as_uuid()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.queue.as_deref())
        .bind(filter.task_type.as_deref())
        .bind(filter.limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX)))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;

        Self::decode_rows(rows)
    }

    async fn stats(&self, queue: Option<&str>) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count
            FROM jobs
            WHERE ($1::text IS NULL OR queue = $1)
            GROUP BY status
            "#,
        )
        .bind(queue)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| map_sqlx_error("stats", e))?;
            let count: i64 = row
                .try_get("count")
                .map_err(|e| map_sqlx_error("stats", e))?;
            stats.record(status.parse().map_err(JobStoreError::Storage)?, count as u64);
        }
        Ok(stats)
    }

    #[instrument(skip(self), err)]
    async fn purge(&self, filter: &JobFilter) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE ($1::uuid IS NULL OR id = $1)
                AND ($2::text IS NULL OR status = $2)
                AND ($3::text IS NULL OR queue = $3)
                AND ($4::text IS NULL OR task_type = $4)
            "#,
        )
        .bind(filter.id.map(|id| *id.as_uuid()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.queue.as_deref())
        .bind(filter.task_type.as_deref())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("purge", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn prune(
        &self,
        status: JobStatus,
        older_than: DateTime<Utc>,
    ) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            "DELETE FROM jobs WHERE status = $1 AND finished_at < $2",
        )
        .bind(status.as_str())
        .bind(older_than)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("prune", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn requeue_failed(
        &self,
        filter: &JobFilter,
        now: DateTime<Utc>,
    ) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                attempts = 0,
                scheduled_at = $5,
                reserved_at = NULL,
                finished_at = NULL
            WHERE status = 'failed'
                AND ($1::uuid IS NULL OR id = $1)
                AND ($2::text IS NULL OR status = $2)
                AND ($3::text IS NULL OR queue = $3)
                AND ($4::text IS NULL OR task_type = $4)
            "#,
        )
        .bind(filter.id.map(|id| *id.as_uuid()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.queue.as_deref())
        .bind(filter.task_type.as_deref())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue_failed", e))?;

        Ok(result.rows_affected())
    }

    async fn has_active_for_schedule(&self, schedule: &str) -> Result<bool, JobStoreError> {
        sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM jobs
                WHERE schedule = $1 AND status IN ('pending', 'reserved')
            )
            "#,
        )
        .bind(schedule)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("has_active_for_schedule", e))
    }
}

fn to_i32(column: &str, value: u32) -> Result<i32, JobStoreError> {
    i32::try_from(value)
        .map_err(|_| JobStoreError::Storage(format!("{column} {value} does not fit the column")))
}

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => JobStoreError::Duplicate(msg),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    task_type: String,
    payload: serde_json::Value,
    queue: String,
    status: String,
    attempts: i32,
    max_attempts: i32,
    scheduled_at: DateTime<Utc>,
    reserved_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    schedule: Option<String>,
    dedupe_key: Option<String>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            task_type: row.try_get("task_type")?,
            payload: row.try_get("payload")?,
            queue: row.try_get("queue")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            scheduled_at: row.try_get("scheduled_at")?,
            reserved_at: row.try_get("reserved_at")?,
            created_at: row.try_get("created_at")?,
            finished_at: row.try_get("finished_at")?,
            last_error: row.try_get("last_error")?,
            schedule: row.try_get("schedule")?,
            dedupe_key: row.try_get("dedupe_key")?,
        })
    }
}

impl TryFrom<JobRow> for JobRecord {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(JobRecord {
            id: JobId::from_uuid(row.id),
            task_type: row.task_type,
            payload: row.payload,
            queue: row.queue,
            status: row.status.parse().map_err(JobStoreError::Storage)?,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(1) as u32,
            scheduled_at: row.scheduled_at,
            reserved_at: row.reserved_at,
            created_at: row.created_at,
            finished_at: row.finished_at,
            last_error: row.last_error,
            schedule: row.schedule,
            dedupe_key: row.dedupe_key,
        })
    }
}
