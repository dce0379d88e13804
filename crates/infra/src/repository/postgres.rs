//! Postgres-backed job repository.
//!
//! Each job is stored as one row: the full structural encoding in a JSONB
//! `document` column, plus indexed columns used by lookups and criteria
//! queries. The `version` column is the optimistic concurrency token.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation on `jobs_chain_slot_key`) | `23505` | `ChainSlotTaken` |
//! | Database (other unique violation) | `23505` | `Concurrency` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / Other | N/A | `Storage` |
//!
//! ## Runtime
//!
//! [`JobRepository`] is synchronous; this adapter drives its async queries on
//! the tokio runtime handle captured at construction. Call the trait methods
//! from worker threads, not from inside async tasks.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::instrument;

use jobwarden_core::{AggregateRoot, ChainId, ExpectedVersion, JobId};
use jobwarden_jobs::{Job, JobStatus};

use super::{JobCriteria, JobRepository, JobStoreError, JobTransaction, expected_version};

/// Name of the constraint keeping one job per chain position.
const CHAIN_SLOT_CONSTRAINT: &str = "jobs_chain_slot_key";

/// Table definition expected by [`PostgresJobRepository`].
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    job_id          UUID PRIMARY KEY,
    job_type        TEXT NOT NULL,
    status          TEXT NOT NULL,
    sealed_due      TEXT NULL,
    chain_id        UUID NULL,
    chain_position  BIGINT NULL,
    created_at      TIMESTAMPTZ NOT NULL,
    version         BIGINT NOT NULL CHECK (version > 0),
    document        JSONB NOT NULL,
    CONSTRAINT jobs_chain_slot_key UNIQUE (chain_id, chain_position)
);
CREATE INDEX IF NOT EXISTS jobs_type_status_idx ON jobs (job_type, status);
CREATE INDEX IF NOT EXISTS jobs_created_at_idx ON jobs (created_at, job_id);
"#;

#[derive(Debug, Clone)]
pub struct PostgresJobRepository {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresJobRepository {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    /// Connect and capture the current runtime handle.
    pub async fn connect(database_url: &str) -> Result<Self, JobStoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool, Handle::current()))
    }

    /// Create the table and indexes if missing.
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    #[instrument(skip_all, fields(job_id = %job_id), err)]
    pub async fn load(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query("SELECT document, version FROM jobs WHERE job_id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load", e))?;

        row.map(|row| decode_row(&row)).transpose()
    }

    #[instrument(skip(self), err)]
    pub async fn load_next_in_chain(
        &self,
        chain_id: ChainId,
        position: u32,
    ) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(
            r#"
            SELECT document, version
            FROM jobs
            WHERE chain_id = $1 AND chain_position = $2
            "#,
        )
        .bind(chain_id.as_uuid())
        .bind(i64::from(position) + 1)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_next_in_chain", e))?;

        row.map(|row| decode_row(&row)).transpose()
    }

    #[instrument(skip(self, criteria), err)]
    pub async fn query(&self, criteria: &JobCriteria) -> Result<Vec<Job>, JobStoreError> {
        let status = criteria.status.map(|s| s.as_str());
        let sealed_due = criteria
            .sealed_due
            .or(match criteria.status {
                Some(JobStatus::Sealed(reason)) => Some(reason),
                _ => None,
            })
            .map(|r| r.as_str());

        let rows = sqlx::query(
            r#"
            SELECT document, version
            FROM jobs
            WHERE ($1::text IS NULL OR job_type = $1)
                AND ($2::text IS NULL OR status = $2)
                AND ($3::uuid IS NULL OR chain_id = $3)
                AND ($4::text IS NULL OR sealed_due = $4)
                AND ($5::timestamptz IS NULL OR created_at >= $5)
                AND ($6::timestamptz IS NULL OR created_at < $6)
            ORDER BY created_at ASC, job_id ASC
            LIMIT $7 OFFSET $8
            "#,
        )
        .bind(criteria.job_type.as_deref())
        .bind(status)
        .bind(criteria.chain_id.map(|c| *c.as_uuid()))
        .bind(sealed_due)
        .bind(criteria.created_after.map(|at| at.with_timezone(&Utc)))
        .bind(criteria.created_before.map(|at| at.with_timezone(&Utc)))
        .bind(i64::from(criteria.pagination.limit))
        .bind(i64::from(criteria.pagination.offset))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("query", e))?;

        rows.iter().map(decode_row).collect()
    }

    /// Write all staged jobs in one database transaction.
    #[instrument(skip(self, staged), fields(staged = staged.len()), err)]
    pub async fn write(&self, staged: Vec<Job>) -> Result<Vec<Job>, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut committed = Vec::with_capacity(staged.len());
        for mut job in staged {
            let expected = expected_version(&job);
            job.record_persisted(job.version() + 1);

            if let Err(e) = write_job(&mut tx, &job, expected).await {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(e);
            }
            committed.push(job);
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(committed)
    }
}

async fn write_job(
    tx: &mut Transaction<'_, Postgres>,
    job: &Job,
    expected: ExpectedVersion,
) -> Result<(), JobStoreError> {
    let document = serde_json::to_value(job)
        .map_err(|e| JobStoreError::Storage(format!("failed to encode job {}: {e}", job.id())))?;
    let created_at: DateTime<Utc> = job.created_at().with_timezone(&Utc);
    let status = job.status();
    let version = i64::try_from(job.version())
        .map_err(|_| JobStoreError::Storage(format!("job {} version overflow", job.id())))?;

    match expected {
        ExpectedVersion::NoAggregate => {
            sqlx::query(
                r#"
                INSERT INTO jobs (
                    job_id, job_type, status, sealed_due, chain_id, chain_position,
                    created_at, version, document
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(job.id().as_uuid())
            .bind(job.job_type())
            .bind(status.as_str())
            .bind(job.sealed_due().map(|r| r.as_str()))
            .bind(job.chain_id().map(|c| *c.as_uuid()))
            .bind(job.chain_position().map(i64::from))
            .bind(created_at)
            .bind(version)
            .bind(&document)
            .execute(&mut **tx)
            .await
            .map_err(|e| {
                if let Some(taken) = chain_slot_violation(&e, job) {
                    taken
                } else if is_unique_violation(&e) {
                    JobStoreError::AlreadyExists(*job.id())
                } else {
                    map_sqlx_error("insert_job", e)
                }
            })?;
        }
        ExpectedVersion::Exact(previous) => {
            let previous = i64::try_from(previous)
                .map_err(|_| JobStoreError::Storage(format!("job {} version overflow", job.id())))?;
            let result = sqlx::query(
                r#"
                UPDATE jobs
                SET status = $2, sealed_due = $3, chain_id = $4, chain_position = $5,
                    version = $6, document = $7
                WHERE job_id = $1 AND version = $8
                "#,
            )
            .bind(job.id().as_uuid())
            .bind(status.as_str())
            .bind(job.sealed_due().map(|r| r.as_str()))
            .bind(job.chain_id().map(|c| *c.as_uuid()))
            .bind(job.chain_position().map(i64::from))
            .bind(version)
            .bind(&document)
            .bind(previous)
            .execute(&mut **tx)
            .await
            .map_err(|e| {
                chain_slot_violation(&e, job).unwrap_or_else(|| map_sqlx_error("update_job", e))
            })?;

            if result.rows_affected() == 0 {
                let exists = sqlx::query("SELECT 1 FROM jobs WHERE job_id = $1")
                    .bind(job.id().as_uuid())
                    .fetch_optional(&mut **tx)
                    .await
                    .map_err(|e| map_sqlx_error("check_job", e))?
                    .is_some();
                return Err(if exists {
                    JobStoreError::Concurrency(format!(
                        "job {} was modified concurrently (expected {expected:?})",
                        job.id()
                    ))
                } else {
                    JobStoreError::NotFound(*job.id())
                });
            }
        }
    }
    Ok(())
}

fn decode_row(row: &sqlx::postgres::PgRow) -> Result<Job, JobStoreError> {
    let document: serde_json::Value = row
        .try_get("document")
        .map_err(|e| map_sqlx_error("decode_row", e))?;
    let version: i64 = row
        .try_get("version")
        .map_err(|e| map_sqlx_error("decode_row", e))?;

    let mut job: Job = serde_json::from_value(document)
        .map_err(|e| JobStoreError::Storage(format!("failed to decode job row: {e}")))?;
    job.record_persisted(version as u64);
    Ok(job)
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => JobStoreError::Concurrency(msg),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// The chain slot error when `err` violates [`CHAIN_SLOT_CONSTRAINT`].
fn chain_slot_violation(err: &sqlx::Error, job: &Job) -> Option<JobStoreError> {
    let sqlx::Error::Database(db_err) = err else {
        return None;
    };
    if db_err.constraint() != Some(CHAIN_SLOT_CONSTRAINT) {
        return None;
    }
    Some(JobStoreError::ChainSlotTaken {
        chain_id: job.chain_id()?,
        position: job.chain_position()?,
    })
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

impl JobRepository for PostgresJobRepository {
    fn find_by_id(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.runtime.block_on(self.load(job_id))
    }

    fn find_next_in_chain(
        &self,
        chain_id: ChainId,
        position: u32,
    ) -> Result<Option<Job>, JobStoreError> {
        self.runtime
            .block_on(self.load_next_in_chain(chain_id, position))
    }

    fn find_by_criteria(&self, criteria: &JobCriteria) -> Result<Vec<Job>, JobStoreError> {
        self.runtime.block_on(self.query(criteria))
    }

    fn commit(&self, tx: JobTransaction) -> Result<Vec<Job>, JobStoreError> {
        if tx.is_empty() {
            return Ok(Vec::new());
        }
        self.runtime.block_on(self.write(tx.into_staged()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::geocode_job;

    #[test]
    fn pool_errors_are_storage_errors() {
        let err = map_sqlx_error("load", sqlx::Error::PoolClosed);
        assert_eq!(
            err,
            JobStoreError::Storage("connection pool closed in load".into())
        );
        assert!(!err.is_conflict());
        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
        assert!(chain_slot_violation(&sqlx::Error::RowNotFound, &geocode_job(0)).is_none());
    }

    #[test]
    fn schema_enforces_chain_uniqueness() {
        assert!(SCHEMA.contains(&format!(
            "CONSTRAINT {CHAIN_SLOT_CONSTRAINT} UNIQUE (chain_id, chain_position)"
        )));
        assert!(SCHEMA.contains("CHECK (version > 0)"));
    }
}
