//! Postgres-backed control store implementation.
//!
//! Every write that changes a job's status runs in one transaction together
//! with the audit insert, so a status change without its audit entry (or the
//! reverse) cannot be observed.
//!
//! ## Claim
//!
//! The claim is one conditional `UPDATE`:
//!
//! ```sql
//! UPDATE pipeline_jobs SET status = $in_progress, locked = TRUE, ...
//! WHERE id = $1 AND status = $precondition AND locked = FALSE AND retry_eligible
//! ```
//!
//! Under `READ COMMITTED` a second concurrent `UPDATE` of the same row waits for
//! the first to commit and then re-evaluates the predicate against the new row
//! version, which no longer matches. The affected-row count (1 or 0) is the
//! claim result.
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError | Scenario |
//! |------------|------------|----------|
//! | PoolTimedOut / PoolClosed / Io / Tls | `Unavailable` | Database unreachable |
//! | ColumnDecode / Decode / ColumnNotFound | `InvalidRecord` | Row does not fit the model |
//! | Database, SQLSTATE class 22 / 23 | `InvalidRecord` | Data exceptions, constraint violations |
//! | Database / other | `Storage` | SQL errors, trigger rejections |

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use marketflow_core::{AuditEntry, AuditId, AuditTag, JobId, JobRecord, JobStatus, NewJob};

use super::{ClaimRequest, ControlStore, StoreError, Transition};

/// Schema of the control store (jobs and audit log).
pub const SCHEMA: &str = include_str!("../../migrations/0001_control_store.sql");

const MIGRATION_LOCK_KEY: i64 = 0x6d6b_7466_6c6f_77;

const JOB_COLUMNS: &str = "id, status, locked, retry_eligible, lease_expiry, window_start, \
                           window_end, output_path, symbols, created_at, updated_at";

/// Postgres-backed control store.
///
/// `Send + Sync`; all operations go through the sqlx connection pool.
#[derive(Debug, Clone)]
pub struct PostgresControlStore {
    pool: Arc<PgPool>,
}

impl PostgresControlStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Open a pool against `database_url`.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables, indexes and the audit immutability trigger if missing.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // Concurrent migrations would race on CREATE ... IF NOT EXISTS.
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        sqlx::raw_sql(SCHEMA)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    async fn job_exists(&self, job_id: JobId) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 AS present FROM pipeline_jobs WHERE id = $1")
            .bind(job_id.get())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("job_exists", e))?;
        Ok(row.is_some())
    }

    /// Shared body of `finalize` and `reset`: a guarded update plus its audit
    /// entry in one transaction. Returns whether a row matched.
    async fn guarded_transition(
        &self,
        operation: &'static str,
        job_id: JobId,
        transition: &Transition,
        require_locked: bool,
    ) -> Result<bool, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let result = sqlx::query(
            r#"
            UPDATE pipeline_jobs
            SET status = $3,
                locked = FALSE,
                lease_expiry = NULL,
                retry_eligible = COALESCE($4::boolean, retry_eligible),
                updated_at = NOW()
            WHERE id = $1 AND status = $2 AND locked = $5
            "#,
        )
        .bind(job_id.get())
        .bind(transition.from.as_str())
        .bind(transition.to.as_str())
        .bind(transition.retry_eligible)
        .bind(require_locked)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;

        if result.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(false);
        }

        insert_audit(&mut tx, job_id, transition.tag, &transition.description).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(true)
    }
}

async fn insert_audit(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    job_id: JobId,
    tag: AuditTag,
    description: &str,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO pipeline_audit (job_id, status_tag, description)
        VALUES ($1, $2, $3)
        "#,
    )
    .bind(job_id.get())
    .bind(tag.as_str())
    .bind(description)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_audit", e))?;
    Ok(())
}

#[async_trait::async_trait]
impl ControlStore for PostgresControlStore {
    #[instrument(skip(self, job), fields(window_end = %job.window_end), err)]
    async fn create_job(&self, job: NewJob) -> Result<JobRecord, StoreError> {
        let job = job
            .validated()
            .map_err(|e| StoreError::InvalidRecord(e.to_string()))?;
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO pipeline_jobs (window_start, window_end, output_path, symbols)
            VALUES ($1, $2, $3, $4)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job.window_start)
        .bind(job.window_end)
        .bind(&job.output_path)
        .bind(Json(&job.symbols))
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_job", e))?;

        JobRow::from_row(&row)
            .map_err(|e| map_sqlx_error("decode_job", e))?
            .try_into()
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM pipeline_jobs WHERE id = $1"
        ))
        .bind(job_id.get())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_job", e))?;

        match row {
            Some(row) => JobRow::from_row(&row)
                .map_err(|e| map_sqlx_error("decode_job", e))?
                .try_into()
                .map(Some),
            None => Ok(None),
        }
    }

    #[instrument(skip(self), err)]
    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM pipeline_jobs
            WHERE ($1::text IS NULL OR status = $1)
            ORDER BY id ASC
            LIMIT $2
            "#
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(sql_limit(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_jobs", e))?;

        decode_jobs(rows)
    }

    #[instrument(skip(self), fields(precondition = %precondition), err)]
    async fn find_candidate(
        &self,
        precondition: JobStatus,
    ) -> Result<Option<JobRecord>, StoreError> {
        // Plain snapshot read: no row lock, no write.
        let row = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM pipeline_jobs
            WHERE status = $1 AND locked = FALSE AND retry_eligible = TRUE
            ORDER BY id ASC
            LIMIT 1
            "#
        ))
        .bind(precondition.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_candidate", e))?;

        match row {
            Some(row) => JobRow::from_row(&row)
                .map_err(|e| map_sqlx_error("decode_job", e))?
                .try_into()
                .map(Some),
            None => Ok(None),
        }
    }

    #[instrument(
        skip(self, request),
        fields(job_id = %request.job_id, in_progress = %request.in_progress),
        err
    )]
    async fn claim(&self, request: &ClaimRequest) -> Result<bool, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let result = sqlx::query(
            r#"
            UPDATE pipeline_jobs
            SET status = $3,
                locked = TRUE,
                lease_expiry = $4,
                updated_at = NOW()
            WHERE id = $1
              AND status = $2
              AND locked = FALSE
              AND retry_eligible = TRUE
            "#,
        )
        .bind(request.job_id.get())
        .bind(request.precondition.as_str())
        .bind(request.in_progress.as_str())
        .bind(request.lease_expiry)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim", e))?;

        if result.rows_affected() != 1 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(false);
        }

        insert_audit(&mut tx, request.job_id, AuditTag::Claimed, &request.description).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(true)
    }

    #[instrument(skip(self, transition), fields(job_id = %job_id, to = %transition.to), err)]
    async fn finalize(&self, job_id: JobId, transition: &Transition) -> Result<(), StoreError> {
        if self
            .guarded_transition("finalize", job_id, transition, true)
            .await?
        {
            return Ok(());
        }
        if self.job_exists(job_id).await? {
            Err(StoreError::OwnershipLost {
                job_id,
                expected: transition.from,
            })
        } else {
            Err(StoreError::NotFound(job_id))
        }
    }

    #[instrument(skip(self, description), fields(job_id = %job_id, tag = %tag), err)]
    async fn append_audit(
        &self,
        job_id: JobId,
        tag: AuditTag,
        description: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO pipeline_audit (job_id, status_tag, description)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(job_id.get())
        .bind(tag.as_str())
        .bind(description)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("append_audit", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn audit_log(&self, job_id: JobId) -> Result<Vec<AuditEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, status_tag, description, created_at
            FROM pipeline_audit
            WHERE job_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(job_id.get())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("audit_log", e))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let audit = AuditRow::from_row(&row).map_err(|e| map_sqlx_error("decode_audit", e))?;
            entries.push(audit.try_into()?);
        }
        Ok(entries)
    }

    #[instrument(skip(self), err)]
    async fn expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<JobRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM pipeline_jobs
            WHERE locked = TRUE AND lease_expiry < $1
            ORDER BY id ASC
            "#
        ))
        .bind(now)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("expired_leases", e))?;

        decode_jobs(rows)
    }

    #[instrument(skip(self, transition), fields(job_id = %job_id, to = %transition.to), err)]
    async fn reset(&self, job_id: JobId, transition: &Transition) -> Result<(), StoreError> {
        if self
            .guarded_transition("reset", job_id, transition, false)
            .await?
        {
            return Ok(());
        }
        if self.job_exists(job_id).await? {
            Err(StoreError::StatusMismatch {
                job_id,
                expected: transition.from,
            })
        } else {
            Err(StoreError::NotFound(job_id))
        }
    }
}

fn decode_jobs(rows: Vec<PgRow>) -> Result<Vec<JobRecord>, StoreError> {
    let mut jobs = Vec::with_capacity(rows.len());
    for row in rows {
        let job = JobRow::from_row(&row).map_err(|e| map_sqlx_error("decode_job", e))?;
        jobs.push(job.try_into()?);
    }
    Ok(jobs)
}

/// Map a SQLx error to a `StoreError`, keeping "could not reach the database"
/// distinct from everything else.
/// `LIMIT` accepts a signed bigint; larger requests mean "no limit".
fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("{operation}: connection pool unavailable"))
        }
        sqlx::Error::Io(e) => StoreError::Unavailable(format!("{operation}: {e}")),
        sqlx::Error::Tls(e) => StoreError::Unavailable(format!("{operation}: {e}")),
        e @ (sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::ColumnNotFound(_)) => {
            StoreError::InvalidRecord(format!("{operation}: {e}"))
        }
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            let message = format!(
                "database error in {operation} (code {code}): {}",
                db_err.message()
            );
            // 22xxx data exceptions, 23xxx integrity constraint violations.
            if code.starts_with("22") || code.starts_with("23") {
                StoreError::InvalidRecord(message)
            } else {
                StoreError::Storage(message)
            }
        }
        other => StoreError::Storage(format!("{operation}: {other}")),
    }
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: i64,
    status: String,
    locked: bool,
    retry_eligible: bool,
    lease_expiry: Option<DateTime<Utc>>,
    window_start: NaiveDate,
    window_end: NaiveDate,
    output_path: String,
    symbols: Json<Vec<String>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            status: row.try_get("status")?,
            locked: row.try_get("locked")?,
            retry_eligible: row.try_get("retry_eligible")?,
            lease_expiry: row.try_get("lease_expiry")?,
            window_start: row.try_get("window_start")?,
            window_end: row.try_get("window_end")?,
            output_path: row.try_get("output_path")?,
            symbols: row.try_get("symbols")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for JobRecord {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<JobStatus>()
            .map_err(|e| StoreError::InvalidRecord(format!("job {}: {e}", row.id)))?;
        Ok(JobRecord {
            id: JobId::new(row.id),
            status,
            locked: row.locked,
            retry_eligible: row.retry_eligible,
            lease_expiry: row.lease_expiry,
            window_start: row.window_start,
            window_end: row.window_end,
            output_path: row.output_path,
            symbols: row.symbols.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug)]
struct AuditRow {
    id: i64,
    job_id: i64,
    status_tag: String,
    description: String,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for AuditRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(AuditRow {
            id: row.try_get("id")?,
            job_id: row.try_get("job_id")?,
            status_tag: row.try_get("status_tag")?,
            description: row.try_get("description")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<AuditRow> for AuditEntry {
    type Error = StoreError;

    fn try_from(row: AuditRow) -> Result<Self, Self::Error> {
        let status_tag = row
            .status_tag
            .parse::<AuditTag>()
            .map_err(|e| StoreError::InvalidRecord(format!("audit {}: {e}", row.id)))?;
        Ok(AuditEntry {
            id: AuditId::new(row.id),
            job_id: JobId::new(row.job_id),
            status_tag,
            description: row.description,
            timestamp: row.created_at,
        })
    }
}
