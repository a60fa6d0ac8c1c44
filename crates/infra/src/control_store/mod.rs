//! Control store: the authoritative job table plus its append-only audit log.
//!
//! ## Design
//!
//! - The store is the only shared mutable state between worker processes
//! - `claim` is a single conditional write; its affected-row count decides ownership
//! - Every status change is written together with its audit entry
//! - `finalize` is guarded on the in-progress status and the lock, so a worker
//!   whose lease was reclaimed cannot overwrite the reclaimed status
//!
//! ## Implementations
//!
//! - `InMemoryControlStore`: tests/dev, a single mutex around all state
//! - `PostgresControlStore`: production, sqlx transactions

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use marketflow_core::{AuditEntry, AuditTag, JobId, JobRecord, JobStatus, NewJob};

pub use in_memory::InMemoryControlStore;
pub use postgres::PostgresControlStore;

/// Atomic claim of one job by one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRequest {
    pub job_id: JobId,
    pub precondition: JobStatus,
    pub in_progress: JobStatus,
    pub lease_expiry: DateTime<Utc>,
    /// Text of the `CLAIMED` audit entry written with the claim.
    pub description: String,
}

/// A guarded status change with its audit entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// Status the job must currently hold.
    pub from: JobStatus,
    pub to: JobStatus,
    /// New `retry_eligible` value, or `None` to keep it.
    pub retry_eligible: Option<bool>,
    pub tag: AuditTag,
    pub description: String,
}

/// Control store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached; nothing was written.
    #[error("control store unavailable: {0}")]
    Unavailable(String),
    #[error("job not found: {0}")]
    NotFound(JobId),
    /// The guarded write matched no row: the job left `expected` (for example a
    /// lease sweep reclaimed it) or was never locked.
    #[error("job {job_id} is no longer held in status {expected}")]
    OwnershipLost { job_id: JobId, expected: JobStatus },
    /// A reset found the job in a different status or still locked.
    #[error("job {job_id} is not an unlocked job in status {expected}")]
    StatusMismatch { job_id: JobId, expected: JobStatus },
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Control store abstraction.
#[async_trait::async_trait]
pub trait ControlStore: Send + Sync {
    /// Create a job in `READY` with `retry_eligible = true`.
    async fn create_job(&self, job: NewJob) -> Result<JobRecord, StoreError>;

    /// Get a job by ID.
    async fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>, StoreError>;

    /// List jobs, oldest first, optionally filtered by status.
    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError>;

    /// Oldest unlocked, retry-eligible job in `precondition`. Read-only.
    async fn find_candidate(&self, precondition: JobStatus)
    -> Result<Option<JobRecord>, StoreError>;

    /// Atomically take ownership of a job.
    ///
    /// Returns `Ok(false)` when the job no longer matches (another worker won).
    async fn claim(&self, request: &ClaimRequest) -> Result<bool, StoreError>;

    /// Release the lock and apply `transition`, guarded on `transition.from`
    /// and `locked = true`.
    async fn finalize(&self, job_id: JobId, transition: &Transition) -> Result<(), StoreError>;

    /// Append a non-transition audit entry.
    async fn append_audit(
        &self,
        job_id: JobId,
        tag: AuditTag,
        description: &str,
    ) -> Result<(), StoreError>;

    /// Audit entries of a job in insertion order.
    async fn audit_log(&self, job_id: JobId) -> Result<Vec<AuditEntry>, StoreError>;

    /// Locked jobs whose lease ended before `now`.
    async fn expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<JobRecord>, StoreError>;

    /// Operator re-entry: apply `transition` to an unlocked job in `transition.from`.
    async fn reset(&self, job_id: JobId, transition: &Transition) -> Result<(), StoreError>;
}

#[async_trait::async_trait]
impl<T: ControlStore + ?Sized> ControlStore for Arc<T> {
    async fn create_job(&self, job: NewJob) -> Result<JobRecord, StoreError> {
        (**self).create_job(job).await
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>, StoreError> {
        (**self).get_job(job_id).await
    }

    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        (**self).list_jobs(status, limit).await
    }

    async fn find_candidate(
        &self,
        precondition: JobStatus,
    ) -> Result<Option<JobRecord>, StoreError> {
        (**self).find_candidate(precondition).await
    }

    async fn claim(&self, request: &ClaimRequest) -> Result<bool, StoreError> {
        (**self).claim(request).await
    }

    async fn finalize(&self, job_id: JobId, transition: &Transition) -> Result<(), StoreError> {
        (**self).finalize(job_id, transition).await
    }

    async fn append_audit(
        &self,
        job_id: JobId,
        tag: AuditTag,
        description: &str,
    ) -> Result<(), StoreError> {
        (**self).append_audit(job_id, tag, description).await
    }

    async fn audit_log(&self, job_id: JobId) -> Result<Vec<AuditEntry>, StoreError> {
        (**self).audit_log(job_id).await
    }

    async fn expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<JobRecord>, StoreError> {
        (**self).expired_leases(now).await
    }

    async fn reset(&self, job_id: JobId, transition: &Transition) -> Result<(), StoreError> {
        (**self).reset(job_id, transition).await
    }
}
