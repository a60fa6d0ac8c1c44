//! In-memory control store for tests/dev.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use marketflow_core::{AuditEntry, AuditId, AuditTag, JobId, JobRecord, JobStatus, NewJob};

use super::{ClaimRequest, ControlStore, StoreError, Transition};

#[derive(Debug, Default)]
struct State {
    jobs: BTreeMap<JobId, JobRecord>,
    audit: Vec<AuditEntry>,
    last_job_id: i64,
    last_audit_id: i64,
}

impl State {
    fn push_audit(&mut self, job_id: JobId, tag: AuditTag, description: &str, at: DateTime<Utc>) {
        self.last_audit_id += 1;
        self.audit.push(AuditEntry {
            id: AuditId::new(self.last_audit_id),
            job_id,
            status_tag: tag,
            description: description.to_string(),
            timestamp: at,
        });
    }
}

/// In-memory control store.
///
/// All state lives behind one mutex, so every operation is atomic with respect
/// to every other. `set_unavailable` simulates an unreachable database.
#[derive(Debug, Default)]
pub struct InMemoryControlStore {
    state: Mutex<State>,
    unavailable: AtomicBool,
}

impl InMemoryControlStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make every subsequent operation fail with `StoreError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Overwrite a job record as-is (tests and fixtures only need this).
    pub fn put_job(&self, job: JobRecord) -> Result<(), StoreError> {
        let mut state = self.state()?;
        state.last_job_id = state.last_job_id.max(job.id.get());
        state.jobs.insert(job.id, job);
        Ok(())
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store switched off".into()));
        }
        self.state
            .lock()
            .map_err(|_| StoreError::Storage("in-memory store lock poisoned".into()))
    }
}

fn apply_transition(job: &mut JobRecord, transition: &Transition, now: DateTime<Utc>) {
    job.status = transition.to;
    job.locked = false;
    job.lease_expiry = None;
    if let Some(flag) = transition.retry_eligible {
        job.retry_eligible = flag;
    }
    job.updated_at = now;
}

#[async_trait::async_trait]
impl ControlStore for InMemoryControlStore {
    async fn create_job(&self, job: NewJob) -> Result<JobRecord, StoreError> {
        let job = job
            .validated()
            .map_err(|e| StoreError::InvalidRecord(e.to_string()))?;
        let mut state = self.state()?;
        let now = Utc::now();
        state.last_job_id += 1;
        let record = JobRecord {
            id: JobId::new(state.last_job_id),
            status: JobStatus::Ready,
            locked: false,
            retry_eligible: true,
            lease_expiry: None,
            window_start: job.window_start,
            window_end: job.window_end,
            output_path: job.output_path,
            symbols: job.symbols,
            created_at: now,
            updated_at: now,
        };
        state.jobs.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.state()?.jobs.get(&job_id).cloned())
    }

    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let state = self.state()?;
        Ok(state
            .jobs
            .values()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_candidate(
        &self,
        precondition: JobStatus,
    ) -> Result<Option<JobRecord>, StoreError> {
        let state = self.state()?;
        // BTreeMap iterates in id order, i.e. oldest first.
        Ok(state
            .jobs
            .values()
            .find(|j| j.status == precondition && !j.locked && j.retry_eligible)
            .cloned())
    }

    async fn claim(&self, request: &ClaimRequest) -> Result<bool, StoreError> {
        let mut state = self.state()?;
        let now = Utc::now();
        let Some(job) = state.jobs.get_mut(&request.job_id) else {
            return Ok(false);
        };
        if job.status != request.precondition || job.locked || !job.retry_eligible {
            return Ok(false);
        }
        job.status = request.in_progress;
        job.locked = true;
        job.lease_expiry = Some(request.lease_expiry);
        job.updated_at = now;
        state.push_audit(request.job_id, AuditTag::Claimed, &request.description, now);
        Ok(true)
    }

    async fn finalize(&self, job_id: JobId, transition: &Transition) -> Result<(), StoreError> {
        let mut state = self.state()?;
        let now = Utc::now();
        let job = state.jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        if job.status != transition.from || !job.locked {
            return Err(StoreError::OwnershipLost {
                job_id,
                expected: transition.from,
            });
        }
        apply_transition(job, transition, now);
        state.push_audit(job_id, transition.tag, &transition.description, now);
        Ok(())
    }

    async fn append_audit(
        &self,
        job_id: JobId,
        tag: AuditTag,
        description: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state()?;
        if !state.jobs.contains_key(&job_id) {
            return Err(StoreError::NotFound(job_id));
        }
        state.push_audit(job_id, tag, description, Utc::now());
        Ok(())
    }

    async fn audit_log(&self, job_id: JobId) -> Result<Vec<AuditEntry>, StoreError> {
        let state = self.state()?;
        Ok(state
            .audit
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<JobRecord>, StoreError> {
        let state = self.state()?;
        Ok(state
            .jobs
            .values()
            .filter(|j| j.is_lease_expired(now))
            .cloned()
            .collect())
    }

    async fn reset(&self, job_id: JobId, transition: &Transition) -> Result<(), StoreError> {
        let mut state = self.state()?;
        let now = Utc::now();
        let job = state.jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        if job.status != transition.from || job.locked {
            return Err(StoreError::StatusMismatch {
                job_id,
                expected: transition.from,
            });
        }
        apply_transition(job, transition, now);
        state.push_audit(job_id, transition.tag, &transition.description, now);
        Ok(())
    }
}
