//! Lease/recovery: reclaim jobs whose worker died mid-stage.
//!
//! A sweep moves every locked job past its lease into the owning stage's error
//! status through the same guarded `finalize` a worker uses, so a late
//! finalize from the original worker and the sweep cannot both win.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use marketflow_core::{AuditTag, JobId, JobStatus, Pipeline};

use crate::control_store::{ControlStore, StoreError, Transition};

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Jobs moved to their error status.
    pub reclaimed: Vec<(JobId, JobStatus)>,
    /// Jobs that finished (or were reclaimed) between discovery and the guarded write.
    pub skipped: Vec<JobId>,
}

impl SweepReport {
    pub fn summary(&self) -> String {
        format!(
            "sweep: {} reclaimed, {} skipped",
            self.reclaimed.len(),
            self.skipped.len()
        )
    }
}

pub struct LeaseManager<S> {
    store: S,
    pipeline: Pipeline,
}

impl<S: ControlStore> LeaseManager<S> {
    pub fn new(store: S, pipeline: Pipeline) -> Self {
        Self { store, pipeline }
    }

    pub async fn sweep(&self) -> Result<SweepReport, StoreError> {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let mut report = SweepReport::default();

        for job in self.store.expired_leases(now).await? {
            let Some(def) = self.pipeline.owner_of_in_progress(job.status) else {
                // A lock outside an in-progress status has no stage to fail into.
                warn!(job_id = %job.id, status = %job.status, "expired lease on non-running job");
                report.skipped.push(job.id);
                continue;
            };

            let expired_at = job
                .lease_expiry
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "unknown".to_string());
            let transition = Transition {
                from: def.in_progress,
                to: def.error,
                retry_eligible: def.retry_on_error.update(),
                tag: AuditTag::Err,
                description: format!(
                    "lease expired at {expired_at} during {}; reclaimed at {}",
                    def.stage,
                    now.to_rfc3339()
                ),
            };

            match self.store.finalize(job.id, &transition).await {
                Ok(()) => {
                    info!(job_id = %job.id, stage = %def.stage, status = %def.error, "lease reclaimed");
                    report.reclaimed.push((job.id, def.error));
                }
                Err(StoreError::OwnershipLost { .. }) => {
                    info!(job_id = %job.id, "job released before reclaim");
                    report.skipped.push(job.id);
                }
                Err(err) => return Err(err),
            }
        }

        Ok(report)
    }
}
