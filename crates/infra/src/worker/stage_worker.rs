use chrono::{DateTime, Duration, Utc};
use tracing::{error, info, warn};

use marketflow_core::{AuditTag, JobId, JobRecord, JobStatus, Stage, StageDefinition};

use super::{ExecutionReport, StageExecutor};
use crate::control_store::{ClaimRequest, ControlStore, StoreError, Transition};

/// Stage worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long a claim stays valid before the lease sweep may reclaim it.
    pub lease_duration: Duration,
    /// Name recorded in the `CLAIMED` audit entry and in logs.
    pub worker_name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::seconds(1800),
            worker_name: "marketflow-worker".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }
}

/// Terminal outcome of one worker invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// No job in the precondition status was free.
    Idle,
    /// Another worker claimed the candidate first.
    ClaimConflict { job_id: JobId },
    /// The job moved to the stage's success status.
    Advanced {
        job_id: JobId,
        status: JobStatus,
        report: ExecutionReport,
    },
    /// The job moved to the stage's error status.
    Failed {
        job_id: JobId,
        status: JobStatus,
        reason: String,
        report: ExecutionReport,
    },
}

impl StageOutcome {
    /// Process exit code: 0 advanced or nothing to do, 1 moved to error.
    pub fn exit_code(&self) -> i32 {
        match self {
            StageOutcome::Failed { .. } => 1,
            _ => 0,
        }
    }

    pub fn job_id(&self) -> Option<JobId> {
        match self {
            StageOutcome::Idle => None,
            StageOutcome::ClaimConflict { job_id }
            | StageOutcome::Advanced { job_id, .. }
            | StageOutcome::Failed { job_id, .. } => Some(*job_id),
        }
    }

    /// One human-readable line describing the invocation.
    pub fn summary(&self, stage: Stage) -> String {
        match self {
            StageOutcome::Idle => format!("{stage}: no claimable job in {}", stage.precondition()),
            StageOutcome::ClaimConflict { job_id } => {
                format!("{stage}: job {job_id} was claimed by another worker")
            }
            StageOutcome::Advanced {
                job_id,
                status,
                report,
            } => format!(
                "{stage}: job {job_id} -> {status} ({} succeeded, {} failed)",
                report.succeeded,
                report.failed()
            ),
            StageOutcome::Failed {
                job_id,
                status,
                reason,
                report,
            } => format!(
                "{stage}: job {job_id} -> {status} ({} succeeded, {} failed): {reason}",
                report.succeeded,
                report.failed()
            ),
        }
    }
}

/// Worker invocation aborted.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Discovery or claim could not reach the store; nothing was changed.
    #[error("control store error: {0}")]
    Store(#[from] StoreError),

    /// The job was claimed and executed but its terminal transition was not
    /// written. Unless the sweep already reclaimed the job (`OwnershipLost`),
    /// the lock stays held until it does.
    #[error("failed to finalize job {job_id}: {source}")]
    Finalize {
        job_id: JobId,
        #[source]
        source: StoreError,
    },
}

/// Generic claim → execute → finalize worker for one stage.
pub struct StageWorker<S, E> {
    store: S,
    executor: E,
    definition: StageDefinition,
    config: WorkerConfig,
}

impl<S, E> StageWorker<S, E>
where
    S: ControlStore,
    E: StageExecutor,
{
    pub fn new(store: S, executor: E, definition: StageDefinition, config: WorkerConfig) -> Self {
        Self {
            store,
            executor,
            definition,
            config,
        }
    }

    pub fn definition(&self) -> &StageDefinition {
        &self.definition
    }

    pub async fn run_once(&self) -> Result<StageOutcome, WorkerError> {
        self.run_once_at(Utc::now()).await
    }

    /// Run one invocation with `now` as the claim time.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Result<StageOutcome, WorkerError> {
        let def = &self.definition;
        let stage = def.stage;

        let Some(candidate) = self.store.find_candidate(def.precondition).await? else {
            info!(stage = %stage, precondition = %def.precondition, "no claimable job");
            return Ok(StageOutcome::Idle);
        };
        let job_id = candidate.id;

        let lease_expiry = now + self.config.lease_duration;
        let request = ClaimRequest {
            job_id,
            precondition: def.precondition,
            in_progress: def.in_progress,
            lease_expiry,
            description: format!(
                "{} claimed job for {stage}, lease until {}",
                self.config.worker_name,
                lease_expiry.to_rfc3339()
            ),
        };
        if !self.store.claim(&request).await? {
            info!(stage = %stage, job_id = %job_id, "claim lost to another worker");
            return Ok(StageOutcome::ClaimConflict { job_id });
        }
        info!(stage = %stage, job_id = %job_id, status = %def.in_progress, "job claimed");

        let job = JobRecord {
            status: def.in_progress,
            locked: true,
            lease_expiry: Some(lease_expiry),
            ..candidate
        };

        let (report, failure_reason) = match self.executor.execute(&job).await {
            Ok(report) if report.is_success() => (report, None),
            Ok(report) => {
                let reason = if report.failures.is_empty() {
                    "stage produced no output".to_string()
                } else {
                    format!("all {} units failed", report.failed())
                };
                (report, Some(reason))
            }
            Err(err) => (ExecutionReport::default(), Some(err.to_string())),
        };

        for failure in &report.failures {
            warn!(
                stage = %stage,
                job_id = %job_id,
                unit = %failure.unit,
                reason = %failure.reason,
                "unit failed"
            );
            // The audit trail is diagnostic; a lost WARN entry must not block finalize.
            if let Err(err) = self
                .store
                .append_audit(
                    job_id,
                    AuditTag::Warn,
                    &format!("{}: {}", failure.unit, failure.reason),
                )
                .await
            {
                warn!(job_id = %job_id, error = %err, "failed to record unit failure");
            }
        }

        let transition = match &failure_reason {
            None => Transition {
                from: def.in_progress,
                to: def.success,
                retry_eligible: Some(def.retry_on_success),
                tag: AuditTag::Success,
                description: format!(
                    "{stage} completed: {} succeeded, {} failed",
                    report.succeeded,
                    report.failed()
                ),
            },
            Some(reason) => Transition {
                from: def.in_progress,
                to: def.error,
                retry_eligible: def.retry_on_error.update(),
                tag: AuditTag::Err,
                description: format!("{stage} failed: {reason}"),
            },
        };

        if let Err(source) = self.store.finalize(job_id, &transition).await {
            match &source {
                StoreError::OwnershipLost { .. } => error!(
                    stage = %stage,
                    job_id = %job_id,
                    target = %transition.to,
                    "failed to finalize job; the lease was already reclaimed"
                ),
                _ => error!(
                    stage = %stage,
                    job_id = %job_id,
                    target = %transition.to,
                    error = %source,
                    "failed to finalize job; lock is held until the lease expires"
                ),
            }
            return Err(WorkerError::Finalize { job_id, source });
        }

        match failure_reason {
            None => {
                info!(
                    stage = %stage,
                    job_id = %job_id,
                    status = %def.success,
                    succeeded = report.succeeded,
                    failed = report.failed(),
                    "job advanced"
                );
                Ok(StageOutcome::Advanced {
                    job_id,
                    status: def.success,
                    report,
                })
            }
            Some(reason) => {
                warn!(
                    stage = %stage,
                    job_id = %job_id,
                    status = %def.error,
                    reason = %reason,
                    "job failed"
                );
                Ok(StageOutcome::Failed {
                    job_id,
                    status: def.error,
                    reason,
                    report,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;

    use chrono::NaiveDate;
    use marketflow_core::{NewJob, Pipeline};

    use super::*;
    use crate::control_store::InMemoryControlStore;
    use crate::worker::ExecutionError;

    /// Executor returning a canned result and remembering what it saw.
    struct Scripted {
        result: Mutex<Option<Result<ExecutionReport, ExecutionError>>>,
        seen: Mutex<Vec<JobRecord>>,
    }

    impl Scripted {
        fn new(result: Result<ExecutionReport, ExecutionError>) -> Self {
            Self {
                result: Mutex::new(Some(result)),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl StageExecutor for Scripted {
        async fn execute(&self, job: &JobRecord) -> Result<ExecutionReport, ExecutionError> {
            self.seen.lock().unwrap().push(job.clone());
            self.result
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| Ok(ExecutionReport::single()))
        }
    }

    fn new_job() -> NewJob {
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        NewJob::new(day, day, "/tmp/out", vec!["VCB".into(), "FPT".into()])
    }

    fn worker(
        store: Arc<InMemoryControlStore>,
        stage: Stage,
        result: Result<ExecutionReport, ExecutionError>,
    ) -> StageWorker<Arc<InMemoryControlStore>, Scripted> {
        StageWorker::new(
            store,
            Scripted::new(result),
            Pipeline::standard().definition(stage),
            WorkerConfig::default().with_name("test-worker"),
        )
    }

    #[tokio::test]
    async fn idle_when_nothing_matches() {
        let store = InMemoryControlStore::arc();
        let w = worker(store, Stage::StageLoad, Ok(ExecutionReport::single()));
        assert_eq!(w.run_once().await.unwrap(), StageOutcome::Idle);
    }

    #[tokio::test]
    async fn executor_sees_claimed_job() {
        let store = InMemoryControlStore::arc();
        let job = store.create_job(new_job()).await.unwrap();
        let w = worker(store.clone(), Stage::Crawl, Ok(ExecutionReport::single()));

        let now = Utc::now();
        w.run_once_at(now).await.unwrap();

        let seen = w.executor.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].id, job.id);
        assert_eq!(seen[0].status, JobStatus::Crawling);
        assert!(seen[0].locked);
        assert_eq!(seen[0].lease_expiry, Some(now + Duration::seconds(1800)));
    }

    #[tokio::test]
    async fn partial_failure_advances_with_warnings() {
        let store = InMemoryControlStore::arc();
        let job = store.create_job(new_job()).await.unwrap();
        let mut report = ExecutionReport::default();
        report.record_success();
        report.record_failure("FPT", "upstream returned 502");
        let w = worker(store.clone(), Stage::Crawl, Ok(report));

        let outcome = w.run_once().await.unwrap();
        assert!(matches!(
            outcome,
            StageOutcome::Advanced { status: JobStatus::Crawled, .. }
        ));
        assert_eq!(outcome.exit_code(), 0);

        let tags: Vec<AuditTag> = store
            .audit_log(job.id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.status_tag)
            .collect();
        assert_eq!(tags, vec![AuditTag::Claimed, AuditTag::Warn, AuditTag::Success]);
    }

    #[tokio::test]
    async fn all_units_failing_moves_to_error() {
        let store = InMemoryControlStore::arc();
        let job = store.create_job(new_job()).await.unwrap();
        let mut report = ExecutionReport::default();
        report.record_failure("VCB", "timeout");
        report.record_failure("FPT", "timeout");
        let w = worker(store.clone(), Stage::Crawl, Ok(report));

        let outcome = w.run_once().await.unwrap();
        assert_eq!(outcome.exit_code(), 1);

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::ErrCrawl);
        assert!(!stored.locked);
        assert!(stored.lease_expiry.is_none());
        // Crawl re-arms failed jobs.
        assert!(stored.retry_eligible);
    }

    #[tokio::test]
    async fn aggregate_success_ends_the_chain() {
        let store = InMemoryControlStore::arc();
        let mut job = store.create_job(new_job()).await.unwrap();
        job.status = JobStatus::WarehouseLoaded;
        store.put_job(job.clone()).unwrap();
        let w = worker(store.clone(), Stage::Aggregate, Ok(ExecutionReport::single()));

        w.run_once().await.unwrap();

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Aggregated);
        assert!(!stored.retry_eligible);
    }

    #[tokio::test]
    async fn unreachable_store_aborts_without_changes() {
        let store = InMemoryControlStore::arc();
        let job = store.create_job(new_job()).await.unwrap();
        store.set_unavailable(true);
        let w = worker(store.clone(), Stage::Crawl, Ok(ExecutionReport::single()));

        let err = w.run_once().await.unwrap_err();
        assert!(matches!(err, WorkerError::Store(ref e) if e.is_unavailable()));

        store.set_unavailable(false);
        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Ready);
        assert!(w.executor.seen.lock().unwrap().is_empty());
    }

    /// Has its lease reclaimed while it works.
    struct ReclaimedMidway {
        store: Arc<InMemoryControlStore>,
    }

    #[async_trait::async_trait]
    impl StageExecutor for ReclaimedMidway {
        async fn execute(&self, job: &JobRecord) -> Result<ExecutionReport, ExecutionError> {
            let reclaim = Transition {
                from: JobStatus::Crawling,
                to: JobStatus::ErrCrawl,
                retry_eligible: None,
                tag: AuditTag::Err,
                description: "lease expired".into(),
            };
            self.store.finalize(job.id, &reclaim).await.unwrap();
            Ok(ExecutionReport::single())
        }
    }

    #[tokio::test]
    async fn late_finalize_after_reclaim_reports_ownership_lost() {
        let store = InMemoryControlStore::arc();
        let job = store.create_job(new_job()).await.unwrap();
        let w = StageWorker::new(
            store.clone(),
            ReclaimedMidway {
                store: store.clone(),
            },
            Pipeline::standard().definition(Stage::Crawl),
            WorkerConfig::default(),
        );

        let err = w.run_once().await.unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Finalize {
                source: StoreError::OwnershipLost { .. },
                ..
            }
        ));

        // The reclaim stands; the late success did not overwrite it.
        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::ErrCrawl);
        assert!(!stored.locked);
    }

    #[test]
    fn summary_names_stage_job_and_status() {
        let outcome = StageOutcome::Advanced {
            job_id: JobId::new(4),
            status: JobStatus::Crawled,
            report: ExecutionReport {
                succeeded: 2,
                failures: vec![super::super::UnitFailure::new("FPT", "404")],
            },
        };
        assert_eq!(
            outcome.summary(Stage::Crawl),
            "crawl: job 4 -> CRAWLED (2 succeeded, 1 failed)"
        );
        assert_eq!(
            StageOutcome::Idle.summary(Stage::Transform),
            "transform: no claimable job in STAGE_LOADED"
        );
    }
}
