//! Generic stage worker: claim → execute → finalize.
//!
//! ## Design
//!
//! - One `StageWorker` type serves all five stages; a `StageDefinition` supplies
//!   the statuses and retry policy, a `StageExecutor` supplies the work
//! - An invocation handles at most one job and never waits on another worker
//! - Per-unit failures become `WARN` audit entries; the stage succeeds while at
//!   least one unit produced output

pub mod stage_worker;

use marketflow_core::JobRecord;

use crate::collaborators::CollaboratorError;

pub use stage_worker::{StageOutcome, StageWorker, WorkerConfig, WorkerError};

/// One unit of a stage that failed without aborting the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitFailure {
    /// What failed, e.g. a ticker symbol.
    pub unit: String,
    pub reason: String,
}

impl UnitFailure {
    pub fn new(unit: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            reason: reason.into(),
        }
    }
}

/// Outcome of a stage that ran to the end of its batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    pub succeeded: usize,
    pub failures: Vec<UnitFailure>,
}

impl ExecutionReport {
    /// A report for a stage with a single all-or-nothing unit.
    pub fn single() -> Self {
        Self {
            succeeded: 1,
            failures: Vec::new(),
        }
    }

    pub fn record_success(&mut self) {
        self.succeeded += 1;
    }

    pub fn record_failure(&mut self, unit: impl Into<String>, reason: impl Into<String>) {
        self.failures.push(UnitFailure::new(unit, reason));
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    /// Success iff at least one unit produced output.
    pub fn is_success(&self) -> bool {
        self.succeeded > 0
    }
}

/// Total failure of a stage: nothing usable was produced.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// Inputs the stage reads are absent.
    #[error("missing input files: {}", .0.join(", "))]
    MissingInputs(Vec<String>),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    /// The job record cannot be processed by this stage.
    #[error("invalid job: {0}")]
    InvalidJob(String),
}

/// The per-stage work performed between claim and finalize.
#[async_trait::async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(&self, job: &JobRecord) -> Result<ExecutionReport, ExecutionError>;
}

#[async_trait::async_trait]
impl<T: StageExecutor + ?Sized> StageExecutor for std::sync::Arc<T> {
    async fn execute(&self, job: &JobRecord) -> Result<ExecutionReport, ExecutionError> {
        (**self).execute(job).await
    }
}

#[async_trait::async_trait]
impl<T: StageExecutor + ?Sized> StageExecutor for Box<T> {
    async fn execute(&self, job: &JobRecord) -> Result<ExecutionReport, ExecutionError> {
        (**self).execute(job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_needs_one_success() {
        let mut report = ExecutionReport::default();
        assert!(!report.is_success());
        report.record_failure("VCB", "timeout");
        assert!(!report.is_success());
        report.record_success();
        assert!(report.is_success());
        assert_eq!(report.failed(), 1);
    }

    #[test]
    fn missing_inputs_lists_every_file() {
        let err = ExecutionError::MissingInputs(vec![
            "finance_ratio_2024-03-01.csv".into(),
            "price_history_2024-03-01.csv".into(),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("finance_ratio_2024-03-01.csv"));
        assert!(msg.contains("price_history_2024-03-01.csv"));
    }
}
