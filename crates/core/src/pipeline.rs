//! Pipeline definition: statuses, stages and the transition graph.
//!
//! Every job walks the same forward-only path:
//!
//! ```text
//! READY -> CRAWLING -> CRAWLED -> STAGE_LOADING -> STAGE_LOADED -> TRANSFORMING
//!       -> TRANSFORMED -> WAREHOUSE_LOADING -> WAREHOUSE_LOADED -> AGGREGATING
//!       -> AGGREGATED
//! ```
//!
//! Each stage owns three arrows: precondition -> in-progress (claim),
//! in-progress -> success and in-progress -> error (finalize). Nothing leaves an
//! error status automatically; an operator reset moves it back to the owning
//! stage's precondition.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Position of a job in the pipeline.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Ready,
    Crawling,
    Crawled,
    StageLoading,
    StageLoaded,
    Transforming,
    Transformed,
    WarehouseLoading,
    WarehouseLoaded,
    Aggregating,
    Aggregated,
    ErrCrawl,
    ErrStageLoad,
    ErrTransform,
    ErrWarehouseLoad,
    ErrAggregate,
}

impl JobStatus {
    pub const ALL: [JobStatus; 16] = [
        JobStatus::Ready,
        JobStatus::Crawling,
        JobStatus::Crawled,
        JobStatus::StageLoading,
        JobStatus::StageLoaded,
        JobStatus::Transforming,
        JobStatus::Transformed,
        JobStatus::WarehouseLoading,
        JobStatus::WarehouseLoaded,
        JobStatus::Aggregating,
        JobStatus::Aggregated,
        JobStatus::ErrCrawl,
        JobStatus::ErrStageLoad,
        JobStatus::ErrTransform,
        JobStatus::ErrWarehouseLoad,
        JobStatus::ErrAggregate,
    ];

    /// Canonical name, as stored in the control store.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Ready => "READY",
            JobStatus::Crawling => "CRAWLING",
            JobStatus::Crawled => "CRAWLED",
            JobStatus::StageLoading => "STAGE_LOADING",
            JobStatus::StageLoaded => "STAGE_LOADED",
            JobStatus::Transforming => "TRANSFORMING",
            JobStatus::Transformed => "TRANSFORMED",
            JobStatus::WarehouseLoading => "WAREHOUSE_LOADING",
            JobStatus::WarehouseLoaded => "WAREHOUSE_LOADED",
            JobStatus::Aggregating => "AGGREGATING",
            JobStatus::Aggregated => "AGGREGATED",
            JobStatus::ErrCrawl => "ERR_CRAWL",
            JobStatus::ErrStageLoad => "ERR_STAGE_LOAD",
            JobStatus::ErrTransform => "ERR_TRANSFORM",
            JobStatus::ErrWarehouseLoad => "ERR_WAREHOUSE_LOAD",
            JobStatus::ErrAggregate => "ERR_AGGREGATE",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            JobStatus::ErrCrawl
                | JobStatus::ErrStageLoad
                | JobStatus::ErrTransform
                | JobStatus::ErrWarehouseLoad
                | JobStatus::ErrAggregate
        )
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            JobStatus::Crawling
                | JobStatus::StageLoading
                | JobStatus::Transforming
                | JobStatus::WarehouseLoading
                | JobStatus::Aggregating
        )
    }

    /// The stage that owns this status as its in-progress or error marker.
    pub fn owning_stage(&self) -> Option<Stage> {
        Stage::ALL
            .into_iter()
            .find(|s| s.in_progress() == *self || s.error() == *self)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase();
        JobStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == wanted)
            .ok_or_else(|| DomainError::UnknownStatus(s.to_string()))
    }
}

/// One phase of the pipeline, owned by one worker type.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Crawl,
    StageLoad,
    Transform,
    WarehouseLoad,
    Aggregate,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Crawl,
        Stage::StageLoad,
        Stage::Transform,
        Stage::WarehouseLoad,
        Stage::Aggregate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Crawl => "crawl",
            Stage::StageLoad => "stage_load",
            Stage::Transform => "transform",
            Stage::WarehouseLoad => "warehouse_load",
            Stage::Aggregate => "aggregate",
        }
    }

    pub fn precondition(&self) -> JobStatus {
        match self {
            Stage::Crawl => JobStatus::Ready,
            Stage::StageLoad => JobStatus::Crawled,
            Stage::Transform => JobStatus::StageLoaded,
            Stage::WarehouseLoad => JobStatus::Transformed,
            Stage::Aggregate => JobStatus::WarehouseLoaded,
        }
    }

    pub fn in_progress(&self) -> JobStatus {
        match self {
            Stage::Crawl => JobStatus::Crawling,
            Stage::StageLoad => JobStatus::StageLoading,
            Stage::Transform => JobStatus::Transforming,
            Stage::WarehouseLoad => JobStatus::WarehouseLoading,
            Stage::Aggregate => JobStatus::Aggregating,
        }
    }

    pub fn success(&self) -> JobStatus {
        match self {
            Stage::Crawl => JobStatus::Crawled,
            Stage::StageLoad => JobStatus::StageLoaded,
            Stage::Transform => JobStatus::Transformed,
            Stage::WarehouseLoad => JobStatus::WarehouseLoaded,
            Stage::Aggregate => JobStatus::Aggregated,
        }
    }

    pub fn error(&self) -> JobStatus {
        match self {
            Stage::Crawl => JobStatus::ErrCrawl,
            Stage::StageLoad => JobStatus::ErrStageLoad,
            Stage::Transform => JobStatus::ErrTransform,
            Stage::WarehouseLoad => JobStatus::ErrWarehouseLoad,
            Stage::Aggregate => JobStatus::ErrAggregate,
        }
    }

    /// The stage that consumes this stage's success status, if any.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Crawl => Some(Stage::StageLoad),
            Stage::StageLoad => Some(Stage::Transform),
            Stage::Transform => Some(Stage::WarehouseLoad),
            Stage::WarehouseLoad => Some(Stage::Aggregate),
            Stage::Aggregate => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        Stage::ALL
            .into_iter()
            .find(|st| st.as_str() == wanted)
            .ok_or_else(|| DomainError::UnknownStage(s.to_string()))
    }
}

/// What happens to `retry_eligible` when a stage ends in its error status.
///
/// Stages differ on purpose: some re-arm the job for a later scheduled run,
/// others leave it for manual inspection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorRetryPolicy {
    /// Leave the flag as it was.
    #[default]
    Keep,
    /// Set the flag to true.
    Enable,
    /// Set the flag to false.
    Disable,
}

impl ErrorRetryPolicy {
    /// The flag value to write, or `None` to leave it untouched.
    pub fn update(&self) -> Option<bool> {
        match self {
            ErrorRetryPolicy::Keep => None,
            ErrorRetryPolicy::Enable => Some(true),
            ErrorRetryPolicy::Disable => Some(false),
        }
    }
}

/// A stage expressed as data: its four statuses plus the retry-flag policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub stage: Stage,
    pub precondition: JobStatus,
    pub in_progress: JobStatus,
    pub success: JobStatus,
    pub error: JobStatus,
    /// Value written to `retry_eligible` on success.
    pub retry_on_success: bool,
    pub retry_on_error: ErrorRetryPolicy,
}

impl StageDefinition {
    /// The definition used by the production pipeline.
    pub fn standard(stage: Stage) -> Self {
        let retry_on_error = match stage {
            Stage::Crawl => ErrorRetryPolicy::Enable,
            _ => ErrorRetryPolicy::Keep,
        };
        Self {
            stage,
            precondition: stage.precondition(),
            in_progress: stage.in_progress(),
            success: stage.success(),
            error: stage.error(),
            // The last stage has no consumer; the chain ends there.
            retry_on_success: stage.next().is_some(),
            retry_on_error,
        }
    }

    pub fn with_error_policy(mut self, policy: ErrorRetryPolicy) -> Self {
        self.retry_on_error = policy;
        self
    }
}

/// The ordered set of stages and the rules connecting their statuses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    stages: Vec<StageDefinition>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::standard()
    }
}

impl Pipeline {
    pub fn standard() -> Self {
        Self {
            stages: Stage::ALL.into_iter().map(StageDefinition::standard).collect(),
        }
    }

    /// Override the error retry policy of a single stage.
    pub fn with_error_policy(mut self, stage: Stage, policy: ErrorRetryPolicy) -> Self {
        for def in &mut self.stages {
            if def.stage == stage {
                def.retry_on_error = policy;
            }
        }
        self
    }

    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    pub fn definition(&self, stage: Stage) -> StageDefinition {
        self.stages
            .iter()
            .copied()
            .find(|d| d.stage == stage)
            .unwrap_or_else(|| StageDefinition::standard(stage))
    }

    /// The stage whose in-progress marker is `status`.
    pub fn owner_of_in_progress(&self, status: JobStatus) -> Option<StageDefinition> {
        self.stages.iter().copied().find(|d| d.in_progress == status)
    }

    /// True when `from -> to` is one of the automatic arrows of the graph.
    pub fn is_valid_transition(&self, from: JobStatus, to: JobStatus) -> bool {
        self.stages.iter().any(|d| {
            (d.precondition == from && d.in_progress == to)
                || (d.in_progress == from && (d.success == to || d.error == to))
        })
    }

    pub fn validate_transition(&self, from: JobStatus, to: JobStatus) -> DomainResult<()> {
        if self.is_valid_transition(from, to) {
            Ok(())
        } else {
            Err(DomainError::invalid_transition(from, to))
        }
    }

    /// Where an operator reset sends a job sitting in `error_status`: the last
    /// good forward status, i.e. the owning stage's precondition.
    pub fn reset_target(&self, error_status: JobStatus) -> Option<JobStatus> {
        self.stages
            .iter()
            .find(|d| d.error == error_status)
            .map(|d| d.precondition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn status_names_round_trip() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert_eq!("err_stage_load".parse::<JobStatus>().unwrap(), JobStatus::ErrStageLoad);
        assert!("DONE".parse::<JobStatus>().is_err());
    }

    #[test]
    fn stage_names_accept_dashes() {
        assert_eq!("stage-load".parse::<Stage>().unwrap(), Stage::StageLoad);
        assert_eq!("warehouse_load".parse::<Stage>().unwrap(), Stage::WarehouseLoad);
        assert!("publish".parse::<Stage>().is_err());
    }

    #[test]
    fn stages_chain_success_into_next_precondition() {
        for stage in Stage::ALL {
            if let Some(next) = stage.next() {
                assert_eq!(stage.success(), next.precondition());
            }
        }
        assert_eq!(Stage::Crawl.precondition(), JobStatus::Ready);
        assert_eq!(Stage::Aggregate.success(), JobStatus::Aggregated);
    }

    #[test]
    fn every_error_status_has_exactly_one_owner() {
        let errors: Vec<_> = JobStatus::ALL.into_iter().filter(|s| s.is_error()).collect();
        assert_eq!(errors.len(), Stage::ALL.len());
        for err in errors {
            let owners: Vec<_> = Stage::ALL.into_iter().filter(|s| s.error() == err).collect();
            assert_eq!(owners.len(), 1);
            assert_eq!(err.owning_stage(), Some(owners[0]));
        }
    }

    #[test]
    fn error_only_reachable_from_owning_in_progress() {
        let pipeline = Pipeline::standard();
        assert!(pipeline.is_valid_transition(JobStatus::StageLoading, JobStatus::ErrStageLoad));
        assert!(!pipeline.is_valid_transition(JobStatus::Crawled, JobStatus::ErrStageLoad));
        assert!(!pipeline.is_valid_transition(JobStatus::Crawling, JobStatus::ErrStageLoad));
    }

    #[test]
    fn nothing_leaves_an_error_status_automatically() {
        let pipeline = Pipeline::standard();
        for from in JobStatus::ALL.into_iter().filter(|s| s.is_error()) {
            for to in JobStatus::ALL {
                assert!(!pipeline.is_valid_transition(from, to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn reset_returns_to_last_good_status() {
        let pipeline = Pipeline::standard();
        assert_eq!(pipeline.reset_target(JobStatus::ErrCrawl), Some(JobStatus::Ready));
        assert_eq!(
            pipeline.reset_target(JobStatus::ErrWarehouseLoad),
            Some(JobStatus::Transformed)
        );
        assert_eq!(pipeline.reset_target(JobStatus::Crawled), None);
    }

    #[test]
    fn standard_retry_policies() {
        let pipeline = Pipeline::standard();
        assert_eq!(
            pipeline.definition(Stage::Crawl).retry_on_error,
            ErrorRetryPolicy::Enable
        );
        assert_eq!(
            pipeline.definition(Stage::StageLoad).retry_on_error,
            ErrorRetryPolicy::Keep
        );
        assert!(pipeline.definition(Stage::WarehouseLoad).retry_on_success);
        assert!(!pipeline.definition(Stage::Aggregate).retry_on_success);

        let tuned = pipeline.with_error_policy(Stage::Transform, ErrorRetryPolicy::Disable);
        assert_eq!(tuned.definition(Stage::Transform).retry_on_error.update(), Some(false));
    }

    fn any_status() -> impl Strategy<Value = JobStatus> {
        prop::sample::select(JobStatus::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn valid_transitions_never_move_backwards(from in any_status(), to in any_status()) {
            let pipeline = Pipeline::standard();
            if pipeline.is_valid_transition(from, to) {
                let index = |s: JobStatus| JobStatus::ALL.iter().position(|x| *x == s).unwrap();
                if to.is_error() {
                    prop_assert!(from.is_in_progress());
                    prop_assert_eq!(from.owning_stage(), to.owning_stage());
                } else {
                    prop_assert_eq!(index(to), index(from) + 1);
                }
            }
        }

        #[test]
        fn random_walks_stay_on_the_graph(choices in prop::collection::vec(any::<bool>(), 0..12)) {
            let pipeline = Pipeline::standard();
            let mut current = JobStatus::Ready;
            let mut path = vec![current];
            for fail in choices {
                let Some(def) = pipeline.stages().iter().find(|d| d.precondition == current) else {
                    break;
                };
                let outcome = if fail { def.error } else { def.success };
                path.push(def.in_progress);
                path.push(outcome);
                current = outcome;
            }
            for pair in path.windows(2) {
                prop_assert!(pipeline.is_valid_transition(pair[0], pair[1]));
            }
        }
    }
}
