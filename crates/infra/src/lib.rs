//! Infrastructure layer: control store, stage worker, lease recovery,
//! external collaborators and configuration.

pub mod collaborators;
pub mod config;
pub mod control_store;
pub mod lease;
pub mod stages;
pub mod worker;

pub use config::{AppConfig, ConfigError};
pub use control_store::{
    ClaimRequest, ControlStore, InMemoryControlStore, PostgresControlStore, StoreError, Transition,
};
pub use lease::{LeaseManager, SweepReport};
pub use worker::{
    ExecutionError, ExecutionReport, StageExecutor, StageOutcome, StageWorker, WorkerConfig,
    WorkerError,
};
