//! `marketflow-core`: job-control building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the pipeline graph, and the job/audit record types.

pub mod error;
pub mod id;
pub mod job;
pub mod pipeline;

pub use error::{DomainError, DomainResult};
pub use id::{AuditId, JobId};
pub use job::{AuditEntry, AuditTag, JobRecord, NewJob};
pub use pipeline::{ErrorRetryPolicy, JobStatus, Pipeline, Stage, StageDefinition};
