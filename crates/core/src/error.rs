//! Domain error model.

use thiserror::Error;

use crate::pipeline::JobStatus;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic failures (validation, pipeline graph
/// violations). Storage and collaborator failures belong to the infra layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A status name did not match any pipeline or error status.
    #[error("unknown job status: {0}")]
    UnknownStatus(String),

    /// A stage name did not match any pipeline stage.
    #[error("unknown stage: {0}")]
    UnknownStage(String),

    /// A status change that the pipeline graph does not allow.
    #[error("transition {from} -> {to} is not part of the pipeline")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_transition(from: JobStatus, to: JobStatus) -> Self {
        Self::InvalidTransition { from, to }
    }
}
