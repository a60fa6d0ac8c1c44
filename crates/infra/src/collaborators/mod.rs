//! External collaborators consumed by the stage executors.
//!
//! Each collaborator sits behind a narrow trait so the stage logic can be
//! exercised against in-memory doubles:
//!
//! - `MarketDataFetcher`: per-symbol market snapshot (HTTP in production)
//! - `FileStore`: the five per-job CSV datasets on disk
//! - `StagingSink`: the raw staging row consumed by the transform procedures
//! - `ProcedureRunner`: opaque stored procedures
//! - `WarehouseDatabase`: the pool both Postgres collaborators run on

pub mod file_store;
pub mod market_data;
pub mod procedures;
pub mod staging;
pub mod warehouse;

pub use file_store::FileStore;
pub use market_data::{
    Dataset, DatasetKind, HttpMarketDataFetcher, MarketDataFetcher, MarketSnapshot,
};
pub use procedures::{
    PgProcedureRunner, ProcedureArg, ProcedureCall, ProcedureRunner, RecordingProcedureRunner,
};
pub use staging::{InMemoryStagingSink, PgStagingSink, StagingPayload, StagingSink};
pub use warehouse::WarehouseDatabase;

/// Failure reported by an external collaborator.
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    /// The request never produced a response (connect, timeout, TLS).
    #[error("request failed: {0}")]
    Transport(String),

    #[error("upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("{path}: {message}")]
    File { path: String, message: String },

    #[error("database error: {0}")]
    Database(String),

    #[error("procedure {name} failed: {message}")]
    Procedure { name: String, message: String },

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("misconfigured: {0}")]
    Misconfigured(String),
}

impl CollaboratorError {
    pub(crate) fn file(path: &std::path::Path, message: impl std::fmt::Display) -> Self {
        CollaboratorError::File {
            path: path.display().to_string(),
            message: message.to_string(),
        }
    }
}
