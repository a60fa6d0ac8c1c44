//! Stored procedures invoked by the transform, warehouse-load and aggregate stages.
//!
//! Procedures are opaque: the runner only reports success or failure. Names are
//! interpolated into the `CALL` statement, so they are validated as (optionally
//! schema-qualified) SQL identifiers; arguments are always bound.

use core::fmt;
use std::sync::Mutex;

use serde_json::Value;
use sqlx::PgPool;
use tracing::{debug, instrument};

use super::CollaboratorError;

#[derive(Debug, Clone, PartialEq)]
pub enum ProcedureArg {
    Json(Value),
    Text(String),
}

/// A validated procedure invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcedureCall {
    name: String,
    args: Vec<ProcedureArg>,
}

impl ProcedureCall {
    pub fn new(name: impl Into<String>) -> Result<Self, CollaboratorError> {
        let name = name.into();
        validate_identifier(&name)?;
        Ok(Self {
            name,
            args: Vec::new(),
        })
    }

    pub fn arg(mut self, arg: ProcedureArg) -> Self {
        self.args.push(arg);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[ProcedureArg] {
        &self.args
    }

    /// `CALL name($1, ..., $n)`
    pub fn statement(&self) -> String {
        let placeholders: Vec<String> = (1..=self.args.len()).map(|i| format!("${i}")).collect();
        format!("CALL {}({})", self.name, placeholders.join(", "))
    }
}

impl fmt::Display for ProcedureCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// `schema.name` or `name`, each part `[A-Za-z_][A-Za-z0-9_]*`.
pub fn validate_identifier(name: &str) -> Result<(), CollaboratorError> {
    let parts: Vec<&str> = name.split('.').collect();
    let valid_part = |part: &str| {
        let mut chars = part.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    if parts.len() > 2 || !parts.iter().all(|p| valid_part(p)) {
        return Err(CollaboratorError::InvalidIdentifier(name.to_string()));
    }
    Ok(())
}

#[async_trait::async_trait]
pub trait ProcedureRunner: Send + Sync {
    async fn call(&self, procedure: &ProcedureCall) -> Result<(), CollaboratorError>;
}

#[async_trait::async_trait]
impl<T: ProcedureRunner + ?Sized> ProcedureRunner for std::sync::Arc<T> {
    async fn call(&self, procedure: &ProcedureCall) -> Result<(), CollaboratorError> {
        (**self).call(procedure).await
    }
}

/// Runs each procedure in its own transaction.
#[derive(Debug, Clone)]
pub struct PgProcedureRunner {
    pool: PgPool,
}

impl PgProcedureRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ProcedureRunner for PgProcedureRunner {
    #[instrument(skip(self, procedure), fields(procedure = %procedure), err)]
    async fn call(&self, procedure: &ProcedureCall) -> Result<(), CollaboratorError> {
        let failed = |e: sqlx::Error| CollaboratorError::Procedure {
            name: procedure.name.clone(),
            message: e.to_string(),
        };

        let mut tx = self.pool.begin().await.map_err(failed)?;

        let statement = procedure.statement();
        let mut query = sqlx::query(&statement);
        for arg in &procedure.args {
            query = match arg {
                ProcedureArg::Json(value) => query.bind(value.clone()),
                ProcedureArg::Text(text) => query.bind(text.clone()),
            };
        }
        query.execute(&mut *tx).await.map_err(failed)?;
        tx.commit().await.map_err(failed)?;

        debug!(procedure = %procedure, "procedure completed");
        Ok(())
    }
}

/// Records calls instead of running them; can be told to fail a named procedure.
#[derive(Debug, Default)]
pub struct RecordingProcedureRunner {
    calls: Mutex<Vec<ProcedureCall>>,
    fail_on: Option<String>,
}

impl RecordingProcedureRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(name: impl Into<String>) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_on: Some(name.into()),
        }
    }

    pub fn calls(&self) -> Vec<ProcedureCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl ProcedureRunner for RecordingProcedureRunner {
    async fn call(&self, procedure: &ProcedureCall) -> Result<(), CollaboratorError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(procedure.clone());
        }
        if self.fail_on.as_deref() == Some(procedure.name()) {
            return Err(CollaboratorError::Procedure {
                name: procedure.name().to_string(),
                message: "simulated failure".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_and_qualified_names() {
        assert!(validate_identifier("refresh_data_mart").is_ok());
        assert!(validate_identifier("dwh_production.sync_ods_to_dwh").is_ok());
        assert!(validate_identifier("_private.x1").is_ok());
    }

    #[test]
    fn rejects_anything_that_could_inject() {
        for bad in [
            "",
            "a.b.c",
            "1abc",
            "data_mart.refresh(); DROP TABLE x",
            "name--",
            "schema.",
            "sch ema.proc",
        ] {
            assert!(
                matches!(validate_identifier(bad), Err(CollaboratorError::InvalidIdentifier(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn statement_has_one_placeholder_per_arg() {
        let call = ProcedureCall::new("ods_buffer.parse_json_to_ods")
            .unwrap()
            .arg(ProcedureArg::Json(serde_json::json!(["VCB"])));
        assert_eq!(call.statement(), "CALL ods_buffer.parse_json_to_ods($1)");
        assert_eq!(
            ProcedureCall::new("data_mart.refresh_data_mart").unwrap().statement(),
            "CALL data_mart.refresh_data_mart()"
        );
    }

    #[tokio::test]
    async fn recording_runner_fails_named_procedure() {
        let runner = RecordingProcedureRunner::failing_on("b");
        runner.call(&ProcedureCall::new("a").unwrap()).await.unwrap();
        assert!(runner.call(&ProcedureCall::new("b").unwrap()).await.is_err());
        assert_eq!(runner.calls().len(), 2);
    }
}
