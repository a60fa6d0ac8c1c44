//! Procedure-driven stages: transform, warehouse-load and aggregate.
//!
//! A stage runs its configured procedures in order and stops at the first
//! failure. A step marked `symbol_filter` receives the symbol filter list as a
//! JSON array argument.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use marketflow_core::{JobRecord, Stage};

use crate::collaborators::{
    CollaboratorError, ProcedureArg, ProcedureCall, ProcedureRunner, procedures::validate_identifier,
};
use crate::worker::{ExecutionError, ExecutionReport, StageExecutor};

/// One configured procedure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcedureStep {
    pub name: String,
    /// Pass the symbol filter list as the only argument.
    #[serde(default)]
    pub symbol_filter: bool,
}

impl ProcedureStep {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            symbol_filter: false,
        }
    }

    pub fn with_symbol_filter(mut self) -> Self {
        self.symbol_filter = true;
        self
    }

    /// Built-in procedure lists.
    pub fn defaults_for(stage: Stage) -> Vec<ProcedureStep> {
        match stage {
            Stage::Transform => vec![
                ProcedureStep::new("ods_buffer.parse_json_to_ods").with_symbol_filter(),
                ProcedureStep::new("dwh_production.sync_ods_to_dwh"),
            ],
            Stage::WarehouseLoad => {
                vec![ProcedureStep::new("dwh_production.load_staging_to_warehouse")]
            }
            Stage::Aggregate => vec![ProcedureStep::new("data_mart.refresh_data_mart")],
            Stage::Crawl | Stage::StageLoad => Vec::new(),
        }
    }
}

/// Read a newline-delimited symbol list; blank lines are skipped.
pub fn load_symbol_filter(path: &Path) -> Result<Vec<String>, ExecutionError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ExecutionError::MissingInputs(vec![
                path.display().to_string(),
            ]));
        }
        Err(err) => return Err(CollaboratorError::file(path, err).into()),
    };
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

pub struct ProcedureStage<R> {
    runner: R,
    steps: Vec<ProcedureStep>,
    symbol_file: Option<PathBuf>,
}

impl<R: ProcedureRunner> ProcedureStage<R> {
    /// Fails when a procedure name is not a valid identifier or a step needs a
    /// symbol filter and no file is configured.
    pub fn new(
        runner: R,
        steps: Vec<ProcedureStep>,
        symbol_file: Option<PathBuf>,
    ) -> Result<Self, CollaboratorError> {
        for step in &steps {
            validate_identifier(&step.name)?;
            if step.symbol_filter && symbol_file.is_none() {
                return Err(CollaboratorError::Misconfigured(format!(
                    "{} needs a symbol filter file",
                    step.name
                )));
            }
        }
        Ok(Self {
            runner,
            steps,
            symbol_file,
        })
    }

    async fn symbol_filter(&self) -> Result<serde_json::Value, ExecutionError> {
        let Some(path) = self.symbol_file.clone() else {
            return Ok(serde_json::Value::Array(Vec::new()));
        };
        let dir = path.clone();
        let symbols = tokio::task::spawn_blocking(move || load_symbol_filter(&path))
            .await
            .map_err(|e| CollaboratorError::file(&dir, e))??;
        Ok(serde_json::Value::from(symbols))
    }
}

#[async_trait::async_trait]
impl<R: ProcedureRunner> StageExecutor for ProcedureStage<R> {
    async fn execute(&self, job: &JobRecord) -> Result<ExecutionReport, ExecutionError> {
        let filter = if self.steps.iter().any(|s| s.symbol_filter) {
            Some(self.symbol_filter().await?)
        } else {
            None
        };

        let mut report = ExecutionReport::default();
        for step in &self.steps {
            let mut call = ProcedureCall::new(&step.name)?;
            if step.symbol_filter {
                if let Some(filter) = &filter {
                    call = call.arg(ProcedureArg::Json(filter.clone()));
                }
            }
            self.runner.call(&call).await?;
            debug!(job_id = %job.id, procedure = %call, "procedure finished");
            report.record_success();
        }
        Ok(report)
    }
}
