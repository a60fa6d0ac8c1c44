//! Stage-load: move the five crawl files into the raw staging area.
//!
//! All-or-nothing: any missing file fails the stage, naming every missing file.

use tracing::debug;

use marketflow_core::JobRecord;

use crate::collaborators::{CollaboratorError, DatasetKind, FileStore, StagingPayload, StagingSink};
use crate::worker::{ExecutionError, ExecutionReport, StageExecutor};

pub struct StageLoadExecutor<K> {
    sink: K,
}

impl<K: StagingSink> StageLoadExecutor<K> {
    pub fn new(sink: K) -> Self {
        Self { sink }
    }
}

fn read_payload(files: &FileStore) -> Result<StagingPayload, ExecutionError> {
    let missing = files.missing();
    if !missing.is_empty() {
        return Err(ExecutionError::MissingInputs(missing));
    }
    let mut payload = StagingPayload::default();
    for kind in DatasetKind::ALL {
        payload.insert(kind, &files.read(kind)?);
    }
    Ok(payload)
}

#[async_trait::async_trait]
impl<K: StagingSink> StageExecutor for StageLoadExecutor<K> {
    async fn execute(&self, job: &JobRecord) -> Result<ExecutionReport, ExecutionError> {
        let files = FileStore::for_job(job);
        let dir = files.dir().to_path_buf();

        let payload = tokio::task::spawn_blocking(move || read_payload(&files))
            .await
            .map_err(|e| CollaboratorError::file(&dir, e))??;

        self.sink.replace(job.id, &payload).await?;
        debug!(job_id = %job.id, rows = payload.row_count(), "staging loaded");
        Ok(ExecutionReport::single())
    }
}
