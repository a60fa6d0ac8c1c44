//! Crawl: fetch every symbol of the job and write the five dataset files.
//!
//! Each symbol is one unit. A failed symbol is reported and skipped; the files
//! are written from the symbols that succeeded.

use std::path::PathBuf;

use tracing::debug;

use marketflow_core::JobRecord;

use crate::collaborators::{
    CollaboratorError, Dataset, DatasetKind, FileStore, MarketDataFetcher, MarketSnapshot,
};
use crate::worker::{ExecutionError, ExecutionReport, StageExecutor};

pub struct CrawlExecutor<F> {
    fetcher: F,
}

impl<F: MarketDataFetcher> CrawlExecutor<F> {
    pub fn new(fetcher: F) -> Self {
        Self { fetcher }
    }
}

/// Per-dataset accumulation across symbols.
#[derive(Default)]
struct Accumulator {
    datasets: [Dataset; 5],
}

impl Accumulator {
    fn accepts(&self, snapshot: &MarketSnapshot) -> Result<(), String> {
        for (i, kind) in DatasetKind::ALL.iter().enumerate() {
            if !self.datasets[i].is_compatible(snapshot.dataset(*kind)) {
                return Err(format!("{kind} columns differ from earlier symbols"));
            }
        }
        Ok(())
    }

    fn add(&mut self, snapshot: MarketSnapshot) -> Result<(), String> {
        for (i, (_, dataset)) in snapshot.into_datasets().into_iter().enumerate() {
            self.datasets[i].extend(dataset)?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl<F: MarketDataFetcher> StageExecutor for CrawlExecutor<F> {
    async fn execute(&self, job: &JobRecord) -> Result<ExecutionReport, ExecutionError> {
        if job.symbols.is_empty() {
            return Err(ExecutionError::InvalidJob("job has no symbols".into()));
        }

        let mut report = ExecutionReport::default();
        let mut acc = Accumulator::default();

        for symbol in &job.symbols {
            let snapshot = match self
                .fetcher
                .fetch(symbol, job.window_start, job.window_end)
                .await
            {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    report.record_failure(symbol, err.to_string());
                    continue;
                }
            };
            if snapshot.is_empty() {
                report.record_failure(symbol, "no data returned");
                continue;
            }
            if let Err(reason) = acc.accepts(&snapshot) {
                report.record_failure(symbol, reason);
                continue;
            }
            acc.add(snapshot).map_err(ExecutionError::InvalidJob)?;
            debug!(job_id = %job.id, symbol = %symbol, "symbol fetched");
            report.record_success();
        }

        if !report.is_success() {
            return Ok(report);
        }

        let files = FileStore::for_job(job);
        let written = write_all(files, acc).await?;
        debug!(job_id = %job.id, files = written.len(), "datasets written");
        Ok(report)
    }
}

async fn write_all(files: FileStore, acc: Accumulator) -> Result<Vec<PathBuf>, CollaboratorError> {
    let dir = files.dir().to_path_buf();
    tokio::task::spawn_blocking(move || {
        DatasetKind::ALL
            .iter()
            .zip(acc.datasets.iter())
            .map(|(kind, dataset)| files.write(*kind, dataset))
            .collect::<Result<Vec<_>, _>>()
    })
    .await
    .map_err(|e| CollaboratorError::file(&dir, e))?
}
