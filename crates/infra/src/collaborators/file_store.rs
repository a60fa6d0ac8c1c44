//! Per-job CSV files: `<output_path>/<dataset>_<YYYY-MM-DD>.csv`.
//!
//! All calls are blocking; async callers go through `spawn_blocking`.

use std::fs;
use std::path::{Path, PathBuf};

use marketflow_core::JobRecord;

use super::CollaboratorError;
use super::market_data::{Dataset, DatasetKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStore {
    dir: PathBuf,
    date_tag: String,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>, date_tag: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            date_tag: date_tag.into(),
        }
    }

    /// The file set of a job: its output directory and window-end date tag.
    pub fn for_job(job: &JobRecord) -> Self {
        Self::new(&job.output_path, job.date_tag())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_name(&self, kind: DatasetKind) -> String {
        kind.file_name(&self.date_tag)
    }

    pub fn path(&self, kind: DatasetKind) -> PathBuf {
        self.dir.join(self.file_name(kind))
    }

    /// File names of the datasets not present on disk, in dataset order.
    pub fn missing(&self) -> Vec<String> {
        DatasetKind::ALL
            .iter()
            .filter(|kind| !self.path(**kind).is_file())
            .map(|kind| self.file_name(*kind))
            .collect()
    }

    /// Write one dataset. Readers see either the previous file or the complete
    /// new one: rows go to a temporary file that is renamed into place.
    pub fn write(&self, kind: DatasetKind, dataset: &Dataset) -> Result<PathBuf, CollaboratorError> {
        fs::create_dir_all(&self.dir).map_err(|e| CollaboratorError::file(&self.dir, e))?;

        let target = self.path(kind);
        let tmp = self.dir.join(format!(".{}.tmp", self.file_name(kind)));

        if let Err(err) = write_csv(&tmp, dataset) {
            let _ = fs::remove_file(&tmp);
            return Err(err);
        }
        fs::rename(&tmp, &target).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            CollaboratorError::file(&target, e)
        })?;
        Ok(target)
    }

    pub fn read(&self, kind: DatasetKind) -> Result<Dataset, CollaboratorError> {
        let path = self.path(kind);
        if !path.is_file() {
            return Err(CollaboratorError::file(&path, "file not found"));
        }

        let mut reader = csv::Reader::from_path(&path).map_err(|e| CollaboratorError::file(&path, e))?;
        let columns = reader
            .headers()
            .map_err(|e| CollaboratorError::file(&path, e))?
            .iter()
            .map(str::to_string)
            .collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| CollaboratorError::file(&path, e))?;
            rows.push(record.iter().map(str::to_string).collect());
        }
        Ok(Dataset::new(columns, rows))
    }
}

fn write_csv(path: &Path, dataset: &Dataset) -> Result<(), CollaboratorError> {
    let mut writer = csv::Writer::from_path(path).map_err(|e| CollaboratorError::file(path, e))?;
    if !dataset.columns.is_empty() {
        writer
            .write_record(&dataset.columns)
            .map_err(|e| CollaboratorError::file(path, e))?;
    }
    for row in &dataset.rows {
        writer
            .write_record(row)
            .map_err(|e| CollaboratorError::file(path, e))?;
    }
    writer.flush().map_err(|e| CollaboratorError::file(path, e))?;
    Ok(())
}
