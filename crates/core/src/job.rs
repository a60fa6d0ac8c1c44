//! Job records and audit entries.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{AuditId, JobId};
use crate::pipeline::JobStatus;

/// One pipeline run, as held by the control store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    /// Single source of truth for the job's pipeline position.
    pub status: JobStatus,
    /// True while exactly one worker owns the job.
    pub locked: bool,
    /// Gate for automated workers, independent of `status`.
    pub retry_eligible: bool,
    /// Set together with `locked`; a lock past this instant is considered abandoned.
    pub lease_expiry: Option<DateTime<Utc>>,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    /// Directory where stage artifacts are written and read.
    pub output_path: String,
    /// Ticker symbols fetched by the crawl stage.
    pub symbols: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Tag used to name stage files for this job (`YYYY-MM-DD` of the window end).
    pub fn date_tag(&self) -> String {
        self.window_end.format("%Y-%m-%d").to_string()
    }

    pub fn is_lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.locked && self.lease_expiry.is_some_and(|at| at < now)
    }
}

/// Parameters of a job about to be created by an initiating process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub output_path: String,
    pub symbols: Vec<String>,
}

impl NewJob {
    pub fn new(
        window_start: NaiveDate,
        window_end: NaiveDate,
        output_path: impl Into<String>,
        symbols: Vec<String>,
    ) -> Self {
        Self {
            window_start,
            window_end,
            output_path: output_path.into(),
            symbols,
        }
    }

    /// Normalizes symbols (trimmed, upper-cased, de-duplicated in order) and
    /// checks the window and path.
    pub fn validated(mut self) -> DomainResult<Self> {
        if self.window_start > self.window_end {
            return Err(DomainError::validation(format!(
                "window start {} is after window end {}",
                self.window_start, self.window_end
            )));
        }
        if self.output_path.trim().is_empty() {
            return Err(DomainError::validation("output path must not be empty"));
        }

        let mut symbols: Vec<String> = Vec::with_capacity(self.symbols.len());
        for raw in &self.symbols {
            let sym = raw.trim().to_ascii_uppercase();
            if sym.is_empty() {
                continue;
            }
            if !sym.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-') {
                return Err(DomainError::validation(format!("invalid symbol: {raw}")));
            }
            if !symbols.contains(&sym) {
                symbols.push(sym);
            }
        }
        if symbols.is_empty() {
            return Err(DomainError::validation("at least one symbol is required"));
        }
        self.symbols = symbols;
        Ok(self)
    }
}

/// Classification of an audit entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditTag {
    /// A worker claimed the job (precondition -> in-progress).
    Claimed,
    /// A stage finished with usable output.
    Success,
    /// A stage ended in its error status (including lease reclaim).
    Err,
    /// A single unit of a batch failed; the job did not change status.
    Warn,
    /// An operator moved the job out of an error status.
    Reset,
}

impl AuditTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditTag::Claimed => "CLAIMED",
            AuditTag::Success => "SUCCESS",
            AuditTag::Err => "ERR",
            AuditTag::Warn => "WARN",
            AuditTag::Reset => "RESET",
        }
    }

    /// Whether entries with this tag accompany a status change.
    pub fn is_transition(&self) -> bool {
        !matches!(self, AuditTag::Warn)
    }
}

impl fmt::Display for AuditTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditTag {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, <Self as FromStr>::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CLAIMED" => Ok(AuditTag::Claimed),
            "SUCCESS" => Ok(AuditTag::Success),
            "ERR" => Ok(AuditTag::Err),
            "WARN" => Ok(AuditTag::Warn),
            "RESET" => Ok(AuditTag::Reset),
            other => Err(DomainError::validation(format!("unknown audit tag: {other}"))),
        }
    }
}

/// Immutable diagnostic record. Never read back to decide control flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: AuditId,
    pub job_id: JobId,
    pub status_tag: AuditTag,
    pub description: String,
    pub timestamp: DateTime<Utc>,
}
