//! Raw staging area: one row holding the five datasets as JSON record arrays.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde_json::Value;
use sqlx::PgPool;
use tracing::{debug, instrument};

use marketflow_core::JobId;

use super::CollaboratorError;
use super::market_data::{Dataset, DatasetKind};

/// The five datasets of one job, converted to JSON records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StagingPayload {
    datasets: BTreeMap<DatasetKind, Value>,
}

impl StagingPayload {
    pub fn insert(&mut self, kind: DatasetKind, dataset: &Dataset) {
        self.datasets.insert(kind, dataset.to_records());
    }

    /// Records of `kind`, an empty array if none were inserted.
    pub fn records(&self, kind: DatasetKind) -> Value {
        self.datasets
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new()))
    }

    pub fn row_count(&self) -> usize {
        self.datasets
            .values()
            .map(|v| v.as_array().map_or(0, Vec::len))
            .sum()
    }
}

/// Destination of the stage-load step.
#[async_trait::async_trait]
pub trait StagingSink: Send + Sync {
    /// Replace the staging contents with `payload` in one transaction.
    async fn replace(&self, job_id: JobId, payload: &StagingPayload) -> Result<(), CollaboratorError>;
}

#[async_trait::async_trait]
impl<T: StagingSink + ?Sized> StagingSink for std::sync::Arc<T> {
    async fn replace(&self, job_id: JobId, payload: &StagingPayload) -> Result<(), CollaboratorError> {
        (**self).replace(job_id, payload).await
    }
}

/// `StagingSink` writing `staging_raw_data`.
#[derive(Debug, Clone)]
pub struct PgStagingSink {
    pool: PgPool,
}

impl PgStagingSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl StagingSink for PgStagingSink {
    #[instrument(skip(self, payload), fields(job_id = %job_id), err)]
    async fn replace(&self, job_id: JobId, payload: &StagingPayload) -> Result<(), CollaboratorError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| CollaboratorError::Database(e.to_string()))?;

        sqlx::query("TRUNCATE TABLE staging_raw_data")
            .execute(&mut *tx)
            .await
            .map_err(|e| CollaboratorError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO staging_raw_data (
                job_id,
                company_overview_data,
                finance_ratio_data,
                listing_exchange_data,
                listing_industries_data,
                price_history_data
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(job_id.get())
        .bind(payload.records(DatasetKind::CompanyOverview))
        .bind(payload.records(DatasetKind::FinanceRatio))
        .bind(payload.records(DatasetKind::ListingExchange))
        .bind(payload.records(DatasetKind::ListingIndustries))
        .bind(payload.records(DatasetKind::PriceHistory))
        .execute(&mut *tx)
        .await
        .map_err(|e| CollaboratorError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| CollaboratorError::Database(e.to_string()))?;

        debug!(job_id = %job_id, rows = payload.row_count(), "staging area replaced");
        Ok(())
    }
}

/// In-memory staging sink for tests/dev: keeps the last payload.
#[derive(Debug, Default)]
pub struct InMemoryStagingSink {
    current: Mutex<Option<(JobId, StagingPayload)>>,
}

impl InMemoryStagingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<(JobId, StagingPayload)> {
        self.current.lock().ok().and_then(|guard| guard.clone())
    }
}

#[async_trait::async_trait]
impl StagingSink for InMemoryStagingSink {
    async fn replace(&self, job_id: JobId, payload: &StagingPayload) -> Result<(), CollaboratorError> {
        let mut guard = self
            .current
            .lock()
            .map_err(|_| CollaboratorError::Database("staging sink lock poisoned".into()))?;
        *guard = Some((job_id, payload.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replace_keeps_only_latest_payload() {
        let sink = InMemoryStagingSink::new();
        let mut first = StagingPayload::default();
        first.insert(
            DatasetKind::PriceHistory,
            &Dataset::new(vec!["close".into()], vec![vec!["1".into()]]),
        );
        sink.replace(JobId::new(1), &first).await.unwrap();
        sink.replace(JobId::new(2), &StagingPayload::default()).await.unwrap();

        let (job_id, payload) = sink.current().unwrap();
        assert_eq!(job_id, JobId::new(2));
        assert_eq!(payload.row_count(), 0);
        assert_eq!(payload.records(DatasetKind::PriceHistory), serde_json::json!([]));
    }

    #[test]
    fn row_count_sums_all_datasets() {
        let mut payload = StagingPayload::default();
        let ds = Dataset::new(vec!["a".into()], vec![vec!["1".into()], vec!["2".into()]]);
        payload.insert(DatasetKind::CompanyOverview, &ds);
        payload.insert(DatasetKind::FinanceRatio, &ds);
        assert_eq!(payload.row_count(), 4);
    }
}
