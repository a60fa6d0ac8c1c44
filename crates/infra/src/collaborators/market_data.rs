//! Market data snapshots and the HTTP client that fetches them.
//!
//! The upstream service returns one JSON document per symbol and window:
//!
//! ```json
//! {
//!   "company_overview":   { "columns": ["symbol", "name"], "rows": [["VCB", "Vietcombank"]] },
//!   "finance_ratio":      { "columns": [...], "rows": [...] },
//!   "listing_exchange":   { "columns": [...], "rows": [...] },
//!   "listing_industries": { "columns": [...], "rows": [...] },
//!   "price_history":      { "columns": [...], "rows": [...] }
//! }
//! ```
//!
//! Cell values are kept as opaque strings; nothing here interprets them.

use core::fmt;
use std::time::Duration;

use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use super::CollaboratorError;

/// The five datasets produced per crawl.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DatasetKind {
    CompanyOverview,
    FinanceRatio,
    ListingExchange,
    ListingIndustries,
    PriceHistory,
}

impl DatasetKind {
    pub const ALL: [DatasetKind; 5] = [
        DatasetKind::CompanyOverview,
        DatasetKind::FinanceRatio,
        DatasetKind::ListingExchange,
        DatasetKind::ListingIndustries,
        DatasetKind::PriceHistory,
    ];

    /// File name stem and JSON key.
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetKind::CompanyOverview => "company_overview",
            DatasetKind::FinanceRatio => "finance_ratio",
            DatasetKind::ListingExchange => "listing_exchange",
            DatasetKind::ListingIndustries => "listing_industries",
            DatasetKind::PriceHistory => "price_history",
        }
    }

    /// `<dataset>_<date_tag>.csv`
    pub fn file_name(&self, date_tag: &str) -> String {
        format!("{}_{date_tag}.csv", self.as_str())
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tabular data set: a header and string rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dataset {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Dataset {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { columns, rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn is_blank(&self) -> bool {
        self.columns.is_empty() && self.rows.is_empty()
    }

    /// Whether `other` can be appended to `self`.
    pub fn is_compatible(&self, other: &Dataset) -> bool {
        self.is_blank() || other.is_blank() || self.columns == other.columns
    }

    /// Append `other`'s rows. Headers must match unless either side is blank.
    pub fn extend(&mut self, other: Dataset) -> Result<(), String> {
        if !self.is_compatible(&other) {
            return Err(format!(
                "header mismatch: expected [{}], got [{}]",
                self.columns.join(", "),
                other.columns.join(", ")
            ));
        }
        if self.is_blank() {
            *self = other;
        } else {
            self.rows.extend(other.rows);
        }
        Ok(())
    }

    /// Rows as JSON objects keyed by column name.
    pub fn to_records(&self) -> Value {
        let records = self
            .rows
            .iter()
            .map(|row| {
                let object: Map<String, Value> = self
                    .columns
                    .iter()
                    .zip(row.iter())
                    .map(|(col, cell)| (col.clone(), Value::String(cell.clone())))
                    .collect();
                Value::Object(object)
            })
            .collect();
        Value::Array(records)
    }
}

/// Everything fetched for one symbol.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarketSnapshot {
    pub overview: Dataset,
    pub ratios: Dataset,
    pub listing_by_exchange: Dataset,
    pub listing_by_industry: Dataset,
    pub price_history: Dataset,
}

impl MarketSnapshot {
    pub fn dataset(&self, kind: DatasetKind) -> &Dataset {
        match kind {
            DatasetKind::CompanyOverview => &self.overview,
            DatasetKind::FinanceRatio => &self.ratios,
            DatasetKind::ListingExchange => &self.listing_by_exchange,
            DatasetKind::ListingIndustries => &self.listing_by_industry,
            DatasetKind::PriceHistory => &self.price_history,
        }
    }

    pub fn into_datasets(self) -> [(DatasetKind, Dataset); 5] {
        [
            (DatasetKind::CompanyOverview, self.overview),
            (DatasetKind::FinanceRatio, self.ratios),
            (DatasetKind::ListingExchange, self.listing_by_exchange),
            (DatasetKind::ListingIndustries, self.listing_by_industry),
            (DatasetKind::PriceHistory, self.price_history),
        ]
    }

    /// True when no dataset carries a row.
    pub fn is_empty(&self) -> bool {
        DatasetKind::ALL.iter().all(|k| self.dataset(*k).is_empty())
    }
}

/// Source of market snapshots. One call per symbol.
#[async_trait::async_trait]
pub trait MarketDataFetcher: Send + Sync {
    async fn fetch(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<MarketSnapshot, CollaboratorError>;
}

#[async_trait::async_trait]
impl<T: MarketDataFetcher + ?Sized> MarketDataFetcher for std::sync::Arc<T> {
    async fn fetch(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<MarketSnapshot, CollaboratorError> {
        (**self).fetch(symbol, start, end).await
    }
}

// Wire types

#[derive(Debug, Deserialize)]
struct SnapshotResponse {
    company_overview: DatasetResponse,
    finance_ratio: DatasetResponse,
    listing_exchange: DatasetResponse,
    listing_industries: DatasetResponse,
    price_history: DatasetResponse,
}

#[derive(Debug, Default, Deserialize)]
struct DatasetResponse {
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    rows: Vec<Vec<Value>>,
}

impl DatasetResponse {
    fn into_dataset(self, kind: DatasetKind) -> Result<Dataset, CollaboratorError> {
        let width = self.columns.len();
        let mut rows = Vec::with_capacity(self.rows.len());
        for (i, row) in self.rows.into_iter().enumerate() {
            if row.len() != width {
                return Err(CollaboratorError::InvalidResponse(format!(
                    "{kind} row {i} has {} cells, header has {width}",
                    row.len()
                )));
            }
            rows.push(row.into_iter().map(cell_to_string).collect());
        }
        Ok(Dataset::new(self.columns, rows))
    }
}

fn cell_to_string(value: Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s,
        other => other.to_string(),
    }
}

impl SnapshotResponse {
    fn into_snapshot(self) -> Result<MarketSnapshot, CollaboratorError> {
        Ok(MarketSnapshot {
            overview: self
                .company_overview
                .into_dataset(DatasetKind::CompanyOverview)?,
            ratios: self.finance_ratio.into_dataset(DatasetKind::FinanceRatio)?,
            listing_by_exchange: self
                .listing_exchange
                .into_dataset(DatasetKind::ListingExchange)?,
            listing_by_industry: self
                .listing_industries
                .into_dataset(DatasetKind::ListingIndustries)?,
            price_history: self.price_history.into_dataset(DatasetKind::PriceHistory)?,
        })
    }
}

/// `MarketDataFetcher` backed by a JSON HTTP endpoint:
/// `GET {base_url}/symbols/{symbol}/snapshot?start=YYYY-MM-DD&end=YYYY-MM-DD`.
#[derive(Debug, Clone)]
pub struct HttpMarketDataFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMarketDataFetcher {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, CollaboratorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("marketflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CollaboratorError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn snapshot_url(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> String {
        format!(
            "{}/symbols/{symbol}/snapshot?start={}&end={}",
            self.base_url,
            start.format("%Y-%m-%d"),
            end.format("%Y-%m-%d")
        )
    }
}

#[async_trait::async_trait]
impl MarketDataFetcher for HttpMarketDataFetcher {
    async fn fetch(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<MarketSnapshot, CollaboratorError> {
        let url = self.snapshot_url(symbol, start, end);
        debug!(symbol, url = %url, "fetching market snapshot");

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| CollaboratorError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(CollaboratorError::Upstream {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }

        let body: SnapshotResponse = resp
            .json()
            .await
            .map_err(|e| CollaboratorError::InvalidResponse(e.to_string()))?;
        body.into_snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ds(columns: &[&str], rows: &[&[&str]]) -> Dataset {
        Dataset::new(
            columns.iter().map(|c| c.to_string()).collect(),
            rows.iter()
                .map(|r| r.iter().map(|c| c.to_string()).collect())
                .collect(),
        )
    }

    #[test]
    fn file_names_use_date_tag() {
        assert_eq!(
            DatasetKind::PriceHistory.file_name("2024-03-01"),
            "price_history_2024-03-01.csv"
        );
    }

    #[test]
    fn extend_requires_matching_headers() {
        let mut acc = Dataset::default();
        acc.extend(ds(&["symbol", "close"], &[&["VCB", "91.2"]])).unwrap();
        acc.extend(ds(&["symbol", "close"], &[&["FPT", "120"]])).unwrap();
        assert_eq!(acc.rows.len(), 2);

        let err = acc.extend(ds(&["symbol"], &[&["HPG"]])).unwrap_err();
        assert!(err.contains("header mismatch"));
        assert_eq!(acc.rows.len(), 2);
    }

    #[test]
    fn records_are_keyed_by_column() {
        let records = ds(&["symbol", "close"], &[&["VCB", "91.2"]]).to_records();
        assert_eq!(records, serde_json::json!([{ "symbol": "VCB", "close": "91.2" }]));
    }

    #[test]
    fn snapshot_response_stringifies_cells() {
        let body = serde_json::json!({
            "company_overview": { "columns": ["symbol"], "rows": [["VCB"]] },
            "finance_ratio": { "columns": ["year", "roe"], "rows": [[2023, 0.21]] },
            "listing_exchange": { "columns": [], "rows": [] },
            "listing_industries": {},
            "price_history": { "columns": ["close", "note"], "rows": [[91.2, null]] }
        });
        let parsed: SnapshotResponse = serde_json::from_value(body).unwrap();
        let snapshot = parsed.into_snapshot().unwrap();
        assert_eq!(snapshot.ratios.rows, vec![vec!["2023".to_string(), "0.21".to_string()]]);
        assert_eq!(snapshot.price_history.rows[0][1], "");
        assert!(snapshot.listing_by_industry.is_empty());
        assert!(!snapshot.is_empty());
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let body = serde_json::json!({
            "company_overview": { "columns": ["a", "b"], "rows": [["1"]] },
            "finance_ratio": {},
            "listing_exchange": {},
            "listing_industries": {},
            "price_history": {}
        });
        let parsed: SnapshotResponse = serde_json::from_value(body).unwrap();
        assert!(matches!(
            parsed.into_snapshot(),
            Err(CollaboratorError::InvalidResponse(_))
        ));
    }

    #[test]
    fn snapshot_url_is_built_from_base() {
        let fetcher =
            HttpMarketDataFetcher::new("http://data.local/api/", Duration::from_secs(5)).unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(
            fetcher.snapshot_url("VCB", day, day),
            "http://data.local/api/symbols/VCB/snapshot?start=2024-03-01&end=2024-03-01"
        );
    }
}
