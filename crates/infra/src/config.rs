//! Application configuration.
//!
//! `AppConfig` is a plain value: it is parsed from TOML, optionally patched from
//! `MARKETFLOW_*` variables handed in by the binary, validated, and then passed
//! to whatever needs it. Nothing below the binary reads the process environment.
//!
//! ```toml
//! [database]
//! url = "postgres://marketflow@localhost/marketflow"
//!
//! [warehouse]
//! url = "postgres://etl@warehouse/dwh"
//!
//! [lease]
//! duration_secs = 1800
//!
//! [transform]
//! symbol_file = "/etc/marketflow/symbol_company.txt"
//!
//! [retry_on_error]
//! crawl = "enable"
//! stage_load = "keep"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use serde::{Deserialize, Serialize};

use marketflow_core::{ErrorRetryPolicy, Pipeline, Stage};
use marketflow_observability::LogFormat;

use crate::collaborators::procedures::validate_identifier;
use crate::stages::ProcedureStep;
use crate::worker::WorkerConfig;

/// Prefix of the environment variables understood by `apply_env`.
pub const ENV_PREFIX: &str = "MARKETFLOW_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {message}")]
    Io { path: String, message: String },

    #[error("invalid config file: {0}")]
    Parse(String),

    #[error("invalid value for {key}: {message}")]
    Env { key: String, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/marketflow".to_string(),
            max_connections: 4,
            acquire_timeout_secs: 10,
        }
    }
}

impl DatabaseConfig {
    pub fn acquire_timeout(&self) -> StdDuration {
        StdDuration::from_secs(self.acquire_timeout_secs)
    }
}

/// Database holding the staging area and the transform procedures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WarehouseConfig {
    /// Falls back to `database.url` when unset.
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LeaseConfig {
    pub duration_secs: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            duration_secs: 1800,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerSection {
    pub name: String,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            name: "marketflow-worker".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    pub format: LogFormat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MarketDataConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            timeout_secs: 30,
        }
    }
}

impl MarketDataConfig {
    pub fn timeout(&self) -> StdDuration {
        StdDuration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransformConfig {
    /// Newline-delimited symbol filter passed to the parse procedure.
    pub symbol_file: Option<PathBuf>,
    pub procedures: Vec<ProcedureStep>,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            symbol_file: Some(PathBuf::from("symbol_company.txt")),
            procedures: ProcedureStep::defaults_for(Stage::Transform),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcedureConfig {
    pub procedures: Vec<ProcedureStep>,
}

impl ProcedureConfig {
    fn defaults_for(stage: Stage) -> Self {
        Self {
            procedures: ProcedureStep::defaults_for(stage),
        }
    }
}

fn default_warehouse_load() -> ProcedureConfig {
    ProcedureConfig::defaults_for(Stage::WarehouseLoad)
}

fn default_aggregate() -> ProcedureConfig {
    ProcedureConfig::defaults_for(Stage::Aggregate)
}

/// What a failed stage does with `retry_eligible`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryOnErrorConfig {
    pub crawl: ErrorRetryPolicy,
    pub stage_load: ErrorRetryPolicy,
    pub transform: ErrorRetryPolicy,
    pub warehouse_load: ErrorRetryPolicy,
    pub aggregate: ErrorRetryPolicy,
}

impl Default for RetryOnErrorConfig {
    fn default() -> Self {
        Self {
            crawl: ErrorRetryPolicy::Enable,
            stage_load: ErrorRetryPolicy::Keep,
            transform: ErrorRetryPolicy::Keep,
            warehouse_load: ErrorRetryPolicy::Keep,
            aggregate: ErrorRetryPolicy::Keep,
        }
    }
}

impl RetryOnErrorConfig {
    pub fn policy(&self, stage: Stage) -> ErrorRetryPolicy {
        match stage {
            Stage::Crawl => self.crawl,
            Stage::StageLoad => self.stage_load,
            Stage::Transform => self.transform,
            Stage::WarehouseLoad => self.warehouse_load,
            Stage::Aggregate => self.aggregate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub warehouse: WarehouseConfig,
    pub lease: LeaseConfig,
    pub worker: WorkerSection,
    pub log: LogConfig,
    pub market_data: MarketDataConfig,
    pub transform: TransformConfig,
    #[serde(default = "default_warehouse_load")]
    pub warehouse_load: ProcedureConfig,
    #[serde(default = "default_aggregate")]
    pub aggregate: ProcedureConfig,
    pub retry_on_error: RetryOnErrorConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            warehouse: WarehouseConfig::default(),
            lease: LeaseConfig::default(),
            worker: WorkerSection::default(),
            log: LogConfig::default(),
            market_data: MarketDataConfig::default(),
            transform: TransformConfig::default(),
            warehouse_load: default_warehouse_load(),
            aggregate: default_aggregate(),
            retry_on_error: RetryOnErrorConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_toml(&content)
    }

    /// Apply `MARKETFLOW_*` overrides. Variables without the prefix, and
    /// prefixed names that are not overrides, are ignored.
    pub fn apply_env<I, K, V>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        for (key, value) in vars {
            let key = key.as_ref();
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value: String = value.into();
            match name {
                "DATABASE_URL" => self.database.url = value,
                "DATABASE_MAX_CONNECTIONS" => {
                    self.database.max_connections = parse_env(key, &value)?
                }
                "WAREHOUSE_DATABASE_URL" => self.warehouse.url = Some(value),
                "WAREHOUSE_MAX_CONNECTIONS" => {
                    self.warehouse.max_connections = parse_env(key, &value)?
                }
                "LEASE_DURATION_SECS" => self.lease.duration_secs = parse_env(key, &value)?,
                "WORKER_NAME" => self.worker.name = value,
                "LOG_FORMAT" => self.log.format = parse_env(key, &value)?,
                "MARKET_DATA_URL" => self.market_data.base_url = value,
                "MARKET_DATA_TIMEOUT_SECS" => {
                    self.market_data.timeout_secs = parse_env(key, &value)?
                }
                "SYMBOL_FILE" => self.transform.symbol_file = Some(PathBuf::from(value)),
                _ => {}
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (section, url) in [
            ("database", self.database.url.as_str()),
            ("warehouse", self.warehouse_url()),
        ] {
            if !(url.starts_with("postgres://") || url.starts_with("postgresql://")) {
                return Err(ConfigError::Invalid(format!(
                    "{section}.url must be a postgres:// URL"
                )));
            }
        }
        if self.database.max_connections == 0 || self.warehouse.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be positive".into(),
            ));
        }
        if self.lease.duration_secs == 0 || self.lease.duration_secs > i64::MAX as u64 / 1000 {
            return Err(ConfigError::Invalid(
                "lease.duration_secs must be positive".into(),
            ));
        }
        if self.worker.name.trim().is_empty() {
            return Err(ConfigError::Invalid("worker.name must not be empty".into()));
        }
        if self.market_data.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "market_data.timeout_secs must be positive".into(),
            ));
        }

        for stage in [Stage::Transform, Stage::WarehouseLoad, Stage::Aggregate] {
            let steps = self.procedures(stage);
            if steps.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "{stage}.procedures must not be empty"
                )));
            }
            for step in steps {
                validate_identifier(&step.name)
                    .map_err(|e| ConfigError::Invalid(format!("{stage}.procedures: {e}")))?;
                if step.symbol_filter && self.transform.symbol_file.is_none() {
                    return Err(ConfigError::Invalid(format!(
                        "{stage}.procedures: {} needs transform.symbol_file",
                        step.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Warehouse database URL, the control store's when not configured.
    pub fn warehouse_url(&self) -> &str {
        self.warehouse.url.as_deref().unwrap_or(&self.database.url)
    }

    /// Procedure list of a procedure-driven stage; empty for other stages.
    pub fn procedures(&self, stage: Stage) -> &[ProcedureStep] {
        match stage {
            Stage::Transform => &self.transform.procedures,
            Stage::WarehouseLoad => &self.warehouse_load.procedures,
            Stage::Aggregate => &self.aggregate.procedures,
            Stage::Crawl | Stage::StageLoad => &[],
        }
    }

    /// The standard pipeline with the configured error policies.
    pub fn pipeline(&self) -> Pipeline {
        Stage::ALL.into_iter().fold(Pipeline::standard(), |p, stage| {
            p.with_error_policy(stage, self.retry_on_error.policy(stage))
        })
    }

    pub fn lease_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease.duration_secs as i64)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::default()
            .with_name(self.worker.name.clone())
            .with_lease_duration(self.lease_duration())
    }
}

fn parse_env<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Env {
        key: key.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use marketflow_core::JobStatus;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.lease_duration(), chrono::Duration::seconds(1800));
        assert_eq!(config.procedures(Stage::Transform).len(), 2);
        assert!(config.procedures(Stage::Crawl).is_empty());
    }

    #[test]
    fn empty_file_means_defaults() {
        assert_eq!(AppConfig::from_toml("").unwrap(), AppConfig::default());
    }

    #[test]
    fn parses_partial_file() {
        let config = AppConfig::from_toml(
            r#"
            [database]
            url = "postgresql://etl@db/control"

            [lease]
            duration_secs = 300

            [log]
            format = "pretty"

            [aggregate]
            procedures = [{ name = "data_mart.refresh_all" }]

            [retry_on_error]
            stage_load = "disable"
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.database.url, "postgresql://etl@db/control");
        assert_eq!(config.database.max_connections, 4);
        assert_eq!(config.lease.duration_secs, 300);
        assert_eq!(config.log.format, LogFormat::Pretty);
        assert_eq!(config.aggregate.procedures[0].name, "data_mart.refresh_all");
        assert_eq!(config.retry_on_error.stage_load, ErrorRetryPolicy::Disable);
        assert_eq!(config.retry_on_error.crawl, ErrorRetryPolicy::Enable);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = AppConfig::from_toml("[lease]\nduration = 10\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn env_overrides_apply_and_ignore_others() {
        let mut config = AppConfig::default();
        config
            .apply_env([
                ("MARKETFLOW_DATABASE_URL", "postgres://override/db"),
                ("MARKETFLOW_LEASE_DURATION_SECS", " 600 "),
                ("MARKETFLOW_LOG_FORMAT", "text"),
                ("MARKETFLOW_SYMBOL_FILE", "/srv/symbols.txt"),
                ("MARKETFLOW_TEST_DATABASE_URL", "postgres://ignored"),
                ("DATABASE_URL", "postgres://also-ignored"),
            ])
            .unwrap();

        assert_eq!(config.database.url, "postgres://override/db");
        assert_eq!(config.lease.duration_secs, 600);
        assert_eq!(config.log.format, LogFormat::Pretty);
        assert_eq!(
            config.transform.symbol_file,
            Some(PathBuf::from("/srv/symbols.txt"))
        );
    }

    #[test]
    fn warehouse_defaults_to_control_database() {
        let config = AppConfig::from_toml("[database]\nurl = \"postgres://db/control\"\n").unwrap();
        assert_eq!(config.warehouse_url(), "postgres://db/control");

        let config = AppConfig::from_toml(
            r#"
            [database]
            url = "postgres://db/control"

            [warehouse]
            url = "postgres://dwh/warehouse"
            max_connections = 2
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.warehouse_url(), "postgres://dwh/warehouse");
        assert_eq!(config.warehouse.max_connections, 2);
    }

    #[test]
    fn warehouse_url_can_come_from_env() {
        let mut config = AppConfig::default();
        config
            .apply_env([("MARKETFLOW_WAREHOUSE_DATABASE_URL", "postgres://dwh/warehouse")])
            .unwrap();
        assert_eq!(config.warehouse_url(), "postgres://dwh/warehouse");
        assert_eq!(config.database.url, AppConfig::default().database.url);

        config.warehouse.url = Some("mysql://dwh/warehouse".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_env_value_names_the_variable() {
        let mut config = AppConfig::default();
        let err = config
            .apply_env([("MARKETFLOW_LEASE_DURATION_SECS", "soon")])
            .unwrap_err();
        assert!(err.to_string().contains("MARKETFLOW_LEASE_DURATION_SECS"));
    }

    #[test]
    fn validation_catches_bad_values() {
        let mut config = AppConfig::default();
        config.lease.duration_secs = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.database.url = "mysql://localhost/control".into();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.warehouse_load.procedures.clear();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.transform.symbol_file = None;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.aggregate.procedures = vec![ProcedureStep::new("refresh(); --")];
        assert!(config.validate().is_err());
    }

    #[test]
    fn pipeline_uses_configured_policies() {
        let mut config = AppConfig::default();
        config.retry_on_error.transform = ErrorRetryPolicy::Disable;
        let pipeline = config.pipeline();

        assert_eq!(
            pipeline.definition(Stage::Transform).retry_on_error,
            ErrorRetryPolicy::Disable
        );
        assert_eq!(
            pipeline.definition(Stage::Crawl).retry_on_error,
            ErrorRetryPolicy::Enable
        );
        assert_eq!(
            pipeline.definition(Stage::Transform).error,
            JobStatus::ErrTransform
        );
    }
}
