//! Connection to the warehouse database.
//!
//! The staging area and the transform/warehouse/aggregate procedures live in
//! their own database, separate from the control store. Pointing both at the
//! same server is allowed but nothing here assumes it.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, instrument};

use super::{CollaboratorError, PgProcedureRunner, PgStagingSink};

/// Schema of the warehouse-side staging area.
pub const STAGING_SCHEMA: &str = include_str!("../../migrations/0002_staging.sql");

/// Pool against the warehouse database, shared by the staging sink and the
/// procedure runner of one invocation.
#[derive(Debug, Clone)]
pub struct WarehouseDatabase {
    pool: PgPool,
}

impl WarehouseDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, CollaboratorError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await
            .map_err(|e| CollaboratorError::Database(format!("connect to warehouse: {e}")))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn staging_sink(&self) -> PgStagingSink {
        PgStagingSink::new(self.pool.clone())
    }

    pub fn procedure_runner(&self) -> PgProcedureRunner {
        PgProcedureRunner::new(self.pool.clone())
    }

    /// Create the staging table if missing.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), CollaboratorError> {
        sqlx::raw_sql(STAGING_SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| CollaboratorError::Database(format!("migrate warehouse: {e}")))?;
        info!("warehouse staging schema applied");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_schema_declares_staging_table() {
        assert!(STAGING_SCHEMA.contains("CREATE TABLE IF NOT EXISTS staging_raw_data"));
        assert!(!STAGING_SCHEMA.contains("pipeline_jobs"));
    }
}
