//! Validation hooks run between population and swap
//!
//! Hook failures are logged by the orchestrator and never block the swap.

use async_trait::async_trait;
use strata_rdbc::Connection;

use crate::error::{AnalyticsError, Result};
use crate::model::AnalyticsTable;
use crate::sql::SqlGenerator;

/// Check run against populated staging tables
#[async_trait]
pub trait TableHook: Send + Sync {
    fn name(&self) -> &str;

    /// Inspect the staging partitions of `table`
    async fn validate(
        &self,
        connection: &dyn Connection,
        sql: &SqlGenerator<'_>,
        table: &AnalyticsTable,
        staging_partitions: &[String],
    ) -> Result<()>;
}

/// Rejects tables with fewer rows than a minimum
#[derive(Debug, Clone, Copy)]
pub struct RowCountHook {
    min_rows: u64,
}

impl RowCountHook {
    pub fn new(min_rows: u64) -> Self {
        Self { min_rows }
    }
}

#[async_trait]
impl TableHook for RowCountHook {
    fn name(&self) -> &str {
        "row-count"
    }

    async fn validate(
        &self,
        connection: &dyn Connection,
        sql: &SqlGenerator<'_>,
        table: &AnalyticsTable,
        staging_partitions: &[String],
    ) -> Result<()> {
        let mut total = 0u64;
        for partition in staging_partitions {
            let row = connection.query_one(&sql.row_count(partition)?, &[]).await?;
            let count = row
                .as_ref()
                .and_then(|r| r.get(0))
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            total += count.max(0) as u64;
        }

        tracing::debug!("Table '{}' staged {} rows", table.name(), total);
        if total < self.min_rows {
            return Err(AnalyticsError::Validation {
                table: table.name(),
                message: format!("{} rows staged, expected at least {}", total, self.min_rows),
            });
        }
        Ok(())
    }
}
