//! Latest-partition refresh
//!
//! Rows of a subject modified since the last full refresh are moved into a
//! rolling `latest` partition. Published rows whose source changed in the
//! window are deleted in the same transaction that replaces the previous
//! latest partition, so replaying a window leaves the table unchanged.

use strata_rdbc::Connection;

use crate::context::RefreshContext;
use crate::error::AnalyticsError;
use crate::manager::TableManager;
use crate::model::AnalyticsTable;
use crate::orchestrator::{
    drop_staging, populate_staging, swap_in_transaction, table_exists, AtStage, StageResult,
};
use crate::partition::MISSING_FULL_REFRESH;
use crate::report::RefreshState;

/// Result of refreshing one subject's latest partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LatestOutcome {
    /// The latest partition was replaced; rows written
    Refreshed { rows: u64 },
    /// No source row changed in the window
    Unchanged,
    /// The published table does not exist yet
    NotPublished,
}

/// What planning decided for one table's latest partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LatestPlan {
    /// Stage the planned latest partition; `delete` runs in the swap
    Refresh { delete: String },
    Unchanged,
    NotPublished,
}

/// Refreshes the latest partition of one table
pub struct IncrementalUpdater<'a> {
    connection: &'a dyn Connection,
    ctx: &'a RefreshContext,
    manager: &'a dyn TableManager,
}

impl<'a> IncrementalUpdater<'a> {
    pub fn new(
        connection: &'a dyn Connection,
        ctx: &'a RefreshContext,
        manager: &'a dyn TableManager,
    ) -> Self {
        Self {
            connection,
            ctx,
            manager,
        }
    }

    /// Refresh the latest partition of `table`: [`plan`](Self::plan) then
    /// [`apply`](Self::apply).
    pub async fn refresh_latest(&self, table: &mut AnalyticsTable) -> StageResult<LatestOutcome> {
        match self.plan(table).await? {
            LatestPlan::Refresh { delete } => {
                let rows = self.apply(table, delete).await?;
                Ok(LatestOutcome::Refreshed { rows })
            }
            LatestPlan::Unchanged => Ok(LatestOutcome::Unchanged),
            LatestPlan::NotPublished => Ok(LatestOutcome::NotPublished),
        }
    }

    /// Decide whether `table` needs a new latest partition, reading only.
    ///
    /// Changes are probed in `[max(last full, last latest), start)`; the
    /// partition itself and the delete cover `[last full, start)`.
    pub async fn plan(&self, table: &mut AnalyticsTable) -> StageResult<LatestPlan> {
        let ctx = self.ctx;
        let last_full = ctx
            .last_full_refresh
            .ok_or_else(|| AnalyticsError::config(MISSING_FULL_REFRESH))
            .at(RefreshState::Planning)?;
        let window_start = ctx.latest_change_window_start().unwrap_or(last_full);

        let probe = self
            .manager
            .has_updated_sql(ctx, table, window_start, ctx.start_time)
            .at(RefreshState::Planning)?;
        let changed = self
            .connection
            .query_one(&probe, &[])
            .await
            .map_err(AnalyticsError::from)
            .at(RefreshState::Planning)?;
        if changed.is_none() {
            tracing::info!(
                "No updated latest event data found for '{}' since {}",
                table.name(),
                window_start
            );
            return Ok(LatestPlan::Unchanged);
        }

        if !table_exists(self.connection, ctx, &table.name())
            .await
            .at(RefreshState::Planning)?
        {
            tracing::warn!(
                "Table '{}' is not published, run a full refresh first",
                table.name()
            );
            return Ok(LatestPlan::NotPublished);
        }

        ctx.planner()
            .plan_latest(table, Some(last_full), ctx.start_time)
            .at(RefreshState::Planning)?;
        let delete = self
            .manager
            .delete_updated_sql(ctx, table, last_full, ctx.start_time)
            .at(RefreshState::Planning)?;
        Ok(LatestPlan::Refresh { delete })
    }

    /// Stage the planned latest partition, then delete stale rows and swap
    /// it in one transaction. Returns the rows staged.
    pub async fn apply(&self, table: &AnalyticsTable, delete: String) -> StageResult<u64> {
        let ctx = self.ctx;
        let staged = populate_staging(self.connection, ctx, self.manager, table).await?;

        let mut statements = vec![delete];
        statements.extend(ctx.sql().partial_swap(table));
        let affected = match swap_in_transaction(self.connection, table, &statements).await {
            Ok(affected) => affected,
            Err(failure) => {
                drop_staging(self.connection, ctx, table).await;
                return Err(failure);
            }
        };
        tracing::info!(
            "Latest partition of '{}' holds {} rows, {} stale rows deleted",
            table.name(),
            staged.rows,
            affected.first().copied().unwrap_or(0)
        );
        Ok(staged.rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnalyticsConfig;
    use crate::context::RefreshParams;
    use crate::manager::{EnrollmentTableManager, EventTableManager};
    use crate::model::{Subject, TableType};
    use chrono::NaiveDateTime;
    use std::sync::Arc;
    use strata_rdbc::testing::{MockConnection, TransactionOutcome};
    use strata_rdbc::{PostgresDialect, Row};

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn ctx(last_full: Option<NaiveDateTime>) -> RefreshContext {
        RefreshContext::builder(
            RefreshParams::latest().with_start_time(ts("2024-05-01 00:00:00")),
            Arc::new(AnalyticsConfig::from_yaml("database:\n  url: postgres://localhost/dhis2\n").unwrap()),
            Arc::new(PostgresDialect),
        )
        .watermarks(last_full, None)
        .build()
    }

    fn table(table_type: TableType) -> AnalyticsTable {
        AnalyticsTable::new(
            "analytics",
            table_type,
            Subject {
                id: 7,
                uid: "IpHINAT79UW".into(),
                name: "Child Programme".into(),
            },
            Vec::new(),
            true,
        )
    }

    #[tokio::test]
    async fn test_unchanged_subject_is_skipped() {
        let mock = MockConnection::new();
        let ctx = ctx(Some(ts("2024-04-01 00:00:00")));
        let mut table = table(TableType::Event);

        let outcome = IncrementalUpdater::new(&mock, &ctx, &EventTableManager)
            .refresh_latest(&mut table)
            .await
            .unwrap();

        assert_eq!(outcome, LatestOutcome::Unchanged);
        assert_eq!(mock.statements().len(), 1);
        assert!(mock.transactions().is_empty());
        assert!(!table.has_partitions());
    }

    #[tokio::test]
    async fn test_unpublished_table_is_left_alone() {
        let mock = MockConnection::new().on_query("limit 1", vec![Row::single("eventid", 1_i64)]);
        let ctx = ctx(Some(ts("2024-04-01 00:00:00")));

        let outcome = IncrementalUpdater::new(&mock, &ctx, &EventTableManager)
            .refresh_latest(&mut table(TableType::Event))
            .await
            .unwrap();

        assert_eq!(outcome, LatestOutcome::NotPublished);
        assert!(mock.statements_matching("create").is_empty());
    }

    #[tokio::test]
    async fn test_plan_reads_only() {
        let mock = MockConnection::new()
            .on_query("limit 1", vec![Row::single("eventid", 1_i64)])
            .on_query("pg_tables", vec![Row::single("?column?", 1_i32)]);
        let ctx = ctx(Some(ts("2024-04-01 00:00:00")));
        let mut table = table(TableType::Event);

        let plan = IncrementalUpdater::new(&mock, &ctx, &EventTableManager)
            .plan(&mut table)
            .await
            .unwrap();

        match plan {
            LatestPlan::Refresh { delete } => {
                assert!(delete.starts_with("delete from \"analytics_event_iphinat79uw\""))
            }
            other => panic!("unexpected plan {:?}", other),
        }
        assert!(table.latest_partition().is_some());
        assert_eq!(mock.statements().len(), 2);
        assert!(mock.transactions().is_empty());
    }

    #[tokio::test]
    async fn test_delete_and_swap_share_one_transaction() {
        let mock = MockConnection::new()
            .on_query("limit 1", vec![Row::single("eventid", 1_i64)])
            .on_query("pg_tables", vec![Row::single("?column?", 1_i32)])
            .on_execute("insert into", 3);
        let ctx = ctx(Some(ts("2024-04-01 00:00:00")));
        let mut table = table(TableType::Event);

        let outcome = IncrementalUpdater::new(&mock, &ctx, &EventTableManager)
            .refresh_latest(&mut table)
            .await
            .unwrap();
        assert_eq!(outcome, LatestOutcome::Refreshed { rows: 3 });

        let transactions = mock.transactions();
        assert_eq!(transactions.len(), 1);
        let tx = &transactions[0];
        assert_eq!(tx.outcome, TransactionOutcome::Committed);
        assert!(tx.statements[0].starts_with("delete from \"analytics_event_iphinat79uw\""));
        assert!(tx.statements[0].contains(">= '2024-04-01 00:00:00'"));
        assert!(tx.statements[1].contains("\"analytics_event_iphinat79uw_latest\""));
        assert!(tx.statements.last().unwrap().contains("\"analytics_temp_event_iphinat79uw\""));
    }

    #[tokio::test]
    async fn test_swap_failure_rolls_back() {
        let mock = MockConnection::new()
            .on_query("limit 1", vec![Row::single("eventid", 1_i64)])
            .on_query("pg_tables", vec![Row::single("?column?", 1_i32)])
            .fail_on("no inherit", "lock timeout");
        let ctx = ctx(Some(ts("2024-04-01 00:00:00")));

        let failure = IncrementalUpdater::new(&mock, &ctx, &EventTableManager)
            .refresh_latest(&mut table(TableType::Event))
            .await
            .unwrap_err();

        assert_eq!(failure.state, RefreshState::Swapping);
        assert!(matches!(failure.error, AnalyticsError::Swap { .. }));
        assert_eq!(mock.transactions()[0].outcome, TransactionOutcome::RolledBack);
        let last = mock.statements().pop().unwrap();
        assert_eq!(last.transaction, None);
        assert!(last.sql.contains("DROP TABLE IF EXISTS \"analytics_temp_event_iphinat79uw\""));
    }

    #[tokio::test]
    async fn test_missing_full_refresh_is_configuration_error() {
        let mock = MockConnection::new();
        let failure = IncrementalUpdater::new(&mock, &ctx(None), &EventTableManager)
            .refresh_latest(&mut table(TableType::Event))
            .await
            .unwrap_err();
        assert!(failure.error.is_configuration());
        assert!(mock.statements().is_empty());
    }

    #[tokio::test]
    async fn test_enrollment_tables_have_no_latest_partition() {
        let mock = MockConnection::new();
        let failure = IncrementalUpdater::new(
            &mock,
            &ctx(Some(ts("2024-04-01 00:00:00"))),
            &EnrollmentTableManager,
        )
        .refresh_latest(&mut table(TableType::Enrollment))
        .await
        .unwrap_err();
        assert!(failure.error.is_configuration());
        assert!(mock.statements().is_empty());
    }
}
