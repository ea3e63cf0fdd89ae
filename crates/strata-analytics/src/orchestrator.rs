//! Refresh orchestration
//!
//! One run plans every subject up front, reading only, then refreshes the
//! planned subjects on a bounded worker pool. Each subject walks
//! `Planning -> Populating -> Validating -> Swapping -> Done` and may end in
//! `Failed` from any later stage without affecting the others. A planning
//! failure of the run or of any subject aborts before anything is written.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use strata_rdbc::{dialect_for, Connection, SqlDialect, Value};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::{AnalyticsConfig, SpatialSupport};
use crate::context::{RefreshContext, RefreshMode, RefreshParams};
use crate::error::{AnalyticsError, Result};
use crate::hooks::TableHook;
use crate::incremental::{IncrementalUpdater, LatestPlan};
use crate::lock::{StoreLock, TableLockRegistry};
use crate::manager::{EnrollmentTableManager, EventTableManager, TableManager};
use crate::metadata::{MetadataProvider, MetadataSnapshot};
use crate::model::AnalyticsTable;
use crate::partition::MISSING_FULL_REFRESH;
use crate::report::{
    millis, FailedSubject, RefreshReport, RefreshState, SkippedSubject, SucceededSubject,
};
use crate::watermark::{WatermarkKey, WatermarkStore};

/// A subject failure tagged with the stage it happened in
#[derive(Debug)]
pub struct StageFailure {
    pub state: RefreshState,
    pub error: AnalyticsError,
}

pub type StageResult<T> = std::result::Result<T, StageFailure>;

pub(crate) trait AtStage<T> {
    fn at(self, state: RefreshState) -> StageResult<T>;
}

impl<T> AtStage<T> for Result<T> {
    fn at(self, state: RefreshState) -> StageResult<T> {
        self.map_err(|error| StageFailure { state, error })
    }
}

/// What a populated staging table holds
#[derive(Debug, Clone, Default)]
pub(crate) struct Staged {
    pub partitions: Vec<String>,
    pub rows: u64,
}

fn population_error(table: &AnalyticsTable) -> impl Fn(strata_rdbc::Error) -> AnalyticsError + '_ {
    move |source| AnalyticsError::Population {
        table: table.staging_name(),
        source,
    }
}

/// Create, fill, index and analyze the staging tables of a planned table.
///
/// Every statement is rendered before the first one runs, so template
/// errors surface in `Planning` with nothing written.
pub(crate) async fn populate_staging(
    connection: &dyn Connection,
    ctx: &RefreshContext,
    manager: &dyn TableManager,
    table: &AnalyticsTable,
) -> StageResult<Staged> {
    let sql = ctx.sql();
    let partitions = table.partitions();

    let mut inserts = Vec::with_capacity(partitions.len());
    for partition in partitions {
        inserts.push((
            table.staging_partition_name(partition),
            manager
                .populate_sql(ctx, table, partition)
                .at(RefreshState::Planning)?,
        ));
    }

    let mut ddl = vec![
        sql.drop_table(&table.staging_name()),
        sql.create_staging_table(table),
    ];
    ddl.extend(partitions.iter().map(|p| {
        sql.create_staging_partition(table, p, manager.partition_check(ctx, p))
    }));

    let result: Result<Staged> = async {
        for statement in &ddl {
            connection
                .execute(statement, &[])
                .await
                .map_err(population_error(table))?;
        }

        let mut staged = Staged::default();
        for (name, insert) in &inserts {
            let started = Instant::now();
            let rows = connection
                .execute(insert, &[])
                .await
                .map_err(population_error(table))?;
            tracing::info!(
                "Populated table '{}' with {} rows in {:?}",
                name,
                rows,
                started.elapsed()
            );
            staged.partitions.push(name.clone());
            staged.rows += rows;
        }

        let started = Instant::now();
        for name in &staged.partitions {
            for index in sql.create_indexes(table, name) {
                connection
                    .execute(&index, &[])
                    .await
                    .map_err(population_error(table))?;
            }
            connection
                .execute(&sql.analyze(name), &[])
                .await
                .map_err(population_error(table))?;
        }
        tracing::debug!(
            "Indexed and analyzed '{}' in {:?}",
            table.staging_name(),
            started.elapsed()
        );
        Ok(staged)
    }
    .await;

    match result {
        Ok(staged) => Ok(staged),
        Err(error) => {
            drop_staging(connection, ctx, table).await;
            Err(error).at(RefreshState::Populating)
        }
    }
}

/// Drop the staging master of `table` and with it every staging partition
pub(crate) async fn drop_staging(
    connection: &dyn Connection,
    ctx: &RefreshContext,
    table: &AnalyticsTable,
) {
    let statement = ctx.sql().drop_table(&table.staging_name());
    if let Err(e) = connection.execute(&statement, &[]).await {
        tracing::warn!("Failed to drop staging table '{}': {}", table.staging_name(), e);
    }
}

/// Whether a table named `name` is published
pub(crate) async fn table_exists(
    connection: &dyn Connection,
    ctx: &RefreshContext,
    name: &str,
) -> Result<bool> {
    let row = connection
        .query_one(&ctx.dialect.table_exists_sql(), &[Value::from(name)])
        .await?;
    Ok(row.is_some())
}

/// Run `statements` in one transaction; the affected row counts come back
/// in order. Any failure rolls back, leaving the published tables untouched.
pub(crate) async fn swap_in_transaction(
    connection: &dyn Connection,
    table: &AnalyticsTable,
    statements: &[String],
) -> StageResult<Vec<u64>> {
    let started = Instant::now();
    let swap_error = |source: strata_rdbc::Error| AnalyticsError::Swap {
        table: table.name(),
        source,
    };

    let tx = connection
        .begin()
        .await
        .map_err(swap_error)
        .at(RefreshState::Swapping)?;
    let mut affected = Vec::with_capacity(statements.len());
    for statement in statements {
        match tx.execute(statement, &[]).await {
            Ok(n) => affected.push(n),
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!("Rollback of '{}' failed: {}", table.name(), rollback);
                }
                return Err(swap_error(e)).at(RefreshState::Swapping);
            }
        }
    }
    tx.commit()
        .await
        .map_err(swap_error)
        .at(RefreshState::Swapping)?;

    tracing::info!("Swapped table '{}' in {:?}", table.name(), started.elapsed());
    Ok(affected)
}

/// Collaborators of an orchestrator, wired explicitly
#[derive(Clone)]
pub struct OrchestratorDeps {
    pub config: Arc<AnalyticsConfig>,
    pub connection: Arc<dyn Connection>,
    pub metadata: Arc<dyn MetadataProvider>,
    pub watermarks: Arc<dyn WatermarkStore>,
    pub hooks: Vec<Arc<dyn TableHook>>,
    /// Share one registry per process
    pub locks: Arc<TableLockRegistry>,
}

/// Skip reason of subjects left alone because planning failed
pub const PLANNING_ABORTED: &str = "run aborted, planning failed";

/// Writes planned for one subject
enum Work {
    /// Rebuild the planned years. A `partial` swap keeps the published
    /// years outside the plan; `prune` clears rebuilt rows from the
    /// published latest partition in the same transaction.
    Full { partial: bool, prune: Option<String> },
    /// Replace the latest partition, deleting stale rows with `delete`
    Latest { delete: String },
}

enum SubjectPlan {
    Run(Work),
    Skip(String),
}

struct PlannedSubject {
    manager: Arc<dyn TableManager>,
    table: AnalyticsTable,
    work: Work,
}

enum SubjectOutcome {
    Succeeded(SucceededSubject),
    Skipped(SkippedSubject),
    Failed(FailedSubject),
}

fn skipped(table: &AnalyticsTable, reason: String) -> SkippedSubject {
    SkippedSubject {
        subject: table.subject.uid.clone(),
        table: table.name(),
        reason,
    }
}
/// Runs full and latest refreshes
pub struct RefreshOrchestrator {
    deps: OrchestratorDeps,
    managers: Vec<Arc<dyn TableManager>>,
}

impl RefreshOrchestrator {
    /// Orchestrator over the event and enrollment table families
    pub fn new(deps: OrchestratorDeps) -> Self {
        Self::with_managers(
            deps,
            vec![Arc::new(EventTableManager), Arc::new(EnrollmentTableManager)],
        )
    }

    pub fn with_managers(deps: OrchestratorDeps, managers: Vec<Arc<dyn TableManager>>) -> Self {
        Self { deps, managers }
    }

    /// Plan without touching storage: the tables and column lists a run
    /// would materialize
    pub async fn plan(&self, params: RefreshParams) -> Result<Vec<AnalyticsTable>> {
        let dialect = self.dialect()?;
        let metadata = MetadataSnapshot::load(self.deps.metadata.as_ref()).await?;
        let spatial = !matches!(self.deps.config.tables.spatial, SpatialSupport::Disabled);
        let ctx = RefreshContext::builder(params, Arc::clone(&self.deps.config), dialect)
            .spatial(spatial)
            .build();

        let mut tables = Vec::new();
        for manager in &self.managers {
            if !ctx.params.skip_table_types.contains(&manager.table_type()) {
                tables.extend(manager.tables(&ctx, &metadata)?);
            }
        }
        Ok(tables)
    }

    /// Run one refresh.
    ///
    /// Returns `Err` only for failures of the run as a whole; per-subject
    /// failures are listed in the report.
    pub async fn run(
        &self,
        params: RefreshParams,
        cancel: CancellationToken,
    ) -> Result<RefreshReport> {
        let started = Instant::now();
        let started_at = Utc::now();

        let dialect = self.dialect()?;
        let last_full = self.deps.watermarks.get(WatermarkKey::LastFullRefresh).await?;
        let last_latest = self
            .deps
            .watermarks
            .get(WatermarkKey::LastLatestRefresh)
            .await?;
        if params.latest && last_full.is_none() {
            return Err(AnalyticsError::config(MISSING_FULL_REFRESH));
        }

        let metadata = MetadataSnapshot::load(self.deps.metadata.as_ref()).await?;
        let spatial = self.detect_spatial(dialect.as_ref()).await?;
        let ctx = RefreshContext::builder(params, Arc::clone(&self.deps.config), dialect)
            .spatial(spatial)
            .watermarks(last_full, last_latest)
            .build();

        let span = tracing::info_span!("refresh", run_id = %ctx.run_id, mode = %ctx.mode);
        let mut report = self
            .run_planned(&ctx, &metadata, started_at, cancel.child_token())
            .instrument(span)
            .await?;

        report.finish(started.elapsed());
        tracing::info!(
            "Refresh {} finished: {:?}, {} succeeded, {} skipped, {} failed in {:?}",
            report.run_id,
            report.status,
            report.succeeded.len(),
            report.skipped.len(),
            report.failed.len(),
            started.elapsed()
        );
        Ok(report)
    }

    fn dialect(&self) -> Result<Arc<dyn SqlDialect>> {
        let kind = self.deps.config.database.database_type()?;
        Ok(Arc::from(dialect_for(kind)?))
    }

    async fn detect_spatial(&self, dialect: &dyn SqlDialect) -> Result<bool> {
        match self.deps.config.tables.spatial {
            SpatialSupport::Enabled => Ok(true),
            SpatialSupport::Disabled => Ok(false),
            SpatialSupport::Auto => {
                let rows = self
                    .deps
                    .connection
                    .query(&dialect.spatial_support_sql(), &[])
                    .await?;
                let spatial = !rows.is_empty();
                tracing::info!("Spatial support: {}", spatial);
                Ok(spatial)
            }
        }
    }

    async fn run_planned(
        &self,
        ctx: &RefreshContext,
        metadata: &MetadataSnapshot,
        started_at: DateTime<Utc>,
        cancel: CancellationToken,
    ) -> Result<RefreshReport> {
        let mut report = RefreshReport::new(ctx.run_id, ctx.mode, started_at);
        let parallel_jobs = ctx.config.tables.parallel_jobs.max(1);

        let mut work: Vec<(Arc<dyn TableManager>, AnalyticsTable)> = Vec::new();
        for manager in &self.managers {
            let table_type = manager.table_type();
            if ctx.params.skip_table_types.contains(&table_type) {
                tracing::info!("Skipping {} tables", table_type);
                continue;
            }
            let tables = manager.tables(ctx, metadata)?;
            if ctx.mode == RefreshMode::Latest && !manager.supports_latest() {
                report.skipped.extend(tables.iter().map(|t| {
                    skipped(
                        t,
                        format!("latest partitions are not supported for {} tables", table_type),
                    )
                }));
                continue;
            }
            work.extend(tables.into_iter().map(|t| (Arc::clone(manager), t)));
        }

        if cancel.is_cancelled() {
            let reason = AnalyticsError::Cancelled.to_string();
            report
                .skipped
                .extend(work.iter().map(|(_, t)| skipped(t, reason.clone())));
            tracing::warn!("Watermarks not advanced");
            return Ok(report);
        }

        tracing::info!(
            "Planning {} tables with {} parallel jobs, start time {}, years {}..={}",
            work.len(),
            parallel_jobs,
            ctx.start_time,
            ctx.bounds.earliest,
            ctx.bounds.latest
        );

        let planned: Vec<_> = stream::iter(work)
            .map(|(manager, mut table)| async move {
                let plan = self.plan_subject(ctx, manager.as_ref(), &mut table).await;
                (manager, table, plan)
            })
            .buffered(parallel_jobs)
            .collect()
            .await;

        let aborted = planned.iter().any(|(_, _, plan)| plan.is_err());
        let mut runnable = Vec::with_capacity(planned.len());
        for (manager, table, plan) in planned {
            match plan {
                Err(failure) => report.failed.push(self.failed(&table, failure, &cancel)),
                Ok(_) if aborted => report
                    .skipped
                    .push(skipped(&table, PLANNING_ABORTED.to_string())),
                Ok(SubjectPlan::Skip(reason)) => report.skipped.push(skipped(&table, reason)),
                Ok(SubjectPlan::Run(work)) => runnable.push(PlannedSubject {
                    manager,
                    table,
                    work,
                }),
            }
        }
        if aborted {
            tracing::error!(
                "Planning failed for {} tables, nothing was refreshed",
                report.failed.len()
            );
            tracing::warn!("Watermarks not advanced");
            return Ok(report);
        }

        let outcomes: Vec<SubjectOutcome> = stream::iter(runnable)
            .map(|subject| {
                let span = tracing::info_span!("subject", table = %subject.table.name());
                self.refresh_subject(ctx, subject, &cancel).instrument(span)
            })
            .buffer_unordered(parallel_jobs)
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                SubjectOutcome::Succeeded(s) => report.succeeded.push(s),
                SubjectOutcome::Skipped(s) => report.skipped.push(s),
                SubjectOutcome::Failed(f) => report.failed.push(f),
            }
        }

        if report.failed.is_empty() && !cancel.is_cancelled() {
            self.advance_watermarks(ctx).await?;
        } else {
            tracing::warn!("Watermarks not advanced");
        }
        Ok(report)
    }

    async fn advance_watermarks(&self, ctx: &RefreshContext) -> Result<()> {
        let watermarks = &self.deps.watermarks;
        match ctx.mode {
            RefreshMode::Full if ctx.params.from_date.is_some() => {
                tracing::info!("Partial refresh, watermarks unchanged");
            }
            RefreshMode::Full => {
                watermarks
                    .set(WatermarkKey::LastFullRefresh, ctx.start_time)
                    .await?;
                watermarks.clear(WatermarkKey::LastLatestRefresh).await?;
            }
            RefreshMode::Latest => {
                watermarks
                    .set(WatermarkKey::LastLatestRefresh, ctx.start_time)
                    .await?;
            }
        }
        Ok(())
    }

    /// Decide what to write for one subject without writing anything
    async fn plan_subject(
        &self,
        ctx: &RefreshContext,
        manager: &dyn TableManager,
        table: &mut AnalyticsTable,
    ) -> StageResult<SubjectPlan> {
        match ctx.mode {
            RefreshMode::Full => self.plan_full(ctx, manager, table).await.map(SubjectPlan::Run),
            RefreshMode::Latest => {
                let updater =
                    IncrementalUpdater::new(self.deps.connection.as_ref(), ctx, manager);
                Ok(match updater.plan(table).await? {
                    LatestPlan::Refresh { delete } => SubjectPlan::Run(Work::Latest { delete }),
                    LatestPlan::Unchanged => SubjectPlan::Skip("no updated data".to_string()),
                    LatestPlan::NotPublished => SubjectPlan::Skip(
                        "published table missing, run a full refresh".to_string(),
                    ),
                })
            }
        }
    }

    async fn plan_full(
        &self,
        ctx: &RefreshContext,
        manager: &dyn TableManager,
        table: &mut AnalyticsTable,
    ) -> StageResult<Work> {
        let connection = self.deps.connection.as_ref();

        let years_sql = manager.data_years_sql(ctx, table).at(RefreshState::Planning)?;
        let rows = connection
            .query(&years_sql, &[])
            .await
            .map_err(AnalyticsError::from)
            .at(RefreshState::Planning)?;
        let years: Vec<i32> = rows
            .iter()
            .filter_map(|r| r.get(0).and_then(Value::as_i64))
            .filter_map(|y| i32::try_from(y).ok())
            .collect();
        ctx.planner()
            .plan_years(table, &years)
            .at(RefreshState::Planning)?;

        if ctx.params.from_date.is_none() {
            return Ok(Work::Full {
                partial: false,
                prune: None,
            });
        }

        let partial = table_exists(connection, ctx, &table.name())
            .await
            .at(RefreshState::Planning)?;
        // Rebuilt years hold rows a previous latest refresh already published
        let prune = if partial
            && manager.supports_latest()
            && table_exists(connection, ctx, &table.latest_partition_name())
                .await
                .at(RefreshState::Planning)?
        {
            Some(manager.prune_latest_sql(ctx, table).at(RefreshState::Planning)?)
        } else {
            None
        };
        Ok(Work::Full { partial, prune })
    }

    async fn refresh_subject(
        &self,
        ctx: &RefreshContext,
        subject: PlannedSubject,
        cancel: &CancellationToken,
    ) -> SubjectOutcome {
        let started = Instant::now();
        let PlannedSubject {
            manager,
            table,
            work,
        } = subject;

        if cancel.is_cancelled() {
            return SubjectOutcome::Skipped(skipped(&table, AnalyticsError::Cancelled.to_string()));
        }

        let _lock = match self.deps.locks.try_lock(&table.name()) {
            Ok(lock) => lock,
            Err(error) => return self.rejected(&table, error, cancel),
        };
        let connection = self.deps.connection.as_ref();
        let store_lock =
            match StoreLock::acquire(connection, ctx.dialect.as_ref(), &table.name()).await {
                Ok(lock) => lock,
                Err(error) => return self.rejected(&table, error, cancel),
            };

        let result = match work {
            Work::Full { partial, prune } => {
                self.refresh_full(ctx, manager.as_ref(), &table, partial, prune)
                    .await
            }
            Work::Latest { delete } => IncrementalUpdater::new(connection, ctx, manager.as_ref())
                .apply(&table, delete)
                .await
                .map(|_| ()),
        };
        store_lock.release().await;

        match result {
            Ok(()) => {
                tracing::info!("Table '{}' refreshed in {:?}", table.name(), started.elapsed());
                SubjectOutcome::Succeeded(SucceededSubject {
                    subject: table.subject.uid.clone(),
                    table: table.name(),
                    table_type: table.table_type,
                    partitions: table.partitions().iter().map(|p| p.key.to_string()).collect(),
                    elapsed_ms: millis(started.elapsed()),
                })
            }
            Err(failure) => SubjectOutcome::Failed(self.failed(&table, failure, cancel)),
        }
    }

    fn rejected(
        &self,
        table: &AnalyticsTable,
        error: AnalyticsError,
        cancel: &CancellationToken,
    ) -> SubjectOutcome {
        tracing::warn!("{}", error);
        SubjectOutcome::Failed(self.failed(
            table,
            StageFailure {
                state: RefreshState::Planning,
                error,
            },
            cancel,
        ))
    }

    fn failed(
        &self,
        table: &AnalyticsTable,
        failure: StageFailure,
        cancel: &CancellationToken,
    ) -> FailedSubject {
        tracing::error!(
            "Refresh of '{}' failed while {}: {}",
            table.name(),
            failure.state,
            failure.error
        );
        if failure.error.is_fatal() {
            tracing::error!("Configuration error, cancelling remaining subjects");
            cancel.cancel();
        }
        FailedSubject {
            subject: table.subject.uid.clone(),
            table: table.name(),
            state: failure.state,
            reason: failure.error.to_string(),
        }
    }

    async fn refresh_full(
        &self,
        ctx: &RefreshContext,
        manager: &dyn TableManager,
        table: &AnalyticsTable,
        partial: bool,
        prune: Option<String>,
    ) -> StageResult<()> {
        let connection = self.deps.connection.as_ref();
        let staged = populate_staging(connection, ctx, manager, table).await?;

        for hook in &self.deps.hooks {
            if let Err(e) = hook
                .validate(connection, &ctx.sql(), table, &staged.partitions)
                .await
            {
                tracing::warn!("Hook '{}' rejected '{}': {}", hook.name(), table.name(), e);
            }
        }

        let sql = ctx.sql();
        let statements = if partial {
            let mut statements: Vec<String> = prune.into_iter().collect();
            statements.extend(sql.partial_swap(table));
            statements
        } else {
            sql.full_swap(table)
        };
        if let Err(failure) = swap_in_transaction(connection, table, &statements).await {
            drop_staging(connection, ctx, table).await;
            return Err(failure);
        }
        Ok(())
    }
}
