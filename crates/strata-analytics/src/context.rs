//! Refresh request parameters and the per-run context

use chrono::{NaiveDate, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use strata_rdbc::SqlDialect;
use uuid::Uuid;

use crate::calendar::Calendar;
use crate::config::{AnalyticsConfig, YearBounds};
use crate::model::TableType;
use crate::partition::PartitionPlanner;
use crate::sql::SqlGenerator;

/// Full rebuild or incremental update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshMode {
    Full,
    Latest,
}

impl fmt::Display for RefreshMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => f.write_str("full"),
            Self::Latest => f.write_str("latest"),
        }
    }
}

/// What the trigger asks for
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefreshParams {
    /// Update the latest partitions instead of rebuilding
    #[serde(default)]
    pub latest: bool,
    /// Only rebuild years from this date on
    #[serde(default)]
    pub from_date: Option<NaiveDate>,
    /// Subject UIDs to leave alone
    #[serde(default)]
    pub skip_subjects: HashSet<String>,
    /// Table families to leave alone
    #[serde(default)]
    pub skip_table_types: HashSet<TableType>,
    /// Run start time; defaults to now
    #[serde(default)]
    pub start_time: Option<NaiveDateTime>,
}

impl RefreshParams {
    /// Full refresh of everything
    pub fn full() -> Self {
        Self::default()
    }

    /// Latest-partition refresh of everything
    pub fn latest() -> Self {
        Self {
            latest: true,
            ..Self::default()
        }
    }

    pub fn with_from_date(mut self, from_date: NaiveDate) -> Self {
        self.from_date = Some(from_date);
        self
    }

    pub fn with_start_time(mut self, start_time: NaiveDateTime) -> Self {
        self.start_time = Some(start_time);
        self
    }

    pub fn skip_subject(mut self, uid: impl Into<String>) -> Self {
        self.skip_subjects.insert(uid.into());
        self
    }

    pub fn skip_table_type(mut self, table_type: TableType) -> Self {
        self.skip_table_types.insert(table_type);
        self
    }

    pub fn mode(&self) -> RefreshMode {
        if self.latest {
            RefreshMode::Latest
        } else {
            RefreshMode::Full
        }
    }

    /// Whether a subject is on the skip list
    pub fn skips(&self, uid: &str) -> bool {
        self.skip_subjects.iter().any(|s| s.eq_ignore_ascii_case(uid))
    }

    /// Start time truncated to whole seconds
    pub fn resolve_start_time(&self) -> NaiveDateTime {
        let start = self.start_time.unwrap_or_else(|| Utc::now().naive_utc());
        start.with_nanosecond(0).unwrap_or(start)
    }
}

/// Immutable state shared by every subject of one run
#[derive(Clone)]
pub struct RefreshContext {
    pub run_id: Uuid,
    pub mode: RefreshMode,
    pub params: RefreshParams,
    pub config: Arc<AnalyticsConfig>,
    pub dialect: Arc<dyn SqlDialect>,
    pub calendar: Arc<dyn Calendar>,
    /// Spatial extension available
    pub spatial: bool,
    pub start_time: NaiveDateTime,
    pub current_year: i32,
    pub bounds: YearBounds,
    pub last_full_refresh: Option<NaiveDateTime>,
    pub last_latest_refresh: Option<NaiveDateTime>,
    nonce: String,
}

impl fmt::Debug for RefreshContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshContext")
            .field("run_id", &self.run_id)
            .field("mode", &self.mode)
            .field("dialect", &self.dialect.name())
            .field("calendar", &self.calendar.name())
            .field("spatial", &self.spatial)
            .field("start_time", &self.start_time)
            .field("bounds", &self.bounds)
            .finish()
    }
}

/// Builder for [`RefreshContext`]
pub struct RefreshContextBuilder {
    params: RefreshParams,
    config: Arc<AnalyticsConfig>,
    dialect: Arc<dyn SqlDialect>,
    spatial: bool,
    last_full_refresh: Option<NaiveDateTime>,
    last_latest_refresh: Option<NaiveDateTime>,
}

impl RefreshContextBuilder {
    pub fn spatial(mut self, spatial: bool) -> Self {
        self.spatial = spatial;
        self
    }

    pub fn watermarks(
        mut self,
        last_full_refresh: Option<NaiveDateTime>,
        last_latest_refresh: Option<NaiveDateTime>,
    ) -> Self {
        self.last_full_refresh = last_full_refresh;
        self.last_latest_refresh = last_latest_refresh;
        self
    }

    pub fn build(self) -> RefreshContext {
        let run_id = Uuid::new_v4();
        let calendar = self.config.calendar.calendar();
        let start_time = self.params.resolve_start_time();
        let current_year = calendar.year_of(start_time);
        let bounds = self.config.tables.year_bounds(current_year);

        RefreshContext {
            run_id,
            mode: self.params.mode(),
            params: self.params,
            config: self.config,
            dialect: self.dialect,
            calendar,
            spatial: self.spatial,
            start_time,
            current_year,
            bounds,
            last_full_refresh: self.last_full_refresh,
            last_latest_refresh: self.last_latest_refresh,
            nonce: run_id.simple().to_string(),
        }
    }
}

impl RefreshContext {
    pub fn builder(
        params: RefreshParams,
        config: Arc<AnalyticsConfig>,
        dialect: Arc<dyn SqlDialect>,
    ) -> RefreshContextBuilder {
        RefreshContextBuilder {
            params,
            config,
            dialect,
            spatial: false,
            last_full_refresh: None,
            last_latest_refresh: None,
        }
    }

    /// Shared statement generator for this run
    pub fn sql(&self) -> SqlGenerator<'_> {
        SqlGenerator::new(self.dialect.as_ref(), &self.nonce)
    }

    /// Partition planner for this run
    pub fn planner(&self) -> PartitionPlanner<'_> {
        PartitionPlanner::new(self.calendar.as_ref(), self.bounds, self.current_year)
    }

    /// Start of the change-detection window of a latest refresh: the later
    /// of the last full and the last latest refresh
    pub fn latest_change_window_start(&self) -> Option<NaiveDateTime> {
        match (self.last_full_refresh, self.last_latest_refresh) {
            (Some(full), Some(latest)) => Some(full.max(latest)),
            (full, None) => full,
            (None, latest) => latest,
        }
    }
}
