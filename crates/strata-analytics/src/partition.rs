//! Partition planning
//!
//! Full refreshes get one partition per year with data, latest refreshes get
//! a single rolling partition. Year boundaries come from the configured
//! calendar.

use chrono::NaiveDateTime;
use std::collections::BTreeSet;

use crate::calendar::Calendar;
use crate::config::YearBounds;
use crate::error::{AnalyticsError, Result};
use crate::model::{AnalyticsTable, Partition};

/// Raised when a latest refresh runs before any full refresh
pub const MISSING_FULL_REFRESH: &str =
    "A full analytics table update process must be run prior to a latest partition update process";

/// Plans the partitions of a table
#[derive(Debug, Clone, Copy)]
pub struct PartitionPlanner<'a> {
    calendar: &'a dyn Calendar,
    bounds: YearBounds,
    current_year: i32,
}

impl<'a> PartitionPlanner<'a> {
    pub fn new(calendar: &'a dyn Calendar, bounds: YearBounds, current_year: i32) -> Self {
        Self {
            calendar,
            bounds,
            current_year,
        }
    }

    /// Partition spanning `year` in the configured calendar
    pub fn year_partition(&self, year: i32) -> Result<Partition> {
        let start = self.calendar.year_start(year);
        let end = self.calendar.year_end(year);
        match (start, end) {
            (Some(start), Some(end)) => Ok(Partition::year(year, start, end)),
            _ => Err(AnalyticsError::config(format!(
                "year {} is out of range for the {} calendar",
                year,
                self.calendar.name()
            ))),
        }
    }

    /// Add one partition per data year inside the supported window.
    ///
    /// Years outside the window are dropped. When no year remains the table
    /// still gets a partition for the current year.
    pub fn plan_years(&self, table: &mut AnalyticsTable, data_years: &[i32]) -> Result<()> {
        let mut years: BTreeSet<i32> = data_years
            .iter()
            .copied()
            .filter(|y| self.bounds.contains(*y))
            .collect();

        if years.len() < data_years.len() {
            tracing::debug!(
                "Table '{}': ignoring {} data year(s) outside {}..={}",
                table.name(),
                data_years.len() - years.len(),
                self.bounds.earliest,
                self.bounds.latest
            );
        }

        if years.is_empty() {
            tracing::info!(
                "Table '{}' has no data years, planning current year {}",
                table.name(),
                self.current_year
            );
            years.insert(self.current_year);
        }

        for year in years {
            table.add_partition(self.year_partition(year)?)?;
        }
        Ok(())
    }

    /// Add the latest partition covering `[last_full_refresh, start_time)`
    pub fn plan_latest(
        &self,
        table: &mut AnalyticsTable,
        last_full_refresh: Option<NaiveDateTime>,
        start_time: NaiveDateTime,
    ) -> Result<()> {
        let start = last_full_refresh.ok_or_else(|| AnalyticsError::config(MISSING_FULL_REFRESH))?;
        if start > start_time {
            return Err(AnalyticsError::config(format!(
                "last full refresh {} is after the run start time {}",
                start, start_time
            )));
        }
        table.add_partition(Partition::latest(start, start_time))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::{EthiopianCalendar, Iso8601Calendar};
    use crate::model::{PartitionKey, Subject, TableType};
    use chrono::NaiveDate;

    fn table() -> AnalyticsTable {
        AnalyticsTable::new(
            "analytics",
            TableType::Event,
            Subject {
                id: 1,
                uid: "IpHINAT79UW".into(),
                name: "Child Programme".into(),
            },
            Vec::new(),
            true,
        )
    }

    fn ts(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    const BOUNDS: YearBounds = YearBounds {
        earliest: 2015,
        latest: 2024,
    };

    #[test]
    fn test_data_years_within_bounds() {
        let planner = PartitionPlanner::new(&Iso8601Calendar, BOUNDS, 2024);
        let mut t = table();
        planner.plan_years(&mut t, &[2023, 2018, 2020]).unwrap();

        let keys: Vec<_> = t.partitions().iter().map(|p| p.key).collect();
        assert_eq!(
            keys,
            vec![
                PartitionKey::Year(2018),
                PartitionKey::Year(2020),
                PartitionKey::Year(2023)
            ]
        );
        assert_eq!(t.partitions()[0].start, ts(2018, 1, 1));
        assert_eq!(t.partitions()[0].end, Some(ts(2019, 1, 1)));
    }

    #[test]
    fn test_out_of_bounds_years_dropped() {
        let planner = PartitionPlanner::new(&Iso8601Calendar, BOUNDS, 2024);
        let mut t = table();
        planner.plan_years(&mut t, &[1999, 2016, 2030]).unwrap();
        let years: Vec<_> = t.partitions().iter().filter_map(|p| p.year_key()).collect();
        assert_eq!(years, vec![2016]);
    }

    #[test]
    fn test_no_data_years_plans_current_year() {
        let planner = PartitionPlanner::new(&Iso8601Calendar, BOUNDS, 2024);
        let mut t = table();
        planner.plan_years(&mut t, &[]).unwrap();
        assert_eq!(t.partitions().len(), 1);
        assert_eq!(t.partitions()[0].key, PartitionKey::Year(2024));
    }

    #[test]
    fn test_ethiopian_year_boundaries() {
        let planner = PartitionPlanner::new(&EthiopianCalendar, BOUNDS, 2016);
        let p = planner.year_partition(2016).unwrap();
        assert_eq!(p.start, ts(2023, 9, 12));
        assert_eq!(p.end, Some(ts(2024, 9, 11)));
    }

    #[test]
    fn test_latest_requires_full_refresh() {
        let planner = PartitionPlanner::new(&Iso8601Calendar, BOUNDS, 2024);
        let mut t = table();
        let err = planner
            .plan_latest(&mut t, None, ts(2024, 5, 1))
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains(MISSING_FULL_REFRESH));
        assert!(!t.has_partitions());
    }

    #[test]
    fn test_latest_window() {
        let planner = PartitionPlanner::new(&Iso8601Calendar, BOUNDS, 2024);
        let mut t = table();
        planner
            .plan_latest(&mut t, Some(ts(2024, 4, 1)), ts(2024, 5, 1))
            .unwrap();
        let latest = t.latest_partition().unwrap();
        assert_eq!(latest.start, ts(2024, 4, 1));
        assert_eq!(latest.end, Some(ts(2024, 5, 1)));
        assert_eq!(t.partitions().len(), 1);
    }
}
