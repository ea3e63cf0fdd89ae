//! Table, column and partition plans
//!
//! These are transient, per-run values: the orchestrator builds them during
//! planning, hands them to the SQL generator and drops them when the run ends.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use strata_rdbc::{ColumnDefinition, IndexMethod, SqlType};

use crate::error::{AnalyticsError, Result};

/// How a column is indexed after population
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexHint {
    /// Regular btree index
    #[default]
    Default,
    /// Spatial index
    Spatial,
    /// No index
    Skip,
}

/// Whether a column comes from the fixed catalogue or from metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    /// Always present
    Fixed,
    /// Generated per metadata item
    Dynamic,
}

/// A column of an analytics table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Column {
    /// Column name, unique within the table
    pub name: String,
    /// Semantic type
    pub data_type: SqlType,
    /// Whether NULL is allowed
    pub nullable: bool,
    /// Index hint
    pub index: IndexHint,
    /// Select expression producing the value
    pub select: String,
    /// Fixed or dynamic
    pub kind: ColumnKind,
    /// Creation time of the metadata item, used for change detection
    pub created: Option<DateTime<Utc>>,
}

impl Column {
    /// Fixed catalogue column
    pub fn fixed(name: impl Into<String>, data_type: SqlType, select: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
            index: IndexHint::default(),
            select: select.into(),
            kind: ColumnKind::Fixed,
            created: None,
        }
    }

    /// Metadata-derived column
    pub fn dynamic(name: impl Into<String>, data_type: SqlType, select: impl Into<String>) -> Self {
        Self {
            kind: ColumnKind::Dynamic,
            ..Self::fixed(name, data_type, select)
        }
    }

    /// Mark NOT NULL
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Set the index hint
    pub fn with_index(mut self, index: IndexHint) -> Self {
        self.index = index;
        self
    }

    /// Record the metadata creation time
    pub fn with_created(mut self, created: Option<DateTime<Utc>>) -> Self {
        self.created = created;
        self
    }

    /// Index method, or `None` when the column is not indexed
    pub fn index_method(&self) -> Option<IndexMethod> {
        match self.index {
            IndexHint::Skip => None,
            IndexHint::Spatial => Some(IndexMethod::Gist),
            IndexHint::Default if self.data_type.is_spatial() => Some(IndexMethod::Gist),
            IndexHint::Default => Some(IndexMethod::Btree),
        }
    }

    /// Physical column definition
    pub fn definition(&self) -> ColumnDefinition {
        ColumnDefinition {
            name: self.name.clone(),
            data_type: self.data_type,
            nullable: self.nullable,
        }
    }
}

/// Keep the first column of every name, preserving order.
///
/// Fixed columns come first in every derived list, so a dynamic column whose
/// name collides with a fixed one is the one dropped.
pub fn dedup_columns(columns: Vec<Column>) -> Vec<Column> {
    let mut seen = HashSet::with_capacity(columns.len());
    columns
        .into_iter()
        .filter(|c| {
            let fresh = seen.insert(c.name.clone());
            if !fresh {
                tracing::debug!("Dropping duplicate column '{}'", c.name);
            }
            fresh
        })
        .collect()
}

/// Family of analytics tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableType {
    /// One table per program, rows are events
    Event,
    /// One table per tracked-entity type, rows are enrollments
    Enrollment,
}

impl TableType {
    /// Name fragment used in table names
    pub fn key(self) -> &'static str {
        match self {
            Self::Event => "event",
            Self::Enrollment => "enrollment",
        }
    }
}

impl fmt::Display for TableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Metadata object owning a table
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Subject {
    /// Internal numeric id, used in source joins
    pub id: i64,
    /// Metadata UID
    pub uid: String,
    /// Display name
    pub name: String,
}

/// Partition key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionKey {
    /// Calendar year
    Year(i32),
    /// Rolling window of recently modified rows
    Latest,
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Year(year) => write!(f, "{}", year),
            Self::Latest => f.write_str("latest"),
        }
    }
}

/// Physical partition of a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Partition {
    /// Key
    pub key: PartitionKey,
    /// Inclusive start boundary
    pub start: NaiveDateTime,
    /// Exclusive end boundary, open when `None`
    pub end: Option<NaiveDateTime>,
}

impl Partition {
    /// Year partition
    pub fn year(year: i32, start: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self {
            key: PartitionKey::Year(year),
            start,
            end: Some(end),
        }
    }

    /// Latest partition
    pub fn latest(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self {
            key: PartitionKey::Latest,
            start,
            end: Some(end),
        }
    }

    /// Whether this is the latest partition
    #[inline]
    pub fn is_latest(&self) -> bool {
        self.key == PartitionKey::Latest
    }

    /// Year, when this is a year partition
    pub fn year_key(&self) -> Option<i32> {
        match self.key {
            PartitionKey::Year(year) => Some(year),
            PartitionKey::Latest => None,
        }
    }
}

/// Logical analytics table with its partition plan
#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsTable {
    /// Family
    pub table_type: TableType,
    /// Owning subject
    pub subject: Subject,
    /// Ordered, de-duplicated columns
    pub columns: Vec<Column>,
    /// Durable storage
    pub logged: bool,
    prefix: String,
    partitions: Vec<Partition>,
}

impl AnalyticsTable {
    /// Create a table without partitions; columns are de-duplicated
    pub fn new(
        prefix: impl Into<String>,
        table_type: TableType,
        subject: Subject,
        columns: Vec<Column>,
        logged: bool,
    ) -> Self {
        Self {
            table_type,
            subject,
            columns: dedup_columns(columns),
            logged,
            prefix: prefix.into(),
            partitions: Vec::new(),
        }
    }

    /// Published table name, e.g. `analytics_event_ur1edk5oe2n`
    pub fn name(&self) -> String {
        format!(
            "{}_{}_{}",
            self.prefix,
            self.table_type.key(),
            self.subject.uid.to_ascii_lowercase()
        )
    }

    /// Staging table name, e.g. `analytics_temp_event_ur1edk5oe2n`
    pub fn staging_name(&self) -> String {
        format!(
            "{}_temp_{}_{}",
            self.prefix,
            self.table_type.key(),
            self.subject.uid.to_ascii_lowercase()
        )
    }

    /// Published partition name
    pub fn partition_name(&self, partition: &Partition) -> String {
        format!("{}_{}", self.name(), partition.key)
    }

    /// Name the published latest partition has, whether or not it exists
    pub fn latest_partition_name(&self) -> String {
        format!("{}_{}", self.name(), PartitionKey::Latest)
    }

    /// Staging partition name
    pub fn staging_partition_name(&self, partition: &Partition) -> String {
        format!("{}_{}", self.staging_name(), partition.key)
    }

    /// Partitions, latest last and years ascending
    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    /// Whether any partition is planned
    pub fn has_partitions(&self) -> bool {
        !self.partitions.is_empty()
    }

    /// The latest partition, if planned
    pub fn latest_partition(&self) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.is_latest())
    }

    /// Add a partition, keeping year partitions unique and sorted and
    /// allowing at most one latest partition.
    pub fn add_partition(&mut self, partition: Partition) -> Result<()> {
        if self.partitions.iter().any(|p| p.key == partition.key) {
            return Err(AnalyticsError::config(format!(
                "partition '{}' planned twice for table '{}'",
                partition.key,
                self.name()
            )));
        }
        let at = self
            .partitions
            .iter()
            .position(|p| p.key > partition.key)
            .unwrap_or(self.partitions.len());
        self.partitions.insert(at, partition);
        Ok(())
    }

    /// Columns that receive an index, with their method
    pub fn indexed_columns(&self) -> impl Iterator<Item = (&Column, IndexMethod)> {
        self.columns
            .iter()
            .filter_map(|c| c.index_method().map(|m| (c, m)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(y: i32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn table() -> AnalyticsTable {
        AnalyticsTable::new(
            "analytics",
            TableType::Event,
            Subject {
                id: 7,
                uid: "IpHINAT79UW".into(),
                name: "Child Programme".into(),
            },
            vec![
                Column::fixed("psi", SqlType::CharacterFixed(11), "psi.uid").not_null(),
                Column::dynamic("psi", SqlType::Text, "x"),
                Column::fixed("psigeometry", SqlType::Geometry, "psi.geometry"),
                Column::fixed("ouname", SqlType::Text, "ou.name").with_index(IndexHint::Skip),
            ],
            true,
        )
    }

    #[test]
    fn test_names() {
        let t = table();
        assert_eq!(t.name(), "analytics_event_iphinat79uw");
        assert_eq!(t.staging_name(), "analytics_temp_event_iphinat79uw");
        let p = Partition::year(2020, ts(2020), ts(2021));
        assert_eq!(t.partition_name(&p), "analytics_event_iphinat79uw_2020");
        assert_eq!(
            t.staging_partition_name(&Partition::latest(ts(2020), ts(2021))),
            "analytics_temp_event_iphinat79uw_latest"
        );
    }

    #[test]
    fn test_fixed_column_wins_dedup() {
        let t = table();
        assert_eq!(t.columns.len(), 3);
        assert_eq!(t.columns[0].kind, ColumnKind::Fixed);
        assert!(!t.columns[0].nullable);
    }

    #[test]
    fn test_partitions_sorted_and_unique() {
        let mut t = table();
        t.add_partition(Partition::year(2023, ts(2023), ts(2024))).unwrap();
        t.add_partition(Partition::year(2018, ts(2018), ts(2019))).unwrap();
        t.add_partition(Partition::year(2020, ts(2020), ts(2021))).unwrap();
        assert!(t.add_partition(Partition::year(2020, ts(2020), ts(2021))).is_err());

        let years: Vec<_> = t.partitions().iter().filter_map(|p| p.year_key()).collect();
        assert_eq!(years, vec![2018, 2020, 2023]);

        t.add_partition(Partition::latest(ts(2024), ts(2025))).unwrap();
        assert!(t.add_partition(Partition::latest(ts(2024), ts(2025))).is_err());
        assert!(t.partitions().last().unwrap().is_latest());
    }

    #[test]
    fn test_index_methods() {
        let t = table();
        let indexed: Vec<_> = t
            .indexed_columns()
            .map(|(c, m)| (c.name.as_str(), m))
            .collect();
        assert_eq!(
            indexed,
            vec![("psi", IndexMethod::Btree), ("psigeometry", IndexMethod::Gist)]
        );
    }
}
