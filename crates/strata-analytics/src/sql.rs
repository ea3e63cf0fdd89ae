//! DDL and swap statement generation
//!
//! Table-family specific statements (populate, data years, change probes)
//! live with the table managers. This module renders the statements every
//! family shares: staging tables, indexes, statistics and the swaps that
//! promote staging tables into the published namespace.

use sha2::{Digest, Sha256};
use strata_rdbc::{SqlDialect, TableDefinition};

use crate::error::Result;
use crate::model::{AnalyticsTable, Partition};
use crate::template::{SqlParam, SqlTemplate, StatementKind, TemplateParams};

const ROW_COUNT: SqlTemplate =
    SqlTemplate::new(StatementKind::RowCount, "select count(*) as row_count from ${table}");

/// Longest column prefix kept in an index name
const INDEX_COLUMN_PREFIX: usize = 40;

/// Renders shared statements for one run
pub struct SqlGenerator<'a> {
    dialect: &'a dyn SqlDialect,
    nonce: &'a str,
}

impl<'a> SqlGenerator<'a> {
    /// `nonce` makes index names unique per run, so indexes of a staging
    /// table never collide with those of the table it replaces.
    pub fn new(dialect: &'a dyn SqlDialect, nonce: &'a str) -> Self {
        Self { dialect, nonce }
    }

    pub fn dialect(&self) -> &'a dyn SqlDialect {
        self.dialect
    }

    /// Staging master table holding the column definitions
    pub fn create_staging_table(&self, table: &AnalyticsTable) -> String {
        let definition = TableDefinition::new(
            table.staging_name(),
            table.columns.iter().map(|c| c.definition()).collect(),
        )
        .with_logged(table.logged);
        self.dialect.create_table_sql(&definition)
    }

    /// Staging partition inheriting the staging master
    pub fn create_staging_partition(
        &self,
        table: &AnalyticsTable,
        partition: &Partition,
        check: Option<String>,
    ) -> String {
        let mut definition =
            TableDefinition::new(table.staging_partition_name(partition), Vec::new())
                .with_logged(table.logged)
                .inheriting(table.staging_name());
        if let Some(check) = check {
            definition = definition.with_check(check);
        }
        self.dialect.create_table_sql(&definition)
    }

    pub fn drop_table(&self, name: &str) -> String {
        self.dialect.drop_table_sql(name)
    }

    /// Deterministic index name for a column of `table`
    pub fn index_name(&self, table: &str, column: &str) -> String {
        let digest = Sha256::digest(format!("{}|{}|{}", table, column, self.nonce).as_bytes());
        let hash: String = digest.iter().take(5).map(|b| format!("{:02x}", b)).collect();
        let prefix: String = column
            .chars()
            .take(INDEX_COLUMN_PREFIX)
            .map(|c| c.to_ascii_lowercase())
            .collect();
        format!("in_{}_{}", prefix, hash)
    }

    /// One index per indexable column of `target`
    pub fn create_indexes(&self, table: &AnalyticsTable, target: &str) -> Vec<String> {
        table
            .indexed_columns()
            .map(|(column, method)| {
                self.dialect.create_index_sql(
                    &self.index_name(target, &column.name),
                    target,
                    &column.name,
                    method,
                )
            })
            .collect()
    }

    pub fn analyze(&self, name: &str) -> String {
        self.dialect.analyze_sql(name)
    }

    /// Row count of a table
    pub fn row_count(&self, name: &str) -> Result<String> {
        ROW_COUNT.render(
            &TemplateParams::new().set("table", SqlParam::identifier(name)),
            self.dialect,
        )
    }

    /// Replace the whole published table family
    pub fn full_swap(&self, table: &AnalyticsTable) -> Vec<String> {
        let mut statements = vec![
            self.dialect.drop_table_sql(&table.name()),
            self.dialect
                .rename_table_sql(&table.staging_name(), &table.name()),
        ];
        statements.extend(table.partitions().iter().map(|p| {
            self.dialect
                .rename_table_sql(&table.staging_partition_name(p), &table.partition_name(p))
        }));
        statements
    }

    /// Move rebuilt partitions into an existing published table, keeping
    /// the partitions that were not rebuilt
    pub fn partial_swap(&self, table: &AnalyticsTable) -> Vec<String> {
        let mut statements = Vec::new();
        for partition in table.partitions() {
            statements.extend(self.attach_partition(table, partition));
        }
        statements.push(self.dialect.drop_table_sql(&table.staging_name()));
        statements
    }

    /// Replace one published partition with its staging counterpart
    pub fn attach_partition(&self, table: &AnalyticsTable, partition: &Partition) -> Vec<String> {
        let staging = table.staging_partition_name(partition);
        let published = table.partition_name(partition);
        vec![
            self.dialect.drop_table_sql(&published),
            self.dialect.rename_table_sql(&staging, &published),
            self.dialect
                .no_inherit_sql(&published, &table.staging_name()),
            self.dialect.inherit_sql(&published, &table.name()),
        ]
    }
}
