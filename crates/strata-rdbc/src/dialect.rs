//! SQL dialect abstraction for strata-rdbc
//!
//! Analytics tables are plain DDL plus insert-select statements, so the
//! dialect covers what the engine needs from a store beyond standard SQL:
//! - Identifier quoting and parameter placeholders
//! - Type mapping for [`SqlType`]
//! - Table families (inheritance with check constraints), logging mode
//! - Index methods, statistics, spatial feature detection
//! - JSON-path extraction and regex matching inside select expressions
//!
//! Statements that sea-query can express (drop, rename, create index) are
//! built with it; table creation with inheritance and logging mode is
//! PostgreSQL specific and rendered by hand.

use crate::connection::DatabaseType;
use crate::error::{Error, Result};
use crate::security::escape_string_literal;
use crate::types::{IndexMethod, SqlType, TableDefinition};
use sea_query::{Alias, Index, IndexType, IntoIden, PostgresQueryBuilder, Table};

/// SQL dialect for vendor-specific SQL generation
pub trait SqlDialect: Send + Sync {
    /// Get the dialect name
    fn name(&self) -> &'static str;

    /// Quote an identifier (table, column name)
    fn quote_identifier(&self, name: &str) -> String;

    /// Get the placeholder for a bind parameter (1-based)
    fn placeholder(&self, index: usize) -> String;

    /// Native type name for a semantic column type
    fn native_type(&self, data_type: SqlType) -> String;

    /// `CREATE TABLE` for a definition
    fn create_table_sql(&self, table: &TableDefinition) -> String;

    /// `DROP TABLE IF EXISTS`, dropping dependent child tables too
    fn drop_table_sql(&self, table: &str) -> String;

    /// Rename a table
    fn rename_table_sql(&self, from: &str, to: &str) -> String;

    /// Attach a child table to a parent family
    fn inherit_sql(&self, child: &str, parent: &str) -> String;

    /// Detach a child table from a parent family
    fn no_inherit_sql(&self, child: &str, parent: &str) -> String;

    /// Create a single-column index
    fn create_index_sql(&self, index: &str, table: &str, column: &str, method: IndexMethod)
        -> String;

    /// Refresh planner statistics for a table
    fn analyze_sql(&self, table: &str) -> String;

    /// Query returning one row when the table exists; binds the table name as `$1`
    fn table_exists_sql(&self) -> String;

    /// Query returning one row when the spatial extension is installed
    fn spatial_support_sql(&self) -> String;

    /// Query returning one boolean row: whether a lock keyed by `$1` was
    /// taken. The lock is shared by every session of the store and held
    /// until the enclosing transaction ends.
    fn try_transaction_lock_sql(&self) -> String;

    /// Text of a top-level key of a JSON column
    fn json_extract_text(&self, expr: &str, key: &str) -> String;

    /// Text at a path inside a JSON column
    fn json_path_text(&self, expr: &str, path: &[&str]) -> String;

    /// Case-insensitive regular expression match
    fn regex_match(&self, expr: &str, pattern: &str) -> String;

    /// Calendar year of a date or timestamp expression
    fn extract_year(&self, expr: &str) -> String;

    /// Escape a string literal
    fn escape_string(&self, value: &str) -> String;

    /// Render a single-quoted string literal
    fn string_literal(&self, value: &str) -> String {
        format!("'{}'", self.escape_string(value))
    }
}

/// PostgreSQL dialect (PostGIS optional)
#[derive(Debug, Clone, Default)]
pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn native_type(&self, data_type: SqlType) -> String {
        match data_type {
            SqlType::CharacterFixed(n) => format!("character({})", n),
            SqlType::Varchar(n) => format!("varchar({})", n),
            SqlType::Text => "text".to_string(),
            SqlType::Integer => "integer".to_string(),
            SqlType::BigInt => "bigint".to_string(),
            SqlType::Double => "double precision".to_string(),
            SqlType::Boolean => "boolean".to_string(),
            SqlType::Date => "date".to_string(),
            SqlType::Timestamp => "timestamp".to_string(),
            SqlType::Geometry => "geometry".to_string(),
        }
    }

    fn create_table_sql(&self, table: &TableDefinition) -> String {
        let mut parts: Vec<String> = table
            .columns
            .iter()
            .map(|c| {
                let mut def = format!(
                    "{} {}",
                    self.quote_identifier(&c.name),
                    self.native_type(c.data_type)
                );
                if !c.nullable {
                    def.push_str(" not null");
                }
                def
            })
            .collect();

        if let Some(check) = &table.check {
            parts.push(format!("check ({})", check));
        }

        let mut sql = format!(
            "create {}table {} ({})",
            if table.logged { "" } else { "unlogged " },
            self.quote_identifier(&table.name),
            parts.join(", ")
        );

        if let Some(parent) = &table.inherits {
            sql.push_str(&format!(" inherits ({})", self.quote_identifier(parent)));
        }
        sql
    }

    fn drop_table_sql(&self, table: &str) -> String {
        Table::drop()
            .table(Alias::new(table))
            .if_exists()
            .cascade()
            .to_string(PostgresQueryBuilder)
    }

    fn rename_table_sql(&self, from: &str, to: &str) -> String {
        Table::rename()
            .table(Alias::new(from), Alias::new(to))
            .to_string(PostgresQueryBuilder)
    }

    fn inherit_sql(&self, child: &str, parent: &str) -> String {
        format!(
            "alter table {} inherit {}",
            self.quote_identifier(child),
            self.quote_identifier(parent)
        )
    }

    fn no_inherit_sql(&self, child: &str, parent: &str) -> String {
        format!(
            "alter table {} no inherit {}",
            self.quote_identifier(child),
            self.quote_identifier(parent)
        )
    }

    fn create_index_sql(
        &self,
        index: &str,
        table: &str,
        column: &str,
        method: IndexMethod,
    ) -> String {
        let mut stmt = Index::create();
        stmt.name(index).table(Alias::new(table)).col(Alias::new(column));
        if method == IndexMethod::Gist {
            stmt.index_type(IndexType::Custom(Alias::new("gist").into_iden()));
        }
        stmt.to_string(PostgresQueryBuilder)
    }

    fn analyze_sql(&self, table: &str) -> String {
        format!("analyze {}", self.quote_identifier(table))
    }

    fn table_exists_sql(&self) -> String {
        "select 1 from pg_catalog.pg_tables where schemaname = 'public' and tablename = $1"
            .to_string()
    }

    fn spatial_support_sql(&self) -> String {
        "select 1 from pg_extension where extname = 'postgis'".to_string()
    }

    fn try_transaction_lock_sql(&self) -> String {
        "select pg_try_advisory_xact_lock(hashtext($1)) as locked".to_string()
    }

    fn json_extract_text(&self, expr: &str, key: &str) -> String {
        format!("{} ->> {}", expr, self.string_literal(key))
    }

    fn json_path_text(&self, expr: &str, path: &[&str]) -> String {
        format!("{} #>> '{{{}}}'", expr, self.escape_string(&path.join(", ")))
    }

    fn regex_match(&self, expr: &str, pattern: &str) -> String {
        format!("{} ~* {}", expr, self.string_literal(pattern))
    }

    fn extract_year(&self, expr: &str) -> String {
        format!("extract(year from {})", expr)
    }

    fn escape_string(&self, value: &str) -> String {
        escape_string_literal(value)
    }
}

/// Dialect for a configured database kind.
///
/// Only PostgreSQL can host analytics tables today; the other kinds are
/// accepted by the configuration parser but rejected here, before any
/// statement is generated.
pub fn dialect_for(kind: DatabaseType) -> Result<Box<dyn SqlDialect>> {
    match kind {
        DatabaseType::PostgreSQL => Ok(Box::new(PostgresDialect)),
        other => Err(Error::config(format!(
            "analytics tables are not supported on database kind '{}'",
            other.key()
        ))),
    }
}
