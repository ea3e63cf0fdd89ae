//! Typed SQL templates with named placeholders
//!
//! Statement text is `'static` and written in this crate. Values are bound to
//! `${key}` placeholders through [`SqlParam`], whose constructors only accept
//! shapes that are safe to splice into SQL:
//! - identifiers, validated then quoted by the dialect
//! - metadata UIDs, validated
//! - integers, dates and timestamps, formatted to a fixed lexical form
//! - status allow-lists made of `'static` literals
//! - crate-internal fragments (other rendered templates, column lists)
//!
//! Each [`StatementKind`] carries a strict allow-list of keys. Unknown keys,
//! keys outside the allow-list and unbound placeholders are template errors,
//! raised before anything is executed.

use chrono::{NaiveDate, NaiveDateTime};
use std::collections::BTreeMap;
use strata_rdbc::security::{validate_sql_identifier, validate_uid};
use strata_rdbc::SqlDialect;

use crate::error::{AnalyticsError, Result};

/// Lexical form of timestamps in generated SQL
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Lexical form of dates in generated SQL
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Kind of statement a template renders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    /// Select expression of a dynamic column
    ColumnExpression,
    /// Insert-select populating one partition
    Populate,
    /// Filter restricting population to a partition
    PartitionFilter,
    /// Distinct data years of a subject
    DataYears,
    /// Lower bound on the event date when an earliest date is given
    FromDateFilter,
    /// Probe for rows modified within a window
    HasUpdated,
    /// Delete rows modified within a window
    DeleteUpdated,
    /// Delete latest-partition rows superseded by rebuilt year partitions
    PruneLatest,
    /// Row count of a table
    RowCount,
}

impl StatementKind {
    /// Placeholder keys this kind may use
    pub fn allowed_keys(self) -> &'static [&'static str] {
        match self {
            Self::ColumnExpression => &[
                "uid",
                "column",
                "attributeId",
                "legendSetId",
                "value",
                "select",
                "dataClause",
            ],
            Self::Populate => &[
                "table",
                "columns",
                "selects",
                "startTime",
                "partitionClause",
                "programId",
                "trackedEntityTypeId",
                "eventDate",
                "firstYear",
                "latestYear",
                "statuses",
            ],
            Self::PartitionFilter => &["dateColumn", "start", "end"],
            Self::DataYears => &[
                "eventDate",
                "startTime",
                "programId",
                "trackedEntityTypeId",
                "fromDateClause",
                "firstYear",
                "latestYear",
            ],
            Self::FromDateFilter => &["dateColumn", "fromDate"],
            Self::HasUpdated => &["programId", "start", "end"],
            Self::DeleteUpdated => &["table", "programId", "start", "end"],
            Self::PruneLatest => &["latestTable", "stagingTable"],
            Self::RowCount => &["table"],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum ParamValue {
    Identifier(String),
    Uid(String),
    Integer(i64),
    Timestamp(NaiveDateTime),
    Date(NaiveDate),
    Statuses(&'static [&'static str]),
    Fragment(String),
}

/// A value bound to a template placeholder
#[derive(Debug, Clone, PartialEq)]
pub struct SqlParam(ParamValue);

impl SqlParam {
    /// Table, column or index name; validated and quoted
    pub fn identifier(name: impl Into<String>) -> Self {
        Self(ParamValue::Identifier(name.into()))
    }

    /// Metadata UID; validated, rendered verbatim
    pub fn uid(uid: impl Into<String>) -> Self {
        Self(ParamValue::Uid(uid.into()))
    }

    /// Integer, rendered in decimal
    pub fn integer(value: i64) -> Self {
        Self(ParamValue::Integer(value))
    }

    /// Timestamp, rendered as a quoted literal
    pub fn timestamp(value: NaiveDateTime) -> Self {
        Self(ParamValue::Timestamp(value))
    }

    /// Date, rendered as a quoted literal
    pub fn date(value: NaiveDate) -> Self {
        Self(ParamValue::Date(value))
    }

    /// Comma-separated quoted status literals
    pub fn statuses(values: &'static [&'static str]) -> Self {
        Self(ParamValue::Statuses(values))
    }

    /// SQL generated inside this crate
    pub(crate) fn fragment(sql: impl Into<String>) -> Self {
        Self(ParamValue::Fragment(sql.into()))
    }

    fn render(&self, key: &str, dialect: &dyn SqlDialect) -> Result<String> {
        let rendered = match &self.0 {
            ParamValue::Identifier(name) => {
                validate_sql_identifier(name).map_err(|e| {
                    AnalyticsError::template(format!("parameter '{}': {}", key, e))
                })?;
                dialect.quote_identifier(name)
            }
            ParamValue::Uid(uid) => {
                validate_uid(uid).map_err(|e| {
                    AnalyticsError::template(format!("parameter '{}': {}", key, e))
                })?;
                uid.clone()
            }
            ParamValue::Integer(n) => n.to_string(),
            ParamValue::Timestamp(ts) => {
                dialect.string_literal(&ts.format(TIMESTAMP_FORMAT).to_string())
            }
            ParamValue::Date(d) => dialect.string_literal(&d.format(DATE_FORMAT).to_string()),
            ParamValue::Statuses(values) => values
                .iter()
                .map(|v| dialect.string_literal(v))
                .collect::<Vec<_>>()
                .join(","),
            ParamValue::Fragment(sql) => sql.clone(),
        };
        Ok(rendered)
    }
}

/// Parameters bound to one template
#[derive(Debug, Clone, Default)]
pub struct TemplateParams {
    values: BTreeMap<&'static str, SqlParam>,
}

impl TemplateParams {
    /// Create an empty parameter map
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a parameter
    pub fn set(mut self, key: &'static str, value: SqlParam) -> Self {
        self.values.insert(key, value);
        self
    }
}

/// A statement template
#[derive(Debug, Clone, Copy)]
pub struct SqlTemplate {
    kind: StatementKind,
    text: &'static str,
}

impl SqlTemplate {
    /// Create a template of the given kind
    pub const fn new(kind: StatementKind, text: &'static str) -> Self {
        Self { kind, text }
    }

    /// Statement kind
    pub fn kind(&self) -> StatementKind {
        self.kind
    }

    /// Substitute every placeholder
    pub fn render(&self, params: &TemplateParams, dialect: &dyn SqlDialect) -> Result<String> {
        let allowed = self.kind.allowed_keys();

        if let Some(key) = params.values.keys().find(|k| !allowed.contains(*k)) {
            return Err(AnalyticsError::template(format!(
                "key '{}' is not allowed in {:?} statements",
                key, self.kind
            )));
        }

        let mut out = String::with_capacity(self.text.len() + 64);
        let mut rest = self.text;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find('}').ok_or_else(|| {
                AnalyticsError::template(format!("unterminated placeholder in {:?}", self.kind))
            })?;
            let key = &after[..end];
            if !allowed.contains(&key) {
                return Err(AnalyticsError::template(format!(
                    "placeholder '{}' is not allowed in {:?} statements",
                    key, self.kind
                )));
            }
            let value = params.values.get(key).ok_or_else(|| {
                AnalyticsError::template(format!(
                    "no value bound for placeholder '{}' in {:?} statement",
                    key, self.kind
                ))
            })?;
            out.push_str(&value.render(key, dialect)?);
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }
}
