//! Refresh watermarks
//!
//! Two timestamps survive between runs: the start of the last successful
//! full refresh and the start of the last successful latest refresh.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use strata_rdbc::security::validate_sql_identifier;
use strata_rdbc::{Connection, SqlDialect, Value};

use crate::error::{AnalyticsError, Result};

/// Lexical form of persisted watermarks
const WATERMARK_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Default settings table
pub const DEFAULT_SETTINGS_TABLE: &str = "analytics_settings";

/// Persisted watermark
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatermarkKey {
    /// Start time of the last successful full refresh
    LastFullRefresh,
    /// Start time of the last successful latest-partition refresh
    LastLatestRefresh,
}

impl WatermarkKey {
    /// Setting name
    pub fn key(self) -> &'static str {
        match self {
            Self::LastFullRefresh => "keyLastSuccessfulAnalyticsTablesUpdate",
            Self::LastLatestRefresh => "keyLastSuccessfulLatestAnalyticsPartitionUpdate",
        }
    }
}

/// Storage for watermarks
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn get(&self, key: WatermarkKey) -> Result<Option<NaiveDateTime>>;

    async fn set(&self, key: WatermarkKey, value: NaiveDateTime) -> Result<()>;

    async fn clear(&self, key: WatermarkKey) -> Result<()>;
}

/// Watermarks kept in a settings table of the relational store
pub struct SqlWatermarkStore {
    connection: Arc<dyn Connection>,
    dialect: Arc<dyn SqlDialect>,
    table: String,
}

impl SqlWatermarkStore {
    /// Store backed by [`DEFAULT_SETTINGS_TABLE`]
    pub fn new(connection: Arc<dyn Connection>, dialect: Arc<dyn SqlDialect>) -> Self {
        Self {
            connection,
            dialect,
            table: DEFAULT_SETTINGS_TABLE.to_string(),
        }
    }

    /// Use another settings table
    pub fn with_table(mut self, table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        validate_sql_identifier(&table)?;
        self.table = table;
        Ok(self)
    }

    /// Create the settings table if it is missing
    pub async fn ensure_table(&self) -> Result<()> {
        let sql = format!(
            "create table if not exists {} (name varchar(255) primary key, value text)",
            self.dialect.quote_identifier(&self.table)
        );
        self.connection.execute(&sql, &[]).await?;
        Ok(())
    }

    fn table(&self) -> String {
        self.dialect.quote_identifier(&self.table)
    }
}

#[async_trait]
impl WatermarkStore for SqlWatermarkStore {
    async fn get(&self, key: WatermarkKey) -> Result<Option<NaiveDateTime>> {
        let sql = format!(
            "select value from {} where name = {}",
            self.table(),
            self.dialect.placeholder(1)
        );
        let row = self
            .connection
            .query_one(&sql, &[Value::from(key.key())])
            .await?;

        let Some(text) = row.as_ref().and_then(|r| r.get(0)).and_then(|v| v.as_str()) else {
            return Ok(None);
        };
        NaiveDateTime::parse_from_str(text, WATERMARK_FORMAT)
            .map(Some)
            .map_err(|e| {
                AnalyticsError::config(format!(
                    "setting '{}' holds an invalid timestamp '{}': {}",
                    key.key(),
                    text,
                    e
                ))
            })
    }

    async fn set(&self, key: WatermarkKey, value: NaiveDateTime) -> Result<()> {
        let sql = format!(
            "insert into {} (name, value) values ({}, {}) \
             on conflict (name) do update set value = excluded.value",
            self.table(),
            self.dialect.placeholder(1),
            self.dialect.placeholder(2)
        );
        let params = [
            Value::from(key.key()),
            Value::from(value.format(WATERMARK_FORMAT).to_string()),
        ];
        self.connection.execute(&sql, &params).await?;
        tracing::debug!("Watermark '{}' set to {}", key.key(), value);
        Ok(())
    }

    async fn clear(&self, key: WatermarkKey) -> Result<()> {
        let sql = format!(
            "delete from {} where name = {}",
            self.table(),
            self.dialect.placeholder(1)
        );
        self.connection
            .execute(&sql, &[Value::from(key.key())])
            .await?;
        Ok(())
    }
}

/// Watermarks held in memory
#[derive(Debug, Default)]
pub struct InMemoryWatermarkStore {
    values: Mutex<HashMap<WatermarkKey, NaiveDateTime>>,
}

impl InMemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a watermark
    pub fn with(self, key: WatermarkKey, value: NaiveDateTime) -> Self {
        self.values.lock().insert(key, value);
        self
    }

    /// Current value, without going through the async trait
    pub fn peek(&self, key: WatermarkKey) -> Option<NaiveDateTime> {
        self.values.lock().get(&key).copied()
    }
}

#[async_trait]
impl WatermarkStore for InMemoryWatermarkStore {
    async fn get(&self, key: WatermarkKey) -> Result<Option<NaiveDateTime>> {
        Ok(self.peek(key))
    }

    async fn set(&self, key: WatermarkKey, value: NaiveDateTime) -> Result<()> {
        self.values.lock().insert(key, value);
        Ok(())
    }

    async fn clear(&self, key: WatermarkKey) -> Result<()> {
        self.values.lock().remove(&key);
        Ok(())
    }
}
