//! PostgreSQL backend implementation for strata-rdbc
//!
//! - Connection with bind-parameter conversion
//! - Transactions driven by explicit `begin` / `commit` / `rollback`
//! - Connection factory honouring connect timeout, application name and
//!   statement timeout

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::types::{FromSql, ToSql, Type};

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory, DatabaseType, Transaction};
use crate::error::{Error, Result};
use crate::types::{Row, Value};

type BoxedParam = Box<dyn ToSql + Sync + Send>;

/// Convert a strata Value to a tokio-postgres compatible parameter
fn value_to_sql(value: &Value) -> BoxedParam {
    match value {
        Value::Null => Box::new(Option::<String>::None),
        Value::Bool(b) => Box::new(*b),
        Value::Int32(n) => Box::new(*n),
        Value::Int64(n) => Box::new(*n),
        Value::Float64(n) => Box::new(*n),
        Value::String(s) => Box::new(s.clone()),
        Value::Date(d) => Box::new(*d),
        Value::DateTime(dt) => Box::new(*dt),
        Value::DateTimeTz(dt) => Box::new(*dt),
        Value::Json(j) => Box::new(j.clone()),
    }
}

fn bind(params: &[Value]) -> Vec<BoxedParam> {
    params.iter().map(value_to_sql).collect()
}

fn param_refs(boxed: &[BoxedParam]) -> Vec<&(dyn ToSql + Sync)> {
    boxed
        .iter()
        .map(|b| b.as_ref() as &(dyn ToSql + Sync))
        .collect()
}

fn column<'a, T: FromSql<'a>>(row: &'a tokio_postgres::Row, idx: usize) -> Option<T> {
    row.try_get::<_, Option<T>>(idx).ok().flatten()
}

/// Convert a PostgreSQL value to a strata Value
fn pg_value_to_value(row: &tokio_postgres::Row, idx: usize, pg_type: &Type) -> Value {
    let value = match *pg_type {
        Type::BOOL => column::<bool>(row, idx).map(Value::Bool),
        Type::INT2 => column::<i16>(row, idx).map(|n| Value::Int32(i32::from(n))),
        Type::INT4 => column::<i32>(row, idx).map(Value::Int32),
        Type::INT8 => column::<i64>(row, idx).map(Value::Int64),
        Type::FLOAT4 => column::<f32>(row, idx).map(|n| Value::Float64(f64::from(n))),
        Type::FLOAT8 => column::<f64>(row, idx).map(Value::Float64),
        Type::DATE => column::<chrono::NaiveDate>(row, idx).map(Value::Date),
        Type::TIMESTAMP => column::<chrono::NaiveDateTime>(row, idx).map(Value::DateTime),
        Type::TIMESTAMPTZ => {
            column::<chrono::DateTime<chrono::Utc>>(row, idx).map(Value::DateTimeTz)
        }
        Type::JSON | Type::JSONB => column::<serde_json::Value>(row, idx).map(Value::Json),
        _ => column::<String>(row, idx).map(Value::String),
    };
    value.unwrap_or(Value::Null)
}

/// Convert a tokio-postgres row to a strata Row
fn pg_row_to_row(pg_row: &tokio_postgres::Row) -> Row {
    let columns = pg_row
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();

    let values = pg_row
        .columns()
        .iter()
        .enumerate()
        .map(|(i, col)| pg_value_to_value(pg_row, i, col.type_()))
        .collect();

    Row::new(columns, values)
}

async fn run_query(client: &tokio_postgres::Client, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
    let boxed = bind(params);
    let pg_rows = client
        .query(sql, &param_refs(&boxed))
        .await
        .map_err(|e| Error::query_with_sql(e.to_string(), sql))?;
    Ok(pg_rows.iter().map(pg_row_to_row).collect())
}

async fn run_execute(client: &tokio_postgres::Client, sql: &str, params: &[Value]) -> Result<u64> {
    let boxed = bind(params);
    client
        .execute(sql, &param_refs(&boxed))
        .await
        .map_err(|e| Error::query_with_sql(e.to_string(), sql))
}

fn transaction_error(e: tokio_postgres::Error) -> Error {
    Error::Transaction {
        message: e.to_string(),
        source: Some(Box::new(e)),
    }
}

/// PostgreSQL connection implementation
pub struct PgConnection {
    client: Arc<tokio_postgres::Client>,
    closed: AtomicBool,
}

impl PgConnection {
    /// Create a new connection from a tokio-postgres client
    pub fn new(client: tokio_postgres::Client) -> Self {
        Self {
            client: Arc::new(client),
            closed: AtomicBool::new(false),
        }
    }

    /// Get the underlying client
    pub fn client(&self) -> &tokio_postgres::Client {
        &self.client
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::connection("connection is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.ensure_open()?;
        run_query(&self.client, sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.ensure_open()?;
        run_execute(&self.client, sql, params).await
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        self.ensure_open()?;
        self.client
            .batch_execute("begin")
            .await
            .map_err(transaction_error)?;

        Ok(Box::new(PgTransaction {
            client: Arc::clone(&self.client),
            finished: AtomicBool::new(false),
        }))
    }

    async fn is_valid(&self) -> bool {
        if self.closed.load(Ordering::Relaxed) {
            return false;
        }
        self.client.simple_query("select 1").await.is_ok()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// PostgreSQL transaction
pub struct PgTransaction {
    client: Arc<tokio_postgres::Client>,
    finished: AtomicBool,
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        run_query(&self.client, sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        run_execute(&self.client, sql, params).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.finished.store(true, Ordering::Relaxed);
        self.client
            .batch_execute("commit")
            .await
            .map_err(transaction_error)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.finished.store(true, Ordering::Relaxed);
        self.client
            .batch_execute("rollback")
            .await
            .map_err(transaction_error)
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        if !self.finished.load(Ordering::Relaxed) {
            // Drop cannot await; roll back on a detached task so the pooled
            // connection does not go back idle inside an open transaction.
            let client = Arc::clone(&self.client);
            tracing::warn!("Transaction dropped without commit or rollback, rolling back");
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = client.batch_execute("rollback").await;
                });
            }
        }
    }
}

/// PostgreSQL connection factory
#[derive(Debug, Clone, Default)]
pub struct PgConnectionFactory;

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let mut pg_config: tokio_postgres::Config = config
            .url
            .parse()
            .map_err(|e| Error::connection_with_source("invalid connection url", e))?;

        if config.connect_timeout_ms > 0 {
            pg_config.connect_timeout(Duration::from_millis(config.connect_timeout_ms));
        }
        if let Some(name) = &config.application_name {
            pg_config.application_name(name);
        }

        let (client, connection) = pg_config
            .connect(tokio_postgres::NoTls)
            .await
            .map_err(|e| Error::connection_with_source("failed to connect", e))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("PostgreSQL connection error: {}", e);
            }
        });

        if config.statement_timeout_ms > 0 {
            client
                .batch_execute(&format!(
                    "set statement_timeout = {}",
                    config.statement_timeout_ms
                ))
                .await
                .map_err(|e| Error::connection_with_source("failed to set statement timeout", e))?;
        }

        Ok(Box::new(PgConnection::new(client)))
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }
}
