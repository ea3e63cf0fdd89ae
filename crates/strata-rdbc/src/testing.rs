//! Testing utilities for code that talks to the relational store
//!
//! [`MockConnection`] records every statement it receives and answers from
//! scripted rules, so refresh orchestration can be tested without a live
//! database.
//!
//! # Example
//!
//! ```rust
//! use strata_rdbc::testing::MockConnection;
//! use strata_rdbc::{Connection, Row};
//!
//! # async fn demo() -> strata_rdbc::Result<()> {
//! let conn = MockConnection::new()
//!     .on_query("from pg_extension", vec![Row::single("?column?", 1_i32)])
//!     .on_execute("insert into", 42);
//!
//! assert_eq!(conn.execute("insert into t select 1", &[]).await?, 42);
//! assert_eq!(conn.statements_matching("insert into").len(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! Rules match when their pattern occurs in the statement (ASCII case
//! insensitive). The first matching rule in registration order wins.
//! Unmatched queries return no rows and unmatched statements affect zero rows.
//!
//! Transaction-scoped advisory locks (`pg_try_advisory_xact_lock`) are
//! emulated across every clone of a mock: a lock key is granted to one open
//! transaction at a time and released when that transaction ends.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::connection::{Connection, Transaction};
use crate::error::{Error, Result};
use crate::types::{Row, Value};

type QueryHandler = Arc<dyn Fn(&str, &[Value]) -> Result<Vec<Row>> + Send + Sync>;
type ExecuteHandler = Arc<dyn Fn(&str, &[Value]) -> Result<u64> + Send + Sync>;

/// A statement received by the mock
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedStatement {
    /// SQL text
    pub sql: String,
    /// Bound parameters
    pub params: Vec<Value>,
    /// Transaction the statement ran in, if any
    pub transaction: Option<u64>,
}

/// How a mock transaction ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    /// Committed
    Committed,
    /// Rolled back explicitly
    RolledBack,
}

/// A finished mock transaction
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedTransaction {
    /// Transaction id, matching [`RecordedStatement::transaction`]
    pub id: u64,
    /// How it ended
    pub outcome: TransactionOutcome,
    /// Statements run inside it, in order
    pub statements: Vec<String>,
}

struct Rule<H> {
    pattern: String,
    handler: H,
}

impl<H> Rule<H> {
    fn matches(&self, sql: &str) -> bool {
        sql.to_ascii_lowercase()
            .contains(&self.pattern.to_ascii_lowercase())
    }
}

#[derive(Default)]
struct MockState {
    queries: Mutex<Vec<Rule<QueryHandler>>>,
    executes: Mutex<Vec<Rule<ExecuteHandler>>>,
    failures: Mutex<Vec<(String, String)>>,
    log: Mutex<Vec<RecordedStatement>>,
    transactions: Mutex<Vec<RecordedTransaction>>,
    next_tx: AtomicU64,
    /// Advisory lock key to the transaction holding it
    advisory_locks: Mutex<HashMap<String, u64>>,
    yielding: AtomicBool,
}

const ADVISORY_LOCK: &str = "pg_try_advisory_xact_lock";

fn lock_key(params: &[Value]) -> String {
    match params.first() {
        Some(value) => value
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{:?}", value)),
        None => String::new(),
    }
}

impl MockState {
    async fn pause(&self) {
        if self.yielding.load(Ordering::Relaxed) {
            tokio::task::yield_now().await;
        }
    }

    /// Grant the lock keyed by the first parameter, or report it as held.
    /// Outside a transaction the lock ends with the statement.
    fn try_advisory_lock(&self, params: &[Value], transaction: Option<u64>) -> Vec<Row> {
        let key = lock_key(params);
        let mut locks = self.advisory_locks.lock();
        let locked = match (locks.get(&key), transaction) {
            (Some(holder), Some(tx)) => *holder == tx,
            (Some(_), None) => false,
            (None, Some(tx)) => {
                locks.insert(key, tx);
                true
            }
            (None, None) => true,
        };
        vec![Row::single("locked", locked)]
    }

    fn release_advisory_locks(&self, transaction: u64) {
        self.advisory_locks
            .lock()
            .retain(|_, holder| *holder != transaction);
    }

    fn record(&self, sql: &str, params: &[Value], transaction: Option<u64>) -> Result<()> {
        self.log.lock().push(RecordedStatement {
            sql: sql.to_string(),
            params: params.to_vec(),
            transaction,
        });

        let lower = sql.to_ascii_lowercase();
        let failure = self
            .failures
            .lock()
            .iter()
            .find(|(pattern, _)| lower.contains(&pattern.to_ascii_lowercase()))
            .map(|(_, message)| message.clone());
        match failure {
            Some(message) => Err(Error::query_with_sql(message, sql)),
            None => Ok(()),
        }
    }

    fn query(&self, sql: &str, params: &[Value], transaction: Option<u64>) -> Result<Vec<Row>> {
        self.record(sql, params, transaction)?;
        if sql.contains(ADVISORY_LOCK) {
            return Ok(self.try_advisory_lock(params, transaction));
        }
        let handler = self
            .queries
            .lock()
            .iter()
            .find(|r| r.matches(sql))
            .map(|r| Arc::clone(&r.handler));
        match handler {
            Some(handler) => handler(sql, params),
            None => Ok(Vec::new()),
        }
    }

    fn execute(&self, sql: &str, params: &[Value], transaction: Option<u64>) -> Result<u64> {
        self.record(sql, params, transaction)?;
        let handler = self
            .executes
            .lock()
            .iter()
            .find(|r| r.matches(sql))
            .map(|r| Arc::clone(&r.handler));
        match handler {
            Some(handler) => handler(sql, params),
            None => Ok(0),
        }
    }
}

/// In-memory connection that records statements and answers from rules
///
/// Clones share state, so a test can keep one handle for assertions while
/// the code under test owns another.
#[derive(Clone, Default)]
pub struct MockConnection {
    state: Arc<MockState>,
}

impl std::fmt::Debug for MockConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockConnection")
            .field("statements", &self.state.log.lock().len())
            .finish()
    }
}

impl MockConnection {
    /// Create a mock with no rules
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer queries containing `pattern` with fixed rows
    pub fn on_query(self, pattern: impl Into<String>, rows: Vec<Row>) -> Self {
        self.on_query_with(pattern, move |_, _| Ok(rows.clone()))
    }

    /// Answer queries containing `pattern` with a handler
    pub fn on_query_with<F>(self, pattern: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&str, &[Value]) -> Result<Vec<Row>> + Send + Sync + 'static,
    {
        self.state.queries.lock().push(Rule {
            pattern: pattern.into(),
            handler: Arc::new(handler),
        });
        self
    }

    /// Report `affected` rows for statements containing `pattern`
    pub fn on_execute(self, pattern: impl Into<String>, affected: u64) -> Self {
        self.on_execute_with(pattern, move |_, _| Ok(affected))
    }

    /// Answer statements containing `pattern` with a handler
    pub fn on_execute_with<F>(self, pattern: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&str, &[Value]) -> Result<u64> + Send + Sync + 'static,
    {
        self.state.executes.lock().push(Rule {
            pattern: pattern.into(),
            handler: Arc::new(handler),
        });
        self
    }

    /// Fail every statement or query containing `pattern`
    pub fn fail_on(self, pattern: impl Into<String>, message: impl Into<String>) -> Self {
        self.state
            .failures
            .lock()
            .push((pattern.into(), message.into()));
        self
    }

    /// Yield to the runtime before every statement, so concurrent callers
    /// interleave the way they would against a real store
    pub fn yielding(self) -> Self {
        self.state.yielding.store(true, Ordering::Relaxed);
        self
    }

    /// Every statement received so far, in order
    pub fn statements(&self) -> Vec<RecordedStatement> {
        self.state.log.lock().clone()
    }

    /// SQL of every statement containing `pattern`
    pub fn statements_matching(&self, pattern: &str) -> Vec<String> {
        let pattern = pattern.to_ascii_lowercase();
        self.state
            .log
            .lock()
            .iter()
            .filter(|s| s.sql.to_ascii_lowercase().contains(&pattern))
            .map(|s| s.sql.clone())
            .collect()
    }

    /// Finished transactions, in completion order
    pub fn transactions(&self) -> Vec<RecordedTransaction> {
        self.state.transactions.lock().clone()
    }

    /// Forget recorded statements and transactions, keeping the rules
    pub fn clear_log(&self) {
        self.state.log.lock().clear();
        self.state.transactions.lock().clear();
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.state.pause().await;
        self.state.query(sql, params, None)
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.state.pause().await;
        self.state.execute(sql, params, None)
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        self.state.pause().await;
        let id = self.state.next_tx.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Box::new(MockTransaction {
            id,
            state: Arc::clone(&self.state),
            statements: Mutex::new(Vec::new()),
        }))
    }

    async fn is_valid(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct MockTransaction {
    id: u64,
    state: Arc<MockState>,
    statements: Mutex<Vec<String>>,
}

impl MockTransaction {
    fn finish(self, outcome: TransactionOutcome) {
        let statements = self.statements.into_inner();
        self.state.release_advisory_locks(self.id);
        self.state.transactions.lock().push(RecordedTransaction {
            id: self.id,
            outcome,
            statements,
        });
    }
}

#[async_trait]
impl Transaction for MockTransaction {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.state.pause().await;
        self.statements.lock().push(sql.to_string());
        self.state.query(sql, params, Some(self.id))
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.state.pause().await;
        self.statements.lock().push(sql.to_string());
        self.state.execute(sql, params, Some(self.id))
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.state.pause().await;
        (*self).finish(TransactionOutcome::Committed);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        (*self).finish(TransactionOutcome::RolledBack);
        Ok(())
    }
}
