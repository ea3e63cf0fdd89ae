//! Connection pool for strata-rdbc
//!
//! The pool is the only shared mutable resource of a refresh run: every
//! subject worker borrows a connection per statement (or per transaction) and
//! hands it back when done. The pool itself implements [`Connection`], so the
//! engine never deals with leases directly.
//!
//! - Semaphore-bounded size
//! - Validation on borrow and connection recycling by lifetime / idleness
//! - Atomic statistics

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory, Transaction};
use crate::error::{Error, Result};
use crate::types::{Row, Value};

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connection configuration
    pub connection: ConnectionConfig,
    /// Connections opened eagerly
    pub min_size: usize,
    /// Maximum pool size
    pub max_size: usize,
    /// Maximum time to wait for a connection
    pub acquire_timeout: Duration,
    /// Maximum connection lifetime (for recycling)
    pub max_lifetime: Duration,
    /// Idle timeout (connections idle longer are closed)
    pub idle_timeout: Duration,
    /// Whether to test connections on borrow
    pub test_on_borrow: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            min_size: 1,
            max_size: 8,
            acquire_timeout: Duration::from_secs(30),
            max_lifetime: Duration::from_secs(1800),
            idle_timeout: Duration::from_secs(600),
            test_on_borrow: true,
        }
    }
}

impl PoolConfig {
    /// Create pool config from a connection URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            connection: ConnectionConfig::new(url),
            ..Default::default()
        }
    }

    /// Use an existing connection configuration
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    /// Set minimum pool size
    pub fn with_min_size(mut self, size: usize) -> Self {
        self.min_size = size;
        self
    }

    /// Set maximum pool size
    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Set acquire timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set maximum connection lifetime
    pub fn with_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    /// Set idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Enable/disable test on borrow
    pub fn with_test_on_borrow(mut self, test: bool) -> Self {
        self.test_on_borrow = test;
        self
    }
}

/// Pool statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total number of connections created
    pub connections_created: u64,
    /// Total number of connections closed
    pub connections_closed: u64,
    /// Total number of connection acquisitions
    pub acquisitions: u64,
    /// Number of times the acquire timeout elapsed
    pub exhausted_count: u64,
    /// Total wait time for connections (in milliseconds)
    pub total_wait_time_ms: u64,
    /// Number of health check failures
    pub health_check_failures: u64,
}

/// Atomic pool stats for concurrent updates
#[derive(Debug, Default)]
#[allow(missing_docs)]
pub struct AtomicPoolStats {
    pub connections_created: AtomicU64,
    pub connections_closed: AtomicU64,
    pub acquisitions: AtomicU64,
    pub exhausted_count: AtomicU64,
    pub total_wait_time_ms: AtomicU64,
    pub health_check_failures: AtomicU64,
}

impl AtomicPoolStats {
    /// Create new atomic stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection creation
    pub fn record_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection close
    pub fn record_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an acquisition
    pub fn record_acquisition(&self, wait_time_ms: u64) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.total_wait_time_ms
            .fetch_add(wait_time_ms, Ordering::Relaxed);
    }

    /// Record pool exhaustion
    pub fn record_exhausted(&self) {
        self.exhausted_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record health check failure
    pub fn record_health_check_failure(&self) {
        self.health_check_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot current stats
    pub fn snapshot(&self) -> PoolStats {
        PoolStats {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            exhausted_count: self.exhausted_count.load(Ordering::Relaxed),
            total_wait_time_ms: self.total_wait_time_ms.load(Ordering::Relaxed),
            health_check_failures: self.health_check_failures.load(Ordering::Relaxed),
        }
    }
}

struct PoolEntry {
    conn: Box<dyn Connection>,
    created_at: Instant,
    last_used: Instant,
}

struct PoolInner {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    idle: Mutex<Vec<PoolEntry>>,
    permits: Arc<Semaphore>,
    total_connections: AtomicUsize,
    stats: AtomicPoolStats,
    shutdown: AtomicBool,
}

impl PoolInner {
    fn should_recycle(&self, entry: &PoolEntry) -> bool {
        entry.created_at.elapsed() > self.config.max_lifetime
            || entry.last_used.elapsed() > self.config.idle_timeout
    }

    fn discard(&self) {
        self.total_connections.fetch_sub(1, Ordering::Release);
        self.stats.record_closed();
    }

    async fn create_entry(&self) -> Result<PoolEntry> {
        let conn = self.factory.connect(&self.config.connection).await?;
        self.total_connections.fetch_add(1, Ordering::Release);
        self.stats.record_created();
        let now = Instant::now();
        Ok(PoolEntry {
            conn,
            created_at: now,
            last_used: now,
        })
    }
}

/// A connection borrowed from the pool, returned on drop
struct Lease {
    entry: Option<PoolEntry>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    fn conn(&self) -> Result<&dyn Connection> {
        self.entry
            .as_ref()
            .map(|e| e.conn.as_ref())
            .ok_or_else(|| Error::Internal {
                message: "pooled connection already returned".into(),
            })
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(mut entry) = self.entry.take() {
            if self.pool.shutdown.load(Ordering::Acquire) {
                self.pool.discard();
                return;
            }
            entry.last_used = Instant::now();
            self.pool.idle.lock().push(entry);
        }
    }
}

/// Semaphore-bounded connection pool
///
/// Cloning is cheap and every clone shares the same connections.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.inner.config)
            .field("size", &self.size())
            .finish()
    }
}

impl ConnectionPool {
    /// Create a pool and open `min_size` connections eagerly.
    ///
    /// Fails if not even the first eager connection can be opened, so a
    /// misconfigured URL surfaces before any refresh work is planned.
    pub async fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Result<Self> {
        if config.max_size == 0 {
            return Err(Error::config("pool max_size must be at least 1"));
        }

        let pool = Self {
            inner: Arc::new(PoolInner {
                permits: Arc::new(Semaphore::new(config.max_size)),
                idle: Mutex::new(Vec::with_capacity(config.max_size)),
                total_connections: AtomicUsize::new(0),
                stats: AtomicPoolStats::new(),
                shutdown: AtomicBool::new(false),
                factory,
                config,
            }),
        };

        let eager = pool.inner.config.min_size.min(pool.inner.config.max_size);
        for i in 0..eager {
            match pool.inner.create_entry().await {
                Ok(entry) => pool.inner.idle.lock().push(entry),
                Err(e) if i == 0 => return Err(e),
                Err(e) => {
                    tracing::warn!("Failed to pre-open pooled connection: {}", e);
                    break;
                }
            }
        }

        Ok(pool)
    }

    /// Current number of open connections
    pub fn size(&self) -> usize {
        self.inner.total_connections.load(Ordering::Acquire)
    }

    /// Number of idle connections
    pub fn idle(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// Pool statistics
    pub fn stats(&self) -> PoolStats {
        self.inner.stats.snapshot()
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    async fn acquire(&self) -> Result<Lease> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(Error::PoolExhausted {
                message: "Pool is shut down".to_string(),
            });
        }

        let start = Instant::now();
        let permit = tokio::time::timeout(
            self.inner.config.acquire_timeout,
            self.inner.permits.clone().acquire_owned(),
        )
        .await
        .map_err(|_| {
            self.inner.stats.record_exhausted();
            Error::PoolExhausted {
                message: format!(
                    "Timeout waiting for connection ({}ms)",
                    self.inner.config.acquire_timeout.as_millis()
                ),
            }
        })?
        .map_err(|_| Error::PoolExhausted {
            message: "Pool semaphore closed".to_string(),
        })?;

        let mut reused = None;
        loop {
            let candidate = self.inner.idle.lock().pop();
            let Some(entry) = candidate else { break };

            if self.inner.should_recycle(&entry) {
                let _ = entry.conn.close().await;
                self.inner.discard();
                continue;
            }
            if self.inner.config.test_on_borrow && !entry.conn.is_valid().await {
                self.inner.discard();
                self.inner.stats.record_health_check_failure();
                continue;
            }
            reused = Some(entry);
            break;
        }

        let entry = match reused {
            Some(entry) => entry,
            None => self.inner.create_entry().await?,
        };

        self.inner
            .stats
            .record_acquisition(start.elapsed().as_millis() as u64);

        Ok(Lease {
            entry: Some(entry),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Close idle connections and refuse new acquisitions
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.shutdown.store(true, Ordering::Release);
        let drained: Vec<PoolEntry> = self.inner.idle.lock().drain(..).collect();
        for entry in drained {
            let _ = entry.conn.close().await;
            self.inner.discard();
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for ConnectionPool {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let lease = self.acquire().await?;
        lease.conn()?.query(sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let lease = self.acquire().await?;
        lease.conn()?.execute(sql, params).await
    }

    async fn execute_batch(&self, statements: &[String]) -> Result<Vec<u64>> {
        let lease = self.acquire().await?;
        lease.conn()?.execute_batch(statements).await
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        let lease = self.acquire().await?;
        let tx = lease.conn()?.begin().await?;
        Ok(Box::new(PooledTransaction { tx, _lease: lease }))
    }

    async fn is_valid(&self) -> bool {
        match self.acquire().await {
            Ok(lease) => match lease.conn() {
                Ok(conn) => conn.is_valid().await,
                Err(_) => false,
            },
            Err(_) => false,
        }
    }

    async fn close(&self) -> Result<()> {
        self.shutdown().await
    }
}

/// Transaction pinned to one pooled connection until commit or rollback
struct PooledTransaction {
    tx: Box<dyn Transaction>,
    _lease: Lease,
}

#[async_trait]
impl Transaction for PooledTransaction {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.tx.query(sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.tx.execute(sql, params).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let this = *self;
        this.tx.commit().await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let this = *self;
        this.tx.rollback().await
    }
}
