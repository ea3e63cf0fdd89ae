//! Single-flight guards per published table
//!
//! [`TableLockRegistry`] rejects a second refresh of a table inside one
//! process without a round trip. [`StoreLock`] extends the guarantee to
//! every process refreshing against the same store.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use strata_rdbc::{Connection, SqlDialect, Transaction, Value};

use crate::error::{AnalyticsError, Result};

/// Tables currently being refreshed in this process
///
/// Share one registry between every orchestrator of a process. A second
/// refresh of a table that is in flight is rejected, never queued.
#[derive(Debug, Default)]
pub struct TableLockRegistry {
    held: Mutex<HashSet<String>>,
}

impl TableLockRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take the lock for `table`, or fail with `RefreshInProgress`
    pub fn try_lock(self: &Arc<Self>, table: &str) -> Result<TableLock> {
        if !self.held.lock().insert(table.to_string()) {
            return Err(AnalyticsError::RefreshInProgress {
                table: table.to_string(),
            });
        }
        tracing::debug!("Locked table '{}'", table);
        Ok(TableLock {
            registry: Arc::clone(self),
            table: table.to_string(),
        })
    }

    pub fn is_locked(&self, table: &str) -> bool {
        self.held.lock().contains(table)
    }
}

/// Held while a table is refreshed; released on drop
#[derive(Debug)]
pub struct TableLock {
    registry: Arc<TableLockRegistry>,
    table: String,
}

impl TableLock {
    pub fn table(&self) -> &str {
        &self.table
    }
}

impl Drop for TableLock {
    fn drop(&mut self) {
        self.registry.held.lock().remove(&self.table);
        tracing::debug!("Released table '{}'", self.table);
    }
}

/// Store-wide lock on a table, held by an open transaction.
///
/// The lock ends with the transaction, so a crashed process never leaves a
/// table locked. The transaction keeps one connection busy until
/// [`StoreLock::release`].
pub struct StoreLock {
    tx: Box<dyn Transaction>,
    table: String,
}

impl StoreLock {
    /// Take the store lock for `table`, or fail with `RefreshInProgress`
    pub async fn acquire(
        connection: &dyn Connection,
        dialect: &dyn SqlDialect,
        table: &str,
    ) -> Result<Self> {
        let tx = connection.begin().await?;
        let rows = match tx
            .query(&dialect.try_transaction_lock_sql(), &[Value::from(table)])
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                let _ = tx.rollback().await;
                return Err(e.into());
            }
        };

        let locked = rows
            .first()
            .and_then(|r| r.get(0))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !locked {
            let _ = tx.rollback().await;
            return Err(AnalyticsError::RefreshInProgress {
                table: table.to_string(),
            });
        }

        tracing::debug!("Took store lock on '{}'", table);
        Ok(Self {
            tx,
            table: table.to_string(),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// End the holding transaction
    pub async fn release(self) {
        match self.tx.rollback().await {
            Ok(()) => tracing::debug!("Released store lock on '{}'", self.table),
            Err(e) => tracing::warn!("Failed to release store lock on '{}': {}", self.table, e),
        }
    }
}
