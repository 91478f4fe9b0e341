//! The unit-of-work handle shared along one call chain.
//!
//! A [`UnitOfWork`] owns the top-level `PostgreSQL` transaction. Statements
//! issued through it are serialized by an async mutex, so the order in which
//! a call chain issues them is the order in which the server sees them.
//! Nested scopes reuse the same handle and mark their boundaries with
//! savepoints named from a per-transaction counter.
//!
//! Once the owning coordinator call commits or rolls back, the transaction
//! slot is emptied; any handle that outlived it reports
//! [`DbError::TransactionClosed`].
//!
//! A unit can also be discarded: when a rollback cannot finish in time
//! (typically because the server is still executing a statement whose
//! caller gave up), the transaction is dropped without waiting. The pool
//! retires the connection in the background and the server rolls the
//! transaction back when the session ends.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use sqlx::postgres::{PgArguments, PgQueryResult, PgRow};
use sqlx::query::Query;
use sqlx::{Postgres, Transaction};
use tokio::sync::{Mutex, MutexGuard};

use crate::error::DbError;

type TxSlot = Option<Transaction<'static, Postgres>>;

/// Handle to the transaction bound to one call chain.
#[derive(Clone)]
pub struct UnitOfWork {
    inner: Arc<Inner>,
}

struct Inner {
    tx: Mutex<TxSlot>,
    savepoints: AtomicU64,
    discarded: AtomicBool,
}

impl core::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("savepoints_issued", &self.inner.savepoints.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl UnitOfWork {
    pub(crate) fn new(tx: Transaction<'static, Postgres>) -> Self {
        Self {
            inner: Arc::new(Inner {
                tx: Mutex::new(Some(tx)),
                savepoints: AtomicU64::new(0),
                discarded: AtomicBool::new(false),
            }),
        }
    }

    /// Whether the underlying transaction is still open.
    pub async fn is_active(&self) -> bool {
        self.inner.tx.lock().await.is_some()
    }

    /// Reserve the next savepoint name for this transaction.
    ///
    /// Names come from an atomic counter, so rapid or concurrent nested
    /// scopes never collide.
    pub(crate) fn next_savepoint(&self) -> Savepoint {
        let seq = self
            .inner
            .savepoints
            .fetch_add(1, Ordering::Relaxed)
            .saturating_add(1);
        Savepoint::new(seq)
    }

    async fn slot(&self) -> MutexGuard<'_, TxSlot> {
        let mut slot = self.inner.tx.lock().await;
        if self.is_discarded() {
            slot.take();
        }
        slot
    }

    fn is_discarded(&self) -> bool {
        self.inner.discarded.load(Ordering::Acquire)
    }

    /// Abandon the transaction without waiting for the server.
    ///
    /// Later statements, savepoint handling and commit report
    /// [`DbError::TransactionClosed`]; a later rollback succeeds trivially.
    pub(crate) fn discard(&self) {
        self.inner.discarded.store(true, Ordering::Release);
        // If a statement still holds the slot, `slot()` drops the
        // transaction on the next acquisition instead.
        if let Ok(mut slot) = self.inner.tx.try_lock() {
            slot.take();
        }
    }

    /// Run `op` for at most `limit`; on timeout discard the unit.
    ///
    /// # Errors
    ///
    /// Returns the error of `op`, or [`DbError::RollbackTimedOut`] if it did
    /// not finish in time.
    pub(crate) async fn within<F>(&self, limit: Duration, op: F) -> Result<(), DbError>
    where
        F: Future<Output = Result<(), DbError>>,
    {
        if let Ok(result) = tokio::time::timeout(limit, op).await {
            return result;
        }
        self.discard();
        let waited_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
        tracing::warn!(waited_ms, "Rollback timed out, abandoning transaction");
        Err(DbError::RollbackTimedOut { waited_ms })
    }

    /// Execute a statement on the transaction.
    pub(crate) async fn execute(
        &self,
        operation: &'static str,
        query: Query<'_, Postgres, PgArguments>,
    ) -> Result<PgQueryResult, DbError> {
        let mut slot = self.slot().await;
        let tx = slot.as_mut().ok_or(DbError::TransactionClosed)?;
        query
            .execute(&mut **tx)
            .await
            .map_err(|e| DbError::query(operation, e))
    }

    /// Fetch every row of a query on the transaction.
    pub(crate) async fn fetch_all(
        &self,
        operation: &'static str,
        query: Query<'_, Postgres, PgArguments>,
    ) -> Result<Vec<PgRow>, DbError> {
        let mut slot = self.slot().await;
        let tx = slot.as_mut().ok_or(DbError::TransactionClosed)?;
        query
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| DbError::query(operation, e))
    }

    /// Fetch at most one row of a query on the transaction.
    pub(crate) async fn fetch_optional(
        &self,
        operation: &'static str,
        query: Query<'_, Postgres, PgArguments>,
    ) -> Result<Option<PgRow>, DbError> {
        let mut slot = self.slot().await;
        let tx = slot.as_mut().ok_or(DbError::TransactionClosed)?;
        query
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| DbError::query(operation, e))
    }

    /// Run a parameterless control statement (savepoint management).
    async fn control(&self, operation: &'static str, sql: &str) -> Result<(), DbError> {
        let mut slot = self.slot().await;
        let tx = slot.as_mut().ok_or(DbError::TransactionClosed)?;
        sqlx::raw_sql(sql)
            .execute(&mut **tx)
            .await
            .map(|_| ())
            .map_err(|e| DbError::query(operation, e))
    }

    pub(crate) async fn create_savepoint(&self, sp: &Savepoint) -> Result<(), DbError> {
        self.control("savepoint", &sp.create_sql()).await
    }

    pub(crate) async fn release_savepoint(&self, sp: &Savepoint) -> Result<(), DbError> {
        self.control("release savepoint", &sp.release_sql()).await
    }

    /// Undo everything since `sp` and discard the marker.
    pub(crate) async fn rollback_to_savepoint(&self, sp: &Savepoint) -> Result<(), DbError> {
        self.control("rollback to savepoint", &sp.rollback_sql())
            .await?;
        self.control("release savepoint", &sp.release_sql()).await
    }

    /// Commit and close the transaction.
    pub(crate) async fn commit(&self) -> Result<(), DbError> {
        let tx = self.slot().await.take().ok_or(DbError::TransactionClosed)?;
        tx.commit().await.map_err(|e| DbError::query("commit", e))
    }

    /// Roll back and close the transaction.
    ///
    /// A discarded unit counts as already rolled back.
    pub(crate) async fn rollback(&self) -> Result<(), DbError> {
        let Some(tx) = self.slot().await.take() else {
            return if self.is_discarded() {
                Ok(())
            } else {
                Err(DbError::TransactionClosed)
            };
        };
        tx.rollback()
            .await
            .map_err(|e| DbError::query("rollback", e))
    }
}

/// A generated savepoint marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Savepoint {
    name: String,
}

impl Savepoint {
    fn new(seq: u64) -> Self {
        Self {
            name: format!("keystone_sp_{seq}"),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    // Names are generated from a counter, never from caller input, so they
    // are safe to splice into the statement text.
    fn create_sql(&self) -> String {
        format!("SAVEPOINT {}", self.name)
    }

    fn release_sql(&self) -> String {
        format!("RELEASE SAVEPOINT {}", self.name)
    }

    fn rollback_sql(&self) -> String {
        format!("ROLLBACK TO SAVEPOINT {}", self.name)
    }
}
