//! Transaction coordinator with transparent nesting.
//!
//! [`Database::run_in_transaction`] guarantees exactly one of commit or
//! rollback per unit of work. The closure receives a derived [`Context`]
//! carrying the unit of work; passing that context back into
//! `run_in_transaction` (directly, or through any repository method that
//! needs several statements) nests instead of opening a second transaction:
//!
//! ```text
//! run_in_transaction(cx)            BEGIN
//!   f(child)
//!     run_in_transaction(child)     SAVEPOINT keystone_sp_1
//!       g(grandchild) -> Err        ROLLBACK TO SAVEPOINT keystone_sp_1
//!                                   RELEASE SAVEPOINT keystone_sp_1
//!   f returns Ok                    COMMIT
//! ```
//!
//! A failing nested scope only unwinds to its own savepoint. Only the
//! outermost commit makes anything durable. Panics roll back and are then
//! resumed unchanged; they are never turned into error values.
//!
//! When the caller's token or deadline fires mid-statement the server may
//! still be executing the abandoned statement, and the connection cannot
//! accept the rollback until it finishes. Rollbacks after a cancellation are
//! therefore bounded by [`CANCELLED_ROLLBACK_TIMEOUT`]; past that the unit is
//! discarded and the timeout is attached to the cancellation error.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt as _;

use crate::context::Context;
use crate::error::DbError;
use crate::pool::Database;
use crate::unit_of_work::{Savepoint, UnitOfWork};

/// How long a rollback may take once the caller has cancelled.
pub const CANCELLED_ROLLBACK_TIMEOUT: Duration = Duration::from_millis(250);

impl Database {
    /// Run `f` inside a unit of work.
    ///
    /// If `cx` already carries a unit of work, `f` runs inside a savepoint
    /// of that transaction. Otherwise a new top-level transaction is opened,
    /// committed when `f` succeeds and rolled back when it fails or panics.
    ///
    /// # Errors
    ///
    /// Returns the error produced by `f` (with any rollback failure
    /// attached), a [`DbError::Database`] if begin/commit/savepoint handling
    /// fails, or [`DbError::Cancelled`] / [`DbError::DeadlineExceeded`] if
    /// `cx` fires. In every error case the unit's writes are undone.
    pub async fn run_in_transaction<T, F, Fut>(&self, cx: &Context, f: F) -> Result<T, DbError>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T, DbError>>,
    {
        match cx.unit() {
            Some(unit) => run_nested(cx, unit.clone(), f).await,
            None => self.run_top_level(cx, f).await,
        }
    }

    async fn run_top_level<T, F, Fut>(&self, cx: &Context, f: F) -> Result<T, DbError>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T, DbError>>,
    {
        let tx = cx
            .guard(async {
                self.pool()
                    .begin()
                    .await
                    .map_err(|e| DbError::query("begin", e))
            })
            .await?;
        let unit = UnitOfWork::new(tx);
        let child = cx.derive(unit.clone());
        tracing::debug!("Transaction started");

        let outcome = AssertUnwindSafe(async move { f(child).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(value)) => {
                if let Err(err) = cx.check() {
                    return Err(abort(&unit, err).await);
                }
                unit.commit().await?;
                tracing::debug!("Transaction committed");
                Ok(value)
            }
            Ok(Err(err)) => Err(abort(&unit, err).await),
            Err(panic) => {
                if let Err(e) = unit.rollback().await {
                    tracing::error!(error = %e, "Rollback after panic failed");
                } else {
                    tracing::warn!("Transaction rolled back after panic");
                }
                std::panic::resume_unwind(panic)
            }
        }
    }
}

async fn run_nested<T, F, Fut>(cx: &Context, unit: UnitOfWork, f: F) -> Result<T, DbError>
where
    F: FnOnce(Context) -> Fut,
    Fut: Future<Output = Result<T, DbError>>,
{
    let savepoint = unit.next_savepoint();
    cx.guard(unit.create_savepoint(&savepoint)).await?;
    let child = cx.derive(unit.clone());
    tracing::debug!(savepoint = savepoint.name(), "Savepoint created");

    let outcome = AssertUnwindSafe(async move { f(child).await })
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(value)) => {
            if let Err(err) = cx.check() {
                return Err(unwind_savepoint(&unit, &savepoint, err).await);
            }
            unit.release_savepoint(&savepoint).await?;
            tracing::debug!(savepoint = savepoint.name(), "Savepoint released");
            Ok(value)
        }
        Ok(Err(err)) => Err(unwind_savepoint(&unit, &savepoint, err).await),
        Err(panic) => {
            if let Err(e) = unit.rollback_to_savepoint(&savepoint).await {
                tracing::error!(
                    savepoint = savepoint.name(),
                    error = %e,
                    "Rollback to savepoint after panic failed"
                );
            }
            std::panic::resume_unwind(panic)
        }
    }
}

/// Roll back to `savepoint`, attaching any rollback failure to `err`.
async fn unwind_savepoint(unit: &UnitOfWork, savepoint: &Savepoint, err: DbError) -> DbError {
    let undo = unit.rollback_to_savepoint(savepoint);
    let result = if err.is_cancelled() {
        unit.within(CANCELLED_ROLLBACK_TIMEOUT, undo).await
    } else {
        undo.await
    };
    match result {
        Ok(()) => {
            tracing::debug!(
                savepoint = savepoint.name(),
                error = %err,
                "Rolled back to savepoint"
            );
            err
        }
        Err(rb) => {
            tracing::warn!(
                savepoint = savepoint.name(),
                error = %err,
                rollback_error = %rb,
                "Rollback to savepoint failed"
            );
            err.with_rollback_failure(rb)
        }
    }
}

/// Roll back the whole unit, attaching any rollback failure to `err`.
async fn abort(unit: &UnitOfWork, err: DbError) -> DbError {
    let result = if err.is_cancelled() {
        unit.within(CANCELLED_ROLLBACK_TIMEOUT, unit.rollback()).await
    } else {
        unit.rollback().await
    };
    match result {
        Ok(()) => {
            tracing::debug!(error = %err, "Transaction rolled back");
            err
        }
        Err(rb) => {
            tracing::warn!(error = %err, rollback_error = %rb, "Rollback failed");
            err.with_rollback_failure(rb)
        }
    }
}
