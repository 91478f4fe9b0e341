//! Statement dispatch between the pool and the active unit of work.
//!
//! Repositories never choose an executor themselves. They hand the query to
//! one of these helpers together with the caller's [`Context`]: if the
//! context carries a unit of work the statement joins that transaction,
//! otherwise it runs on a pooled connection in autocommit mode. Either way
//! the caller's cancellation and deadline apply.

use sqlx::Postgres;
use sqlx::postgres::{PgArguments, PgQueryResult, PgRow};
use sqlx::query::Query;

use crate::context::Context;
use crate::error::DbError;
use crate::pool::Database;

impl Database {
    /// Execute a statement, returning the driver's result summary.
    ///
    /// Joins the unit of work carried by `cx`, if any, so ad-hoc statements
    /// commit or roll back together with the repositories' writes.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Database`] (or [`DbError::Conflict`] for a unique
    /// violation) if the statement fails, and [`DbError::Cancelled`] /
    /// [`DbError::DeadlineExceeded`] if `cx` fires first.
    pub async fn execute(
        &self,
        cx: &Context,
        operation: &'static str,
        query: Query<'_, Postgres, PgArguments>,
    ) -> Result<PgQueryResult, DbError> {
        cx.guard(async {
            match cx.unit() {
                Some(unit) => unit.execute(operation, query).await,
                None => query
                    .execute(self.pool())
                    .await
                    .map_err(|e| DbError::query(operation, e)),
            }
        })
        .await
    }

    /// Fetch all rows.
    pub(crate) async fn fetch_all(
        &self,
        cx: &Context,
        operation: &'static str,
        query: Query<'_, Postgres, PgArguments>,
    ) -> Result<Vec<PgRow>, DbError> {
        cx.guard(async {
            match cx.unit() {
                Some(unit) => unit.fetch_all(operation, query).await,
                None => query
                    .fetch_all(self.pool())
                    .await
                    .map_err(|e| DbError::query(operation, e)),
            }
        })
        .await
    }

    /// Fetch zero or one row.
    pub(crate) async fn fetch_optional(
        &self,
        cx: &Context,
        operation: &'static str,
        query: Query<'_, Postgres, PgArguments>,
    ) -> Result<Option<PgRow>, DbError> {
        cx.guard(async {
            match cx.unit() {
                Some(unit) => unit.fetch_optional(operation, query).await,
                None => query
                    .fetch_optional(self.pool())
                    .await
                    .map_err(|e| DbError::query(operation, e)),
            }
        })
        .await
    }

    /// Fetch exactly one row; zero rows is a database error.
    pub(crate) async fn fetch_one(
        &self,
        cx: &Context,
        operation: &'static str,
        query: Query<'_, Postgres, PgArguments>,
    ) -> Result<PgRow, DbError> {
        self.fetch_optional(cx, operation, query)
            .await?
            .ok_or_else(|| DbError::query(operation, sqlx::Error::RowNotFound))
    }
}
