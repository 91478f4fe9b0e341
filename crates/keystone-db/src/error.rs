//! Error types for the data layer.
//!
//! All errors are propagated via [`DbError`], which wraps the underlying
//! [`sqlx`] error together with the operation that failed. Callers map the
//! coarse [`ErrorKind`] onto their own responses (for example an HTTP status
//! via [`ErrorKind::http_status`]).
//!
//! Wrapping never discards a cause: the original [`sqlx::Error`] stays
//! reachable through [`std::error::Error::source`], and a failed rollback is
//! attached to the primary error via [`DbError::RollbackFailed`] instead of
//! replacing it.

/// Errors that can occur in the data layer.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// The pool could not be established within the configured attempts.
    #[error("failed to establish PostgreSQL pool after {attempts} attempt(s): {source}")]
    Connect {
        /// How many attempts were made.
        attempts: u32,
        /// The cause of the last failed attempt.
        source: sqlx::Error,
    },

    /// A health check did not complete successfully.
    #[error("health check failed: {reason}")]
    HealthCheck {
        /// What went wrong.
        reason: String,
        /// The underlying driver error, if the probe query itself failed.
        source: Option<sqlx::Error>,
    },

    /// A query or statement failed.
    #[error("PostgreSQL error during {operation}: {source}")]
    Database {
        /// The operation that was being performed.
        operation: &'static str,
        /// The underlying driver error.
        source: sqlx::Error,
    },

    /// A lookup matched zero rows.
    #[error("{entity} {id} not found")]
    NotFound {
        /// Kind of aggregate that was looked up.
        entity: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// A version mismatch or unique-constraint violation.
    #[error("conflict: {message}")]
    Conflict {
        /// Description of the conflict.
        message: String,
        /// The underlying driver error, for constraint violations.
        source: Option<sqlx::Error>,
    },

    /// Input rejected before reaching the store.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The caller's deadline passed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// A unit-of-work handle was used after its transaction ended.
    #[error("unit of work is no longer active")]
    TransactionClosed,

    /// A serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A schema migration failed.
    #[error("PostgreSQL migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A rollback did not finish in time and its connection was abandoned.
    ///
    /// The server undoes the transaction when that session ends.
    #[error("rollback did not complete within {waited_ms} ms; connection abandoned")]
    RollbackTimedOut {
        /// How long the rollback was given.
        waited_ms: u64,
    },

    /// The primary error, with a rollback that also failed attached.
    #[error("{error} (rollback also failed: {rollback})")]
    RollbackFailed {
        /// The error that caused the rollback.
        #[source]
        error: Box<DbError>,
        /// The error raised by the rollback itself.
        rollback: Box<DbError>,
    },
}

/// Coarse classification of a [`DbError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Pool establishment failed.
    Connection,
    /// A health check failed.
    HealthCheck,
    /// The pool is exhausted or closed.
    Unavailable,
    /// A generic query failure.
    Database,
    /// Zero rows matched a lookup.
    NotFound,
    /// Version mismatch or unique violation.
    Conflict,
    /// Malformed input.
    Validation,
    /// Cancelled or timed out by the caller.
    Cancelled,
    /// Anything else (serialization, configuration, misuse).
    Internal,
}

impl ErrorKind {
    /// Conventional HTTP status for this kind.
    pub const fn http_status(self) -> u16 {
        match self {
            Self::Connection | Self::HealthCheck | Self::Unavailable => 503,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::Validation => 400,
            Self::Cancelled => 408,
            Self::Database | Self::Internal => 500,
        }
    }
}

impl DbError {
    /// Wrap a driver error raised by `operation`.
    ///
    /// Unique-constraint violations become [`DbError::Conflict`]; everything
    /// else becomes [`DbError::Database`].
    pub fn query(operation: &'static str, source: sqlx::Error) -> Self {
        let unique = source
            .as_database_error()
            .is_some_and(|e| e.is_unique_violation());
        if unique {
            let constraint = source
                .as_database_error()
                .and_then(|e| e.constraint().map(str::to_owned))
                .unwrap_or_else(|| String::from("unique constraint"));
            return Self::Conflict {
                message: format!("{operation} violates {constraint}"),
                source: Some(source),
            };
        }
        Self::Database { operation, source }
    }

    /// A version-mismatch conflict for `entity` `id` at `expected`.
    pub fn stale(entity: &'static str, id: impl core::fmt::Display, expected: i64) -> Self {
        Self::Conflict {
            message: format!(
                "{entity} {id} was modified concurrently (expected version {expected})"
            ),
            source: None,
        }
    }

    /// Attach a rollback failure to this error.
    #[must_use]
    pub fn with_rollback_failure(self, rollback: Self) -> Self {
        Self::RollbackFailed {
            error: Box::new(self),
            rollback: Box::new(rollback),
        }
    }

    /// The error that started it all, skipping any attached rollback failure.
    pub fn primary(&self) -> &Self {
        match self {
            Self::RollbackFailed { error, .. } => error.primary(),
            other => other,
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self.primary() {
            Self::Connect { .. } => ErrorKind::Connection,
            Self::HealthCheck { .. } => ErrorKind::HealthCheck,
            Self::Database { source, .. } => match source {
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => ErrorKind::Unavailable,
                _ => ErrorKind::Database,
            },
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Cancelled | Self::DeadlineExceeded => ErrorKind::Cancelled,
            Self::TransactionClosed
            | Self::Serialization(_)
            | Self::Migration(_)
            | Self::Config(_)
            | Self::RollbackTimedOut { .. }
            | Self::RollbackFailed { .. } => ErrorKind::Internal,
        }
    }

    /// Whether this error (or its primary cause) is a conflict.
    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    /// Whether this error (or its primary cause) came from the caller's
    /// cancellation token or deadline.
    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }
}

impl From<keystone_types::IdError> for DbError {
    fn from(err: keystone_types::IdError) -> Self {
        Self::Validation(err.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn pool_timeout_is_unavailable() {
        let err = DbError::query("acquire", sqlx::Error::PoolTimedOut);
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert_eq!(err.kind().http_status(), 503);
    }

    #[test]
    fn row_not_found_stays_database_kind() {
        let err = DbError::query("fetch", sqlx::Error::RowNotFound);
        assert_eq!(err.kind(), ErrorKind::Database);
        assert!(err.source().is_some());
    }

    #[test]
    fn stale_version_is_conflict() {
        let err = DbError::stale("contract", "abc", 3);
        assert!(err.is_conflict());
        assert_eq!(err.kind().http_status(), 409);
        assert!(err.to_string().contains("expected version 3"));
    }

    #[test]
    fn rollback_failure_keeps_primary_cause() {
        let primary = DbError::Validation(String::from("bad premium"));
        let err = primary.with_rollback_failure(DbError::query(
            "rollback",
            sqlx::Error::PoolClosed,
        ));
        assert_eq!(err.kind(), ErrorKind::Validation);
        let msg = err.to_string();
        assert!(msg.contains("bad premium"));
        assert!(msg.contains("rollback also failed"));
        let source = err.source().map(ToString::to_string).unwrap_or_default();
        assert!(source.contains("bad premium"));
    }

    #[test]
    fn cancellation_maps_to_timeout_status() {
        assert_eq!(DbError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(DbError::DeadlineExceeded.kind().http_status(), 408);
    }

    #[test]
    fn abandoned_rollback_keeps_cancellation_primary() {
        let err = DbError::DeadlineExceeded
            .with_rollback_failure(DbError::RollbackTimedOut { waited_ms: 500 });
        assert!(err.is_cancelled());
        assert!(err.to_string().contains("within 500 ms"));
        assert!(!DbError::RollbackTimedOut { waited_ms: 500 }.is_cancelled());
    }

    #[test]
    fn malformed_id_is_validation() {
        let id_err = keystone_types::ContractId::parse("nope").unwrap_err();
        let err = DbError::from(id_err);
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
