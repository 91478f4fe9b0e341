//! Call-chain context: cancellation, deadline, and the active unit of work.
//!
//! Every data-layer operation takes a [`Context`]. A context created by the
//! caller carries only a cancellation token and an optional deadline. The
//! transaction coordinator derives a child context that additionally carries
//! the [`UnitOfWork`] it opened; repositories that receive such a context run
//! their statements on that transaction instead of on the pool.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::DbError;
use crate::unit_of_work::UnitOfWork;

/// Cancellation, deadline and transaction scope for one call chain.
///
/// A context is deliberately not `Clone`: the unit of work it may carry is
/// owned by exactly one call chain. Concurrent chains each build their own
/// context from a shared [`CancellationToken`] if they need joint
/// cancellation.
#[derive(Debug, Default)]
pub struct Context {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    unit: Option<UnitOfWork>,
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context cancelled when `token` fires.
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            cancel: token,
            deadline: None,
            unit: None,
        }
    }

    /// Impose a deadline `timeout` from now, keeping any earlier deadline.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        let deadline = Instant::now()
            .checked_add(timeout)
            .unwrap_or_else(far_future);
        self.with_deadline(deadline)
    }

    /// Impose an absolute deadline, keeping any earlier deadline.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// The cancellation token observed by this context.
    pub const fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The deadline, if any.
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The unit of work this context runs in, if any.
    pub const fn unit(&self) -> Option<&UnitOfWork> {
        self.unit.as_ref()
    }

    /// Whether a unit of work is active on this call chain.
    pub const fn in_transaction(&self) -> bool {
        self.unit.is_some()
    }

    /// Derive a child context bound to `unit`, sharing cancellation and
    /// deadline with `self`.
    pub(crate) fn derive(&self, unit: UnitOfWork) -> Self {
        Self {
            cancel: self.cancel.clone(),
            deadline: self.deadline,
            unit: Some(unit),
        }
    }

    /// Fail fast if the context is already cancelled or past its deadline.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Cancelled`] or [`DbError::DeadlineExceeded`].
    pub fn check(&self) -> Result<(), DbError> {
        if self.cancel.is_cancelled() {
            return Err(DbError::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(DbError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Drive `fut` to completion unless the context is cancelled or its
    /// deadline passes first, in which case `fut` is dropped.
    ///
    /// # Errors
    ///
    /// Returns the error of `fut`, or [`DbError::Cancelled`] /
    /// [`DbError::DeadlineExceeded`].
    pub async fn guard<T, F>(&self, fut: F) -> Result<T, DbError>
    where
        F: Future<Output = Result<T, DbError>>,
    {
        self.check()?;
        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(DbError::Cancelled),
            () = deadline => Err(DbError::DeadlineExceeded),
            result = fut => result,
        }
    }
}

/// Roughly thirty years out; stands in for "no deadline" on overflow.
fn far_future() -> Instant {
    Instant::now()
        .checked_add(Duration::from_secs(86_400 * 365 * 30))
        .unwrap_or_else(Instant::now)
}
