//! `PostgreSQL` pool establishment and supervision.
//!
//! The pool is process-wide state: it is built once at startup by
//! [`Database::connect`], handed to every repository constructor, and torn
//! down once by [`Database::close`]. Nothing reconfigures it in between.
//!
//! Establishment retries with exponential backoff (see [`crate::retry`]).
//! Each attempt opens the pool and issues a liveness probe; an attempt whose
//! probe fails closes what it opened before backing off.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::context::Context;
use crate::error::DbError;
use crate::retry::{Backoff, RetryError};

/// Build driver pool options from `config`, resolving unset bounds to their
/// defaults.
///
/// Connections are tested before being handed out, which together with the
/// lifetime and idle bounds keeps dead sockets from reaching callers.
pub fn pool_options(config: &PoolConfig) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(config.max_connections())
        .min_connections(config.min_connections())
        .max_lifetime(config.max_lifetime())
        .idle_timeout(config.max_idle_time())
        .acquire_timeout(config.acquire_timeout())
        .test_before_acquire(true)
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Connections currently open (idle or in use).
    pub size: u32,
    /// Connections open and idle.
    pub idle: usize,
    /// Configured upper bound.
    pub max: u32,
}

/// Connection pool handle to `PostgreSQL`.
///
/// Cheap to clone; all clones share the same physical connections.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl core::fmt::Debug for Database {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Database")
            .field("status", &self.status())
            .field("closed", &self.pool.is_closed())
            .finish()
    }
}

impl Database {
    /// Connect to `PostgreSQL`, retrying with backoff.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Config`] if the configuration is incoherent and
    /// [`DbError::Connect`] once every attempt has failed.
    pub async fn connect(config: &PoolConfig) -> Result<Self, DbError> {
        Self::connect_with(&Context::background(), config).await
    }

    /// Connect to `PostgreSQL`, retrying with backoff until the budget is
    /// spent or `cx` is cancelled.
    ///
    /// # Errors
    ///
    /// As [`Database::connect`], plus [`DbError::Cancelled`] /
    /// [`DbError::DeadlineExceeded`] when `cx` fires during establishment.
    pub async fn connect_with(cx: &Context, config: &PoolConfig) -> Result<Self, DbError> {
        config.validate()?;
        let options = pool_options(config);
        let connect_options = config.connect_options()?;
        let backoff = Backoff::new(config.retry_count(), config.retry_delay());

        tracing::info!(
            max_connections = config.max_connections(),
            min_connections = config.min_connections(),
            max_attempts = backoff.attempts(),
            "Connecting to PostgreSQL"
        );

        let established = cx
            .guard(async {
                backoff
                    .retry(cx.cancellation_token(), |attempt| {
                        let options = options.clone();
                        let connect_options = connect_options.clone();
                        async move {
                            tracing::debug!(attempt, "Opening PostgreSQL pool");
                            let pool = options.connect_with(connect_options).await?;
                            if let Err(e) = probe(&pool).await {
                                pool.close().await;
                                return Err(e);
                            }
                            Ok(pool)
                        }
                    })
                    .await
                    .map_err(|e| match e {
                        RetryError::Exhausted { attempts, last } => DbError::Connect {
                            attempts,
                            source: last,
                        },
                        RetryError::Cancelled => DbError::Cancelled,
                    })
            })
            .await?;

        tracing::info!(
            max_connections = config.max_connections(),
            "Connected to PostgreSQL"
        );

        Ok(Self { pool: established })
    }

    /// Wrap an already-open pool. Intended for tests and embedding.
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Issue a trivial round-trip query and verify its answer.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::HealthCheck`] if the pool is closed, the query
    /// fails, or it returns something other than `1`.
    pub async fn health_check(&self, cx: &Context) -> Result<(), DbError> {
        if self.pool.is_closed() {
            return Err(DbError::HealthCheck {
                reason: String::from("pool is closed"),
                source: None,
            });
        }
        let value: i32 = cx
            .guard(async {
                sqlx::query_scalar::<_, i32>("SELECT 1")
                    .fetch_one(&self.pool)
                    .await
                    .map_err(|e| DbError::HealthCheck {
                        reason: format!("probe query failed: {e}"),
                        source: Some(e),
                    })
            })
            .await?;
        if value != 1 {
            return Err(DbError::HealthCheck {
                reason: format!("probe returned {value}, expected 1"),
                source: None,
            });
        }
        Ok(())
    }

    /// Run periodic health checks until `shutdown` fires.
    ///
    /// Failures are logged at `warn`; the first success after a failure is
    /// logged at `info`. The monitor never closes or rebuilds the pool.
    pub fn spawn_health_monitor(
        &self,
        period: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let db = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; startup already probed.
            ticker.tick().await;
            let mut healthy = true;
            loop {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let cx = Context::with_cancellation(shutdown.clone()).with_timeout(period);
                match db.health_check(&cx).await {
                    Ok(()) if !healthy => {
                        healthy = true;
                        tracing::info!("PostgreSQL health restored");
                    }
                    Ok(()) => {}
                    Err(DbError::Cancelled) => break,
                    Err(e) => {
                        healthy = false;
                        tracing::warn!(error = %e, status = ?db.status(), "PostgreSQL health check failed");
                    }
                }
            }
            tracing::debug!("Health monitor stopped");
        })
    }

    /// Run all pending migrations from the `migrations/` directory.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Migration`] if any migration fails.
    pub async fn run_migrations(&self) -> Result<(), DbError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        tracing::info!("Database migrations completed");
        Ok(())
    }

    /// Current pool occupancy.
    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            size: self.pool.size(),
            idle: self.pool.num_idle(),
            max: self.pool.options().get_max_connections(),
        }
    }

    /// Whether [`Database::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Return a reference to the underlying [`PgPool`].
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Close all connections in the pool gracefully.
    ///
    /// Idempotent: closing an already closed pool only logs.
    pub async fn close(&self) {
        if self.pool.is_closed() {
            tracing::debug!("PostgreSQL pool already closed");
            return;
        }
        self.pool.close().await;
        tracing::info!("PostgreSQL pool closed");
    }
}

/// Liveness probe issued after each establishment attempt.
async fn probe(pool: &PgPool) -> Result<(), sqlx::Error> {
    let value: i32 = sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(pool).await?;
    if value == 1 {
        Ok(())
    } else {
        Err(sqlx::Error::Protocol(format!(
            "liveness probe returned {value}, expected 1"
        )))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn options_apply_resolved_bounds() {
        let config = PoolConfig {
            max_connections: Some(7),
            min_connections: Some(2),
            max_idle_secs: Some(30),
            ..PoolConfig::default()
        };
        let options = pool_options(&config);
        assert_eq!(options.get_max_connections(), 7);
        assert_eq!(options.get_min_connections(), 2);
        assert_eq!(options.get_idle_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(
            options.get_max_lifetime(),
            Some(Duration::from_secs(1800))
        );
    }

    #[test]
    fn options_fall_back_to_defaults() {
        let options = pool_options(&PoolConfig::default());
        assert_eq!(options.get_max_connections(), 10);
        assert_eq!(options.get_min_connections(), 1);
        assert_eq!(options.get_acquire_timeout(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn invalid_bounds_fail_before_connecting() {
        let config = PoolConfig {
            max_connections: Some(1),
            min_connections: Some(4),
            ..PoolConfig::default()
        };
        let err = Database::connect(&config).await.unwrap_err();
        assert!(matches!(err, DbError::Config(_)));
    }

    #[tokio::test]
    async fn unreachable_store_fails_after_configured_attempts() {
        let config = PoolConfig {
            host: String::from("127.0.0.1"),
            port: 1,
            ssl_mode: crate::config::SslMode::Disable,
            retry_count: Some(2),
            retry_delay_ms: Some(10),
            acquire_timeout_ms: Some(500),
            min_connections: Some(0),
            ..PoolConfig::default()
        };
        match Database::connect(&config).await {
            Err(DbError::Connect { attempts, .. }) => assert_eq!(attempts, 2),
            Err(other) => panic!("expected connect error, got {other}"),
            Ok(_) => panic!("connected to a closed port"),
        }
    }

    #[tokio::test]
    async fn cancelled_context_aborts_establishment() {
        let token = CancellationToken::new();
        token.cancel();
        let cx = Context::with_cancellation(token);
        let config = PoolConfig {
            host: String::from("127.0.0.1"),
            port: 1,
            ..PoolConfig::default()
        };
        let err = Database::connect_with(&cx, &config).await.unwrap_err();
        assert!(matches!(err, DbError::Cancelled));
    }
}
