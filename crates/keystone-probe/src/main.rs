//! Connectivity probe for the Keystone data layer.
//!
//! Loads `keystone.yaml`, establishes the pool with retry, optionally applies
//! migrations, runs a health check and reports pool occupancy and aggregate
//! counts. With `probe.watch: true` it then keeps a background health
//! monitor running until interrupted.
//!
//! # Flow
//!
//! ```text
//! config --> connect (backoff) --> migrate --> health check --> report
//!                                                                  |
//!                                     watch? --> health monitor until Ctrl-C
//! ```
//!
//! Exit status is non-zero if any one-shot step fails.

mod config;
mod error;

use std::path::Path;
use std::time::Duration;

use keystone_db::{
    Context, ContractCriteria, ContractRepository, Database, HolderCriteria, HolderRepository,
};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig, ProbeConfig};
use crate::error::ProbeError;

/// Application entry point.
///
/// # Errors
///
/// Returns an error if configuration, connection, migration or the health
/// check fails.
#[tokio::main]
async fn main() -> Result<(), ProbeError> {
    // 1. Load configuration (logging settings come from it).
    let config_path = ProbeConfig::path_from_env();
    let config = ProbeConfig::load(Path::new(&config_path))?;

    // 2. Initialize structured logging.
    init_tracing(&config.logging)?;
    info!(config_path = %config_path, database = ?config.database, "keystone-probe starting");

    // 3. Wire Ctrl-C to a shared cancellation token.
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
        }
        signal.cancel();
    });

    let step_timeout = Duration::from_millis(config.probe.step_timeout_ms);
    let step = || Context::with_cancellation(shutdown.clone()).with_timeout(step_timeout);

    // 4. Connect with backoff. Not bounded by the step timeout: the retry
    //    budget is.
    let db = Database::connect_with(
        &Context::with_cancellation(shutdown.clone()),
        &config.database,
    )
    .await?;

    let outcome = run(&db, &config, &step).await;

    // 5. Watch until interrupted.
    if outcome.is_ok() && config.probe.watch {
        let period = config.database.health_check_period();
        info!(period_secs = period.as_secs(), "Watching pool health (Ctrl-C to stop)");
        let monitor = db.spawn_health_monitor(period, shutdown.clone());
        if let Err(e) = monitor.await {
            tracing::error!(error = %e, "Health monitor task failed");
        }
    }

    db.close().await;
    outcome
}

/// One-shot steps after the pool is up.
async fn run<F>(db: &Database, config: &ProbeConfig, step: &F) -> Result<(), ProbeError>
where
    F: Fn() -> Context,
{
    if config.probe.migrate {
        db.run_migrations().await?;
    }

    db.health_check(&step()).await?;
    let status = db.status();
    info!(
        size = status.size,
        idle = status.idle,
        max = status.max,
        "PostgreSQL healthy"
    );

    let contracts = ContractRepository::new(db.clone())
        .count(&step(), &ContractCriteria::default())
        .await?;
    let holders = HolderRepository::new(db.clone())
        .count(&step(), &HolderCriteria::default())
        .await?;
    info!(contracts, holders, "Aggregate counts");
    Ok(())
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
fn init_tracing(logging: &LoggingConfig) -> Result<(), ProbeError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&logging.level).map_err(|e| ProbeError::Logging {
            message: format!("invalid level {:?}: {e}", logging.level),
        })?,
    };
    match logging.format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init(),
    }
    Ok(())
}
