//! Probe configuration.
//!
//! The probe reads `keystone.yaml` (or the file named by `KEYSTONE_CONFIG`)
//! with three sections: `database` (a [`PoolConfig`]), `logging` and
//! `probe`. A missing file means all defaults. Database settings are then
//! overridden from the environment (`DATABASE_URL`, `KEYSTONE_DB_*`).

use std::path::Path;

use keystone_db::PoolConfig;
use serde::Deserialize;

use crate::error::ProbeError;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "keystone.yaml";

/// Complete probe configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProbeConfig {
    /// Connection pool settings.
    #[serde(default)]
    pub database: PoolConfig,

    /// Log level and output format.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// What the probe does once connected.
    #[serde(default)]
    pub probe: ProbeSettings,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset (e.g. `info`,
    /// `keystone_db=debug,info`).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Probe behavior after the pool is up.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProbeSettings {
    /// Apply pending migrations before checking health.
    #[serde(default = "default_true")]
    pub migrate: bool,

    /// Keep running periodic health checks until interrupted.
    #[serde(default)]
    pub watch: bool,

    /// Upper bound on each one-shot step, in milliseconds.
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            migrate: true,
            watch: false,
            step_timeout_ms: default_step_timeout_ms(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_owned()
}

const fn default_true() -> bool {
    true
}

const fn default_step_timeout_ms() -> u64 {
    10_000
}

impl ProbeConfig {
    /// Parse configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Yaml`] if the content is not valid YAML.
    pub fn parse(yaml: &str) -> Result<Self, ProbeError> {
        Ok(serde_yml::from_str(yaml)?)
    }

    /// Load from `path` if it exists (defaults otherwise), then apply
    /// environment overrides to the database section.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Io`] / [`ProbeError::Yaml`] for an unreadable
    /// file and [`ProbeError::Db`] for a malformed override.
    pub fn load(path: &Path) -> Result<Self, ProbeError> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path).map_err(|source| ProbeError::Io {
                path: path.display().to_string(),
                source,
            })?;
            Self::parse(&contents)?
        } else {
            Self::default()
        };
        config.database.apply_env_overrides()?;
        Ok(config)
    }

    /// Path named by `KEYSTONE_CONFIG`, or [`DEFAULT_CONFIG_PATH`].
    pub fn path_from_env() -> String {
        std::env::var("KEYSTONE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_owned())
    }
}
