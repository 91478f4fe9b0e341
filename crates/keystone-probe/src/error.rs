//! Error types for the probe binary.

/// Top-level error for the probe.
///
/// Each variant wraps a specific failure, providing a single error type that
/// `main` can propagate with `?`.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path that was read.
        path: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        #[from]
        source: serde_yml::Error,
    },

    /// The logging section is unusable.
    #[error("logging config error: {message}")]
    Logging {
        /// Description of the problem.
        message: String,
    },

    /// Any data-layer failure (connect, migrate, health check, queries).
    #[error("data layer error: {source}")]
    Db {
        /// The underlying data-layer error.
        #[from]
        source: keystone_db::DbError,
    },
}
