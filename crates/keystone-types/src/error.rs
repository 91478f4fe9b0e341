//! Error types for domain value parsing.

/// Errors raised while parsing identifiers and enumerations from text.
#[derive(Debug, thiserror::Error)]
pub enum IdError {
    /// The value is not a well-formed UUID.
    #[error("malformed {kind} id {value:?}: {source}")]
    Malformed {
        /// Which identifier was being parsed.
        kind: &'static str,
        /// The rejected input.
        value: String,
        /// The underlying parse error.
        source: uuid::Error,
    },

    /// The value does not name a known contract status.
    #[error("unknown contract status {0:?}")]
    UnknownStatus(String),
}
