use thiserror::Error;

/// Errors from conversation store operations (used by trait definitions in recall-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),
}

/// Errors from the durable outbox and dead-letter logs.
#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("outbox io error: {0}")]
    Io(String),

    #[error("outbox serialization error: {0}")]
    Serialization(String),

    #[error("outbox record is unsupported: {0}")]
    Unsupported(String),
}

/// Errors raised while validating configuration at construction time.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid config value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// A precise tokenizer could not count a text; callers fall back to the heuristic.
#[derive(Debug, Error)]
#[error("token counting failed: {0}")]
pub struct TokenCountError(pub String);
