//! Error types for the resource model.

use thiserror::Error;

/// Result type alias for resource model operations.
pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid selector \"{0}\": expected key=value or key!=value")]
    InvalidSelector(String),

    #[error("unknown resource type \"{0}\"")]
    UnknownKind(String),

    #[error("{kind} \"{name}\" has an invalid spec: {reason}")]
    InvalidSpec {
        kind: String,
        name: String,
        reason: String,
    },

    #[error("expected a {expected} resource, got {actual} \"{name}\"")]
    KindMismatch {
        expected: String,
        actual: String,
        name: String,
    },

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}
