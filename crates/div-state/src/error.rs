//! Error types for the div state layer.

use thiserror::Error;

/// Result type alias for state operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur in the backend, the change feed, or the stores.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    /// Raised by a backend that has no table with this name.
    #[error("no table named \"{0}\"")]
    MissingTable(String),

    /// The table for a kind does not exist; applying its definition creates it.
    #[error(
        "no {kind} table: no table named \"{table}\" exists. create it by \"div apply -f your-new-{kind}.crd.toml\""
    )]
    TableNotFound { kind: String, table: String },

    /// The table exists but yielded no rows. `name` is `None` when the
    /// whole kind was queried.
    #[error("{}", not_found_message(.kind, .name.as_deref(), .table))]
    ResourceNotFound {
        kind: String,
        name: Option<String>,
        table: String,
    },

    #[error("throughput limit exceeded: {0}")]
    Throttled(String),

    #[error("shard {shard} of \"{table}\" has been trimmed")]
    ShardTrimmed { table: String, shard: u64 },

    #[error("change feed error: {0}")]
    Feed(String),

    #[error("logs not found: {0}")]
    LogsNotFound(String),

    #[error(transparent)]
    Core(#[from] div_core::CoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StateError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StateError::ResourceNotFound { .. })
    }
}

fn not_found_message(kind: &str, name: Option<&str>, table: &str) -> String {
    match name {
        Some(name) => format!(
            "{kind} \"{name}\" not found: table \"{table}\" exists, but no item named \"{name}\" found"
        ),
        None => format!("no {kind} found: table \"{table}\" exists, but no matching item found"),
    }
}
