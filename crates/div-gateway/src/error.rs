//! Error types for the gateway.

use thiserror::Error;

use div_core::CoreError;
use div_state::StateError;

/// Result type alias for controller operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no project named \"{0}\" found")]
    NoProject(String),

    /// Stored state the gateway cannot safely act on: a resource missing a
    /// required field, an unknown install phase, a broken watch. The loop
    /// stops rather than continue on corrupt state.
    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl GatewayError {
    /// A stored resource that does not decode is corrupt, not a caller error.
    pub(crate) fn corrupt(err: CoreError) -> Self {
        GatewayError::Invariant(err.to_string())
    }
}

/// Errors from running a job.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to start \"{shell}\": {source}")]
    Spawn {
        shell: String,
        #[source]
        source: std::io::Error,
    },

    #[error("job exited with {}", exit_status(.code))]
    Failed { code: Option<i32> },

    #[error("job output error: {0}")]
    Io(#[from] std::io::Error),
}

fn exit_status(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "no status (killed by signal)".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_failures_become_invariants() {
        let err = GatewayError::corrupt(CoreError::InvalidSpec {
            kind: "deployment".into(),
            name: "app1".into(),
            reason: "missing field `project`".into(),
        });
        assert!(matches!(err, GatewayError::Invariant(_)));
        assert!(err.to_string().contains("missing field `project`"));
    }

    #[test]
    fn exit_codes_are_reported() {
        assert_eq!(
            ExecError::Failed { code: Some(2) }.to_string(),
            "job exited with status 2"
        );
        assert!(ExecError::Failed { code: None }.to_string().contains("signal"));
    }
}
