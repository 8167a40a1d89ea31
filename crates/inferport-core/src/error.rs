use std::time::Duration;

use thiserror::Error;

/// Failure of a single task. A task either yields a full `ResultEnvelope`
/// or exactly one of these.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("offload request {request_id} timed out after {elapsed:?}")]
    Timeout {
        request_id: String,
        elapsed: Duration,
    },

    #[error("broker connectivity: {0}")]
    Connectivity(String),

    #[error("offload request {request_id} cancelled")]
    Cancelled { request_id: String },

    #[error("remote worker rejected request {request_id}: {error}")]
    Remote { request_id: String, error: String },

    #[error("local execution failed: {0}")]
    LocalExecution(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl ExecError {
    pub fn local(err: anyhow::Error) -> Self {
        Self::LocalExecution(format!("{err:#}"))
    }

    pub fn connectivity(err: anyhow::Error) -> Self {
        Self::Connectivity(format!("{err:#}"))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Timeout { request_id, .. }
            | Self::Cancelled { request_id }
            | Self::Remote { request_id, .. } => Some(request_id),
            _ => None,
        }
    }
}
