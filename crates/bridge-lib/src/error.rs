//! Error types shared across the bridge

use crate::models::Identifier;
use std::time::Duration;

/// Failures talking to the orchestration platform
#[derive(Debug, thiserror::Error)]
pub enum WorkloadError {
    #[error("workload {0} not found")]
    NotFound(String),

    #[error("{0}")]
    Api(String),

    #[error("workload call timed out after {0:?}")]
    Timeout(Duration),

    #[error("cannot translate workload {name}: {reason}")]
    Conversion { name: String, reason: String },
}

impl From<kube::Error> for WorkloadError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(response) if response.code == 404 => {
                WorkloadError::NotFound(response.message.clone())
            }
            _ => WorkloadError::Api(err.to_string()),
        }
    }
}

/// Failures of the translation engine
#[derive(Debug, thiserror::Error)]
pub enum BifrostError {
    #[error("invalid desire request: {0}")]
    InvalidRequest(String),

    #[error("app {0} not found")]
    NotFound(Identifier),

    #[error("instance index {index} out of range for app {identifier} with {instances} instances")]
    IndexOutOfRange {
        identifier: Identifier,
        index: u32,
        instances: u32,
    },

    #[error(transparent)]
    Workload(#[from] WorkloadError),
}

/// Failures delivering crash reports or route messages
#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("endpoint {endpoint} answered with status {status}")]
    Status { endpoint: String, status: u16 },

    #[error("invalid endpoint: {0}")]
    Endpoint(#[from] url::ParseError),
}
