//! Error types for the fleetplane orchestrator

use fleet_api::ApiError;
use thiserror::Error;

use crate::backends::BackendError;
use crate::store::StoreError;

/// Main error type for the orchestrator
///
/// There is no "not ready yet" variant: waiting is expressed through
/// condition state and a requeue, never through an error value.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Configuration invalid: {0}")]
    ConfigurationInvalid(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Write conflict: {0}")]
    Conflict(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// What the controller does after a failed pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Retry right away from scratch
    Immediate,
    /// Retry with exponential backoff
    Backoff,
    /// Only an external change can fix this
    AwaitChange,
}

impl OrchestratorError {
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            OrchestratorError::Conflict(_) => RetryPolicy::Immediate,
            OrchestratorError::ConfigurationInvalid(_) | OrchestratorError::ExecutionFailed(_) => {
                RetryPolicy::AwaitChange
            }
            _ => RetryPolicy::Backoff,
        }
    }
}

impl From<StoreError> for OrchestratorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { .. } => OrchestratorError::Conflict(err.to_string()),
            StoreError::NotFound { .. } => OrchestratorError::NotFound(err.to_string()),
            StoreError::Serialization(e) => OrchestratorError::Serialization(e),
            StoreError::Unavailable(msg) => OrchestratorError::BackendUnavailable(msg),
            StoreError::AlreadyExists { .. } | StoreError::Invalid(_) => {
                OrchestratorError::Store(err.to_string())
            }
        }
    }
}

impl From<BackendError> for OrchestratorError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Unavailable(msg) => OrchestratorError::BackendUnavailable(msg),
            BackendError::Rejected(msg) => OrchestratorError::ConfigurationInvalid(msg),
            BackendError::AlreadyExists(msg) => OrchestratorError::Internal(format!(
                "unexpected duplicate reported by backend: {msg}"
            )),
        }
    }
}

impl From<ApiError> for OrchestratorError {
    fn from(err: ApiError) -> Self {
        OrchestratorError::ConfigurationInvalid(err.to_string())
    }
}

impl From<anyhow::Error> for OrchestratorError {
    fn from(err: anyhow::Error) -> Self {
        OrchestratorError::Internal(err.to_string())
    }
}
