//! Error types for the Quiver control plane

use thiserror::Error;

/// Result type alias for control-plane operations
pub type Result<T> = std::result::Result<T, ControlError>;

/// Error kinds surfaced by the control plane.
///
/// Request-path errors propagate to the caller without retry; background
/// loops log them and continue on the next tick.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Invalid input: {field}, reason: {reason}")]
    InvalidInput { field: String, reason: String },

    #[error("Conflict: {resource} '{id}' already exists")]
    Conflict { resource: String, id: String },

    #[error("Not found: {resource} '{id}'")]
    NotFound { resource: String, id: String },

    #[error("No available nodes")]
    NoAvailableNodes,

    #[error("Capacity exceeded: {resource}, limit: {limit}")]
    CapacityExceeded { resource: String, limit: u64 },

    #[error("Timeout: {operation} after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Backend failure on node {node_id}: {reason}")]
    BackendFailure { node_id: String, reason: String },

    #[error("Insufficient samples for {test}")]
    InsufficientSamples { test: String },

    #[error("Internal error: {reason}")]
    Internal { reason: String },
}

impl ControlError {
    /// Shorthand for an `InvalidInput` error.
    pub fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ControlError::InvalidInput {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<anyhow::Error> for ControlError {
    fn from(err: anyhow::Error) -> Self {
        ControlError::Internal {
            reason: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for ControlError {
    fn from(err: serde_json::Error) -> Self {
        ControlError::Internal {
            reason: err.to_string(),
        }
    }
}
