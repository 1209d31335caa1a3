//! Error types for the ShapeNav environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Clone, Error)]
pub enum EnvError {
    /// Transport to the planner failed (connection refused, reset, etc.)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Planner answered but refused the request
    #[error("Planner rejected request: {0}")]
    PlannerRejected(String),

    /// Response body could not be decoded
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Context operation failed
    #[error("Context error: {0}")]
    ContextError(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a network error.
    pub fn network(msg: impl Into<String>) -> Self {
        Self::NetworkError(msg.into())
    }

    /// Creates a rejection error.
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::PlannerRejected(msg.into())
    }

    /// Returns true when retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NetworkError(_) | Self::Timeout(_))
    }
}
