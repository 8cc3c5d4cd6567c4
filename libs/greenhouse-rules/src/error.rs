//! Rule Engine Error Types

use thiserror::Error;

/// Result type for rule operations
pub type Result<T> = std::result::Result<T, RuleError>;

/// Rule engine errors
#[derive(Debug, Error)]
pub enum RuleError {
    /// Rule not found
    #[error("Rule not found: {0}")]
    NotFound(String),

    /// Rule definition violates a configuration invariant
    #[error("Invalid rule definition: {0}")]
    InvalidDefinition(String),

    /// Stored value could not be decoded (unknown operator, action kind, ...)
    #[error("Invalid rule format: {0}")]
    InvalidFormat(String),

    /// Database error
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Command queue rejected or timed out on enqueue
    #[error("Dispatch error: {0}")]
    DispatchError(String),

    /// Sensor value store error
    #[error("Sensor store error: {0}")]
    SensorStoreError(String),

    /// Scheduler error
    #[error("Scheduler error: {0}")]
    SchedulerError(String),
}

impl From<sqlx::Error> for RuleError {
    fn from(err: sqlx::Error) -> Self {
        RuleError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for RuleError {
    fn from(err: serde_json::Error) -> Self {
        RuleError::SerializationError(err.to_string())
    }
}
