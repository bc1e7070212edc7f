//! Error types for RelayQ
//!
//! Defines all error types used throughout the application.

use thiserror::Error;

/// Main error type for RelayQ operations
#[derive(Error, Debug)]
pub enum Error {
    /// Transport-level failure; dispatch pauses until the connection
    /// manager reconnects
    #[error("Connection error: {0}")]
    Connection(String),

    /// Invalid subscription or worker configuration, fatal at startup
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Queue not found
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// Ack/nack referenced a delivery the broker does not hold
    #[error("Unknown delivery tag {tag} for queue {queue}")]
    UnknownDeliveryTag { queue: String, tag: u64 },

    /// A delivery already has a terminal outcome recorded
    #[error("Delivery tag {0} already settled")]
    AlreadySettled(u64),

    /// Handler (business logic) failure, recovered via nack/retry
    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    /// Handler exceeded the configured processing timeout
    #[error("Handler timed out after {timeout_ms}ms on queue {queue}")]
    HandlerTimeout { queue: String, timeout_ms: u64 },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Consumer is shutting down
    #[error("Consumer is shutting down")]
    Shutdown,
}

/// Failure returned by a message handler.
///
/// Handlers are external collaborators; all the dispatcher needs is a
/// displayable reason to log before nacking.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Result type alias for RelayQ operations
pub type Result<T> = std::result::Result<T, Error>;
