//! Error types for the task queue library

use thiserror::Error;

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors that can occur while talking to the queue backend
#[derive(Error, Debug)]
pub enum QueueError {
    /// Broker unreachable (connection refused, dropped, timed out)
    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    /// Message could not be encoded for the queue
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Any other backend failure
    #[error("Redis error: {0}")]
    Redis(redis::RedisError),
}

impl QueueError {
    /// Whether the broker itself could not be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, QueueError::Unavailable(_))
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
        {
            QueueError::Unavailable(err.to_string())
        } else {
            QueueError::Redis(err)
        }
    }
}
