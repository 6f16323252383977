//! Storage error classification.

use thiserror::Error;

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage failures split by whether repeating the call can help.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Network blips, throttling, 5xx responses
    #[error("transient storage error: {0}")]
    Transient(String),

    /// 4xx responses (other than 408/429), malformed requests
    #[error("permanent storage error: {0}")]
    Permanent(String),
}

impl StorageError {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, context: impl std::fmt::Display) -> Self {
        let message = format!("{} (status {})", context, status);
        if is_transient_status(status) {
            StorageError::Transient(message)
        } else {
            StorageError::Permanent(message)
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}

/// 408, 429 and every 5xx are worth retrying.
pub fn is_transient_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}
