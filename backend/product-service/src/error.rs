/// Error types for Product Service
///
/// Errors raised on the request path are converted to JSON HTTP responses.
/// Worker-side failures use `services::worker::TaskFailure` instead and are
/// never shown to API callers.
use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use serde::Serialize;
use thiserror::Error;

/// Result type for product-service operations
pub type Result<T> = std::result::Result<T, AppError>;

pub mod error_codes {
    pub const DATABASE_ERROR: &str = "DATABASE_ERROR";
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const PRODUCT_NOT_FOUND: &str = "PRODUCT_NOT_FOUND";
    pub const IMAGE_ENQUEUE_FAILED: &str = "IMAGE_ENQUEUE_FAILED";
    pub const CONFIGURATION_ERROR: &str = "CONFIGURATION_ERROR";
    pub const INTERNAL_SERVER_ERROR: &str = "INTERNAL_SERVER_ERROR";
}

/// Application error types
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The product row was committed but one or more of its image tasks
    /// could not be published. The caller can retry through the reprocess
    /// endpoint using `product_id`.
    #[error("Product {product_id} was saved but its images could not be queued: {reason}")]
    EnqueueFailed { product_id: i64, reason: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// JSON body of every error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub status: u16,
    #[serde(rename = "type")]
    pub error_type: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<i64>,
}

impl AppError {
    fn kind(&self) -> (&'static str, &'static str) {
        match self {
            AppError::DatabaseError(_) => ("server_error", error_codes::DATABASE_ERROR),
            AppError::ValidationError(_) => ("validation_error", error_codes::VALIDATION_ERROR),
            AppError::NotFound(_) => ("not_found_error", error_codes::PRODUCT_NOT_FOUND),
            AppError::BadRequest(_) => ("validation_error", error_codes::INVALID_REQUEST),
            AppError::EnqueueFailed { .. } => {
                ("partial_failure", error_codes::IMAGE_ENQUEUE_FAILED)
            }
            AppError::Configuration(_) => ("server_error", error_codes::CONFIGURATION_ERROR),
            AppError::Internal(_) => ("server_error", error_codes::INTERNAL_SERVER_ERROR),
        }
    }

    /// Machine-readable code carried in the response body
    pub fn code(&self) -> &'static str {
        self.kind().1
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::DatabaseError(_) | AppError::Internal(_) | AppError::Configuration(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::ValidationError(_) | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::EnqueueFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let (error_type, code) = self.kind();

        let product_id = match self {
            AppError::EnqueueFailed { product_id, .. } => Some(*product_id),
            _ => None,
        };

        let response = ErrorResponse {
            error: status
                .canonical_reason()
                .unwrap_or("Error")
                .to_string(),
            message: self.to_string(),
            status: status.as_u16(),
            error_type: error_type.to_string(),
            code: code.to_string(),
            product_id,
        };

        HttpResponse::build(status).json(response)
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::DatabaseError(err.to_string())
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::ValidationError(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}
