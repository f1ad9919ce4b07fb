//! Structured API error responses with error codes
//!
//! Every error body has the shape
//! `{"error": {"code", "numeric_code", "message", ...}}` and the code is
//! repeated in the `x-error-code` header.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::infra::SequencerError;

/// Seconds a client should wait before retrying a contended allocation
const CONTENTION_RETRY_AFTER_SECS: u64 = 1;

// ============================================================================
// Error Codes
// ============================================================================

/// Error codes for API responses
///
/// These codes are stable and can be used by clients for programmatic error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (3xxx)
    /// Request body is malformed
    InvalidRequestBody,
    /// Field value is invalid
    InvalidFieldValue,

    // Resource errors (4xxx)
    /// No active sequence definition for the tenant and document type
    DefinitionNotFound,

    // Conflict errors (5xxx)
    /// A definition already exists for the tenant and document type
    AlreadyExists,

    // Sequence errors (7xxx)
    /// The counter cannot advance any further
    CounterExhausted,

    // Infrastructure errors (8xxx)
    /// Database operation failed
    DatabaseError,
    /// Sequence row was locked for longer than the wait budget
    LockTimeout,
    /// Counter update could not be persisted
    PersistenceFailure,
    /// Internal server error
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn numeric_code(&self) -> u32 {
        match self {
            ErrorCode::InvalidRequestBody => 3001,
            ErrorCode::InvalidFieldValue => 3003,
            ErrorCode::DefinitionNotFound => 4001,
            ErrorCode::AlreadyExists => 5004,
            ErrorCode::CounterExhausted => 7001,
            ErrorCode::DatabaseError => 8001,
            ErrorCode::LockTimeout => 8003,
            ErrorCode::PersistenceFailure => 8004,
            ErrorCode::InternalError => 8999,
        }
    }

    /// Get the HTTP status code for this error
    pub fn http_status(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidRequestBody => StatusCode::BAD_REQUEST,
            ErrorCode::InvalidFieldValue => StatusCode::BAD_REQUEST,
            ErrorCode::DefinitionNotFound => StatusCode::NOT_FOUND,
            ErrorCode::AlreadyExists => StatusCode::CONFLICT,
            ErrorCode::CounterExhausted => StatusCode::CONFLICT,
            ErrorCode::DatabaseError => StatusCode::INTERNAL_SERVER_ERROR,
            // Retryable: the client may try again after `retry_after`
            ErrorCode::LockTimeout => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::PersistenceFailure => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code_str = match self {
            ErrorCode::InvalidRequestBody => "INVALID_REQUEST_BODY",
            ErrorCode::InvalidFieldValue => "INVALID_FIELD_VALUE",
            ErrorCode::DefinitionNotFound => "DEFINITION_NOT_FOUND",
            ErrorCode::AlreadyExists => "ALREADY_EXISTS",
            ErrorCode::CounterExhausted => "COUNTER_EXHAUSTED",
            ErrorCode::DatabaseError => "DATABASE_ERROR",
            ErrorCode::LockTimeout => "LOCK_TIMEOUT",
            ErrorCode::PersistenceFailure => "PERSISTENCE_FAILURE",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        };
        write!(f, "{}", code_str)
    }
}

// ============================================================================
// Structured Error Response
// ============================================================================

/// Structured error response for API endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    /// Error details
    pub error: ErrorDetails,
}

/// Detailed error information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Machine-readable error code
    pub code: ErrorCode,

    /// Numeric error code for easy categorization
    pub numeric_code: u32,

    /// Human-readable error message
    pub message: String,

    /// Additional error details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,

    /// Seconds to wait before retrying, for retryable errors
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,

    /// Related resource ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
}

impl ApiError {
    /// Create a new API error
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetails {
                code,
                numeric_code: code.numeric_code(),
                message: message.into(),
                details: None,
                retry_after: None,
                resource_id: None,
            },
        }
    }

    /// Set additional details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.error.details = Some(details);
        self
    }

    /// Set retry-after seconds
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.error.retry_after = Some(seconds);
        self
    }

    /// Set related resource ID
    pub fn with_resource_id(mut self, id: impl Into<String>) -> Self {
        self.error.resource_id = Some(id.into());
        self
    }

    /// Get the HTTP status code
    pub fn status(&self) -> StatusCode {
        self.error.code.http_status()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code_str = self.error.code.to_string();
        let retry_after = self.error.retry_after;
        let mut response = (status, Json(self)).into_response();

        // Add error code header for easier debugging
        if let Ok(code_value) = axum::http::HeaderValue::from_str(&code_str) {
            response.headers_mut().insert(
                axum::http::header::HeaderName::from_static("x-error-code"),
                code_value,
            );
        }

        if let Some(seconds) = retry_after {
            response
                .headers_mut()
                .insert(axum::http::header::RETRY_AFTER, seconds.into());
        }

        response
    }
}

// ============================================================================
// Conversion from SequencerError
// ============================================================================

impl From<SequencerError> for ApiError {
    fn from(err: SequencerError) -> Self {
        match err {
            SequencerError::Validation(msg) => ApiError::new(ErrorCode::InvalidFieldValue, msg),
            SequencerError::NotFound(what) => ApiError::new(
                ErrorCode::DefinitionNotFound,
                format!("Sequence definition not found: {}", what),
            )
            .with_resource_id(what),
            SequencerError::Conflict {
                tenant_id,
                document_type,
            } => ApiError::new(
                ErrorCode::AlreadyExists,
                format!(
                    "Sequence definition already exists for {}/{}",
                    tenant_id, document_type
                ),
            )
            .with_details(serde_json::json!({
                "tenant_id": tenant_id,
                "document_type": document_type
            })),
            SequencerError::LockTimeout { key, waited_ms } => ApiError::new(
                ErrorCode::LockTimeout,
                format!("Sequence {} is busy, retry the request", key),
            )
            .with_details(serde_json::json!({ "waited_ms": waited_ms }))
            .with_retry_after(CONTENTION_RETRY_AFTER_SECS),
            SequencerError::PersistenceFailure(msg) => ApiError::new(
                ErrorCode::PersistenceFailure,
                format!("Failed to persist sequence counter: {}", msg),
            )
            .with_retry_after(CONTENTION_RETRY_AFTER_SECS),
            SequencerError::CounterExhausted(key) => ApiError::new(
                ErrorCode::CounterExhausted,
                format!("Counter exhausted for {}", key),
            ),
            SequencerError::Database(e) => {
                ApiError::new(ErrorCode::DatabaseError, format!("Database error: {}", e))
            }
            SequencerError::Configuration(msg) => ApiError::new(
                ErrorCode::InternalError,
                format!("Configuration error: {}", msg),
            ),
            SequencerError::Internal(msg) => ApiError::new(ErrorCode::InternalError, msg),
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Create a validation error with field details
pub fn validation_error(field: &str, message: impl Into<String>) -> ApiError {
    ApiError::new(ErrorCode::InvalidFieldValue, message.into())
        .with_details(serde_json::json!({ "field": field }))
}

// ============================================================================
// Tests
// ============================================================================
