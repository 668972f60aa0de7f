//! Error types for ReaderLoop services
//!
//! Provides the error taxonomy used across the review engine:
//! - Validation, not-found and conflict errors rejected synchronously
//! - Storage errors, including detection of the uniqueness guards
//! - Collaborator errors, which the engine logs and never propagates
//! - HTTP status code mapping and structured error responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::{DbErr, SqlErr};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (1xxx)
    ValidationError,
    MissingField,
    MissingIssueType,

    // Authentication errors (2xxx)
    Unauthorized,

    // Authorization errors (3xxx)
    Forbidden,

    // Resource errors (4xxx)
    NotFound,
    ReviewNotFound,
    IssueNotFound,
    AssignmentNotFound,
    MonitoringRecordNotFound,

    // Conflict errors (5xxx)
    Conflict,
    InvalidTransition,
    DuplicateReview,
    DeadlinePassed,
    InsufficientBalance,

    // Rate limiting (6xxx)
    RateLimited,

    // Database errors (7xxx)
    DatabaseError,
    ConnectionError,

    // External collaborator errors (8xxx)
    CollaboratorError,
    UpstreamError,
    QueueError,

    // Internal errors (9xxx)
    InternalError,
    ConfigurationError,
    SerializationError,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn as_code(&self) -> u16 {
        match self {
            ErrorCode::ValidationError => 1001,
            ErrorCode::MissingField => 1002,
            ErrorCode::MissingIssueType => 1003,

            ErrorCode::Unauthorized => 2001,

            ErrorCode::Forbidden => 3001,

            ErrorCode::NotFound => 4001,
            ErrorCode::ReviewNotFound => 4002,
            ErrorCode::IssueNotFound => 4003,
            ErrorCode::AssignmentNotFound => 4004,
            ErrorCode::MonitoringRecordNotFound => 4005,

            ErrorCode::Conflict => 5001,
            ErrorCode::InvalidTransition => 5002,
            ErrorCode::DuplicateReview => 5003,
            ErrorCode::DeadlinePassed => 5004,
            ErrorCode::InsufficientBalance => 5005,

            ErrorCode::RateLimited => 6001,

            ErrorCode::DatabaseError => 7001,
            ErrorCode::ConnectionError => 7002,

            ErrorCode::CollaboratorError => 8001,
            ErrorCode::UpstreamError => 8002,
            ErrorCode::QueueError => 8003,

            ErrorCode::InternalError => 9001,
            ErrorCode::ConfigurationError => 9002,
            ErrorCode::SerializationError => 9003,
        }
    }
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Validation errors
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("Required field missing: {field}")]
    MissingField { field: String },

    #[error("An issue type is required to {action} a review")]
    MissingIssueType { action: String },

    // Authentication / authorization
    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    #[error("Forbidden: {message}")]
    Forbidden { message: String },

    // Resource errors
    #[error("Resource not found: {resource_type} with id {id}")]
    NotFound { resource_type: String, id: String },

    #[error("Review not found: {id}")]
    ReviewNotFound { id: Uuid },

    #[error("Issue not found: {id}")]
    IssueNotFound { id: Uuid },

    #[error("Assignment not found: {id}")]
    AssignmentNotFound { id: Uuid },

    #[error("Monitoring record not found: {id}")]
    MonitoringRecordNotFound { id: Uuid },

    // Conflict errors
    #[error("Conflict: {message}")]
    Conflict { message: String },

    #[error("Cannot {action} review {review_id} while it is {status}")]
    InvalidTransition {
        review_id: Uuid,
        status: String,
        action: String,
    },

    #[error("Assignment {assignment_id} already has a review")]
    DuplicateReview { assignment_id: Uuid },

    #[error("Assignment {assignment_id} deadline has passed")]
    DeadlinePassed { assignment_id: Uuid },

    #[error("Insufficient balance for reader {reader_id}: requested {requested_cents} cents, available {available_cents} cents")]
    InsufficientBalance {
        reader_id: Uuid,
        requested_cents: i64,
        available_cents: i64,
    },

    // Rate limiting
    #[error("Rate limit exceeded: {limit} requests per second")]
    RateLimited { limit: u32 },

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] DbErr),

    #[error("Database connection error: {message}")]
    DatabaseConnection { message: String },

    // External collaborator errors
    #[error("{collaborator} failed: {message}")]
    Collaborator {
        collaborator: &'static str,
        message: String,
    },

    #[error("Queue error: {message}")]
    QueueError { message: String },

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    // Internal errors
    #[error("Internal server error: {message}")]
    Internal { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Validation { .. } => ErrorCode::ValidationError,
            AppError::MissingField { .. } => ErrorCode::MissingField,
            AppError::MissingIssueType { .. } => ErrorCode::MissingIssueType,
            AppError::Unauthorized { .. } => ErrorCode::Unauthorized,
            AppError::Forbidden { .. } => ErrorCode::Forbidden,
            AppError::NotFound { .. } => ErrorCode::NotFound,
            AppError::ReviewNotFound { .. } => ErrorCode::ReviewNotFound,
            AppError::IssueNotFound { .. } => ErrorCode::IssueNotFound,
            AppError::AssignmentNotFound { .. } => ErrorCode::AssignmentNotFound,
            AppError::MonitoringRecordNotFound { .. } => ErrorCode::MonitoringRecordNotFound,
            AppError::Conflict { .. } => ErrorCode::Conflict,
            AppError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            AppError::DuplicateReview { .. } => ErrorCode::DuplicateReview,
            AppError::DeadlinePassed { .. } => ErrorCode::DeadlinePassed,
            AppError::InsufficientBalance { .. } => ErrorCode::InsufficientBalance,
            AppError::RateLimited { .. } => ErrorCode::RateLimited,
            AppError::Database(_) => ErrorCode::DatabaseError,
            AppError::DatabaseConnection { .. } => ErrorCode::ConnectionError,
            AppError::Collaborator { .. } => ErrorCode::CollaboratorError,
            AppError::QueueError { .. } => ErrorCode::QueueError,
            AppError::HttpClient(_) => ErrorCode::UpstreamError,
            AppError::Internal { .. } => ErrorCode::InternalError,
            AppError::Configuration { .. } => ErrorCode::ConfigurationError,
            AppError::Serialization(_) => ErrorCode::SerializationError,
            AppError::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            AppError::Validation { .. }
            | AppError::MissingField { .. }
            | AppError::MissingIssueType { .. } => StatusCode::BAD_REQUEST,

            // 401 Unauthorized
            AppError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,

            // 403 Forbidden
            AppError::Forbidden { .. } => StatusCode::FORBIDDEN,

            // 404 Not Found
            AppError::NotFound { .. }
            | AppError::ReviewNotFound { .. }
            | AppError::IssueNotFound { .. }
            | AppError::AssignmentNotFound { .. }
            | AppError::MonitoringRecordNotFound { .. } => StatusCode::NOT_FOUND,

            // 409 Conflict
            AppError::Conflict { .. }
            | AppError::InvalidTransition { .. }
            | AppError::DuplicateReview { .. }
            | AppError::DeadlinePassed { .. }
            | AppError::InsufficientBalance { .. } => StatusCode::CONFLICT,

            // 429 Too Many Requests
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,

            // 500 Internal Server Error
            AppError::Database(_)
            | AppError::DatabaseConnection { .. }
            | AppError::Internal { .. }
            | AppError::Configuration { .. }
            | AppError::Serialization(_)
            | AppError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,

            // 502 Bad Gateway
            AppError::Collaborator { .. } | AppError::HttpClient(_) => StatusCode::BAD_GATEWAY,

            // 503 Service Unavailable
            AppError::QueueError { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Check if this error should be logged at error level
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Check if this error is a client error
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// True when a storage-level unique constraint rejected the write.
    ///
    /// The ledger and monitoring tables rely on these constraints as their
    /// idempotency guards.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            AppError::Database(err) => matches!(
                err.sql_err(),
                Some(SqlErr::UniqueConstraintViolation(_))
            ),
            _ => false,
        }
    }
}

/// Structured error response for API
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();

        if self.is_server_error() {
            tracing::error!(
                error = %self,
                code = ?code,
                status = status.as_u16(),
                "Server error"
            );
        } else if self.is_client_error() {
            tracing::warn!(
                error = %self,
                code = ?code,
                status = status.as_u16(),
                "Client error"
            );
        }

        // Storage and collaborator details stay in the logs
        let message = if self.is_server_error() {
            "An internal error occurred".to_string()
        } else {
            self.to_string()
        };

        let body = ErrorResponse {
            error: ErrorDetails {
                code,
                message,
                request_id: None,
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        let field = err.field_errors().keys().next().map(|f| f.to_string());
        AppError::Validation {
            message: err.to_string(),
            field,
        }
    }
}
