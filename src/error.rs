//! Error types for topicfed
//!
//! Errors crossing the HTTP boundary are converted to `AppError`,
//! which implements `IntoResponse` for proper HTTP error responses.
//! Pipeline stages use the narrower [`StageError`] so the orchestrator
//! can short-circuit on a typed result.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application-wide error type
#[derive(Debug, Error)]
pub enum AppError {
    /// Resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// Authentication required (401)
    #[error("Authentication required")]
    Unauthorized,

    /// Access denied (403)
    #[error("Access denied")]
    Forbidden,

    /// Validation error (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unprocessable entity (422)
    #[error("Unprocessable entity: {0}")]
    Unprocessable(String),

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration error (500)
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// HTTP client error (502)
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Federation error (502)
    #[error("Federation error: {0}")]
    Federation(String),

    /// Signature verification failed (401)
    #[error("Invalid signature")]
    InvalidSignature,

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rate limit exceeded (429)
    #[error("Rate limit exceeded")]
    RateLimited,

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Unprocessable(err.to_string())
    }
}

impl From<crate::federation::EnvelopeError> for AppError {
    fn from(err: crate::federation::EnvelopeError) -> Self {
        AppError::Unprocessable(err.to_string())
    }
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// Maps each error variant to appropriate HTTP status code
    /// and JSON error body.
    fn into_response(self) -> Response {
        use axum::Json;

        let (status, error_message, error_type) = match &self {
            AppError::NotFound => (StatusCode::NOT_FOUND, self.to_string(), "not_found"),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string(), "unauthorized"),
            AppError::InvalidSignature => (
                StatusCode::UNAUTHORIZED,
                self.to_string(),
                "invalid_signature",
            ),
            AppError::Forbidden => (StatusCode::FORBIDDEN, self.to_string(), "forbidden"),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone(), "validation"),
            AppError::Unprocessable(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                msg.clone(),
                "unprocessable",
            ),
            AppError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                self.to_string(),
                "rate_limited",
            ),
            AppError::Federation(msg) => (StatusCode::BAD_GATEWAY, msg.clone(), "federation"),
            AppError::HttpClient(_) => (StatusCode::BAD_GATEWAY, self.to_string(), "http_client"),
            AppError::Database(_) | AppError::Migration(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database error".to_string(),
                "database",
            ),
            AppError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone(), "config"),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
                "internal",
            ),
        };

        crate::metrics::ERRORS_TOTAL
            .with_label_values(&[error_type])
            .inc();

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Reason a validate stage rejected an activity.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidateError {
    /// The activity id was stored before; redelivery is expected and benign.
    #[error("activity {0} was already processed")]
    AlreadyProcessed(String),
    /// A business rule rejected the activity.
    #[error("{0}")]
    Rejected(String),
}

/// Typed abort raised by a pipeline stage handler.
///
/// Any variant stops the remaining stages for the activity.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("validate: {0}")]
    Validate(#[from] ValidateError),
    #[error("store: {0}")]
    Store(String),
    #[error("perform: {0}")]
    Perform(String),
    #[error("respond_to: {0}")]
    RespondTo(String),
}

impl StageError {
    pub fn rejected(message: impl Into<String>) -> Self {
        StageError::Validate(ValidateError::Rejected(message.into()))
    }

    pub fn store(message: impl std::fmt::Display) -> Self {
        StageError::Store(message.to_string())
    }

    pub fn perform(message: impl std::fmt::Display) -> Self {
        StageError::Perform(message.to_string())
    }

    pub fn respond_to(message: impl std::fmt::Display) -> Self {
        StageError::RespondTo(message.to_string())
    }

    /// True for the benign "already processed" replay.
    pub fn is_replay(&self) -> bool {
        matches!(self, StageError::Validate(ValidateError::AlreadyProcessed(_)))
    }

    /// Label used for metrics and logs.
    pub fn stage_label(&self) -> &'static str {
        match self {
            StageError::Validate(_) => "validate",
            StageError::Store(_) => "store",
            StageError::Perform(_) => "perform",
            StageError::RespondTo(_) => "respond_to",
        }
    }
}
