//! Error types for AnswerForge services
//!
//! Provides a comprehensive error handling system with:
//! - Service-boundary errors with HTTP status mapping
//! - Adapter errors for the LLM and retrieval backends
//! - The orchestration failure taxonomy surfaced in progress events

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::orchestration::{BudgetDenial, RunPhase};

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (1xxx)
    ValidationError,

    // External service errors (8xxx)
    UpstreamError,
    LlmProviderError,
    LlmTimeout,
    RetrievalUnavailable,
    RetrievalTimeout,
    LlmRateLimited,

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

            ErrorCode::UpstreamError => 8001,
            ErrorCode::LlmProviderError => 8002,
            ErrorCode::LlmTimeout => 8003,
            ErrorCode::RetrievalUnavailable => 8004,
            ErrorCode::RetrievalTimeout => 8005,
            ErrorCode::LlmRateLimited => 8006,

            ErrorCode::InternalError => 9001,
            ErrorCode::ConfigurationError => 9002,
            ErrorCode::SerializationError => 9003,
        }
    }
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Internal server error: {message}")]
    Internal { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Validation { .. } => ErrorCode::ValidationError,
            AppError::Llm(LlmError::Provider { .. }) => ErrorCode::LlmProviderError,
            AppError::Llm(LlmError::Timeout { .. }) => ErrorCode::LlmTimeout,
            AppError::Llm(LlmError::RateLimited { .. }) => ErrorCode::LlmRateLimited,
            AppError::Retrieval(RetrievalError::Unavailable { .. }) => ErrorCode::RetrievalUnavailable,
            AppError::Retrieval(RetrievalError::Timeout { .. }) => ErrorCode::RetrievalTimeout,
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
            AppError::Validation { .. } => StatusCode::BAD_REQUEST,

            // 500 Internal Server Error
            AppError::Internal { .. } |
            AppError::Configuration { .. } |
            AppError::Serialization(_) |
            AppError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,

            // 502 Bad Gateway
            AppError::Llm(LlmError::Provider { .. }) |
            AppError::Retrieval(RetrievalError::Unavailable { .. }) |
            AppError::HttpClient(_) => StatusCode::BAD_GATEWAY,

            // 503 Service Unavailable
            AppError::Llm(LlmError::RateLimited { .. }) => StatusCode::SERVICE_UNAVAILABLE,

            // 504 Gateway Timeout
            AppError::Llm(LlmError::Timeout { .. }) |
            AppError::Retrieval(RetrievalError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
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
    pub field: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();
        let message = self.to_string();

        if self.is_server_error() {
            tracing::error!(
                error = %message,
                code = ?code,
                status = status.as_u16(),
                "Server error"
            );
        } else if self.is_client_error() {
            tracing::warn!(
                error = %message,
                code = ?code,
                status = status.as_u16(),
                "Client error"
            );
        }

        let field = match &self {
            AppError::Validation { field, .. } => field.clone(),
            _ => None,
        };

        let body = ErrorResponse {
            error: ErrorDetails { code, message, field },
        };

        (status, Json(body)).into_response()
    }
}

/// Failure of an LLM backend call
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("LLM provider error: {message}")]
    Provider { message: String, retryable: bool },

    #[error("LLM call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("LLM provider rate limited: {message}")]
    RateLimited { message: String },
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, LlmError::Provider { retryable: true, .. } | LlmError::RateLimited { .. })
    }
}

/// Failure of a call to the external search service
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RetrievalError {
    #[error("Retrieval backend unavailable: {message}")]
    Unavailable { message: String, retryable: bool },

    #[error("Retrieval timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

impl RetrievalError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RetrievalError::Unavailable { retryable: true, .. })
    }
}

/// Orchestration failure kinds, as reported in error progress events
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ClassificationTimeout,
    DecompositionFailure,
    BranchFailure,
    BudgetExhausted,
    ProviderError,
    ProviderTimeout,
    ProviderRateLimited,
    RetrievalUnavailable,
    RetrievalTimeout,
    IllegalTransition,
    Cancelled,
}

/// Failures raised while a run is in flight.
///
/// Every variant except `BudgetExhausted` is recovered inside the run; none of
/// them ever reaches the caller as an `Err`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StageError {
    #[error("Search classification timed out after {timeout_ms}ms")]
    ClassificationTimeout { timeout_ms: u64 },

    #[error("Question decomposition failed: {message}")]
    DecompositionFailure { message: String },

    #[error("Sub-question {sub_question_id} failed: {message}")]
    BranchFailure { sub_question_id: usize, message: String },

    #[error("Budget exhausted: {0}")]
    BudgetExhausted(BudgetDenial),

    #[error(transparent)]
    Provider(#[from] LlmError),

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error("Illegal run transition {from} -> {to}")]
    IllegalTransition { from: RunPhase, to: RunPhase },

    #[error("Run cancelled")]
    Cancelled,
}

impl StageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::ClassificationTimeout { .. } => ErrorKind::ClassificationTimeout,
            StageError::DecompositionFailure { .. } => ErrorKind::DecompositionFailure,
            StageError::BranchFailure { .. } => ErrorKind::BranchFailure,
            StageError::BudgetExhausted(_) => ErrorKind::BudgetExhausted,
            StageError::Provider(LlmError::Provider { .. }) => ErrorKind::ProviderError,
            StageError::Provider(LlmError::Timeout { .. }) => ErrorKind::ProviderTimeout,
            StageError::Provider(LlmError::RateLimited { .. }) => ErrorKind::ProviderRateLimited,
            StageError::Retrieval(RetrievalError::Unavailable { .. }) => ErrorKind::RetrievalUnavailable,
            StageError::Retrieval(RetrievalError::Timeout { .. }) => ErrorKind::RetrievalTimeout,
            StageError::IllegalTransition { .. } => ErrorKind::IllegalTransition,
            StageError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            StageError::Provider(e) => e.is_retryable(),
            StageError::Retrieval(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<BudgetDenial> for StageError {
    fn from(denial: BudgetDenial) -> Self {
        StageError::BudgetExhausted(denial)
    }
}
