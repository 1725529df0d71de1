//! Standardized error handling for the Triage API
//!
//! Every component boundary speaks the same stable error kinds; handlers
//! surface the first blocking error as `{code, message}` JSON.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use triage_shared::TicketStatus;

/// Application error kinds. Names are stable across components.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("validation failed")]
    ValidationFailed { details: HashMap<String, Vec<String>> },

    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition { from: TicketStatus, to: TicketStatus },

    #[error("{0}")]
    PermissionDenied(String),

    /// An outbound channel is not usable (missing URL, missing secret, ...).
    #[error("{0}")]
    ConfigIncomplete(String),

    /// Outbound HTTP failed after all retries were exhausted.
    #[error("upstream '{service}' failed: {message}")]
    UpstreamFailure { service: String, message: String },

    /// Store timeout or network blip; safe to retry.
    #[error("{0}")]
    Transient(String),

    /// Invariant violation.
    #[error("{0}")]
    Internal(String),

    /// Store errors bubble unchanged.
    #[error("database error: {0}")]
    Database(String),
}

impl AppError {
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    pub fn validation(field: &str, message: &str) -> Self {
        let mut details = HashMap::new();
        details.insert(field.to_string(), vec![message.to_string()]);
        Self::ValidationFailed { details }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::InvalidTransition { .. } => StatusCode::CONFLICT,
            Self::PermissionDenied(_) => StatusCode::FORBIDDEN,
            Self::ConfigIncomplete(_) => StatusCode::BAD_REQUEST,
            Self::UpstreamFailure { .. } => StatusCode::BAD_GATEWAY,
            Self::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) | Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::ValidationFailed { .. } => "VALIDATION_FAILED",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::PermissionDenied(_) => "PERMISSION_DENIED",
            Self::ConfigIncomplete(_) => "CONFIG_INCOMPLETE",
            Self::UpstreamFailure { .. } => "UPSTREAM_FAILURE",
            Self::Transient(_) => "TRANSIENT",
            Self::Internal(_) => "INTERNAL",
            Self::Database(_) => "DATABASE_ERROR",
        }
    }

    /// Client-facing message. Internal detail stays in the logs.
    pub fn public_message(&self) -> String {
        match self {
            Self::Internal(msg) => {
                tracing::error!("internal error: {}", msg);
                "An internal error occurred".to_string()
            }
            Self::Database(msg) => {
                tracing::error!("database error: {}", msg);
                "A database error occurred".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("Resource".to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => Self::Transient(err.to_string()),
            _ => Self::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization error: {}", err))
    }
}

/// Standard API error body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<HashMap<String, Vec<String>>>,
    pub timestamp: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let details = match &self {
            Self::ValidationFailed { details } => Some(details.clone()),
            _ => None,
        };
        let body = ApiError {
            code: self.error_code().to_string(),
            message: self.public_message(),
            details,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        (status, Json(body)).into_response()
    }
}

/// Result type alias for handlers and engines.
pub type ApiResult<T> = Result<T, AppError>;

/// Accumulates field-level validation errors.
pub struct ValidationBuilder {
    details: HashMap<String, Vec<String>>,
}

impl ValidationBuilder {
    pub fn new() -> Self {
        Self {
            details: HashMap::new(),
        }
    }

    pub fn error(mut self, field: &str, message: &str) -> Self {
        self.details
            .entry(field.to_string())
            .or_default()
            .push(message.to_string());
        self
    }

    pub fn build(self) -> Option<AppError> {
        if self.details.is_empty() {
            None
        } else {
            Some(AppError::ValidationFailed {
                details: self.details,
            })
        }
    }
}

impl Default for ValidationBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(AppError::not_found("Ticket").error_code(), "NOT_FOUND");
        assert_eq!(
            AppError::InvalidTransition {
                from: TicketStatus::Closed,
                to: TicketStatus::Open,
            }
            .error_code(),
            "INVALID_TRANSITION"
        );
        assert_eq!(
            AppError::Transient("pool timeout".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::UpstreamFailure {
                service: "dingtalk".into(),
                message: "500".into(),
            }
            .status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_sqlx_row_not_found_maps_to_not_found() {
        let err: AppError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.error_code(), "NOT_FOUND");
    }

    #[test]
    fn test_validation_builder() {
        let error = ValidationBuilder::new()
            .error("priority", "unknown value")
            .error("priority", "must be one of low..critical")
            .error("rating", "out of range")
            .build();

        assert!(error.is_some());
        if let Some(AppError::ValidationFailed { details }) = error {
            assert_eq!(details.get("priority").unwrap().len(), 2);
            assert_eq!(details.get("rating").unwrap().len(), 1);
        }
    }
}
