use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::FederationError;

/// Application error types
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("{message}")]
    PartialFailure { message: String, details: String },

    #[error("Internal server error: {0}")]
    Internal(String),
}

/// Error response format
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorDetail {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_detail) = match self {
            AppError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorDetail::new("VALIDATION_ERROR", msg),
            ),
            AppError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                ErrorDetail::new("NOT_FOUND", msg),
            ),
            AppError::Unavailable(msg) => {
                let enhanced_msg = format!("{} The endpoint may recover; retry after the next heartbeat.", msg);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    ErrorDetail::new("UNAVAILABLE", enhanced_msg),
                )
            }
            AppError::PartialFailure { message, details } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorDetail::new("PARTIAL_FAILURE", message).with_details(details),
            ),
            AppError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorDetail::new("INTERNAL_ERROR", msg),
            ),
        };

        let body = Json(ErrorResponse {
            error: error_detail,
        });

        (status, body).into_response()
    }
}

/// Convert FederationError to AppError
impl From<FederationError> for AppError {
    fn from(err: FederationError) -> Self {
        let message = err.to_string();
        match err {
            FederationError::InvalidDescriptor(_) | FederationError::IncompatibleMetadata(_) => {
                AppError::Validation(message)
            }
            FederationError::NotFound(msg) => AppError::NotFound(msg),
            FederationError::EndpointUnavailable(_)
            | FederationError::StaleHandle(_)
            | FederationError::PeerUnreachable(_)
            | FederationError::QueryHanging(_) => AppError::Unavailable(message),
            FederationError::ReloadPartialFailure(failures) => AppError::PartialFailure {
                message,
                details: failures
                    .iter()
                    .map(|f| match &f.data_source {
                        Some(source) => format!("{}/{}: {}", f.table, source, f.reason),
                        None => format!("{}: {}", f.table, f.reason),
                    })
                    .collect::<Vec<_>>()
                    .join("; "),
            },
            FederationError::CloseFailures(errors) => AppError::PartialFailure {
                message,
                details: errors.join("; "),
            },
            _ => AppError::Internal(message),
        }
    }
}

/// Convert anyhow::Error to AppError
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}
