use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::providers::ProviderError;
use crate::services::ReconcileError;
use crate::validation::ValidationError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    ProviderRejected(String),

    #[error("{0}")]
    MalformedResponse(String),

    #[error("{0}")]
    ProviderUnavailable(String),

    #[error("{0}")]
    CircuitOpen(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::ProviderRejected(_) | AppError::MalformedResponse(_) => {
                StatusCode::BAD_GATEWAY
            }
            AppError::ProviderUnavailable(_) | AppError::CircuitOpen(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Unauthorized(_) => "UNAUTHORIZED",
            AppError::ProviderRejected(_) => "PROVIDER_REJECTED",
            AppError::MalformedResponse(_) => "MALFORMED_RESPONSE",
            AppError::ProviderUnavailable(_) => "PROVIDER_UNAVAILABLE",
            AppError::CircuitOpen(_) => "CIRCUIT_OPEN",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "Request failed");
        }

        let body = Json(json!({
            "status": "error",
            "code": self.code(),
            "message": self.to_string(),
        }));

        (status, body).into_response()
    }
}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        AppError::Validation(err.to_string())
    }
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::ClientRejected { .. } => AppError::ProviderRejected(err.to_string()),
            ProviderError::MalformedResponse(_) => AppError::MalformedResponse(err.to_string()),
            ProviderError::Unavailable { .. } => AppError::ProviderUnavailable(err.to_string()),
            ProviderError::CircuitOpen(_) => AppError::CircuitOpen(err.to_string()),
        }
    }
}

impl From<ReconcileError> for AppError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::NotFound(reference) => {
                AppError::NotFound(format!("Transaction {} not found", reference))
            }
            ReconcileError::Gateway(e) | ReconcileError::Fulfillment(e) => e.into(),
            other => AppError::Internal(other.to_string()),
        }
    }
}
