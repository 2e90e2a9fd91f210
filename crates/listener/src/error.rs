//! HTTP error mapping for the listener.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::{debug, error};

use bridge::{GatewayError, RegistryError};

/// JSON body of every error response.
#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    /// Stable machine-readable code.
    pub code: &'static str,
    pub message: String,
}

/// An error that renders as `{code, message}` with a mapped status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    /// A malformed request: `400` with code `validation`.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Validation { message } => Self::validation(message),
            e @ GatewayError::Unroutable { .. } => {
                Self::new(StatusCode::UNPROCESSABLE_ENTITY, "unroutable", e.to_string())
            }
            GatewayError::Registry(e) => e.into(),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        let message = err.to_string();
        match err {
            RegistryError::TaskNotFound { .. } | RegistryError::EventNotFound { .. } => {
                Self::not_found(message)
            }
            RegistryError::Conflict { .. }
            | RegistryError::DuplicateEvent { .. }
            | RegistryError::NotDue { .. } => Self::new(StatusCode::CONFLICT, "conflict", message),
            RegistryError::InvalidTransition { .. } => {
                Self::new(StatusCode::CONFLICT, "invalid_transition", message)
            }
            RegistryError::InvalidCursor { .. } => Self::validation(message),
            RegistryError::Unavailable { .. } => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "unavailable", message)
            }
            RegistryError::AttemptOutOfOrder { .. } => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(
                status = self.status.as_u16(),
                code = self.code,
                message = %self.message,
                "Request failed"
            );
        } else {
            debug!(
                status = self.status.as_u16(),
                code = self.code,
                message = %self.message,
                "Request rejected"
            );
        }
        let body = ApiErrorBody {
            code: self.code,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}
