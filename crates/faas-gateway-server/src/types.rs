use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use faas_common::{FaasError, Function, TransportKind};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

/// Error body returned by every route: `{"error": "...", "code": "..."}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub code: String,
    #[serde(skip)]
    status: Option<StatusCode>,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

fn error_code(err: &FaasError) -> &'static str {
    match err {
        FaasError::BuildFailed { .. } => "build_failed",
        FaasError::DuplicateFunction(_) => "duplicate_function",
        FaasError::FunctionNotFound(_) => "function_not_found",
        FaasError::ContainerLifecycle { .. } => "container_lifecycle",
        FaasError::ConnectTimeout { .. } => "connect_timeout",
        FaasError::MalformedResult(_) => "malformed_result",
        FaasError::Registry(_) => "registry",
        FaasError::InvalidRequest(_) => "invalid_request",
        FaasError::Config(_) => "config",
        FaasError::Io(_) => "io",
        FaasError::Internal(_) => "internal",
    }
}

impl From<FaasError> for ApiError {
    fn from(err: FaasError) -> Self {
        let status =
            StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self {
            error: err.to_string(),
            code: error_code(&err).to_string(),
            status: Some(status),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(code = %self.code, error = %self.error, "Request failed");
        } else {
            warn!(code = %self.code, error = %self.error, %status, "Request rejected");
        }
        (status, Json(self)).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub message: String,
    pub function: Function,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub transport: TransportKind,
}
