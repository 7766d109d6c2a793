use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AeroEchoError>;

#[derive(Error, Debug)]
pub enum AeroEchoError {
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("auth failure: {0}")]
    AuthFailure(String),

    #[error("invalid viewport: {0}")]
    InvalidViewport(String),

    #[error("send to connection {connection} failed: {reason}")]
    TransportSendFailure { connection: u64, reason: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub fn upstream_unavailable(msg: impl ToString) -> AeroEchoError {
    AeroEchoError::UpstreamUnavailable(msg.to_string())
}

pub fn auth_failure(msg: impl ToString) -> AeroEchoError {
    AeroEchoError::AuthFailure(msg.to_string())
}

pub fn invalid_viewport(msg: impl ToString) -> AeroEchoError {
    AeroEchoError::InvalidViewport(msg.to_string())
}

pub fn config_error(msg: impl ToString) -> AeroEchoError {
    AeroEchoError::ConfigError(msg.to_string())
}

impl IntoResponse for AeroEchoError {
    fn into_response(self) -> Response {
        let status = match self {
            AeroEchoError::NotFound(_) => StatusCode::NOT_FOUND,
            AeroEchoError::InvalidViewport(_) => StatusCode::BAD_REQUEST,
            AeroEchoError::UpstreamUnavailable(_) | AeroEchoError::AuthFailure(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = json!({ "status": "error", "message": self.to_string() });
        (status, Json(body)).into_response()
    }
}
