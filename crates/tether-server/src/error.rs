//! Error types for the edge server

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tether::TetherError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    /// Supervisor, backup or cron failure on a request path
    #[error(transparent)]
    Gateway(#[from] TetherError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for ServerError {
    fn from(err: anyhow::Error) -> Self {
        ServerError::Internal(err.to_string())
    }
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::Gateway(_) => StatusCode::BAD_GATEWAY,
            ServerError::InvalidConfig(_) | ServerError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let body = match self {
            ServerError::Gateway(ref e) => serde_json::json!({
                "error": e.to_string(),
                "category": e.category().to_string(),
                "hint": e.hint(),
            }),
            ref other => serde_json::json!({ "error": other.to_string() }),
        };
        tracing::warn!("Request failed: {}", body["error"]);
        (self.status(), Json(body)).into_response()
    }
}

pub type ServerResult<T> = Result<T, ServerError>;
