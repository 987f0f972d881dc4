use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
/// Errors raised by the storage backends.
pub enum StoreError {
    #[error("{0}")]
    Postgres(#[from] postgres::Error),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] openssl::error::ErrorStack),

    #[error("TLS enabled but no TLS parameters specified")]
    MissingTlsParameters,

    #[error("No transaction in progress")]
    NoTransaction,

    #[error("Database thread is not running")]
    Disconnected,

    #[error("{0}")]
    Backend(String),
}

#[derive(Error, Debug)]
/// Errors that end a request. Each variant maps to one HTTP status.
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Format(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Storage(#[from] StoreError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::Format(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
