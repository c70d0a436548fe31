//! API error handling.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Conflict(String),
    /// Step control call against an already-terminal execution. The control
    /// layer treats this as "log locally and exit cleanly".
    Gone(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Gone(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<lazyaf_core::Error> for ApiError {
    fn from(err: lazyaf_core::Error) -> Self {
        match err {
            lazyaf_core::Error::NotFound(msg) => ApiError::NotFound(msg),
            lazyaf_core::Error::Validation(msg) => ApiError::BadRequest(msg),
            lazyaf_core::Error::Conflict(msg) => ApiError::Conflict(msg),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<lazyaf_db::DbError> for ApiError {
    fn from(err: lazyaf_db::DbError) -> Self {
        match err {
            lazyaf_db::DbError::NotFound(msg) => ApiError::NotFound(msg),
            lazyaf_db::DbError::Conflict(msg) => ApiError::Conflict(msg),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}
