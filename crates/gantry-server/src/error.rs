//! API error handling.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// API error type.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<gantry_core::Error> for ApiError {
    fn from(err: gantry_core::Error) -> Self {
        match err {
            gantry_core::Error::NotFound(msg) => ApiError::NotFound(msg),
            gantry_core::Error::InvalidInput(msg) | gantry_core::Error::InvalidWorkflow(msg) => {
                ApiError::BadRequest(msg)
            }
            gantry_core::Error::Unauthorized(msg) => ApiError::Unauthorized(msg),
            gantry_core::Error::ConcurrentModification(msg) => ApiError::Conflict(msg),
            gantry_core::Error::Internal(msg) => ApiError::Internal(msg),
        }
    }
}

impl From<gantry_db::DbError> for ApiError {
    fn from(err: gantry_db::DbError) -> Self {
        gantry_core::Error::from(err).into()
    }
}
