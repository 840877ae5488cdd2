//! API error taxonomy with fixed recovery policies.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Never retried; surfaced verbatim.
    #[error("{0}")]
    BadInput(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("{message}")]
    Forbidden { reason: &'static str, message: String },
    #[error("{message}")]
    Conflict { reason: &'static str, message: String },
    #[error("not found")]
    NotFound,
    #[error("rate limited")]
    RateLimited { retry_after_seconds: i64 },
    /// Store or lock layer fault; the next timer tick retries.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn conflict(reason: &'static str, message: impl Into<String>) -> Self {
        ApiError::Conflict {
            reason,
            message: message.into(),
        }
    }

    pub fn forbidden(reason: &'static str, message: impl Into<String>) -> Self {
        ApiError::Forbidden {
            reason,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadInput(message) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": message })),
            )
                .into_response(),
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "error": "unauthorized" })),
            )
                .into_response(),
            ApiError::Forbidden { reason, message } => (
                StatusCode::FORBIDDEN,
                Json(serde_json::json!({ "error": message, "reason": reason })),
            )
                .into_response(),
            ApiError::Conflict { reason, message } => (
                StatusCode::CONFLICT,
                Json(serde_json::json!({ "error": message, "reason": reason })),
            )
                .into_response(),
            ApiError::NotFound => (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({ "error": "not found" })),
            )
                .into_response(),
            ApiError::RateLimited {
                retry_after_seconds,
            } => {
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(serde_json::json!({
                        "error": "rate limited",
                        "retry_after_seconds": retry_after_seconds,
                    })),
                )
                    .into_response();
                if let Ok(value) = retry_after_seconds.to_string().parse() {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
                response
            }
            ApiError::Internal(err) => {
                error!(%err, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({ "error": "internal error" })),
                )
                    .into_response()
            }
        }
    }
}
