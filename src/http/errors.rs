use crate::errors::AuthError;
use crate::service::ServiceError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Transport-level error wrapper mapping service error kinds onto HTTP
/// status codes. Internal detail never leaks to clients; it is logged here
/// and replaced with a generic message.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Service(err) => match err {
                ServiceError::BadRequest(message) => {
                    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
                }
                ServiceError::NotFound(message) => {
                    (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response()
                }
                ServiceError::Internal(details) => {
                    tracing::error!(details = %details, "Internal error");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(json!({ "error": "internal server error" })),
                    )
                        .into_response()
                }
                ServiceError::Unknown(err) => {
                    tracing::error!(error = ?err, "Unhandled error");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(json!({ "error": "internal server error" })),
                    )
                        .into_response()
                }
            },
            ApiError::Auth(err) => {
                tracing::debug!(error = %err, "Request rejected by auth middleware");
                (
                    StatusCode::UNAUTHORIZED,
                    Json(json!({ "error": "unauthorized" })),
                )
                    .into_response()
            }
        }
    }
}
