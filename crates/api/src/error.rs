use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use batchfan_comfyui::coordinator::CoordinatorError;
use batchfan_core::error::CoreError;

/// Application-level error type for HTTP handlers.
///
/// Wraps domain and coordinator errors and adds HTTP-specific variants.
/// Implements [`IntoResponse`] to produce consistent JSON error responses.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// A domain-level error from `batchfan_core`.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A batch-orchestration error from `batchfan_comfyui`.
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    /// A bad request with a human-readable message.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// A missing resource with a human-readable message.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An internal error with a human-readable message.
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // --- CoreError variants ---
            AppError::Core(core) => match core {
                CoreError::Template(msg) => {
                    (StatusCode::BAD_REQUEST, "TEMPLATE_ERROR", msg.clone())
                }
                CoreError::Io(err) => {
                    tracing::error!(error = %err, "I/O error");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "INTERNAL_ERROR",
                        "An internal error occurred".to_string(),
                    )
                }
            },

            // --- Coordinator errors ---
            AppError::Coordinator(err) => classify_coordinator_error(err),

            // --- HTTP-specific errors ---
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::InternalError(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}

/// Classify a coordinator error into an HTTP status, error code, and message.
fn classify_coordinator_error(err: &CoordinatorError) -> (StatusCode, &'static str, String) {
    match err {
        CoordinatorError::BatchActive => {
            (StatusCode::CONFLICT, "BATCH_ACTIVE", err.to_string())
        }
        CoordinatorError::EmptyBatch | CoordinatorError::InputMissing(_) => {
            (StatusCode::BAD_REQUEST, "BAD_REQUEST", err.to_string())
        }
        CoordinatorError::ResultNotFound(_) | CoordinatorError::NotMarked(_) => {
            (StatusCode::NOT_FOUND, "NOT_FOUND", err.to_string())
        }
        CoordinatorError::Init(_) | CoordinatorError::Io(_) => {
            tracing::error!(error = %err, "Coordinator error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
            )
        }
    }
}
