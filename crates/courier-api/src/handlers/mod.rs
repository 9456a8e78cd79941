//! HTTP request handlers for the Courier API.
//!
//! Handlers are grouped by functionality:
//! - `health` - Health and liveness probes
//! - `pipeline` - Worker lifecycle and queue management
//! - `notifications` - Publishing, manual retry, and delivery history
//!
//! All handlers return standardized error responses with a machine-readable
//! code, a human-readable message, and appropriate HTTP status codes.

pub mod health;
pub mod notifications;
pub mod pipeline;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

pub use health::{health_check, liveness_check};
pub use notifications::{publish_notification, retry_notification, user_history};
pub use pipeline::{clear_queue, pipeline_stats, pipeline_status, start_pipeline, stop_pipeline};

/// Error response with code and message.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error details including code and message
    pub error: ErrorDetail,
}

/// Detailed error information.
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    /// Machine-readable error code
    pub code: String,
    /// Human-readable error description
    pub message: String,
}

/// Creates a standardized error response.
pub(crate) fn error_response(
    status: StatusCode,
    code: &str,
    message: impl Into<String>,
) -> Response {
    let body =
        ErrorResponse { error: ErrorDetail { code: code.to_string(), message: message.into() } };
    (status, Json(body)).into_response()
}
