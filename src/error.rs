//! Unified error type threaded through every component. Pre-stream failures
//! render as an HTTP response; in-stream failures render as an `error:` frame
//! and are never allowed to unwind past the pipeline orchestrator.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("the model returned nothing usable")]
    PlanEmpty,

    #[error("injection references an undefined variable: {0}")]
    InjectionMissingVar(String),

    #[error("injection expression failed to evaluate: {0}")]
    InjectionEvalFailed(String),

    #[error("triplestore transport error: {0}")]
    TriplestoreTransport(String),

    #[error("language model transport error: {0}")]
    LmTransport(String),

    #[error("stream cancelled by client disconnect")]
    StreamCancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Render as the in-stream `error: ...` frame text (without the prefix,
    /// which `PipelineEvent::Error` adds).
    pub fn to_stream_message(&self) -> String {
        self.to_string()
    }
}

/// Only `BadRequest` is expected to reach this impl — it is the sole variant
/// surfaced before a stream begins. Any other variant reaching here indicates
/// a bug in stage sequencing, so it is reported as 500 rather than silently
/// swallowed.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
