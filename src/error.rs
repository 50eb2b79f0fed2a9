use crate::protocol::ErrorBody;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to create session: backend answered {status}")]
    SessionCreationFailed { status: StatusCode },

    /// Carries the backend's own status and error text back to the caller.
    #[error("backend chat failed: {status} {details}")]
    BackendChatFailed { status: StatusCode, details: String },

    #[error("request has no messages")]
    NoMessages,

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("backend request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid header value: {0}")]
    Header(#[from] axum::http::header::InvalidHeaderValue),

    #[error("failed to build response: {0}")]
    Response(#[from] axum::http::Error),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match self {
            ProxyError::BackendChatFailed { status, details } => {
                tracing::error!(%status, %details, "backend error");
                let body = ErrorBody {
                    error: "Backend service failed".to_string(),
                    details: Some(details),
                };
                (status, Json(body)).into_response()
            }
            other => {
                tracing::error!(error = %other, "error in chat proxy");
                let body = ErrorBody {
                    error: "Internal Server Error".to_string(),
                    details: None,
                };
                (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
            }
        }
    }
}
