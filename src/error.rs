//! Error type for the HTTP surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    /// Missing or malformed request field. Never retried.
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("worker is shutting down")]
    ShuttingDown,

    /// Storage failure scoped to the triggering request.
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl WorkerError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

impl IntoResponse for WorkerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        (
            status,
            Json(json!({
                "error": self.to_string(),
                "code": status.as_u16(),
            })),
        )
            .into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, WorkerError>;

/// Reject a missing or blank required field.
pub fn require<'a>(value: Option<&'a str>, field: &str) -> ApiResult<&'a str> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(WorkerError::Validation(format!("missing required field: {field}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(WorkerError::validation("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(WorkerError::NotFound("session".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(WorkerError::ShuttingDown.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            WorkerError::from(anyhow::anyhow!("disk full")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn require_rejects_blank() {
        assert!(require(None, "project").is_err());
        assert!(require(Some("  "), "project").is_err());
        assert_eq!(require(Some(" demo "), "project").unwrap(), "demo");
    }
}
