use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::warn;

const BUSY_RETRY_AFTER_SECONDS: u64 = 5;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("{0}")]
    Validation(String),

    #[error("server busy, try again later")]
    Busy,

    #[error("worker failed: {diagnostics}")]
    Worker { diagnostics: String },

    #[error("worker finished without producing a file")]
    EmptyOutput,

    #[error("invalid or expired token")]
    NotFound,

    #[error("download is still being prepared")]
    NotReady,

    #[error("content not found")]
    ContentUnavailable { diagnostics: String },

    #[error("{0}")]
    Internal(String),
}

impl DownloadError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn worker(diagnostics: impl Into<String>) -> Self {
        Self::Worker {
            diagnostics: diagnostics.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<u64>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub code: &'static str,
    pub details: Option<String>,
    pub retry_after_seconds: Option<u64>,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            code,
            details: None,
            retry_after_seconds: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }

    pub fn rate_limited(retry_after_seconds: u64) -> Self {
        Self {
            retry_after_seconds: Some(retry_after_seconds),
            ..Self::new(
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMITED",
                "Too many requests, slow down.",
            )
        }
    }

    fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl From<DownloadError> for ApiError {
    fn from(error: DownloadError) -> Self {
        match error {
            DownloadError::Validation(message) => Self::bad_request(message),
            DownloadError::Busy => Self {
                retry_after_seconds: Some(BUSY_RETRY_AFTER_SECONDS),
                ..Self::new(
                    StatusCode::TOO_MANY_REQUESTS,
                    "SERVER_BUSY",
                    "Server busy, try again later",
                )
            },
            DownloadError::Worker { diagnostics } => Self::new(
                StatusCode::BAD_GATEWAY,
                "WORKER_FAILED",
                "Failed to prepare download",
            )
            .with_details(diagnostics),
            DownloadError::EmptyOutput => Self::new(
                StatusCode::BAD_GATEWAY,
                "EMPTY_OUTPUT",
                "No file was produced for this download",
            ),
            DownloadError::NotFound => {
                Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", "Invalid or expired token")
            }
            DownloadError::NotReady => {
                Self::new(StatusCode::LOCKED, "NOT_READY", "Still preparing")
            }
            DownloadError::ContentUnavailable { diagnostics } => Self::new(
                StatusCode::NOT_FOUND,
                "CONTENT_NOT_FOUND",
                "Content not found",
            )
            .with_details(diagnostics),
            DownloadError::Internal(message) => {
                warn!(error = %message, "internal error");
                Self::internal("Internal server error").with_details(message)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            code: self.code,
            details: self.details,
            retry_after_seconds: self.retry_after_seconds,
        });

        let mut response = (self.status, body).into_response();
        if let Some(seconds) = self.retry_after_seconds
            && let Ok(value) = HeaderValue::from_str(&seconds.to_string())
        {
            response.headers_mut().insert(RETRY_AFTER, value);
        }

        response
    }
}
