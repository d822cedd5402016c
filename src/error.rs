use crate::models::VideoId;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use std::path::PathBuf;
use thiserror::Error;

pub type StreamResult<T> = Result<T, StreamError>;

/// Stream orchestration errors with API status codes
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Invalid stream configuration: {0}")]
    Config(String),

    #[error("Failed to spawn encoder: {0}")]
    Spawn(String),

    #[error("A stream is already running")]
    AlreadyRunning,

    #[error("Encoder exited with {}: {stderr}", .code.map_or("a signal".to_string(), |c| format!("code {c}")))]
    EncoderRuntime { code: Option<i32>, stderr: String },

    #[error("Failed to stop encoder: {0}")]
    Stop(String),

    #[error("Video {0} not found")]
    VideoNotFound(VideoId),

    #[error("No video selected and the playlist is empty")]
    NoVideoSelected,

    #[error("Media file missing: {}", .0.display())]
    MissingMedia(PathBuf),

    #[error("Cannot {action} while stream is {from}")]
    InvalidTransition { from: &'static str, action: &'static str },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl StreamError {
    /// Convert error to the HTTP status code reported to API callers
    pub fn status_code(&self) -> StatusCode {
        match self {
            StreamError::Config(_)
            | StreamError::Spawn(_)
            | StreamError::NoVideoSelected
            | StreamError::MissingMedia(_)
            | StreamError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            StreamError::VideoNotFound(_) => StatusCode::NOT_FOUND,
            StreamError::AlreadyRunning | StreamError::InvalidTransition { .. } => {
                StatusCode::CONFLICT
            }
            StreamError::EncoderRuntime { .. } | StreamError::Stop(_) | StreamError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for StreamError {
    fn into_response(self) -> Response {
        (
            self.status_code(),
            Json(json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            StreamError::Config("empty stream key".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            StreamError::Spawn("No such file or directory".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            StreamError::AlreadyRunning.status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            StreamError::VideoNotFound(7).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            StreamError::Store(anyhow::anyhow!("disk full")).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_encoder_runtime_message() {
        let error = StreamError::EncoderRuntime {
            code: Some(1),
            stderr: "Invalid argument".into(),
        };
        assert_eq!(
            error.to_string(),
            "Encoder exited with code 1: Invalid argument"
        );

        let killed = StreamError::EncoderRuntime {
            code: None,
            stderr: String::new(),
        };
        assert!(killed.to_string().starts_with("Encoder exited with a signal"));
    }
}
