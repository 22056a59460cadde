//! Error types for mp3ify
//!
//! Defines module-specific error types using thiserror for clear error propagation.
//! Each variant maps to one failure domain of a conversion job; the `IntoResponse`
//! impl turns them into the structured JSON bodies the API returns.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Main error type for mp3ify
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or malformed user input (URL)
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Resolver could not reach or parse the video source
    #[error("Resolve error: {0}")]
    Resolve(String),

    /// Transcoding process failure
    #[error("Encode error: {0}")]
    Encode(String),

    /// Response sink failed mid-transfer
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// Cache directory unavailable or unwritable
    #[error("Storage error: {0}")]
    Storage(String),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, summary) = match &self {
            Error::BadRequest(_) => (StatusCode::BAD_REQUEST, None),
            Error::Resolve(_) => (StatusCode::INTERNAL_SERVER_ERROR, Some("Failed to fetch video info")),
            Error::Encode(_) => (StatusCode::INTERNAL_SERVER_ERROR, Some("Conversion failed")),
            Error::Delivery(_) => (StatusCode::INTERNAL_SERVER_ERROR, Some("Download failed")),
            Error::Storage(_) | Error::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, Some("Storage failure")),
        };

        let body = match (&self, summary) {
            // Validation failures carry the message directly, no details field
            (Error::BadRequest(msg), _) => json!({ "error": msg }),
            (err, Some(summary)) => json!({ "error": summary, "details": err.to_string() }),
            (err, None) => json!({ "error": err.to_string() }),
        };

        (status, Json(body)).into_response()
    }
}

/// Convenience Result type using mp3ify Error
pub type Result<T> = std::result::Result<T, Error>;
