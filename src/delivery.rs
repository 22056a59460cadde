//! Delivery stage
//!
//! Streams a finished MP3 file into the HTTP response body, then deletes it.
//! Deletion is tied to the body stream itself, so it happens exactly once
//! whether the transfer completes or the sink drops mid-stream; a delivery
//! failure is terminal for the job and never re-triggers the pipeline.

use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::{Body, Bytes};
use axum::http::{header, StatusCode};
use axum::response::Response;
use futures::Stream;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::cache::OutputClaim;
use crate::error::{Error, Result};

/// Stream the file at the claimed path to the caller as an attachment.
///
/// The claim rides along inside the body stream: when the stream finishes or
/// is dropped, the file is removed and only then is the path released back
/// to sweep eligibility.
pub async fn deliver(claim: OutputClaim, download_name: &str) -> Result<Response> {
    let file = match tokio::fs::File::open(claim.path()).await {
        Ok(file) => file,
        Err(e) => {
            // Delivery failure is terminal for the job: the artifact is
            // useless to the caller and must not sit until the sweep.
            match tokio::fs::remove_file(claim.path()).await {
                Ok(()) => {}
                Err(rm) if rm.kind() == std::io::ErrorKind::NotFound => {}
                Err(rm) => warn!(
                    "Cannot remove undeliverable file {}: {}",
                    claim.path().display(),
                    rm
                ),
            }
            return Err(Error::Storage(format!(
                "Cannot open output {}: {}",
                claim.path().display(),
                e
            )));
        }
    };

    let body = Body::from_stream(FileOnce {
        inner: ReaderStream::new(file),
        path: claim.path().to_path_buf(),
        _claim: claim,
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "audio/mpeg")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", download_name),
        )
        .body(body)
        .map_err(|e| Error::Delivery(format!("Cannot build response: {}", e)))
}

/// File-backed body stream that removes its file when it goes away.
struct FileOnce {
    inner: ReaderStream<tokio::fs::File>,
    path: PathBuf,
    _claim: OutputClaim,
}

impl Stream for FileOnce {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for FileOnce {
    fn drop(&mut self) {
        // Drop order: remove the file first, then the claim releases the
        // path from the in-flight registry.
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Delivered and removed {}", self.path.display()),
            Err(e) => warn!("Cannot remove delivered file {}: {}", self.path.display(), e),
        }
    }
}
