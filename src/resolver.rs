//! Audio resolver boundary
//!
//! Turns a remote video URL into track metadata and a raw audio byte stream.
//! The core consumes the `AudioResolver` trait only; `YtDlpResolver` is the
//! production implementation, shelling out to the yt-dlp extractor.

use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::process::{Child, Command};
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};

/// Metadata snapshot for a resolvable video
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackMetadata {
    pub title: String,
    /// Seconds; absent when the source does not report a duration
    pub duration_seconds: Option<f64>,
    pub author: Option<String>,
    pub thumbnail: Option<String>,
}

/// An open, in-flight audio byte source bound to one conversion job.
///
/// Exclusively owned by the transcode pipeline for that job; `abort()` must
/// be called (or the handle dropped) when the job ends for any reason.
pub struct AudioStream {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    child: Option<Child>,
}

impl AudioStream {
    /// Wrap an in-memory or file-backed reader. Used by tests and any
    /// resolver that does not own a subprocess.
    pub fn from_reader(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            reader: Box::new(reader),
            child: None,
        }
    }

    /// Adopt a spawned extractor process, streaming from its stdout.
    fn from_child(mut child: Child) -> Result<Self> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Resolve("extractor process has no stdout".to_string()))?;
        Ok(Self {
            reader: Box::new(stdout),
            child: Some(child),
        })
    }

    /// Close the stream from the consumer side. Safe to call at any point;
    /// kills the owning extractor process if there is one.
    pub async fn abort(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill().await;
        }
    }
}

impl AsyncRead for AudioStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

/// Resolver contract consumed by the handlers and the pipeline
#[async_trait]
pub trait AudioResolver: Send + Sync {
    /// Syntactic/service check; performs no network I/O.
    fn validate(&self, url: &str) -> bool;

    /// Fetch title/duration/author/thumbnail for a video URL.
    async fn fetch_metadata(&self, url: &str) -> Result<TrackMetadata>;

    /// Open a live byte stream of the best available audio-only track.
    async fn open_audio_stream(&self, url: &str) -> Result<AudioStream>;
}

/// Hosts the yt-dlp backend is known to handle
const SUPPORTED_DOMAINS: &[&str] = &[
    "youtube.com",
    "youtu.be",
    "music.youtube.com",
    "soundcloud.com",
    "vimeo.com",
    "dailymotion.com",
    "bandcamp.com",
];

/// Production resolver backed by the external yt-dlp extractor
pub struct YtDlpResolver {
    binary: String,
}

impl YtDlpResolver {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    fn is_supported_host(url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_lowercase();
        SUPPORTED_DOMAINS
            .iter()
            .any(|d| host == *d || host.ends_with(&format!(".{}", d)))
    }
}

#[async_trait]
impl AudioResolver for YtDlpResolver {
    fn validate(&self, url: &str) -> bool {
        match Url::parse(url) {
            Ok(parsed) => {
                matches!(parsed.scheme(), "http" | "https") && Self::is_supported_host(&parsed)
            }
            Err(_) => false,
        }
    }

    async fn fetch_metadata(&self, url: &str) -> Result<TrackMetadata> {
        debug!("Fetching metadata via {} for {}", self.binary, url);
        let output = Command::new(&self.binary)
            .args(["--dump-json", "--no-playlist", "--no-warnings", url])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::Resolve(format!("Cannot run {}: {}", self.binary, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Resolve(format!(
                "Extractor failed for {}: {}",
                url,
                stderr.trim()
            )));
        }

        let info: serde_json::Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| Error::Resolve(format!("Unparseable extractor output: {}", e)))?;

        let title = info
            .get("title")
            .and_then(|t| t.as_str())
            .unwrap_or("audio")
            .to_string();

        Ok(TrackMetadata {
            title,
            duration_seconds: info.get("duration").and_then(|d| d.as_f64()),
            author: info
                .get("uploader")
                .or_else(|| info.get("channel"))
                .and_then(|a| a.as_str())
                .map(str::to_string),
            thumbnail: info
                .get("thumbnail")
                .and_then(|t| t.as_str())
                .map(str::to_string),
        })
    }

    async fn open_audio_stream(&self, url: &str) -> Result<AudioStream> {
        debug!("Opening audio stream via {} for {}", self.binary, url);
        let child = Command::new(&self.binary)
            .args([
                "--format",
                "bestaudio",
                "--no-playlist",
                "--no-warnings",
                "--output",
                "-",
                url,
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Resolve(format!("Cannot run {}: {}", self.binary, e)))?;

        AudioStream::from_child(child)
    }
}
