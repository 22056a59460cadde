//! mp3ify runtime configuration
//!
//! Resolved from command-line arguments and environment variables in `main.rs`.

use std::path::PathBuf;
use std::time::Duration;

/// Service configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen port
    pub port: u16,
    /// Root directory for transient MP3 artifacts
    pub cache_dir: PathBuf,
    /// Both the sweep interval and the eviction age threshold
    pub cache_duration: Duration,
    /// Path to the ffmpeg binary
    pub ffmpeg_path: String,
    /// Path to the yt-dlp binary
    pub ytdlp_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            cache_dir: PathBuf::from("cache"),
            cache_duration: Duration::from_millis(3_600_000),
            ffmpeg_path: "ffmpeg".to_string(),
            ytdlp_path: "yt-dlp".to_string(),
        }
    }
}
