//! mp3ify - Main entry point
//!
//! Wires up configuration, the cache store and its background sweeper, the
//! yt-dlp resolver, the transcode pipeline, and the axum HTTP server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mp3ify::api::{self, AppState};
use mp3ify::cache::{spawn_sweeper, CacheStore};
use mp3ify::config::Config;
use mp3ify::pipeline::TranscodePipeline;
use mp3ify::resolver::YtDlpResolver;

/// Command-line arguments for mp3ify
#[derive(Parser, Debug)]
#[command(name = "mp3ify")]
#[command(about = "Video URL to MP3 conversion service")]
#[command(version)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "3000", env = "PORT")]
    port: u16,

    /// Cache entry lifetime and sweep interval, in milliseconds
    #[arg(long, default_value = "3600000", env = "CACHE_DURATION")]
    cache_duration: u64,

    /// Directory holding transient MP3 artifacts
    #[arg(long, default_value = "cache", env = "CACHE_DIR")]
    cache_dir: PathBuf,

    /// Path to the ffmpeg binary
    #[arg(long, default_value = "ffmpeg", env = "FFMPEG_PATH")]
    ffmpeg_path: String,

    /// Path to the yt-dlp binary
    #[arg(long, default_value = "yt-dlp", env = "YTDLP_PATH")]
    ytdlp_path: String,
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Config {
            port: args.port,
            cache_dir: args.cache_dir,
            cache_duration: Duration::from_millis(args.cache_duration),
            ffmpeg_path: args.ffmpeg_path,
            ytdlp_path: args.ytdlp_path,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mp3ify=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config: Config = Args::parse().into();

    info!("Starting mp3ify on port {}", config.port);
    info!(
        "Cache: {} (entries expire after {:?})",
        config.cache_dir.display(),
        config.cache_duration
    );

    let cache = Arc::new(CacheStore::new(config.cache_dir.clone()));
    cache
        .ensure_directory()
        .await
        .context("Failed to initialize cache directory")?;

    let _sweeper = spawn_sweeper(Arc::clone(&cache), config.cache_duration);

    let state = AppState {
        resolver: Arc::new(YtDlpResolver::new(config.ytdlp_path.clone())),
        cache,
        pipeline: Arc::new(TranscodePipeline::new(config.ffmpeg_path.clone())),
    };

    let app = api::create_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
