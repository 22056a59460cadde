//! HTTP request handlers
//!
//! Thin orchestration over the resolver, pipeline, and delivery stage. The
//! conversion handlers own the job lifecycle: if the client disconnects
//! before delivery, axum drops the handler future, which drops the
//! `PipelineHandle` and tears the job down (encoder killed, stream aborted,
//! partial file removed).

use std::time::Duration;

use axum::extract::{OriginalUri, State};
use axum::response::Response;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::api::AppState;
use crate::cache::sanitize_title;
use crate::delivery;
use crate::error::{Error, Result};
use crate::pipeline::{EncodeOptions, PipelineEvent};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct UrlRequest {
    url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    module: String,
    version: String,
}

#[derive(Debug, Serialize)]
pub struct ValidateResponse {
    valid: bool,
}

#[derive(Debug, Serialize)]
pub struct InfoResponse {
    title: String,
    duration: Option<f64>,
    author: Option<String>,
    thumbnail: Option<String>,
}

fn require_url(req: UrlRequest) -> Result<String> {
    match req.url {
        Some(url) if !url.is_empty() => Ok(url),
        _ => Err(Error::BadRequest("URL is required".to_string())),
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /health - Health check endpoint
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        module: "mp3ify".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// POST /api/validate - syntactic URL check, no side effects
pub async fn validate(
    State(ctx): State<AppState>,
    Json(req): Json<UrlRequest>,
) -> Result<Json<ValidateResponse>> {
    let url = require_url(req)?;
    Ok(Json(ValidateResponse {
        valid: ctx.resolver.validate(&url),
    }))
}

/// POST /api/info - read-only metadata snapshot, no pipeline invocation
pub async fn info(
    State(ctx): State<AppState>,
    Json(req): Json<UrlRequest>,
) -> Result<Json<InfoResponse>> {
    let url = require_url(req)?;
    if !ctx.resolver.validate(&url) {
        return Err(Error::BadRequest("Invalid video URL".to_string()));
    }
    let meta = ctx.resolver.fetch_metadata(&url).await?;
    Ok(Json(InfoResponse {
        title: meta.title,
        duration: meta.duration_seconds,
        author: meta.author,
        thumbnail: meta.thumbnail,
    }))
}

/// POST /api/convert - convert and stream back the MP3
pub async fn convert(State(ctx): State<AppState>, Json(req): Json<UrlRequest>) -> Result<Response> {
    let url = require_url(req)?;
    run_conversion(ctx, url).await
}

/// GET /{url} - direct conversion; the video URL is everything after the
/// leading slash, including its own query string.
pub async fn convert_path(
    State(ctx): State<AppState>,
    OriginalUri(uri): OriginalUri,
) -> Result<Response> {
    let url = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("")
        .trim_start_matches('/')
        .to_string();
    if url.is_empty() {
        return Err(Error::BadRequest("URL is required".to_string()));
    }
    run_conversion(ctx, url).await
}

/// Full conversion flow: validate, resolve, transcode, deliver.
async fn run_conversion(ctx: AppState, url: String) -> Result<Response> {
    if !ctx.resolver.validate(&url) {
        return Err(Error::BadRequest("Invalid video URL".to_string()));
    }

    let meta = ctx.resolver.fetch_metadata(&url).await?;
    let title = sanitize_title(&meta.title);
    let claim = ctx.cache.claim(&meta.title);
    info!("Converting {} -> {}", url, claim.path().display());

    let stream = ctx.resolver.open_audio_stream(&url).await?;
    let opts = EncodeOptions {
        duration_hint: meta
            .duration_seconds
            .filter(|d| d.is_finite() && *d > 0.0)
            .map(Duration::from_secs_f64),
        ..EncodeOptions::default()
    };
    let mut handle = ctx
        .pipeline
        .start(stream, claim.path().to_path_buf(), opts);

    while let Some(event) = handle.next_event().await {
        match event {
            PipelineEvent::Started => debug!("Encoder started for {}", url),
            PipelineEvent::Progress(pct) => debug!("Processing {}: {:.1}% done", url, pct),
            PipelineEvent::Completed => {
                return delivery::deliver(claim, &format!("{}.mp3", title)).await;
            }
            PipelineEvent::Failed(e) => {
                error!("Conversion failed for {}: {}", url, e);
                return Err(e);
            }
        }
    }

    // Channel closed without a terminal event: the pipeline task is gone
    Err(Error::Encode("Pipeline ended unexpectedly".to_string()))
}
