//! REST API for the conversion service
//!
//! Four entry points: a direct-URL conversion route where the video URL is
//! the full remainder of the request path, plus JSON endpoints for
//! validation, metadata lookup, and conversion.

pub mod handlers;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::cache::CacheStore;
use crate::pipeline::TranscodePipeline;
use crate::resolver::AudioResolver;

/// Shared application context passed to all handlers
#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<dyn AudioResolver>,
    pub cache: Arc<CacheStore>,
    pub pipeline: Arc<TranscodePipeline>,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/validate", post(handlers::validate))
        .route("/api/info", post(handlers::info))
        .route("/api/convert", post(handlers::convert))
        // Catch-all: the remainder of the path (plus query string) is the
        // video URL itself
        .route("/*url", get(handlers::convert_path))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
