//! mp3ify - HTTP service converting remote video URLs to MP3
//!
//! Given a video URL, resolves its best audio-only track, pipes it through
//! an external encoder, and streams the resulting MP3 back to the caller.
//! Artifacts live in an ephemeral on-disk cache reclaimed by an age-based
//! background sweep.

pub mod api;
pub mod cache;
pub mod config;
pub mod delivery;
pub mod error;
pub mod pipeline;
pub mod resolver;
