use axum::{routing::get, routing::post, Router};
use tower_http::decompression::RequestDecompressionLayer;
use tower_http::services::ServeDir;

use super::services::{get_job, health, submit_job};
use super::state::AppState;

/// Build the HTTP surface: ingestion, status, health, and the artifact
/// files the callback envelopes point at.
pub fn router(state: AppState) -> Router {
    let files = ServeDir::new(&state.config.server.save_dir);

    Router::new()
        .route("/jobs", post(submit_job))
        .route("/jobs/{job_id}", get(get_job))
        .route("/health", get(health))
        .nest_service("/files", files)
        .with_state(state)
        // Automatically decompress gzip/deflate/brotli request bodies
        .layer(RequestDecompressionLayer::new())
}
