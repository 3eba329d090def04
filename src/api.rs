// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! HTTP API — runs alongside the recording process.
//!
//! Endpoints:
//!   GET  /api/status                       → system status + storage usage (JSON)
//!   GET  /api/streams                      → per-stream supervisor state (JSON)
//!   GET  /api/recordings?stream=cam1       → recording list (JSON)
//!   POST /api/streams/{name}/start         → start supervisor
//!   POST /api/streams/{name}/stop          → stop supervisor
//!   POST /api/streams/{name}/restart       → restart supervisor
//!   GET  /hls/{stream}/index.m3u8          → live playlist (consistent snapshot)
//!   GET  /hls/{stream}/{fragment}          → fragment file

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::error::NvrError;
use crate::manager::{StreamManager, StreamStatusView};
use crate::storage::{recordings, usage};

/// Shared state passed to all handlers.
pub struct AppState {
    pub manager: Arc<StreamManager>,
}

// ──────────────── request / response types ────────────────────────────────

#[derive(Deserialize)]
pub struct RecordingsParams {
    stream: String,
}

#[derive(Serialize)]
struct StatusResponse {
    streams: Vec<StreamStatusView>,
    storage: usage::UsageReport,
    hls_storage: usage::UsageReport,
}

#[derive(Serialize)]
struct RecordingsResponse {
    stream: String,
    recordings: Vec<recordings::RecordingEntry>,
    total: usize,
}

// ──────────────── router ──────────────────────────────────────────────────

/// Build the axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/status", get(handle_status))
        .route("/api/streams", get(handle_streams))
        .route("/api/recordings", get(handle_recordings))
        .route("/api/streams/{name}/start", post(handle_start))
        .route("/api/streams/{name}/stop", post(handle_stop))
        .route("/api/streams/{name}/restart", post(handle_restart))
        // HLS endpoints
        .route("/hls/{stream}/index.m3u8", get(handle_playlist))
        .route("/hls/{stream}/{fragment}", get(handle_fragment))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn start_server(state: Arc<AppState>, port: u16) {
    let app = build_router(state);
    let addr = format!("0.0.0.0:{}", port);
    info!(port, "HTTP API listening on http://{}", addr);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "Failed to bind HTTP server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "HTTP server error");
    }
}

// ──────────────── handlers ────────────────────────────────────────────────

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let layout = state.manager.layout();
    let storage = usage::scan(layout.mp4_base()).unwrap_or_default();
    let hls_storage = usage::scan(layout.hls_base()).unwrap_or_default();
    let resp = StatusResponse {
        streams: state.manager.statuses(),
        storage,
        hls_storage,
    };
    axum::Json(resp)
}

async fn handle_streams(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(state.manager.statuses())
}

async fn handle_recordings(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RecordingsParams>,
) -> axum::response::Response {
    let dir = state.manager.layout().stream_mp4_dir(&params.stream);
    match recordings::list_recordings(&dir) {
        Ok(list) => {
            let total = list.len();
            let resp = RecordingsResponse { stream: params.stream, recordings: list, total };
            (StatusCode::OK, axum::Json(resp)).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            axum::Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

fn control_result(result: crate::error::Result<()>) -> (StatusCode, axum::Json<serde_json::Value>) {
    match result {
        Ok(()) => (StatusCode::OK, axum::Json(serde_json::json!({ "ok": true }))),
        Err(e @ NvrError::AlreadyRunning { .. }) => (
            // Starting a healthy stream is a success from the caller's view.
            StatusCode::OK,
            axum::Json(serde_json::json!({ "ok": true, "detail": e.to_string() })),
        ),
        Err(e @ NvrError::StreamNotFound { .. }) => (
            StatusCode::NOT_FOUND,
            axum::Json(serde_json::json!({ "error": e.to_string() })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            axum::Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}

async fn handle_start(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    control_result(state.manager.start(&name))
}

async fn handle_stop(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    control_result(state.manager.stop(&name))
}

async fn handle_restart(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    control_result(state.manager.restart(&name))
}

async fn handle_playlist(
    State(state): State<Arc<AppState>>,
    Path(stream): Path<String>,
) -> impl IntoResponse {
    match state.manager.playlist_snapshot(&stream) {
        Some(playlist) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")],
            playlist,
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn handle_fragment(
    State(state): State<Arc<AppState>>,
    Path((stream, fragment)): Path<(String, String)>,
) -> impl IntoResponse {
    // Path captures are single segments, but reject anything that still
    // smells like traversal.
    if fragment.contains("..") || fragment.contains('/') || !fragment.ends_with(".ts") {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let path = state.manager.layout().stream_hls_dir(&stream).join(&fragment);
    match tokio::fs::read(&path).await {
        Ok(data) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "video/mp2t")],
            data,
        )
            .into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}
