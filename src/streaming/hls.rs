//! HLS route handlers.
//!
//! Serves the event playlist and the lazily transcoded segments. A chunk
//! request blocks until the segment is produced or the wait is abandoned;
//! only the calling handler suspends, never the service.

use axum::{
    body::Body,
    extract::{ConnectInfo, Path, State},
    http::{header, StatusCode},
    response::Response,
};
use std::net::SocketAddr;

use crate::server::AppContext;

/// Serve the playlist for a registered (file, audio-track) pair.
pub async fn playlist(
    State(ctx): State<AppContext>,
    Path((file_id, audio_track)): Path<(String, String)>,
) -> Result<Response, StatusCode> {
    let track: u32 = audio_track.parse().map_err(|_| StatusCode::NOT_FOUND)?;
    let controller = ctx
        .registry
        .get(&file_id, track)
        .ok_or(StatusCode::NOT_FOUND)?;

    let manifest = controller.build_manifest(&format!("/{file_id}/{track}/chunk/"));

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "vnd.apple.mpegURL")
        .body(Body::from(manifest))
        .unwrap())
}

/// Serve one transcoded segment, producing it on demand.
pub async fn chunk(
    State(ctx): State<AppContext>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path((file_id, audio_track, chunk_name)): Path<(String, String, String)>,
) -> Result<Response, StatusCode> {
    let track: u32 = audio_track.parse().map_err(|_| StatusCode::NOT_FOUND)?;
    let controller = ctx
        .registry
        .get(&file_id, track)
        .ok_or(StatusCode::NOT_FOUND)?;

    let index: usize = chunk_name
        .strip_suffix(".ts")
        .and_then(|name| name.parse().ok())
        .ok_or(StatusCode::BAD_REQUEST)?;

    // Diagnostic identity; requests from one address share their demand.
    let client = addr.ip().to_string();

    let bytes = controller
        .request_segment(&client, index)
        .await
        .ok_or(StatusCode::BAD_REQUEST)?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/MP2T")
        .header(header::CONTENT_LENGTH, bytes.len().to_string())
        .body(Body::from(bytes))
        .unwrap())
}
