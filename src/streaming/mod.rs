//! On-demand HLS streaming engine.
//!
//! Media files are presented as event-style HLS playlists whose segments
//! are transcoded lazily: a segment request registers demand, the scheduler
//! starts or reuses a transcoding producer near that playback position, and
//! the handler blocks until the segment's byte range lands in the segment
//! table. In-flight transcodes are shared between clients watching the same
//! region of the same file.
//!
//! # Routes
//!
//! - `GET /{file_id}/{audio_track}/playlist.m3u8` - event playlist
//! - `GET /{file_id}/{audio_track}/chunk/{index}.ts` - transcoded segment

mod controller;
mod demand;
mod hls;
mod producer;
mod registry;
mod scheduler;
mod table;

pub use controller::SegmentController;
pub use registry::{manifest_url, StreamRegistry};

use axum::{routing::get, Router};

use crate::server::AppContext;

/// Create the streaming router.
pub fn router() -> Router<AppContext> {
    Router::new()
        .route("/:file_id/:audio_track/playlist.m3u8", get(hls::playlist))
        .route("/:file_id/:audio_track/chunk/:chunk_name", get(hls::chunk))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn router_creation() {
        let _router: Router<AppContext> = router();
    }
}
