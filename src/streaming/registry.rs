//! Registry of segment controllers.
//!
//! Maps (file id, audio track) to the controller serving that pair. Entries
//! are created by the library when a playable file/track combination becomes
//! known and removed when the file disappears.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;

use crate::config::StreamingConfig;

use super::controller::SegmentController;

/// Manifest path for a registered pair, derived deterministically from the
/// key. Relative so it works behind any bind address.
pub fn manifest_url(file_id: &str, audio_track: u32) -> String {
    format!("/{file_id}/{audio_track}/playlist.m3u8")
}

pub struct StreamRegistry {
    controllers: DashMap<(String, u32), Arc<SegmentController>>,
    config: StreamingConfig,
    ffmpeg: PathBuf,
}

impl StreamRegistry {
    pub fn new(config: StreamingConfig, ffmpeg: PathBuf) -> Self {
        Self {
            controllers: DashMap::new(),
            config,
            ffmpeg,
        }
    }

    /// Make a (file, audio-track) pair streamable. Idempotent: a pair that
    /// is already registered keeps its controller and its produced segments.
    pub fn register_file(
        &self,
        file_id: &str,
        path: &Path,
        duration_secs: f64,
        audio_track: u32,
    ) -> String {
        self.controllers
            .entry((file_id.to_string(), audio_track))
            .or_insert_with(|| {
                tracing::info!(
                    file = file_id,
                    track = audio_track,
                    "registering {} for streaming",
                    path.display()
                );
                SegmentController::new(
                    file_id.to_string(),
                    path.to_path_buf(),
                    duration_secs,
                    audio_track,
                    self.config.clone(),
                    self.ffmpeg.clone(),
                )
            });

        manifest_url(file_id, audio_track)
    }

    /// Tear down every track controller of a file.
    pub fn discard_file(&self, file_id: &str) {
        self.controllers.retain(|(id, _), controller| {
            if id == file_id {
                controller.close();
                false
            } else {
                true
            }
        });
    }

    pub fn get(&self, file_id: &str, audio_track: u32) -> Option<Arc<SegmentController>> {
        self.controllers
            .get(&(file_id.to_string(), audio_track))
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> StreamRegistry {
        StreamRegistry::new(StreamingConfig::default(), PathBuf::from("ffmpeg"))
    }

    #[test]
    fn register_returns_manifest_url() {
        let registry = registry();
        let url = registry.register_file("abc", Path::new("/m/a.mkv"), 100.0, 1);
        assert_eq!(url, "/abc/1/playlist.m3u8");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn register_is_idempotent_per_track() {
        let registry = registry();
        registry.register_file("abc", Path::new("/m/a.mkv"), 100.0, 1);
        let first = registry.get("abc", 1).unwrap();

        registry.register_file("abc", Path::new("/m/a.mkv"), 100.0, 1);
        let second = registry.get("abc", 1).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        registry.register_file("abc", Path::new("/m/a.mkv"), 100.0, 2);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn discard_removes_every_track() {
        let registry = registry();
        registry.register_file("abc", Path::new("/m/a.mkv"), 100.0, 1);
        registry.register_file("abc", Path::new("/m/a.mkv"), 100.0, 2);
        registry.register_file("xyz", Path::new("/m/b.mkv"), 50.0, 1);

        registry.discard_file("abc");

        assert!(registry.get("abc", 1).is_none());
        assert!(registry.get("abc", 2).is_none());
        assert!(registry.get("xyz", 1).is_some());
    }

    #[test]
    fn unknown_pair_is_absent() {
        let registry = registry();
        registry.register_file("abc", Path::new("/m/a.mkv"), 100.0, 1);
        assert!(registry.get("abc", 2).is_none());
        assert!(registry.get("def", 1).is_none());
    }
}
