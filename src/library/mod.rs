//! Media library.
//!
//! Discovers playable files under the configured paths (an initial
//! recursive scan plus watcher events), probes them with ffprobe, and
//! registers every (file, audio-track) combination with the stream
//! registry under a stable file id. Files that disappear are discarded
//! from the registry again.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use walkdir::WalkDir;

use crate::config::{LibraryConfig, ToolsConfig};
use crate::probe;
use crate::streaming::StreamRegistry;
use crate::watch::{is_media_file, FileWatcher, WatchEvent};

/// Stable id for a media file, derived from its path.
pub fn file_id(path: &Path) -> String {
    let digest = Sha256::digest(path.to_string_lossy().as_bytes());
    hex::encode(digest)
}

pub struct MediaLibrary {
    config: LibraryConfig,
    tools: ToolsConfig,
    registry: Arc<StreamRegistry>,
    /// Known files, path → file id.
    files: Mutex<HashMap<PathBuf, String>>,
    watcher: Mutex<Option<FileWatcher>>,
}

impl MediaLibrary {
    pub fn new(
        config: LibraryConfig,
        tools: ToolsConfig,
        registry: Arc<StreamRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            tools,
            registry,
            files: Mutex::new(HashMap::new()),
            watcher: Mutex::new(None),
        })
    }

    /// Discover everything currently on disk, then keep following changes.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        tracing::info!("Starting library discovery");
        self.scan().await;
        tracing::info!("Done discovering, starting watcher");

        if self.config.watch {
            let (event_tx, mut event_rx) = mpsc::channel::<WatchEvent>(100);

            let mut watcher = FileWatcher::new(self.config.clone());
            watcher.start(event_tx)?;
            *self.watcher.lock() = Some(watcher);

            let library = Arc::clone(self);
            tokio::spawn(async move {
                while let Some(event) = event_rx.recv().await {
                    match event {
                        WatchEvent::Settled(path) => library.add_file(path).await,
                        WatchEvent::Removed(path) => library.remove_file(&path),
                    }
                }
            });
        }

        Ok(())
    }

    /// Walk the library paths and register every media file found.
    pub async fn scan(&self) {
        for root in &self.config.paths {
            for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
                if entry.file_type().is_file()
                    && is_media_file(entry.path(), &self.config.extensions)
                {
                    self.add_file(entry.into_path()).await;
                }
            }
        }
    }

    /// Probe a file and register each of its audio tracks for streaming.
    ///
    /// Files that cannot be probed, or that carry no audio at all, are
    /// skipped; discovery carries on with the rest of the library.
    pub async fn add_file(&self, path: PathBuf) {
        if self.files.lock().contains_key(&path) {
            tracing::debug!("Ignoring known file: {:?}", path);
            return;
        }

        let tools = self.tools.clone();
        let probe_path = path.clone();
        let probed =
            tokio::task::spawn_blocking(move || probe::probe_file(&tools, &probe_path)).await;

        let info = match probed {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => {
                tracing::warn!("Failed to probe {:?}: {}", path, e);
                return;
            }
            Err(e) => {
                tracing::warn!("Probe task failed for {:?}: {}", path, e);
                return;
            }
        };

        if info.audio_tracks.is_empty() {
            tracing::warn!("No audio tracks in {:?}, skipping", path);
            return;
        }

        let id = file_id(&path);
        tracing::info!("Adding file {:?} ({})", path, id);

        for track in &info.audio_tracks {
            let url =
                self.registry
                    .register_file(&id, &path, info.duration_secs, track.index);
            tracing::debug!(
                track = track.index,
                language = track.language.as_deref().unwrap_or("unknown"),
                "track available at {}",
                url
            );
        }

        self.files.lock().insert(path, id);
    }

    /// Forget a file and tear down its stream controllers.
    pub fn remove_file(&self, path: &Path) {
        let id = self.files.lock().remove(path);

        match id {
            Some(id) => {
                tracing::info!("Removing file {:?} ({})", path, id);
                self.registry.discard_file(&id);
            }
            None => tracing::debug!("Ignoring removal of unknown file: {:?}", path),
        }
    }

    pub fn file_count(&self) -> usize {
        self.files.lock().len()
    }

    pub fn stop(&self) {
        if let Some(mut watcher) = self.watcher.lock().take() {
            watcher.stop();
        }
    }
}
