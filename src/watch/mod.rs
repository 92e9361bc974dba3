pub mod settle;

pub use settle::FileSettleTracker;

use crate::config::LibraryConfig;
use anyhow::{Context, Result};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// A library-relevant filesystem change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A media file appeared (or changed) and has stopped being written to.
    Settled(PathBuf),
    /// A media file disappeared.
    Removed(PathBuf),
}

/// File watcher that monitors the library directories for media files
pub struct FileWatcher {
    config: LibraryConfig,
    watcher: Option<RecommendedWatcher>,
}

impl FileWatcher {
    pub fn new(config: LibraryConfig) -> Self {
        Self {
            config,
            watcher: None,
        }
    }

    /// Start watching, delivering settled/removed files on `events`.
    pub fn start(&mut self, events: mpsc::Sender<WatchEvent>) -> Result<()> {
        if self.config.paths.is_empty() {
            tracing::warn!("No library paths configured");
            return Ok(());
        }

        enum RawEvent {
            Changed(PathBuf),
            Removed(PathBuf),
        }

        let (raw_tx, mut raw_rx) = mpsc::channel::<RawEvent>(100);
        let extensions = self.config.extensions.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| {
                let Ok(event) = res else { return };

                let raw: fn(PathBuf) -> RawEvent = if event.kind.is_create() || event.kind.is_modify() {
                    RawEvent::Changed
                } else if event.kind.is_remove() {
                    RawEvent::Removed
                } else {
                    return;
                };

                for path in event.paths {
                    if is_media_file(&path, &extensions) {
                        let _ = raw_tx.blocking_send(raw(path));
                    }
                }
            },
            Config::default(),
        )
        .context("Failed to create file watcher")?;

        for path in &self.config.paths {
            if path.exists() {
                watcher
                    .watch(path, RecursiveMode::Recursive)
                    .with_context(|| format!("Failed to watch path: {:?}", path))?;
                tracing::info!("Watching directory: {:?}", path);
            } else {
                tracing::warn!("Library path does not exist: {:?}", path);
            }
        }

        self.watcher = Some(watcher);

        let mut settle_tracker =
            FileSettleTracker::new(Duration::from_secs(self.config.settle_time_secs));

        tokio::spawn(async move {
            let mut check_interval = tokio::time::interval(Duration::from_secs(1));
            check_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    raw = raw_rx.recv() => {
                        match raw {
                            Some(RawEvent::Changed(path)) => settle_tracker.touch(path),
                            Some(RawEvent::Removed(path)) => {
                                settle_tracker.forget(&path);
                                if events.send(WatchEvent::Removed(path)).await.is_err() {
                                    break;
                                }
                            }
                            // Watcher dropped; nothing more will arrive.
                            None => break,
                        }
                    }

                    _ = check_interval.tick() => {
                        for path in settle_tracker.take_settled(Instant::now()) {
                            tracing::info!("File settled: {:?}", path);
                            if events.send(WatchEvent::Settled(path)).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(())
    }

    /// Stop watching
    pub fn stop(&mut self) {
        self.watcher = None;
        tracing::info!("File watcher stopped");
    }
}

/// Check if a file has a media extension
pub fn is_media_file(path: &Path, extensions: &[String]) -> bool {
    if let Some(ext) = path.extension() {
        let ext_str = ext.to_string_lossy().to_lowercase();

        if extensions.is_empty() {
            let default_exts = ["avi", "mkv", "mp4"];
            return default_exts.contains(&ext_str.as_str());
        }

        return extensions.iter().any(|e| e.to_lowercase() == ext_str);
    }
    false
}
