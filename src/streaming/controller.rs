//! Per-(file, audio-track) segment controller.
//!
//! Owns the segment table, the demand bookkeeping, the active producer set,
//! and the per-chunk wait handles for one source file and audio track. All
//! state lives behind a single mutex that is never held across an await, so
//! producer callbacks and request handlers cannot race on a slot and no two
//! reconciliations run concurrently.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::StreamingConfig;

use super::demand::DemandTracker;
use super::producer::{self, ProducerHandle, ProducerId};
use super::scheduler;
use super::table::{ClaimResult, SegmentEntry, SegmentTable};

/// What the controller tells a producer after a batch of byte ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOutcome {
    Continue,
    /// The producer ran into a slot it does not own (or the table's end) and
    /// must terminate without registering further ranges.
    Stop,
}

struct Inner {
    table: SegmentTable,
    demand: DemandTracker,
    producers: Vec<ProducerHandle>,
    /// Lazily created, broadcast once when the slot fills, then discarded.
    waits: HashMap<usize, Arc<Notify>>,
    /// Retained for the controller's lifetime so chunks written by retired
    /// producers stay readable.
    output_files: HashMap<ProducerId, PathBuf>,
    next_producer: ProducerId,
    closed: bool,
}

impl Inner {
    fn producer_mut(&mut self, id: ProducerId) -> Option<&mut ProducerHandle> {
        self.producers.iter_mut().find(|p| p.id == id)
    }
}

/// On-demand segment production and delivery for one (file, audio-track)
/// pair. Created on first registration, torn down via [`close`] when the
/// owning file is discarded.
///
/// [`close`]: SegmentController::close
pub struct SegmentController {
    file_id: String,
    source: PathBuf,
    audio_track: u32,
    config: StreamingConfig,
    ffmpeg: PathBuf,
    inner: Mutex<Inner>,
}

impl SegmentController {
    pub fn new(
        file_id: String,
        source: PathBuf,
        duration_secs: f64,
        audio_track: u32,
        config: StreamingConfig,
        ffmpeg: PathBuf,
    ) -> Arc<Self> {
        let chunk_count = (duration_secs / config.chunk_duration_secs as f64).ceil() as usize;

        Arc::new(Self {
            file_id,
            source,
            audio_track,
            config,
            ffmpeg,
            inner: Mutex::new(Inner {
                table: SegmentTable::new(chunk_count),
                demand: DemandTracker::new(),
                producers: Vec::new(),
                waits: HashMap::new(),
                output_files: HashMap::new(),
                next_producer: 0,
                closed: false,
            }),
        })
    }

    pub fn chunk_count(&self) -> usize {
        self.inner.lock().table.len()
    }

    pub fn producer_count(&self) -> usize {
        self.inner.lock().producers.len()
    }

    pub fn is_chunk_ready(&self, index: usize) -> bool {
        self.inner.lock().table.is_filled(index)
    }

    pub(super) fn source(&self) -> &Path {
        &self.source
    }

    pub(super) fn audio_track(&self) -> u32 {
        self.audio_track
    }

    pub(super) fn ffmpeg(&self) -> &Path {
        &self.ffmpeg
    }

    pub(super) fn chunk_duration_secs(&self) -> u64 {
        self.config.chunk_duration_secs
    }

    pub(super) fn mtime_delay_secs(&self) -> u64 {
        self.config.mtime_delay_secs
    }

    fn idle_grace(&self) -> Duration {
        Duration::from_secs(self.config.idle_grace_secs)
    }

    /// Register demand for a chunk and suspend until it is produced.
    ///
    /// Returns the chunk's bytes, or `None` when the wait was cancelled
    /// (explicitly, by the request being dropped, or by controller
    /// tear-down). Cancellation always removes the caller's demand.
    pub async fn request_segment(self: &Arc<Self>, client: &str, index: usize) -> Option<Bytes> {
        // Resolve under the lock, but never hold the guard across the await
        // below: the guard is confined to this block and dropped at its end.
        enum Resolved {
            Ready(SegmentEntry, Option<PathBuf>),
            Wait(Arc<Notify>),
        }

        let resolved = {
            let mut inner = self.inner.lock();

            if inner.closed || index >= inner.table.len() {
                return None;
            }

            if let Some(entry) = inner.table.get(index) {
                let path = inner.output_files.get(&entry.producer).cloned();
                Resolved::Ready(entry, path)
            } else {
                tracing::info!(client, chunk = index, file = %self.file_id, "waiting for chunk");

                inner.demand.add(client, index);
                let wait = Arc::clone(
                    inner
                        .waits
                        .entry(index)
                        .or_insert_with(|| Arc::new(Notify::new())),
                );
                self.reconcile_locked(&mut inner);
                Resolved::Wait(wait)
            }
        };

        let wait = match resolved {
            Resolved::Ready(entry, path) => return self.read_entry(entry, path).await,
            Resolved::Wait(wait) => wait,
        };

        // Removes the demand again if this future is dropped mid-wait
        // (client disconnect) or the wait ends without the slot filling.
        let mut guard = DemandGuard {
            ctrl: Arc::clone(self),
            client: client.to_string(),
            index,
            armed: true,
        };

        let (entry, path) = loop {
            let notified = wait.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let inner = self.inner.lock();
                if let Some(entry) = inner.table.get(index) {
                    break (entry, inner.output_files.get(&entry.producer).cloned());
                }
                if inner.closed || !inner.demand.contains(client, index) {
                    // Torn down, or cancelled via cancel_segment.
                    return None;
                }
            }

            notified.await;
        };

        guard.armed = false;
        self.read_entry(entry, path).await
    }

    /// Withdraw a client's interest in a chunk and release its pending wait.
    pub fn cancel_segment(self: &Arc<Self>, client: &str, index: usize) {
        let mut inner = self.inner.lock();

        tracing::info!(client, chunk = index, file = %self.file_id, "cancelling chunk request");

        inner.demand.remove(client, index);
        if let Some(wait) = inner.waits.get(&index) {
            // Waiters re-check their own demand; only the cancelled client
            // stops waiting.
            wait.notify_waiters();
        }
        self.reconcile_locked(&mut inner);
    }

    /// Event-style playlist listing every chunk slot, produced or not, at
    /// the nominal chunk duration.
    pub fn build_manifest(&self, path_prefix: &str) -> String {
        let chunk_duration = self.config.chunk_duration_secs;
        let inner = self.inner.lock();

        let mut playlist = format!(
            "#EXTM3U\n\
             #EXT-X-VERSION:3\n\
             #EXT-X-TARGETDURATION:{chunk_duration}\n\
             #EXT-X-MEDIA-SEQUENCE:0\n\
             #EXT-X-PLAYLIST-TYPE:EVENT\n"
        );

        for index in 0..inner.table.len() {
            playlist.push_str(&format!(
                "#EXTINF:{chunk_duration},\n{path_prefix}{index}.ts\n#EXT-X-DISCONTINUITY\n"
            ));
        }

        playlist.push_str("#EXT-X-ENDLIST\n");
        playlist
    }

    /// Tear down: retire every producer and release every waiter. The
    /// segment table is dropped with the controller; nothing persists.
    pub fn close(&self) {
        let mut inner = self.inner.lock();

        tracing::info!(file = %self.file_id, track = self.audio_track, "closing controller");

        inner.closed = true;
        inner.demand.clear();

        for producer in &mut inner.producers {
            producer.retiring = true;
            producer.stop.cancel();
        }

        for (_, wait) in inner.waits.drain() {
            wait.notify_waiters();
        }
    }

    /// Claim one table slot per byte range, starting at the producer's
    /// cursor. Called by the producer task after parsing its playlist.
    pub(super) fn apply_ranges(
        self: &Arc<Self>,
        id: ProducerId,
        ranges: &[(u64, u64)],
    ) -> RangeOutcome {
        let mut inner = self.inner.lock();

        if inner.closed {
            return RangeOutcome::Stop;
        }

        let Some(mut cursor) = inner.producer_mut(id).map(|p| p.cursor) else {
            return RangeOutcome::Stop;
        };

        let mut outcome = RangeOutcome::Continue;

        for &(offset, length) in ranges {
            let entry = SegmentEntry {
                producer: id,
                offset,
                length,
            };

            match inner.table.claim(cursor, entry) {
                ClaimResult::Claimed => {
                    inner.demand.remove_all(cursor);
                    if let Some(wait) = inner.waits.remove(&cursor) {
                        wait.notify_waiters();
                    }
                    cursor += 1;
                }
                ClaimResult::Conflict => {
                    // Another producer owns this region; let it win.
                    tracing::info!(
                        producer = id,
                        chunk = cursor,
                        "chunk already produced, dropping producer"
                    );
                    outcome = RangeOutcome::Stop;
                    break;
                }
                ClaimResult::OutOfRange => {
                    tracing::debug!(producer = id, chunk = cursor, "ran past the last chunk");
                    outcome = RangeOutcome::Stop;
                    break;
                }
            }
        }

        if let Some(producer) = inner.producer_mut(id) {
            producer.cursor = cursor;
            if outcome == RangeOutcome::Stop {
                producer.retiring = true;
            }
        }

        tracing::debug!(file = %self.file_id, "chunks: {}", inner.table.occupancy());
        self.reconcile_locked(&mut inner);
        outcome
    }

    /// Remove a retired producer's record after its process has been reaped,
    /// and reconcile so a target deferred by the producer cap can start.
    pub(super) fn finish_producer(self: &Arc<Self>, id: ProducerId) {
        let mut inner = self.inner.lock();
        inner.producers.retain(|p| p.id != id);
        self.reconcile_locked(&mut inner);
    }

    /// Remove the record of a producer that exited on its own.
    ///
    /// Deliberately does not reconcile: a transcoder failure is never
    /// retried, so the gap it left stays empty until the next demand
    /// mutation triggers a fresh producer.
    pub(super) fn producer_exited(&self, id: ProducerId) {
        let mut inner = self.inner.lock();
        inner.producers.retain(|p| p.id != id);
    }

    pub(super) fn reconcile(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        self.reconcile_locked(&mut inner);
    }

    /// Single reconciliation entry point, always invoked under the state
    /// lock after a demand or producer change.
    fn reconcile_locked(self: &Arc<Self>, inner: &mut Inner) {
        if inner.closed {
            return;
        }

        let views: Vec<_> = inner.producers.iter().map(|p| p.view()).collect();
        let plan = scheduler::plan(
            &inner.demand.indices(),
            &views,
            Instant::now(),
            self.idle_grace(),
            self.config.max_producers,
        );

        for id in plan.mark_active {
            if let Some(producer) = inner.producer_mut(id) {
                producer.idle_since = None;
            }
        }

        for id in plan.mark_idle {
            if let Some(producer) = inner.producer_mut(id) {
                tracing::info!(producer = id, "producer idle, standing by");
                producer.idle_since = Some(Instant::now());

                // Check back at the grace deadline so retirement does not
                // depend on unrelated traffic arriving.
                let ctrl = Arc::clone(self);
                let recheck = self.idle_grace() + Duration::from_millis(100);
                tokio::spawn(async move {
                    tokio::time::sleep(recheck).await;
                    ctrl.reconcile();
                });
            }
        }

        for id in plan.retire {
            if let Some(producer) = inner.producer_mut(id) {
                tracing::info!(producer = id, "retiring idle producer");
                producer.retiring = true;
                producer.stop.cancel();
            }
        }

        for index in plan.start {
            self.start_producer(inner, index);
        }
    }

    fn start_producer(self: &Arc<Self>, inner: &mut Inner, start_index: usize) {
        let id = inner.next_producer;
        inner.next_producer += 1;

        let stem = uuid::Uuid::new_v4().to_string();
        let playlist_path = std::env::temp_dir().join(format!("{stem}.m3u8"));
        let media_path = std::env::temp_dir().join(format!("{stem}.ts"));
        let stop = CancellationToken::new();

        tracing::info!(
            producer = id,
            chunk = start_index,
            file = %self.file_id,
            "starting transcode to {}",
            media_path.display()
        );

        inner.output_files.insert(id, media_path);
        inner.producers.push(ProducerHandle {
            id,
            cursor: start_index,
            idle_since: None,
            retiring: false,
            stop: stop.clone(),
        });

        tokio::spawn(producer::run(
            Arc::clone(self),
            id,
            start_index,
            stop,
            playlist_path,
        ));
    }

    async fn read_entry(&self, entry: SegmentEntry, path: Option<PathBuf>) -> Option<Bytes> {
        let Some(path) = path else {
            tracing::warn!(producer = entry.producer, "no output file for producer");
            return None;
        };

        match read_range(&path, entry.offset, entry.length).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::warn!(
                    "failed to read {} bytes at {} from {}: {}",
                    entry.length,
                    entry.offset,
                    path.display(),
                    e
                );
                None
            }
        }
    }
}

async fn read_range(path: &Path, offset: u64, length: u64) -> std::io::Result<Bytes> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;

    let mut buf = vec![0u8; length as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf.into())
}

struct DemandGuard {
    ctrl: Arc<SegmentController>,
    client: String,
    index: usize,
    armed: bool,
}

impl Drop for DemandGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let mut inner = self.ctrl.inner.lock();
        inner.demand.remove(&self.client, self.index);
        self.ctrl.reconcile_locked(&mut inner);
    }
}

#[cfg(test)]
impl SegmentController {
    /// Claim a slot directly, standing in for a producer's parsing step.
    pub(crate) fn test_fill(
        &self,
        index: usize,
        producer: ProducerId,
        path: PathBuf,
        offset: u64,
        length: u64,
    ) {
        let mut inner = self.inner.lock();
        inner.output_files.insert(producer, path);
        inner.table.claim(
            index,
            SegmentEntry {
                producer,
                offset,
                length,
            },
        );
        inner.demand.remove_all(index);
        if let Some(wait) = inner.waits.remove(&index) {
            wait.notify_waiters();
        }
    }
}
