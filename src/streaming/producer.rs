//! Transcoding producer.
//!
//! A producer owns one external ffmpeg invocation transcoding the source
//! from a given start chunk onward into a single-file HLS output. It reads
//! the machine-readable progress stream from stdout and, once the companion
//! playlist has settled, registers each newly appended byte range with the
//! controller. The OS process is always reaped before the producer's record
//! is released, on every exit path.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant, SystemTime};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use super::controller::{RangeOutcome, SegmentController};
use super::scheduler::ProducerView;
use std::sync::Arc;

pub type ProducerId = u64;

/// Controller-side record of an active producer.
///
/// The OS process itself is owned by the driving task, not the record; the
/// task removes the record only after the process has been waited on.
#[derive(Debug)]
pub struct ProducerHandle {
    pub id: ProducerId,
    /// Next chunk index this producer will claim.
    pub cursor: usize,
    pub idle_since: Option<Instant>,
    pub retiring: bool,
    pub stop: CancellationToken,
}

impl ProducerHandle {
    pub fn view(&self) -> ProducerView {
        ProducerView {
            id: self.id,
            cursor: self.cursor,
            idle_since: self.idle_since,
            retiring: self.retiring,
        }
    }
}

/// Fixed transcoding profile, segmented into `chunk_secs` pieces of a single
/// `.ts` file with an event playlist alongside.
pub fn transcode_args(
    source: &Path,
    audio_track: u32,
    start_secs: u64,
    chunk_secs: u64,
    playlist: &Path,
) -> Vec<String> {
    vec![
        "-ss".into(),
        start_secs.to_string(),
        "-i".into(),
        source.to_string_lossy().into_owned(),
        "-map".into(),
        "0:v:0".into(),
        "-map".into(),
        format!("0:{}", audio_track),
        "-c:v".into(),
        "libx264".into(),
        "-crf".into(),
        "21".into(),
        "-preset".into(),
        "veryfast".into(),
        "-g".into(),
        "25".into(),
        "-sc_threshold".into(),
        "0".into(),
        "-c:a".into(),
        "aac".into(),
        "-b:a".into(),
        "128k".into(),
        "-ac".into(),
        "2".into(),
        "-copyts".into(),
        "-f".into(),
        "hls".into(),
        "-hls_time".into(),
        chunk_secs.to_string(),
        "-hls_playlist_type".into(),
        "event".into(),
        "-hls_flags".into(),
        "single_file".into(),
        "-progress".into(),
        "pipe:1".into(),
        "-y".into(),
        playlist.to_string_lossy().into_owned(),
    ]
}

/// Split one `key=value` progress line.
pub fn parse_progress_line(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.trim().split_once('=')?;
    Some((key, value))
}

/// Extract `(offset, length)` pairs from every `#EXT-X-BYTERANGE:<n>@<o>`
/// line of a single-file HLS playlist, in order of appearance.
pub fn parse_byte_ranges(playlist: &str) -> Vec<(u64, u64)> {
    const TAG: &str = "#EXT-X-BYTERANGE:";

    playlist
        .lines()
        .filter_map(|line| {
            let range = line.strip_prefix(TAG)?;
            let (length, offset) = range.trim().split_once('@')?;
            Some((offset.parse().ok()?, length.parse().ok()?))
        })
        .collect()
}

/// Debounce for the transcoder's output playlist.
///
/// The playlist is only parsed once its mtime has stayed unchanged for the
/// configured delay, so a manifest mid-write is never read. Also remembers
/// how many byte-range entries earlier reads already consumed.
#[derive(Debug)]
pub struct ManifestWatch {
    delay: Duration,
    last_mtime: Option<SystemTime>,
    stable_since: Option<Instant>,
    entries_read: usize,
}

impl ManifestWatch {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            last_mtime: None,
            stable_since: None,
            entries_read: 0,
        }
    }

    /// Record an observation of the playlist's mtime; true when the playlist
    /// has been stable long enough to read.
    pub fn observe(&mut self, mtime: SystemTime, now: Instant) -> bool {
        if self.last_mtime != Some(mtime) {
            self.last_mtime = Some(mtime);
            self.stable_since = Some(now);
            return false;
        }

        match self.stable_since {
            Some(since) => now.duration_since(since) >= self.delay,
            None => false,
        }
    }

    pub fn entries_read(&self) -> usize {
        self.entries_read
    }

    pub fn advance(&mut self, count: usize) {
        self.entries_read += count;
    }
}

/// Drive one transcoding process to completion or termination.
///
/// Spawned by the controller with the producer's record already registered;
/// this task is the only owner of the child process and removes the record
/// (after reaping) when it is done.
pub(super) async fn run(
    ctrl: Arc<SegmentController>,
    id: ProducerId,
    start_index: usize,
    stop: CancellationToken,
    playlist_path: PathBuf,
) {
    let chunk_secs = ctrl.chunk_duration_secs();
    let args = transcode_args(
        ctrl.source(),
        ctrl.audio_track(),
        start_index as u64 * chunk_secs,
        chunk_secs,
        &playlist_path,
    );

    tracing::debug!(producer = id, "transcoder args: {:?}", args);

    let mut child = match Command::new(ctrl.ffmpeg())
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            tracing::warn!(producer = id, "failed to spawn transcoder: {}", e);
            ctrl.producer_exited(id);
            return;
        }
    };

    let Some(stdout) = child.stdout.take() else {
        tracing::warn!(producer = id, "transcoder has no stdout");
        kill_and_reap(id, &mut child).await;
        ctrl.producer_exited(id);
        return;
    };

    let mut lines = BufReader::new(stdout).lines();
    let mut watch = ManifestWatch::new(Duration::from_secs(ctrl.mtime_delay_secs()));
    let mut out_time_us: u64 = 0;
    let gate_us = chunk_secs * 1_500_000; // 1.5 chunks produced before reading

    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                tracing::info!(producer = id, "terminating transcoder");
                kill_and_reap(id, &mut child).await;
                ctrl.finish_producer(id);
                return;
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    // EOF or broken pipe: the process is exiting.
                    Ok(None) | Err(_) => break,
                };

                let Some((key, value)) = parse_progress_line(&line) else {
                    continue;
                };

                if key == "out_time_us" {
                    out_time_us = value.parse().unwrap_or(out_time_us);
                }
                if key != "progress" || out_time_us < gate_us {
                    continue;
                }

                if !collect_ranges(&ctrl, id, &playlist_path, &mut watch).await {
                    kill_and_reap(id, &mut child).await;
                    ctrl.finish_producer(id);
                    return;
                }
            }
        }
    }

    match child.wait().await {
        Ok(status) if status.success() => {
            tracing::info!(producer = id, "transcoder finished");
        }
        Ok(status) => {
            // No retry; the unfilled gap stays until new demand covers it.
            tracing::warn!(producer = id, "transcoder exited with {}", status);
        }
        Err(e) => {
            tracing::warn!(producer = id, "failed to reap transcoder: {}", e);
        }
    }

    ctrl.producer_exited(id);
}

/// Check the playlist debounce and hand any newly appended byte ranges to
/// the controller. Returns false when the producer must stop (its next slot
/// is already owned, or the controller is gone).
async fn collect_ranges(
    ctrl: &Arc<SegmentController>,
    id: ProducerId,
    playlist_path: &Path,
    watch: &mut ManifestWatch,
) -> bool {
    let mtime = match tokio::fs::metadata(playlist_path).await {
        Ok(meta) => match meta.modified() {
            Ok(mtime) => mtime,
            Err(_) => return true,
        },
        Err(_) => {
            tracing::debug!(producer = id, "playlist not written yet");
            return true;
        }
    };

    if !watch.observe(mtime, Instant::now()) {
        return true;
    }

    let content = match tokio::fs::read_to_string(playlist_path).await {
        Ok(content) => content,
        Err(e) => {
            tracing::warn!(producer = id, "failed to read playlist: {}", e);
            return true;
        }
    };

    let ranges = parse_byte_ranges(&content);
    if ranges.len() <= watch.entries_read() {
        return true;
    }

    let new = ranges[watch.entries_read()..].to_vec();
    watch.advance(new.len());

    tracing::info!(producer = id, "registering {} new chunks", new.len());
    matches!(ctrl.apply_ranges(id, &new), RangeOutcome::Continue)
}

async fn kill_and_reap(id: ProducerId, child: &mut Child) {
    // kill() waits for the process, so the record never outlives a zombie.
    if let Err(e) = child.kill().await {
        tracing::warn!(producer = id, "failed to kill transcoder: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_lines_split_on_first_equals() {
        assert_eq!(
            parse_progress_line("out_time_us=30464578"),
            Some(("out_time_us", "30464578"))
        );
        assert_eq!(parse_progress_line("speed=5.02x"), Some(("speed", "5.02x")));
        assert_eq!(parse_progress_line("not a progress line"), None);
    }

    #[test]
    fn byte_ranges_parse_in_order() {
        let playlist = "\
#EXTM3U
#EXT-X-VERSION:3
#EXT-X-TARGETDURATION:5
#EXTINF:5.0,
#EXT-X-BYTERANGE:1000@0
out.ts
#EXTINF:5.0,
#EXT-X-BYTERANGE:2500@1000
out.ts
";
        assert_eq!(parse_byte_ranges(playlist), [(0, 1000), (1000, 2500)]);
    }

    #[test]
    fn malformed_byte_ranges_are_skipped() {
        let playlist = "#EXT-X-BYTERANGE:oops\n#EXT-X-BYTERANGE:10@20\n";
        assert_eq!(parse_byte_ranges(playlist), [(20, 10)]);
    }

    #[test]
    fn manifest_watch_waits_for_stability() {
        let mut watch = ManifestWatch::new(Duration::from_secs(10));
        let t0 = Instant::now();
        let mtime = SystemTime::UNIX_EPOCH;

        // First sighting records the change.
        assert!(!watch.observe(mtime, t0));
        // Still inside the delay window.
        assert!(!watch.observe(mtime, t0 + Duration::from_secs(4)));
        // Stable long enough.
        assert!(watch.observe(mtime, t0 + Duration::from_secs(10)));
    }

    #[test]
    fn manifest_watch_resets_on_modification() {
        let mut watch = ManifestWatch::new(Duration::from_secs(10));
        let t0 = Instant::now();

        assert!(!watch.observe(SystemTime::UNIX_EPOCH, t0));
        // The file changed again: the clock restarts.
        let later = SystemTime::UNIX_EPOCH + Duration::from_secs(5);
        assert!(!watch.observe(later, t0 + Duration::from_secs(9)));
        assert!(!watch.observe(later, t0 + Duration::from_secs(18)));
        assert!(watch.observe(later, t0 + Duration::from_secs(19)));
    }

    #[test]
    fn manifest_watch_zero_delay_reads_on_second_sighting() {
        let mut watch = ManifestWatch::new(Duration::ZERO);
        let t0 = Instant::now();
        let mtime = SystemTime::UNIX_EPOCH;

        assert!(!watch.observe(mtime, t0));
        assert!(watch.observe(mtime, t0));
    }

    #[test]
    fn transcode_args_select_streams_and_offset() {
        let args = transcode_args(
            Path::new("/media/movie.mkv"),
            2,
            30,
            5,
            Path::new("/tmp/out.m3u8"),
        );

        let find = |flag: &str| {
            args.iter()
                .position(|a| a == flag)
                .map(|i| args[i + 1].clone())
                .unwrap()
        };

        assert_eq!(find("-ss"), "30");
        assert_eq!(find("-hls_time"), "5");
        assert_eq!(find("-f"), "hls");
        assert!(args.windows(2).any(|w| w == ["-map", "0:2"]));
        assert!(args.windows(2).any(|w| w == ["-map", "0:v:0"]));
        assert_eq!(args.last().unwrap(), "/tmp/out.m3u8");
    }
}
