//! Shared test harness for integration tests.
//!
//! Provides [`TestHarness`] which builds a [`StreamRegistry`] wired to a
//! stub transcoder script instead of real ffmpeg, plus an Axum server bound
//! to a random port for HTTP-level testing. The stub scripts speak the real
//! transcoder contract: `key=value` progress lines on stdout and a
//! single-file HLS playlist with byte-range entries on disk.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use chunkstream::config::{Config, StreamingConfig, ToolsConfig};
use chunkstream::server::{create_router, AppContext};
use chunkstream::streaming::StreamRegistry;

/// Stub transcoder: writes four 25-byte chunks and a matching playlist,
/// then keeps running until it is retired.
pub const PRODUCING_TRANSCODER: &str = r#"#!/bin/sh
for arg in "$@"; do out="$arg"; done
media="${out%.m3u8}.ts"
: > "$media"
printf '#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:5\n' > "$out"
offset=0
i=0
while [ "$i" -lt 4 ]; do
  data=$(printf 'chunk-%02d-0123456789abcdef' "$i")
  printf '%s' "$data" >> "$media"
  size=${#data}
  printf '#EXTINF:5.0,\n#EXT-X-BYTERANGE:%s@%s\nout.ts\n' "$size" "$offset" >> "$out"
  offset=$((offset + size))
  i=$((i + 1))
done
printf 'out_time_us=40000000\nprogress=continue\n'
sleep 1
printf 'out_time_us=40000000\nprogress=continue\n'
sleep 1
printf 'out_time_us=40000000\nprogress=end\n'
sleep 60
"#;

/// Stub transcoder that never produces anything.
pub const STALLED_TRANSCODER: &str = "#!/bin/sh\nsleep 60\n";

/// Stub transcoder: writes three chunks, then dies with a non-zero status.
pub const FAILING_TRANSCODER: &str = r#"#!/bin/sh
for arg in "$@"; do out="$arg"; done
media="${out%.m3u8}.ts"
: > "$media"
printf '#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:5\n' > "$out"
offset=0
i=0
while [ "$i" -lt 3 ]; do
  data=$(printf 'chunk-%02d-0123456789abcdef' "$i")
  printf '%s' "$data" >> "$media"
  size=${#data}
  printf '#EXTINF:5.0,\n#EXT-X-BYTERANGE:%s@%s\nout.ts\n' "$size" "$offset" >> "$out"
  offset=$((offset + size))
  i=$((i + 1))
done
printf 'out_time_us=40000000\nprogress=continue\n'
sleep 1
printf 'out_time_us=40000000\nprogress=continue\n'
sleep 1
exit 2
"#;

/// Stub ffprobe: reports a 20 second file with one audio stream.
pub const STUB_FFPROBE: &str = r#"#!/bin/sh
cat <<'EOF'
{
  "streams": [
    {"index": 0, "codec_name": "h264", "codec_type": "video"},
    {"index": 1, "codec_name": "aac", "codec_type": "audio",
     "tags": {"language": "eng"}}
  ],
  "format": {"duration": "20.000000"}
}
EOF
"#;

/// The payload the producing stub writes for its n-th chunk.
pub fn chunk_payload(n: usize) -> Vec<u8> {
    format!("chunk-{:02}-0123456789abcdef", n).into_bytes()
}

pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).expect("failed to write script");

    let mut perms = std::fs::metadata(&path).expect("script metadata").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("failed to chmod script");

    path
}

pub struct TestHarness {
    pub config: Config,
    pub registry: Arc<StreamRegistry>,
    /// Holds the stub scripts and any media fixtures.
    pub dir: TempDir,
}

impl TestHarness {
    /// Create a harness whose producers run the given transcoder script.
    ///
    /// The streaming config is tuned for tests: no manifest debounce and a
    /// one second idle grace so retirement paths run quickly.
    pub fn new(transcoder: &str) -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let ffmpeg = write_script(dir.path(), "ffmpeg", transcoder);

        let streaming = StreamingConfig {
            chunk_duration_secs: 5,
            mtime_delay_secs: 0,
            idle_grace_secs: 1,
            max_producers: 2,
        };

        let config = Config {
            streaming: streaming.clone(),
            tools: ToolsConfig {
                ffmpeg_path: Some(ffmpeg.clone()),
                ffprobe_path: None,
            },
            ..Config::default()
        };

        let registry = Arc::new(StreamRegistry::new(streaming, ffmpeg));

        Self {
            config,
            registry,
            dir,
        }
    }

    /// Start an Axum server on a random port and return the harness together
    /// with the bound socket address.
    pub async fn with_server(transcoder: &str) -> (Self, SocketAddr) {
        let harness = Self::new(transcoder);

        let ctx = AppContext {
            config: Arc::new(harness.config.clone()),
            registry: Arc::clone(&harness.registry),
        };
        let app = create_router(ctx);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind random port");
        let addr = listener.local_addr().expect("failed to get local addr");

        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .ok();
        });

        (harness, addr)
    }
}
