use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub library: LibraryConfig,

    #[serde(default)]
    pub streaming: StreamingConfig,

    #[serde(default)]
    pub tools: ToolsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LibraryConfig {
    /// Watch the library paths for new and removed files.
    #[serde(default = "default_true")]
    pub watch: bool,

    #[serde(default)]
    pub paths: Vec<PathBuf>,

    /// How long a file must stay unchanged before it is probed.
    #[serde(default = "default_settle_time")]
    pub settle_time_secs: u64,

    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_settle_time() -> u64 {
    30
}

fn default_extensions() -> Vec<String> {
    ["avi", "mkv", "mp4"].map(String::from).to_vec()
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            watch: true,
            paths: Vec::new(),
            settle_time_secs: default_settle_time(),
            extensions: default_extensions(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamingConfig {
    /// Duration of one output chunk in seconds.
    #[serde(default = "default_chunk_duration")]
    pub chunk_duration_secs: u64,

    /// How long a transcoder's playlist must stay unmodified before it is
    /// read (avoids parsing a manifest mid-write).
    #[serde(default = "default_mtime_delay")]
    pub mtime_delay_secs: u64,

    /// Grace period before a producer with no matching demand is retired.
    #[serde(default = "default_idle_grace")]
    pub idle_grace_secs: u64,

    /// Maximum concurrent transcoding processes per (file, track) pair.
    #[serde(default = "default_max_producers")]
    pub max_producers: usize,
}

fn default_chunk_duration() -> u64 {
    5
}

fn default_mtime_delay() -> u64 {
    10
}

fn default_idle_grace() -> u64 {
    5
}

fn default_max_producers() -> usize {
    2
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            chunk_duration_secs: default_chunk_duration(),
            mtime_delay_secs: default_mtime_delay(),
            idle_grace_secs: default_idle_grace(),
            max_producers: default_max_producers(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub ffmpeg_path: Option<PathBuf>,

    #[serde(default)]
    pub ffprobe_path: Option<PathBuf>,
}
