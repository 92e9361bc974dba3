//! Media file probing.
//!
//! Thin wrapper around `ffprobe` extracting the pieces the streaming engine
//! needs: container duration, the absolute index and language of every audio
//! stream, and the video codec.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::ToolsConfig;

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("failed to run ffprobe: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("ffprobe exited with {0}")]
    NonZeroExit(std::process::ExitStatus),

    #[error("failed to parse ffprobe output: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("ffprobe reported no duration")]
    MissingDuration,
}

/// One audio stream of a media file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioTrack {
    /// Absolute stream index, usable as an ffmpeg `-map 0:<n>` selector.
    pub index: u32,
    pub codec: String,
    pub language: Option<String>,
    pub title: Option<String>,
}

/// What the streaming engine needs to know about a media file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaInfo {
    pub duration_secs: f64,
    pub video_codec: Option<String>,
    pub audio_tracks: Vec<AudioTrack>,
}

/// Resolve the ffmpeg binary, preferring the configured path.
pub fn ffmpeg_path(tools: &ToolsConfig) -> PathBuf {
    tools
        .ffmpeg_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("ffmpeg"))
}

/// Resolve the ffprobe binary, preferring the configured path.
pub fn ffprobe_path(tools: &ToolsConfig) -> PathBuf {
    tools
        .ffprobe_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("ffprobe"))
}

/// Probe a media file with ffprobe.
pub fn probe_file(tools: &ToolsConfig, path: &Path) -> Result<MediaInfo, ProbeError> {
    let output = Command::new(ffprobe_path(tools))
        .arg(path)
        .args([
            "-show_entries",
            "stream=codec_name,codec_type,index:stream_tags=language,title:format=duration",
            "-print_format",
            "json",
            "-v",
            "quiet",
        ])
        .output()?;

    if !output.status.success() {
        return Err(ProbeError::NonZeroExit(output.status));
    }

    parse_probe_output(&String::from_utf8_lossy(&output.stdout))
}

/// Parse ffprobe's JSON output.
pub fn parse_probe_output(json: &str) -> Result<MediaInfo, ProbeError> {
    #[derive(Deserialize)]
    struct RawOutput {
        #[serde(default)]
        streams: Vec<RawStream>,
        format: Option<RawFormat>,
    }

    #[derive(Deserialize)]
    struct RawStream {
        index: u32,
        codec_name: Option<String>,
        codec_type: Option<String>,
        #[serde(default)]
        tags: Option<RawTags>,
    }

    #[derive(Deserialize)]
    struct RawTags {
        language: Option<String>,
        title: Option<String>,
    }

    #[derive(Deserialize)]
    struct RawFormat {
        duration: Option<String>,
    }

    let raw: RawOutput = serde_json::from_str(json)?;

    let duration_secs = raw
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.parse::<f64>().ok())
        .ok_or(ProbeError::MissingDuration)?;

    let mut video_codec = None;
    let mut audio_tracks = Vec::new();

    for stream in raw.streams {
        match stream.codec_type.as_deref() {
            Some("audio") => {
                let tags = stream.tags.unwrap_or(RawTags {
                    language: None,
                    title: None,
                });
                audio_tracks.push(AudioTrack {
                    index: stream.index,
                    codec: stream.codec_name.unwrap_or_default(),
                    language: tags.language.filter(|l| l != "und"),
                    title: tags.title,
                });
            }
            Some("video") if video_codec.is_none() => {
                video_codec = stream.codec_name;
            }
            _ => {}
        }
    }

    Ok(MediaInfo {
        duration_secs,
        video_codec,
        audio_tracks,
    })
}

/// Availability of one external tool.
#[derive(Debug, Clone)]
pub struct ToolInfo {
    pub name: String,
    pub available: bool,
    pub path: Option<PathBuf>,
    pub version: Option<String>,
}

/// Check that the external tools the server shells out to are present.
pub fn check_tools(tools: &ToolsConfig) -> Vec<ToolInfo> {
    [ffmpeg_path(tools), ffprobe_path(tools)]
        .into_iter()
        .map(|binary| check_tool(&binary))
        .collect()
}

fn check_tool(binary: &Path) -> ToolInfo {
    let name = binary
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| binary.to_string_lossy().into_owned());

    let path = which::which(binary).ok();
    let version = path.as_ref().and_then(|p| {
        let output = Command::new(p).arg("-version").output().ok()?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout.lines().next().map(str::to_string)
    });

    ToolInfo {
        name,
        available: path.is_some(),
        path,
        version,
    }
}
