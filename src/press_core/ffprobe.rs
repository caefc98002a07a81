//! ffprobe adapter: container/stream metadata and the lenient integrity
//! check used before encoding and before replacing a source file.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, warn};

use crate::process_ext::run_with_timeout;

const PROBE_TIMEOUT: Duration = Duration::from_secs(60);
const DURATION_QUERY_TIMEOUT: Duration = Duration::from_secs(10);
const INTEGRITY_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Default, Serialize)]
pub struct VideoStream {
    pub width: u32,
    pub height: u32,
    pub codec: String,
    pub bit_rate: u64,
    pub fps: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AudioStream {
    pub codec: String,
    pub channels: u32,
    pub language: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SubtitleStream {
    pub codec: String,
    pub language: String,
}

/// Best-effort container metadata. Missing fields default to zero/empty;
/// only a failure to invoke ffprobe at all is surfaced as an error.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MediaInfo {
    pub format_name: String,
    pub duration_seconds: f64,
    pub bit_rate: u64,
    pub video_streams: Vec<VideoStream>,
    pub audio_streams: Vec<AudioStream>,
    pub subtitle_streams: Vec<SubtitleStream>,
}

impl MediaInfo {
    pub fn has_video(&self) -> bool {
        !self.video_streams.is_empty()
    }
}

fn parse_fps(raw: &str) -> f64 {
    if let Some((num, denom)) = raw.split_once('/') {
        let num: f64 = num.parse().unwrap_or(0.0);
        let denom: f64 = denom.parse().unwrap_or(0.0);
        if denom != 0.0 { num / denom } else { 0.0 }
    } else {
        raw.parse().unwrap_or(0.0)
    }
}

fn str_field(value: &serde_json::Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn num_field(value: &serde_json::Value, key: &str) -> u64 {
    match value.get(key) {
        Some(serde_json::Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(serde_json::Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

fn language_tag(stream: &serde_json::Value) -> String {
    stream
        .get("tags")
        .and_then(|t| t.get("language"))
        .and_then(|l| l.as_str())
        .unwrap_or("unknown")
        .to_string()
}

fn parse_streams(info: &serde_json::Value, media: &mut MediaInfo) {
    let Some(streams) = info.get("streams").and_then(|s| s.as_array()) else {
        return;
    };
    for stream in streams {
        match stream.get("codec_type").and_then(|t| t.as_str()) {
            Some("video") => media.video_streams.push(VideoStream {
                width: num_field(stream, "width") as u32,
                height: num_field(stream, "height") as u32,
                codec: str_field(stream, "codec_name"),
                bit_rate: num_field(stream, "bit_rate"),
                fps: parse_fps(
                    stream
                        .get("avg_frame_rate")
                        .and_then(|r| r.as_str())
                        .unwrap_or("0/1"),
                ),
            }),
            Some("audio") => media.audio_streams.push(AudioStream {
                codec: str_field(stream, "codec_name"),
                channels: num_field(stream, "channels") as u32,
                language: language_tag(stream),
            }),
            Some("subtitle") => media.subtitle_streams.push(SubtitleStream {
                codec: str_field(stream, "codec_name"),
                language: language_tag(stream),
            }),
            _ => {}
        }
    }
}

/// Single-value ffprobe query, used by the duration fallbacks.
fn probe_single_value(source: &Path, args: &[&str]) -> Option<f64> {
    let mut cmd = Command::new("ffprobe");
    cmd.args(["-v", "error"])
        .args(args)
        .args(["-of", "default=noprint_wrappers=1:nokey=1"])
        .arg(source);
    let output = run_with_timeout(cmd, DURATION_QUERY_TIMEOUT).ok()?;
    if !output.success() {
        return None;
    }
    output.stdout.lines().next()?.trim().parse().ok()
}

/// Probe a media file. The container duration is recovered from stream- and
/// container-level queries when the primary probe omits it.
pub fn probe(source: &Path) -> Result<MediaInfo> {
    let mut cmd = Command::new("ffprobe");
    cmd.args(["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"])
        .arg(source);
    let output = run_with_timeout(cmd, PROBE_TIMEOUT)
        .with_context(|| format!("failed to run ffprobe on {}", source.display()))?;

    let mut media = MediaInfo::default();
    if !output.success() || output.stdout.trim().is_empty() {
        warn!(path = %source.display(), "ffprobe returned no usable output");
        return Ok(media);
    }

    let Ok(info) = serde_json::from_str::<serde_json::Value>(&output.stdout) else {
        warn!(path = %source.display(), "could not parse ffprobe JSON output");
        return Ok(media);
    };

    if let Some(format) = info.get("format") {
        media.format_name = str_field(format, "format_name");
        media.duration_seconds = format
            .get("duration")
            .and_then(|d| d.as_str())
            .and_then(|d| d.parse().ok())
            .unwrap_or(0.0);
        media.bit_rate = num_field(format, "bit_rate");
    }
    parse_streams(&info, &mut media);

    if media.duration_seconds == 0.0 && media.has_video() {
        debug!(path = %source.display(), "container duration missing, trying fallbacks");
        media.duration_seconds = probe_single_value(
            source,
            &["-select_streams", "v:0", "-show_entries", "stream=duration"],
        )
        .or_else(|| probe_single_value(source, &["-show_entries", "format=duration"]))
        .unwrap_or(0.0);
    }

    Ok(media)
}

/// Lenient integrity check: the file must be non-empty and ffprobe must be
/// able to read a format section out of it. Under strict validation a probe
/// timeout or unparsable output fails the file; otherwise both are accepted
/// (some valid files only emit warnings).
pub fn verify_integrity(source: &Path, strict: bool) -> bool {
    let size = match std::fs::metadata(source) {
        Ok(meta) => meta.len(),
        Err(err) => {
            warn!(path = %source.display(), error = %err, "cannot stat file for integrity check");
            return false;
        }
    };
    if size == 0 {
        warn!(path = %source.display(), "file has zero size");
        return false;
    }

    let mut cmd = Command::new("ffprobe");
    cmd.args(["-v", "error", "-hide_banner", "-of", "json", "-show_format", "-i"])
        .arg(source);
    let output = match run_with_timeout(cmd, INTEGRITY_TIMEOUT) {
        Ok(output) => output,
        Err(err) => {
            warn!(path = %source.display(), error = %err, "failed to run integrity probe");
            return false;
        }
    };

    if output.timed_out {
        warn!(path = %source.display(), "integrity probe timed out");
        return !strict;
    }

    match serde_json::from_str::<serde_json::Value>(&output.stdout) {
        Ok(data) if data.get("format").is_some() => true,
        Ok(_) => {
            warn!(path = %source.display(), "integrity probe output has no format section");
            !strict
        }
        Err(_) => {
            if !output.status.success() {
                let tail: String = output.stderr.lines().rev().take(3).collect::<Vec<_>>().join(" | ");
                warn!(path = %source.display(), stderr = %tail, "integrity probe failed");
                return false;
            }
            !strict
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fps_parses_fractional_and_plain_rates() {
        assert!((parse_fps("30000/1001") - 29.97).abs() < 0.01);
        assert!((parse_fps("25") - 25.0).abs() < f64::EPSILON);
        assert_eq!(parse_fps("0/0"), 0.0);
        assert_eq!(parse_fps("garbage"), 0.0);
    }

    #[test]
    fn stream_parsing_fills_defaults_for_missing_fields() {
        let info: serde_json::Value = serde_json::from_str(
            r#"{
                "format": {"format_name": "matroska", "duration": "120.5", "bit_rate": "8000000"},
                "streams": [
                    {"codec_type": "video", "codec_name": "h264", "width": 1920, "height": 1080,
                     "avg_frame_rate": "24000/1001"},
                    {"codec_type": "audio", "codec_name": "aac", "channels": 6,
                     "tags": {"language": "eng"}},
                    {"codec_type": "subtitle", "codec_name": "subrip"}
                ]
            }"#,
        )
        .expect("fixture json");

        let mut media = MediaInfo::default();
        if let Some(format) = info.get("format") {
            media.format_name = str_field(format, "format_name");
            media.bit_rate = num_field(format, "bit_rate");
        }
        parse_streams(&info, &mut media);

        assert_eq!(media.format_name, "matroska");
        assert_eq!(media.bit_rate, 8_000_000);
        assert_eq!(media.video_streams.len(), 1);
        assert_eq!(media.video_streams[0].width, 1920);
        // Video stream without its own bit_rate defaults to zero.
        assert_eq!(media.video_streams[0].bit_rate, 0);
        assert_eq!(media.audio_streams[0].language, "eng");
        assert_eq!(media.subtitle_streams[0].language, "unknown");
    }

    #[test]
    fn zero_size_file_fails_integrity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("empty.mkv");
        std::fs::write(&path, b"").expect("write");
        assert!(!verify_integrity(&path, false));
    }
}
