//! Content classification and the compression settings derived from it.
//!
//! A file is labelled animation, live action or mixed from filename hints
//! plus a handful of sampled frames scored on color count and edge density
//! (animation tends to flat color fields with hard edges). The label picks
//! the quality/preset pair substituted into the encoder option template.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::press_core::config::Config;
use crate::press_core::domain::ContentKind;
use crate::press_core::ffprobe;
use crate::process_ext::run_with_timeout;

const SCENE_EXTRACT_TIMEOUT: Duration = Duration::from_secs(60);
const FRAME_EXTRACT_TIMEOUT: Duration = Duration::from_secs(10);
const FRAMES_ANALYZED: usize = 3;
/// Animation frames typically quantize to far fewer distinct colors.
const ANIMATION_COLOR_LIMIT: usize = 10_000;
/// Mean absolute luma gradient (0-1) above which edges count as "drawn".
const ANIMATION_EDGE_FLOOR: f64 = 0.05;

const FILENAME_KEYWORDS: [&str; 6] = [
    "animation",
    "animated",
    "anime",
    "cartoon",
    "pixar",
    "disney",
];

static ANIME_WORD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(anime|cartoon|animation)").expect("anime word regex"));
static RELEASE_TAG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\[\s*\d{3,4}p\s*\].*\[(BD|BluRay|Web-DL)").expect("release tag regex")
});
static QUALITY_FLAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"--quality\s+\d+").expect("quality flag regex"));
static PRESET_FLAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"--encoder-preset\s+\w+").expect("preset flag regex"));

#[derive(Debug, Clone, PartialEq)]
pub struct CompressionSettings {
    pub quality: i32,
    pub preset: String,
    pub content_type: ContentKind,
}

/// Pick quality/preset from the classifier label, or the fixed default when
/// content-aware compression is off.
pub fn select_settings(config: &Config, kind: ContentKind) -> CompressionSettings {
    if !config.compression.content_aware {
        return CompressionSettings {
            quality: 22,
            preset: "slow".to_string(),
            content_type: ContentKind::LiveAction,
        };
    }
    match kind {
        ContentKind::Animation => CompressionSettings {
            quality: config.compression.animation_quality,
            preset: "slower".to_string(),
            content_type: kind,
        },
        ContentKind::Mixed => CompressionSettings {
            quality: (config.compression.animation_quality
                + config.compression.live_action_quality)
                / 2,
            preset: "slow".to_string(),
            content_type: kind,
        },
        ContentKind::LiveAction => CompressionSettings {
            quality: config.compression.live_action_quality,
            preset: "slow".to_string(),
            content_type: kind,
        },
    }
}

/// Substitute quality and preset into the configured option string, leaving
/// every other flag untouched.
pub fn rewrite_encoder_options(options: &str, settings: &CompressionSettings) -> String {
    let with_quality = QUALITY_FLAG_RE
        .replace(options, format!("--quality {}", settings.quality).as_str())
        .into_owned();
    PRESET_FLAG_RE
        .replace(
            &with_quality,
            format!("--encoder-preset {}", settings.preset).as_str(),
        )
        .into_owned()
}

fn filename_hints_animation(file_name_lower: &str) -> bool {
    FILENAME_KEYWORDS
        .iter()
        .any(|keyword| file_name_lower.contains(keyword))
}

/// Release-pattern fallback: anime rips commonly tag resolution + source in
/// brackets and ship FLAC/VORBIS audio.
fn release_pattern_suggests_animation(file_name: &str) -> bool {
    if ANIME_WORD_RE.is_match(file_name) {
        return true;
    }
    RELEASE_TAG_RE.is_match(file_name)
        && (file_name.contains("FLAC") || file_name.contains("VORBIS"))
}

/// Per-frame animation signal: quantized color count and mean luma gradient.
fn frame_looks_animated(frame_path: &Path) -> Option<bool> {
    let image = image::open(frame_path).ok()?;

    let rgb = image.to_rgb8();
    let mut colors: HashSet<u32> = HashSet::new();
    for pixel in rgb.pixels() {
        // 5 bits per channel is enough to separate flat cel shading from
        // photographic gradients.
        let quantized = ((pixel[0] as u32 >> 3) << 10)
            | ((pixel[1] as u32 >> 3) << 5)
            | (pixel[2] as u32 >> 3);
        colors.insert(quantized);
        if colors.len() > ANIMATION_COLOR_LIMIT {
            return Some(false);
        }
    }

    let luma = image.to_luma8();
    let (width, height) = luma.dimensions();
    if width < 2 || height < 2 {
        return Some(false);
    }
    let mut gradient_sum = 0u64;
    let mut samples = 0u64;
    for y in 0..height - 1 {
        for x in 0..width - 1 {
            let here = luma.get_pixel(x, y)[0] as i64;
            let right = luma.get_pixel(x + 1, y)[0] as i64;
            let below = luma.get_pixel(x, y + 1)[0] as i64;
            gradient_sum += ((here - right).abs() + (here - below).abs()) as u64;
            samples += 2;
        }
    }
    let edge_mean = gradient_sum as f64 / samples as f64 / 255.0;

    Some(edge_mean > ANIMATION_EDGE_FLOOR)
}

fn collect_frames(frames_dir: &Path, prefix: &str) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(frames_dir) else {
        return Vec::new();
    };
    let mut frames: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(prefix) && n.ends_with(".jpg"))
        })
        .collect();
    frames.sort();
    frames
}

fn extract_frames(source: &Path, frames_dir: &Path, duration: f64) -> Vec<PathBuf> {
    // Scene-change keyframes first.
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-i")
        .arg(source)
        .args(["-vf", "select='gt(scene,0.3)'", "-vsync", "vfr", "-frames:v", "10", "-y"])
        .arg(frames_dir.join("scene_%03d.jpg"));
    drop(run_with_timeout(cmd, SCENE_EXTRACT_TIMEOUT));

    let scene_frames = collect_frames(frames_dir, "scene_");
    if scene_frames.len() >= 3 {
        debug!(count = scene_frames.len(), "extracted scene-change frames");
        return scene_frames.into_iter().take(5).collect();
    }

    // Too few scene changes detected; fall back to equally spaced samples.
    let interval = duration / 6.0;
    let mut frames = Vec::new();
    for i in 1..=5u32 {
        let frame_path = frames_dir.join(format!("frame_{i}.jpg"));
        let mut cmd = Command::new("ffmpeg");
        cmd.args(["-ss", &(interval * f64::from(i)).to_string(), "-i"])
            .arg(source)
            .args(["-vframes", "1", "-q:v", "2", "-y"])
            .arg(&frame_path);
        let ok = run_with_timeout(cmd, FRAME_EXTRACT_TIMEOUT)
            .map(|out| out.success())
            .unwrap_or(false);
        if ok
            && frame_path.exists()
            && std::fs::metadata(&frame_path).map(|m| m.len() > 0).unwrap_or(false)
        {
            frames.push(frame_path);
        }
    }
    frames
}

fn score_frames(frames: &[PathBuf]) -> Option<u32> {
    let mut animation_score = 0u32;
    let mut analyzed_any = false;
    for frame in frames.iter().take(FRAMES_ANALYZED) {
        match frame_looks_animated(frame) {
            Some(animated) => {
                analyzed_any = true;
                if animated {
                    animation_score += 1;
                }
            }
            None => debug!(frame = %frame.display(), "could not analyze frame"),
        }
    }
    analyzed_any.then_some(animation_score)
}

/// Label a file as animation, live action or mixed.
pub fn classify(config: &Config, source: &Path) -> ContentKind {
    let file_name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let duration = ffprobe::probe(source)
        .map(|info| info.duration_seconds)
        .unwrap_or(0.0);
    if duration <= 0.0 {
        warn!(path = %source.display(), "could not determine duration, assuming live action");
        return ContentKind::LiveAction;
    }

    if filename_hints_animation(&file_name.to_lowercase()) {
        info!(file_name, "detected likely animation based on filename");
        return ContentKind::Animation;
    }

    let stamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let frames_dir = Path::new(&config.temp_dir).join(format!("frames_{stamp}"));
    if let Err(err) = std::fs::create_dir_all(&frames_dir) {
        warn!(error = %err, "could not create frame sample directory, assuming live action");
        return ContentKind::LiveAction;
    }

    let kind = (|| {
        let frames = extract_frames(source, &frames_dir, duration);
        if frames.len() < 3 {
            warn!(path = %source.display(), "could not extract enough frames, assuming live action");
            return ContentKind::LiveAction;
        }

        let mut kind = match score_frames(&frames) {
            Some(score) if score >= 2 => ContentKind::Animation,
            Some(1) => ContentKind::Mixed,
            _ => ContentKind::LiveAction,
        };

        if kind == ContentKind::LiveAction && release_pattern_suggests_animation(&file_name) {
            kind = ContentKind::Animation;
        }
        kind
    })();

    // The sample directory goes away on every exit path.
    drop(std::fs::remove_dir_all(&frames_dir));

    info!(file_name, kind = kind.as_str(), "detected content type");
    kind
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};

    use super::*;

    #[test]
    fn content_aware_disabled_returns_fixed_default() {
        let mut config = Config::default();
        config.compression.content_aware = false;
        let settings = select_settings(&config, ContentKind::Animation);
        assert_eq!(settings.quality, 22);
        assert_eq!(settings.preset, "slow");
        assert_eq!(settings.content_type, ContentKind::LiveAction);
    }

    #[test]
    fn settings_follow_the_label() {
        let config = Config::default();

        let animation = select_settings(&config, ContentKind::Animation);
        assert_eq!(animation.quality, 26);
        assert_eq!(animation.preset, "slower");

        let live = select_settings(&config, ContentKind::LiveAction);
        assert_eq!(live.quality, 21);
        assert_eq!(live.preset, "slow");

        // Mixed content takes the arithmetic mean of the two qualities.
        let mixed = select_settings(&config, ContentKind::Mixed);
        assert_eq!(mixed.quality, 23);
        assert_eq!(mixed.preset, "slow");
    }

    #[test]
    fn option_rewrite_preserves_unrelated_flags() {
        let settings = CompressionSettings {
            quality: 26,
            preset: "slower".to_string(),
            content_type: ContentKind::Animation,
        };
        let rewritten = rewrite_encoder_options(
            "--encoder nvenc_h265 --encoder-preset slow --quality 22 --two-pass",
            &settings,
        );
        assert_eq!(
            rewritten,
            "--encoder nvenc_h265 --encoder-preset slower --quality 26 --two-pass"
        );
    }

    #[test]
    fn filename_keywords_short_circuit() {
        assert!(filename_hints_animation("some.anime.show.s01e01.mkv"));
        assert!(filename_hints_animation("pixar_short.mp4"));
        assert!(!filename_hints_animation("documentary.2023.mkv"));
    }

    #[test]
    fn release_patterns_upgrade_to_animation() {
        assert!(release_pattern_suggests_animation(
            "[Group] Show - 01 [1080p][BluRay][FLAC].mkv"
        ));
        assert!(!release_pattern_suggests_animation(
            "[Group] Show - 01 [1080p][BluRay][AAC].mkv"
        ));
        assert!(release_pattern_suggests_animation("My.Cartoon.Movie.mkv"));
    }

    fn write_frame(dir: &Path, name: &str, image: RgbImage) -> PathBuf {
        let path = dir.join(name);
        image.save(&path).expect("save frame");
        path
    }

    #[test]
    fn flat_high_contrast_frame_reads_as_animated() {
        let dir = tempfile::tempdir().expect("tempdir");
        // Two flat color fields with a hard vertical boundary: few colors,
        // strong edge response.
        let mut img = RgbImage::new(64, 64);
        for (x, _y, pixel) in img.enumerate_pixels_mut() {
            *pixel = if x % 8 < 4 {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            };
        }
        let frame = write_frame(dir.path(), "cel.jpg", img);
        assert_eq!(frame_looks_animated(&frame), Some(true));
    }

    #[test]
    fn smooth_gradient_frame_reads_as_live_action() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut img = RgbImage::new(64, 64);
        for (x, y, pixel) in img.enumerate_pixels_mut() {
            *pixel = Rgb([(x * 4) as u8, (y * 4) as u8, 128]);
        }
        let frame = write_frame(dir.path(), "smooth.jpg", img);
        assert_eq!(frame_looks_animated(&frame), Some(false));
    }
}
