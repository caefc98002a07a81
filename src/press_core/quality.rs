//! Quality validation of a compressed output against its source.
//!
//! A sample window is compared with the configured primary metric, falling
//! back through the remaining of VMAF, SSIM and PSNR when a method cannot
//! produce a score. Validator outage must not silently halt compression, so
//! when every method fails the result is an explicit conservative verdict
//! rather than an error.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};

use crate::press_core::config::Config;
use crate::press_core::ffprobe;
use crate::process_ext::run_with_timeout;

const METRIC_TIMEOUT: Duration = Duration::from_secs(300);
const MIN_SAMPLE_SECONDS: f64 = 10.0;

static SSIM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"All:([\d.]+)").expect("ssim regex"));
static PSNR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"average:([\d.]+)").expect("psnr regex"));

#[derive(Debug, Clone, Serialize)]
pub struct QualityVerdict {
    /// 0-100 scale regardless of method.
    pub score: f64,
    pub acceptable: bool,
    pub method: String,
    pub note: Option<String>,
}

impl QualityVerdict {
    fn passed(score: f64, acceptable: bool, method: &str) -> Self {
        Self {
            score,
            acceptable,
            method: method.to_string(),
            note: None,
        }
    }

    fn benefit_of_the_doubt(note: &str) -> Self {
        Self {
            score: 100.0,
            acceptable: true,
            method: "none".to_string(),
            note: Some(note.to_string()),
        }
    }
}

/// Safe sample placement: skip the head of the video (up to 30 s or 10 % of
/// the shorter duration), then truncate the configured sample to what fits,
/// with a 10-second floor.
pub(crate) fn sample_window(min_duration: f64, configured_sample: f64) -> (f64, f64) {
    let start = f64::min(30.0, min_duration * 0.1);
    let mut sample = configured_sample;
    if start + sample > min_duration {
        sample = f64::max(MIN_SAMPLE_SECONDS, min_duration - start);
    }
    (start, sample)
}

fn parse_vmaf_log(contents: &str) -> Option<f64> {
    if !contents.contains("pooled_metrics") {
        return None;
    }
    let parsed: serde_json::Value = serde_json::from_str(contents).ok()?;
    parsed
        .get("pooled_metrics")?
        .get("vmaf")?
        .get("mean")?
        .as_f64()
}

fn parse_ssim_log(contents: &str) -> Option<f64> {
    let raw: f64 = SSIM_RE.captures(contents)?.get(1)?.as_str().parse().ok()?;
    Some(raw * 100.0)
}

fn parse_psnr_log(contents: &str) -> Option<f64> {
    PSNR_RE.captures(contents)?.get(1)?.as_str().parse().ok()
}

fn method_filter(method: &str, result_path: &Path) -> String {
    let log = result_path.to_string_lossy();
    match method {
        "vmaf" => format!(
            "libvmaf=log_fmt=json:log_path={log}:model=version=vmaf_v0.6.1:n_threads=4"
        ),
        "ssim" => format!("ssim=stats_file={log}"),
        _ => format!("psnr=stats_file={log}"),
    }
}

/// Run one metric over the sample window and score it. None means the
/// method produced nothing parseable and the next fallback should run.
fn run_method(
    method: &str,
    original: &Path,
    compressed: &Path,
    start: f64,
    sample: f64,
    threshold: f64,
    temp_dir: &Path,
) -> Option<QualityVerdict> {
    let stamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let result_path: PathBuf = temp_dir.join(format!("quality_{method}_{stamp}.json"));

    let mut cmd = Command::new("ffmpeg");
    cmd.args(["-y", "-v", "error"])
        .args(["-ss", &start.to_string(), "-t", &sample.to_string(), "-i"])
        .arg(original)
        .args(["-ss", &start.to_string(), "-t", &sample.to_string(), "-i"])
        .arg(compressed)
        .args(["-filter_complex", &method_filter(method, &result_path)])
        .args(["-f", "null", "-"]);

    info!(method, "running quality validation");
    let run = run_with_timeout(cmd, METRIC_TIMEOUT);

    let contents = std::fs::read_to_string(&result_path).ok();
    // The result file is removed whether or not parsing succeeds.
    drop(std::fs::remove_file(&result_path));

    if let Err(err) = run {
        warn!(method, error = %err, "quality metric invocation failed");
        return None;
    }

    let contents = contents?;
    if contents.is_empty() {
        return None;
    }

    match method {
        "vmaf" => {
            let score = parse_vmaf_log(&contents)?;
            info!(method, score, "quality validation successful");
            Some(QualityVerdict::passed(score, score >= threshold, method))
        }
        "ssim" => {
            let score = parse_ssim_log(&contents)?;
            info!(method, score, "quality validation successful");
            Some(QualityVerdict::passed(
                score,
                score >= f64::max(threshold * 0.8, 80.0),
                method,
            ))
        }
        _ => {
            let psnr = parse_psnr_log(&contents)?;
            let score = if psnr < 50.0 {
                f64::min(100.0, psnr * 2.0)
            } else {
                100.0
            };
            info!(method, score, "quality validation successful");
            Some(QualityVerdict::passed(score, psnr >= 30.0, method))
        }
    }
}

/// Compare the compressed output against its source over a sample window.
pub fn validate(config: &Config, original: &Path, compressed: &Path) -> QualityVerdict {
    if !config.quality_validation.enabled {
        return QualityVerdict::benefit_of_the_doubt("validation disabled");
    }

    let original_info = ffprobe::probe(original).unwrap_or_default();
    let compressed_info = ffprobe::probe(compressed).unwrap_or_default();

    let orig_duration = original_info.duration_seconds;
    let comp_duration = compressed_info.duration_seconds;
    if orig_duration <= 0.0 || comp_duration <= 0.0 {
        warn!(
            path = %original.display(),
            "could not determine durations for comparison, assuming acceptable quality"
        );
        return QualityVerdict::benefit_of_the_doubt("duration unavailable");
    }

    let min_duration = f64::min(orig_duration, comp_duration);
    let (start, sample) = sample_window(min_duration, config.quality_validation.sample_duration);
    if sample < config.quality_validation.sample_duration {
        warn!(
            sample,
            "video too short for the configured sample, reducing sample duration"
        );
    }

    let primary = config.quality_validation.method.to_lowercase();
    let mut methods: Vec<&str> = vec![primary.as_str()];
    for method in ["vmaf", "ssim", "psnr"] {
        if method != primary {
            methods.push(method);
        }
    }

    let temp_dir = Path::new(&config.temp_dir);
    for method in methods {
        if let Some(verdict) = run_method(
            method,
            original,
            compressed,
            start,
            sample,
            config.quality_validation.threshold,
            temp_dir,
        ) {
            return verdict;
        }
        warn!(method, "quality validation method failed, trying next");
    }

    warn!(path = %original.display(), "all quality validation methods failed, using fallback score");
    QualityVerdict {
        score: 85.0,
        acceptable: true,
        method: "fallback".to_string(),
        note: Some("all validation methods failed".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_window_leaves_long_videos_untouched() {
        let (start, sample) = sample_window(3600.0, 60.0);
        assert!((start - 30.0).abs() < f64::EPSILON);
        assert!((sample - 60.0).abs() < f64::EPSILON);
    }

    #[test]
    fn sample_window_shrinks_for_short_videos() {
        // 50 s video: start = min(30, 5) = 5, sample = 50 - 5 = 45.
        let (start, sample) = sample_window(50.0, 60.0);
        assert!((start - 5.0).abs() < f64::EPSILON);
        assert!((sample - 45.0).abs() < f64::EPSILON);
    }

    #[test]
    fn sample_window_floors_at_ten_seconds() {
        // 12 s video: start = 1.2, remaining 10.8 stays above the floor.
        let (start, sample) = sample_window(12.0, 60.0);
        assert!((start - 1.2).abs() < 1e-9);
        assert!(sample >= MIN_SAMPLE_SECONDS);

        // 8 s video: the remainder would be 7.2, the floor raises it to 10.
        let (_, clamped) = sample_window(8.0, 60.0);
        assert!((clamped - MIN_SAMPLE_SECONDS).abs() < f64::EPSILON);
    }

    #[test]
    fn vmaf_log_parses_pooled_mean() {
        let log = r#"{"version": "2.3", "pooled_metrics": {"vmaf": {"min": 88.1, "mean": 94.617780, "max": 99.2}}}"#;
        let score = parse_vmaf_log(log).expect("vmaf score");
        assert!((score - 94.617780).abs() < 1e-9);
        assert!(parse_vmaf_log("{\"frames\": []}").is_none());
    }

    #[test]
    fn ssim_log_parses_all_value_scaled_to_percent() {
        let log = "n:100 Y:0.991 U:0.994 V:0.995 All:0.992512 (21.3)";
        let score = parse_ssim_log(log).expect("ssim score");
        assert!((score - 99.2512).abs() < 1e-6);
    }

    #[test]
    fn psnr_log_parses_average() {
        let log = "PSNR y:42.1 u:44.0 v:43.8 average:42.766 min:38.1 max:49.9";
        let psnr = parse_psnr_log(log).expect("psnr value");
        assert!((psnr - 42.766).abs() < 1e-9);
    }

    #[test]
    fn disabled_validation_accepts_unconditionally() {
        let mut config = Config::default();
        config.quality_validation.enabled = false;
        let verdict = validate(
            &config,
            Path::new("/nonexistent/a.mkv"),
            Path::new("/nonexistent/b.mkv"),
        );
        assert!(verdict.acceptable);
        assert_eq!(verdict.method, "none");
        assert!((verdict.score - 100.0).abs() < f64::EPSILON);
    }
}
