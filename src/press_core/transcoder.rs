//! Adapter around the external encoder binary.
//!
//! The encoder is spawned as a child process with stdout and stderr pumped
//! line by line into one channel. Lines that look like progress reports are
//! parsed for a percentage and an optional ETA and forwarded to the injected
//! [`StatusSink`]; between lines the adapter polls a [`CancelToken`] so a
//! pause or stop lands within roughly a second. The adapter only ever
//! produces the requested output file; moving or replacing the source is
//! the pipeline's job.

use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, channel};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::press_core::domain::JobStage;

/// Inputs above this size get the large-file encoder flags appended.
const LARGE_FILE_BYTES: u64 = 10 * 1024 * 1024 * 1024;
const LINE_POLL: Duration = Duration::from_millis(50);
const FAILURE_TAIL_LINES: usize = 20;

static PROGRESS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+\.\d+) %").expect("progress regex"));
static ETA_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"ETA\s+(\d+)h(\d+)m(\d+)s").expect("eta regex"));

/// Receiver of per-job status updates; the pipeline injects one per job.
pub trait StatusSink: Send + Sync {
    fn update(&self, stage: JobStage, progress: Option<f64>, eta_seconds: Option<f64>);
}

/// No-op sink for callers that do not track progress.
pub struct NullSink;

impl StatusSink for NullSink {
    fn update(&self, _stage: JobStage, _progress: Option<f64>, _eta_seconds: Option<f64>) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelKind {
    /// Work will be retried; the record goes to `paused`.
    Paused,
    /// Work is abandoned back to `pending` and the pool drains.
    Stopped,
}

/// Single cancellation capability polled by the adapter between progress
/// lines. Pause takes precedence over stop so a pause-then-stop sequence
/// still parks the record as paused.
#[derive(Clone, Default)]
pub struct CancelToken {
    paused: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn clear_pause(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.stopped.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Option<CancelKind> {
        if self.is_paused() {
            Some(CancelKind::Paused)
        } else if self.is_stopped() {
            Some(CancelKind::Stopped)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct EncodeJob<'a> {
    pub encoder_path: &'a str,
    pub input: &'a Path,
    pub output: &'a Path,
    /// Encoder flags with quality/preset already substituted.
    pub video_options: &'a str,
    pub audio_options: &'a str,
    pub subtitle_options: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeOutcome {
    Completed,
    Cancelled(CancelKind),
    Failed(String),
}

/// `(percent, eta_seconds)` from one encoder output line, or None when the
/// line is not a progress report. Malformed numbers are treated as absent;
/// progress lines are advisory.
pub(crate) fn parse_progress_line(line: &str) -> Option<(f64, Option<f64>)> {
    if !line.contains("Encoding") || !line.contains('%') {
        return None;
    }
    let percent: f64 = PROGRESS_RE.captures(line)?.get(1)?.as_str().parse().ok()?;
    let eta = ETA_RE.captures(line).and_then(|caps| {
        let h: f64 = caps.get(1)?.as_str().parse().ok()?;
        let m: f64 = caps.get(2)?.as_str().parse().ok()?;
        let s: f64 = caps.get(3)?.as_str().parse().ok()?;
        Some(h * 3600.0 + m * 60.0 + s)
    });
    Some((percent, eta))
}

pub(crate) fn build_encoder_args(job: &EncodeJob, input_size: u64) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-i".to_string(),
        job.input.to_string_lossy().into_owned(),
        "-o".to_string(),
        job.output.to_string_lossy().into_owned(),
    ];
    args.extend(job.video_options.split_whitespace().map(str::to_string));
    args.extend(job.audio_options.split_whitespace().map(str::to_string));
    args.extend(job.subtitle_options.split_whitespace().map(str::to_string));
    if input_size > LARGE_FILE_BYTES {
        args.push("--no-two-pass".to_string());
        args.push("--no-fast-decode".to_string());
    }
    args
}

fn pump_lines<R: Read + Send + 'static>(stream: Option<R>, tx: Sender<String>) {
    let Some(stream) = stream else {
        return;
    };
    std::thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

fn kill_and_reap(child: &mut Child) {
    drop(child.kill());
    drop(child.wait());
}

/// Run the encoder to completion, cancellation or failure.
pub fn run_encoder(job: &EncodeJob, sink: &dyn StatusSink, cancel: &CancelToken) -> EncodeOutcome {
    let input_size = match std::fs::metadata(job.input) {
        Ok(meta) => meta.len(),
        Err(err) => {
            return EncodeOutcome::Failed(format!(
                "cannot stat input {}: {err}",
                job.input.display()
            ));
        }
    };
    let args = build_encoder_args(job, input_size);
    if input_size > LARGE_FILE_BYTES {
        info!(path = %job.input.display(), "large file detected, adding optimized processing options");
    }
    debug!(encoder = job.encoder_path, ?args, "starting encoder");

    let mut child = match Command::new(job.encoder_path)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            return EncodeOutcome::Failed(format!(
                "failed to spawn encoder {}: {err}",
                job.encoder_path
            ));
        }
    };

    let (tx, rx): (Sender<String>, Receiver<String>) = channel();
    pump_lines(child.stdout.take(), tx.clone());
    pump_lines(child.stderr.take(), tx);

    sink.update(JobStage::Encoding, Some(0.0), None);

    let mut tail: Vec<String> = Vec::new();
    let status = loop {
        if let Some(kind) = cancel.check() {
            info!(path = %job.input.display(), ?kind, "encoder cancelled");
            kill_and_reap(&mut child);
            return EncodeOutcome::Cancelled(kind);
        }

        match rx.recv_timeout(LINE_POLL) {
            Ok(line) => {
                if let Some((percent, eta)) = parse_progress_line(&line) {
                    sink.update(JobStage::Encoding, Some(percent), eta);
                }
                if tail.len() >= FAILURE_TAIL_LINES {
                    tail.remove(0);
                }
                if !line.trim().is_empty() {
                    tail.push(line);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                // Output streams closed; wait for the exit status.
                match child.wait() {
                    Ok(status) => break status,
                    Err(err) => {
                        return EncodeOutcome::Failed(format!("failed to reap encoder: {err}"));
                    }
                }
            }
        }

        match child.try_wait() {
            Ok(Some(status)) => {
                // Drain whatever the pumps still hold before deciding.
                while let Ok(line) = rx.recv_timeout(LINE_POLL) {
                    if let Some((percent, eta)) = parse_progress_line(&line) {
                        sink.update(JobStage::Encoding, Some(percent), eta);
                    }
                    if tail.len() >= FAILURE_TAIL_LINES {
                        tail.remove(0);
                    }
                    if !line.trim().is_empty() {
                        tail.push(line);
                    }
                }
                break status;
            }
            Ok(None) => {}
            Err(err) => {
                kill_and_reap(&mut child);
                return EncodeOutcome::Failed(format!("failed to poll encoder: {err}"));
            }
        }
    };

    if let Some(kind) = cancel.check() {
        return EncodeOutcome::Cancelled(kind);
    }

    if status.success() {
        sink.update(JobStage::Encoding, Some(100.0), Some(0.0));
        EncodeOutcome::Completed
    } else {
        let code = status
            .code()
            .map_or("terminated by signal".to_string(), |c| format!("exit code {c}"));
        warn!(path = %job.input.display(), code = %code, "encoder exited with non-zero status");
        EncodeOutcome::Failed(format!(
            "encoder exited with non-zero status ({code}): {}",
            tail.join(" | ")
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct RecordingSink {
        updates: Mutex<Vec<(f64, Option<f64>)>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                updates: Mutex::new(Vec::new()),
            }
        }
    }

    impl StatusSink for RecordingSink {
        fn update(&self, _stage: JobStage, progress: Option<f64>, eta_seconds: Option<f64>) {
            if let Some(p) = progress {
                self.updates.lock().unwrap().push((p, eta_seconds));
            }
        }
    }

    #[test]
    fn parses_percent_only_progress_line() {
        let (percent, eta) =
            parse_progress_line("Encoding: task 1 of 1, 42.5 %").expect("progress");
        assert!((percent - 42.5).abs() < f64::EPSILON);
        assert!(eta.is_none());
    }

    #[test]
    fn parses_percent_with_eta() {
        let (percent, eta) = parse_progress_line(
            "Encoding: task 1 of 1, 42.5 % (15.23 fps, avg 14.80 fps, ETA 0h02m10s)",
        )
        .expect("progress");
        assert!((percent - 42.5).abs() < f64::EPSILON);
        assert_eq!(eta, Some(130.0));
    }

    #[test]
    fn ignores_non_progress_lines() {
        assert!(parse_progress_line("scanning title 1 of 1").is_none());
        assert!(parse_progress_line("Encoding started").is_none());
        assert!(parse_progress_line("100 % but no marker word").is_none());
    }

    #[test]
    fn large_inputs_get_extra_flags() {
        let job = EncodeJob {
            encoder_path: "HandBrakeCLI",
            input: Path::new("/media/in.mkv"),
            output: Path::new("/tmp/out.mkv"),
            video_options: "--encoder nvenc_h265 --quality 22",
            audio_options: "--aencoder copy",
            subtitle_options: "--all-subtitles",
        };
        let small = build_encoder_args(&job, 1024);
        assert!(!small.iter().any(|a| a == "--no-two-pass"));

        let large = build_encoder_args(&job, LARGE_FILE_BYTES + 1);
        assert!(large.iter().any(|a| a == "--no-two-pass"));
        assert!(large.iter().any(|a| a == "--no-fast-decode"));
        // Option bundles are split into individual arguments.
        assert!(large.iter().any(|a| a == "--encoder"));
        assert!(large.iter().any(|a| a == "nvenc_h265"));
    }

    #[cfg(unix)]
    fn write_fake_encoder(dir: &Path, script: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-encoder.sh");
        std::fs::write(&path, script).expect("write script");
        let mut perms = std::fs::metadata(&path).expect("stat").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("chmod");
        path
    }

    #[cfg(unix)]
    #[test]
    fn fake_encoder_reports_progress_and_completes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("in.mkv");
        std::fs::write(&input, b"input-bytes").expect("write input");
        let output = dir.path().join("out.mkv");

        let script = r#"#!/bin/sh
# Args: -i <in> -o <out> ...
out="$4"
echo "Encoding: task 1 of 1, 25.0 % (ETA 0h0m30s)"
echo "Encoding: task 1 of 1, 75.0 %"
printf 'compressed' > "$out"
"#;
        let encoder = write_fake_encoder(dir.path(), script);

        let job = EncodeJob {
            encoder_path: encoder.to_str().expect("utf8 path"),
            input: &input,
            output: &output,
            video_options: "--quality 22",
            audio_options: "",
            subtitle_options: "",
        };
        let sink = RecordingSink::new();
        let outcome = run_encoder(&job, &sink, &CancelToken::new());
        assert_eq!(outcome, EncodeOutcome::Completed);
        assert!(output.exists());

        let updates = sink.updates.lock().unwrap();
        assert!(updates.iter().any(|(p, eta)| *p == 25.0 && *eta == Some(30.0)));
        assert!(updates.iter().any(|(p, _)| *p == 75.0));
    }

    #[cfg(unix)]
    #[test]
    fn failing_encoder_reports_failed_with_exit_code() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("in.mkv");
        std::fs::write(&input, b"input-bytes").expect("write input");

        let script = "#!/bin/sh\necho boom >&2\nexit 3\n";
        let encoder = write_fake_encoder(dir.path(), script);

        let job = EncodeJob {
            encoder_path: encoder.to_str().expect("utf8 path"),
            input: &input,
            output: &dir.path().join("out.mkv"),
            video_options: "",
            audio_options: "",
            subtitle_options: "",
        };
        let outcome = run_encoder(&job, &NullSink, &CancelToken::new());
        match outcome {
            EncodeOutcome::Failed(msg) => {
                assert!(msg.contains("exit code 3"), "unexpected message: {msg}");
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn pause_cancels_a_running_encode() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("in.mkv");
        std::fs::write(&input, b"input-bytes").expect("write input");

        let script = "#!/bin/sh\nwhile true; do echo 'Encoding: task 1 of 1, 10.0 %'; sleep 1; done\n";
        let encoder = write_fake_encoder(dir.path(), script);

        let cancel = CancelToken::new();
        let cancel_clone = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            cancel_clone.pause();
        });

        let job = EncodeJob {
            encoder_path: encoder.to_str().expect("utf8 path"),
            input: &input,
            output: &dir.path().join("out.mkv"),
            video_options: "",
            audio_options: "",
            subtitle_options: "",
        };
        let outcome = run_encoder(&job, &NullSink, &cancel);
        assert_eq!(outcome, EncodeOutcome::Cancelled(CancelKind::Paused));
    }

    #[test]
    fn spawn_failure_is_reported_as_failed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("in.mkv");
        std::fs::write(&input, b"x").expect("write input");

        let job = EncodeJob {
            encoder_path: "/nonexistent/encoder-binary",
            input: &input,
            output: &dir.path().join("out.mkv"),
            video_options: "",
            audio_options: "",
            subtitle_options: "",
        };
        match run_encoder(&job, &NullSink, &CancelToken::new()) {
            EncodeOutcome::Failed(msg) => assert!(msg.contains("failed to spawn")),
            other => panic!("expected spawn failure, got {other:?}"),
        }
    }
}
