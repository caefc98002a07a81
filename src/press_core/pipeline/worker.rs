//! Per-file compression: the single-worker algorithm from claim through
//! atomic in-place replacement.
//!
//! Only the owning worker transitions a record out of `in_progress`; every
//! exit path below performs exactly one such transition (or none at all
//! when the input cannot even be stated).

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Local;
use tracing::{info, warn};

use super::{JobInfo, PipelineInner};
use crate::press_core::classify;
use crate::press_core::config::Config;
use crate::press_core::domain::{ContentKind, FileStatus, FileUpdate, JobStage, PendingFile};
use crate::press_core::ffprobe;
use crate::press_core::fingerprint::file_fingerprint;
use crate::press_core::quality;
use crate::press_core::transcoder::{
    CancelKind, EncodeJob, EncodeOutcome, StatusSink, run_encoder,
};
use crate::sync_ext::MutexExt;

const ERROR_MESSAGE_CAP: usize = 1000;

#[derive(Debug)]
pub(super) enum FileOutcome {
    Success { original_size: u64, compressed_size: u64 },
    Skipped,
    Paused,
    Stopped,
    Error(String),
}

/// Run `compress_file` with a panic guard, converting a worker panic into a
/// recorded error so one bad file cannot take the pool down.
pub(super) fn guarded_compress(
    inner: &PipelineInner,
    config: &Config,
    worker_index: usize,
    pending: &PendingFile,
) -> FileOutcome {
    let result = catch_unwind(AssertUnwindSafe(|| {
        compress_file(inner, config, worker_index, pending)
    }));
    match result {
        Ok(outcome) => outcome,
        Err(payload) => {
            let reason = format!(
                "compression panicked: {}",
                panic_payload_to_string(payload.as_ref())
            );
            warn!(file = %pending.file_path, "{reason}");
            mark_error(inner, &pending.file_path, &reason);
            unregister_job(inner, worker_index);
            FileOutcome::Error(reason)
        }
    }
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "unknown panic payload".to_string()
}

fn truncate_message(message: &str) -> String {
    if message.len() <= ERROR_MESSAGE_CAP {
        return message.to_string();
    }
    message.chars().take(ERROR_MESSAGE_CAP).collect()
}

fn mark_error(inner: &PipelineInner, file_path: &str, message: &str) {
    let update = FileUpdate {
        error_message: Some(truncate_message(message)),
        ..FileUpdate::default()
    };
    if let Err(err) = inner
        .catalog
        .update_file_status(file_path, FileStatus::Error, &update)
    {
        warn!(error = %err, file_path, "failed to record error status");
    }
}

fn register_job(
    inner: &PipelineInner,
    worker_index: usize,
    pending: &PendingFile,
    file_size: u64,
) {
    let file_name = Path::new(&pending.file_path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut state = inner.state.lock_unpoisoned();
    state.active_jobs.insert(
        worker_index,
        JobInfo {
            file_path: pending.file_path.clone(),
            file_name,
            started: Instant::now(),
            progress: 0.0,
            file_size,
            stage: JobStage::Initializing,
            estimated_time: pending.estimated_time,
            eta_seconds: None,
        },
    );
}

fn unregister_job(inner: &PipelineInner, worker_index: usize) {
    let mut state = inner.state.lock_unpoisoned();
    state.active_jobs.remove(&worker_index);
}

/// Status sink bound to one worker's slot in the shared job map. Updates
/// are O(1) field writes under the state mutex; the ETA falls back to a
/// progress-rate projection when the encoder does not supply its own.
struct JobStatusSink<'a> {
    inner: &'a PipelineInner,
    worker_index: usize,
}

impl StatusSink for JobStatusSink<'_> {
    fn update(&self, stage: JobStage, progress: Option<f64>, eta_seconds: Option<f64>) {
        let mut state = self.inner.state.lock_unpoisoned();
        let Some(job) = state.active_jobs.get_mut(&self.worker_index) else {
            return;
        };
        job.stage = stage;
        if let Some(p) = progress {
            // Clamp into [0, 100] and never regress, so observers see a
            // monotonic percentage.
            let clamped = p.clamp(0.0, 100.0);
            if clamped > job.progress {
                job.progress = clamped;
            }
        }
        if let Some(eta) = eta_seconds {
            job.eta_seconds = Some(eta);
        } else if let Some(p) = progress
            && p > 0.0
        {
            let elapsed = job.started.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                let total = elapsed / (p / 100.0);
                job.eta_seconds = Some(total - elapsed);
            }
        }
    }
}

fn temp_output_path(config: &Config, source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let ext = source
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    Path::new(&config.temp_dir).join(format!("{stem}_compressed{ext}"))
}

/// Replace `target` with `temp` without ever leaving the target missing.
/// Same-filesystem rename when possible; otherwise the temp file is copied
/// to a sibling of the target first and the final step is still a rename.
fn replace_file(temp: &Path, target: &Path) -> Result<()> {
    match std::fs::rename(temp, target) {
        Ok(()) => Ok(()),
        Err(err) if err.raw_os_error() == Some(cross_device_errno()) => {
            let sibling = target.with_extension("incoming");
            std::fs::copy(temp, &sibling).with_context(|| {
                format!("failed to stage {} next to {}", temp.display(), target.display())
            })?;
            std::fs::rename(&sibling, target).with_context(|| {
                format!("failed to swap staged file into {}", target.display())
            })?;
            drop(std::fs::remove_file(temp));
            Ok(())
        }
        Err(err) => Err(err).with_context(|| {
            format!("failed to rename {} -> {}", temp.display(), target.display())
        }),
    }
}

#[cfg(unix)]
fn cross_device_errno() -> i32 {
    18 // EXDEV
}

#[cfg(not(unix))]
fn cross_device_errno() -> i32 {
    17 // ERROR_NOT_SAME_DEVICE
}

fn compress_file(
    inner: &PipelineInner,
    config: &Config,
    worker_index: usize,
    pending: &PendingFile,
) -> FileOutcome {
    let source = Path::new(&pending.file_path);
    let start = Instant::now();

    // Stat failure means no claim was taken; the record is left untouched.
    let original_size = match std::fs::metadata(source) {
        Ok(meta) => meta.len(),
        Err(err) => {
            let reason = format!("Cannot access file {}: {err}", pending.file_path);
            warn!("{reason}");
            return FileOutcome::Error(reason);
        }
    };

    register_job(inner, worker_index, pending, original_size);
    let sink = JobStatusSink {
        inner,
        worker_index,
    };

    let update = FileUpdate {
        processing_started: Some(Local::now().to_rfc3339()),
        ..FileUpdate::default()
    };
    if let Err(err) =
        inner
            .catalog
            .update_file_status(&pending.file_path, FileStatus::InProgress, &update)
    {
        warn!(error = %err, "failed to mark record in progress");
    }

    let outcome = run_stages(inner, config, pending, source, original_size, start, &sink);
    unregister_job(inner, worker_index);
    outcome
}

fn run_stages(
    inner: &PipelineInner,
    config: &Config,
    pending: &PendingFile,
    source: &Path,
    original_size: u64,
    start: Instant,
    sink: &dyn StatusSink,
) -> FileOutcome {
    // Source integrity.
    if config.recovery.verify_files {
        sink.update(JobStage::IntegrityCheck, None, None);
        if !ffprobe::verify_integrity(source, config.recovery.strict_validation) {
            let reason = format!("Original file integrity check failed for {}", source.display());
            warn!("{reason}");
            mark_error(inner, &pending.file_path, &reason);
            return FileOutcome::Error(reason);
        }
    }

    // Content-aware settings.
    sink.update(JobStage::ContentAnalysis, None, None);
    let kind = if config.compression.content_aware {
        classify::classify(config, source)
    } else {
        ContentKind::LiveAction
    };
    let settings = classify::select_settings(config, kind);
    let video_options = classify::rewrite_encoder_options(
        &config.compression.encoder_options,
        &settings,
    );

    let temp_output = temp_output_path(config, source);
    if let Err(err) = std::fs::create_dir_all(&config.temp_dir) {
        let reason = format!("Cannot create temp directory {}: {err}", config.temp_dir);
        mark_error(inner, &pending.file_path, &reason);
        return FileOutcome::Error(reason);
    }

    info!(
        file = %source.display(),
        content_type = settings.content_type.as_str(),
        quality = settings.quality,
        "starting compression"
    );

    let encode_job = EncodeJob {
        encoder_path: &config.compression.encoder_path,
        input: source,
        output: &temp_output,
        video_options: &video_options,
        audio_options: &config.compression.audio_options,
        subtitle_options: &config.compression.subtitle_options,
    };
    match run_encoder(&encode_job, sink, &inner.cancel) {
        EncodeOutcome::Completed => {}
        EncodeOutcome::Cancelled(CancelKind::Paused) => {
            info!(file = %source.display(), "compression paused");
            if let Err(err) = inner.catalog.update_file_status(
                &pending.file_path,
                FileStatus::Paused,
                &FileUpdate::default(),
            ) {
                warn!(error = %err, "failed to mark record paused");
            }
            drop(std::fs::remove_file(&temp_output));
            return FileOutcome::Paused;
        }
        EncodeOutcome::Cancelled(CancelKind::Stopped) => {
            info!(file = %source.display(), "compression stopped");
            if let Err(err) = inner.catalog.update_file_status(
                &pending.file_path,
                FileStatus::Pending,
                &FileUpdate::default(),
            ) {
                warn!(error = %err, "failed to return record to pending");
            }
            drop(std::fs::remove_file(&temp_output));
            return FileOutcome::Stopped;
        }
        EncodeOutcome::Failed(message) => {
            warn!(file = %source.display(), "encoder failed: {message}");
            mark_error(inner, &pending.file_path, &message);
            drop(std::fs::remove_file(&temp_output));
            return FileOutcome::Error(message);
        }
    }

    // The encoder reported success; the output must exist and be non-empty.
    let compressed_size = std::fs::metadata(&temp_output).map(|m| m.len()).unwrap_or(0);
    if compressed_size == 0 {
        let reason = "Compression produced an empty or missing file".to_string();
        warn!(file = %source.display(), "{reason}");
        mark_error(inner, &pending.file_path, &reason);
        drop(std::fs::remove_file(&temp_output));
        return FileOutcome::Error(reason);
    }

    // Size and quality gates.
    let reduction = 1.0 - compressed_size as f64 / original_size as f64;
    sink.update(JobStage::QualityCheck, None, None);
    let verdict = quality::validate(config, source, &temp_output);

    if reduction < config.size_reduction_threshold || !verdict.acceptable {
        let mut reasons = Vec::new();
        if reduction < config.size_reduction_threshold {
            reasons.push(format!(
                "insufficient reduction (got {:.1}%, expected {:.1}%)",
                reduction * 100.0,
                config.size_reduction_threshold * 100.0
            ));
        }
        if !verdict.acceptable {
            reasons.push(format!(
                "quality below threshold (got {:.2}, required {})",
                verdict.score, config.quality_validation.threshold
            ));
        }
        let reason = reasons.join(", ");
        warn!(file = %source.display(), "compression did not meet criteria: {reason}; keeping original");

        let update = FileUpdate {
            skip_reason: Some(reason),
            content_type: Some(settings.content_type),
            quality_score: Some(verdict.score),
            ..FileUpdate::default()
        };
        if let Err(err) =
            inner
                .catalog
                .update_file_status(&pending.file_path, FileStatus::Skipped, &update)
        {
            warn!(error = %err, "failed to mark record skipped");
        }
        drop(std::fs::remove_file(&temp_output));
        return FileOutcome::Skipped;
    }

    // Output integrity before the source is touched.
    if config.recovery.verify_files {
        sink.update(JobStage::IntegrityCheck, None, None);
        if !ffprobe::verify_integrity(&temp_output, config.recovery.strict_validation) {
            let reason = "Compressed file integrity verification failed".to_string();
            warn!(file = %source.display(), "{reason}");
            mark_error(inner, &pending.file_path, &reason);
            drop(std::fs::remove_file(&temp_output));
            return FileOutcome::Error(reason);
        }
    }

    // The replacement is the commit point.
    sink.update(JobStage::Finalizing, None, None);
    if let Err(err) = replace_file(&temp_output, source) {
        let reason = format!("Failed to replace original file: {err:#}");
        warn!("{reason}");
        mark_error(inner, &pending.file_path, &reason);
        drop(std::fs::remove_file(&temp_output));
        return FileOutcome::Error(reason);
    }

    let checksum = file_fingerprint(source).unwrap_or_default();
    let actual_seconds = start.elapsed().as_secs() as i64;
    let update = FileUpdate {
        original_size: Some(original_size),
        compressed_size: Some(compressed_size),
        compression_date: Some(Local::now().to_rfc3339()),
        checksum: Some(checksum),
        content_type: Some(settings.content_type),
        quality_score: Some(verdict.score),
        actual_time: Some(actual_seconds),
        increment_compression_count: true,
        ..FileUpdate::default()
    };
    if let Err(err) =
        inner
            .catalog
            .update_file_status(&pending.file_path, FileStatus::Completed, &update)
    {
        warn!(error = %err, "failed to mark record completed");
    }
    if let Err(err) = inner
        .catalog
        .update_compression_time(&pending.file_path, actual_seconds)
    {
        warn!(error = %err, "failed to record compression time");
    }

    info!(
        file = %source.display(),
        original_mb = original_size as f64 / (1024.0 * 1024.0),
        compressed_mb = compressed_size as f64 / (1024.0 * 1024.0),
        reduction_percent = reduction * 100.0,
        quality = verdict.score,
        seconds = actual_seconds,
        "successfully compressed"
    );

    FileOutcome::Success {
        original_size,
        compressed_size,
    }
}
