//! Compressor pipeline: a bounded worker pool over the priority-ordered
//! pending queue, with pause/resume/stop control and per-job progress.
//!
//! Control flags live in one [`CancelToken`] polled by the encoder adapter
//! between progress lines, so pause and stop land within about a second.
//! The in-memory job map is protected by a single mutex held only for O(1)
//! field updates, never across I/O.

mod worker;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Local;
use serde::Serialize;
use tracing::{info, warn};

use crate::press_core::catalog::Catalog;
use crate::press_core::config::Config;
use crate::press_core::domain::{
    FileStatus, FileUpdate, JobSnapshot, JobStage, PendingFile, Severity, SessionStats,
};
use crate::press_core::notify::{Notifier, NotifyLevel};
use crate::press_core::transcoder::CancelToken;
use crate::press_core::{resources, tools};
use crate::sync_ext::MutexExt;

pub(crate) struct JobInfo {
    pub(crate) file_path: String,
    pub(crate) file_name: String,
    pub(crate) started: Instant,
    pub(crate) progress: f64,
    pub(crate) file_size: u64,
    pub(crate) stage: JobStage,
    pub(crate) estimated_time: i64,
    pub(crate) eta_seconds: Option<f64>,
}

#[derive(Default)]
pub(crate) struct SessionTotals {
    pub(crate) files_processed: u64,
    pub(crate) errors: u64,
    pub(crate) skipped: u64,
    pub(crate) total_original_bytes: u64,
    pub(crate) total_compressed_bytes: u64,
}

pub(crate) struct PipelineState {
    /// Keyed by worker index; rebuilt from scratch on restart.
    pub(crate) active_jobs: HashMap<usize, JobInfo>,
    pub(crate) session_start: Option<Instant>,
    pub(crate) totals: SessionTotals,
}

pub(crate) struct PipelineInner {
    pub(crate) catalog: Arc<Catalog>,
    pub(crate) notifier: Notifier,
    pub(crate) cancel: CancelToken,
    pub(crate) session_active: AtomicBool,
    pub(crate) state: Mutex<PipelineState>,
}

/// Pipeline facade; cheap to clone, all state shared.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionOutcome {
    /// Gate refused the session; no records were mutated.
    Skipped { reason: String },
    Completed {
        files_processed: u64,
        errors: u64,
        total_original_size: u64,
        total_compressed_size: u64,
        savings_percentage: f64,
        duration_seconds: f64,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub status: String,
    pub paused: bool,
    pub active_jobs: Vec<JobSnapshot>,
    pub files_processed: u64,
    pub errors: u64,
    pub total_original_size: u64,
    pub total_compressed_size: u64,
    pub session_duration_seconds: f64,
    /// Sum of pending estimates divided by the worker count.
    pub queue_eta_seconds: f64,
}

/// Resets the session-active flag when a session unwinds for any reason.
struct SessionGuard<'a>(&'a AtomicBool);

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Pipeline {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        let notifier = Notifier::new(catalog.clone());
        Self {
            inner: Arc::new(PipelineInner {
                catalog,
                notifier,
                cancel: CancelToken::new(),
                session_active: AtomicBool::new(false),
                state: Mutex::new(PipelineState {
                    active_jobs: HashMap::new(),
                    session_start: None,
                    totals: SessionTotals::default(),
                }),
            }),
        }
    }

    pub fn session_in_progress(&self) -> bool {
        self.inner.session_active.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.inner.cancel.is_paused()
    }

    /// Flip the shared pause flag. Active encoders are terminated at their
    /// next progress line and their records pushed to `paused`; pausing an
    /// already-paused pipeline is a no-op.
    pub fn pause(&self) {
        if self.inner.cancel.is_paused() {
            return;
        }
        self.inner.cancel.pause();
        info!("compression paused");
        self.inner.catalog.log_event(
            "compression_paused",
            "Compression jobs paused by user",
            Severity::Info,
        );
    }

    /// Clear the pause flag and return every paused record to `pending`.
    pub fn resume(&self) {
        self.inner.cancel.clear_pause();
        match self.inner.catalog.resume_paused() {
            Ok(resumed) => info!(resumed, "compression resumed"),
            Err(err) => warn!(error = %err, "failed to reset paused records"),
        }
        self.inner.catalog.log_event(
            "compression_resumed",
            "Compression jobs resumed",
            Severity::Info,
        );
    }

    /// Abandon in-flight work back to `pending` and drain the pool.
    pub fn stop(&self) {
        self.inner.cancel.stop();
        info!("stopping compression jobs");
        self.inner.catalog.log_event(
            "compression_stopped",
            "Compression jobs stopped by user",
            Severity::Info,
        );
    }

    /// Bump a file to the front of the queue and make sure it is pending.
    pub fn prioritize(&self, file_path: &str, priority: i64) {
        let update = FileUpdate {
            priority: Some(priority),
            ..FileUpdate::default()
        };
        if let Err(err) = self
            .inner
            .catalog
            .update_file_status(file_path, FileStatus::Pending, &update)
        {
            warn!(error = %err, file_path, "failed to prioritize file");
            return;
        }
        info!(file_path, priority, "prioritized file");
        self.inner.catalog.log_event(
            "file_prioritized",
            &format!("File {file_path} prioritized with level {priority}"),
            Severity::Info,
        );
    }

    /// Live status for the monitor surface.
    pub fn status(&self, config: &Config) -> PipelineStatus {
        let state = self.inner.state.lock_unpoisoned();
        let mut active_jobs: Vec<JobSnapshot> = state
            .active_jobs
            .iter()
            .map(|(worker, job)| JobSnapshot {
                worker: *worker,
                filename: job.file_name.clone(),
                full_path: job.file_path.clone(),
                stage: job.stage,
                progress: job.progress,
                size_mb: job.file_size as f64 / (1024.0 * 1024.0),
                elapsed_seconds: job.started.elapsed().as_secs_f64(),
                eta_seconds: job.eta_seconds,
                estimated_time: job.estimated_time,
            })
            .collect();
        active_jobs.sort_by_key(|job| job.worker);

        let session_duration_seconds = state
            .session_start
            .as_ref()
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);

        let status = if !self.session_in_progress() {
            "idle"
        } else if self.inner.cancel.is_paused() {
            "paused"
        } else if self.inner.cancel.is_stopped() {
            "stopping"
        } else {
            "compressing"
        };

        let queue_eta_seconds = self
            .inner
            .catalog
            .statistics()
            .map(|stats| {
                stats.estimated_remaining_time as f64 / config.max_concurrent_jobs.max(1) as f64
            })
            .unwrap_or(0.0);

        PipelineStatus {
            status: status.to_string(),
            paused: self.inner.cancel.is_paused(),
            active_jobs,
            files_processed: state.totals.files_processed,
            errors: state.totals.errors,
            total_original_size: state.totals.total_original_bytes,
            total_compressed_size: state.totals.total_compressed_bytes,
            session_duration_seconds,
            queue_eta_seconds,
        }
    }

    /// Run one compression session over up to `limit` pending records.
    ///
    /// Gates run in order (single session, dependencies, schedule unless
    /// forced, system resources); a refused gate returns `Skipped` without
    /// touching any record. The session ends when the pool drains, writing a
    /// stats row and firing the completion notification.
    pub fn process_queue(
        &self,
        config: &Config,
        limit: Option<usize>,
        force_now: bool,
    ) -> SessionOutcome {
        let inner = &self.inner;

        if inner
            .session_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return SessionOutcome::Skipped {
                reason: "Compression already in progress".to_string(),
            };
        }
        let _session_guard = SessionGuard(&inner.session_active);

        let deps = tools::check_dependencies(config);
        if !deps.ok() {
            let reason = format!("Missing dependencies: {}", deps.missing.join(", "));
            inner
                .catalog
                .log_event("dependency_missing", &reason, Severity::Error);
            return SessionOutcome::Skipped { reason };
        }

        if !force_now && !resources::within_schedule(config, Local::now()) {
            info!("outside the scheduled window or system load too high");
            return SessionOutcome::Skipped {
                reason: "Outside schedule window".to_string(),
            };
        }

        inner.cancel.reset();
        let session_start = Instant::now();
        let session_start_wall = Local::now().to_rfc3339();
        {
            let mut state = inner.state.lock_unpoisoned();
            state.active_jobs.clear();
            state.session_start = Some(session_start);
            state.totals = SessionTotals::default();
        }

        if !resources::check_resources(config, &inner.catalog) {
            warn!("insufficient system resources, postponing compression");
            return SessionOutcome::Skipped {
                reason: "Insufficient system resources".to_string(),
            };
        }

        let max_files = limit.unwrap_or(config.compression_queue_size);
        let records = match inner.catalog.files_for_compression(max_files) {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "failed to fetch compression queue");
                return SessionOutcome::Skipped {
                    reason: format!("Catalog error: {err}"),
                };
            }
        };

        if records.is_empty() {
            info!("no files found for compression");
            return SessionOutcome::Completed {
                files_processed: 0,
                errors: 0,
                total_original_size: 0,
                total_compressed_size: 0,
                savings_percentage: 0.0,
                duration_seconds: session_start.elapsed().as_secs_f64(),
            };
        }

        info!(count = records.len(), "starting compression session");
        let queue: Mutex<VecDeque<PendingFile>> = Mutex::new(records.into());
        let workers = config.max_concurrent_jobs.max(1);

        std::thread::scope(|scope| {
            for worker_index in 0..workers {
                let queue = &queue;
                scope.spawn(move || worker_loop(inner, config, worker_index, queue));
            }
        });

        let duration_seconds = session_start.elapsed().as_secs_f64();
        let totals = {
            let mut state = inner.state.lock_unpoisoned();
            state.session_start = None;
            std::mem::take(&mut state.totals)
        };

        let savings_percentage = if totals.total_original_bytes > 0 {
            (1.0 - totals.total_compressed_bytes as f64 / totals.total_original_bytes as f64)
                * 100.0
        } else {
            0.0
        };

        if totals.files_processed > 0 || totals.errors > 0 {
            let stats = SessionStats {
                start_time: session_start_wall,
                end_time: Local::now().to_rfc3339(),
                files_processed: totals.files_processed,
                total_original_size: totals.total_original_bytes,
                total_compressed_size: totals.total_compressed_bytes,
                savings_percentage,
                errors: totals.errors,
            };
            if let Err(err) = inner.catalog.record_session(&stats) {
                warn!(error = %err, "failed to record session statistics");
            }
            inner.notifier.send_completion(config, &stats);
            info!(
                files = totals.files_processed,
                errors = totals.errors,
                skipped = totals.skipped,
                savings_percentage,
                duration_seconds,
                "compression session completed"
            );
        } else {
            info!("no files were successfully compressed");
        }

        SessionOutcome::Completed {
            files_processed: totals.files_processed,
            errors: totals.errors,
            total_original_size: totals.total_original_bytes,
            total_compressed_size: totals.total_compressed_bytes,
            savings_percentage,
            duration_seconds,
        }
    }
}

fn worker_loop(
    inner: &PipelineInner,
    config: &Config,
    worker_index: usize,
    queue: &Mutex<VecDeque<PendingFile>>,
) {
    loop {
        if inner.cancel.is_stopped() {
            break;
        }
        // While paused, hold off on starting new work; in-flight encodes
        // observe the flag themselves.
        while inner.cancel.is_paused() && !inner.cancel.is_stopped() {
            std::thread::sleep(Duration::from_secs(1));
        }
        if inner.cancel.is_stopped() {
            break;
        }

        let Some(pending) = queue.lock_unpoisoned().pop_front() else {
            break;
        };

        let outcome = worker::guarded_compress(inner, config, worker_index, &pending);
        let mut state = inner.state.lock_unpoisoned();
        match outcome {
            worker::FileOutcome::Success {
                original_size,
                compressed_size,
            } => {
                state.totals.files_processed += 1;
                state.totals.total_original_bytes += original_size;
                state.totals.total_compressed_bytes += compressed_size;
            }
            worker::FileOutcome::Skipped => state.totals.skipped += 1,
            worker::FileOutcome::Error(message) => {
                state.totals.errors += 1;
                drop(state);
                inner
                    .notifier
                    .notify(config, &message, NotifyLevel::Error);
                continue;
            }
            worker::FileOutcome::Paused | worker::FileOutcome::Stopped => {}
        }
    }
}
