//! Daemon loop tying the scheduler, scanner, pipeline and periodic catalog
//! backup together.
//!
//! One thread owns the loop. Scans launch in the background whenever the
//! scanner is idle (scans are allowed outside the window); compression
//! sessions only start inside the window and are bounded by a one-hour
//! safety timeout. Sleeps are taken in short slices so a shutdown signal is
//! observed promptly.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{RecvTimeoutError, channel};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Days, Local, Timelike};
use tracing::{error, info, warn};

use crate::press_core::catalog::Catalog;
use crate::press_core::config::SharedConfig;
use crate::press_core::domain::Severity;
use crate::press_core::pipeline::{Pipeline, SessionOutcome};
use crate::press_core::resources;
use crate::press_core::scanner::Scanner;

/// Safety cap on one compression session.
const SESSION_TIMEOUT: Duration = Duration::from_secs(3600);
/// Settle time after launching a scan before considering compression, so
/// both do not hammer the disk at once.
const POST_SCAN_LAUNCH_SLEEP: Duration = Duration::from_secs(60);
/// Poll interval while inside the schedule window.
const IN_WINDOW_SLEEP: Duration = Duration::from_secs(300);
/// Longest single sleep outside the window.
const MAX_OUT_OF_WINDOW_SLEEP: u64 = 3600;
/// Sleep slice granularity; bounds shutdown latency.
const SLEEP_SLICE: Duration = Duration::from_secs(300);

pub struct Daemon {
    catalog: Arc<Catalog>,
    scanner: Scanner,
    pipeline: Pipeline,
    config: SharedConfig,
    shutdown: Arc<AtomicBool>,
}

impl Daemon {
    pub fn new(
        catalog: Arc<Catalog>,
        scanner: Scanner,
        pipeline: Pipeline,
        config: SharedConfig,
    ) -> Self {
        Self {
            catalog,
            scanner,
            pipeline,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Install the SIGINT/SIGTERM handler: flag shutdown and stop the
    /// pipeline and scanner cooperatively. The final backup runs on the
    /// loop's exit path.
    pub fn install_signal_handler(&self) -> Result<()> {
        let shutdown = self.shutdown.clone();
        let pipeline = self.pipeline.clone();
        let scanner = self.scanner.clone();
        ctrlc::set_handler(move || {
            info!("received shutdown signal, stopping");
            shutdown.store(true, Ordering::SeqCst);
            pipeline.stop();
            scanner.stop();
        })
        .context("failed to install signal handler")
    }

    /// Periodic catalog backup on its own thread, every
    /// `recovery.db_backup_interval` hours.
    pub fn spawn_backup_task(&self) -> Result<()> {
        let catalog = self.catalog.clone();
        let config = self.config.clone();
        let shutdown = self.shutdown.clone();
        std::thread::Builder::new()
            .name("mediapress-db-backup".to_string())
            .spawn(move || {
                loop {
                    let interval_secs = config.get().recovery.db_backup_interval.max(1) * 3600;
                    let mut remaining = interval_secs;
                    while remaining > 0 {
                        if shutdown.load(Ordering::SeqCst) {
                            return;
                        }
                        let slice = remaining.min(SLEEP_SLICE.as_secs());
                        std::thread::sleep(Duration::from_secs(slice));
                        remaining -= slice;
                    }
                    info!("running scheduled catalog backup");
                    if let Err(err) = catalog.backup() {
                        warn!(error = %err, "scheduled catalog backup failed");
                    }
                }
            })
            .context("failed to spawn backup thread")?;
        Ok(())
    }

    /// Sleep in sub-second steps, returning early on shutdown.
    fn sleep_interruptible(&self, duration: Duration) {
        let step = Duration::from_millis(500);
        let mut remaining = duration;
        while !remaining.is_zero() {
            if self.shutdown_requested() {
                return;
            }
            let slice = remaining.min(step);
            std::thread::sleep(slice);
            remaining = remaining.saturating_sub(slice);
        }
    }

    /// Launch a compression session on a worker thread and join it with the
    /// safety timeout; on expiry the pipeline is stopped and the session is
    /// given a moment to drain.
    fn run_session_bounded(&self) {
        let pipeline = self.pipeline.clone();
        let config = self.config.get();
        let (tx, rx) = channel();
        let handle = std::thread::Builder::new()
            .name("mediapress-session".to_string())
            .spawn(move || {
                let outcome = pipeline.process_queue(&config, None, true);
                drop(tx.send(outcome));
            });
        let Ok(handle) = handle else {
            error!("failed to spawn compression session thread");
            return;
        };

        match rx.recv_timeout(SESSION_TIMEOUT) {
            Ok(SessionOutcome::Skipped { reason }) => {
                info!(reason = %reason, "compression session skipped");
            }
            Ok(SessionOutcome::Completed {
                files_processed, ..
            }) => {
                info!(files_processed, "compression session finished");
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("compression session exceeded the safety timeout, stopping it");
                self.pipeline.stop();
                drop(rx.recv_timeout(Duration::from_secs(60)));
                self.catalog.log_event(
                    "session_timeout",
                    "Compression session exceeded the 1-hour safety timeout",
                    Severity::Warning,
                );
            }
            Err(RecvTimeoutError::Disconnected) => {
                warn!("compression session thread ended without reporting");
            }
        }
        drop(handle.join());
    }

    /// The daemon loop. Blocks until shutdown is requested.
    pub fn run(&self) {
        info!("starting in daemon mode");
        while !self.shutdown_requested() {
            let config = self.config.get();
            let now = Local::now();
            let in_window = resources::within_schedule(&config, now);

            if !self.scanner.is_scanning() {
                let scanner = self.scanner.clone();
                let catalog = self.catalog.clone();
                let scan_config = config.clone();
                let spawned = std::thread::Builder::new()
                    .name("mediapress-scan".to_string())
                    .spawn(move || {
                        if let Err(err) = scanner.run_scan(&scan_config) {
                            error!(error = %err, "scan failed");
                            catalog.log_event(
                                "daemon_error",
                                &format!("Error in daemon scan: {err}"),
                                Severity::Error,
                            );
                        }
                    });
                if spawned.is_ok() {
                    // Let the scan settle before possibly starting encoders.
                    self.sleep_interruptible(POST_SCAN_LAUNCH_SLEEP);
                    if self.shutdown_requested() {
                        break;
                    }
                }
            }

            if in_window && !self.pipeline.session_in_progress() && !self.pipeline.is_paused() {
                info!("inside schedule window, starting compression session");
                self.run_session_bounded();
            }

            if self.shutdown_requested() {
                break;
            }

            if in_window {
                self.sleep_interruptible(IN_WINDOW_SLEEP);
            } else {
                let sleep_secs = seconds_until_next_window(
                    Local::now(),
                    self.config.get().schedule.start_hour,
                )
                .min(MAX_OUT_OF_WINDOW_SLEEP);
                info!(minutes = sleep_secs / 60, "outside schedule window, sleeping");
                self.sleep_interruptible(Duration::from_secs(sleep_secs));
            }
        }

        info!("daemon loop exiting, cleaning up");
        self.pipeline.stop();
        self.scanner.stop();
        if let Err(err) = self.catalog.backup() {
            warn!(error = %err, "final catalog backup failed");
        }
    }
}

/// Seconds until the next occurrence of `start_hour`: today if still ahead,
/// otherwise tomorrow.
fn seconds_until_next_window(now: DateTime<Local>, start_hour: u32) -> u64 {
    let today = now.date_naive();
    let target_date = if now.hour() < start_hour {
        today
    } else {
        match today.checked_add_days(Days::new(1)) {
            Some(tomorrow) => tomorrow,
            None => return MAX_OUT_OF_WINDOW_SLEEP,
        }
    };
    let Some(target) = target_date.and_hms_opt(start_hour, 0, 0) else {
        return MAX_OUT_OF_WINDOW_SLEEP;
    };
    (target - now.naive_local()).num_seconds().max(0) as u64
}
