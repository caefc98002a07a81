//! Incremental scanner: reconciles the media roots against the catalog.
//!
//! Each root is walked by one worker thread, with at most
//! `max_concurrent_scans` roots in flight. Extension and size predicates
//! short-circuit before any fingerprinting; catalog writes are batched and
//! flushed every `scan_batch_size` records. After every root has finished,
//! a single promotion moves `new` and `needs_reprocessing` rows to
//! `pending`.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Result, bail};
use serde::Serialize;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::press_core::catalog::Catalog;
use crate::press_core::config::Config;
use crate::press_core::domain::{FileStatus, FileUpdate, NewFile, RecordPatch, Severity};
use crate::press_core::fingerprint::file_fingerprint;
use crate::sync_ext::MutexExt;

const YIELD_EVERY_FILES: u64 = 100;
const ESTIMATE_SAMPLE_CAP: u64 = 1000;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanProgress {
    pub scanning: bool,
    pub current_directory: Option<String>,
    pub files_scanned: u64,
    pub new_files: u64,
    pub changed_files: u64,
    pub progress_percent: f64,
    pub duration_seconds: f64,
    pub eta_seconds: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanSummary {
    pub files_scanned: u64,
    pub new_files: u64,
    pub changed_files: u64,
    pub duration_seconds: f64,
    pub status: String,
    pub message: Option<String>,
}

struct ScannerInner {
    catalog: Arc<Catalog>,
    scanning: AtomicBool,
    stop: AtomicBool,
    files_scanned: AtomicU64,
    new_files: AtomicU64,
    changed_files: AtomicU64,
    estimated_total: AtomicU64,
    current_directory: Mutex<Option<String>>,
    started_at: Mutex<Option<Instant>>,
}

/// Handle to the scanner; cheap to clone, all state shared.
#[derive(Clone)]
pub struct Scanner {
    inner: Arc<ScannerInner>,
}

impl Scanner {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self {
            inner: Arc::new(ScannerInner {
                catalog,
                scanning: AtomicBool::new(false),
                stop: AtomicBool::new(false),
                files_scanned: AtomicU64::new(0),
                new_files: AtomicU64::new(0),
                changed_files: AtomicU64::new(0),
                estimated_total: AtomicU64::new(0),
                current_directory: Mutex::new(None),
                started_at: Mutex::new(None),
            }),
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.scanning.load(Ordering::SeqCst)
    }

    /// Request a cooperative stop; observed at the per-file yield points.
    pub fn stop(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
    }

    pub fn progress(&self) -> ScanProgress {
        let inner = &self.inner;
        let scanning = inner.scanning.load(Ordering::SeqCst);
        let files_scanned = inner.files_scanned.load(Ordering::SeqCst);
        let estimate = inner.estimated_total.load(Ordering::SeqCst);
        let duration = inner
            .started_at
            .lock_unpoisoned()
            .as_ref()
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);

        let progress_percent = if !scanning {
            0.0
        } else if estimate > 0 {
            f64::min(99.0, files_scanned as f64 / estimate as f64 * 100.0)
        } else {
            0.0
        };
        let eta_seconds = (scanning && progress_percent > 0.0)
            .then(|| duration / (progress_percent / 100.0) - duration);

        ScanProgress {
            scanning,
            current_directory: inner.current_directory.lock_unpoisoned().clone(),
            files_scanned,
            new_files: inner.new_files.load(Ordering::SeqCst),
            changed_files: inner.changed_files.load(Ordering::SeqCst),
            progress_percent,
            duration_seconds: duration,
            eta_seconds,
        }
    }

    /// Scan every configured media root and promote the results. Only one
    /// scan may run at a time.
    pub fn run_scan(&self, config: &Config) -> Result<ScanSummary> {
        let inner = &self.inner;
        if inner
            .scanning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            bail!("scan already in progress");
        }

        inner.stop.store(false, Ordering::SeqCst);
        inner.files_scanned.store(0, Ordering::SeqCst);
        inner.new_files.store(0, Ordering::SeqCst);
        inner.changed_files.store(0, Ordering::SeqCst);
        inner.estimated_total.store(0, Ordering::SeqCst);
        let start = Instant::now();
        *inner.started_at.lock_unpoisoned() = Some(start);

        let roots: Vec<String> = config
            .media_paths
            .iter()
            .filter(|path| {
                let p = Path::new(path.as_str());
                let ok = p.exists() && p.is_dir();
                if !ok {
                    warn!(path = %path, "media path does not exist or is not a directory");
                }
                ok
            })
            .cloned()
            .collect();

        if roots.is_empty() {
            warn!("no valid directories to scan");
            inner.scanning.store(false, Ordering::SeqCst);
            return Ok(ScanSummary {
                files_scanned: 0,
                new_files: 0,
                changed_files: 0,
                duration_seconds: 0.0,
                status: "completed".to_string(),
                message: Some("No valid directories to scan".to_string()),
            });
        }

        inner
            .estimated_total
            .store(estimate_candidates(config, &roots), Ordering::SeqCst);

        let queue: Mutex<VecDeque<String>> = Mutex::new(roots.iter().cloned().collect());
        let workers = config.max_concurrent_scans.max(1).min(roots.len());
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        let Some(root) = queue.lock_unpoisoned().pop_front() else {
                            break;
                        };
                        if inner.stop.load(Ordering::SeqCst) {
                            break;
                        }
                        *inner.current_directory.lock_unpoisoned() = Some(root.clone());
                        if let Err(err) = scan_root(inner, config, &root) {
                            warn!(root = %root, error = %err, "error scanning directory");
                            inner.catalog.log_event(
                                "scan_error",
                                &format!("Error scanning directory {root}: {err}"),
                                Severity::Error,
                            );
                        }
                    }
                });
            }
        });
        *inner.current_directory.lock_unpoisoned() = None;

        let promoted = match inner.catalog.promote_scanned() {
            Ok(promoted) => promoted,
            Err(err) => {
                warn!(error = %err, "failed to promote scanned files for compression");
                inner.catalog.log_event(
                    "db_update_error",
                    &format!("Error marking files for compression: {err}"),
                    Severity::Error,
                );
                0
            }
        };
        info!(promoted, "marked files as pending for compression");

        let duration = start.elapsed().as_secs_f64();
        let summary = ScanSummary {
            files_scanned: inner.files_scanned.load(Ordering::SeqCst),
            new_files: inner.new_files.load(Ordering::SeqCst),
            changed_files: inner.changed_files.load(Ordering::SeqCst),
            duration_seconds: duration,
            status: "completed".to_string(),
            message: None,
        };
        info!(
            files = summary.files_scanned,
            new = summary.new_files,
            changed = summary.changed_files,
            duration_seconds = duration,
            "media scan finished"
        );
        inner.catalog.log_event(
            "scan_completed",
            &format!(
                "Scan completed: {} files processed, {} new, {} changed",
                summary.files_scanned, summary.new_files, summary.changed_files
            ),
            Severity::Info,
        );

        inner.scanning.store(false, Ordering::SeqCst);
        Ok(summary)
    }
}

/// Candidate predicate: allow-listed extension and strictly above the size
/// floor. Cheap checks only; fingerprinting happens later.
fn is_candidate(config: &Config, file_name: &str, size: u64) -> bool {
    config.extension_allowed(file_name) && size > config.min_size_bytes()
}

/// Best-effort candidate count for progress reporting. Sampling stops at
/// 1000 matches and extrapolates from the directories seen so far.
fn estimate_candidates(config: &Config, roots: &[String]) -> u64 {
    let mut matched = 0u64;
    let mut dirs_seen = 0u64;
    let mut capped = false;

    'roots: for root in roots {
        for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_dir() {
                dirs_seen += 1;
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            if is_candidate(config, &name, size) {
                matched += 1;
                if matched >= ESTIMATE_SAMPLE_CAP {
                    capped = true;
                    break 'roots;
                }
            }
        }
    }

    if !capped {
        return matched;
    }

    // Hit the sample cap: extrapolate matches-per-directory over the total
    // directory count.
    let total_dirs: u64 = roots
        .iter()
        .map(|root| {
            WalkDir::new(root)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_dir())
                .count() as u64
        })
        .sum();
    let per_dir = matched as f64 / dirs_seen.max(1) as f64;
    (per_dir * total_dirs.max(dirs_seen) as f64) as u64
}

fn scan_root(inner: &ScannerInner, config: &Config, root: &str) -> Result<()> {
    let start = Instant::now();
    let mut pending_patches: Vec<RecordPatch> = Vec::new();
    let mut file_count = 0u64;
    let mut total_size = 0u64;

    info!(root, "starting scan of directory");

    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let size = metadata.len();
        if !is_candidate(config, &name, size) {
            continue;
        }

        file_count += 1;
        total_size += size;
        let scanned_so_far = inner.files_scanned.fetch_add(1, Ordering::SeqCst) + 1;

        let path = entry.path().to_string_lossy().into_owned();
        match inner.catalog.get_file_status(&path)? {
            None => {
                let checksum = match file_fingerprint(entry.path()) {
                    Ok(checksum) => checksum,
                    Err(err) => {
                        warn!(path = %path, error = %err, "failed to fingerprint new file");
                        String::new()
                    }
                };
                inner.catalog.add_new_file(&NewFile {
                    file_path: path,
                    size,
                    checksum,
                    status: FileStatus::New,
                    priority: 0,
                })?;
                let found = inner.new_files.fetch_add(1, Ordering::SeqCst) + 1;
                if found % 100 == 0 {
                    info!(found, "new files discovered so far");
                }
            }
            Some(row) => {
                if size != row.original_size {
                    // Size moved, so pay for a fresh fingerprint; only a
                    // fingerprint change marks the file for reprocessing.
                    let checksum = file_fingerprint(entry.path()).unwrap_or_default();
                    if !checksum.is_empty() && checksum != row.checksum {
                        pending_patches.push(RecordPatch {
                            file_path: path,
                            status: Some(FileStatus::NeedsReprocessing),
                            update: FileUpdate {
                                original_size: Some(size),
                                checksum: Some(checksum),
                                last_checked: Some(chrono::Local::now().to_rfc3339()),
                                ..FileUpdate::default()
                            },
                        });
                        inner.changed_files.fetch_add(1, Ordering::SeqCst);
                    }
                } else if row.status.is_terminal() {
                    // Settled rows stay idempotent across scans; only their
                    // activity timestamp advances.
                    pending_patches.push(RecordPatch {
                        file_path: path,
                        status: None,
                        update: FileUpdate {
                            last_checked: Some(chrono::Local::now().to_rfc3339()),
                            ..FileUpdate::default()
                        },
                    });
                }
            }
        }

        if pending_patches.len() >= config.scan_batch_size {
            inner.catalog.bulk_update(&pending_patches)?;
            pending_patches.clear();
        }

        if scanned_so_far % YIELD_EVERY_FILES == 0 {
            if inner.stop.load(Ordering::SeqCst) {
                break;
            }
            std::thread::yield_now();
        }
    }

    if !pending_patches.is_empty() {
        inner.catalog.bulk_update(&pending_patches)?;
    }

    let duration = start.elapsed().as_secs_f64();
    inner
        .catalog
        .record_directory_scan(root, file_count, total_size, duration)?;
    info!(root, files = file_count, duration_seconds = duration, "completed scan of directory");
    Ok(())
}
