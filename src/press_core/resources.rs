//! Point-in-time system readings and the schedule-window predicate.
//!
//! CPU and memory come from a shared `sysinfo::System` instance so the
//! usage baselines are warmed once instead of being re-initialized on every
//! call. The GPU reading reuses a single NVML handle; on hosts without an
//! NVIDIA GPU (or without drivers) it degrades to "unavailable" and the
//! load gate treats utilization as zero.

use std::path::Path;
use std::sync::{Mutex, OnceLock};

use chrono::{DateTime, Local, Timelike};
use nvml_wrapper::Nvml;
use nvml_wrapper::error::NvmlError;
use serde::Serialize;
use sysinfo::System;
use tracing::{debug, info, warn};

use crate::press_core::catalog::Catalog;
use crate::press_core::config::Config;
use crate::press_core::domain::Severity;
use crate::sync_ext::MutexExt;

#[derive(Debug, Clone, Serialize)]
pub struct GpuUsageSnapshot {
    pub available: bool,
    pub gpu_percent: Option<u32>,
    pub memory_percent: Option<u32>,
    pub error: Option<String>,
}

fn shared_system() -> &'static Mutex<System> {
    static SYSTEM: OnceLock<Mutex<System>> = OnceLock::new();
    SYSTEM.get_or_init(|| {
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        Mutex::new(sys)
    })
}

/// Aggregate CPU utilization in [0, 100].
pub fn cpu_percent() -> f32 {
    let mut sys = shared_system().lock_unpoisoned();
    sys.refresh_cpu_usage();
    let cpus = sys.cpus();
    if cpus.is_empty() {
        return 0.0;
    }
    cpus.iter().map(|c| c.cpu_usage()).sum::<f32>() / cpus.len() as f32
}

/// (available, total) memory in bytes.
pub fn memory_usage() -> (u64, u64) {
    let mut sys = shared_system().lock_unpoisoned();
    sys.refresh_memory();
    (sys.available_memory(), sys.total_memory())
}

fn try_sample_gpu_usage() -> Result<GpuUsageSnapshot, NvmlError> {
    static NVML_INSTANCE: OnceLock<Mutex<Option<Nvml>>> = OnceLock::new();

    let mutex = NVML_INSTANCE.get_or_init(|| Mutex::new(None));
    let mut guard = mutex.lock_unpoisoned();
    if guard.is_none() {
        *guard = Some(Nvml::init()?);
    }

    let Some(nvml) = guard.as_ref() else {
        return Err(NvmlError::Uninitialized);
    };
    let device_count = nvml.device_count()?;
    if device_count == 0 {
        return Ok(GpuUsageSnapshot {
            available: false,
            gpu_percent: None,
            memory_percent: None,
            error: Some("No NVIDIA GPUs detected".to_string()),
        });
    }

    let device = nvml.device_by_index(0)?;
    let util = device.utilization_rates()?;
    let memory = device.memory_info()?;
    let memory_percent = if memory.total > 0 {
        Some(((memory.used as f64 / memory.total as f64) * 100.0).round() as u32)
    } else {
        None
    };

    Ok(GpuUsageSnapshot {
        available: true,
        gpu_percent: Some(util.gpu),
        memory_percent,
        error: None,
    })
}

pub fn sample_gpu_usage() -> GpuUsageSnapshot {
    match try_sample_gpu_usage() {
        Ok(snapshot) => snapshot,
        Err(e) => GpuUsageSnapshot {
            available: false,
            gpu_percent: None,
            memory_percent: None,
            error: Some(format!("{e}")),
        },
    }
}

/// Free space on the filesystem holding `path`, in whole megabytes.
pub fn free_space_mb(path: &Path) -> Option<u64> {
    match fs2::available_space(path) {
        Ok(bytes) => Some(bytes / (1024 * 1024)),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to read free space");
            None
        }
    }
}

/// Pre-session resource gate: free space on the temp area and available
/// memory must clear their configured floors. High CPU is only a warning
/// here; the load gate is a separate, stricter predicate.
pub fn check_resources(config: &Config, catalog: &Catalog) -> bool {
    let temp_dir = Path::new(&config.temp_dir);
    match free_space_mb(temp_dir) {
        Some(free) if free < config.min_free_space_mb => {
            let msg = format!(
                "Insufficient disk space on {}: {free}MB free, {}MB required",
                config.temp_dir, config.min_free_space_mb
            );
            warn!("{msg}");
            catalog.log_event("disk_space_error", &msg, Severity::Error);
            return false;
        }
        Some(_) => {}
        None => return false,
    }

    let (available, _total) = memory_usage();
    let available_mb = available / (1024 * 1024);
    if available_mb < config.min_memory_mb {
        let msg = format!(
            "Low memory: {available_mb}MB available, minimum {}MB required",
            config.min_memory_mb
        );
        warn!("{msg}");
        catalog.log_event("resource_warning", &msg, Severity::Warning);
        return false;
    }

    let cpu = cpu_percent();
    if cpu > 90.0 {
        let msg = format!("High CPU usage: {cpu:.0}%");
        warn!("{msg}");
        catalog.log_event("resource_warning", &msg, Severity::Warning);
    }

    true
}

/// Load gate consulted by dynamic scheduling: fails when CPU > 80 %,
/// memory > 90 % or GPU > 80 %.
pub fn check_load() -> bool {
    let cpu = cpu_percent();
    let (available, total) = memory_usage();
    let memory_percent = if total > 0 {
        (total - available) as f64 / total as f64 * 100.0
    } else {
        0.0
    };
    let gpu = sample_gpu_usage().gpu_percent.unwrap_or(0);

    debug!(cpu = cpu as f64, memory_percent, gpu, "system load sample");

    if cpu > 80.0 || memory_percent > 90.0 || gpu > 80 {
        info!(
            cpu = cpu as f64,
            memory_percent, gpu, "system under heavy load, holding compression"
        );
        return false;
    }
    true
}

/// True iff `now` falls inside the configured window, and the host is not
/// under heavy load when dynamic scheduling is enabled. Wrap-around windows
/// are rejected at config validation, so a plain range check suffices.
pub fn within_schedule(config: &Config, now: DateTime<Local>) -> bool {
    if config.schedule.dynamic_scheduling && !check_load() {
        return false;
    }
    hour_in_window(now.hour(), config.schedule.start_hour, config.schedule.end_hour)
}

pub(crate) fn hour_in_window(hour: u32, start_hour: u32, end_hour: u32) -> bool {
    start_hour <= hour && hour < end_hour
}
