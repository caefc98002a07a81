//! Daemon configuration: a single hierarchical JSON document where every
//! field is defaulted, so a partial file on disk is always usable.
//! "Reload" produces a fresh `Config` and installs it atomically through
//! [`SharedConfig`]; running components only pick the new value up at known
//! safe points (between sessions, per daemon-loop iteration).

use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::sync_ext::MutexExt;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub start_hour: u32,
    pub end_hour: u32,
    /// When true the schedule window additionally requires the system-load
    /// gate to pass before a session may start.
    pub dynamic_scheduling: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            start_hour: 2,
            end_hour: 6,
            dynamic_scheduling: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub encoder_path: String,
    /// Flag template handed to the encoder. The `--quality` and
    /// `--encoder-preset` fields are rewritten per file from the classifier
    /// verdict; every other flag is preserved verbatim.
    pub encoder_options: String,
    pub audio_options: String,
    pub subtitle_options: String,
    pub content_aware: bool,
    pub animation_quality: i32,
    pub live_action_quality: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            encoder_path: "HandBrakeCLI".to_string(),
            encoder_options: "--encoder nvenc_h265 --encoder-preset slow --quality 22".to_string(),
            audio_options: "--aencoder copy --all-audio".to_string(),
            subtitle_options: "--all-subtitles --subtitle scan --subtitle-burned=none".to_string(),
            content_aware: true,
            animation_quality: 26,
            live_action_quality: 21,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityValidationConfig {
    pub enabled: bool,
    /// Primary metric; the remaining methods are tried as fallbacks in the
    /// fixed order vmaf, ssim, psnr.
    pub method: String,
    pub threshold: f64,
    pub sample_duration: f64,
}

impl Default for QualityValidationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            method: "vmaf".to_string(),
            threshold: 90.0,
            sample_duration: 60.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebInterfaceConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    /// Enables basic authentication on every monitor route.
    pub secure: bool,
    pub username: String,
    pub password: String,
}

impl Default for WebInterfaceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "localhost".to_string(),
            port: 8080,
            secure: false,
            username: "admin".to_string(),
            password: "password".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub enabled: bool,
    pub smtp_server: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: String,
    pub from_addr: String,
    pub to_addr: String,
    pub on_error: bool,
    pub on_completion: bool,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            smtp_server: "smtp.gmail.com".to_string(),
            smtp_port: 587,
            username: String::new(),
            password: String::new(),
            from_addr: String::new(),
            to_addr: String::new(),
            on_error: true,
            on_completion: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub url: String,
    pub on_error: bool,
    pub on_completion: bool,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            on_error: true,
            on_completion: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    pub email: EmailConfig,
    pub webhook: WebhookConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Hours between scheduled catalog backups.
    pub db_backup_interval: u64,
    pub auto_repair: bool,
    /// Probe-verify sources before encoding and outputs before replacement.
    pub verify_files: bool,
    /// When true, probe timeouts and unparsable probe output fail the
    /// integrity check instead of being accepted.
    pub strict_validation: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            db_backup_interval: 24,
            auto_repair: true,
            verify_files: true,
            strict_validation: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub media_paths: Vec<String>,
    pub schedule: ScheduleConfig,
    pub compression: CompressionConfig,
    pub quality_validation: QualityValidationConfig,
    pub database_path: String,
    pub backup_path: String,
    pub extensions: Vec<String>,
    /// Files at or below this size are never candidates (strict inequality).
    pub min_size_mb: u64,
    /// Minimum fractional size reduction for a replacement to commit.
    pub size_reduction_threshold: f64,
    pub max_concurrent_jobs: usize,
    pub max_concurrent_scans: usize,
    pub scan_batch_size: usize,
    pub compression_queue_size: usize,
    pub temp_dir: String,
    pub min_free_space_mb: u64,
    pub min_memory_mb: u64,
    pub web_interface: WebInterfaceConfig,
    pub notifications: NotificationsConfig,
    pub recovery: RecoveryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            media_paths: Vec::new(),
            schedule: ScheduleConfig::default(),
            compression: CompressionConfig::default(),
            quality_validation: QualityValidationConfig::default(),
            database_path: "media_compression.db".to_string(),
            backup_path: "media_compression_backup.db".to_string(),
            extensions: vec![
                ".mp4".to_string(),
                ".mkv".to_string(),
                ".avi".to_string(),
                ".m4v".to_string(),
            ],
            min_size_mb: 200,
            size_reduction_threshold: 0.2,
            max_concurrent_jobs: 2,
            max_concurrent_scans: 4,
            scan_batch_size: 1000,
            compression_queue_size: 1000,
            temp_dir: "/tmp/media_compression".to_string(),
            min_free_space_mb: 1000,
            min_memory_mb: 500,
            web_interface: WebInterfaceConfig::default(),
            notifications: NotificationsConfig::default(),
            recovery: RecoveryConfig::default(),
        }
    }
}

impl Config {
    /// Load a config file, layering it over the defaults. A missing path is
    /// an error; an empty document yields the defaults.
    pub fn load(path: &Path) -> Result<Config> {
        let file = fs::File::open(path)
            .with_context(|| format!("failed to open config file {}", path.display()))?;
        let reader = BufReader::new(file);
        let config: Config = serde_json::from_reader(reader)
            .with_context(|| format!("failed to parse JSON from {}", path.display()))?;
        Ok(config)
    }

    /// Validate the configuration, returning every problem found rather than
    /// stopping at the first. Missing media paths are warnings only.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        for path in &self.media_paths {
            let p = Path::new(path);
            if !p.exists() {
                tracing::warn!(path, "media path does not exist");
            } else if !p.is_dir() {
                errors.push(format!("media path is not a directory: {path}"));
            }
        }

        if self.schedule.start_hour >= 24 {
            errors.push(format!(
                "invalid start hour: {}. Must be 0-23.",
                self.schedule.start_hour
            ));
        }
        if self.schedule.end_hour >= 24 {
            errors.push(format!(
                "invalid end hour: {}. Must be 0-23.",
                self.schedule.end_hour
            ));
        }
        if self.schedule.start_hour == self.schedule.end_hour {
            errors.push(format!(
                "start hour and end hour cannot be the same: {}",
                self.schedule.start_hour
            ));
        } else if self.schedule.start_hour > self.schedule.end_hour {
            // Wrap-around windows (e.g. 22 -> 6) are not supported.
            errors.push(format!(
                "schedule window must not wrap around midnight: {} -> {}",
                self.schedule.start_hour, self.schedule.end_hour
            ));
        }

        if !(0.0..=100.0).contains(&self.quality_validation.threshold) {
            errors.push(format!(
                "invalid quality threshold: {}. Must be 0-100.",
                self.quality_validation.threshold
            ));
        }

        if self.min_size_mb == 0 {
            errors.push("min_size_mb must be positive".to_string());
        }

        let temp_dir = Path::new(&self.temp_dir);
        if !temp_dir.exists() {
            if let Err(err) = fs::create_dir_all(temp_dir) {
                errors.push(format!(
                    "could not create temp directory {}: {err}",
                    self.temp_dir
                ));
            }
        }

        if let Some(db_dir) = Path::new(&self.database_path).parent()
            && !db_dir.as_os_str().is_empty()
            && !db_dir.exists()
            && let Err(err) = fs::create_dir_all(db_dir)
        {
            errors.push(format!(
                "could not create database directory {}: {err}",
                db_dir.display()
            ));
        }

        if self.web_interface.enabled {
            if self.web_interface.port < 1024 {
                errors.push(format!(
                    "invalid web interface port: {}. Must be 1024-65535.",
                    self.web_interface.port
                ));
            }
            if self.web_interface.secure {
                if self.web_interface.username.is_empty() {
                    errors.push("missing username for secure web interface".to_string());
                }
                if self.web_interface.password.is_empty() {
                    errors.push("missing password for secure web interface".to_string());
                }
            }
        }

        if self.notifications.email.enabled {
            let email = &self.notifications.email;
            for (field, value) in [
                ("smtp_server", &email.smtp_server),
                ("username", &email.username),
                ("password", &email.password),
                ("from_addr", &email.from_addr),
                ("to_addr", &email.to_addr),
            ] {
                if value.is_empty() {
                    errors.push(format!("missing required email configuration: {field}"));
                }
            }
        }

        errors
    }

    pub fn min_size_bytes(&self) -> u64 {
        self.min_size_mb * 1024 * 1024
    }

    /// Case-insensitive extension allow-list check on a file name.
    pub fn extension_allowed(&self, file_name: &str) -> bool {
        let lower = file_name.to_lowercase();
        self.extensions.iter().any(|ext| lower.ends_with(ext))
    }
}

/// A config slot shared between the daemon loop, the pipeline and the
/// monitor surface. Readers take a cheap `Arc` snapshot; reload swaps the
/// whole document in one step.
#[derive(Clone)]
pub struct SharedConfig {
    inner: Arc<Mutex<Arc<Config>>>,
}

impl SharedConfig {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Arc::new(config))),
        }
    }

    pub fn get(&self) -> Arc<Config> {
        self.inner.lock_unpoisoned().clone()
    }

    pub fn replace(&self, config: Config) {
        *self.inner.lock_unpoisoned() = Arc::new(config);
    }

    /// Re-read the config file and install it if it validates.
    pub fn reload_from(&self, path: &PathBuf) -> Result<()> {
        let config = Config::load(path)?;
        let errors = config.validate();
        if !errors.is_empty() {
            anyhow::bail!("configuration validation failed: {}", errors.join("; "));
        }
        self.replace(config);
        Ok(())
    }
}
