use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mediapress::press_core::config::{Config, SharedConfig};
use mediapress::press_core::monitor::{MonitorState, spawn_monitor};
use mediapress::press_core::pipeline::SessionOutcome;
use mediapress::press_core::tools;
use mediapress::{Catalog, Daemon, Pipeline, Scanner};

/// Scheduled in-place compression daemon for media libraries.
#[derive(Debug, Parser)]
#[command(name = "mediapress", version, about)]
struct Cli {
    /// Path to configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Only scan for files, don't compress
    #[arg(short = 's', long)]
    scan_only: bool,

    /// Only compress pending files, don't scan
    #[arg(short = 'p', long)]
    compress_only: bool,

    /// Run now regardless of schedule
    #[arg(short = 'n', long)]
    now: bool,

    /// Run as a daemon, checking the schedule periodically
    #[arg(short = 'd', long)]
    daemon: bool,

    /// Limit number of files to process
    #[arg(short = 'l', long)]
    limit: Option<usize>,

    /// Validate and reload the configuration file, then exit
    #[arg(short = 'r', long)]
    reload_config: bool,

    /// Check external tool dependencies and exit
    #[arg(long)]
    check_deps: bool,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let errors = config.validate();
    if !errors.is_empty() {
        anyhow::bail!("configuration validation failed: {}", errors.join("; "));
    }
    Ok(config)
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config = load_config(&cli)?;

    if cli.reload_config {
        // Validation happened in load_config; nothing else to do here.
        info!("configuration reloaded successfully");
        return Ok(ExitCode::SUCCESS);
    }

    if cli.check_deps {
        let report = tools::check_dependencies(&config);
        if report.ok() {
            info!("all dependencies are available");
            return Ok(ExitCode::SUCCESS);
        }
        error!(missing = %report.missing.join(", "), "some dependencies are missing");
        return Ok(ExitCode::FAILURE);
    }

    let catalog = Arc::new(
        Catalog::open(
            std::path::Path::new(&config.database_path),
            std::path::Path::new(&config.backup_path),
            config.recovery.auto_repair,
        )
        .context("failed to open catalog")?,
    );

    // Records left mid-flight by a previous process belong to no live
    // worker; reschedule them before anything else runs.
    let reset = catalog.reset_interrupted()?;
    if reset > 0 {
        info!(reset, "rescheduled records left from a previous run");
    }

    let scanner = Scanner::new(catalog.clone());
    let pipeline = Pipeline::new(catalog.clone());
    let shared_config = SharedConfig::new(config.clone());

    if config.web_interface.enabled {
        spawn_monitor(MonitorState {
            catalog: catalog.clone(),
            scanner: scanner.clone(),
            pipeline: pipeline.clone(),
            config: shared_config.clone(),
            config_path: cli.config.clone(),
        })?;
    }

    if cli.daemon {
        let daemon = Daemon::new(catalog, scanner, pipeline, shared_config);
        daemon.install_signal_handler()?;
        daemon.spawn_backup_task()?;
        daemon.run();
        // A signal-driven exit reports as interrupted.
        return Ok(if daemon.shutdown_requested() {
            ExitCode::FAILURE
        } else {
            ExitCode::SUCCESS
        });
    }

    if cli.scan_only {
        let summary = scanner.run_scan(&config)?;
        info!(
            files = summary.files_scanned,
            new = summary.new_files,
            changed = summary.changed_files,
            "scan finished"
        );
        return Ok(ExitCode::SUCCESS);
    }

    if cli.compress_only {
        return Ok(report_session(pipeline.process_queue(&config, cli.limit, cli.now)));
    }

    // Default: scan, then compress.
    info!("running scan followed by compression");
    let summary = scanner.run_scan(&config)?;
    info!(files = summary.files_scanned, new = summary.new_files, "scan finished");
    Ok(report_session(pipeline.process_queue(&config, cli.limit, cli.now)))
}

fn report_session(outcome: SessionOutcome) -> ExitCode {
    match outcome {
        SessionOutcome::Skipped { reason } => {
            info!(reason = %reason, "compression session skipped");
            ExitCode::SUCCESS
        }
        SessionOutcome::Completed {
            files_processed,
            errors,
            savings_percentage,
            ..
        } => {
            info!(
                files_processed,
                errors, savings_percentage, "compression session finished"
            );
            ExitCode::SUCCESS
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("MEDIAPRESS_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
