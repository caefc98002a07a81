//! External tool dependency checks.
//!
//! The encoder, ffmpeg and ffprobe must all be invocable before a session
//! may start. Each is probed with a version-style invocation; a passing
//! check is cached for the life of the process so the gate stays cheap.

use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{error, info};

use crate::press_core::config::Config;
use crate::process_ext::run_with_timeout;

const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

static DEPENDENCIES_OK: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone)]
pub struct DependencyReport {
    pub missing: Vec<String>,
}

impl DependencyReport {
    pub fn ok(&self) -> bool {
        self.missing.is_empty()
    }
}

fn tool_available(name: &str, program: &str, args: &[&str]) -> bool {
    let mut cmd = Command::new(program);
    cmd.args(args);
    match run_with_timeout(cmd, VERSION_CHECK_TIMEOUT) {
        Ok(output) if output.success() => {
            info!(tool = name, "dependency is available");
            true
        }
        Ok(output) => {
            error!(
                tool = name,
                code = output.status.code().unwrap_or(-1),
                "dependency check failed"
            );
            false
        }
        Err(err) => {
            error!(tool = name, error = %err, "dependency not found");
            false
        }
    }
}

/// Probe the encoder, ffmpeg and ffprobe. A previous all-clear is reused.
pub fn check_dependencies(config: &Config) -> DependencyReport {
    if DEPENDENCIES_OK.load(Ordering::Relaxed) {
        return DependencyReport { missing: Vec::new() };
    }

    let encoder = config.compression.encoder_path.as_str();
    let mut missing = Vec::new();
    if !tool_available(encoder, encoder, &["--version"]) {
        missing.push(encoder.to_string());
    }
    if !tool_available("ffmpeg", "ffmpeg", &["-version"]) {
        missing.push("ffmpeg".to_string());
    }
    if !tool_available("ffprobe", "ffprobe", &["-version"]) {
        missing.push("ffprobe".to_string());
    }

    if missing.is_empty() {
        DEPENDENCIES_OK.store(true, Ordering::Relaxed);
    } else {
        error!(missing = %missing.join(", "), "missing dependencies");
    }
    DependencyReport { missing }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonexistent_tool_reports_missing() {
        assert!(!tool_available(
            "bogus",
            "/nonexistent/bogus-tool",
            &["--version"]
        ));
    }

    #[cfg(unix)]
    #[test]
    fn plain_shell_counts_as_available() {
        // `sh -c "exit 0"` stands in for a version probe that exits cleanly.
        assert!(tool_available("sh", "sh", &["-c", "exit 0"]));
    }
}
