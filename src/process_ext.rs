//! Helpers for running external tools with a hard deadline.
//!
//! ffprobe, the quality metrics and the frame extractor are all invoked as
//! short-lived child processes. Each caller supplies a timeout; a child that
//! overruns it is killed and reported as timed out rather than wedging a
//! worker thread.

use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

const CAPTURE_LIMIT: usize = 4 * 1024 * 1024;

pub(crate) struct CommandOutput {
    pub status: ExitStatus,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub(crate) fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }
}

fn capture_stream<R: Read + Send + 'static>(
    stream: Option<R>,
) -> std::thread::JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let Some(mut stream) = stream else {
            return Vec::new();
        };
        let mut captured: Vec<u8> = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => break,
            };
            if captured.len() < CAPTURE_LIMIT {
                let remaining = CAPTURE_LIMIT - captured.len();
                captured.extend_from_slice(&buf[..remaining.min(n)]);
            }
        }
        captured
    })
}

/// Run a command to completion or `timeout`, whichever comes first, capturing
/// bounded stdout/stderr. The child is killed on timeout.
pub(crate) fn run_with_timeout(
    mut cmd: Command,
    timeout: Duration,
) -> Result<CommandOutput, std::io::Error> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn()?;
    let stdout_handle = capture_stream(child.stdout.take());
    let stderr_handle = capture_stream(child.stderr.take());

    let start = Instant::now();
    let mut timed_out = false;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if start.elapsed() >= timeout {
            timed_out = true;
            drop(child.kill());
            break child.wait()?;
        }
        std::thread::sleep(Duration::from_millis(10));
    };

    let stdout = stdout_handle.join().unwrap_or_default();
    let stderr = stderr_handle.join().unwrap_or_default();
    Ok(CommandOutput {
        status,
        timed_out,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}
