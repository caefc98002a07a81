//! End-to-end compression sessions against a fake encoder.
//!
//! The encoder is a shell script that emits progress lines and writes the
//! output file, so full sessions run without any real media tooling. Fake
//! ffmpeg/ffprobe stubs are placed on PATH for the dependency gate.

#![cfg(unix)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mediapress::press_core::config::Config;
use mediapress::press_core::domain::{FileStatus, NewFile};
use mediapress::press_core::pipeline::SessionOutcome;
use mediapress::{Catalog, Pipeline};

fn write_executable(path: &Path, contents: &str) {
    use std::os::unix::fs::PermissionsExt;
    fs::write(path, contents).expect("write script");
    let mut perms = fs::metadata(path).expect("stat script").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).expect("chmod script");
}

/// Put stub ffmpeg/ffprobe binaries on PATH once so the dependency gate
/// passes without real media tooling installed.
fn install_fake_probe_tools() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let dir = std::env::temp_dir().join(format!("mediapress-fake-tools-{}", std::process::id()));
        fs::create_dir_all(&dir).expect("fake tool dir");
        write_executable(&dir.join("ffmpeg"), "#!/bin/sh\nexit 0\n");
        write_executable(&dir.join("ffprobe"), "#!/bin/sh\nexit 0\n");
        let path = std::env::var("PATH").unwrap_or_default();
        unsafe {
            std::env::set_var("PATH", format!("{}:{path}", dir.display()));
        }
    });
}

struct Fixture {
    _dir: tempfile::TempDir,
    catalog: Arc<Catalog>,
    pipeline: Pipeline,
    config: Config,
    media_file: PathBuf,
}

/// One pending 1 MiB media file plus a catalog and pipeline wired to the
/// given encoder script.
fn fixture(encoder_script: &str) -> Fixture {
    install_fake_probe_tools();

    let dir = tempfile::tempdir().expect("tempdir");
    let encoder = dir.path().join("encoder.sh");
    write_executable(&encoder, encoder_script);

    let media_dir = dir.path().join("media");
    fs::create_dir_all(&media_dir).expect("media dir");
    let media_file = media_dir.join("movie.mkv");
    fs::write(&media_file, vec![42u8; 1024 * 1024]).expect("write media");

    let temp_dir = dir.path().join("tmp");
    fs::create_dir_all(&temp_dir).expect("temp dir");

    let catalog = Arc::new(
        Catalog::open(
            &dir.path().join("catalog.db"),
            &dir.path().join("backup.db"),
            true,
        )
        .expect("open catalog"),
    );
    catalog
        .add_new_file(&NewFile {
            file_path: media_file.to_string_lossy().into_owned(),
            size: 1024 * 1024,
            checksum: "before".to_string(),
            status: FileStatus::Pending,
            priority: 0,
        })
        .expect("seed pending record");

    let mut config = Config::default();
    config.compression.encoder_path = encoder.to_string_lossy().into_owned();
    config.compression.content_aware = false;
    config.quality_validation.enabled = false;
    config.recovery.verify_files = false;
    config.temp_dir = temp_dir.to_string_lossy().into_owned();
    config.max_concurrent_jobs = 1;
    config.size_reduction_threshold = 0.2;

    let pipeline = Pipeline::new(catalog.clone());
    Fixture {
        _dir: dir,
        catalog,
        pipeline,
        config,
        media_file,
    }
}

const HALVING_ENCODER: &str = r#"#!/bin/sh
if [ "$1" = "--version" ]; then echo "FakeEncoder 1.0"; exit 0; fi
in="$2"
out="$4"
echo "Encoding: task 1 of 1, 50.0 % (ETA 0h0m05s)"
head -c 524288 "$in" > "$out"
"#;

const IDENTITY_ENCODER: &str = r#"#!/bin/sh
if [ "$1" = "--version" ]; then echo "FakeEncoder 1.0"; exit 0; fi
in="$2"
out="$4"
echo "Encoding: task 1 of 1, 50.0 %"
cat "$in" > "$out"
"#;

const SLOW_ENCODER: &str = r#"#!/bin/sh
if [ "$1" = "--version" ]; then echo "FakeEncoder 1.0"; exit 0; fi
i=0
while [ $i -lt 300 ]; do
  echo "Encoding: task 1 of 1, 20.0 %"
  sleep 0.2
  i=$((i+1))
done
"#;

#[test]
fn successful_session_replaces_file_and_completes_record() {
    let fx = fixture(HALVING_ENCODER);

    let outcome = fx.pipeline.process_queue(&fx.config, None, true);
    match outcome {
        SessionOutcome::Completed {
            files_processed,
            errors,
            total_original_size,
            total_compressed_size,
            ..
        } => {
            assert_eq!(files_processed, 1);
            assert_eq!(errors, 0);
            assert_eq!(total_original_size, 1024 * 1024);
            assert_eq!(total_compressed_size, 512 * 1024);
        }
        other => panic!("expected completed session, got {other:?}"),
    }

    // The replacement is the commit: the source file now holds the
    // compressed bytes.
    let on_disk = fs::metadata(&fx.media_file).expect("stat replaced file");
    assert_eq!(on_disk.len(), 512 * 1024);

    let row = fx
        .catalog
        .get_file_status(&fx.media_file.to_string_lossy())
        .expect("lookup")
        .expect("present");
    assert_eq!(row.status, FileStatus::Completed);
    assert_eq!(row.original_size, 1024 * 1024);
    assert_eq!(row.compressed_size, Some(512 * 1024));
    // The fingerprint was recomputed over the replaced file.
    assert_ne!(row.checksum, "before");

    let stats = fx.catalog.statistics().expect("stats");
    assert_eq!(stats.status_counts.get("completed"), Some(&1));
}

#[test]
fn insufficient_reduction_skips_and_keeps_original() {
    let fx = fixture(IDENTITY_ENCODER);

    let outcome = fx.pipeline.process_queue(&fx.config, None, true);
    match outcome {
        SessionOutcome::Completed {
            files_processed,
            errors,
            ..
        } => {
            assert_eq!(files_processed, 0);
            assert_eq!(errors, 0);
        }
        other => panic!("expected completed session, got {other:?}"),
    }

    // Source untouched on disk, record skipped with a composed reason.
    let on_disk = fs::metadata(&fx.media_file).expect("stat");
    assert_eq!(on_disk.len(), 1024 * 1024);

    let row = fx
        .catalog
        .get_file_status(&fx.media_file.to_string_lossy())
        .expect("lookup")
        .expect("present");
    assert_eq!(row.status, FileStatus::Skipped);

    // The temp output was deleted.
    let leftover: Vec<_> = fs::read_dir(Path::new(&fx.config.temp_dir))
        .expect("read temp dir")
        .collect();
    assert!(leftover.is_empty(), "temp dir not cleaned: {leftover:?}");

    let events = fx.catalog.recent_events(20).expect("events");
    assert!(events.iter().all(|e| e.event_type != "notification_error"));
}

#[test]
fn pause_parks_record_and_resume_requeues_it() {
    let fx = fixture(SLOW_ENCODER);

    let pipeline = fx.pipeline.clone();
    let config = fx.config.clone();
    let session = std::thread::spawn(move || pipeline.process_queue(&config, None, true));

    // Wait for the worker to pick the file up and start encoding.
    let key = fx.media_file.to_string_lossy().into_owned();
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = fx.pipeline.status(&fx.config);
        if status.active_jobs.iter().any(|j| j.progress >= 20.0) {
            break;
        }
        assert!(Instant::now() < deadline, "encoder never reported progress");
        std::thread::sleep(Duration::from_millis(50));
    }

    fx.pipeline.pause();

    // The encoder is terminated within about a second and the record parks
    // as paused.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let row = fx
            .catalog
            .get_file_status(&key)
            .expect("lookup")
            .expect("present");
        if row.status == FileStatus::Paused {
            break;
        }
        assert!(Instant::now() < deadline, "record never reached paused");
        std::thread::sleep(Duration::from_millis(50));
    }

    // Temp output is removed on pause.
    let leftover: Vec<_> = fs::read_dir(Path::new(&fx.config.temp_dir))
        .expect("read temp dir")
        .collect();
    assert!(leftover.is_empty(), "temp dir not cleaned: {leftover:?}");

    // Resume returns the record to pending and lets the session drain.
    fx.pipeline.resume();
    let outcome = session.join().expect("session thread");
    assert!(matches!(outcome, SessionOutcome::Completed { .. }));

    let row = fx
        .catalog
        .get_file_status(&key)
        .expect("lookup")
        .expect("present");
    assert_eq!(row.status, FileStatus::Pending);
}

#[test]
fn stop_returns_record_to_pending_and_drains() {
    let fx = fixture(SLOW_ENCODER);

    let pipeline = fx.pipeline.clone();
    let config = fx.config.clone();
    let session = std::thread::spawn(move || pipeline.process_queue(&config, None, true));

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if !fx.pipeline.status(&fx.config).active_jobs.is_empty() {
            break;
        }
        assert!(Instant::now() < deadline, "worker never started");
        std::thread::sleep(Duration::from_millis(50));
    }

    fx.pipeline.stop();
    let outcome = session.join().expect("session thread");
    assert!(matches!(outcome, SessionOutcome::Completed { .. }));

    let row = fx
        .catalog
        .get_file_status(&fx.media_file.to_string_lossy())
        .expect("lookup")
        .expect("present");
    assert_eq!(row.status, FileStatus::Pending);
}
