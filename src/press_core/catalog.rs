//! Durable catalog for file records, scan records, session stats and the
//! event log, backed by SQLite.
//!
//! The store self-heals: repairable failures (lock contention, missing
//! tables, corruption) trigger a restore-from-backup (or a rebuild when the
//! backup is also unusable) and the failing operation is retried once.
//! Writers serialize through one connection; every bulk mutation runs in a
//! single transaction.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Local;
use rusqlite::types::Value;
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use thiserror::Error;
use tracing::{info, warn};

use crate::press_core::domain::{
    ContentKind, Event, FileStatus, FileStatusRow, FileUpdate, NewFile, PendingFile,
    ProcessingTimes, RecordPatch, SessionStats, Statistics,
};
use crate::sync_ext::MutexExt;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("database file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("repair failed: {0}")]
    Repair(String),
}

pub type CatalogResult<T> = Result<T, CatalogError>;

/// Lock contention, a missing table or on-disk corruption can all be
/// resolved by restoring the backup; anything else surfaces immediately.
fn is_repairable(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, msg) => {
            matches!(
                e.code,
                ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::NotADatabase
                    | ErrorCode::DatabaseCorrupt
            ) || msg.as_deref().is_some_and(|m| m.contains("no such table"))
        }
        _ => false,
    }
}

fn now_iso() -> String {
    Local::now().to_rfc3339()
}

pub struct Catalog {
    db_path: PathBuf,
    backup_path: PathBuf,
    auto_repair: bool,
    conn: Mutex<Connection>,
    last_backup: Mutex<Option<String>>,
}

impl Catalog {
    /// Open (or create) the catalog, bootstrap the schema, evolve any
    /// missing columns and take an initial backup. A store that cannot even
    /// be bootstrapped goes straight through the repair path.
    pub fn open(db_path: &Path, backup_path: &Path, auto_repair: bool) -> CatalogResult<Catalog> {
        let conn = Connection::open(db_path)?;
        let catalog = Catalog {
            db_path: db_path.to_path_buf(),
            backup_path: backup_path.to_path_buf(),
            auto_repair,
            conn: Mutex::new(conn),
            last_backup: Mutex::new(None),
        };

        {
            let mut guard = catalog.conn.lock_unpoisoned();
            if let Err(err) = init_schema(&guard) {
                if !(auto_repair && is_repairable(&err)) {
                    return Err(err.into());
                }
                warn!(error = %err, "catalog bootstrap failed, attempting repair");
                catalog.repair_locked(&mut guard)?;
            }
            ensure_schema_updated(&guard)?;
        }

        info!(path = %db_path.display(), "catalog initialized");
        if let Err(err) = catalog.backup() {
            warn!(error = %err, "initial catalog backup failed");
        }
        Ok(catalog)
    }

    /// Run an operation against the connection; on a repairable failure,
    /// repair the store and retry exactly once.
    fn with_conn<T>(
        &self,
        mut op: impl FnMut(&mut Connection) -> rusqlite::Result<T>,
    ) -> CatalogResult<T> {
        let mut guard = self.conn.lock_unpoisoned();
        match op(&mut guard) {
            Ok(value) => Ok(value),
            Err(err) if self.auto_repair && is_repairable(&err) => {
                warn!(error = %err, "catalog operation failed, repairing and retrying once");
                self.repair_locked(&mut guard)?;
                op(&mut guard).map_err(CatalogError::from)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Restore the store from its backup, or rebuild it empty when no
    /// usable backup exists. The corrupt file is renamed aside with a
    /// timestamp either way.
    fn repair_locked(&self, guard: &mut Connection) -> CatalogResult<()> {
        let corrupt_path = self
            .db_path
            .with_extension(format!("corrupt.{}", Local::now().timestamp()));

        if self.backup_path.exists() {
            warn!(backup = %self.backup_path.display(), "restoring catalog from backup");
            if self.db_path.exists() {
                fs::rename(&self.db_path, &corrupt_path)?;
                warn!(moved_to = %corrupt_path.display(), "moved corrupt catalog aside");
            }
            fs::copy(&self.backup_path, &self.db_path)?;

            let restored = Connection::open(&self.db_path)?;
            match restored.query_row("SELECT count(*) FROM processed_files", [], |row| {
                row.get::<_, i64>(0)
            }) {
                Ok(count) => {
                    info!(rows = count, "restored catalog verified");
                    *guard = restored;
                    ensure_schema_updated(guard)?;
                    return Ok(());
                }
                Err(err) => {
                    warn!(error = %err, "restored catalog also unusable, rebuilding");
                }
            }
        }

        if self.db_path.exists() {
            let rebuilt_from = self
                .db_path
                .with_extension(format!("corrupt.{}", Local::now().timestamp()));
            // May already have been moved by the restore attempt above.
            if fs::rename(&self.db_path, &rebuilt_from).is_err() && self.db_path.exists() {
                fs::remove_file(&self.db_path)?;
            }
        }

        let fresh = Connection::open(&self.db_path)?;
        init_schema(&fresh).map_err(|err| CatalogError::Repair(err.to_string()))?;
        *guard = fresh;
        warn!("catalog rebuilt from scratch");
        self.log_event_on(guard, "database_rebuilt", "Database was rebuilt due to corruption", "error");
        Ok(())
    }

    /// Public entry point used by the repair-on-demand control path.
    pub fn repair(&self) -> CatalogResult<()> {
        let mut guard = self.conn.lock_unpoisoned();
        self.repair_locked(&mut guard)
    }

    /// Copy the live store to the backup path using SQLite's online backup,
    /// which yields a consistent snapshot even mid-write.
    pub fn backup(&self) -> CatalogResult<()> {
        let guard = self.conn.lock_unpoisoned();
        let mut dst = Connection::open(&self.backup_path)?;
        {
            let backup = rusqlite::backup::Backup::new(&guard, &mut dst)?;
            backup.run_to_completion(100, Duration::from_millis(10), None)?;
        }
        *self.last_backup.lock_unpoisoned() = Some(now_iso());
        info!(path = %self.backup_path.display(), "catalog backup created");
        Ok(())
    }

    pub fn last_backup_time(&self) -> Option<String> {
        self.last_backup.lock_unpoisoned().clone()
    }

    /// `PRAGMA integrity_check` on the live store.
    pub fn check_integrity(&self) -> CatalogResult<bool> {
        self.with_conn(|conn| {
            conn.query_row("PRAGMA integrity_check", [], |row| row.get::<_, String>(0))
        })
        .map(|result| result == "ok")
    }

    fn log_event_on(&self, conn: &Connection, event_type: &str, details: &str, severity: &str) {
        let result = conn.execute(
            "INSERT INTO system_events (timestamp, event_type, details, severity) VALUES (?1, ?2, ?3, ?4)",
            params![now_iso(), event_type, details, severity],
        );
        if let Err(err) = result {
            warn!(error = %err, event_type, "failed to log system event");
        }
    }

    /// Append to the event log. Best effort: a failing event write is noted
    /// and swallowed so it can never abort the operation being reported.
    pub fn log_event(&self, event_type: &str, details: &str, severity: crate::press_core::domain::Severity) {
        let guard = self.conn.lock_unpoisoned();
        self.log_event_on(&guard, event_type, details, severity.as_str());
    }

    pub fn recent_events(&self, limit: usize) -> CatalogResult<Vec<Event>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, timestamp, event_type, details, severity
                 FROM system_events ORDER BY timestamp DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], |row| {
                Ok(Event {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    event_type: row.get(2)?,
                    details: row.get(3)?,
                    severity: row.get(4)?,
                })
            })?;
            rows.collect()
        })
    }

    pub fn get_file_status(&self, file_path: &str) -> CatalogResult<Option<FileStatusRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, status, checksum, original_size, compressed_size, priority
                 FROM processed_files WHERE file_path = ?1",
                params![file_path],
                |row| {
                    let status: String = row.get(1)?;
                    Ok(FileStatusRow {
                        id: row.get(0)?,
                        status: FileStatus::parse(&status).unwrap_or(FileStatus::New),
                        checksum: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                        original_size: row.get::<_, Option<i64>>(3)?.unwrap_or(0) as u64,
                        compressed_size: row.get::<_, Option<i64>>(4)?.map(|v| v as u64),
                        priority: row.get::<_, Option<i64>>(5)?.unwrap_or(0),
                    })
                },
            )
            .optional()
        })
    }

    /// Insert a record for a newly discovered path. On a duplicate path the
    /// insert degrades to a `last_checked` + `checksum` refresh.
    pub fn add_new_file(&self, info: &NewFile) -> CatalogResult<()> {
        let file_name = Path::new(&info.file_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let directory = Path::new(&info.file_path)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let now = now_iso();

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO processed_files
                 (file_path, file_name, directory_path, original_size, first_seen_date,
                  last_checked_date, checksum, status, priority)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(file_path) DO UPDATE SET
                   last_checked_date = excluded.last_checked_date,
                   checksum = excluded.checksum",
                params![
                    info.file_path,
                    file_name,
                    directory,
                    info.size as i64,
                    now,
                    now,
                    info.checksum,
                    info.status.as_str(),
                    info.priority,
                ],
            )
            .map(|_| ())
        })
    }

    /// Partial single-row update; any subset of columns.
    pub fn update_file_status(
        &self,
        file_path: &str,
        status: FileStatus,
        update: &FileUpdate,
    ) -> CatalogResult<()> {
        let (sql, values) = build_update_sql(file_path, Some(status), update);
        self.with_conn(|conn| {
            conn.execute(&sql, rusqlite::params_from_iter(values.iter()))
                .map(|_| ())
        })
    }

    /// Apply a batch of patches inside one transaction; all or nothing.
    pub fn bulk_update(&self, patches: &[RecordPatch]) -> CatalogResult<()> {
        if patches.is_empty() {
            return Ok(());
        }
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            for patch in patches {
                let (sql, values) = build_update_sql(&patch.file_path, patch.status, &patch.update);
                tx.execute(&sql, rusqlite::params_from_iter(values.iter()))?;
            }
            tx.commit()
        })
    }

    /// Pending rows in scheduling order: higher priority first, larger files
    /// first among equals.
    pub fn files_for_compression(&self, limit: usize) -> CatalogResult<Vec<PendingFile>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT file_path, original_size, checksum, priority, estimated_time
                 FROM processed_files
                 WHERE status = 'pending'
                 ORDER BY priority DESC, original_size DESC
                 LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], |row| {
                Ok(PendingFile {
                    file_path: row.get(0)?,
                    original_size: row.get::<_, Option<i64>>(1)?.unwrap_or(0) as u64,
                    checksum: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    priority: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                    estimated_time: row.get::<_, Option<i64>>(4)?.unwrap_or(0),
                })
            })?;
            rows.collect()
        })
    }

    pub fn record_directory_scan(
        &self,
        directory: &str,
        file_count: u64,
        total_size: u64,
        duration_seconds: f64,
    ) -> CatalogResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO scanned_directories
                 (directory_path, last_scan_date, file_count, total_size, scan_duration, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'completed')",
                params![
                    directory,
                    now_iso(),
                    file_count as i64,
                    total_size as i64,
                    duration_seconds,
                ],
            )
            .map(|_| ())
        })
    }

    pub fn record_session(&self, stats: &SessionStats) -> CatalogResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO compression_stats
                 (start_time, end_time, files_processed, total_original_size,
                  total_compressed_size, savings_percentage, errors)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    stats.start_time,
                    stats.end_time,
                    stats.files_processed as i64,
                    stats.total_original_size as i64,
                    stats.total_compressed_size as i64,
                    stats.savings_percentage,
                    stats.errors as i64,
                ],
            )
            .map(|_| ())
        })
    }

    /// Store the observed processing time for a file, then seed
    /// `estimated_time` for every pending row that has none yet using the
    /// seconds-per-MB rate from this sample.
    pub fn update_compression_time(&self, file_path: &str, actual_seconds: i64) -> CatalogResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE processed_files SET actual_time = ?1 WHERE file_path = ?2",
                params![actual_seconds, file_path],
            )?;

            let original_size: Option<i64> = conn
                .query_row(
                    "SELECT original_size FROM processed_files WHERE file_path = ?1",
                    params![file_path],
                    |row| row.get(0),
                )
                .optional()?
                .flatten();

            if let Some(size) = original_size
                && size > 0
            {
                let size_mb = (size as f64 / (1024.0 * 1024.0)).max(1.0);
                let seconds_per_mb = actual_seconds as f64 / size_mb;
                conn.execute(
                    "UPDATE processed_files
                     SET estimated_time = CAST(ROUND(original_size * ?1 / (1024.0 * 1024.0)) AS INTEGER)
                     WHERE status = 'pending' AND estimated_time = 0",
                    params![seconds_per_mb],
                )?;
            }
            Ok(())
        })
    }

    pub fn statistics(&self) -> CatalogResult<Statistics> {
        self.with_conn(|conn| {
            let mut status_counts: HashMap<String, u64> = HashMap::new();
            {
                let mut stmt = conn
                    .prepare("SELECT status, COUNT(*) FROM processed_files GROUP BY status")?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?;
                for row in rows {
                    let (status, count) = row?;
                    status_counts.insert(status, count as u64);
                }
            }

            let total_files: i64 =
                conn.query_row("SELECT COUNT(*) FROM processed_files", [], |row| row.get(0))?;

            let (total_original, total_compressed): (i64, i64) = conn.query_row(
                "SELECT COALESCE(SUM(original_size), 0), COALESCE(SUM(compressed_size), 0)
                 FROM processed_files WHERE status = 'completed'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;

            let (avg_time, min_time, max_time): (f64, i64, i64) = conn.query_row(
                "SELECT COALESCE(AVG(actual_time), 0), COALESCE(MIN(actual_time), 0),
                        COALESCE(MAX(actual_time), 0)
                 FROM processed_files WHERE status = 'completed' AND actual_time > 0",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;

            let remaining: i64 = conn.query_row(
                "SELECT COALESCE(SUM(estimated_time), 0) FROM processed_files WHERE status = 'pending'",
                [],
                |row| row.get(0),
            )?;

            let savings_percentage = if total_original > 0 {
                (total_original - total_compressed) as f64 / total_original as f64 * 100.0
            } else {
                0.0
            };

            Ok(Statistics {
                status_counts,
                total_files: total_files as u64,
                total_original_size: total_original as u64,
                total_compressed_size: total_compressed as u64,
                space_saved: (total_original - total_compressed).max(0) as u64,
                savings_percentage,
                processing_times: ProcessingTimes {
                    average_seconds: avg_time,
                    min_seconds: min_time,
                    max_seconds: max_time,
                },
                estimated_remaining_time: remaining,
            })
        })
    }

    /// End-of-scan promotion: `new` and `needs_reprocessing` rows become
    /// `pending` with a fresh queue timestamp. Returns the number promoted.
    pub fn promote_scanned(&self) -> CatalogResult<usize> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE processed_files SET status = 'pending', queued_date = ?1
                 WHERE status IN ('new', 'needs_reprocessing')",
                params![now_iso()],
            )
        })
    }

    /// `Resume()` support: every paused row goes back to pending.
    pub fn resume_paused(&self) -> CatalogResult<usize> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE processed_files SET status = 'pending' WHERE status = 'paused'",
                [],
            )
        })
    }

    /// Startup reconciliation: rows left `paused` or `in_progress` by a
    /// previous process belong to no live worker and are rescheduled.
    pub fn reset_interrupted(&self) -> CatalogResult<usize> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE processed_files SET status = 'pending'
                 WHERE status IN ('paused', 'in_progress')",
                [],
            )
        })
    }
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS processed_files (
            id INTEGER PRIMARY KEY,
            file_path TEXT UNIQUE,
            file_name TEXT,
            directory_path TEXT,
            original_size INTEGER,
            compressed_size INTEGER,
            first_seen_date TIMESTAMP,
            last_checked_date TIMESTAMP,
            compression_date TIMESTAMP,
            queued_date TIMESTAMP,
            processing_started TIMESTAMP,
            checksum TEXT,
            content_type TEXT,
            quality_score REAL,
            status TEXT,
            error_message TEXT,
            skip_reason TEXT,
            compression_count INTEGER DEFAULT 0,
            priority INTEGER DEFAULT 0,
            estimated_time INTEGER DEFAULT 0,
            actual_time INTEGER DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS compression_stats (
            id INTEGER PRIMARY KEY,
            start_time TIMESTAMP,
            end_time TIMESTAMP,
            files_processed INTEGER,
            total_original_size INTEGER,
            total_compressed_size INTEGER,
            savings_percentage REAL,
            errors INTEGER
        );
        CREATE TABLE IF NOT EXISTS scanned_directories (
            id INTEGER PRIMARY KEY,
            directory_path TEXT UNIQUE,
            last_scan_date TIMESTAMP,
            file_count INTEGER,
            total_size INTEGER,
            scan_duration REAL,
            status TEXT
        );
        CREATE TABLE IF NOT EXISTS system_events (
            id INTEGER PRIMARY KEY,
            timestamp TIMESTAMP,
            event_type TEXT,
            details TEXT,
            severity TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_file_path ON processed_files (file_path);
        CREATE INDEX IF NOT EXISTS idx_status ON processed_files (status);
        CREATE INDEX IF NOT EXISTS idx_directory ON processed_files (directory_path);
        CREATE INDEX IF NOT EXISTS idx_first_seen ON processed_files (first_seen_date);
        CREATE INDEX IF NOT EXISTS idx_priority ON processed_files (priority);",
    )
}

/// Non-destructive schema evolution: add any expected column an older store
/// is missing. Existing data is never rewritten.
fn ensure_schema_updated(conn: &Connection) -> rusqlite::Result<()> {
    let mut existing: Vec<String> = Vec::new();
    {
        let mut stmt = conn.prepare("PRAGMA table_info(processed_files)")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
        for row in rows {
            existing.push(row?);
        }
    }

    for (name, ddl) in [
        ("priority", "INTEGER DEFAULT 0"),
        ("estimated_time", "INTEGER DEFAULT 0"),
        ("actual_time", "INTEGER DEFAULT 0"),
    ] {
        if !existing.iter().any(|c| c == name) {
            info!(column = name, "adding missing catalog column");
            conn.execute(
                &format!("ALTER TABLE processed_files ADD COLUMN {name} {ddl}"),
                [],
            )?;
        }
    }
    Ok(())
}

/// Assemble a partial UPDATE from the present fields of a `FileUpdate`.
fn build_update_sql(
    file_path: &str,
    status: Option<FileStatus>,
    update: &FileUpdate,
) -> (String, Vec<Value>) {
    let mut fields: Vec<String> = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    let mut push = |column: &str, value: Value, fields: &mut Vec<String>, values: &mut Vec<Value>| {
        values.push(value);
        fields.push(format!("{column} = ?{}", values.len()));
    };

    if let Some(status) = status {
        push("status", Value::Text(status.as_str().to_string()), &mut fields, &mut values);
    }
    if let Some(v) = update.original_size {
        push("original_size", Value::Integer(v as i64), &mut fields, &mut values);
    }
    if let Some(v) = update.compressed_size {
        push("compressed_size", Value::Integer(v as i64), &mut fields, &mut values);
    }
    if let Some(v) = &update.last_checked {
        push("last_checked_date", Value::Text(v.clone()), &mut fields, &mut values);
    }
    if let Some(v) = &update.queued_at {
        push("queued_date", Value::Text(v.clone()), &mut fields, &mut values);
    }
    if let Some(v) = &update.processing_started {
        push("processing_started", Value::Text(v.clone()), &mut fields, &mut values);
    }
    if let Some(v) = &update.compression_date {
        push("compression_date", Value::Text(v.clone()), &mut fields, &mut values);
    }
    if let Some(v) = &update.checksum {
        push("checksum", Value::Text(v.clone()), &mut fields, &mut values);
    }
    if let Some(v) = update.content_type {
        push("content_type", Value::Text(v.as_str().to_string()), &mut fields, &mut values);
    }
    if let Some(v) = update.quality_score {
        push("quality_score", Value::Real(v), &mut fields, &mut values);
    }
    if let Some(v) = &update.error_message {
        push("error_message", Value::Text(v.clone()), &mut fields, &mut values);
    }
    if let Some(v) = &update.skip_reason {
        push("skip_reason", Value::Text(v.clone()), &mut fields, &mut values);
    }
    if let Some(v) = update.priority {
        push("priority", Value::Integer(v), &mut fields, &mut values);
    }
    if let Some(v) = update.estimated_time {
        push("estimated_time", Value::Integer(v), &mut fields, &mut values);
    }
    if let Some(v) = update.actual_time {
        push("actual_time", Value::Integer(v), &mut fields, &mut values);
    }
    if update.increment_compression_count {
        // Incremented in SQL so the counter stays monotonic regardless of
        // what the caller last read.
        fields.push("compression_count = compression_count + 1".to_string());
    }

    values.push(Value::Text(file_path.to_string()));
    let sql = format!(
        "UPDATE processed_files SET {} WHERE file_path = ?{}",
        fields.join(", "),
        values.len()
    );
    (sql, values)
}

#[cfg(test)]
mod tests {
    use crate::press_core::domain::Severity;

    use super::*;

    fn temp_catalog(dir: &Path) -> Catalog {
        Catalog::open(&dir.join("catalog.db"), &dir.join("catalog_backup.db"), true)
            .expect("open catalog")
    }

    fn new_file(path: &str, size: u64, status: FileStatus) -> NewFile {
        NewFile {
            file_path: path.to_string(),
            size,
            checksum: format!("sum-{size}"),
            status,
            priority: 0,
        }
    }

    #[test]
    fn add_new_file_is_idempotent_on_duplicate_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let catalog = temp_catalog(dir.path());

        catalog
            .add_new_file(&new_file("/media/a.mkv", 100, FileStatus::New))
            .expect("first insert");
        let mut dup = new_file("/media/a.mkv", 100, FileStatus::New);
        dup.checksum = "refreshed".to_string();
        catalog.add_new_file(&dup).expect("duplicate insert");

        let row = catalog
            .get_file_status("/media/a.mkv")
            .expect("lookup")
            .expect("present");
        assert_eq!(row.status, FileStatus::New);
        assert_eq!(row.checksum, "refreshed");
    }

    #[test]
    fn update_file_status_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let catalog = temp_catalog(dir.path());
        catalog
            .add_new_file(&new_file("/media/a.mkv", 100, FileStatus::Pending))
            .expect("insert");

        let update = FileUpdate {
            error_message: Some("encoder died".to_string()),
            ..FileUpdate::default()
        };
        catalog
            .update_file_status("/media/a.mkv", FileStatus::Error, &update)
            .expect("first update");
        catalog
            .update_file_status("/media/a.mkv", FileStatus::Error, &update)
            .expect("second update");

        let row = catalog
            .get_file_status("/media/a.mkv")
            .expect("lookup")
            .expect("present");
        assert_eq!(row.status, FileStatus::Error);
    }

    #[test]
    fn pending_fetch_orders_by_priority_then_size() {
        let dir = tempfile::tempdir().expect("tempdir");
        let catalog = temp_catalog(dir.path());

        catalog
            .add_new_file(&new_file("/media/small.mkv", 100, FileStatus::Pending))
            .expect("insert");
        catalog
            .add_new_file(&new_file("/media/large.mkv", 900, FileStatus::Pending))
            .expect("insert");
        let mut urgent = new_file("/media/urgent.mkv", 10, FileStatus::Pending);
        urgent.priority = 10;
        catalog.add_new_file(&urgent).expect("insert");

        let pending = catalog.files_for_compression(10).expect("fetch");
        let paths: Vec<&str> = pending.iter().map(|p| p.file_path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["/media/urgent.mkv", "/media/large.mkv", "/media/small.mkv"]
        );

        let limited = catalog.files_for_compression(2).expect("fetch limited");
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn bulk_update_applies_all_patches() {
        let dir = tempfile::tempdir().expect("tempdir");
        let catalog = temp_catalog(dir.path());
        for i in 0..3 {
            catalog
                .add_new_file(&new_file(&format!("/media/{i}.mkv"), 100, FileStatus::New))
                .expect("insert");
        }

        let patches: Vec<RecordPatch> = (0..3)
            .map(|i| RecordPatch {
                file_path: format!("/media/{i}.mkv"),
                status: Some(FileStatus::NeedsReprocessing),
                update: FileUpdate {
                    original_size: Some(200),
                    ..FileUpdate::default()
                },
            })
            .collect();
        catalog.bulk_update(&patches).expect("bulk update");

        for i in 0..3 {
            let row = catalog
                .get_file_status(&format!("/media/{i}.mkv"))
                .expect("lookup")
                .expect("present");
            assert_eq!(row.status, FileStatus::NeedsReprocessing);
            assert_eq!(row.original_size, 200);
        }
    }

    #[test]
    fn promotion_moves_new_and_reprocessing_rows_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let catalog = temp_catalog(dir.path());

        catalog
            .add_new_file(&new_file("/media/new.mkv", 100, FileStatus::New))
            .expect("insert");
        catalog
            .add_new_file(&new_file("/media/redo.mkv", 100, FileStatus::NeedsReprocessing))
            .expect("insert");
        catalog
            .add_new_file(&new_file("/media/done.mkv", 100, FileStatus::Completed))
            .expect("insert");

        let promoted = catalog.promote_scanned().expect("promote");
        assert_eq!(promoted, 2);

        assert_eq!(
            catalog
                .get_file_status("/media/done.mkv")
                .expect("lookup")
                .expect("present")
                .status,
            FileStatus::Completed
        );
        assert_eq!(
            catalog
                .get_file_status("/media/new.mkv")
                .expect("lookup")
                .expect("present")
                .status,
            FileStatus::Pending
        );
    }

    #[test]
    fn resume_clears_every_paused_row() {
        let dir = tempfile::tempdir().expect("tempdir");
        let catalog = temp_catalog(dir.path());
        catalog
            .add_new_file(&new_file("/media/a.mkv", 100, FileStatus::Paused))
            .expect("insert");
        catalog
            .add_new_file(&new_file("/media/b.mkv", 100, FileStatus::Paused))
            .expect("insert");

        catalog.resume_paused().expect("resume");
        let stats = catalog.statistics().expect("stats");
        assert_eq!(stats.status_counts.get("paused"), None);
        assert_eq!(stats.status_counts.get("pending"), Some(&2));
    }

    #[test]
    fn compression_count_increments_instead_of_overwriting() {
        let dir = tempfile::tempdir().expect("tempdir");
        let catalog = temp_catalog(dir.path());
        catalog
            .add_new_file(&new_file("/media/a.mkv", 100, FileStatus::Pending))
            .expect("insert");

        let update = FileUpdate {
            compressed_size: Some(60),
            compression_date: Some(now_iso()),
            increment_compression_count: true,
            ..FileUpdate::default()
        };
        catalog
            .update_file_status("/media/a.mkv", FileStatus::Completed, &update)
            .expect("complete once");
        catalog
            .update_file_status("/media/a.mkv", FileStatus::Completed, &update)
            .expect("complete twice");

        let count: i64 = {
            let guard = catalog.conn.lock_unpoisoned();
            guard
                .query_row(
                    "SELECT compression_count FROM processed_files WHERE file_path = ?1",
                    params!["/media/a.mkv"],
                    |row| row.get(0),
                )
                .expect("count")
        };
        assert_eq!(count, 2);
    }

    #[test]
    fn update_compression_time_seeds_estimates_for_pending_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let catalog = temp_catalog(dir.path());

        let ten_mb = 10 * 1024 * 1024;
        catalog
            .add_new_file(&new_file("/media/done.mkv", ten_mb, FileStatus::Completed))
            .expect("insert");
        catalog
            .add_new_file(&new_file("/media/todo.mkv", 2 * ten_mb, FileStatus::Pending))
            .expect("insert");

        // 100 seconds for 10 MB => 10 s/MB => 200 s estimate for the 20 MB row.
        catalog
            .update_compression_time("/media/done.mkv", 100)
            .expect("record time");

        let pending = catalog.files_for_compression(10).expect("fetch");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].estimated_time, 200);

        let stats = catalog.statistics().expect("stats");
        assert_eq!(stats.estimated_remaining_time, 200);
    }

    #[test]
    fn statistics_reports_histogram_and_sizes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let catalog = temp_catalog(dir.path());

        catalog
            .add_new_file(&new_file("/media/a.mkv", 1000, FileStatus::Pending))
            .expect("insert");
        catalog
            .add_new_file(&new_file("/media/b.mkv", 1000, FileStatus::Pending))
            .expect("insert");
        catalog
            .update_file_status(
                "/media/b.mkv",
                FileStatus::Completed,
                &FileUpdate {
                    original_size: Some(1000),
                    compressed_size: Some(400),
                    actual_time: Some(30),
                    ..FileUpdate::default()
                },
            )
            .expect("complete");

        let stats = catalog.statistics().expect("stats");
        assert_eq!(stats.total_files, 2);
        assert_eq!(stats.status_counts.get("pending"), Some(&1));
        assert_eq!(stats.status_counts.get("completed"), Some(&1));
        assert_eq!(stats.total_original_size, 1000);
        assert_eq!(stats.total_compressed_size, 400);
        assert_eq!(stats.space_saved, 600);
        assert!((stats.savings_percentage - 60.0).abs() < 1e-9);
        assert_eq!(stats.processing_times.min_seconds, 30);
    }

    #[test]
    fn events_come_back_newest_first_and_bounded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let catalog = temp_catalog(dir.path());

        catalog.log_event("scan_completed", "first", Severity::Info);
        std::thread::sleep(std::time::Duration::from_millis(5));
        catalog.log_event("scan_completed", "second", Severity::Info);

        let events = catalog.recent_events(1).expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].details, "second");
    }

    #[test]
    fn repair_restores_from_backup_without_rebuild_event() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("catalog.db");
        let backup_path = dir.path().join("catalog_backup.db");

        {
            let catalog = Catalog::open(&db_path, &backup_path, true).expect("open");
            catalog
                .add_new_file(&new_file("/media/a.mkv", 100, FileStatus::Completed))
                .expect("insert");
            catalog.backup().expect("backup");
        }

        // Clobber the live store with garbage; the reopened catalog must
        // restore from the backup.
        fs::write(&db_path, b"this is not a sqlite database").expect("corrupt");

        let catalog = Catalog::open(&db_path, &backup_path, true).expect("reopen");
        let row = catalog
            .get_file_status("/media/a.mkv")
            .expect("lookup")
            .expect("restored row present");
        assert_eq!(row.status, FileStatus::Completed);

        // A successful restore must not claim the database was rebuilt.
        let events = catalog.recent_events(50).expect("events");
        assert!(events.iter().all(|e| e.event_type != "database_rebuilt"));
    }

    #[test]
    fn repair_rebuilds_when_no_backup_exists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("catalog.db");
        let backup_path = dir.path().join("missing_backup.db");

        fs::write(&db_path, b"garbage").expect("corrupt");
        let catalog = Catalog::open(&db_path, &backup_path, true).expect("open rebuilds");

        let events = catalog.recent_events(50).expect("events");
        assert!(events.iter().any(|e| e.event_type == "database_rebuilt"));
        assert_eq!(catalog.statistics().expect("stats").total_files, 0);
    }

    #[test]
    fn integrity_check_passes_on_fresh_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let catalog = temp_catalog(dir.path());
        assert!(catalog.check_integrity().expect("integrity"));
    }
}
