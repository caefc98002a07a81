use serde::{Deserialize, Serialize};

/// Lifecycle of one catalog record. The scanner creates records as `new`,
/// the end-of-scan promotion is the only transition into `pending`, and a
/// worker owns every transition out of `in_progress`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    New,
    Pending,
    InProgress,
    Completed,
    Skipped,
    Error,
    NeedsReprocessing,
    Paused,
    Validating,
}

impl FileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FileStatus::New => "new",
            FileStatus::Pending => "pending",
            FileStatus::InProgress => "in_progress",
            FileStatus::Completed => "completed",
            FileStatus::Skipped => "skipped",
            FileStatus::Error => "error",
            FileStatus::NeedsReprocessing => "needs_reprocessing",
            FileStatus::Paused => "paused",
            FileStatus::Validating => "validating",
        }
    }

    pub fn parse(s: &str) -> Option<FileStatus> {
        Some(match s {
            "new" => FileStatus::New,
            "pending" => FileStatus::Pending,
            "in_progress" => FileStatus::InProgress,
            "completed" => FileStatus::Completed,
            "skipped" => FileStatus::Skipped,
            "error" => FileStatus::Error,
            "needs_reprocessing" => FileStatus::NeedsReprocessing,
            "paused" => FileStatus::Paused,
            "validating" => FileStatus::Validating,
            _ => return None,
        })
    }

    /// Terminal rows only get their `last_checked` timestamp refreshed by
    /// subsequent scans; everything else is left for the pipeline.
    pub fn is_terminal(self) -> bool {
        matches!(self, FileStatus::Completed | FileStatus::Error)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Animation,
    LiveAction,
    Mixed,
}

impl ContentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentKind::Animation => "animation",
            ContentKind::LiveAction => "live_action",
            ContentKind::Mixed => "mixed",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

/// Subset of a file record consulted by the scanner when diffing a path
/// against the catalog.
#[derive(Debug, Clone)]
pub struct FileStatusRow {
    pub id: i64,
    pub status: FileStatus,
    pub checksum: String,
    pub original_size: u64,
    pub compressed_size: Option<u64>,
    pub priority: i64,
}

/// Fields for a brand-new catalog record. `add_new_file` falls through to a
/// `last_checked`/`checksum` refresh when the path already exists.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub file_path: String,
    pub size: u64,
    pub checksum: String,
    pub status: FileStatus,
    pub priority: i64,
}

/// Partial update applied to an existing record. Only present fields are
/// written; `increment_compression_count` bumps the counter inside the SQL
/// statement so concurrent updates can never overwrite it.
#[derive(Debug, Clone, Default)]
pub struct FileUpdate {
    pub original_size: Option<u64>,
    pub compressed_size: Option<u64>,
    pub last_checked: Option<String>,
    pub queued_at: Option<String>,
    pub processing_started: Option<String>,
    pub compression_date: Option<String>,
    pub checksum: Option<String>,
    pub content_type: Option<ContentKind>,
    pub quality_score: Option<f64>,
    pub error_message: Option<String>,
    pub skip_reason: Option<String>,
    pub priority: Option<i64>,
    pub estimated_time: Option<i64>,
    pub actual_time: Option<i64>,
    pub increment_compression_count: bool,
}

/// One entry of a bulk update; applied inside a single transaction.
#[derive(Debug, Clone)]
pub struct RecordPatch {
    pub file_path: String,
    pub status: Option<FileStatus>,
    pub update: FileUpdate,
}

/// Row handed to the pipeline by the priority-ordered pending fetch.
#[derive(Debug, Clone)]
pub struct PendingFile {
    pub file_path: String,
    pub original_size: u64,
    pub checksum: String,
    pub priority: i64,
    pub estimated_time: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: i64,
    pub timestamp: String,
    pub event_type: String,
    pub details: String,
    pub severity: String,
}

/// Per-session accounting row, written once when the worker pool drains.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub start_time: String,
    pub end_time: String,
    pub files_processed: u64,
    pub total_original_size: u64,
    pub total_compressed_size: u64,
    pub savings_percentage: f64,
    pub errors: u64,
}

/// Aggregated catalog statistics for the monitor surface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Statistics {
    pub status_counts: std::collections::HashMap<String, u64>,
    pub total_files: u64,
    pub total_original_size: u64,
    pub total_compressed_size: u64,
    pub space_saved: u64,
    pub savings_percentage: f64,
    pub processing_times: ProcessingTimes,
    /// Sum of `estimated_time` over pending rows, in seconds.
    pub estimated_remaining_time: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessingTimes {
    pub average_seconds: f64,
    pub min_seconds: i64,
    pub max_seconds: i64,
}

/// Operational sub-phase of a single file's processing, surfaced per job on
/// the monitor.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Initializing,
    IntegrityCheck,
    ContentAnalysis,
    Encoding,
    QualityCheck,
    Finalizing,
}

impl JobStage {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStage::Initializing => "initializing",
            JobStage::IntegrityCheck => "integrity check",
            JobStage::ContentAnalysis => "content analysis",
            JobStage::Encoding => "encoding",
            JobStage::QualityCheck => "quality check",
            JobStage::Finalizing => "finalizing",
        }
    }
}

/// Snapshot of one active worker's job for the monitor surface. The
/// authoritative copy lives in the pipeline's in-memory job map and is
/// rebuilt from scratch on restart.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub worker: usize,
    pub filename: String,
    pub full_path: String,
    pub stage: JobStage,
    /// Encoder progress in [0, 100].
    pub progress: f64,
    pub size_mb: f64,
    pub elapsed_seconds: f64,
    pub eta_seconds: Option<f64>,
    /// Catalog-side estimate for this file, zero when no sample exists yet.
    pub estimated_time: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip() {
        for status in [
            FileStatus::New,
            FileStatus::Pending,
            FileStatus::InProgress,
            FileStatus::Completed,
            FileStatus::Skipped,
            FileStatus::Error,
            FileStatus::NeedsReprocessing,
            FileStatus::Paused,
            FileStatus::Validating,
        ] {
            assert_eq!(FileStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(FileStatus::parse("bogus"), None);
    }

    #[test]
    fn status_serde_matches_as_str() {
        let json = serde_json::to_string(&FileStatus::NeedsReprocessing).expect("serialize");
        assert_eq!(json, "\"needs_reprocessing\"");
        let back: FileStatus = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, FileStatus::NeedsReprocessing);
    }

    #[test]
    fn only_completed_and_error_are_terminal() {
        assert!(FileStatus::Completed.is_terminal());
        assert!(FileStatus::Error.is_terminal());
        assert!(!FileStatus::Pending.is_terminal());
        assert!(!FileStatus::Skipped.is_terminal());
    }
}
