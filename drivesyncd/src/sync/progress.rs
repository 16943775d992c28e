use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncPhase {
    Preflight,
    Upload,
    Retrying,
    ScheduledWait,
}

/// Counts produced by the delta scan before any byte is uploaded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preflight {
    pub total_files: usize,
    pub new_files: usize,
    pub changed_files: usize,
    pub skipped_files: usize,
    pub total_bytes: u64,
    pub bytes_to_upload: u64,
    pub estimated_seconds: Option<u64>,
}

/// Snapshot pushed to the progress callback. Every event carries the full
/// set of counters so consumers can render state without accumulating.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub phase: SyncPhase,
    pub current: usize,
    pub total: usize,
    pub current_file: Option<String>,
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
    pub bytes_to_upload: u64,
    pub remaining_bytes: u64,
    pub bytes_per_second: u64,
    pub eta_seconds: Option<u64>,
    pub estimated_completion: Option<String>,
    pub uploaded_count: usize,
    pub skipped_count: usize,
    pub failed_count: usize,
    pub paused: bool,
    pub preflight: Option<Preflight>,
    pub retry_attempt: Option<u32>,
    pub retry_max_attempts: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub last_error: Option<String>,
    pub schedule_waiting_until: Option<String>,
}

pub type ProgressSink = dyn Fn(ProgressEvent) + Send + Sync;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedFile {
    pub local_path: PathBuf,
    pub remote_id: String,
    pub remote_url: Option<String>,
    pub size_bytes: u64,
    pub mtime_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedFile {
    pub local_path: PathBuf,
    pub error: String,
}

/// Result of one sync job run against a folder.
#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    pub files_uploaded: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
    pub total_files: usize,
    pub uploaded_bytes: u64,
    pub folder_id: Option<String>,
    pub share_link: Option<String>,
    pub uploaded_files: Vec<UploadedFile>,
    pub failed_files: Vec<FailedFile>,
    pub preflight: Preflight,
    pub conflict_count: usize,
    pub verify_checked_count: usize,
    pub verify_failed_count: usize,
    pub cancelled: bool,
    pub elapsed_ms: u64,
}
