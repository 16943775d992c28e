use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use drivesync_core::DriveClient;
use rand::Rng;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::{Mutex, watch};

use super::control::SyncControl;
use super::engine::{SyncEngine, SyncOptions, format_rfc3339};
use super::paths;
use super::progress::{FailedFile, Preflight, ProgressEvent, SyncPhase};
use super::store::{FolderMapping, ItemKind, StateStore, StoreError, SyncRecord};

const QUEUE_KEY: &str = "sync_queue";
const SESSION_KEY: &str = "active_sync_session";
const REPORT_KEY: &str = "last_sync_report";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    Sync,
    Copy,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Sync => "sync",
            SyncMode::Copy => "copy",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobSource {
    Manual,
    Watcher,
    RetryFailed,
    Recovered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: String,
    pub folder_path: PathBuf,
    pub mode: SyncMode,
    pub only_files: Vec<PathBuf>,
    pub source: JobSource,
    pub created_at: String,
}

impl SyncJob {
    /// Composite identity used for queue deduplication: two requests for the
    /// same folder, mode and file subset are the same work.
    pub fn key(&self) -> String {
        job_key(&self.folder_path, self.mode, &self.only_files)
    }
}

pub fn job_key(folder: &Path, mode: SyncMode, only_files: &[PathBuf]) -> String {
    let mut only: Vec<String> = only_files
        .iter()
        .map(|path| paths::normalize_path(path))
        .collect();
    only.sort();
    format!(
        "{}|{}|{}",
        paths::normalize_path(folder),
        mode.as_str(),
        only.join(",")
    )
}

#[derive(Debug, Clone)]
pub struct JobInput {
    pub folder_path: PathBuf,
    pub mode: Option<SyncMode>,
    pub only_files: Vec<PathBuf>,
    pub source: JobSource,
}

impl JobInput {
    fn into_job(self) -> SyncJob {
        let suffix: u32 = rand::thread_rng().gen_range(0..0x1000000);
        let now = OffsetDateTime::now_utc();
        SyncJob {
            id: format!(
                "job-{}-{suffix:06x}",
                now.unix_timestamp_nanos() / 1_000_000
            ),
            folder_path: self.folder_path,
            mode: self.mode.unwrap_or(SyncMode::Sync),
            only_files: self.only_files,
            source: self.source,
            created_at: format_rfc3339(now),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnqueueOptions {
    pub front: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveSyncSession {
    pub job: SyncJob,
    pub started_at: String,
}

/// Persisted summary of the most recent job run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub job_id: String,
    pub mode: SyncMode,
    pub source: JobSource,
    pub folder_path: PathBuf,
    pub started_at: String,
    pub completed_at: String,
    pub success: bool,
    pub cancelled: bool,
    pub files_uploaded: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
    pub total_files: usize,
    pub failed_files: Vec<FailedFile>,
    pub preflight: Option<Preflight>,
    pub conflict_count: usize,
    pub verify_checked_count: usize,
    pub verify_failed_count: usize,
    pub share_link: Option<String>,
    pub error: Option<String>,
}

/// Serialises sync jobs: one runs at a time, the rest wait in a persisted
/// queue that survives restarts.
pub struct SyncCoordinator {
    client: DriveClient,
    store: StateStore,
    engine: SyncEngine,
    queue: Mutex<VecDeque<SyncJob>>,
    active: Mutex<Option<SyncJob>>,
    control: Mutex<Option<SyncControl>>,
    draining: AtomicBool,
    progress: watch::Sender<Option<ProgressEvent>>,
}

impl SyncCoordinator {
    pub fn new(client: DriveClient, store: StateStore) -> Arc<Self> {
        let engine = SyncEngine::new(client.clone(), store.clone());
        let (progress, _) = watch::channel(None);
        Arc::new(Self {
            client,
            store,
            engine,
            queue: Mutex::new(VecDeque::new()),
            active: Mutex::new(None),
            control: Mutex::new(None),
            draining: AtomicBool::new(false),
            progress,
        })
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<Option<ProgressEvent>> {
        self.progress.subscribe()
    }

    /// Returns the queued job, or `None` when an identical job is already
    /// queued or running.
    pub async fn enqueue(
        self: &Arc<Self>,
        input: JobInput,
        options: EnqueueOptions,
    ) -> Result<Option<SyncJob>, StoreError> {
        let job = input.into_job();
        let key = job.key();
        {
            let mut queue = self.queue.lock().await;
            let active = self.active.lock().await;
            let duplicate = queue.iter().any(|queued| queued.key() == key)
                || active.as_ref().is_some_and(|running| running.key() == key);
            if duplicate {
                eprintln!(
                    "[drivesyncd] duplicate job ignored: {}",
                    job.folder_path.display()
                );
                return Ok(None);
            }
            if options.front {
                queue.push_front(job.clone());
            } else {
                queue.push_back(job.clone());
            }
            self.persist_queue(&queue).await?;
        }
        self.spawn_drain();
        Ok(Some(job))
    }

    pub fn spawn_drain(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.drain().await;
        });
    }

    /// Single-flight queue drain; concurrent calls return immediately.
    pub async fn drain(self: &Arc<Self>) {
        if self.draining.swap(true, Ordering::SeqCst) {
            return;
        }
        loop {
            while self.client.is_authenticated() {
                let job = {
                    let mut queue = self.queue.lock().await;
                    let job = queue.pop_front();
                    if job.is_some()
                        && let Err(err) = self.persist_queue(&queue).await
                    {
                        eprintln!("[drivesyncd] warning: could not persist queue: {err}");
                    }
                    job
                };
                let Some(job) = job else { break };
                *self.active.lock().await = Some(job.clone());
                self.run_job(job).await;
                *self.active.lock().await = None;
            }
            self.draining.store(false, Ordering::SeqCst);
            // A job enqueued after the final pop would otherwise sit until
            // the next trigger.
            let has_more =
                self.client.is_authenticated() && !self.queue.lock().await.is_empty();
            if !has_more || self.draining.swap(true, Ordering::SeqCst) {
                return;
            }
        }
    }

    /// Reloads the persisted queue and, when a run was interrupted mid-job,
    /// schedules it again at the head of the queue.
    pub async fn recover_on_startup(self: &Arc<Self>) -> Result<(), StoreError> {
        let persisted: Vec<SyncJob> = self.store.get_json(QUEUE_KEY).await?.unwrap_or_default();
        if !persisted.is_empty() {
            eprintln!("[drivesyncd] restored {} queued job(s)", persisted.len());
            *self.queue.lock().await = persisted.into();
        }
        let session: Option<ActiveSyncSession> = self.store.get_json(SESSION_KEY).await?;
        if let Some(session) = session {
            let tunables = self.store.sync_tunables().await?;
            if tunables.auto_resume_interrupted_sync {
                eprintln!(
                    "[drivesyncd] resuming interrupted sync of {}",
                    session.job.folder_path.display()
                );
                let mut queue = self.queue.lock().await;
                queue.push_front(SyncJob {
                    source: JobSource::Recovered,
                    ..session.job
                });
                self.persist_queue(&queue).await?;
            }
            self.store.delete_setting(SESSION_KEY).await?;
        }
        Ok(())
    }

    /// Re-enqueues the failed files of the last report as a single job.
    pub async fn retry_failed(self: &Arc<Self>) -> Result<Option<SyncJob>, StoreError> {
        let Some(report) = self.last_report().await? else {
            return Ok(None);
        };
        if report.failed_files.is_empty() {
            return Ok(None);
        }
        let only_files = report
            .failed_files
            .iter()
            .map(|failed| failed.local_path.clone())
            .collect();
        self.enqueue(
            JobInput {
                folder_path: report.folder_path,
                mode: Some(report.mode),
                only_files,
                source: JobSource::RetryFailed,
            },
            EnqueueOptions { front: true },
        )
        .await
    }

    pub async fn last_report(&self) -> Result<Option<SyncReport>, StoreError> {
        self.store.get_json(REPORT_KEY).await
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn active_job(&self) -> Option<SyncJob> {
        self.active.lock().await.clone()
    }

    pub async fn pause(&self) {
        if let Some(control) = self.control.lock().await.as_ref() {
            control.pause();
        }
    }

    pub async fn resume(&self) {
        if let Some(control) = self.control.lock().await.as_ref() {
            control.resume();
        }
    }

    pub async fn cancel(&self) {
        if let Some(control) = self.control.lock().await.as_ref() {
            control.cancel();
        }
    }

    async fn persist_queue(&self, queue: &VecDeque<SyncJob>) -> Result<(), StoreError> {
        let jobs: Vec<&SyncJob> = queue.iter().collect();
        self.store.set_json(QUEUE_KEY, &jobs).await
    }

    async fn run_job(&self, job: SyncJob) {
        let started_at = format_rfc3339(OffsetDateTime::now_utc());
        eprintln!(
            "[drivesyncd] job start: {} ({}, {}): {}",
            job.id,
            job.mode.as_str(),
            source_label(job.source),
            job.folder_path.display()
        );
        let session = ActiveSyncSession {
            job: job.clone(),
            started_at: started_at.clone(),
        };
        if let Err(err) = self.store.set_json(SESSION_KEY, &session).await {
            eprintln!("[drivesyncd] warning: could not persist session marker: {err}");
        }
        let control = SyncControl::new();
        *self.control.lock().await = Some(control.clone());

        let report = match self.execute_job(&job, &control, &started_at).await {
            Ok(report) => report,
            Err(err) => {
                eprintln!("[drivesyncd] job failed: {}: {err}", job.id);
                failure_report(&job, &started_at, err.to_string())
            }
        };
        eprintln!(
            "[drivesyncd] job done: {}: uploaded={}, skipped={}, failed={}{}",
            job.id,
            report.files_uploaded,
            report.files_skipped,
            report.files_failed,
            if report.cancelled { " (cancelled)" } else { "" }
        );
        if let Err(err) = self.store.set_json(REPORT_KEY, &report).await {
            eprintln!("[drivesyncd] warning: could not persist report: {err}");
        }
        if let Err(err) = self.store.delete_setting(SESSION_KEY).await {
            eprintln!("[drivesyncd] warning: could not clear session marker: {err}");
        }
        *self.control.lock().await = None;
    }

    async fn execute_job(
        &self,
        job: &SyncJob,
        control: &SyncControl,
        started_at: &str,
    ) -> Result<SyncReport, StoreError> {
        let tunables = self.store.sync_tunables().await?;
        let mut options = SyncOptions::from_tunables(&tunables);
        options.only_files = job.only_files.clone();
        if let Some(mapping) = self.store.get_mapping(&job.folder_path).await? {
            options.exclude_paths = mapping.exclude_paths;
        }

        let progress = self.progress.clone();
        let sink = move |event: ProgressEvent| {
            if event.phase == SyncPhase::Preflight
                && let Some(preflight) = &event.preflight
            {
                eprintln!(
                    "[drivesyncd] preflight: {} file(s), {} new, {} changed, {} unchanged, {} byte(s) to upload",
                    preflight.total_files,
                    preflight.new_files,
                    preflight.changed_files,
                    preflight.skipped_files,
                    preflight.bytes_to_upload
                );
            }
            let _ = progress.send(Some(event));
        };

        let outcome = match self
            .engine
            .sync_folder(&job.folder_path, &options, control, &sink)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => return Ok(failure_report(job, started_at, err.to_string())),
        };

        if job.mode == SyncMode::Sync
            && !outcome.cancelled
            && let Some(folder_id) = &outcome.folder_id
        {
            self.track_synced_root(job, folder_id, outcome.share_link.as_deref())
                .await?;
        }
        if outcome.uploaded_bytes > 0 && outcome.elapsed_ms > 0 {
            let observed = outcome.uploaded_bytes.saturating_mul(1000) / outcome.elapsed_ms;
            self.store.update_avg_upload_speed(observed).await?;
        }

        Ok(SyncReport {
            job_id: job.id.clone(),
            mode: job.mode,
            source: job.source,
            folder_path: job.folder_path.clone(),
            started_at: started_at.to_string(),
            completed_at: format_rfc3339(OffsetDateTime::now_utc()),
            success: outcome.files_failed == 0 && !outcome.cancelled,
            cancelled: outcome.cancelled,
            files_uploaded: outcome.files_uploaded,
            files_skipped: outcome.files_skipped,
            files_failed: outcome.files_failed,
            total_files: outcome.total_files,
            failed_files: outcome.failed_files,
            preflight: Some(outcome.preflight),
            conflict_count: outcome.conflict_count,
            verify_checked_count: outcome.verify_checked_count,
            verify_failed_count: outcome.verify_failed_count,
            share_link: outcome.share_link,
            error: None,
        })
    }

    /// A successful sync-mode job makes the folder a tracked mapping so the
    /// watcher picks it up, keeping any previously configured exclusions.
    async fn track_synced_root(
        &self,
        job: &SyncJob,
        folder_id: &str,
        share_link: Option<&str>,
    ) -> Result<(), StoreError> {
        let name = job
            .folder_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| job.folder_path.display().to_string());
        let exclude_paths = self
            .store
            .get_mapping(&job.folder_path)
            .await?
            .map(|mapping| mapping.exclude_paths)
            .unwrap_or_default();
        self.store
            .upsert_mapping(&FolderMapping {
                local_path: job.folder_path.clone(),
                drive_id: folder_id.to_string(),
                drive_name: name,
                watching: true,
                exclude_paths,
            })
            .await?;
        self.store
            .upsert_record(&SyncRecord {
                local_path: job.folder_path.clone(),
                remote_id: folder_id.to_string(),
                remote_url: share_link.map(str::to_string),
                kind: ItemKind::Folder,
                size_bytes: None,
                mtime_ms: None,
                remote_modified: None,
                remote_size: None,
                remote_md5: None,
                synced_at: format_rfc3339(OffsetDateTime::now_utc()),
            })
            .await
    }
}

fn source_label(source: JobSource) -> &'static str {
    match source {
        JobSource::Manual => "manual",
        JobSource::Watcher => "watcher",
        JobSource::RetryFailed => "retry-failed",
        JobSource::Recovered => "recovered",
    }
}

fn failure_report(job: &SyncJob, started_at: &str, error: String) -> SyncReport {
    SyncReport {
        job_id: job.id.clone(),
        mode: job.mode,
        source: job.source,
        folder_path: job.folder_path.clone(),
        started_at: started_at.to_string(),
        completed_at: format_rfc3339(OffsetDateTime::now_utc()),
        success: false,
        cancelled: false,
        files_uploaded: 0,
        files_skipped: 0,
        files_failed: 0,
        total_files: 0,
        failed_files: Vec::new(),
        preflight: None,
        conflict_count: 0,
        verify_checked_count: 0,
        verify_failed_count: 0,
        share_link: None,
        error: Some(error),
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
