use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use drivesync_core::{DriveClient, DriveError, DriveFile, UploadOptions};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::io::AsyncReadExt;

use super::backoff::Backoff;
use super::conflict;
use super::control::SyncControl;
use super::discovery::{self, DiscoveredFile};
use super::progress::{
    FailedFile, Preflight, ProgressEvent, ProgressSink, SyncOutcome, SyncPhase, UploadedFile,
};
use super::schedule::{ScheduleError, ScheduleWindow, local_now};
use super::store::{ItemKind, StateStore, StoreError, SyncRecord, SyncTunables};

const KEEP_BOTH_LOCAL_WINS: &str = "keep-both-local-wins";
const SCHEDULE_POLL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("remote error: {0}")]
    Drive(#[from] DriveError),
    #[error("state store error: {0}")]
    Store(#[from] StoreError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("schedule error: {0}")]
    Schedule(#[from] ScheduleError),
    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),
    #[error("uploaded content does not match {}", .0.display())]
    Integrity(PathBuf),
}

impl EngineError {
    fn is_cancellation(&self) -> bool {
        matches!(self, EngineError::Drive(DriveError::Cancelled))
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub only_files: Vec<PathBuf>,
    pub exclude_paths: Vec<String>,
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub verify_uploads: bool,
    pub verify_sample_rate: f64,
    pub bandwidth_limit_bytes_per_sec: u64,
    pub schedule: ScheduleConfig,
    pub estimated_speed_bps: u64,
    pub conflict_policy: String,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from_tunables(&SyncTunables::default())
    }
}

impl SyncOptions {
    pub fn from_tunables(tunables: &SyncTunables) -> Self {
        Self {
            only_files: Vec::new(),
            exclude_paths: Vec::new(),
            retry_max_attempts: tunables.retry_max_attempts,
            retry_base_delay_ms: tunables.retry_base_delay_ms,
            retry_max_delay_ms: tunables.retry_max_delay_ms,
            verify_uploads: tunables.verify_uploads,
            verify_sample_rate: tunables.verify_sample_rate,
            bandwidth_limit_bytes_per_sec: tunables.upload_bandwidth_limit_kbps * 1024,
            schedule: ScheduleConfig {
                enabled: tunables.schedule_enabled,
                start: tunables.schedule_start.clone(),
                end: tunables.schedule_end.clone(),
            },
            estimated_speed_bps: tunables.avg_upload_speed_bps,
            conflict_policy: tunables.conflict_policy.clone(),
        }
    }
}

enum PlanAction {
    Skip,
    Upload { prior: Option<SyncRecord> },
}

struct PlannedFile {
    file: DiscoveredFile,
    action: PlanAction,
}

struct Progress<'a> {
    sink: &'a ProgressSink,
    control: &'a SyncControl,
    started: Instant,
    preflight: Preflight,
    current: usize,
    uploaded_bytes: u64,
    uploaded_count: usize,
    skipped_count: usize,
    failed_count: usize,
}

impl Progress<'_> {
    fn base_event(&self, phase: SyncPhase) -> ProgressEvent {
        let elapsed = self.started.elapsed().as_secs_f64();
        let bytes_per_second = if elapsed > 0.0 {
            (self.uploaded_bytes as f64 / elapsed) as u64
        } else {
            0
        };
        let remaining_bytes = self.preflight.bytes_to_upload.saturating_sub(self.uploaded_bytes);
        let eta_seconds =
            (bytes_per_second > 0).then(|| remaining_bytes.div_ceil(bytes_per_second));
        let estimated_completion = eta_seconds.and_then(|eta| {
            (OffsetDateTime::now_utc() + time::Duration::seconds(eta as i64))
                .format(&Rfc3339)
                .ok()
        });
        ProgressEvent {
            phase,
            current: self.current,
            total: self.preflight.total_files,
            current_file: None,
            uploaded_bytes: self.uploaded_bytes,
            total_bytes: self.preflight.total_bytes,
            bytes_to_upload: self.preflight.bytes_to_upload,
            remaining_bytes,
            bytes_per_second,
            eta_seconds,
            estimated_completion,
            uploaded_count: self.uploaded_count,
            skipped_count: self.skipped_count,
            failed_count: self.failed_count,
            paused: self.control.is_paused(),
            preflight: None,
            retry_attempt: None,
            retry_max_attempts: None,
            retry_delay_ms: None,
            last_error: None,
            schedule_waiting_until: None,
        }
    }

    fn emit(&self, event: ProgressEvent) {
        (self.sink)(event);
    }
}

pub struct SyncEngine {
    client: DriveClient,
    store: StateStore,
}

impl SyncEngine {
    pub fn new(client: DriveClient, store: StateStore) -> Self {
        Self { client, store }
    }

    /// Runs one sync job over `folder`. Per-file failures are collected in
    /// the outcome; only job-level problems (folder missing, destination
    /// resolution failing) surface as `Err`.
    pub async fn sync_folder(
        &self,
        folder: &Path,
        options: &SyncOptions,
        control: &SyncControl,
        on_progress: &ProgressSink,
    ) -> Result<SyncOutcome, EngineError> {
        let meta = tokio::fs::metadata(folder).await?;
        if !meta.is_dir() {
            return Err(EngineError::NotADirectory(folder.to_path_buf()));
        }
        let window = options
            .schedule
            .enabled
            .then(|| ScheduleWindow::parse(&options.schedule.start, &options.schedule.end))
            .transpose()?;

        let started = Instant::now();
        let files =
            discovery::discover_files(folder, &options.exclude_paths, &options.only_files).await;
        let (plan, preflight) = self.preflight(&files, options).await?;

        let mut progress = Progress {
            sink: on_progress,
            control,
            started,
            preflight: preflight.clone(),
            current: 0,
            uploaded_bytes: 0,
            uploaded_count: 0,
            skipped_count: 0,
            failed_count: 0,
        };
        let mut event = progress.base_event(SyncPhase::Preflight);
        event.preflight = Some(preflight.clone());
        progress.emit(event);

        let mut outcome = SyncOutcome {
            total_files: preflight.total_files,
            preflight,
            ..SyncOutcome::default()
        };

        if control.is_cancelled() {
            outcome.cancelled = true;
            outcome.elapsed_ms = started.elapsed().as_millis() as u64;
            return Ok(outcome);
        }

        let root_id = self.resolve_root_folder(folder).await?;
        outcome.folder_id = Some(root_id.clone());

        let mut dir_ids: HashMap<String, String> = HashMap::new();
        for planned in plan {
            if control.is_cancelled() {
                outcome.cancelled = true;
                break;
            }
            if let Some(window) = &window {
                self.wait_for_window(window, control, &mut progress).await;
            }
            control.wait_while_paused().await;
            if control.is_cancelled() {
                outcome.cancelled = true;
                break;
            }

            progress.current += 1;
            match planned.action {
                PlanAction::Skip => {
                    progress.skipped_count += 1;
                    outcome.files_skipped += 1;
                    let mut event = progress.base_event(SyncPhase::Upload);
                    event.current_file = Some(planned.file.relative.clone());
                    progress.emit(event);
                }
                PlanAction::Upload { prior } => {
                    self.sync_one_file(
                        folder,
                        &root_id,
                        &mut dir_ids,
                        planned.file,
                        prior,
                        options,
                        window.as_ref(),
                        control,
                        &mut progress,
                        &mut outcome,
                    )
                    .await?;
                }
            }
        }

        if control.is_cancelled() {
            outcome.cancelled = true;
        }
        if !outcome.cancelled {
            match self.client.get_folder_link(&root_id).await {
                Ok(link) => outcome.share_link = link,
                Err(err) => {
                    eprintln!("[drivesyncd] warning: could not fetch folder link: {err}");
                }
            }
        }
        outcome.elapsed_ms = started.elapsed().as_millis() as u64;
        Ok(outcome)
    }

    async fn preflight(
        &self,
        files: &[DiscoveredFile],
        options: &SyncOptions,
    ) -> Result<(Vec<PlannedFile>, Preflight), EngineError> {
        let mut preflight = Preflight {
            total_files: files.len(),
            ..Preflight::default()
        };
        let mut plan = Vec::with_capacity(files.len());
        for file in files {
            preflight.total_bytes += file.size;
            let prior = self.store.get_record(&file.path).await?;
            let unchanged = prior.as_ref().is_some_and(|record| {
                record.size_bytes == Some(file.size as i64)
                    && record.mtime_ms == Some(file.mtime_ms)
            });
            if unchanged {
                preflight.skipped_files += 1;
                plan.push(PlannedFile {
                    file: file.clone(),
                    action: PlanAction::Skip,
                });
                continue;
            }
            if prior.is_some() {
                preflight.changed_files += 1;
            } else {
                preflight.new_files += 1;
            }
            preflight.bytes_to_upload += file.size;
            plan.push(PlannedFile {
                file: file.clone(),
                action: PlanAction::Upload { prior },
            });
        }
        if options.estimated_speed_bps > 0 {
            preflight.estimated_seconds =
                Some(preflight.bytes_to_upload.div_ceil(options.estimated_speed_bps));
        }
        Ok((plan, preflight))
    }

    /// An exact folder mapping short-circuits to its stored id, so re-syncing
    /// a mapped folder never nests a duplicate remote folder. Otherwise the
    /// nearest mapped ancestor (or the remote root) hosts a new folder.
    async fn resolve_root_folder(&self, folder: &Path) -> Result<String, EngineError> {
        if let Some(mapping) = self.store.get_mapping(folder).await? {
            return Ok(mapping.drive_id);
        }
        let name = folder
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| folder.display().to_string());
        let parent_id = match self.store.mapping_for_path_or_ancestor(folder).await? {
            Some((mapping, relative)) => {
                let intermediate = Path::new(&relative)
                    .parent()
                    .map(|p| p.to_string_lossy().replace('\\', "/"))
                    .unwrap_or_default();
                if intermediate.is_empty() {
                    mapping.drive_id
                } else {
                    self.client
                        .ensure_folder_path(&intermediate, &mapping.drive_id)
                        .await?
                }
            }
            None => "root".to_string(),
        };
        let root = self.client.find_or_create_folder(&name, &parent_id).await?;
        Ok(root.id)
    }

    #[allow(clippy::too_many_arguments)]
    async fn sync_one_file(
        &self,
        folder: &Path,
        root_id: &str,
        dir_ids: &mut HashMap<String, String>,
        file: DiscoveredFile,
        prior: Option<SyncRecord>,
        options: &SyncOptions,
        window: Option<&ScheduleWindow>,
        control: &SyncControl,
        progress: &mut Progress<'_>,
        outcome: &mut SyncOutcome,
    ) -> Result<(), EngineError> {
        // Conflict handling runs once per file, before any upload attempt,
        // and only when the prior record captured both sides' timestamps.
        if options.conflict_policy == KEEP_BOTH_LOCAL_WINS
            && let Some(prior) = prior
                .as_ref()
                .filter(|p| p.remote_modified.is_some() && p.mtime_ms.is_some())
        {
            match self.preserve_remote_on_conflict(&file, prior).await {
                Ok(true) => {
                    outcome.conflict_count += 1;
                    eprintln!(
                        "[drivesyncd] conflict: kept remote copy of {}",
                        file.relative
                    );
                }
                Ok(false) => {}
                Err(err) => {
                    eprintln!(
                        "[drivesyncd] warning: conflict check failed for {}: {err}",
                        file.relative
                    );
                }
            }
        }

        let existing_id = prior.as_ref().map(|p| p.remote_id.clone());
        let verify = options.verify_uploads
            && rand::random::<f64>() < options.verify_sample_rate;
        let backoff = Backoff::new(
            Duration::from_millis(options.retry_base_delay_ms),
            Duration::from_millis(options.retry_max_delay_ms),
            true,
        );

        let mut attempt = 1u32;
        let uploaded = loop {
            // Retries also respect the upload window: a window that closes
            // between attempts holds the next one until it reopens.
            if let Some(window) = window {
                self.wait_for_window(window, control, progress).await;
            }
            control.wait_while_paused().await;
            if control.is_cancelled() {
                break None;
            }
            let result = self
                .upload_once(
                    folder,
                    root_id,
                    dir_ids,
                    &file,
                    existing_id.as_deref(),
                    verify,
                    options,
                    control,
                    outcome,
                )
                .await;
            match result {
                Ok(remote) => break Some(remote),
                Err(err) if err.is_cancellation() || control.is_cancelled() => break None,
                Err(err) => {
                    if attempt >= options.retry_max_attempts {
                        eprintln!(
                            "[drivesyncd] upload failed after {attempt} attempt(s): {}: {err}",
                            file.relative
                        );
                        outcome.files_failed += 1;
                        progress.failed_count += 1;
                        outcome.failed_files.push(FailedFile {
                            local_path: file.path.clone(),
                            error: err.to_string(),
                        });
                        let mut event = progress.base_event(SyncPhase::Upload);
                        event.current_file = Some(file.relative.clone());
                        event.last_error = Some(err.to_string());
                        progress.emit(event);
                        return Ok(());
                    }
                    let delay = backoff.delay(attempt);
                    eprintln!(
                        "[drivesyncd] retrying {} (attempt {attempt}/{}) in {}ms: {err}",
                        file.relative,
                        options.retry_max_attempts,
                        delay.as_millis()
                    );
                    let mut event = progress.base_event(SyncPhase::Retrying);
                    event.current_file = Some(file.relative.clone());
                    event.retry_attempt = Some(attempt);
                    event.retry_max_attempts = Some(options.retry_max_attempts);
                    event.retry_delay_ms = Some(delay.as_millis() as u64);
                    event.last_error = Some(err.to_string());
                    progress.emit(event);
                    control.sleep_interruptible(delay).await;
                    attempt += 1;
                }
            }
        };

        let Some(remote) = uploaded else {
            // Cancelled mid-file: not a failure, the job reports cancelled.
            return Ok(());
        };

        let record = SyncRecord {
            local_path: file.path.clone(),
            remote_id: remote.id.clone(),
            remote_url: remote.web_view_link.clone(),
            kind: ItemKind::File,
            size_bytes: Some(file.size as i64),
            mtime_ms: Some(file.mtime_ms),
            remote_modified: remote.modified_time.clone(),
            remote_size: remote.size.map(|s| s as i64),
            remote_md5: remote.md5_checksum.clone(),
            synced_at: format_rfc3339(OffsetDateTime::now_utc()),
        };
        self.store.upsert_record(&record).await?;

        progress.uploaded_bytes += file.size;
        progress.uploaded_count += 1;
        outcome.files_uploaded += 1;
        outcome.uploaded_bytes += file.size;
        outcome.uploaded_files.push(UploadedFile {
            local_path: file.path.clone(),
            remote_id: remote.id,
            remote_url: remote.web_view_link,
            size_bytes: file.size,
            mtime_ms: file.mtime_ms,
        });
        let mut event = progress.base_event(SyncPhase::Upload);
        event.current_file = Some(file.relative.clone());
        progress.emit(event);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn upload_once(
        &self,
        folder: &Path,
        root_id: &str,
        dir_ids: &mut HashMap<String, String>,
        file: &DiscoveredFile,
        existing_id: Option<&str>,
        verify: bool,
        options: &SyncOptions,
        control: &SyncControl,
        outcome: &mut SyncOutcome,
    ) -> Result<DriveFile, EngineError> {
        let parent_id = self
            .resolve_parent_folder(folder, root_id, dir_ids, file)
            .await?;
        let upload_options = UploadOptions {
            existing_remote_id: existing_id.map(str::to_string),
            bandwidth_limit_bytes_per_sec: options.bandwidth_limit_bytes_per_sec,
            cancel: control.cancel_token(),
        };
        let remote = match self.client.upload_file(&file.path, &parent_id, &upload_options).await {
            Ok(remote) => remote,
            Err(err) if err.is_not_found() && existing_id.is_some() => {
                // The tracked remote file is gone; create a fresh one.
                let fresh = UploadOptions {
                    existing_remote_id: None,
                    ..upload_options
                };
                self.client.upload_file(&file.path, &parent_id, &fresh).await?
            }
            Err(err) => return Err(err.into()),
        };
        if verify {
            outcome.verify_checked_count += 1;
            if let Err(err) = self.verify_upload(file, &remote).await {
                outcome.verify_failed_count += 1;
                return Err(err);
            }
        }
        Ok(remote)
    }

    async fn resolve_parent_folder(
        &self,
        folder: &Path,
        root_id: &str,
        dir_ids: &mut HashMap<String, String>,
        file: &DiscoveredFile,
    ) -> Result<String, EngineError> {
        // Original casing goes to the remote side; the cache key does not
        // care about case.
        let rel_dir = file
            .path
            .parent()
            .and_then(|parent| parent.strip_prefix(folder).ok())
            .map(|parent| parent.to_string_lossy().replace('\\', "/"))
            .unwrap_or_default();
        let cache_key = rel_dir.to_lowercase();
        if let Some(id) = dir_ids.get(&cache_key) {
            return Ok(id.clone());
        }
        let id = if rel_dir.is_empty() {
            root_id.to_string()
        } else {
            self.client.ensure_folder_path(&rel_dir, root_id).await?
        };
        dir_ids.insert(cache_key, id.clone());
        Ok(id)
    }

    /// Returns `Ok(true)` when both sides changed since the last sync and
    /// the remote copy was preserved under a conflict-stamped name.
    async fn preserve_remote_on_conflict(
        &self,
        file: &DiscoveredFile,
        prior: &SyncRecord,
    ) -> Result<bool, EngineError> {
        let (Some(last_mtime), Some(last_remote)) = (prior.mtime_ms, &prior.remote_modified)
        else {
            return Ok(false);
        };
        let current = match self
            .client
            .get_file_metadata(&prior.remote_id, "id, name, modifiedTime")
            .await
        {
            Ok(current) => current,
            Err(err) if err.is_not_found() => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        let Some(current_modified) = &current.modified_time else {
            return Ok(false);
        };
        let Some(check) = conflict::detect(last_mtime, file.mtime_ms, last_remote, current_modified)
        else {
            return Ok(false);
        };
        if !check.both_changed() {
            return Ok(false);
        }
        let name = if current.name.is_empty() {
            file.path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| file.relative.clone())
        } else {
            current.name.clone()
        };
        let copy_name = conflict::conflict_name(&name, OffsetDateTime::now_utc());
        self.client
            .copy_file(&prior.remote_id, &copy_name, "")
            .await?;
        Ok(true)
    }

    async fn verify_upload(
        &self,
        file: &DiscoveredFile,
        remote: &DriveFile,
    ) -> Result<(), EngineError> {
        if let Some(remote_md5) = &remote.md5_checksum {
            let local_md5 = md5_of_file(&file.path).await?;
            if &local_md5 != remote_md5 {
                return Err(EngineError::Integrity(file.path.clone()));
            }
            return Ok(());
        }
        let remote_size = match remote.size {
            Some(size) => Some(size),
            None => {
                self.client
                    .get_file_metadata(&remote.id, "id, size")
                    .await?
                    .size
            }
        };
        if remote_size != Some(file.size) {
            return Err(EngineError::Integrity(file.path.clone()));
        }
        Ok(())
    }

    async fn wait_for_window(
        &self,
        window: &ScheduleWindow,
        control: &SyncControl,
        progress: &mut Progress<'_>,
    ) {
        loop {
            if control.is_cancelled() {
                return;
            }
            let now = local_now();
            if window.contains(now.time()) {
                return;
            }
            let until = window.next_start(now);
            let mut event = progress.base_event(SyncPhase::ScheduledWait);
            event.schedule_waiting_until = Some(format_rfc3339(until));
            progress.emit(event);
            control.sleep_interruptible(SCHEDULE_POLL).await;
        }
    }
}

pub async fn md5_of_file(path: &Path) -> Result<String, std::io::Error> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut context = md5::Context::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        context.consume(&buf[..read]);
    }
    Ok(format!("{:x}", context.compute()))
}

pub fn format_rfc3339(stamp: OffsetDateTime) -> String {
    stamp
        .format(&Rfc3339)
        .unwrap_or_else(|_| stamp.unix_timestamp().to_string())
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
