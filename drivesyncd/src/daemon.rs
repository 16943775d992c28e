use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use drivesync_core::DriveClient;
use tokio::sync::mpsc;

use crate::sync::local_watcher::{FolderWatcher, WatchEvent};
use crate::sync::queue::{EnqueueOptions, JobInput, JobSource, SyncCoordinator, SyncMode};
use crate::sync::store::{ItemKind, StateStore};

const DEFAULT_DEBOUNCE_MS: u64 = 2000;
const WATCHER_REFRESH_SECS: u64 = 30;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub token: String,
    pub state_db: Option<PathBuf>,
    pub debounce: Duration,
    pub enable_watcher: bool,
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        let token = std::env::var("DRIVESYNC_TOKEN").unwrap_or_default();
        let state_db = std::env::var("DRIVESYNC_STATE_DB").ok().map(PathBuf::from);
        let debounce = Duration::from_millis(read_u64_env(
            "DRIVESYNC_DEBOUNCE_MS",
            DEFAULT_DEBOUNCE_MS,
        ));
        let enable_watcher = read_bool_env("DRIVESYNC_ENABLE_WATCHER", true);
        Self {
            token,
            state_db,
            debounce,
            enable_watcher,
        }
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    store: StateStore,
    client: DriveClient,
    coordinator: Arc<SyncCoordinator>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let store = match &config.state_db {
            Some(path) => StateStore::new_at(path).await,
            None => StateStore::new_default().await,
        }
        .context("failed to initialize state store")?;
        let client = DriveClient::new(config.token.clone())?;
        if !client.is_authenticated() {
            eprintln!(
                "[drivesyncd] warning: DRIVESYNC_TOKEN is not set; queued jobs will wait for a token"
            );
        }
        let coordinator = SyncCoordinator::new(client.clone(), store.clone());
        Ok(Self {
            config,
            store,
            client,
            coordinator,
        })
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    pub async fn run(self) -> anyhow::Result<()> {
        eprintln!(
            "[drivesyncd] started: watcher={}, debounce={}ms",
            if self.config.enable_watcher {
                "enabled"
            } else {
                "disabled"
            },
            self.config.debounce.as_millis()
        );

        self.coordinator
            .recover_on_startup()
            .await
            .context("failed to recover persisted queue")?;
        self.coordinator.spawn_drain();

        let (mut watcher, mut watch_rx) = if self.config.enable_watcher {
            let (watcher, rx) = FolderWatcher::new(self.config.debounce);
            (Some(watcher), Some(rx))
        } else {
            (None, None)
        };
        if let Some(watcher) = watcher.as_mut()
            && let Err(err) = sync_watchers_with_mappings(watcher, &self.store).await
        {
            eprintln!("[drivesyncd] warning: could not start folder watchers: {err}");
        }

        let mut refresh = tokio::time::interval(Duration::from_secs(WATCHER_REFRESH_SECS));
        refresh.tick().await;
        loop {
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    res.context("failed waiting for shutdown signal")?;
                    eprintln!("[drivesyncd] shutdown requested");
                    break;
                }
                _ = refresh.tick(), if watcher.is_some() => {
                    if let Some(watcher) = watcher.as_mut()
                        && let Err(err) = sync_watchers_with_mappings(watcher, &self.store).await
                    {
                        eprintln!("[drivesyncd] warning: watcher refresh failed: {err}");
                    }
                }
                event = recv_watch_event(&mut watch_rx), if watch_rx.is_some() => {
                    match event {
                        Some(event) => self.handle_watch_event(event).await,
                        None => watch_rx = None,
                    }
                }
            }
        }

        self.coordinator.cancel().await;
        if let Some(watcher) = watcher.as_mut() {
            watcher.unwatch_all();
        }
        Ok(())
    }

    async fn handle_watch_event(&self, event: WatchEvent) {
        match event {
            WatchEvent::FileChanged { root, path, relative } => {
                eprintln!("[drivesyncd] local change: {relative}");
                let result = self
                    .coordinator
                    .enqueue(
                        JobInput {
                            folder_path: root,
                            mode: Some(SyncMode::Sync),
                            only_files: vec![path],
                            source: JobSource::Watcher,
                        },
                        EnqueueOptions::default(),
                    )
                    .await;
                if let Err(err) = result {
                    eprintln!("[drivesyncd] warning: could not queue change: {err}");
                }
            }
            WatchEvent::FileDeleted { path, relative, .. } => {
                eprintln!("[drivesyncd] local delete: {relative}");
                if let Err(err) = self.handle_local_delete(&path).await {
                    eprintln!("[drivesyncd] warning: remote delete failed: {err}");
                }
            }
        }
    }

    /// Mirrors a local removal to the remote side by trashing the tracked
    /// counterpart, then forgets the item.
    async fn handle_local_delete(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let Some(record) = self.store.get_record(path).await? else {
            return Ok(());
        };
        if self.client.is_authenticated() {
            match self.client.trash_file(&record.remote_id).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err.into()),
            }
        }
        self.store.remove_record(path).await?;
        if record.kind == ItemKind::Folder {
            self.store.remove_records_under(path).await?;
        }
        Ok(())
    }
}

/// Brings the watcher in line with the tracked folder mappings: watch every
/// mapping marked for watching, drop watches for mappings that were removed
/// or switched off.
async fn sync_watchers_with_mappings(
    watcher: &mut FolderWatcher,
    store: &StateStore,
) -> anyhow::Result<()> {
    let mappings = store.list_mappings().await?;
    let mut wanted: HashSet<PathBuf> = HashSet::new();
    for mapping in mappings {
        if !mapping.watching {
            continue;
        }
        wanted.insert(mapping.local_path.clone());
        if let Err(err) = watcher.watch(
            &mapping.local_path,
            &mapping.drive_id,
            &mapping.drive_name,
            mapping.exclude_paths,
        ) {
            eprintln!(
                "[drivesyncd] warning: could not watch {}: {err}",
                mapping.local_path.display()
            );
        }
    }
    for folder in watcher.watched_folders() {
        if !wanted.contains(&folder.local_path) {
            watcher.unwatch(&folder.local_path);
        }
    }
    Ok(())
}

async fn recv_watch_event(
    rx: &mut Option<mpsc::UnboundedReceiver<WatchEvent>>,
) -> Option<WatchEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_env(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}
