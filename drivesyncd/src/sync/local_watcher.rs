use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::discovery;
use super::paths;

/// Change surfaced to the daemon after debouncing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    FileChanged {
        root: PathBuf,
        path: PathBuf,
        relative: String,
    },
    FileDeleted {
        root: PathBuf,
        path: PathBuf,
        relative: String,
    },
}

/// One tracked folder as the watcher sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedFolder {
    pub local_path: PathBuf,
    pub drive_id: String,
    pub drive_name: String,
    pub exclude_paths: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RawChange {
    Changed,
    Removed,
}

#[derive(Debug, Clone)]
pub(crate) struct RawEvent {
    pub root: PathBuf,
    pub path: PathBuf,
    pub change: RawChange,
}

type FolderMap = Arc<Mutex<HashMap<PathBuf, WatchedFolder>>>;

/// Watches tracked folders for filesystem changes. Writes are debounced so a
/// burst of saves to the same file surfaces as one event; removals pass
/// through immediately.
pub struct FolderWatcher {
    watchers: HashMap<PathBuf, RecommendedWatcher>,
    folders: FolderMap,
    raw_tx: mpsc::UnboundedSender<RawEvent>,
    debouncer: JoinHandle<()>,
}

impl FolderWatcher {
    pub fn new(debounce: Duration) -> (Self, mpsc::UnboundedReceiver<WatchEvent>) {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let folders: FolderMap = Arc::new(Mutex::new(HashMap::new()));
        let debouncer = spawn_debouncer(debounce, Arc::clone(&folders), raw_rx, out_tx);
        (
            Self {
                watchers: HashMap::new(),
                folders,
                raw_tx,
                debouncer,
            },
            out_rx,
        )
    }

    /// Starts watching `root`; on an already watched root only the drive
    /// id/name and exclusions are refreshed.
    pub fn watch(
        &mut self,
        root: &Path,
        drive_id: &str,
        drive_name: &str,
        exclude_paths: Vec<String>,
    ) -> notify::Result<()> {
        let folder = WatchedFolder {
            local_path: root.to_path_buf(),
            drive_id: drive_id.to_string(),
            drive_name: drive_name.to_string(),
            exclude_paths,
        };
        if self.watchers.contains_key(root) {
            if let Ok(mut map) = self.folders.lock() {
                map.insert(root.to_path_buf(), folder);
            }
            return Ok(());
        }
        let tx = self.raw_tx.clone();
        let event_root = root.to_path_buf();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if let Ok(event) = res
                && let Some(change) = classify_event(&event)
            {
                for path in event.paths {
                    let _ = tx.send(RawEvent {
                        root: event_root.clone(),
                        path,
                        change,
                    });
                }
            }
        })?;
        watcher.watch(root, RecursiveMode::Recursive)?;
        eprintln!("[drivesyncd] watching {}", root.display());
        if let Ok(mut map) = self.folders.lock() {
            map.insert(root.to_path_buf(), folder);
        }
        self.watchers.insert(root.to_path_buf(), watcher);
        Ok(())
    }

    pub fn unwatch(&mut self, root: &Path) {
        if let Some(mut watcher) = self.watchers.remove(root) {
            let _ = watcher.unwatch(root);
            if let Ok(mut map) = self.folders.lock() {
                map.remove(root);
            }
            eprintln!("[drivesyncd] stopped watching {}", root.display());
        }
    }

    pub fn unwatch_all(&mut self) {
        let roots: Vec<PathBuf> = self.watchers.keys().cloned().collect();
        for root in roots {
            self.unwatch(&root);
        }
    }

    pub fn is_watching(&self, root: &Path) -> bool {
        self.watchers.contains_key(root)
    }

    pub fn watched_folders(&self) -> Vec<WatchedFolder> {
        self.folders
            .lock()
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn add_exclusion(&mut self, root: &Path, entry: &str) {
        if let Ok(mut map) = self.folders.lock()
            && let Some(folder) = map.get_mut(root)
            && !folder
                .exclude_paths
                .iter()
                .any(|existing| existing.eq_ignore_ascii_case(entry))
        {
            folder.exclude_paths.push(entry.to_string());
        }
    }

    pub fn remove_exclusion(&mut self, root: &Path, entry: &str) {
        if let Ok(mut map) = self.folders.lock()
            && let Some(folder) = map.get_mut(root)
        {
            folder
                .exclude_paths
                .retain(|existing| !existing.eq_ignore_ascii_case(entry));
        }
    }
}

impl Drop for FolderWatcher {
    fn drop(&mut self) {
        self.debouncer.abort();
    }
}

/// Coalesces `Changed` events per path: each new event restarts that path's
/// timer, and the event is delivered once the path stays quiet for the full
/// debounce interval. `Removed` events are forwarded at once.
pub(crate) fn spawn_debouncer(
    debounce: Duration,
    folders: FolderMap,
    mut raw_rx: mpsc::UnboundedReceiver<RawEvent>,
    out_tx: mpsc::UnboundedSender<WatchEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut pending: HashMap<PathBuf, JoinHandle<()>> = HashMap::new();
        while let Some(raw) = raw_rx.recv().await {
            let excluded = folders
                .lock()
                .map(|map| {
                    map.get(&raw.root)
                        .map(|folder| folder.exclude_paths.clone())
                        .unwrap_or_default()
                })
                .unwrap_or_default();
            let Some(event) = map_raw_event(&raw, &excluded) else {
                continue;
            };
            if let Some(timer) = pending.remove(&raw.path) {
                timer.abort();
            }
            match event {
                WatchEvent::FileDeleted { .. } => {
                    let _ = out_tx.send(event);
                }
                WatchEvent::FileChanged { .. } => {
                    let out = out_tx.clone();
                    pending.insert(
                        raw.path,
                        tokio::spawn(async move {
                            tokio::time::sleep(debounce).await;
                            let _ = out.send(event);
                        }),
                    );
                }
            }
        }
    })
}

pub(crate) fn classify_event(event: &Event) -> Option<RawChange> {
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) => Some(RawChange::Changed),
        EventKind::Remove(_) => Some(RawChange::Removed),
        _ => None,
    }
}

/// Editor scratch files and system folders never trigger a sync.
pub(crate) fn should_ignore(relative: &str) -> bool {
    for component in relative.split('/') {
        if component.starts_with('.') || discovery::is_system_folder(component) {
            return true;
        }
    }
    let name = relative.rsplit('/').next().unwrap_or(relative);
    if discovery::is_system_file(name) {
        return true;
    }
    name.ends_with(".tmp") || name.ends_with('~')
}

pub(crate) fn map_raw_event(raw: &RawEvent, exclusions: &[String]) -> Option<WatchEvent> {
    let relative = paths::relative_subpath(&raw.root, &raw.path)?;
    if relative.is_empty()
        || should_ignore(&relative)
        || paths::is_excluded(&relative, exclusions)
    {
        return None;
    }
    Some(match raw.change {
        RawChange::Changed => WatchEvent::FileChanged {
            root: raw.root.clone(),
            path: raw.path.clone(),
            relative,
        },
        RawChange::Removed => WatchEvent::FileDeleted {
            root: raw.root.clone(),
            path: raw.path.clone(),
            relative,
        },
    })
}

#[cfg(test)]
#[path = "local_watcher_tests.rs"]
mod tests;
