use std::collections::HashSet;
use std::path::{Path, PathBuf};

use super::paths;

/// Directory names never worth mirroring to the remote side.
const SYSTEM_FOLDERS: &[&str] = &[
    "node_modules",
    "__pycache__",
    ".git",
    ".svn",
    ".hg",
    "$RECYCLE.BIN",
    "System Volume Information",
];

const SYSTEM_FILES: &[&str] = &["Thumbs.db", ".DS_Store", "desktop.ini"];

pub fn is_system_folder(name: &str) -> bool {
    SYSTEM_FOLDERS
        .iter()
        .any(|entry| entry.eq_ignore_ascii_case(name))
}

pub fn is_system_file(name: &str) -> bool {
    SYSTEM_FILES
        .iter()
        .any(|entry| entry.eq_ignore_ascii_case(name))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    pub path: PathBuf,
    /// Normalized path relative to the scan root.
    pub relative: String,
    pub size: u64,
    pub mtime_ms: i64,
}

/// Walks `root` depth-first with entries sorted by name, so repeated scans of
/// an unchanged tree yield the same order. Unreadable entries are skipped.
/// When `only_files` is non-empty the result is limited to those paths.
pub async fn discover_files(
    root: &Path,
    exclusions: &[String],
    only_files: &[PathBuf],
) -> Vec<DiscoveredFile> {
    let only: HashSet<String> = only_files
        .iter()
        .map(|path| paths::normalize_path(path))
        .collect();

    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(mut reader) = tokio::fs::read_dir(&dir).await else {
            continue;
        };
        let mut subdirs = Vec::new();
        let mut files = Vec::new();
        while let Ok(Some(entry)) = reader.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if file_type.is_dir() {
                if name.starts_with('.') || is_system_folder(&name) {
                    continue;
                }
                subdirs.push(entry.path());
            } else if file_type.is_file() {
                if name.starts_with('.') || is_system_file(&name) {
                    continue;
                }
                files.push(entry.path());
            }
        }
        subdirs.sort();
        files.sort();

        for path in files {
            let Some(relative) = paths::relative_subpath(root, &path) else {
                continue;
            };
            if paths::is_excluded(&relative, exclusions) {
                continue;
            }
            if !only.is_empty() && !only.contains(&paths::normalize_path(&path)) {
                continue;
            }
            let Ok(meta) = tokio::fs::metadata(&path).await else {
                continue;
            };
            out.push(DiscoveredFile {
                size: meta.len(),
                mtime_ms: mtime_ms(&meta),
                path,
                relative,
            });
        }
        // Reverse keeps the pop order alphabetical.
        for sub in subdirs.into_iter().rev() {
            let Some(relative) = paths::relative_subpath(root, &sub) else {
                continue;
            };
            if paths::is_excluded(&relative, exclusions) {
                continue;
            }
            stack.push(sub);
        }
    }
    out
}

pub fn mtime_ms(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|stamp| stamp.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}
