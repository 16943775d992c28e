use std::path::{Component, Path};

/// Lexically normalized, lowercased key for a local path. Keys use forward
/// slashes on every platform so database lookups are stable across restarts.
pub fn normalize_path(path: &Path) -> String {
    let mut root = String::new();
    let mut parts: Vec<String> = Vec::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => {
                root = prefix.as_os_str().to_string_lossy().to_lowercase();
            }
            Component::RootDir => root.push('/'),
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop();
            }
            Component::Normal(part) => parts.push(part.to_string_lossy().to_lowercase()),
        }
    }
    format!("{root}{}", parts.join("/"))
}

/// Normalized path of `path` relative to `root`, or `None` when `path` does
/// not live under `root`.
pub fn relative_subpath(root: &Path, path: &Path) -> Option<String> {
    let root_key = normalize_path(root);
    let path_key = normalize_path(path);
    if path_key == root_key {
        return Some(String::new());
    }
    path_key
        .strip_prefix(&format!("{}/", root_key.trim_end_matches('/')))
        .map(str::to_string)
}

/// Exclusion entries are relative paths in whatever casing the user stored
/// them; matching is case-insensitive and covers the entry itself and
/// everything below it.
pub fn is_excluded(relative: &str, exclusions: &[String]) -> bool {
    exclusions.iter().any(|entry| {
        let entry = entry.trim_end_matches('/').replace('\\', "/").to_lowercase();
        !entry.is_empty() && (relative == entry || relative.starts_with(&format!("{entry}/")))
    })
}
