use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::{Row, SqlitePool, sqlite::SqliteConnectOptions};
use thiserror::Error;

use super::paths;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings value error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("invalid item kind: {0}")]
    InvalidKind(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    File,
    Folder,
}

impl ItemKind {
    fn as_str(&self) -> &'static str {
        match self {
            ItemKind::File => "file",
            ItemKind::Folder => "folder",
        }
    }

    fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "file" => Ok(ItemKind::File),
            "folder" => Ok(ItemKind::Folder),
            other => Err(StoreError::InvalidKind(other.to_string())),
        }
    }
}

/// One confirmed successful upload. Keyed in the database by the normalized
/// local path; `local_path` preserves the original casing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRecord {
    pub local_path: PathBuf,
    pub remote_id: String,
    pub remote_url: Option<String>,
    pub kind: ItemKind,
    pub size_bytes: Option<i64>,
    pub mtime_ms: Option<i64>,
    pub remote_modified: Option<String>,
    pub remote_size: Option<i64>,
    pub remote_md5: Option<String>,
    pub synced_at: String,
}

/// Result of the ancestor-walk lookup: the nearest tracked record at or
/// above a path, plus where the query path sits relative to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AncestorRecord {
    pub record: SyncRecord,
    pub matched_path: PathBuf,
    pub relative: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderMapping {
    pub local_path: PathBuf,
    pub drive_id: String,
    pub drive_name: String,
    pub watching: bool,
    pub exclude_paths: Vec<String>,
}

/// Persisted sync policy knobs with defaults matching a fresh install.
/// Values are clamped on read so a hand-edited database cannot produce a
/// zero-attempt retry loop or a negative sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncTunables {
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub verify_uploads: bool,
    pub verify_sample_rate: f64,
    pub upload_bandwidth_limit_kbps: u64,
    pub schedule_enabled: bool,
    pub schedule_start: String,
    pub schedule_end: String,
    pub auto_resume_interrupted_sync: bool,
    pub conflict_policy: String,
    pub avg_upload_speed_bps: u64,
}

impl Default for SyncTunables {
    fn default() -> Self {
        Self {
            retry_max_attempts: 3,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 20_000,
            verify_uploads: true,
            verify_sample_rate: 0.2,
            upload_bandwidth_limit_kbps: 0,
            schedule_enabled: false,
            schedule_start: "00:00".to_string(),
            schedule_end: "23:59".to_string(),
            auto_resume_interrupted_sync: true,
            conflict_policy: "keep-both-local-wins".to_string(),
            avg_upload_speed_bps: 0,
        }
    }
}

#[derive(Clone)]
pub struct StateStore {
    pool: SqlitePool,
}

impl StateStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn new_at(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn new_default() -> Result<Self, StoreError> {
        Self::new_at(&default_db_path()?).await
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS synced_items (
                path TEXT PRIMARY KEY,
                local_path TEXT NOT NULL,
                remote_id TEXT NOT NULL,
                remote_url TEXT,
                kind TEXT NOT NULL,
                size_bytes INTEGER,
                mtime_ms INTEGER,
                remote_modified TEXT,
                remote_size INTEGER,
                remote_md5 TEXT,
                synced_at TEXT NOT NULL
            );",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS folder_mappings (
                path TEXT PRIMARY KEY,
                local_path TEXT NOT NULL,
                drive_id TEXT NOT NULL,
                drive_name TEXT NOT NULL,
                watching INTEGER NOT NULL,
                exclude_paths TEXT NOT NULL
            );",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_record(&self, record: &SyncRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO synced_items (
                path, local_path, remote_id, remote_url, kind,
                size_bytes, mtime_ms, remote_modified, remote_size, remote_md5, synced_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(path) DO UPDATE SET
                local_path = excluded.local_path,
                remote_id = excluded.remote_id,
                remote_url = excluded.remote_url,
                kind = excluded.kind,
                size_bytes = excluded.size_bytes,
                mtime_ms = excluded.mtime_ms,
                remote_modified = excluded.remote_modified,
                remote_size = excluded.remote_size,
                remote_md5 = excluded.remote_md5,
                synced_at = excluded.synced_at;",
        )
        .bind(paths::normalize_path(&record.local_path))
        .bind(record.local_path.to_string_lossy().into_owned())
        .bind(&record.remote_id)
        .bind(&record.remote_url)
        .bind(record.kind.as_str())
        .bind(record.size_bytes)
        .bind(record.mtime_ms)
        .bind(&record.remote_modified)
        .bind(record.remote_size)
        .bind(&record.remote_md5)
        .bind(&record.synced_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_record(&self, path: &Path) -> Result<Option<SyncRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT local_path, remote_id, remote_url, kind, size_bytes, mtime_ms,
                    remote_modified, remote_size, remote_md5, synced_at
             FROM synced_items WHERE path = ?1",
        )
        .bind(paths::normalize_path(path))
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(record_from_row(&row)?))
    }

    pub async fn remove_record(&self, path: &Path) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM synced_items WHERE path = ?1")
            .bind(paths::normalize_path(path))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drops the record at `path` and everything tracked below it.
    pub async fn remove_records_under(&self, path: &Path) -> Result<(), StoreError> {
        let key = paths::normalize_path(path);
        let pattern = format!("{}/%", key.trim_end_matches('/'));
        sqlx::query("DELETE FROM synced_items WHERE path = ?1 OR path LIKE ?2")
            .bind(key)
            .bind(pattern)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Exact record for `path`, or the record of its nearest tracked
    /// ancestor. Powers get-link lookups for files inside synced folders.
    pub async fn record_for_path_or_ancestor(
        &self,
        path: &Path,
    ) -> Result<Option<AncestorRecord>, StoreError> {
        let mut probe = Some(path.to_path_buf());
        while let Some(current) = probe {
            if let Some(record) = self.get_record(&current).await? {
                let relative = paths::relative_subpath(&current, path).unwrap_or_default();
                return Ok(Some(AncestorRecord {
                    record,
                    matched_path: current,
                    relative,
                }));
            }
            probe = current.parent().map(Path::to_path_buf);
        }
        Ok(None)
    }

    pub async fn upsert_mapping(&self, mapping: &FolderMapping) -> Result<(), StoreError> {
        let exclude = serde_json::to_string(&mapping.exclude_paths)?;
        sqlx::query(
            "INSERT INTO folder_mappings (path, local_path, drive_id, drive_name, watching, exclude_paths)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(path) DO UPDATE SET
                local_path = excluded.local_path,
                drive_id = excluded.drive_id,
                drive_name = excluded.drive_name,
                watching = excluded.watching,
                exclude_paths = excluded.exclude_paths;",
        )
        .bind(paths::normalize_path(&mapping.local_path))
        .bind(mapping.local_path.to_string_lossy().into_owned())
        .bind(&mapping.drive_id)
        .bind(&mapping.drive_name)
        .bind(if mapping.watching { 1 } else { 0 })
        .bind(exclude)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_mapping(&self, path: &Path) -> Result<Option<FolderMapping>, StoreError> {
        let row = sqlx::query(
            "SELECT local_path, drive_id, drive_name, watching, exclude_paths
             FROM folder_mappings WHERE path = ?1",
        )
        .bind(paths::normalize_path(path))
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(mapping_from_row(&row)?))
    }

    pub async fn list_mappings(&self) -> Result<Vec<FolderMapping>, StoreError> {
        let rows = sqlx::query(
            "SELECT local_path, drive_id, drive_name, watching, exclude_paths
             FROM folder_mappings ORDER BY path ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(mapping_from_row(&row)?);
        }
        Ok(out)
    }

    pub async fn remove_mapping(&self, path: &Path) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM folder_mappings WHERE path = ?1")
            .bind(paths::normalize_path(path))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Exact mapping for `path`, or the nearest mapped ancestor together
    /// with the relative subpath from the mapping root down to `path`.
    pub async fn mapping_for_path_or_ancestor(
        &self,
        path: &Path,
    ) -> Result<Option<(FolderMapping, String)>, StoreError> {
        let mut probe = Some(path.to_path_buf());
        while let Some(current) = probe {
            if let Some(mapping) = self.get_mapping(&current).await? {
                let relative = paths::relative_subpath(&current, path).unwrap_or_default();
                return Ok(Some((mapping, relative)));
            }
            probe = current.parent().map(Path::to_path_buf);
        }
        Ok(None)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let raw: String = row.try_get("value")?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value)?;
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
        )
        .bind(key)
        .bind(raw)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_setting(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM settings WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn sync_tunables(&self) -> Result<SyncTunables, StoreError> {
        let defaults = SyncTunables::default();
        let retry_max_attempts: u32 = self
            .get_json("retry_max_attempts")
            .await?
            .unwrap_or(defaults.retry_max_attempts);
        let retry_base_delay_ms: u64 = self
            .get_json("retry_base_delay_ms")
            .await?
            .unwrap_or(defaults.retry_base_delay_ms);
        let retry_max_delay_ms: u64 = self
            .get_json("retry_max_delay_ms")
            .await?
            .unwrap_or(defaults.retry_max_delay_ms);
        let verify_sample_rate: f64 = self
            .get_json("verify_sample_rate")
            .await?
            .unwrap_or(defaults.verify_sample_rate);
        Ok(SyncTunables {
            retry_max_attempts: retry_max_attempts.clamp(1, 10),
            retry_base_delay_ms: retry_base_delay_ms.max(250),
            retry_max_delay_ms: retry_max_delay_ms.max(1000),
            verify_uploads: self
                .get_json("verify_uploads")
                .await?
                .unwrap_or(defaults.verify_uploads),
            verify_sample_rate: verify_sample_rate.clamp(0.0, 1.0),
            upload_bandwidth_limit_kbps: self
                .get_json("upload_bandwidth_limit_kbps")
                .await?
                .unwrap_or(defaults.upload_bandwidth_limit_kbps),
            schedule_enabled: self
                .get_json("upload_schedule_enabled")
                .await?
                .unwrap_or(defaults.schedule_enabled),
            schedule_start: self
                .get_json("upload_schedule_start")
                .await?
                .unwrap_or(defaults.schedule_start),
            schedule_end: self
                .get_json("upload_schedule_end")
                .await?
                .unwrap_or(defaults.schedule_end),
            auto_resume_interrupted_sync: self
                .get_json("auto_resume_interrupted_sync")
                .await?
                .unwrap_or(defaults.auto_resume_interrupted_sync),
            conflict_policy: self
                .get_json("conflict_policy")
                .await?
                .unwrap_or(defaults.conflict_policy),
            avg_upload_speed_bps: self
                .get_json("avg_upload_speed_bps")
                .await?
                .unwrap_or(defaults.avg_upload_speed_bps),
        })
    }

    /// Rolling average, weighted toward history so one outlier transfer
    /// does not swing future estimates.
    pub async fn update_avg_upload_speed(&self, observed_bps: u64) -> Result<u64, StoreError> {
        if observed_bps == 0 {
            let current: u64 = self.get_json("avg_upload_speed_bps").await?.unwrap_or(0);
            return Ok(current);
        }
        let current: u64 = self.get_json("avg_upload_speed_bps").await?.unwrap_or(0);
        let next = if current == 0 {
            observed_bps
        } else {
            (current as f64 * 0.7 + observed_bps as f64 * 0.3).round() as u64
        };
        self.set_json("avg_upload_speed_bps", &next).await?;
        Ok(next)
    }
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<SyncRecord, StoreError> {
    let kind: String = row.try_get("kind")?;
    let local_path: String = row.try_get("local_path")?;
    Ok(SyncRecord {
        local_path: PathBuf::from(local_path),
        remote_id: row.try_get("remote_id")?,
        remote_url: row.try_get("remote_url")?,
        kind: ItemKind::parse(&kind)?,
        size_bytes: row.try_get("size_bytes")?,
        mtime_ms: row.try_get("mtime_ms")?,
        remote_modified: row.try_get("remote_modified")?,
        remote_size: row.try_get("remote_size")?,
        remote_md5: row.try_get("remote_md5")?,
        synced_at: row.try_get("synced_at")?,
    })
}

fn mapping_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<FolderMapping, StoreError> {
    let local_path: String = row.try_get("local_path")?;
    let watching: i64 = row.try_get("watching")?;
    let exclude_raw: String = row.try_get("exclude_paths")?;
    Ok(FolderMapping {
        local_path: PathBuf::from(local_path),
        drive_id: row.try_get("drive_id")?,
        drive_name: row.try_get("drive_name")?,
        watching: watching != 0,
        exclude_paths: serde_json::from_str(&exclude_raw)?,
    })
}

fn default_db_path() -> Result<PathBuf, StoreError> {
    let mut path = dirs::data_dir().ok_or(StoreError::MissingDataDir)?;
    path.push("drivesyncd");
    path.push("state.db");
    Ok(path)
}
