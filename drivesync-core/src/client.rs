use std::io;
use std::path::Path;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::throttle::BandwidthLimiter;

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com";
const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";
const FILE_FIELDS: &str = "id, name, webViewLink, createdTime, modifiedTime, size, md5Checksum";
const UPLOAD_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("local path has no file name: {0}")]
    MissingFileName(String),
    #[error("upload cancelled")]
    Cancelled,
}

impl DriveError {
    pub fn is_retryable(&self) -> bool {
        match self {
            DriveError::Request(_) | DriveError::Io(_) => true,
            DriveError::Api { status, .. } => {
                status.is_server_error()
                    || matches!(
                        *status,
                        StatusCode::REQUEST_TIMEOUT
                            | StatusCode::CONFLICT
                            | StatusCode::TOO_EARLY
                            | StatusCode::TOO_MANY_REQUESTS
                    )
            }
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DriveError::Api { status, .. } if *status == StatusCode::NOT_FOUND)
    }
}

/// Escape a value for use inside a Drive query string literal. The Drive
/// API delimits string literals with single quotes, so backslashes and
/// single quotes must be backslash-escaped.
pub fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DriveFile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "webViewLink")]
    pub web_view_link: Option<String>,
    #[serde(default, rename = "createdTime")]
    pub created_time: Option<String>,
    #[serde(default, rename = "modifiedTime")]
    pub modified_time: Option<String>,
    #[serde(default, deserialize_with = "deserialize_size")]
    pub size: Option<u64>,
    #[serde(default, rename = "md5Checksum")]
    pub md5_checksum: Option<String>,
}

// Drive serialises `size` as a JSON string; accept either form.
fn deserialize_size<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeRepr {
        Number(u64),
        Text(String),
    }

    Ok(match Option::<SizeRepr>::deserialize(deserializer)? {
        None => None,
        Some(SizeRepr::Number(value)) => Some(value),
        Some(SizeRepr::Text(value)) => value.parse().ok(),
    })
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Update this remote file in place instead of creating a new one.
    pub existing_remote_id: Option<String>,
    /// 0 means unlimited.
    pub bandwidth_limit_bytes_per_sec: u64,
    pub cancel: CancellationToken,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            existing_remote_id: None,
            bandwidth_limit_bytes_per_sec: 0,
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Clone)]
pub struct DriveClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl DriveClient {
    pub fn new(token: impl Into<String>) -> Result<Self, DriveError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, DriveError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    pub fn is_authenticated(&self) -> bool {
        !self.token.is_empty()
    }

    pub async fn list_folders(&self, parent_id: &str) -> Result<Vec<DriveFile>, DriveError> {
        let query = format!(
            "mimeType='{FOLDER_MIME_TYPE}' and '{}' in parents and trashed=false",
            escape_query(parent_id)
        );
        let list = self.list_files(&query, "name").await?;
        Ok(list.files)
    }

    pub async fn find_folder(
        &self,
        name: &str,
        parent_id: &str,
    ) -> Result<Option<DriveFile>, DriveError> {
        let query = format!(
            "mimeType='{FOLDER_MIME_TYPE}' and name='{}' and '{}' in parents and trashed=false",
            escape_query(name),
            escape_query(parent_id)
        );
        self.find_oldest(&query, name, parent_id, "folders").await
    }

    pub async fn find_file(
        &self,
        name: &str,
        parent_id: &str,
    ) -> Result<Option<DriveFile>, DriveError> {
        let query = format!(
            "name='{}' and '{}' in parents and trashed=false and mimeType!='{FOLDER_MIME_TYPE}'",
            escape_query(name),
            escape_query(parent_id)
        );
        self.find_oldest(&query, name, parent_id, "files").await
    }

    // Duplicate names resolve deterministically to the oldest-created match.
    async fn find_oldest(
        &self,
        query: &str,
        name: &str,
        parent_id: &str,
        kind: &str,
    ) -> Result<Option<DriveFile>, DriveError> {
        let list = self.list_files(query, "createdTime").await?;
        if list.files.len() > 1 {
            eprintln!(
                "[drivesync-core] warning: found {} {kind} named \"{name}\" in parent {parent_id}, using oldest",
                list.files.len()
            );
        }
        Ok(list.files.into_iter().next())
    }

    async fn list_files(&self, query: &str, order_by: &str) -> Result<FileList, DriveError> {
        let mut url = self.endpoint("/drive/v3/files")?;
        url.query_pairs_mut()
            .append_pair("q", query)
            .append_pair("fields", &format!("files({FILE_FIELDS})"))
            .append_pair("orderBy", order_by)
            .append_pair("pageSize", "10");
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn create_folder(
        &self,
        name: &str,
        parent_id: &str,
    ) -> Result<DriveFile, DriveError> {
        let mut url = self.endpoint("/drive/v3/files")?;
        url.query_pairs_mut().append_pair("fields", FILE_FIELDS);
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(&serde_json::json!({
                "name": name,
                "mimeType": FOLDER_MIME_TYPE,
                "parents": [parent_id],
            }))
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn find_or_create_folder(
        &self,
        name: &str,
        parent_id: &str,
    ) -> Result<DriveFile, DriveError> {
        if let Some(folder) = self.find_folder(name, parent_id).await? {
            return Ok(folder);
        }
        self.create_folder(name, parent_id).await
    }

    /// Find-or-create every segment of a relative folder path under
    /// `base_parent_id`; returns the deepest folder id.
    pub async fn ensure_folder_path(
        &self,
        folder_path: &str,
        base_parent_id: &str,
    ) -> Result<String, DriveError> {
        let mut current = base_parent_id.to_string();
        for part in folder_path.split(['/', '\\']).filter(|p| !p.is_empty()) {
            let folder = self.find_or_create_folder(part, &current).await?;
            current = folder.id;
        }
        Ok(current)
    }

    pub async fn upload_file(
        &self,
        path: &Path,
        parent_id: &str,
        options: &UploadOptions,
    ) -> Result<DriveFile, DriveError> {
        let file_id = match &options.existing_remote_id {
            Some(id) => id.clone(),
            None => {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or_else(|| DriveError::MissingFileName(path.display().to_string()))?;
                self.create_file_shell(&name, parent_id).await?
            }
        };
        self.upload_media(&file_id, path, options).await
    }

    // Create the metadata record first; content follows as a media PATCH.
    async fn create_file_shell(&self, name: &str, parent_id: &str) -> Result<String, DriveError> {
        let mut url = self.endpoint("/drive/v3/files")?;
        url.query_pairs_mut().append_pair("fields", "id");
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(&serde_json::json!({
                "name": name,
                "parents": [parent_id],
            }))
            .send()
            .await?;
        let created: DriveFile = Self::handle_response(response).await?;
        Ok(created.id)
    }

    async fn upload_media(
        &self,
        file_id: &str,
        path: &Path,
        options: &UploadOptions,
    ) -> Result<DriveFile, DriveError> {
        let mut url = self.endpoint(&format!("/upload/drive/v3/files/{file_id}"))?;
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("fields", FILE_FIELDS);

        let file = tokio::fs::File::open(path).await?;
        let limiter = (options.bandwidth_limit_bytes_per_sec > 0)
            .then(|| BandwidthLimiter::new(options.bandwidth_limit_bytes_per_sec));
        let cancel = options.cancel.clone();
        let stream = futures_util::stream::try_unfold(
            (file, limiter, cancel),
            |(mut file, mut limiter, cancel)| async move {
                if cancel.is_cancelled() {
                    return Err(io::Error::new(io::ErrorKind::Interrupted, "upload cancelled"));
                }
                let mut buf = vec![0u8; UPLOAD_CHUNK_BYTES];
                let read = file.read(&mut buf).await?;
                if read == 0 {
                    return Ok(None);
                }
                buf.truncate(read);
                if let Some(limiter) = limiter.as_mut() {
                    limiter.pace(read).await;
                }
                Ok(Some((buf, (file, limiter, cancel))))
            },
        );

        let send = self
            .http
            .patch(url)
            .header("Authorization", self.auth_header_value())
            .body(reqwest::Body::wrap_stream(stream))
            .send();
        let response = tokio::select! {
            _ = options.cancel.cancelled() => return Err(DriveError::Cancelled),
            response = send => response?,
        };
        Self::handle_response(response).await
    }

    pub async fn get_file_metadata(
        &self,
        file_id: &str,
        fields: &str,
    ) -> Result<DriveFile, DriveError> {
        let mut url = self.endpoint(&format!("/drive/v3/files/{file_id}"))?;
        url.query_pairs_mut().append_pair("fields", fields);
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Copies a file, optionally into another folder. An empty `parent_id`
    /// leaves the copy next to the original.
    pub async fn copy_file(
        &self,
        file_id: &str,
        new_name: &str,
        parent_id: &str,
    ) -> Result<DriveFile, DriveError> {
        let mut url = self.endpoint(&format!("/drive/v3/files/{file_id}/copy"))?;
        url.query_pairs_mut().append_pair("fields", FILE_FIELDS);
        let mut body = serde_json::json!({ "name": new_name });
        if !parent_id.is_empty() {
            body["parents"] = serde_json::json!([parent_id]);
        }
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(&body)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn trash_file(&self, file_id: &str) -> Result<(), DriveError> {
        let url = self.endpoint(&format!("/drive/v3/files/{file_id}"))?;
        let response = self
            .http
            .patch(url)
            .header("Authorization", self.auth_header_value())
            .json(&serde_json::json!({ "trashed": true }))
            .send()
            .await?;
        let _: serde_json::Value = Self::handle_response(response).await?;
        Ok(())
    }

    pub async fn get_folder_link(&self, folder_id: &str) -> Result<Option<String>, DriveError> {
        let file = self.get_file_metadata(folder_id, "id, webViewLink").await?;
        Ok(file.web_view_link)
    }

    /// Grant anyone-with-link reader access, then return the web link.
    pub async fn get_share_link(&self, file_id: &str) -> Result<Option<String>, DriveError> {
        let url = self.endpoint(&format!("/drive/v3/files/{file_id}/permissions"))?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(&serde_json::json!({
                "role": "reader",
                "type": "anyone",
            }))
            .send()
            .await?;
        let _: serde_json::Value = Self::handle_response(response).await?;
        self.get_folder_link(file_id).await
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn endpoint(&self, path: &str) -> Result<Url, DriveError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, DriveError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(DriveError::Api { status, body })
        }
    }
}
