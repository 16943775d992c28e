use drivesync_core::{CancellationToken, DriveClient, DriveError, UploadOptions};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn find_folder_escapes_name_and_picks_oldest() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/drive/v3/files"))
        .and(query_param(
            "q",
            "mimeType='application/vnd.google-apps.folder' and name='bob\\'s files' and 'root' in parents and trashed=false",
        ))
        .and(query_param("orderBy", "createdTime"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "files": [
                { "id": "older", "name": "bob's files", "createdTime": "2023-01-01T00:00:00Z" },
                { "id": "newer", "name": "bob's files", "createdTime": "2024-06-01T00:00:00Z" }
            ]
        })))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let folder = client.find_folder("bob's files", "root").await.unwrap().unwrap();

    assert_eq!(folder.id, "older");
}

#[tokio::test]
async fn list_folders_returns_folders_under_a_parent_by_name() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/drive/v3/files"))
        .and(query_param(
            "q",
            "mimeType='application/vnd.google-apps.folder' and 'parent-1' in parents and trashed=false",
        ))
        .and(query_param("orderBy", "name"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "files": [
                { "id": "folder-a", "name": "Archive" },
                { "id": "folder-b", "name": "Budget" }
            ]
        })))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let folders = client.list_folders("parent-1").await.unwrap();

    let names: Vec<&str> = folders.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["Archive", "Budget"]);
}

#[tokio::test]
async fn find_file_excludes_folders_and_picks_oldest() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/drive/v3/files"))
        .and(query_param(
            "q",
            "name='notes.md' and 'parent-1' in parents and trashed=false and mimeType!='application/vnd.google-apps.folder'",
        ))
        .and(query_param("orderBy", "createdTime"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "files": [
                { "id": "older", "name": "notes.md", "createdTime": "2023-01-01T00:00:00Z" },
                { "id": "newer", "name": "notes.md", "createdTime": "2024-06-01T00:00:00Z" }
            ]
        })))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let file = client.find_file("notes.md", "parent-1").await.unwrap().unwrap();

    assert_eq!(file.id, "older");
}

#[tokio::test]
async fn find_or_create_folder_creates_when_missing() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/drive/v3/files"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "files": [] })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/drive/v3/files"))
        .and(body_json(json!({
            "name": "Reports",
            "mimeType": "application/vnd.google-apps.folder",
            "parents": ["parent-1"],
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "folder-1",
            "name": "Reports",
            "webViewLink": "https://drive.example/folders/folder-1"
        })))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let folder = client.find_or_create_folder("Reports", "parent-1").await.unwrap();

    assert_eq!(folder.id, "folder-1");
    assert_eq!(
        folder.web_view_link.as_deref(),
        Some("https://drive.example/folders/folder-1")
    );
}

#[tokio::test]
async fn ensure_folder_path_walks_each_segment() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/drive/v3/files"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "files": [] })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/drive/v3/files"))
        .and(body_json(json!({
            "name": "a",
            "mimeType": "application/vnd.google-apps.folder",
            "parents": ["root"],
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "id-a", "name": "a" })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/drive/v3/files"))
        .and(body_json(json!({
            "name": "b",
            "mimeType": "application/vnd.google-apps.folder",
            "parents": ["id-a"],
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "id-b", "name": "b" })))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let deepest = client.ensure_folder_path("a/b", "root").await.unwrap();

    assert_eq!(deepest, "id-b");
}

#[tokio::test]
async fn upload_file_creates_shell_then_streams_media() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/drive/v3/files"))
        .and(body_json(json!({
            "name": "report.txt",
            "parents": ["parent-1"],
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "file-1" })))
        .mount(&server)
        .await;

    Mock::given(method("PATCH"))
        .and(path("/upload/drive/v3/files/file-1"))
        .and(query_param("uploadType", "media"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "file-1",
            "name": "report.txt",
            "webViewLink": "https://drive.example/file-1",
            "modifiedTime": "2024-05-01T10:00:00Z",
            "size": "7",
            "md5Checksum": "321c3cf486ed509164edec1e1981fec8"
        })))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("report.txt");
    std::fs::write(&source, b"payload").unwrap();

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let uploaded = client
        .upload_file(&source, "parent-1", &UploadOptions::default())
        .await
        .unwrap();

    assert_eq!(uploaded.id, "file-1");
    assert_eq!(uploaded.size, Some(7));
    assert_eq!(
        uploaded.md5_checksum.as_deref(),
        Some("321c3cf486ed509164edec1e1981fec8")
    );

    let requests = server.received_requests().await.unwrap();
    let media = requests
        .iter()
        .find(|r| r.url.path() == "/upload/drive/v3/files/file-1")
        .unwrap();
    assert_eq!(media.body, b"payload");
}

#[tokio::test]
async fn upload_file_updates_existing_id_without_creating() {
    let server = MockServer::start().await;

    Mock::given(method("PATCH"))
        .and(path("/upload/drive/v3/files/existing-9"))
        .and(query_param("uploadType", "media"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "existing-9",
            "name": "notes.md",
            "modifiedTime": "2024-05-02T08:00:00Z",
            "size": "5"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("notes.md");
    std::fs::write(&source, b"notes").unwrap();

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let options = UploadOptions {
        existing_remote_id: Some("existing-9".to_string()),
        ..UploadOptions::default()
    };
    let uploaded = client.upload_file(&source, "parent-1", &options).await.unwrap();

    assert_eq!(uploaded.id, "existing-9");
    // No metadata POST happened; the single expected PATCH is everything.
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn upload_file_aborts_when_cancelled() {
    let server = MockServer::start().await;

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("big.bin");
    std::fs::write(&source, vec![0u8; 256 * 1024]).unwrap();

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let options = UploadOptions {
        existing_remote_id: Some("existing-1".to_string()),
        cancel,
        ..UploadOptions::default()
    };

    let err = client
        .upload_file(&source, "parent-1", &options)
        .await
        .expect_err("expected cancellation");
    assert!(matches!(err, DriveError::Cancelled));
}

#[tokio::test]
async fn trash_file_marks_trashed() {
    let server = MockServer::start().await;

    Mock::given(method("PATCH"))
        .and(path("/drive/v3/files/file-3"))
        .and(body_json(json!({ "trashed": true })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "file-3" })))
        .expect(1)
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    client.trash_file("file-3").await.unwrap();
}

#[tokio::test]
async fn get_file_metadata_projects_fields() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/drive/v3/files/file-7"))
        .and(query_param("fields", "id, modifiedTime, size, md5Checksum"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "file-7",
            "modifiedTime": "2024-04-01T00:00:00Z",
            "size": "2048"
        })))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let file = client
        .get_file_metadata("file-7", "id, modifiedTime, size, md5Checksum")
        .await
        .unwrap();

    assert_eq!(file.size, Some(2048));
    assert_eq!(file.modified_time.as_deref(), Some("2024-04-01T00:00:00Z"));
}

#[tokio::test]
async fn get_share_link_grants_permission_first() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/drive/v3/files/folder-2/permissions"))
        .and(body_json(json!({ "role": "reader", "type": "anyone" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "perm-1" })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/drive/v3/files/folder-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "folder-2",
            "webViewLink": "https://drive.example/folders/folder-2"
        })))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let link = client.get_share_link("folder-2").await.unwrap();

    assert_eq!(link.as_deref(), Some("https://drive.example/folders/folder-2"));
}

#[tokio::test]
async fn copy_file_places_copy_under_parent() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/drive/v3/files/file-5/copy"))
        .and(body_json(json!({
            "name": "a (conflict 2024-05-01T10-00-00Z).txt",
            "parents": ["parent-1"],
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "copy-1",
            "name": "a (conflict 2024-05-01T10-00-00Z).txt"
        })))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let copy = client
        .copy_file("file-5", "a (conflict 2024-05-01T10-00-00Z).txt", "parent-1")
        .await
        .unwrap();

    assert_eq!(copy.id, "copy-1");
}

#[tokio::test]
async fn api_errors_carry_status_and_body() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/drive/v3/files/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let err = client
        .get_file_metadata("missing", "id")
        .await
        .expect_err("expected 404");

    assert!(err.is_not_found());
    assert!(!err.is_retryable());
}
