use std::path::Path;
use std::sync::{Arc, Mutex};

use sqlx::SqlitePool;
use wiremock::matchers::{body_partial_json, method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::*;
use crate::sync::store::FolderMapping;

const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

async fn make_engine(server: &MockServer) -> (SyncEngine, StateStore) {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let store = StateStore::from_pool(pool);
    store.init().await.unwrap();
    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    (SyncEngine::new(client, store.clone()), store)
}

/// Baseline remote: folder lookups find nothing, folder creation returns
/// `folder-root`, file shells return `file-new`, and uploads succeed.
/// Test-specific mocks must be mounted before this (first match wins).
async fn mount_remote_scaffold(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/drive/v3/files"))
        .and(body_partial_json(serde_json::json!({ "mimeType": FOLDER_MIME })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "id": "folder-root" })),
        )
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/drive/v3/files"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "id": "file-new" })),
        )
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/drive/v3/files"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "files": [] })),
        )
        .mount(server)
        .await;
    Mock::given(method("PATCH"))
        .and(path_regex("^/upload/drive/v3/files/.+$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "file-new",
            "name": "uploaded",
            "webViewLink": "https://drive.example/file-new",
            "modifiedTime": "2024-05-01T10:00:00Z"
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex("^/drive/v3/files/[^/]+$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "folder-root",
            "webViewLink": "https://drive.example/folder-root"
        })))
        .mount(server)
        .await;
}

fn collecting_sink() -> (Arc<Mutex<Vec<ProgressEvent>>>, Box<ProgressSinkOwned>) {
    let events: Arc<Mutex<Vec<ProgressEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_events = Arc::clone(&events);
    let sink = Box::new(move |event: ProgressEvent| {
        sink_events.lock().unwrap().push(event);
    });
    (events, sink)
}

type ProgressSinkOwned = dyn Fn(ProgressEvent) + Send + Sync;

fn no_verify_options() -> SyncOptions {
    SyncOptions {
        verify_uploads: false,
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 5,
        ..SyncOptions::default()
    }
}

fn write(dir: &Path, relative: &str, contents: &[u8]) -> std::path::PathBuf {
    let path = dir.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, contents).unwrap();
    path
}

fn stat_record(path: &Path, remote_id: &str) -> SyncRecord {
    let meta = std::fs::metadata(path).unwrap();
    SyncRecord {
        local_path: path.to_path_buf(),
        remote_id: remote_id.to_string(),
        remote_url: None,
        kind: ItemKind::File,
        size_bytes: Some(meta.len() as i64),
        mtime_ms: Some(discovery::mtime_ms(&meta)),
        remote_modified: Some("2024-05-01T10:00:00Z".into()),
        remote_size: Some(meta.len() as i64),
        remote_md5: None,
        synced_at: "2024-05-01T10:00:01Z".into(),
    }
}

#[tokio::test]
async fn uploads_new_files_and_skips_unchanged() {
    let server = MockServer::start().await;
    mount_remote_scaffold(&server).await;
    let (engine, store) = make_engine(&server).await;

    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.txt", b"alpha");
    write(dir.path(), "sub/c.txt", b"gamma");
    let tracked = write(dir.path(), "d.txt", b"delta");
    store.upsert_record(&stat_record(&tracked, "file-d")).await.unwrap();

    let (events, sink) = collecting_sink();
    let outcome = engine
        .sync_folder(dir.path(), &no_verify_options(), &SyncControl::new(), &sink)
        .await
        .unwrap();

    assert_eq!(outcome.files_uploaded, 2);
    assert_eq!(outcome.files_skipped, 1);
    assert_eq!(outcome.files_failed, 0);
    assert_eq!(outcome.total_files, 3);
    assert_eq!(outcome.preflight.new_files, 2);
    assert_eq!(outcome.preflight.changed_files, 0);
    assert_eq!(outcome.preflight.skipped_files, 1);
    assert_eq!(outcome.preflight.bytes_to_upload, 10);
    assert_eq!(outcome.share_link.as_deref(), Some("https://drive.example/folder-root"));

    let events = events.lock().unwrap();
    assert_eq!(events[0].phase, SyncPhase::Preflight);
    assert!(events[0].preflight.is_some());
    for pair in events.windows(2) {
        assert!(pair[0].current <= pair[1].current);
    }
    // Every event carries the planned byte count, not just the preflight one.
    assert!(events.iter().all(|event| event.bytes_to_upload == 10));

    assert!(store.get_record(&dir.path().join("a.txt")).await.unwrap().is_some());
    assert!(store.get_record(&dir.path().join("sub/c.txt")).await.unwrap().is_some());
}

#[tokio::test]
async fn second_run_over_unchanged_tree_uploads_nothing() {
    let server = MockServer::start().await;
    mount_remote_scaffold(&server).await;
    let (engine, _store) = make_engine(&server).await;

    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.txt", b"alpha");
    write(dir.path(), "b.txt", b"beta");

    let sink: &ProgressSink = &|_| {};
    let first = engine
        .sync_folder(dir.path(), &no_verify_options(), &SyncControl::new(), sink)
        .await
        .unwrap();
    assert_eq!(first.files_uploaded, 2);

    let second = engine
        .sync_folder(dir.path(), &no_verify_options(), &SyncControl::new(), sink)
        .await
        .unwrap();
    assert_eq!(second.files_uploaded, 0);
    assert_eq!(second.files_skipped, 2);
    assert_eq!(second.preflight.bytes_to_upload, 0);
}

#[tokio::test]
async fn failed_upload_consumes_exactly_max_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path_regex("^/upload/drive/v3/files/.+$"))
        .respond_with(ResponseTemplate::new(500).set_body_string("backend unavailable"))
        .mount(&server)
        .await;
    mount_remote_scaffold(&server).await;
    let (engine, store) = make_engine(&server).await;

    let dir = tempfile::tempdir().unwrap();
    let file = write(dir.path(), "a.txt", b"alpha");

    let options = SyncOptions {
        retry_max_attempts: 3,
        ..no_verify_options()
    };
    let (events, sink) = collecting_sink();
    let outcome = engine
        .sync_folder(dir.path(), &options, &SyncControl::new(), &sink)
        .await
        .unwrap();

    assert_eq!(outcome.files_failed, 1);
    assert_eq!(outcome.files_uploaded, 0);
    assert_eq!(outcome.failed_files.len(), 1);
    assert!(outcome.failed_files[0].error.contains("500"));
    assert!(store.get_record(&file).await.unwrap().is_none());

    let uploads = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path().starts_with("/upload/"))
        .count();
    assert_eq!(uploads, 3);

    let retry_events = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.phase == SyncPhase::Retrying)
        .count();
    assert_eq!(retry_events, 2);
}

#[tokio::test]
async fn cancel_stops_the_job_between_files() {
    let server = MockServer::start().await;
    mount_remote_scaffold(&server).await;
    let (engine, _store) = make_engine(&server).await;

    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.txt", b"alpha");
    write(dir.path(), "b.txt", b"beta");
    write(dir.path(), "c.txt", b"gamma");

    let control = SyncControl::new();
    let cancel_from_sink = control.clone();
    let sink = move |event: ProgressEvent| {
        if event.phase == SyncPhase::Upload && event.uploaded_count == 1 {
            cancel_from_sink.cancel();
        }
    };
    let outcome = engine
        .sync_folder(dir.path(), &no_verify_options(), &control, &sink)
        .await
        .unwrap();

    assert!(outcome.cancelled);
    assert_eq!(outcome.files_uploaded, 1);
    assert_eq!(outcome.files_failed, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pause_blocks_the_upload_loop_until_resumed() {
    let server = MockServer::start().await;
    mount_remote_scaffold(&server).await;
    let (engine, _store) = make_engine(&server).await;
    let engine = Arc::new(engine);

    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.txt", b"alpha");

    let control = SyncControl::new();
    control.pause();

    let task_engine = Arc::clone(&engine);
    let task_control = control.clone();
    let folder = dir.path().to_path_buf();
    let handle = tokio::spawn(async move {
        let sink: &ProgressSink = &|_| {};
        task_engine
            .sync_folder(&folder, &no_verify_options(), &task_control, sink)
            .await
    });

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(!handle.is_finished());

    control.resume();
    let outcome = tokio::time::timeout(std::time::Duration::from_secs(10), handle)
        .await
        .expect("resume should unblock the job")
        .unwrap()
        .unwrap();
    assert_eq!(outcome.files_uploaded, 1);
    assert!(!outcome.cancelled);
}

#[tokio::test]
async fn conflict_preserves_the_remote_copy_before_overwrite() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/drive/v3/files/file-old"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "file-old",
            "name": "d.txt",
            "modifiedTime": "2024-06-01T09:00:00Z"
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/drive/v3/files/file-old/copy"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "id": "copy-1" })),
        )
        .expect(1)
        .mount(&server)
        .await;
    mount_remote_scaffold(&server).await;
    let (engine, store) = make_engine(&server).await;

    let dir = tempfile::tempdir().unwrap();
    let file = write(dir.path(), "d.txt", b"fresh local bytes");
    let meta = std::fs::metadata(&file).unwrap();
    let mut prior = stat_record(&file, "file-old");
    // Both sides moved since the last sync: local mtime differs from the
    // stored one, remote modifiedTime differs from the stored stamp.
    prior.mtime_ms = Some(discovery::mtime_ms(&meta) - 10_000);
    prior.size_bytes = Some(1);
    prior.remote_modified = Some("2024-05-01T10:00:00Z".into());
    store.upsert_record(&prior).await.unwrap();

    let sink: &ProgressSink = &|_| {};
    let outcome = engine
        .sync_folder(dir.path(), &no_verify_options(), &SyncControl::new(), sink)
        .await
        .unwrap();

    assert_eq!(outcome.conflict_count, 1);
    assert_eq!(outcome.files_uploaded, 1);

    let requests = server.received_requests().await.unwrap();
    let copy = requests
        .iter()
        .find(|r| r.url.path() == "/drive/v3/files/file-old/copy")
        .expect("copy request");
    let body: serde_json::Value = serde_json::from_slice(&copy.body).unwrap();
    let copy_name = body["name"].as_str().unwrap();
    assert!(copy_name.starts_with("d (conflict "));
    assert!(copy_name.ends_with(").txt"));
}

#[tokio::test]
async fn verify_mismatch_is_a_retryable_failure() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path_regex("^/upload/drive/v3/files/.+$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "file-new",
            "modifiedTime": "2024-05-01T10:00:00Z",
            "md5Checksum": "00000000000000000000000000000000"
        })))
        .mount(&server)
        .await;
    mount_remote_scaffold(&server).await;
    let (engine, _store) = make_engine(&server).await;

    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "notes.txt", b"notes");

    let options = SyncOptions {
        verify_uploads: true,
        verify_sample_rate: 1.0,
        retry_max_attempts: 2,
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 5,
        ..SyncOptions::default()
    };
    let sink: &ProgressSink = &|_| {};
    let outcome = engine
        .sync_folder(dir.path(), &options, &SyncControl::new(), sink)
        .await
        .unwrap();

    assert_eq!(outcome.files_failed, 1);
    assert_eq!(outcome.verify_checked_count, 2);
    assert_eq!(outcome.verify_failed_count, 2);
    assert!(outcome.failed_files[0].error.contains("does not match"));
}

#[tokio::test]
async fn verify_passes_when_checksums_agree() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path_regex("^/upload/drive/v3/files/.+$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "file-new",
            "modifiedTime": "2024-05-01T10:00:00Z",
            "md5Checksum": "4358b5009c67d0e31d7fbf1663fcd3bf"
        })))
        .mount(&server)
        .await;
    mount_remote_scaffold(&server).await;
    let (engine, _store) = make_engine(&server).await;

    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "notes.txt", b"notes");

    let options = SyncOptions {
        verify_uploads: true,
        verify_sample_rate: 1.0,
        ..no_verify_options()
    };
    let sink: &ProgressSink = &|_| {};
    let outcome = engine
        .sync_folder(dir.path(), &options, &SyncControl::new(), sink)
        .await
        .unwrap();

    assert_eq!(outcome.files_uploaded, 1);
    assert_eq!(outcome.verify_checked_count, 1);
    assert_eq!(outcome.verify_failed_count, 0);
}

#[tokio::test]
async fn stale_remote_id_falls_back_to_creating_a_fresh_file() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/upload/drive/v3/files/file-gone"))
        .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
        .mount(&server)
        .await;
    mount_remote_scaffold(&server).await;
    let (engine, store) = make_engine(&server).await;

    let dir = tempfile::tempdir().unwrap();
    let file = write(dir.path(), "a.txt", b"alpha");
    let mut prior = stat_record(&file, "file-gone");
    prior.size_bytes = Some(1);
    store.upsert_record(&prior).await.unwrap();

    let sink: &ProgressSink = &|_| {};
    let outcome = engine
        .sync_folder(dir.path(), &no_verify_options(), &SyncControl::new(), sink)
        .await
        .unwrap();

    assert_eq!(outcome.files_uploaded, 1);
    assert_eq!(outcome.files_failed, 0);
    let record = store.get_record(&file).await.unwrap().unwrap();
    assert_eq!(record.remote_id, "file-new");
}

#[tokio::test]
async fn mapped_folder_reuses_its_remote_id_without_creating_folders() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/drive/v3/files"))
        .and(body_partial_json(serde_json::json!({ "mimeType": FOLDER_MIME })))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;
    mount_remote_scaffold(&server).await;
    let (engine, store) = make_engine(&server).await;

    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.txt", b"alpha");
    store
        .upsert_mapping(&FolderMapping {
            local_path: dir.path().to_path_buf(),
            drive_id: "folder-mapped".into(),
            drive_name: "Docs".into(),
            watching: true,
            exclude_paths: Vec::new(),
        })
        .await
        .unwrap();

    let sink: &ProgressSink = &|_| {};
    let outcome = engine
        .sync_folder(dir.path(), &no_verify_options(), &SyncControl::new(), sink)
        .await
        .unwrap();

    assert_eq!(outcome.files_uploaded, 1);
    assert_eq!(outcome.folder_id.as_deref(), Some("folder-mapped"));

    let requests = server.received_requests().await.unwrap();
    let shell = requests
        .iter()
        .find(|r| r.method.as_str() == "POST" && r.url.path() == "/drive/v3/files")
        .expect("file shell request");
    let body: serde_json::Value = serde_json::from_slice(&shell.body).unwrap();
    assert_eq!(body["parents"][0], "folder-mapped");
}

#[tokio::test]
async fn closed_schedule_window_emits_scheduled_wait_and_honours_cancel() {
    let server = MockServer::start().await;
    mount_remote_scaffold(&server).await;
    let (engine, _store) = make_engine(&server).await;

    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.txt", b"alpha");

    // A one-hour window starting two hours from now is always closed.
    let now = local_now();
    let start = now + time::Duration::hours(2);
    let end = now + time::Duration::hours(3);
    let options = SyncOptions {
        schedule: ScheduleConfig {
            enabled: true,
            start: format!("{:02}:{:02}", start.hour(), start.minute()),
            end: format!("{:02}:{:02}", end.hour(), end.minute()),
        },
        ..no_verify_options()
    };

    let control = SyncControl::new();
    let cancel_from_sink = control.clone();
    let (events, sink) = {
        let events: Arc<Mutex<Vec<ProgressEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_events = Arc::clone(&events);
        let sink = move |event: ProgressEvent| {
            if event.phase == SyncPhase::ScheduledWait {
                cancel_from_sink.cancel();
            }
            sink_events.lock().unwrap().push(event);
        };
        (events, sink)
    };
    let outcome = engine
        .sync_folder(dir.path(), &options, &control, &sink)
        .await
        .unwrap();

    assert!(outcome.cancelled);
    assert_eq!(outcome.files_uploaded, 0);
    let events = events.lock().unwrap();
    let wait = events
        .iter()
        .find(|e| e.phase == SyncPhase::ScheduledWait)
        .expect("scheduled-wait event");
    assert!(wait.schedule_waiting_until.is_some());

    // The window gate sits ahead of each upload attempt, so nothing reached
    // the upload endpoint.
    let attempts = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|req| req.url.path().starts_with("/upload/"))
        .count();
    assert_eq!(attempts, 0);
}
