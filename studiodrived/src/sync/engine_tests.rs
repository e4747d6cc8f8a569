use super::*;
use crate::sync::backoff::RetryPolicy;
use studiodrive_core::{ItemWrite, MemoryBackend};
use tempfile::{TempDir, tempdir};

struct Harness {
    dir: TempDir,
    backend: Arc<MemoryBackend>,
    status: Arc<StatusHub>,
    engine: Arc<SyncEngine>,
}

impl Harness {
    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn item_path(&self, project_id: &str, category: ItemCategory, name: &str) -> PathBuf {
        self.engine
            .layout()
            .item_path(project_id, category, name)
            .unwrap()
    }
}

fn test_config() -> EngineConfig {
    EngineConfig {
        poll_interval: Duration::from_millis(20),
        enable_local_watcher: false,
        conflict_retention: None,
        queue: QueueConfig {
            dispatch_interval: Duration::from_millis(20),
            retry: RetryPolicy::new(3, Duration::from_millis(10)),
            ..QueueConfig::default()
        },
        ..EngineConfig::default()
    }
}

fn harness_with(backend: MemoryBackend, config: EngineConfig, journal: Option<TaskJournal>) -> Harness {
    let dir = tempdir().unwrap();
    let backend = Arc::new(backend);
    let status = Arc::new(StatusHub::new());
    let engine = SyncEngine::new(
        dir.path(),
        Collaborators::from_backend(backend.clone()),
        journal,
        status.clone(),
        config,
    );
    Harness {
        dir,
        backend,
        status,
        engine,
    }
}

fn harness(backend: MemoryBackend) -> Harness {
    harness_with(backend, test_config(), None)
}

fn project(id: &str, owner: &str) -> Project {
    Project {
        id: id.into(),
        name: format!("Album {id}"),
        owner: owner.into(),
        modified: 0,
    }
}

fn seed(
    backend: &MemoryBackend,
    project_id: &str,
    category: ItemCategory,
    name: &str,
    bytes: &[u8],
    modified: i64,
) -> RemoteItem {
    backend.seed_item(
        ItemWrite {
            project_id: project_id.into(),
            category,
            name: name.into(),
            locator: format!("{project_id}/{}/{name}", category.as_str()),
            hash: fileops::hash_bytes(bytes),
            size: bytes.len() as u64,
            modified,
        },
        bytes.to_vec(),
    )
}

fn backend_with_project(owner: &str) -> MemoryBackend {
    let backend = MemoryBackend::with_identity("u1", "User One");
    backend.add_project(project("P1", owner));
    backend
}

async fn eventually<F: FnMut() -> bool>(mut check: F, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn read(path: &Path) -> Option<Vec<u8>> {
    std::fs::read(path).ok()
}

#[tokio::test]
async fn start_requires_identity() {
    let h = harness(MemoryBackend::new());
    let err = h.engine.start().await.unwrap_err();
    assert!(matches!(err, EngineError::AuthRequired));
    assert!(!h.engine.is_running().await);
}

#[tokio::test]
async fn start_builds_project_skeleton_without_fetching() {
    let h = harness(backend_with_project("u1"));
    h.engine.start().await.unwrap();

    for folder in ["Tracks", "References", "WorkRequests"] {
        assert!(h.root().join("P1").join(folder).is_dir(), "{folder} missing");
    }
    let snapshot = sidecar::read_project_snapshot(&h.root().join("P1/.project.metadata"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.project.id, "P1");
    assert_eq!(h.engine.project_phase("P1"), Some(ProjectPhase::Listening));
    assert_eq!(
        h.engine.project_statuses().get("P1"),
        Some(&ProjectSyncStatus::Synced)
    );
    let status = h.engine.queue_status();
    assert!(status.is_idle());
    assert!(status.recent.is_empty());

    h.engine.stop().await;
}

#[tokio::test]
async fn start_writes_empty_placeholders_for_remote_items() {
    let backend = backend_with_project("u1");
    seed(&backend, "P1", ItemCategory::Tracks, "song.wav", b"full mix", 1_000);
    let h = harness(backend);
    h.engine.start().await.unwrap();

    let path = h.item_path("P1", ItemCategory::Tracks, "song.wav");
    assert_eq!(read(&path), Some(Vec::new()));
    let sidecar = sidecar::read_sidecar(&path).await.unwrap().unwrap();
    assert!(!sidecar.hydrated);
    assert_eq!(sidecar.item.size, 8);
    assert!(h.engine.queue_status().recent.is_empty());

    h.engine.stop().await;
}

#[tokio::test]
async fn local_save_is_uploaded_once() {
    let h = harness(backend_with_project("u1"));
    h.engine.start().await.unwrap();
    let mut events = h.engine.queue().subscribe();

    let path = h.item_path("P1", ItemCategory::Tracks, "song.wav");
    std::fs::write(&path, b"take one").unwrap();
    let first = h
        .engine
        .handle_local_event(LocalEvent::Changed(path.clone()))
        .await
        .unwrap();
    let second = h
        .engine
        .handle_local_event(LocalEvent::Changed(path.clone()))
        .await
        .unwrap();
    let id = first.expect("upload queued");
    assert_eq!(second, None);

    let mut seen = Vec::new();
    while !seen.contains(&"completed") {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("queue event in time")
            .unwrap();
        match event {
            QueueEvent::Queued { id: got, .. } if got == id => seen.push("queued"),
            QueueEvent::Started { id: got } if got == id => seen.push("started"),
            QueueEvent::Completed { id: got, .. } if got == id => seen.push("completed"),
            QueueEvent::Failed { error, .. } => panic!("upload failed: {error}"),
            _ => {}
        }
    }
    assert_eq!(seen, vec!["queued", "started", "completed"]);

    let remote = h.backend.item("P1", ItemCategory::Tracks, "song.wav").unwrap();
    assert_eq!(remote.hash, Some(fileops::hash_bytes(b"take one")));
    assert_eq!(h.backend.write_attempts(), 1);

    let sidecar = sidecar::read_sidecar(&path).await.unwrap().unwrap();
    assert_eq!(sidecar.sync_state, ItemSyncState::Synced);
    assert_eq!(sidecar.local_hash, remote.hash);

    h.engine.stop().await;
}

#[tokio::test]
async fn remote_newer_overwrites_local_without_conflict_copy() {
    let backend = backend_with_project("u1");
    let item = seed(&backend, "P1", ItemCategory::Tracks, "song.wav", b"v1", 1_000);
    let h = harness(backend);
    h.engine.start().await.unwrap();
    h.engine.fetch_content(&item.id).await.unwrap();

    let path = h.item_path("P1", ItemCategory::Tracks, "song.wav");
    std::fs::write(&path, b"v1 local edit").unwrap();
    seed(
        &h.backend,
        "P1",
        ItemCategory::Tracks,
        "song.wav",
        b"v2",
        fileops::now_millis() + 60_000,
    );

    eventually(|| read(&path).as_deref() == Some(b"v2".as_slice()), "remote bytes").await;
    let engine = h.engine.clone();
    eventually(|| engine.queue_status().is_idle(), "idle queue").await;
    assert!(conflict::list_conflict_files(h.root()).await.unwrap().is_empty());
    let sidecar = sidecar::read_sidecar(&path).await.unwrap().unwrap();
    assert_eq!(sidecar.local_hash, Some(fileops::hash_bytes(b"v2")));

    h.engine.stop().await;
}

#[tokio::test]
async fn both_modified_with_ask_policy_keeps_conflict_copy() {
    let config = EngineConfig {
        conflict_tolerance_ms: 600_000,
        ..test_config()
    };
    let backend = backend_with_project("u1");
    let item = seed(&backend, "P1", ItemCategory::References, "ref.wav", b"base", 1_000);
    let h = harness_with(backend, config, None);
    h.engine.start().await.unwrap();
    h.engine.fetch_content(&item.id).await.unwrap();
    let mut notes = h.engine.subscribe();

    let path = h.item_path("P1", ItemCategory::References, "ref.wav");
    std::fs::write(&path, b"mine").unwrap();
    seed(
        &h.backend,
        "P1",
        ItemCategory::References,
        "ref.wav",
        b"theirs",
        fileops::now_millis(),
    );

    eventually(|| read(&path).as_deref() == Some(b"theirs".as_slice()), "remote bytes").await;
    let copies = conflict::list_conflict_files(h.root()).await.unwrap();
    assert_eq!(copies.len(), 1);
    assert_eq!(read(&copies[0]), Some(b"mine".to_vec()));

    let status = h.status.clone();
    eventually(
        || status.project_status("P1") == Some(ProjectSyncStatus::Conflict),
        "conflict status",
    )
    .await;
    let mut created = false;
    while let Ok(note) = notes.try_recv() {
        if let SyncNotification::ConflictCreated { original, copy, .. } = note {
            assert_eq!(original, path);
            assert_eq!(copy, copies[0]);
            created = true;
        }
    }
    assert!(created);

    h.engine.stop().await;
}

#[tokio::test]
async fn own_write_is_not_uploaded_again() {
    let backend = backend_with_project("u1");
    let item = seed(&backend, "P1", ItemCategory::Tracks, "song.wav", b"mix", 1_000);
    let h = harness(backend);
    h.engine.start().await.unwrap();
    let bytes = h.engine.fetch_content(&item.id).await.unwrap();
    assert_eq!(bytes, b"mix");

    let path = h.item_path("P1", ItemCategory::Tracks, "song.wav");
    let queued = h
        .engine
        .handle_local_event(LocalEvent::Changed(path.clone()))
        .await
        .unwrap();
    assert_eq!(queued, None);
    let sidecar = sidecar::read_sidecar(&path).await.unwrap().unwrap();
    assert!(sidecar.hydrated);

    h.engine.stop().await;
}

#[tokio::test]
async fn ignored_files_never_produce_tasks() {
    let h = harness(backend_with_project("u1"));
    h.engine.start().await.unwrap();

    for name in [".DS_Store", "Thumbs.db", "bounce.tmp"] {
        let path = h.item_path("P1", ItemCategory::Tracks, name);
        std::fs::write(&path, b"junk").unwrap();
        let queued = h
            .engine
            .handle_local_event(LocalEvent::Changed(path))
            .await
            .unwrap();
        assert_eq!(queued, None, "{name} was queued");
    }
    let status = h.engine.queue_status();
    assert!(status.is_idle());
    assert!(status.recent.is_empty());

    h.engine.stop().await;
}

#[tokio::test]
async fn change_without_write_permission_stays_local() {
    let backend = backend_with_project("u1");
    backend.deny("P1", ProjectAction::Write);
    let h = harness(backend);
    h.engine.start().await.unwrap();

    let path = h.item_path("P1", ItemCategory::WorkRequests, "notes.txt");
    std::fs::write(&path, b"please fix the bridge").unwrap();
    let queued = h
        .engine
        .handle_local_event(LocalEvent::Changed(path))
        .await
        .unwrap();
    assert_eq!(queued, None);

    h.engine.stop().await;
}

#[tokio::test]
async fn deletion_by_non_owner_is_restored() {
    let backend = backend_with_project("someone-else");
    let item = seed(&backend, "P1", ItemCategory::Tracks, "song.wav", b"master", 1_000);
    let h = harness(backend);
    h.engine.start().await.unwrap();
    h.engine.fetch_content(&item.id).await.unwrap();
    let mut notes = h.engine.subscribe();

    let path = h.item_path("P1", ItemCategory::Tracks, "song.wav");
    std::fs::remove_file(&path).unwrap();
    let queued = h
        .engine
        .handle_local_event(LocalEvent::Removed(path.clone()))
        .await
        .unwrap();
    assert!(queued.is_some());

    eventually(|| read(&path).as_deref() == Some(b"master".as_slice()), "restored bytes").await;
    assert!(h.backend.item("P1", ItemCategory::Tracks, "song.wav").is_some());
    let mut restored = false;
    while let Ok(note) = notes.try_recv() {
        if let SyncNotification::ItemRestored {
            path: restored_path,
            ..
        } = note
        {
            assert_eq!(restored_path, path);
            restored = true;
        }
    }
    assert!(restored);

    h.engine.stop().await;
}

#[tokio::test]
async fn deletion_by_owner_removes_remote_item() {
    let backend = backend_with_project("u1");
    let item = seed(&backend, "P1", ItemCategory::Tracks, "song.wav", b"master", 1_000);
    let h = harness(backend);
    h.engine.start().await.unwrap();

    let path = h.item_path("P1", ItemCategory::Tracks, "song.wav");
    std::fs::remove_file(&path).unwrap();
    let queued = h
        .engine
        .handle_local_event(LocalEvent::Removed(path.clone()))
        .await
        .unwrap();
    assert!(queued.is_some());

    let backend = h.backend.clone();
    eventually(
        || backend.item("P1", ItemCategory::Tracks, "song.wav").is_none(),
        "remote removal",
    )
    .await;
    assert!(h.backend.object(item.locator.as_deref().unwrap()).is_none());
    let engine = h.engine.clone();
    eventually(|| engine.queue_status().is_idle(), "idle queue").await;
    assert!(!crate::sync::paths::sidecar_path(&path).exists());

    h.engine.stop().await;
}

#[tokio::test]
async fn remote_removal_of_edited_item_keeps_a_copy() {
    let backend = backend_with_project("u1");
    let item = seed(&backend, "P1", ItemCategory::Tracks, "song.wav", b"v1", 1_000);
    let h = harness(backend);
    h.engine.start().await.unwrap();
    h.engine.fetch_content(&item.id).await.unwrap();

    let path = h.item_path("P1", ItemCategory::Tracks, "song.wav");
    std::fs::write(&path, b"unsaved idea").unwrap();
    h.backend.remove_item("P1", ItemCategory::Tracks, "song.wav");

    eventually(|| !path.exists(), "local removal").await;
    let copies = conflict::list_conflict_files(h.root()).await.unwrap();
    assert_eq!(copies.len(), 1);
    assert_eq!(read(&copies[0]), Some(b"unsaved idea".to_vec()));

    h.engine.stop().await;
}

#[tokio::test]
async fn remote_project_lifecycle_is_mirrored() {
    let h = harness(MemoryBackend::with_identity("u1", "User One"));
    h.engine.start().await.unwrap();

    h.backend.add_project(project("P2", "u1"));
    let engine = h.engine.clone();
    eventually(
        || engine.project_phase("P2") == Some(ProjectPhase::Listening),
        "project bootstrap",
    )
    .await;
    assert!(h.root().join("P2/WorkRequests").is_dir());

    h.backend.remove_project("P2");
    let root = h.root().to_path_buf();
    eventually(|| !root.join("P2").exists(), "project teardown").await;
    assert_eq!(h.engine.project_phase("P2"), None);
    assert!(!h.engine.project_statuses().contains_key("P2"));

    h.engine.stop().await;
}

#[tokio::test]
async fn push_content_copies_into_mirror_and_uploads() {
    let backend = backend_with_project("u1");
    let item = seed(&backend, "P1", ItemCategory::Tracks, "song.wav", b"old", 1_000);
    let h = harness(backend);
    h.engine.start().await.unwrap();

    let outside = tempdir().unwrap();
    let source = outside.path().join("export.wav");
    std::fs::write(&source, b"new master").unwrap();
    let queued = h.engine.push_content(&item.id, &source).await.unwrap();
    assert!(queued.is_some());

    let path = h.item_path("P1", ItemCategory::Tracks, "song.wav");
    assert_eq!(read(&path), Some(b"new master".to_vec()));
    let backend = h.backend.clone();
    let locator = item.locator.clone().unwrap();
    eventually(
        || backend.object(&locator).as_deref() == Some(b"new master".as_slice()),
        "uploaded bytes",
    )
    .await;

    h.engine.stop().await;
}

#[tokio::test]
async fn anchors_are_journaled() {
    let journal = TaskJournal::in_memory().await.unwrap();
    let h = harness_with(backend_with_project("u1"), test_config(), Some(journal.clone()));
    h.engine.start().await.unwrap();

    seed(&h.backend, "P1", ItemCategory::Tracks, "late.wav", b"late", 1_000);
    let path = h.item_path("P1", ItemCategory::Tracks, "late.wav");
    eventually(|| path.exists(), "placeholder for new item").await;
    let mut anchor = None;
    for _ in 0..100 {
        anchor = journal.load_anchor("project:P1").await.unwrap();
        if anchor.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(anchor.is_some());

    h.engine.stop().await;
}

#[tokio::test]
async fn resync_dehydrates_oldest_items_over_cache_limit() {
    let config = EngineConfig {
        max_cache_bytes: 4,
        ..test_config()
    };
    let backend = backend_with_project("u1");
    let a = seed(&backend, "P1", ItemCategory::Tracks, "a.wav", b"aaaa", 1_000);
    let b = seed(&backend, "P1", ItemCategory::Tracks, "b.wav", b"bbbb", 1_000);
    let h = harness_with(backend, config, None);
    h.engine.start().await.unwrap();
    h.engine.fetch_content(&a.id).await.unwrap();
    h.engine.fetch_content(&b.id).await.unwrap();

    h.engine.resync_all().await.unwrap();

    let mut hydrated = 0;
    for name in ["a.wav", "b.wav"] {
        let path = h.item_path("P1", ItemCategory::Tracks, name);
        let sidecar = sidecar::read_sidecar(&path).await.unwrap().unwrap();
        if sidecar.hydrated {
            hydrated += 1;
        } else {
            assert_eq!(read(&path), Some(Vec::new()));
        }
    }
    assert_eq!(hydrated, 1);

    h.engine.stop().await;
}

#[tokio::test]
async fn stop_is_idempotent_and_clears_state() {
    let h = harness(backend_with_project("u1"));
    h.engine.stop().await;
    h.engine.start().await.unwrap();
    h.engine.start().await.unwrap();
    assert!(h.engine.is_running().await);

    h.engine.stop().await;
    h.engine.stop().await;
    assert!(!h.engine.is_running().await);
    assert_eq!(h.engine.project_phase("P1"), None);
    assert!(h.engine.project_statuses().is_empty());
    assert!(!h.engine.queue().is_running());
}

#[tokio::test]
async fn start_fails_cleanly_when_backend_is_unreachable() {
    let h = harness(backend_with_project("u1"));
    h.backend.fail_next_queries(1);

    let err = h.engine.start().await.unwrap_err();
    assert!(matches!(err, EngineError::Backend(_)));
    assert!(!h.engine.is_running().await);
    assert_eq!(h.engine.project_phase("P1"), None);
    assert!(h.engine.project_statuses().is_empty());
    assert!(!h.engine.queue().is_running());

    h.engine.start().await.unwrap();
    assert!(h.engine.is_running().await);
    assert_eq!(h.engine.project_phase("P1"), Some(ProjectPhase::Listening));

    h.engine.stop().await;
}

#[tokio::test]
async fn discovered_project_reports_pending_before_syncing() {
    let h = harness(backend_with_project("u1"));
    let mut notes = h.engine.subscribe();
    h.engine.start().await.unwrap();

    let mut seen = Vec::new();
    while let Ok(note) = notes.try_recv() {
        if let SyncNotification::ProjectStatusChanged { project_id, status } = note
            && project_id == "P1"
        {
            seen.push(status);
        }
    }
    assert_eq!(
        seen,
        vec![
            ProjectSyncStatus::Pending,
            ProjectSyncStatus::Syncing,
            ProjectSyncStatus::Synced
        ]
    );

    h.engine.stop().await;
}

#[tokio::test]
async fn fetch_refuses_path_with_pending_transfer() {
    let backend = backend_with_project("u1");
    let item = seed(&backend, "P1", ItemCategory::Tracks, "song.wav", b"remote mix", 1_000);
    let h = harness(backend);
    h.engine.start().await.unwrap();
    h.engine.queue().stop();

    let path = h.item_path("P1", ItemCategory::Tracks, "song.wav");
    std::fs::write(&path, b"my unsynced local take").unwrap();
    let queued = h
        .engine
        .handle_local_event(LocalEvent::Changed(path.clone()))
        .await
        .unwrap();
    assert!(queued.is_some());

    let err = h.engine.fetch_content(&item.id).await.unwrap_err();
    assert!(matches!(err, EngineError::PathBusy(ref busy) if *busy == path));
    assert_eq!(read(&path), Some(b"my unsynced local take".to_vec()));
    assert!(conflict::list_conflict_files(h.root()).await.unwrap().is_empty());

    h.engine.queue().start().await;
    let backend = h.backend.clone();
    let locator = item.locator.clone().unwrap();
    eventually(
        || backend.object(&locator).as_deref() == Some(b"my unsynced local take".as_slice()),
        "uploaded local take",
    )
    .await;

    h.engine.stop().await;
}

#[tokio::test]
async fn fetch_keeps_newer_local_edit_and_uploads_it() {
    let backend = backend_with_project("u1");
    let item = seed(&backend, "P1", ItemCategory::Tracks, "song.wav", b"remote mix", 1_000);
    let h = harness(backend);
    h.engine.start().await.unwrap();
    let mut events = h.engine.queue().subscribe();

    let path = h.item_path("P1", ItemCategory::Tracks, "song.wav");
    std::fs::write(&path, b"my unsynced local take").unwrap();
    let bytes = h.engine.fetch_content(&item.id).await.unwrap();

    assert_eq!(bytes, b"my unsynced local take");
    assert_eq!(read(&path), Some(b"my unsynced local take".to_vec()));
    assert!(conflict::list_conflict_files(h.root()).await.unwrap().is_empty());

    let backend = h.backend.clone();
    let locator = item.locator.clone().unwrap();
    eventually(
        || backend.object(&locator).as_deref() == Some(b"my unsynced local take".as_slice()),
        "local take uploaded",
    )
    .await;
    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let QueueEvent::Queued { kind, .. } = event {
            kinds.push(kind);
        }
    }
    assert_eq!(kinds, vec![TaskKind::Download, TaskKind::Upload]);

    h.engine.stop().await;
}

#[tokio::test]
async fn failed_permission_check_keeps_change_local() {
    let h = harness(backend_with_project("u1"));
    h.engine.start().await.unwrap();

    let path = h.item_path("P1", ItemCategory::Tracks, "song.wav");
    std::fs::write(&path, b"take one").unwrap();
    h.backend.fail_next_queries(u32::MAX);
    let result = h
        .engine
        .handle_local_event(LocalEvent::Changed(path.clone()))
        .await;
    h.backend.fail_next_queries(0);

    assert!(matches!(result, Err(EngineError::Backend(_))));
    assert!(!h.engine.queue().is_tracked(&path));
    assert!(h.backend.item("P1", ItemCategory::Tracks, "song.wav").is_none());

    h.engine.stop().await;
}
