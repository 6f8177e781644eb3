//! End-to-end tests for SyncEngine
//!
//! Each test runs a real engine against an in-memory remote store, a
//! temporary local root and an in-memory SQLite state database.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use driftsync_cache::{DatabasePool, SqliteStateRepository};
use driftsync_conflict::ConflictNamer;
use driftsync_core::config::ConfigBuilder;
use driftsync_core::domain::{DaemonStatus, ExclusionStatus, RemotePath};
use driftsync_core::ports::{ISyncControl, RemoteError, SyncControlError};
use driftsync_sync::{ContentHasher, LocalFileSystemAdapter, MemoryRemoteStore, SyncEngine};
use tempfile::TempDir;

// ============================================================================
// Test helpers
// ============================================================================

const SETTLE: Duration = Duration::from_secs(10);

struct Harness {
    engine: SyncEngine,
    remote: Arc<MemoryRemoteStore>,
    root: PathBuf,
    _dir: TempDir,
}

impl Harness {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap().join("Drift");
        std::fs::create_dir(&root).unwrap();

        let pool = DatabasePool::in_memory()
            .await
            .expect("Failed to create in-memory database");
        let repo = Arc::new(SqliteStateRepository::new(pool.pool().clone()));
        let remote = Arc::new(MemoryRemoteStore::new());
        let config = ConfigBuilder::new()
            .sync_root(root.clone())
            .sync_debounce_ms(30)
            .sync_quiescence_ms(50)
            .sync_longpoll_timeout_secs(1)
            .workers_concurrency(4)
            .retry_base_delay_ms(10)
            .retry_max_delay_ms(50)
            .build();
        let engine = SyncEngine::new(
            config,
            remote.clone(),
            Arc::new(LocalFileSystemAdapter::new()),
            repo.clone(),
            repo.clone(),
            repo,
        );

        Self {
            engine,
            remote,
            root,
            _dir: dir,
        }
    }

    async fn start(&self) {
        self.engine.start_sync().await.unwrap();
        self.settle().await;
    }

    async fn settle(&self) {
        assert!(
            self.engine.wait_for_idle(SETTLE).await,
            "engine did not settle: {:?}",
            self.engine.status().await
        );
    }

    fn local(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    fn write_local(&self, rel: &str, data: &[u8]) {
        let path = self.local(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, data).unwrap();
    }

    fn read_local(&self, rel: &str) -> Option<Vec<u8>> {
        std::fs::read(self.local(rel)).ok()
    }

    fn local_names(&self, rel: &str) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.local(rel))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

fn rp(s: &str) -> RemotePath {
    RemotePath::new(s.to_string()).unwrap()
}

/// Polls `check` until it holds or the settle timeout elapses
async fn eventually<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + SETTLE;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn exists(path: &Path) -> bool {
    std::fs::symlink_metadata(path).is_ok()
}

// ============================================================================
// Startup
// ============================================================================

#[tokio::test]
async fn test_initial_sync_merges_both_sides() {
    let h = Harness::new().await;
    h.remote.put_folder("/docs").unwrap();
    h.remote.put_file("/docs/remote.txt", b"from remote").unwrap();
    h.write_local("photos/local.jpg", b"from local");

    h.start().await;

    assert_eq!(h.read_local("docs/remote.txt").unwrap(), b"from remote");
    assert_eq!(
        h.remote.file_content("/photos/local.jpg").unwrap(),
        b"from local"
    );
    assert_eq!(h.engine.get_index().await.len(), 4);
    assert!(h.engine.status().await.sync_errors.is_empty());
}

#[tokio::test]
async fn test_resync_without_changes_is_idempotent() {
    let h = Harness::new().await;
    h.remote.put_file("/a.txt", b"a").unwrap();
    h.write_local("b.txt", b"b");
    h.start().await;

    let changes = h.remote.change_count();
    let index = h.engine.get_index().await;

    h.engine.sync_now().await.unwrap();
    h.settle().await;

    assert_eq!(h.remote.change_count(), changes);
    assert_eq!(h.engine.get_index().await, index);
}

#[tokio::test]
async fn test_restart_catches_up_from_cursor() {
    let h = Harness::new().await;
    h.remote.put_file("/a.txt", b"v1").unwrap();
    h.start().await;
    h.engine.stop_sync().await.unwrap();

    h.remote.put_file("/a.txt", b"v2").unwrap();
    h.remote.put_file("/new.txt", b"new").unwrap();
    h.write_local("offline.txt", b"written while stopped");

    h.start().await;
    assert_eq!(h.read_local("a.txt").unwrap(), b"v2");
    assert_eq!(h.read_local("new.txt").unwrap(), b"new");
    assert_eq!(
        h.remote.file_content("/offline.txt").unwrap(),
        b"written while stopped"
    );
}

// ============================================================================
// Live changes
// ============================================================================

#[tokio::test]
async fn test_remote_edit_reaches_local() {
    let h = Harness::new().await;
    h.remote.put_file("/notes.md", b"old").unwrap();
    h.start().await;

    h.remote.put_file("/notes.md", b"new revision").unwrap();
    eventually("remote edit downloaded", || {
        h.read_local("notes.md").as_deref() == Some(b"new revision".as_slice())
    })
    .await;
    h.settle().await;

    let entry = h
        .engine
        .get_index()
        .await
        .into_iter()
        .find(|e| e.path_cased() == &rp("/notes.md"))
        .unwrap();
    assert_eq!(entry.content_hash(), Some(&ContentHasher::hash_bytes(b"new revision")));
}

#[tokio::test]
async fn test_local_edit_reaches_remote() {
    let h = Harness::new().await;
    h.start().await;

    h.write_local("draft.txt", b"hello");
    eventually("local file uploaded", || {
        h.remote.file_content("/draft.txt").as_deref() == Some(b"hello".as_slice())
    })
    .await;
    h.settle().await;

    h.write_local("draft.txt", b"hello again");
    eventually("local edit uploaded", || {
        h.remote.file_content("/draft.txt").as_deref() == Some(b"hello again".as_slice())
    })
    .await;
}

#[tokio::test]
async fn test_each_idle_point_has_matching_hashes_and_a_new_revision() {
    let h = Harness::new().await;
    h.start().await;

    let synced = |h: &Harness| {
        let local = h.read_local("file.txt")?;
        let remote = h.remote.file_content("/file.txt")?;
        (local == remote).then_some(local)
    };

    h.write_local("file.txt", b"old");
    eventually("first upload", || synced(&h).as_deref() == Some(b"old".as_slice())).await;
    h.settle().await;
    let first = h
        .engine
        .get_index()
        .await
        .into_iter()
        .find(|e| e.path_cased() == &rp("/file.txt"))
        .unwrap();
    assert_eq!(first.content_hash(), Some(&ContentHasher::hash_bytes(b"old")));

    h.write_local("file.txt", b"new");
    eventually("second upload", || synced(&h).as_deref() == Some(b"new".as_slice())).await;
    h.settle().await;
    let second = h
        .engine
        .get_index()
        .await
        .into_iter()
        .find(|e| e.path_cased() == &rp("/file.txt"))
        .unwrap();
    assert_eq!(second.content_hash(), Some(&ContentHasher::hash_bytes(b"new")));
    assert_ne!(first.revision(), second.revision());
}

#[tokio::test]
async fn test_user_edit_right_after_download_is_uploaded() {
    let h = Harness::new().await;
    h.remote.put_file("/notes.md", b"v1").unwrap();
    h.start().await;

    h.remote.put_file("/notes.md", b"v2 remote").unwrap();
    eventually("remote edit downloaded", || {
        h.read_local("notes.md").as_deref() == Some(b"v2 remote".as_slice())
    })
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    h.write_local("notes.md", b"v3 user edit");
    eventually("user edit uploaded", || {
        h.remote.file_content("/notes.md").as_deref() == Some(b"v3 user edit".as_slice())
    })
    .await;
    h.settle().await;
    assert_eq!(h.read_local("notes.md").unwrap(), b"v3 user edit");
}

#[tokio::test]
async fn test_local_move_is_replayed_as_remote_move() {
    let h = Harness::new().await;
    h.remote.put_folder("/docs").unwrap();
    let before = h.remote.put_file("/docs/a.txt", b"moved content").unwrap();
    h.start().await;

    std::fs::rename(h.local("docs/a.txt"), h.local("docs/b.txt")).unwrap();
    eventually("remote item moved", || {
        h.remote.paths().iter().any(|p| p == "/docs/b.txt")
    })
    .await;
    h.settle().await;

    assert!(!h.remote.paths().iter().any(|p| p == "/docs/a.txt"));
    assert_eq!(h.remote.file_content("/docs/b.txt").unwrap(), b"moved content");
    let entry = h
        .engine
        .get_index()
        .await
        .into_iter()
        .find(|e| e.path_cased() == &rp("/docs/b.txt"))
        .unwrap();
    // A re-upload would have produced a new revision
    assert_eq!(entry.revision(), &before.revision);
    assert!(!h.engine.get_index().await.iter().any(|e| e.path_cased() == &rp("/docs/a.txt")));
}

#[tokio::test]
async fn test_failing_path_is_isolated_then_skipped() {
    let h = Harness::new().await;
    h.start().await;
    h.remote
        .refuse_uploads("/stuck.txt", RemoteError::Transient("locked".into()))
        .unwrap();

    h.write_local("stuck.txt", b"blocked");
    h.write_local("fine.txt", b"ok");
    eventually("other file uploaded", || {
        h.remote.file_content("/fine.txt").as_deref() == Some(b"ok".as_slice())
    })
    .await;

    let deadline = tokio::time::Instant::now() + SETTLE;
    let error = loop {
        let snapshot = h.engine.status().await;
        if let Some(e) = snapshot.sync_errors.iter().find(|e| e.path == rp("/stuck.txt")) {
            if e.skipped {
                break e.clone();
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "path was never skipped");
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    assert_eq!(error.attempts, 4);
    h.settle().await;
    assert_eq!(h.engine.status().await.status, DaemonStatus::Idle);
    assert!(h.remote.file_content("/stuck.txt").is_none());

    // A fresh edit earns a new retry budget
    h.remote.allow_uploads("/stuck.txt").unwrap();
    h.write_local("stuck.txt", b"unblocked");
    eventually("stuck file uploaded after edit", || {
        h.remote.file_content("/stuck.txt").as_deref() == Some(b"unblocked".as_slice())
    })
    .await;
    h.settle().await;
    assert!(h.engine.status().await.sync_errors.is_empty());
}

#[tokio::test]
async fn test_local_delete_reaches_remote() {
    let h = Harness::new().await;
    h.remote.put_folder("/old").unwrap();
    h.remote.put_file("/old/a.txt", b"a").unwrap();
    h.start().await;

    std::fs::remove_dir_all(h.local("old")).unwrap();
    eventually("remote folder deleted", || {
        !h.remote.paths().iter().any(|p| p.starts_with("/old"))
    })
    .await;
}

#[tokio::test]
async fn test_stale_cursor_recovers_with_full_listing() {
    let h = Harness::new().await;
    h.remote.put_file("/a.txt", b"a").unwrap();
    h.start().await;

    h.remote.invalidate_cursors();
    h.remote.put_file("/b.txt", b"b").unwrap();
    eventually("file seen after cursor reset", || {
        h.read_local("b.txt").is_some()
    })
    .await;
    h.settle().await;
    assert_eq!(h.read_local("a.txt").unwrap(), b"a");
}

// ============================================================================
// Conflicts and casing
// ============================================================================

#[tokio::test]
async fn test_conflicting_edits_keep_both_versions() {
    let h = Harness::new().await;
    h.remote.put_file("/report.txt", b"remote version").unwrap();
    h.write_local("report.txt", b"local version");

    h.start().await;

    assert_eq!(h.read_local("report.txt").unwrap(), b"remote version");
    let copies: Vec<String> = h
        .local_names("")
        .into_iter()
        .filter(|n| ConflictNamer::is_conflict_copy(n))
        .collect();
    assert_eq!(copies.len(), 1);
    assert_eq!(h.read_local(&copies[0]).unwrap(), b"local version");

    let remote_copy = format!("/{}", copies[0]);
    eventually("conflicted copy uploaded", || {
        h.remote.file_content(&remote_copy).as_deref() == Some(b"local version".as_slice())
    })
    .await;
}

#[tokio::test]
async fn test_remote_case_rename_renames_local() {
    let h = Harness::new().await;
    h.remote.put_file("/Readme.TXT", b"r").unwrap();
    h.start().await;
    assert_eq!(h.local_names(""), vec!["Readme.TXT"]);

    h.remote.rename("/Readme.TXT", "/readme.txt").unwrap();
    eventually("local casing updated", || {
        h.local_names("") == vec!["readme.txt"]
    })
    .await;
    h.settle().await;
    assert_eq!(h.remote.paths(), vec!["/readme.txt"]);
}

#[tokio::test]
async fn test_local_case_rename_leaves_one_index_entry() {
    let h = Harness::new().await;
    h.remote.put_folder("/Folder").unwrap();
    h.remote.put_file("/Folder/a.txt", b"a").unwrap();
    h.start().await;
    assert_eq!(h.local_names(""), vec!["Folder"]);

    std::fs::rename(h.local("Folder"), h.local("folder")).unwrap();
    eventually("remote casing updated", || {
        h.remote.paths().iter().any(|p| p == "/folder")
    })
    .await;
    h.settle().await;

    let index = h.engine.get_index().await;
    let folders: Vec<_> = index
        .iter()
        .filter(|e| e.path_lower().as_str() == "/folder")
        .collect();
    assert_eq!(folders.len(), 1);
    assert_eq!(folders[0].path_cased(), &rp("/folder"));
    assert_eq!(h.read_local("folder/a.txt").unwrap(), b"a");
}

// ============================================================================
// Selective sync
// ============================================================================

#[tokio::test]
async fn test_exclude_removes_local_copy_and_include_restores_it() {
    let h = Harness::new().await;
    h.remote.put_folder("/private").unwrap();
    h.remote.put_file("/private/a.txt", b"a").unwrap();
    h.start().await;
    assert!(exists(&h.local("private/a.txt")));

    h.engine.exclude_item(&rp("/private")).await.unwrap();
    assert!(!exists(&h.local("private")));
    assert_eq!(h.remote.file_content("/private/a.txt").unwrap(), b"a");
    assert_eq!(h.engine.excluded_items().await, vec![rp("/private")]);
    assert_eq!(
        h.engine.excluded_status(&rp("/private/a.txt")).await.unwrap(),
        ExclusionStatus::Excluded
    );

    h.engine.include_item(&rp("/private")).await.unwrap();
    assert_eq!(h.read_local("private/a.txt").unwrap(), b"a");
    assert!(h.engine.excluded_items().await.is_empty());
}

#[tokio::test]
async fn test_including_below_an_excluded_folder_expands_siblings() {
    let h = Harness::new().await;
    h.remote.put_folder("/a").unwrap();
    h.remote.put_file("/a/x.txt", b"x").unwrap();
    h.remote.put_folder("/a/b").unwrap();
    h.remote.put_file("/a/b/c.txt", b"c").unwrap();
    h.remote.put_file("/a/b/y.txt", b"y").unwrap();
    h.start().await;

    h.engine.exclude_item(&rp("/a")).await.unwrap();
    h.engine.include_item(&rp("/a/b/c.txt")).await.unwrap();

    assert_eq!(
        h.engine.excluded_items().await,
        vec![rp("/a/b/y.txt"), rp("/a/x.txt")]
    );
    assert_eq!(h.read_local("a/b/c.txt").unwrap(), b"c");
    assert!(!exists(&h.local("a/x.txt")));
    assert!(!exists(&h.local("a/b/y.txt")));
    assert_eq!(
        h.engine.excluded_status(&rp("/a")).await.unwrap(),
        ExclusionStatus::PartiallyExcluded
    );
}

#[tokio::test]
async fn test_excluded_items_do_not_sync() {
    let h = Harness::new().await;
    h.remote.put_folder("/skip").unwrap();
    h.start().await;
    h.engine.exclude_item(&rp("/skip")).await.unwrap();

    h.remote.put_file("/skip/remote.txt", b"r").unwrap();
    h.remote.put_file("/seen.txt", b"s").unwrap();
    eventually("sibling downloaded", || h.read_local("seen.txt").is_some()).await;
    h.settle().await;
    assert!(!exists(&h.local("skip")));
}

#[tokio::test]
async fn test_set_excluded_items_replaces_the_set() {
    let h = Harness::new().await;
    h.remote.put_folder("/one").unwrap();
    h.remote.put_file("/one/1.txt", b"1").unwrap();
    h.remote.put_folder("/two").unwrap();
    h.remote.put_file("/two/2.txt", b"2").unwrap();
    h.start().await;

    h.engine.set_excluded_items(vec![rp("/one")]).await.unwrap();
    assert!(!exists(&h.local("one")));

    h.engine.set_excluded_items(vec![rp("/two")]).await.unwrap();
    assert_eq!(h.read_local("one/1.txt").unwrap(), b"1");
    assert!(!exists(&h.local("two")));
    assert_eq!(h.engine.excluded_items().await, vec![rp("/two")]);
}

// ============================================================================
// Concurrency and control
// ============================================================================

#[tokio::test]
async fn test_one_reconciliation_per_path_at_a_time() {
    let h = Harness::new().await;
    h.start().await;

    for round in 0..5u8 {
        for i in 0..10 {
            h.write_local(&format!("burst/{i}.txt"), &[round; 64]);
            h.remote
                .put_file(&format!("/burst/{i}.txt"), &[round.wrapping_add(100); 64])
                .ok();
        }
        tokio::time::sleep(Duration::from_millis(15)).await;
    }
    h.settle().await;

    assert!(h.engine.peak_path_concurrency() <= 1);
}

#[tokio::test]
async fn test_pause_holds_work_until_resume() {
    let h = Harness::new().await;
    h.start().await;

    h.engine.pause_sync().await.unwrap();
    assert_eq!(h.engine.status().await.status, DaemonStatus::Paused);
    h.remote.put_file("/later.txt", b"later").unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(h.read_local("later.txt").is_none());

    h.engine.resume_sync().await.unwrap();
    eventually("download after resume", || h.read_local("later.txt").is_some()).await;
}

#[tokio::test]
async fn test_history_records_completed_actions() {
    let h = Harness::new().await;
    h.remote.put_file("/a.txt", b"a").unwrap();
    h.write_local("b.txt", b"b");
    h.start().await;

    let history = h.engine.history().await;
    let paths: Vec<RemotePath> = history.iter().map(|e| e.path.clone()).collect();
    assert!(paths.contains(&rp("/a.txt")));
    assert!(paths.contains(&rp("/b.txt")));
}

#[tokio::test]
async fn test_rebuild_index_keeps_both_sides_intact() {
    let h = Harness::new().await;
    h.remote.put_file("/a.txt", b"a").unwrap();
    h.write_local("b.txt", b"b");
    h.start().await;
    let changes = h.remote.change_count();

    h.engine.rebuild_index().await.unwrap();
    h.settle().await;

    assert_eq!(h.engine.get_index().await.len(), 2);
    assert_eq!(h.remote.change_count(), changes);
    assert_eq!(h.local_names(""), vec!["a.txt", "b.txt"]);
}

#[tokio::test]
async fn test_start_twice_is_a_no_op() {
    let h = Harness::new().await;
    h.start().await;
    h.engine.start_sync().await.unwrap();
    assert!(h.engine.status().await.status.is_running());

    h.engine.stop_sync().await.unwrap();
    assert!(matches!(
        h.engine.resume_sync().await,
        Err(SyncControlError::InvalidState(_))
    ));
}
