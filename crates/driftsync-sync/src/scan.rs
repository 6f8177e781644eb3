//! Full scans diffed against the index
//!
//! Used when no event stream can be trusted: at startup, after a stale
//! remote cursor, and for the periodic reindex. Both scans produce plain
//! events; the reconciler decides what they mean.

use std::collections::HashSet;

use anyhow::Result;
use driftsync_core::domain::{EventSource, IndexEntry, ItemType, PathKey, RemotePath, SyncEvent};
use driftsync_core::ports::RemoteMetadata;
use tracing::{debug, info};

use crate::filesystem::is_temp_name;
use crate::reconciler::SyncContext;
use crate::retry::with_retry;

/// Events for every difference between a remote listing and the index
///
/// Items are visited in key order so folders come before their content.
pub fn diff_remote_listing(
    ctx: &SyncContext,
    mut listing: Vec<RemoteMetadata>,
    indexed: Vec<IndexEntry>,
) -> Vec<SyncEvent> {
    listing.sort_by_key(|m| m.path.key());
    let mut events = Vec::new();
    let mut seen: HashSet<PathKey> = HashSet::new();
    let by_key: std::collections::HashMap<PathKey, &IndexEntry> =
        indexed.iter().map(|e| (e.path_lower().clone(), e)).collect();

    for meta in &listing {
        if ctx.exclusions.is_excluded(&meta.path) {
            continue;
        }
        let key = meta.path.key();
        seen.insert(key.clone());
        let event = match by_key.get(&key) {
            None => Some(SyncEvent::added(meta.path.clone(), EventSource::Remote)),
            Some(entry) if entry.item_type() != meta.item_type => {
                Some(SyncEvent::changed(meta.path.clone(), EventSource::Remote))
            }
            Some(entry) if entry.path_cased().file_name() != meta.path.file_name() => {
                Some(SyncEvent::moved(
                    entry.path_cased().clone(),
                    meta.path.clone(),
                    EventSource::Remote,
                ))
            }
            Some(entry) if !meta.is_folder() && entry.revision() != &meta.revision => {
                Some(SyncEvent::changed(meta.path.clone(), EventSource::Remote))
            }
            Some(_) => None,
        };
        events.extend(event);
    }

    events.extend(deleted_since(ctx, &indexed, &seen, EventSource::Remote));
    events
}

/// Remote listing diffed against the index
pub async fn remote_diff(ctx: &SyncContext) -> Result<Vec<SyncEvent>> {
    let remote = &ctx.remote;
    let root = RemotePath::root();
    let listing = with_retry(&ctx.retry, "list_folder", || remote.list_folder(&root, true)).await?;
    let indexed = ctx.index.all().await;
    let events = diff_remote_listing(ctx, listing, indexed);
    info!(events = events.len(), "Remote scan complete");
    Ok(events)
}

/// Local tree diffed against the index
///
/// Files whose mtime matches the index are assumed unchanged; others are
/// hashed.
pub async fn local_diff(ctx: &SyncContext) -> Result<Vec<SyncEvent>> {
    let items = ctx.local.list_tree(ctx.root.as_path()).await?;
    let indexed = ctx.index.all().await;
    let by_key: std::collections::HashMap<PathKey, &IndexEntry> =
        indexed.iter().map(|e| (e.path_lower().clone(), e)).collect();

    let mut events = Vec::new();
    let mut seen: HashSet<PathKey> = HashSet::new();
    for item in &items {
        let name = item.path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if is_temp_name(name) {
            continue;
        }
        let path = match ctx.root.remote_for(&item.path) {
            Ok(path) => path,
            Err(e) => {
                debug!(path = %item.path.display(), error = %e, "Skipping unmappable local item");
                continue;
            }
        };
        if ctx.exclusions.is_excluded(&path) {
            continue;
        }
        let key = path.key();
        seen.insert(key.clone());

        let event = match by_key.get(&key) {
            None => Some(SyncEvent::added(path, EventSource::Local)),
            Some(entry) if entry.item_type() != item.item_type => {
                Some(SyncEvent::changed(path, EventSource::Local))
            }
            Some(entry) if entry.path_cased().file_name() != path.file_name() => Some(
                SyncEvent::moved(entry.path_cased().clone(), path, EventSource::Local),
            ),
            Some(_) if item.item_type == ItemType::Folder => None,
            Some(entry)
                if entry.local_mtime().is_some() && entry.local_mtime() == item.modified =>
            {
                None
            }
            Some(entry) => {
                let hash = ctx.local.compute_hash(&item.path).await?;
                (entry.content_hash() != Some(&hash))
                    .then(|| SyncEvent::changed(path, EventSource::Local))
            }
        };
        events.extend(event);
    }

    events.extend(deleted_since(ctx, &indexed, &seen, EventSource::Local));
    info!(events = events.len(), "Local scan complete");
    Ok(events)
}

/// Topmost indexed items a scan did not see
fn deleted_since(
    ctx: &SyncContext,
    indexed: &[IndexEntry],
    seen: &HashSet<PathKey>,
    source: EventSource,
) -> Vec<SyncEvent> {
    let missing: HashSet<&PathKey> = indexed
        .iter()
        .map(IndexEntry::path_lower)
        .filter(|k| !seen.contains(*k))
        .collect();

    let mut deleted: Vec<&IndexEntry> = indexed
        .iter()
        .filter(|e| missing.contains(e.path_lower()))
        .filter(|e| !ctx.exclusions.is_excluded(e.path_cased()))
        .filter(|e| {
            e.path_cased()
                .parent()
                .map_or(true, |p| p.is_root() || !missing.contains(&p.key()))
        })
        .collect();
    deleted.sort_by_key(|e| e.path_lower().clone());
    deleted
        .into_iter()
        .map(|e| SyncEvent::deleted(e.path_cased().clone(), source))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use driftsync_cache::{DatabasePool, SqliteStateRepository};
    use driftsync_core::config::{HistoryConfig, RetryConfig};
    use driftsync_core::domain::{Change, ContentHash, Revision, SyncPath};
    use driftsync_core::ports::ILocalFileSystem;

    use super::*;
    use crate::filesystem::{ContentHasher, LocalFileSystemAdapter};
    use crate::history::HistoryLog;
    use crate::index::SyncIndex;
    use crate::remote::MemoryRemoteStore;
    use crate::retry::RetryPolicy;
    use crate::selective::ExclusionState;
    use crate::status::StatusMachine;
    use crate::watcher::IgnoreRegistry;

    fn rp(s: &str) -> RemotePath {
        RemotePath::new(s.to_string()).unwrap()
    }

    fn rev(s: &str) -> Revision {
        Revision::new(s.to_string()).unwrap()
    }

    fn hash(c: char) -> ContentHash {
        ContentHash::new(c.to_string().repeat(64)).unwrap()
    }

    async fn context(root: &std::path::Path) -> SyncContext {
        let pool = DatabasePool::in_memory().await.unwrap();
        let repo = Arc::new(SqliteStateRepository::new(pool.pool().clone()));
        SyncContext {
            root: SyncPath::new(root.to_path_buf()).unwrap(),
            remote: Arc::new(MemoryRemoteStore::new()),
            local: Arc::new(LocalFileSystemAdapter::new()),
            index: Arc::new(SyncIndex::new(repo.clone())),
            exclusions: Arc::new(ExclusionState::new(repo.clone())),
            history: Arc::new(HistoryLog::new(repo, &HistoryConfig::default())),
            status: Arc::new(StatusMachine::new(Duration::ZERO, 3)),
            ignore: Arc::new(IgnoreRegistry::default()),
            retry: RetryPolicy::from_config(&RetryConfig::default()),
            upload: true,
            download: true,
        }
    }

    fn meta(path: &str, revision: &str) -> RemoteMetadata {
        RemoteMetadata {
            path: rp(path),
            item_type: ItemType::File,
            revision: rev(revision),
            content_hash: Some(hash('a')),
            size: 1,
            modified: None,
        }
    }

    #[tokio::test]
    async fn test_remote_listing_diff() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path()).await;
        let indexed = vec![
            IndexEntry::file(rp("/same.txt"), rev("r1"), hash('a'), None).unwrap(),
            IndexEntry::file(rp("/edited.txt"), rev("r1"), hash('a'), None).unwrap(),
            IndexEntry::folder(rp("/gone")),
            IndexEntry::file(rp("/gone/inner.txt"), rev("r1"), hash('a'), None).unwrap(),
            IndexEntry::file(rp("/Cased.txt"), rev("r1"), hash('a'), None).unwrap(),
        ];
        let listing = vec![
            meta("/same.txt", "r1"),
            meta("/edited.txt", "r2"),
            meta("/new.txt", "r1"),
            meta("/cased.txt", "r1"),
        ];

        let events = diff_remote_listing(&ctx, listing, indexed);
        let changes: Vec<_> = events.iter().map(|e| e.change.clone()).collect();
        assert_eq!(
            changes,
            vec![
                Change::Moved {
                    from: rp("/Cased.txt"),
                    to: rp("/cased.txt")
                },
                Change::Changed {
                    path: rp("/edited.txt")
                },
                Change::Added {
                    path: rp("/new.txt")
                },
                // Only the topmost missing item
                Change::Deleted { path: rp("/gone") },
            ]
        );
        assert!(events.iter().all(|e| e.source == EventSource::Remote));
    }

    #[tokio::test]
    async fn test_remote_listing_skips_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path()).await;
        let mut set = ctx.exclusions.snapshot();
        set.exclude(rp("/private"));
        ctx.exclusions.replace(set).await.unwrap();

        let events = diff_remote_listing(
            &ctx,
            vec![meta("/private/a.txt", "r1")],
            vec![IndexEntry::folder(rp("/private"))],
        );
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_local_diff_detects_edits_additions_and_deletions() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path()).await;
        let fs = LocalFileSystemAdapter::new();

        let kept = fs.write_file(&dir.path().join("kept.txt"), b"kept").await.unwrap();
        fs.write_file(&dir.path().join("edited.txt"), b"new").await.unwrap();
        fs.write_file(&dir.path().join("added.txt"), b"added").await.unwrap();
        fs.write_file(&dir.path().join(".~driftsync.x.0badc0de.tmp"), b"tmp").await.unwrap();

        ctx.index
            .put(
                IndexEntry::file(
                    rp("/kept.txt"),
                    rev("r1"),
                    ContentHasher::hash_bytes(b"kept"),
                    kept.modified,
                )
                .unwrap(),
            )
            .await
            .unwrap();
        ctx.index
            .put(
                IndexEntry::file(
                    rp("/edited.txt"),
                    rev("r1"),
                    ContentHasher::hash_bytes(b"old"),
                    None,
                )
                .unwrap(),
            )
            .await
            .unwrap();
        ctx.index
            .put(IndexEntry::file(rp("/removed.txt"), rev("r1"), hash('a'), None).unwrap())
            .await
            .unwrap();

        let events = local_diff(&ctx).await.unwrap();
        let changes: Vec<_> = events.iter().map(|e| e.change.clone()).collect();
        assert!(changes.contains(&Change::Added {
            path: rp("/added.txt")
        }));
        assert!(changes.contains(&Change::Changed {
            path: rp("/edited.txt")
        }));
        assert!(changes.contains(&Change::Deleted {
            path: rp("/removed.txt")
        }));
        assert_eq!(changes.len(), 3);
    }
}
