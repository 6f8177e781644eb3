//! Remote store backed by a plain directory
//!
//! Lets the daemon keep two directories in step, for example a home folder
//! and a mounted share. The directory has no change journal of its own, so
//! the store rescans it and diffs the listing against the previous one to
//! build a change log. Revisions are derived from the content hash and the
//! modification time; hashes are cached by size and mtime.
//!
//! Each process starts a new cursor session, so a cursor persisted by an
//! earlier run always yields `CursorReset` and triggers a full listing.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use driftsync_core::domain::{
    ContentHash, Cursor, ItemType, PathKey, RemotePath, Revision, SyncPath,
};
use driftsync_core::ports::{
    ChangePage, ILocalFileSystem, IRemoteStore, RemoteChange, RemoteError, RemoteMetadata,
    WriteMode,
};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::validate_path;
use crate::filesystem::LocalFileSystemAdapter;

const PAGE_SIZE: usize = 500;

#[derive(Clone)]
struct CachedHash {
    size: u64,
    modified: Option<DateTime<Utc>>,
    hash: ContentHash,
}

struct Journal {
    session: String,
    sequence: u64,
    log: Vec<(u64, RemoteChange)>,
    snapshot: BTreeMap<PathKey, RemoteMetadata>,
    hashes: HashMap<PathBuf, CachedHash>,
}

pub struct DirectoryRemoteStore {
    root: SyncPath,
    fs: LocalFileSystemAdapter,
    journal: Mutex<Journal>,
    scan_interval: Duration,
}

impl DirectoryRemoteStore {
    /// Opens `root` as a remote, creating it if needed
    ///
    /// # Errors
    /// Fails when the directory cannot be created or is not absolute.
    pub async fn open(root: PathBuf, scan_interval: Duration) -> Result<Self> {
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("Failed to create remote directory {}", root.display()))?;
        let root = SyncPath::new(root)?;
        let store = Self {
            root,
            fs: LocalFileSystemAdapter::new(),
            journal: Mutex::new(Journal {
                session: Uuid::new_v4().simple().to_string(),
                sequence: 0,
                log: Vec::new(),
                snapshot: BTreeMap::new(),
                hashes: HashMap::new(),
            }),
            scan_interval: scan_interval.max(Duration::from_millis(10)),
        };

        {
            let mut journal = store.journal.lock().await;
            journal.snapshot = store.scan(&mut journal.hashes).await?;
            info!(
                root = %store.root,
                items = journal.snapshot.len(),
                "Directory remote opened"
            );
        }
        Ok(store)
    }

    fn revision_for(hash: &ContentHash, modified: Option<DateTime<Utc>>) -> Result<Revision> {
        let micros = modified.map_or(0, |m| m.timestamp_micros());
        Ok(Revision::new(format!("{}.{micros:x}", &hash.as_str()[..12]))?)
    }

    async fn hash_of(
        &self,
        hashes: &mut HashMap<PathBuf, CachedHash>,
        path: &Path,
        size: u64,
        modified: Option<DateTime<Utc>>,
    ) -> Result<ContentHash> {
        if let Some(cached) = hashes.get(path) {
            if cached.size == size && cached.modified == modified {
                return Ok(cached.hash.clone());
            }
        }
        let hash = self.fs.compute_hash(path).await?;
        hashes.insert(
            path.to_path_buf(),
            CachedHash {
                size,
                modified,
                hash: hash.clone(),
            },
        );
        Ok(hash)
    }

    /// Full listing of the directory, keyed case-insensitively
    async fn scan(
        &self,
        hashes: &mut HashMap<PathBuf, CachedHash>,
    ) -> Result<BTreeMap<PathKey, RemoteMetadata>> {
        let mut snapshot = BTreeMap::new();
        let mut seen = HashSet::new();
        for item in self.fs.list_tree(self.root.as_path()).await? {
            let path = self.root.remote_for(&item.path)?;
            let meta = match item.item_type {
                ItemType::Folder => RemoteMetadata::folder(path),
                ItemType::File => {
                    let hash = self
                        .hash_of(hashes, &item.path, item.size, item.modified)
                        .await?;
                    RemoteMetadata {
                        path,
                        item_type: ItemType::File,
                        revision: Self::revision_for(&hash, item.modified)?,
                        content_hash: Some(hash),
                        size: item.size,
                        modified: item.modified,
                    }
                }
            };
            snapshot.insert(meta.path.key(), meta);
            seen.insert(item.path);
        }
        hashes.retain(|p, _| seen.contains(p));
        Ok(snapshot)
    }

    /// Rescans and appends the difference to the change log
    async fn refresh(&self, journal: &mut Journal) -> Result<()> {
        let current = self.scan(&mut journal.hashes).await?;
        let mut changes = Vec::new();

        for (key, old) in &journal.snapshot {
            let gone = match current.get(key) {
                None => true,
                Some(new) => new.path != old.path || new.item_type != old.item_type,
            };
            let parent_gone = old.path.ancestors().iter().any(|a| {
                !a.is_root()
                    && journal
                        .snapshot
                        .get(&a.key())
                        .is_some_and(|m| current.get(&a.key()).map(|n| &n.path) != Some(&m.path))
            });
            if gone && !parent_gone {
                changes.push(RemoteChange::Deleted {
                    path: old.path.clone(),
                });
            }
        }
        for (key, new) in &current {
            let fresh = match journal.snapshot.get(key) {
                None => true,
                Some(old) => old != new,
            };
            if fresh {
                changes.push(RemoteChange::Upserted(new.clone()));
            }
        }

        if !changes.is_empty() {
            debug!(changes = changes.len(), "Directory remote changed");
        }
        for change in changes {
            journal.sequence += 1;
            let seq = journal.sequence;
            journal.log.push((seq, change));
        }
        journal.snapshot = current;
        Ok(())
    }

    fn position(journal: &Journal, cursor: &Cursor) -> Option<u64> {
        let (session, seq) = cursor.as_str().split_once(':')?;
        (session == journal.session).then_some(())?;
        seq.parse().ok()
    }

    /// Current metadata of `path`, resolved case-insensitively
    async fn current(
        &self,
        journal: &mut Journal,
        path: &RemotePath,
    ) -> Result<Option<RemoteMetadata>> {
        self.refresh(journal).await?;
        Ok(journal.snapshot.get(&path.key()).cloned())
    }

    fn local(&self, path: &RemotePath) -> PathBuf {
        self.root.local_for(path)
    }
}

#[async_trait::async_trait]
impl IRemoteStore for DirectoryRemoteStore {
    async fn list_folder(&self, path: &RemotePath, recursive: bool) -> Result<Vec<RemoteMetadata>> {
        let mut journal = self.journal.lock().await;
        self.refresh(&mut journal).await?;
        let key = path.key();
        if !path.is_root() && !journal.snapshot.get(&key).is_some_and(RemoteMetadata::is_folder) {
            return Err(RemoteError::NotFound(path.to_string()).into());
        }
        Ok(journal
            .snapshot
            .values()
            .filter(|meta| {
                if recursive {
                    meta.path.key().is_descendant_of(&key)
                } else {
                    meta.path.parent().is_some_and(|p| p.key() == key)
                }
            })
            .cloned()
            .collect())
    }

    async fn get_metadata(&self, path: &RemotePath) -> Result<Option<RemoteMetadata>> {
        let mut journal = self.journal.lock().await;
        self.current(&mut journal, path).await
    }

    async fn latest_cursor(&self) -> Result<Cursor> {
        let mut journal = self.journal.lock().await;
        self.refresh(&mut journal).await?;
        Ok(Cursor::new(format!("{}:{}", journal.session, journal.sequence))?)
    }

    async fn list_changes(&self, cursor: &Cursor) -> Result<ChangePage> {
        let mut journal = self.journal.lock().await;
        let since = Self::position(&journal, cursor).ok_or(RemoteError::CursorReset)?;
        self.refresh(&mut journal).await?;

        let pending: Vec<&(u64, RemoteChange)> =
            journal.log.iter().filter(|(seq, _)| *seq > since).collect();
        let has_more = pending.len() > PAGE_SIZE;
        let page: Vec<&(u64, RemoteChange)> = pending.into_iter().take(PAGE_SIZE).collect();
        let last = page.last().map_or(since, |(seq, _)| *seq);

        Ok(ChangePage {
            changes: page.into_iter().map(|(_, c)| c.clone()).collect(),
            cursor: Cursor::new(format!("{}:{last}", journal.session))?,
            has_more,
        })
    }

    #[instrument(skip(self), fields(cursor = %cursor))]
    async fn longpoll(&self, cursor: &Cursor, timeout: Duration) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut journal = self.journal.lock().await;
                let Some(since) = Self::position(&journal, cursor) else {
                    return Ok(true);
                };
                self.refresh(&mut journal).await?;
                if journal.sequence > since {
                    return Ok(true);
                }
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(self.scan_interval.min(deadline - now)).await;
        }
    }

    async fn download(&self, path: &RemotePath) -> Result<(RemoteMetadata, Vec<u8>)> {
        let mut journal = self.journal.lock().await;
        let meta = self
            .current(&mut journal, path)
            .await?
            .filter(|m| !m.is_folder())
            .ok_or_else(|| RemoteError::NotFound(path.to_string()))?;
        let data = self.fs.read_file(&self.local(&meta.path)).await?;
        Ok((meta, data))
    }

    async fn upload(
        &self,
        path: &RemotePath,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<RemoteMetadata> {
        validate_path(path)?;
        let mut journal = self.journal.lock().await;
        let existing = self.current(&mut journal, path).await?;
        let target = match (&existing, &mode) {
            (Some(meta), _) if meta.is_folder() => {
                return Err(RemoteError::RevisionMismatch(path.to_string()).into())
            }
            (Some(_), WriteMode::Add) | (None, WriteMode::Update(_)) => {
                return Err(RemoteError::RevisionMismatch(path.to_string()).into())
            }
            (Some(meta), WriteMode::Update(rev)) if &meta.revision != rev => {
                return Err(RemoteError::RevisionMismatch(path.to_string()).into())
            }
            (Some(meta), _) => meta.path.clone(),
            (None, _) => path.clone(),
        };

        for ancestor in target.ancestors() {
            if let Some(meta) = journal.snapshot.get(&ancestor.key()) {
                if !meta.is_folder() {
                    return Err(RemoteError::RevisionMismatch(ancestor.to_string()).into());
                }
            }
        }
        self.fs.write_file(&self.local(&target), data).await?;
        self.current(&mut journal, &target)
            .await?
            .ok_or_else(|| RemoteError::Transient(format!("{target} vanished after write")).into())
    }

    async fn create_folder(&self, path: &RemotePath) -> Result<RemoteMetadata> {
        validate_path(path)?;
        let mut journal = self.journal.lock().await;
        match self.current(&mut journal, path).await? {
            Some(meta) if meta.is_folder() => return Ok(meta),
            Some(_) => return Err(RemoteError::RevisionMismatch(path.to_string()).into()),
            None => {}
        }
        self.fs.create_directory(&self.local(path)).await?;
        self.current(&mut journal, path)
            .await?
            .ok_or_else(|| RemoteError::Transient(format!("{path} vanished after mkdir")).into())
    }

    async fn delete(&self, path: &RemotePath) -> Result<()> {
        let mut journal = self.journal.lock().await;
        let meta = self
            .current(&mut journal, path)
            .await?
            .ok_or_else(|| RemoteError::NotFound(path.to_string()))?;
        self.fs.remove(&self.local(&meta.path)).await?;
        self.refresh(&mut journal).await
    }

    async fn move_item(&self, from: &RemotePath, to: &RemotePath) -> Result<RemoteMetadata> {
        validate_path(to)?;
        let mut journal = self.journal.lock().await;
        let source = self
            .current(&mut journal, from)
            .await?
            .ok_or_else(|| RemoteError::NotFound(from.to_string()))?;
        if to.key() != source.path.key() && journal.snapshot.contains_key(&to.key()) {
            return Err(RemoteError::RevisionMismatch(to.to_string()).into());
        }
        if to.key().is_descendant_of(&source.path.key()) {
            return Err(RemoteError::InvalidName(to.to_string()).into());
        }

        self.fs
            .rename(&self.local(&source.path), &self.local(to))
            .await?;
        self.current(&mut journal, to)
            .await?
            .ok_or_else(|| RemoteError::Transient(format!("{to} vanished after move")).into())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn rp(s: &str) -> RemotePath {
        RemotePath::new(s.to_string()).unwrap()
    }

    async fn open() -> (DirectoryRemoteStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = DirectoryRemoteStore::open(dir.path().to_path_buf(), Duration::from_millis(10))
            .await
            .unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_upload_download_and_conditional_writes() {
        let (store, dir) = open().await;
        let meta = store
            .upload(&rp("/Docs/a.txt"), b"hello", WriteMode::Add)
            .await
            .unwrap();
        assert!(dir.path().join("Docs/a.txt").exists());

        let (downloaded, data) = store.download(&rp("/docs/A.TXT")).await.unwrap();
        assert_eq!(data, b"hello");
        assert_eq!(downloaded.revision, meta.revision);

        assert!(store
            .upload(&rp("/Docs/a.txt"), b"x", WriteMode::Add)
            .await
            .is_err());
        let updated = store
            .upload(&rp("/Docs/a.txt"), b"world", WriteMode::Update(meta.revision.clone()))
            .await
            .unwrap();
        assert_ne!(updated.revision, meta.revision);
    }

    #[tokio::test]
    async fn test_external_edits_show_up_as_changes() {
        let (store, dir) = open().await;
        let cursor = store.latest_cursor().await.unwrap();

        std::fs::create_dir_all(dir.path().join("d")).unwrap();
        std::fs::write(dir.path().join("d/f.txt"), b"f").unwrap();
        assert!(store.longpoll(&cursor, Duration::from_secs(2)).await.unwrap());

        let page = store.list_changes(&cursor).await.unwrap();
        assert_eq!(page.changes.len(), 2);

        std::fs::remove_dir_all(dir.path().join("d")).unwrap();
        let page = store.list_changes(&page.cursor).await.unwrap();
        assert_eq!(page.changes, vec![RemoteChange::Deleted { path: rp("/d") }]);
    }

    #[tokio::test]
    async fn test_cursor_from_another_session_resets() {
        let (store, _dir) = open().await;
        let stale = Cursor::new("other:3".to_string()).unwrap();
        let err = store.list_changes(&stale).await.unwrap_err();
        assert_eq!(RemoteError::classify(&err), Some(&RemoteError::CursorReset));
    }

    #[tokio::test]
    async fn test_invalid_names_are_refused() {
        let (store, _dir) = open().await;
        let err = store
            .upload(&rp("/bad name "), b"x", WriteMode::Add)
            .await
            .unwrap_err();
        assert!(matches!(
            RemoteError::classify(&err),
            Some(RemoteError::InvalidName(_))
        ));
    }
}
