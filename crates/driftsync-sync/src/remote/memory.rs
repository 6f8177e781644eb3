//! In-memory remote store
//!
//! Keeps items in a case-insensitive map and appends every mutation to a
//! change log, so cursors, paging and long-polling behave like a hosted
//! service. Cursors are `"{session}:{sequence}"`; starting a new session
//! invalidates all of them.
//!
//! The `put_*`, `remove` and `rename` helpers mutate the store as another
//! client would; tests use them to simulate remote edits.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use driftsync_core::domain::{Cursor, ItemType, PathKey, RemotePath, Revision};
use driftsync_core::ports::{
    ChangePage, IRemoteStore, RemoteChange, RemoteError, RemoteMetadata, WriteMode,
};
use tokio::sync::Notify;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{rebase_path, validate_path};
use crate::filesystem::ContentHasher;

/// Changes returned per page
const PAGE_SIZE: usize = 500;

struct Item {
    meta: RemoteMetadata,
    data: Vec<u8>,
}

struct State {
    items: BTreeMap<PathKey, Item>,
    log: Vec<(u64, RemoteChange)>,
    sequence: u64,
    session: String,
    next_revision: u64,
    failures: VecDeque<RemoteError>,
    /// Uploads to these paths fail until allowed again
    refused_uploads: BTreeMap<PathKey, RemoteError>,
}

impl State {
    fn cursor(&self) -> Result<Cursor> {
        Ok(Cursor::new(format!("{}:{}", self.session, self.sequence))?)
    }

    /// Sequence number encoded in `cursor`, if it belongs to this session
    fn position(&self, cursor: &Cursor) -> Option<u64> {
        let (session, seq) = cursor.as_str().split_once(':')?;
        if session != self.session {
            return None;
        }
        seq.parse().ok()
    }

    fn record(&mut self, change: RemoteChange) {
        self.sequence += 1;
        debug!(seq = self.sequence, path = %change.path(), "Remote change logged");
        self.log.push((self.sequence, change));
    }

    fn revision(&mut self) -> Result<Revision> {
        self.next_revision += 1;
        Ok(Revision::new(format!("{:09x}", self.next_revision))?)
    }

    fn take_failure(&mut self) -> Result<()> {
        match self.failures.pop_front() {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    fn get(&self, path: &RemotePath) -> Option<&Item> {
        self.items.get(&path.key())
    }

    /// Creates missing ancestors of `path` as folders
    fn ensure_parents(&mut self, path: &RemotePath) -> Result<()> {
        for ancestor in path.ancestors() {
            if ancestor.is_root() {
                continue;
            }
            match self.get(&ancestor) {
                Some(item) if item.meta.is_folder() => {}
                Some(_) => return Err(RemoteError::RevisionMismatch(ancestor.to_string()).into()),
                None => {
                    self.insert_folder(ancestor);
                }
            }
        }
        Ok(())
    }

    fn insert_folder(&mut self, path: RemotePath) -> RemoteMetadata {
        let meta = RemoteMetadata::folder(path);
        self.items.insert(
            meta.path.key(),
            Item {
                meta: meta.clone(),
                data: Vec::new(),
            },
        );
        self.record(RemoteChange::Upserted(meta.clone()));
        meta
    }

    fn write(&mut self, path: &RemotePath, data: &[u8], mode: WriteMode) -> Result<RemoteMetadata> {
        validate_path(path)?;
        let existing = self.get(path).map(|item| item.meta.clone());
        let display = match (&existing, &mode) {
            (Some(meta), _) if meta.is_folder() => {
                return Err(RemoteError::RevisionMismatch(path.to_string()).into())
            }
            (Some(_), WriteMode::Add) => {
                return Err(RemoteError::RevisionMismatch(path.to_string()).into())
            }
            (Some(meta), WriteMode::Update(rev)) if &meta.revision != rev => {
                return Err(RemoteError::RevisionMismatch(path.to_string()).into())
            }
            (None, WriteMode::Update(_)) => {
                return Err(RemoteError::RevisionMismatch(path.to_string()).into())
            }
            (Some(meta), _) => meta.path.clone(),
            (None, _) => path.clone(),
        };

        self.ensure_parents(&display)?;
        let meta = RemoteMetadata {
            path: display,
            item_type: ItemType::File,
            revision: self.revision()?,
            content_hash: Some(ContentHasher::hash_bytes(data)),
            size: data.len() as u64,
            modified: Some(Utc::now()),
        };
        self.items.insert(
            meta.path.key(),
            Item {
                meta: meta.clone(),
                data: data.to_vec(),
            },
        );
        self.record(RemoteChange::Upserted(meta.clone()));
        Ok(meta)
    }

    fn make_folder(&mut self, path: &RemotePath) -> Result<RemoteMetadata> {
        validate_path(path)?;
        match self.get(path) {
            Some(item) if item.meta.is_folder() => Ok(item.meta.clone()),
            Some(_) => Err(RemoteError::RevisionMismatch(path.to_string()).into()),
            None => {
                self.ensure_parents(path)?;
                Ok(self.insert_folder(path.clone()))
            }
        }
    }

    fn remove(&mut self, path: &RemotePath) -> Result<()> {
        let display = self
            .get(path)
            .map(|item| item.meta.path.clone())
            .ok_or_else(|| RemoteError::NotFound(path.to_string()))?;
        let key = display.key();
        self.items.retain(|k, _| !k.is_equal_or_descendant_of(&key));
        self.record(RemoteChange::Deleted { path: display });
        Ok(())
    }

    fn rename(&mut self, from: &RemotePath, to: &RemotePath) -> Result<RemoteMetadata> {
        validate_path(to)?;
        let source = self
            .get(from)
            .map(|item| item.meta.path.clone())
            .ok_or_else(|| RemoteError::NotFound(from.to_string()))?;
        let from_key = source.key();
        if to.key() != from_key && self.items.contains_key(&to.key()) {
            return Err(RemoteError::RevisionMismatch(to.to_string()).into());
        }
        if to.key().is_descendant_of(&from_key) {
            return Err(RemoteError::InvalidName(to.to_string()).into());
        }

        let keys: Vec<PathKey> = self
            .items
            .keys()
            .filter(|k| k.is_equal_or_descendant_of(&from_key))
            .cloned()
            .collect();
        let mut moved = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(item) = self.items.remove(&key) {
                moved.push(item);
            }
        }
        self.record(RemoteChange::Deleted { path: source.clone() });

        self.ensure_parents(to)?;
        let mut root_meta = None;
        for mut item in moved {
            item.meta.path = rebase_path(&item.meta.path, &source, to)?;
            if item.meta.path.key() == to.key() {
                root_meta = Some(item.meta.clone());
            }
            self.record(RemoteChange::Upserted(item.meta.clone()));
            self.items.insert(item.meta.path.key(), item);
        }
        root_meta.ok_or_else(|| RemoteError::NotFound(to.to_string()).into())
    }
}

pub struct MemoryRemoteStore {
    state: Mutex<State>,
    changed: Notify,
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                items: BTreeMap::new(),
                log: Vec::new(),
                sequence: 0,
                session: Uuid::new_v4().simple().to_string(),
                next_revision: 0,
                failures: VecDeque::new(),
                refused_uploads: BTreeMap::new(),
            }),
            changed: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs a mutation and wakes long-pollers
    fn mutate<T>(&self, f: impl FnOnce(&mut State) -> Result<T>) -> Result<T> {
        let result = {
            let mut state = self.lock();
            state.take_failure()?;
            f(&mut state)
        };
        self.changed.notify_waiters();
        result
    }

    // ========================================================================
    // Helpers acting as another client
    // ========================================================================

    /// Writes a file unconditionally
    pub fn put_file(&self, path: &str, data: &[u8]) -> Result<RemoteMetadata> {
        let path = RemotePath::new(path.to_string())?;
        let result = self.lock().write(&path, data, WriteMode::Overwrite);
        self.changed.notify_waiters();
        result
    }

    pub fn put_folder(&self, path: &str) -> Result<RemoteMetadata> {
        let path = RemotePath::new(path.to_string())?;
        let result = self.lock().make_folder(&path);
        self.changed.notify_waiters();
        result
    }

    pub fn remove(&self, path: &str) -> Result<()> {
        let path = RemotePath::new(path.to_string())?;
        let result = self.lock().remove(&path);
        self.changed.notify_waiters();
        result
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<RemoteMetadata> {
        let from = RemotePath::new(from.to_string())?;
        let to = RemotePath::new(to.to_string())?;
        let result = self.lock().rename(&from, &to);
        self.changed.notify_waiters();
        result
    }

    pub fn file_content(&self, path: &str) -> Option<Vec<u8>> {
        let path = RemotePath::new(path.to_string()).ok()?;
        self.lock()
            .get(&path)
            .filter(|item| !item.meta.is_folder())
            .map(|item| item.data.clone())
    }

    /// Every item's display path, in key order
    pub fn paths(&self) -> Vec<String> {
        self.lock()
            .items
            .values()
            .map(|item| item.meta.path.to_string())
            .collect()
    }

    /// Number of mutations ever applied
    pub fn change_count(&self) -> u64 {
        self.lock().sequence
    }

    /// The next store call fails with `err`
    pub fn fail_next(&self, err: RemoteError) {
        self.lock().failures.push_back(err);
    }

    /// Every upload to `path` fails with `err` until [`Self::allow_uploads`]
    pub fn refuse_uploads(&self, path: &str, err: RemoteError) -> Result<()> {
        let key = RemotePath::new(path.to_string())?.key();
        self.lock().refused_uploads.insert(key, err);
        Ok(())
    }

    pub fn allow_uploads(&self, path: &str) -> Result<()> {
        let key = RemotePath::new(path.to_string())?.key();
        self.lock().refused_uploads.remove(&key);
        Ok(())
    }

    /// Starts a new session; older cursors get `CursorReset`
    pub fn invalidate_cursors(&self) {
        self.lock().session = Uuid::new_v4().simple().to_string();
        self.changed.notify_waiters();
    }
}

#[async_trait::async_trait]
impl IRemoteStore for MemoryRemoteStore {
    async fn list_folder(&self, path: &RemotePath, recursive: bool) -> Result<Vec<RemoteMetadata>> {
        let mut state = self.lock();
        state.take_failure()?;
        let key = path.key();
        if !path.is_root() && !state.get(path).is_some_and(|item| item.meta.is_folder()) {
            return Err(RemoteError::NotFound(path.to_string()).into());
        }
        Ok(state
            .items
            .iter()
            .filter(|(k, item)| {
                if recursive {
                    k.is_descendant_of(&key)
                } else {
                    item.meta.path.parent().is_some_and(|p| p.key() == key)
                }
            })
            .map(|(_, item)| item.meta.clone())
            .collect())
    }

    async fn get_metadata(&self, path: &RemotePath) -> Result<Option<RemoteMetadata>> {
        let mut state = self.lock();
        state.take_failure()?;
        Ok(state.get(path).map(|item| item.meta.clone()))
    }

    async fn latest_cursor(&self) -> Result<Cursor> {
        let mut state = self.lock();
        state.take_failure()?;
        state.cursor()
    }

    async fn list_changes(&self, cursor: &Cursor) -> Result<ChangePage> {
        let mut state = self.lock();
        state.take_failure()?;
        let since = state.position(cursor).ok_or(RemoteError::CursorReset)?;

        let pending: Vec<&(u64, RemoteChange)> =
            state.log.iter().filter(|(seq, _)| *seq > since).collect();
        let has_more = pending.len() > PAGE_SIZE;
        let page: Vec<&(u64, RemoteChange)> = pending.into_iter().take(PAGE_SIZE).collect();
        let last = page.last().map_or(since, |(seq, _)| *seq);

        Ok(ChangePage {
            changes: page.into_iter().map(|(_, change)| change.clone()).collect(),
            cursor: Cursor::new(format!("{}:{last}", state.session))?,
            has_more,
        })
    }

    #[instrument(skip(self), fields(cursor = %cursor))]
    async fn longpoll(&self, cursor: &Cursor, timeout: Duration) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.lock();
                match state.position(cursor) {
                    Some(since) if state.sequence <= since => {}
                    _ => return Ok(true),
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(false);
            }
        }
    }

    async fn download(&self, path: &RemotePath) -> Result<(RemoteMetadata, Vec<u8>)> {
        let mut state = self.lock();
        state.take_failure()?;
        match state.get(path) {
            Some(item) if !item.meta.is_folder() => Ok((item.meta.clone(), item.data.clone())),
            _ => Err(RemoteError::NotFound(path.to_string()).into()),
        }
    }

    async fn upload(
        &self,
        path: &RemotePath,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<RemoteMetadata> {
        self.mutate(|state| {
            if let Some(err) = state.refused_uploads.get(&path.key()) {
                return Err(err.clone().into());
            }
            state.write(path, data, mode)
        })
    }

    async fn create_folder(&self, path: &RemotePath) -> Result<RemoteMetadata> {
        self.mutate(|state| state.make_folder(path))
    }

    async fn delete(&self, path: &RemotePath) -> Result<()> {
        self.mutate(|state| state.remove(path))
    }

    async fn move_item(&self, from: &RemotePath, to: &RemotePath) -> Result<RemoteMetadata> {
        self.mutate(|state| state.rename(from, to))
    }
}
