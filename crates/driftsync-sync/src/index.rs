//! In-memory index backed by a persistent store
//!
//! The whole index is read into memory at startup and every mutation is
//! written through to the [`IIndexStore`] before the in-memory map changes.
//! All mutations run under a single write lock, so no reconciliation ever
//! observes a half-applied update.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use driftsync_core::domain::{IndexEntry, PathKey, RemotePath};
use driftsync_core::ports::IIndexStore;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::remote::rebase_path;

/// Outcome of [`SyncIndex::load`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexLoad {
    /// Entries were read
    Loaded(usize),
    /// The persisted index was unreadable and has been discarded
    Discarded,
}

pub struct SyncIndex {
    store: Arc<dyn IIndexStore>,
    entries: RwLock<BTreeMap<PathKey, IndexEntry>>,
}

impl SyncIndex {
    pub fn new(store: Arc<dyn IIndexStore>) -> Self {
        Self {
            store,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Reads the persisted index, falling back to an empty one
    ///
    /// An unreadable index is cleared so the caller can run a full reindex.
    ///
    /// # Errors
    /// Fails only when the unreadable index cannot be cleared either.
    pub async fn load(&self) -> anyhow::Result<IndexLoad> {
        let mut entries = self.entries.write().await;
        match self.store.load_all().await {
            Ok(loaded) => {
                let count = loaded.len();
                *entries = loaded
                    .into_iter()
                    .map(|e| (e.path_lower().clone(), e))
                    .collect();
                info!(entries = count, "Index loaded");
                Ok(IndexLoad::Loaded(count))
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "Index unreadable, starting empty");
                entries.clear();
                self.store
                    .clear()
                    .await
                    .context("Failed to discard unreadable index")?;
                Ok(IndexLoad::Discarded)
            }
        }
    }

    pub async fn get(&self, key: &PathKey) -> Option<IndexEntry> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn contains(&self, key: &PathKey) -> bool {
        self.entries.read().await.contains_key(key)
    }

    /// Inserts or replaces the entry stored under the entry's key
    pub async fn put(&self, entry: IndexEntry) -> anyhow::Result<()> {
        let mut entries = self.entries.write().await;
        self.store
            .put(&entry)
            .await
            .with_context(|| format!("Failed to persist index entry {}", entry.path_cased()))?;
        debug!(path = %entry.path_cased(), rev = %entry.revision(), "Index entry stored");
        entries.insert(entry.path_lower().clone(), entry);
        Ok(())
    }

    pub async fn delete(&self, key: &PathKey) -> anyhow::Result<()> {
        let mut entries = self.entries.write().await;
        self.store
            .delete(key)
            .await
            .with_context(|| format!("Failed to delete index entry {key}"))?;
        entries.remove(key);
        Ok(())
    }

    /// Removes `key` and everything below it, returning the count
    pub async fn delete_subtree(&self, key: &PathKey) -> anyhow::Result<usize> {
        let mut entries = self.entries.write().await;
        self.store
            .delete_subtree(key)
            .await
            .with_context(|| format!("Failed to delete index subtree {key}"))?;
        let before = entries.len();
        entries.retain(|k, _| !k.is_equal_or_descendant_of(key));
        Ok(before - entries.len())
    }

    /// Re-keys a subtree after a move: entries under `from` land under `to`
    ///
    /// `to` carries the display casing that becomes canonical.
    pub async fn move_subtree(&self, from: &RemotePath, to: &RemotePath) -> anyhow::Result<()> {
        let mut entries = self.entries.write().await;
        let from_key = from.key();
        let moved: Vec<IndexEntry> = entries
            .iter()
            .filter(|(k, _)| k.is_equal_or_descendant_of(&from_key))
            .map(|(_, e)| e.clone())
            .collect();

        let mut rebased = Vec::with_capacity(moved.len());
        for entry in &moved {
            rebased.push(IndexEntry::restore(
                rebase_path(entry.path_cased(), from, to)?,
                entry.item_type(),
                entry.revision().clone(),
                entry.content_hash().cloned(),
                entry.local_mtime(),
            )?);
        }

        self.store
            .replace_subtree(&from_key, &rebased)
            .await
            .with_context(|| format!("Failed to move index subtree {from}"))?;

        entries.retain(|k, _| !k.is_equal_or_descendant_of(&from_key));
        for entry in rebased {
            entries.insert(entry.path_lower().clone(), entry);
        }
        debug!(from = %from, to = %to, count = moved.len(), "Index subtree moved");
        Ok(())
    }

    /// Entry at `key` plus all descendants, parents before children
    pub async fn subtree(&self, key: &PathKey) -> Vec<IndexEntry> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|(k, _)| k.is_equal_or_descendant_of(key))
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Snapshot of every entry in key order
    pub async fn all(&self) -> Vec<IndexEntry> {
        self.entries.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn clear(&self) -> anyhow::Result<()> {
        let mut entries = self.entries.write().await;
        self.store.clear().await.context("Failed to clear index")?;
        entries.clear();
        Ok(())
    }
}
