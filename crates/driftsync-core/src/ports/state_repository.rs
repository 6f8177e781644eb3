//! State repository ports (driven/secondary ports)
//!
//! This module defines the interfaces for persisting engine state: the path
//! index, the durable settings the engine reads and writes back, and the
//! history log.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because storage errors are adapter-specific
//!   (SQLite, filesystem, etc.) and don't need domain-level classification.
//! - The index is read fully into memory at startup, so the index port only
//!   offers a bulk load plus incremental writes.
//! - The three traits are separate so tests can swap any of them, but a
//!   single adapter normally implements all three.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::domain::{Cursor, ExclusionSet, HistoryEntry, IndexEntry, PathKey};

// ============================================================================
// IIndexStore trait
// ============================================================================

/// Port trait for the durable path index
#[async_trait::async_trait]
pub trait IIndexStore: Send + Sync {
    /// Reads every entry
    ///
    /// An error means the persisted index is unreadable; the engine treats
    /// that as an empty index and reindexes.
    async fn load_all(&self) -> anyhow::Result<Vec<IndexEntry>>;

    /// Inserts or replaces the entry keyed by its `path_lower`
    async fn put(&self, entry: &IndexEntry) -> anyhow::Result<()>;

    /// Writes several entries in one transaction
    async fn put_batch(&self, entries: &[IndexEntry]) -> anyhow::Result<()>;

    /// Deletes one entry; missing keys are ignored
    async fn delete(&self, key: &PathKey) -> anyhow::Result<()>;

    /// Deletes an entry and everything below it, returning the count
    async fn delete_subtree(&self, key: &PathKey) -> anyhow::Result<u64>;

    /// Deletes the subtree at `key` and writes `entries`, all or nothing
    async fn replace_subtree(&self, key: &PathKey, entries: &[IndexEntry]) -> anyhow::Result<()>;

    /// Removes every entry
    async fn clear(&self) -> anyhow::Result<()>;
}

// ============================================================================
// ISettingsStore trait
// ============================================================================

/// Port trait for durable engine settings
#[async_trait::async_trait]
pub trait ISettingsStore: Send + Sync {
    async fn get_excluded_items(&self) -> anyhow::Result<ExclusionSet>;

    async fn set_excluded_items(&self, items: &ExclusionSet) -> anyhow::Result<()>;

    /// Saved remote cursor, `None` before the first sync or after a reset
    async fn get_cursor(&self) -> anyhow::Result<Option<Cursor>>;

    async fn set_cursor(&self, cursor: Option<&Cursor>) -> anyhow::Result<()>;

    async fn get_local_root(&self) -> anyhow::Result<Option<PathBuf>>;

    async fn set_local_root(&self, path: &Path) -> anyhow::Result<()>;

    /// When the last full reindex completed
    async fn get_last_reindex(&self) -> anyhow::Result<Option<DateTime<Utc>>>;

    async fn set_last_reindex(&self, at: DateTime<Utc>) -> anyhow::Result<()>;
}

// ============================================================================
// IHistoryStore trait
// ============================================================================

/// Port trait for the persisted history log
#[async_trait::async_trait]
pub trait IHistoryStore: Send + Sync {
    async fn append(&self, entry: &HistoryEntry) -> anyhow::Result<()>;

    /// Newest entries first, at most `limit`
    async fn load_recent(&self, limit: usize) -> anyhow::Result<Vec<HistoryEntry>>;

    /// Keeps the newest `max_entries` and drops anything older than `before`
    ///
    /// Returns the number of deleted entries.
    async fn prune(&self, max_entries: usize, before: DateTime<Utc>) -> anyhow::Result<u64>;

    async fn clear(&self) -> anyhow::Result<()>;
}
