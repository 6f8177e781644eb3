//! Local filesystem port (driven/secondary port)
//!
//! This module defines the interface for interacting with the local replica:
//! reading and writing files, computing content hashes, walking the tree and
//! resolving on-disk casing.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because filesystem errors are adapter-specific;
//!   callers inspect `std::io::Error` through `downcast_ref` when they need
//!   to classify a failure.
//! - Change watching is not part of this port. The watcher talks to the OS
//!   directly and feeds events to the engine.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::domain::{ContentHash, ItemType};

// ============================================================================
// FileSystemState struct
// ============================================================================

/// Snapshot of a path's state on the local filesystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSystemState {
    /// Whether the file/directory exists on disk
    pub exists: bool,
    /// Whether this is a regular file (false for directories and other types)
    pub is_file: bool,
    /// Size in bytes (0 for directories or non-existent files)
    pub size: u64,
    /// Last modification time (None if not available or file doesn't exist)
    pub modified: Option<DateTime<Utc>>,
}

impl FileSystemState {
    /// Returns a state representing a non-existent path
    pub fn not_found() -> Self {
        Self {
            exists: false,
            is_file: false,
            size: 0,
            modified: None,
        }
    }

    /// Returns true if the file exists and is a regular file
    pub fn is_regular_file(&self) -> bool {
        self.exists && self.is_file
    }

    /// Returns true if the file exists and is a directory
    pub fn is_directory(&self) -> bool {
        self.exists && !self.is_file
    }

    /// File or folder, `None` when absent
    pub fn item_type(&self) -> Option<ItemType> {
        match (self.exists, self.is_file) {
            (false, _) => None,
            (true, true) => Some(ItemType::File),
            (true, false) => Some(ItemType::Folder),
        }
    }
}

/// One entry produced by a recursive tree walk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalItem {
    pub path: PathBuf,
    pub item_type: ItemType,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

// ============================================================================
// ILocalFileSystem trait
// ============================================================================

/// Port trait for local filesystem operations
///
/// ## Implementation Notes
///
/// - All paths are absolute.
/// - `write_file` must be atomic with respect to readers: a crash leaves
///   either the old or the new content, never a mix.
/// - `remove` on a missing path succeeds.
#[async_trait::async_trait]
pub trait ILocalFileSystem: Send + Sync {
    /// Reads the entire contents of a file
    async fn read_file(&self, path: &Path) -> anyhow::Result<Vec<u8>>;

    /// Atomically replaces a file's content, creating parent directories
    ///
    /// Returns the state of the written file so callers can record its mtime.
    async fn write_file(&self, path: &Path, data: &[u8]) -> anyhow::Result<FileSystemState>;

    /// Creates a directory and any missing parents
    async fn create_directory(&self, path: &Path) -> anyhow::Result<()>;

    /// Removes a file or a whole directory tree
    async fn remove(&self, path: &Path) -> anyhow::Result<()>;

    /// Renames `from` to `to`, creating the parent of `to` if needed
    async fn rename(&self, from: &Path, to: &Path) -> anyhow::Result<()>;

    /// Gets the current state of a path
    async fn get_state(&self, path: &Path) -> anyhow::Result<FileSystemState>;

    /// Computes the content hash of a file
    async fn compute_hash(&self, path: &Path) -> anyhow::Result<ContentHash>;

    /// Recursively lists everything below `root` (excluding `root` itself)
    async fn list_tree(&self, root: &Path) -> anyhow::Result<Vec<LocalItem>>;

    /// Resolves the on-disk casing of `path` by case-insensitive lookup of
    /// each component, `None` when nothing matches
    async fn find_cased(&self, path: &Path) -> anyhow::Result<Option<PathBuf>>;
}
