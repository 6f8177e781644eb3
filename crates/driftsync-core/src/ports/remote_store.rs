//! Remote store port (driven/secondary port)
//!
//! This module defines the interface for the remote, versioned object store
//! that the engine keeps in step with the local tree.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` like every other port. Adapters wrap failures the
//!   engine must classify in [`RemoteError`] so callers can `downcast_ref` it.
//! - `RemoteMetadata` and `RemoteChange` are port-level DTOs; the reconciler
//!   maps them onto index entries.
//! - Every write returns the new metadata so the caller can record the
//!   revision without a second round-trip.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{ContentHash, Cursor, ItemType, RemotePath, Revision};

// ============================================================================
// RemoteError
// ============================================================================

/// Typed failures raised by remote store adapters
///
/// Carried inside `anyhow::Error`; use [`RemoteError::classify`] to recover
/// the variant from an error returned through the port.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// The item does not exist (anymore)
    #[error("Remote item not found: {0}")]
    NotFound(String),

    /// The change cursor is no longer valid; a full listing is required
    #[error("Remote cursor was reset")]
    CursorReset,

    /// Network timeout, server error or a momentary lock on the remote side
    #[error("Transient remote failure: {0}")]
    Transient(String),

    /// The service asked the client to slow down
    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// A conditional write lost against a concurrent change
    #[error("Revision mismatch at {0}")]
    RevisionMismatch(String),

    /// The remote refuses this name
    #[error("Invalid remote name: {0}")]
    InvalidName(String),
}

impl RemoteError {
    /// Finds a `RemoteError` anywhere in an error chain
    pub fn classify(err: &anyhow::Error) -> Option<&RemoteError> {
        err.chain().find_map(|cause| cause.downcast_ref::<RemoteError>())
    }

    /// Returns true for failures worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::Transient(_) | RemoteError::RateLimited { .. }
        )
    }
}

// ============================================================================
// DTOs
// ============================================================================

/// Metadata of one remote item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMetadata {
    /// Path in remote display casing
    pub path: RemotePath,
    pub item_type: ItemType,
    /// `Revision::folder()` for folders
    pub revision: Revision,
    /// `None` for folders
    pub content_hash: Option<ContentHash>,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

impl RemoteMetadata {
    /// Metadata for a folder
    pub fn folder(path: RemotePath) -> Self {
        Self {
            path,
            item_type: ItemType::Folder,
            revision: Revision::folder(),
            content_hash: None,
            size: 0,
            modified: None,
        }
    }

    pub fn is_folder(&self) -> bool {
        self.item_type.is_folder()
    }
}

/// One entry of a remote change page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemoteChange {
    /// Item created or modified; carries its current metadata
    Upserted(RemoteMetadata),
    /// Item (and for folders, its subtree) deleted
    Deleted { path: RemotePath },
}

impl RemoteChange {
    pub fn path(&self) -> &RemotePath {
        match self {
            RemoteChange::Upserted(meta) => &meta.path,
            RemoteChange::Deleted { path } => path,
        }
    }
}

/// A page of changes since a cursor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangePage {
    pub changes: Vec<RemoteChange>,
    /// Cursor to resume from after this page
    pub cursor: Cursor,
    /// More changes are immediately available
    pub has_more: bool,
}

/// Conditional semantics for uploads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteMode {
    /// Create a new file; fails with `RevisionMismatch` if one exists
    Add,
    /// Replace the file only if it is still at this revision
    Update(Revision),
    /// Replace unconditionally
    Overwrite,
}

// ============================================================================
// IRemoteStore trait
// ============================================================================

/// Port trait for the remote store
///
/// ## Implementation Notes
///
/// - Path comparisons are case-insensitive; returned paths carry the
///   remote's display casing.
/// - `delete` on a folder removes its subtree.
/// - `longpoll` must return within `timeout`.
#[async_trait::async_trait]
pub trait IRemoteStore: Send + Sync {
    /// Lists a folder's children (or whole subtree when `recursive`)
    async fn list_folder(
        &self,
        path: &RemotePath,
        recursive: bool,
    ) -> anyhow::Result<Vec<RemoteMetadata>>;

    /// Metadata for one path, `None` if absent
    async fn get_metadata(&self, path: &RemotePath) -> anyhow::Result<Option<RemoteMetadata>>;

    /// Cursor positioned at the current end of the change stream
    async fn latest_cursor(&self) -> anyhow::Result<Cursor>;

    /// Changes since `cursor`
    ///
    /// Fails with `RemoteError::CursorReset` when the cursor is stale.
    async fn list_changes(&self, cursor: &Cursor) -> anyhow::Result<ChangePage>;

    /// Waits until changes are available past `cursor` or `timeout` elapses
    async fn longpoll(&self, cursor: &Cursor, timeout: Duration) -> anyhow::Result<bool>;

    /// Downloads a file's content together with the metadata it belongs to
    async fn download(&self, path: &RemotePath) -> anyhow::Result<(RemoteMetadata, Vec<u8>)>;

    /// Uploads a file, creating missing parent folders
    async fn upload(
        &self,
        path: &RemotePath,
        data: &[u8],
        mode: WriteMode,
    ) -> anyhow::Result<RemoteMetadata>;

    /// Creates a folder (and missing parents); existing folders are returned as-is
    async fn create_folder(&self, path: &RemotePath) -> anyhow::Result<RemoteMetadata>;

    /// Deletes a file or folder subtree
    async fn delete(&self, path: &RemotePath) -> anyhow::Result<()>;

    /// Moves or renames an item, including casing-only renames
    async fn move_item(&self, from: &RemotePath, to: &RemotePath)
        -> anyhow::Result<RemoteMetadata>;
}
