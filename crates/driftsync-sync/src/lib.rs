//! DriftSync Sync - Bidirectional synchronization engine
//!
//! Provides:
//! - Local filesystem adapter with atomic writes and block-wise content hashing
//! - Local watcher (notify) with debouncing and move correlation
//! - Remote poller with resumable cursors and full-listing recovery
//! - Reconciler executing the three-way action table
//! - Worker dispatcher with at-most-one-in-flight reconciliation per path
//! - Selective sync, daemon status machine and history log
//!
//! ## Modules
//!
//! - [`engine`] - `SyncEngine`, the orchestrator implementing `ISyncControl`
//! - [`filesystem`] - Local filesystem adapter (atomic writes, content hashing)
//! - [`watcher`] - notify wrapper, debounce queue, engine-write suppression
//! - [`scheduler`] - Turns settled watcher events into queued sync events
//! - [`poller`] - Remote change stream consumer
//! - [`reconciler`] - Per-path observe / plan / execute
//! - [`dispatcher`] - Worker pool draining the event queues
//! - [`remote`] - In-memory and directory-backed remote stores

pub mod dispatcher;
pub mod engine;
pub mod filesystem;
pub mod history;
pub mod index;
pub mod moves;
pub mod poller;
pub mod queue;
pub mod reconciler;
pub mod remote;
pub mod retry;
pub mod scan;
pub mod scheduler;
pub mod selective;
pub mod status;
pub mod watcher;

use std::path::{Path, PathBuf};

use driftsync_core::domain::DomainError;
use driftsync_core::ports::RemoteError;
use thiserror::Error;

pub use engine::SyncEngine;
pub use filesystem::{ContentHasher, LocalFileSystemAdapter};
pub use remote::{DirectoryRemoteStore, MemoryRemoteStore};

/// Errors that can occur during synchronization operations
#[derive(Debug, Error)]
pub enum SyncError {
    /// An I/O error occurred during file operations
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Insufficient filesystem permissions
    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),

    /// No available disk space to complete the operation
    #[error("Disk full while writing {0}")]
    DiskFull(PathBuf),

    /// The specified path does not exist
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    /// The OS refused to add more watches
    #[error("Watch limit exceeded: {0}")]
    WatchLimitExceeded(String),

    /// A remote failure surfaced through the engine
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// A domain-level error propagated from driftsync-core
    #[error("Domain error: {0}")]
    DomainError(#[from] DomainError),
}

impl SyncError {
    /// Maps an I/O error on `path` to the matching variant
    pub fn from_io(err: std::io::Error, path: &Path) -> Self {
        if err.raw_os_error() == Some(libc::ENOSPC) {
            return SyncError::DiskFull(path.to_path_buf());
        }
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => SyncError::PermissionDenied(path.to_path_buf()),
            std::io::ErrorKind::NotFound => SyncError::PathNotFound(path.to_path_buf()),
            _ => SyncError::IoError(err),
        }
    }

    /// Short machine-friendly label recorded in `sync_errors`
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::IoError(_) => "io_error",
            SyncError::PermissionDenied(_) => "permission_denied",
            SyncError::DiskFull(_) => "disk_full",
            SyncError::PathNotFound(_) => "not_found",
            SyncError::WatchLimitExceeded(_) => "watch_limit",
            SyncError::Remote(remote) => remote_kind(remote),
            SyncError::DomainError(_) => "invalid_path",
        }
    }
}

fn remote_kind(err: &RemoteError) -> &'static str {
    match err {
        RemoteError::NotFound(_) => "remote_not_found",
        RemoteError::CursorReset => "cursor_reset",
        RemoteError::Transient(_) => "transient",
        RemoteError::RateLimited { .. } => "rate_limited",
        RemoteError::RevisionMismatch(_) => "revision_mismatch",
        RemoteError::InvalidName(_) => "invalid_name",
    }
}

/// Classifies an error returned through a port
///
/// Looks for a [`SyncError`], a [`RemoteError`] or a raw `std::io::Error`
/// anywhere in the chain.
pub fn error_kind(err: &anyhow::Error) -> &'static str {
    for cause in err.chain() {
        if let Some(sync) = cause.downcast_ref::<SyncError>() {
            return sync.kind();
        }
        if let Some(remote) = cause.downcast_ref::<RemoteError>() {
            return remote_kind(remote);
        }
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if io.raw_os_error() == Some(libc::ENOSPC) {
                return "disk_full";
            }
            return match io.kind() {
                std::io::ErrorKind::PermissionDenied => "permission_denied",
                std::io::ErrorKind::NotFound => "not_found",
                _ => "io_error",
            };
        }
    }
    "internal"
}
