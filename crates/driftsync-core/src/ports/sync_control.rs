//! Sync control port (driving/primary port)
//!
//! The command and query surface the engine exposes to out-of-process
//! callers. The IPC crate adapts it to D-Bus; tests drive it directly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::domain::{
    DomainError, ExclusionStatus, FileStatus, HistoryEntry, IndexEntry, RemotePath, StatusSnapshot,
};

/// Typed failures returned synchronously to callers
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncControlError {
    /// The path does not exist in the remote namespace
    #[error("Not found: {0}")]
    NotFound(String),

    /// The path is malformed or outside the sync root
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// The operation is not allowed in the current daemon state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The target of a move already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Anything else (storage, I/O)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<DomainError> for SyncControlError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::InvalidPath(_)
            | DomainError::InvalidRemotePath(_)
            | DomainError::PathNotInSyncRoot(_) => SyncControlError::InvalidPath(err.to_string()),
            DomainError::InvalidState { .. } => SyncControlError::InvalidState(err.to_string()),
            other => SyncControlError::Internal(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for SyncControlError {
    fn from(err: anyhow::Error) -> Self {
        SyncControlError::Internal(format!("{err:#}"))
    }
}

/// Outcome of a status long-poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    /// False when the timeout elapsed without a change
    pub changed: bool,
    pub snapshot: StatusSnapshot,
}

/// Port trait for controlling and inspecting a running engine
#[async_trait::async_trait]
pub trait ISyncControl: Send + Sync {
    // --- status ---

    async fn status(&self) -> StatusSnapshot;

    /// Waits until the status generation moves past `baseline` or `timeout`
    /// elapses; returns immediately if it already has
    async fn status_change_longpoll(&self, baseline: u64, timeout: Duration) -> StatusChange;

    // --- lifecycle ---

    async fn start_sync(&self) -> Result<(), SyncControlError>;

    async fn stop_sync(&self) -> Result<(), SyncControlError>;

    async fn pause_sync(&self) -> Result<(), SyncControlError>;

    async fn resume_sync(&self) -> Result<(), SyncControlError>;

    // --- per-file ---

    async fn get_file_status(&self, local_path: &Path) -> FileStatus;

    // --- selective sync ---

    async fn exclude_item(&self, path: &RemotePath) -> Result<(), SyncControlError>;

    async fn include_item(&self, path: &RemotePath) -> Result<(), SyncControlError>;

    async fn excluded_items(&self) -> Vec<RemotePath>;

    async fn set_excluded_items(&self, paths: Vec<RemotePath>) -> Result<(), SyncControlError>;

    async fn excluded_status(&self, path: &RemotePath)
        -> Result<ExclusionStatus, SyncControlError>;

    // --- inspection ---

    async fn history(&self) -> Vec<HistoryEntry>;

    async fn get_index(&self) -> Vec<IndexEntry>;

    /// Paths queued or being reconciled
    async fn activity(&self) -> Vec<RemotePath>;

    /// Time since the last completed change (or since startup)
    async fn idle_time(&self) -> Duration;

    // --- maintenance ---

    async fn clear_sync_errors(&self);

    async fn reset_sync_state(&self) -> Result<(), SyncControlError>;

    async fn rebuild_index(&self) -> Result<(), SyncControlError>;

    async fn move_local_root(&self, new_root: PathBuf) -> Result<(), SyncControlError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_error_mapping() {
        let err: SyncControlError = DomainError::PathNotInSyncRoot("/tmp/x".into()).into();
        assert!(matches!(err, SyncControlError::InvalidPath(_)));

        let err: SyncControlError = DomainError::InvalidState {
            from: "stopped".into(),
            to: "paused".into(),
        }
        .into();
        assert!(matches!(err, SyncControlError::InvalidState(_)));
    }

    #[test]
    fn test_anyhow_mapping_keeps_context() {
        let err: SyncControlError = anyhow::anyhow!("disk full").context("writing index").into();
        assert_eq!(
            err,
            SyncControlError::Internal("writing index: disk full".into())
        );
    }
}
