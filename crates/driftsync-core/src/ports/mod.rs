//! Port definitions (hexagonal architecture interfaces)
//!
//! This module defines the port traits that form the boundaries of the
//! hexagonal architecture. Ports are interfaces that the domain core
//! depends on, but whose implementations live in adapter crates.
//!
//! ## Ports Overview
//!
//! - [`IRemoteStore`] - Remote versioned object store
//! - [`IIndexStore`], [`ISettingsStore`], [`IHistoryStore`] - Persistent engine state
//! - [`ILocalFileSystem`] - Local replica operations
//! - [`ISyncControl`] - Command/query surface exposed to the CLI over IPC

pub mod local_filesystem;
pub mod remote_store;
pub mod state_repository;
pub mod sync_control;

pub use local_filesystem::{FileSystemState, ILocalFileSystem, LocalItem};
pub use remote_store::{
    ChangePage, IRemoteStore, RemoteChange, RemoteError, RemoteMetadata, WriteMode,
};
pub use state_repository::{IHistoryStore, IIndexStore, ISettingsStore};
pub use sync_control::{ISyncControl, StatusChange, SyncControlError};
