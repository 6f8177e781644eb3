//! Domain entities and business logic
//!
//! This module contains the core domain types for DriftSync:
//! - Newtypes for validated paths, revisions, hashes and cursors
//! - Index entries describing the last synchronized state of a path
//! - Sync events emitted by the local watcher and the remote poller
//! - The selective sync exclusion set
//! - Daemon status, error records and history entries

pub mod errors;
pub mod event;
pub mod exclusion;
pub mod history;
pub mod index_entry;
pub mod newtypes;
pub mod status;

// Re-export commonly used types
pub use errors::DomainError;
pub use event::{Change, EventSource, SyncEvent};
pub use exclusion::{ExclusionSet, ExclusionStatus};
pub use history::{HistoryAction, HistoryEntry};
pub use index_entry::{IndexEntry, ItemType};
pub use newtypes::*;
pub use status::{
    DaemonStatus, FatalError, FatalErrorKind, FileStatus, StatusSnapshot, SyncErrorInfo,
};
