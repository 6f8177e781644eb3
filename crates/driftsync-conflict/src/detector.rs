//! Change classification and action planning
//!
//! For one path the reconciler observes three states: what is on disk, what
//! the remote holds and what the index remembers from the last sync. This
//! module turns those into a single [`SyncAction`] without touching I/O.
//!
//! | local vs index | remote vs index | action                         |
//! |----------------|-----------------|--------------------------------|
//! | unchanged      | unchanged       | `NoOp`                         |
//! | changed        | unchanged       | `Upload`                       |
//! | unchanged      | changed         | `Download`                     |
//! | changed        | changed (same)  | `Adopt`                        |
//! | changed        | changed (diff)  | `Conflict`                     |
//! | deleted        | unchanged       | `DeleteRemote`                 |
//! | unchanged      | deleted         | `DeleteLocal`                  |
//! | deleted        | changed         | `Download`                     |
//! | changed        | deleted         | `Upload`                       |
//! | deleted        | deleted         | `Forget`                       |

use driftsync_core::domain::{ContentHash, IndexEntry, ItemType, Revision};
use tracing::debug;

/// What one replica currently holds at a path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observed {
    Absent,
    Folder,
    File {
        hash: ContentHash,
        /// Remote revision; always `None` for the local side
        revision: Option<Revision>,
    },
}

impl Observed {
    /// Local file observation
    pub fn local_file(hash: ContentHash) -> Self {
        Observed::File {
            hash,
            revision: None,
        }
    }

    /// Remote file observation
    pub fn remote_file(hash: ContentHash, revision: Revision) -> Self {
        Observed::File {
            hash,
            revision: Some(revision),
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Observed::Absent)
    }

    pub fn item_type(&self) -> Option<ItemType> {
        match self {
            Observed::Absent => None,
            Observed::Folder => Some(ItemType::Folder),
            Observed::File { .. } => Some(ItemType::File),
        }
    }

    /// Same kind and, for files, same content
    pub fn same_content(&self, other: &Observed) -> bool {
        match (self, other) {
            (Observed::Absent, Observed::Absent) => true,
            (Observed::Folder, Observed::Folder) => true,
            (Observed::File { hash: a, .. }, Observed::File { hash: b, .. }) => a == b,
            _ => false,
        }
    }
}

/// How one replica moved away from the indexed state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideChange {
    Unchanged,
    Changed,
    Deleted,
}

/// Corrective action for a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    /// Nothing to do
    NoOp,
    /// Push the local item to the remote
    Upload,
    /// Pull the remote item to the local tree
    Download,
    /// Both sides already agree; record the remote state in the index
    Adopt,
    /// Divergent edits: keep the local version under a conflict name and
    /// take the remote version under the original name
    Conflict,
    /// Remove the remote item
    DeleteRemote,
    /// Remove the local item
    DeleteLocal,
    /// Gone on both sides; drop the index entry
    Forget,
}

/// Classification plus the chosen action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub local: SideChange,
    pub remote: SideChange,
    pub action: SyncAction,
}

/// Stateless planner implementing the action table
pub struct ChangeDetector;

impl ChangeDetector {
    /// Local side compared to the index; content decides, mtime never does
    pub fn classify_local(index: &IndexEntry, local: &Observed) -> SideChange {
        match local {
            Observed::Absent => SideChange::Deleted,
            Observed::Folder => {
                if index.is_folder() {
                    SideChange::Unchanged
                } else {
                    SideChange::Changed
                }
            }
            Observed::File { hash, .. } => {
                if !index.is_folder() && index.content_hash() == Some(hash) {
                    SideChange::Unchanged
                } else {
                    SideChange::Changed
                }
            }
        }
    }

    /// Remote side compared to the index; the revision decides
    pub fn classify_remote(index: &IndexEntry, remote: &Observed) -> SideChange {
        match remote {
            Observed::Absent => SideChange::Deleted,
            Observed::Folder => {
                if index.is_folder() {
                    SideChange::Unchanged
                } else {
                    SideChange::Changed
                }
            }
            Observed::File { revision, .. } => {
                if !index.is_folder() && revision.as_ref() == Some(index.revision()) {
                    SideChange::Unchanged
                } else {
                    SideChange::Changed
                }
            }
        }
    }

    /// Picks the action for one path
    pub fn plan(index: Option<&IndexEntry>, local: &Observed, remote: &Observed) -> Decision {
        let decision = match index {
            Some(entry) => {
                let l = Self::classify_local(entry, local);
                let r = Self::classify_remote(entry, remote);
                Decision {
                    local: l,
                    remote: r,
                    action: Self::action_for(l, r, local, remote),
                }
            }
            None => Self::plan_unindexed(local, remote),
        };

        debug!(
            local = ?decision.local,
            remote = ?decision.remote,
            action = ?decision.action,
            "Planned reconciliation"
        );
        decision
    }

    fn action_for(
        local: SideChange,
        remote: SideChange,
        local_state: &Observed,
        remote_state: &Observed,
    ) -> SyncAction {
        use SideChange::*;

        match (local, remote) {
            (Unchanged, Unchanged) => SyncAction::NoOp,
            (Changed, Unchanged) => SyncAction::Upload,
            (Unchanged, Changed) | (Changed, Changed) => {
                if local_state.same_content(remote_state) {
                    SyncAction::Adopt
                } else if local == Unchanged {
                    SyncAction::Download
                } else {
                    SyncAction::Conflict
                }
            }
            (Deleted, Unchanged) => SyncAction::DeleteRemote,
            (Unchanged, Deleted) => SyncAction::DeleteLocal,
            (Deleted, Changed) => SyncAction::Download,
            (Changed, Deleted) => SyncAction::Upload,
            (Deleted, Deleted) => SyncAction::Forget,
        }
    }

    /// Never synced: both sides are "new" relative to an empty index
    fn plan_unindexed(local: &Observed, remote: &Observed) -> Decision {
        let side = |o: &Observed| {
            if o.is_absent() {
                SideChange::Deleted
            } else {
                SideChange::Changed
            }
        };

        let action = match (local.is_absent(), remote.is_absent()) {
            (true, true) => SyncAction::NoOp,
            (false, true) => SyncAction::Upload,
            (true, false) => SyncAction::Download,
            (false, false) => {
                if local.same_content(remote) {
                    SyncAction::Adopt
                } else {
                    SyncAction::Conflict
                }
            }
        };

        Decision {
            local: side(local),
            remote: side(remote),
            action,
        }
    }
}
