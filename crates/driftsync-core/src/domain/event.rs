//! SyncEvent: a change observed on one replica
//!
//! Events are hints. The reconciler re-reads local, remote and indexed state
//! for every affected path, so duplicated or reordered delivery is harmless.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::RemotePath;

/// Which replica produced an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Local,
    Remote,
}

impl std::fmt::Display for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventSource::Local => write!(f, "local"),
            EventSource::Remote => write!(f, "remote"),
        }
    }
}

/// The change itself, matched exhaustively by the reconciler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Change {
    Added { path: RemotePath },
    Changed { path: RemotePath },
    Deleted { path: RemotePath },
    Moved { from: RemotePath, to: RemotePath },
}

/// A change plus its origin and observation time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub change: Change,
    pub source: EventSource,
    pub timestamp: DateTime<Utc>,
}

impl SyncEvent {
    /// Creates an event stamped with the current time
    pub fn new(change: Change, source: EventSource) -> Self {
        Self {
            change,
            source,
            timestamp: Utc::now(),
        }
    }

    pub fn added(path: RemotePath, source: EventSource) -> Self {
        Self::new(Change::Added { path }, source)
    }

    pub fn changed(path: RemotePath, source: EventSource) -> Self {
        Self::new(Change::Changed { path }, source)
    }

    pub fn deleted(path: RemotePath, source: EventSource) -> Self {
        Self::new(Change::Deleted { path }, source)
    }

    pub fn moved(from: RemotePath, to: RemotePath, source: EventSource) -> Self {
        Self::new(Change::Moved { from, to }, source)
    }

    /// Every path touched by this event (source first for moves)
    pub fn paths(&self) -> Vec<&RemotePath> {
        match &self.change {
            Change::Added { path } | Change::Changed { path } | Change::Deleted { path } => {
                vec![path]
            }
            Change::Moved { from, to } => vec![from, to],
        }
    }

    /// The path the event leaves behind (destination for moves)
    pub fn primary_path(&self) -> &RemotePath {
        match &self.change {
            Change::Added { path } | Change::Changed { path } | Change::Deleted { path } => path,
            Change::Moved { to, .. } => to,
        }
    }

    /// Returns true for deletions
    pub fn is_deletion(&self) -> bool {
        matches!(self.change, Change::Deleted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rp(s: &str) -> RemotePath {
        RemotePath::new(s.to_string()).unwrap()
    }

    #[test]
    fn test_paths_for_move() {
        let event = SyncEvent::moved(rp("/a"), rp("/b"), EventSource::Local);
        let paths: Vec<&str> = event.paths().iter().map(|p| p.as_str()).collect();
        assert_eq!(paths, vec!["/a", "/b"]);
        assert_eq!(event.primary_path().as_str(), "/b");
    }

    #[test]
    fn test_serde_tagging() {
        let event = SyncEvent::deleted(rp("/x"), EventSource::Remote);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["change"]["type"], "deleted");
        assert_eq!(json["source"], "remote");
        assert!(event.is_deletion());
    }
}
