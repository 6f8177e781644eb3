//! Daemon status, error records and per-file status
//!
//! [`DaemonStatus`] is a small state machine:
//!
//! ```text
//! STARTING ──→ IDLE ⇄ SYNCING
//!               ⇅
//!             PAUSED
//! any ──→ ERROR ──→ STOPPED | STARTING
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::RemotePath;

/// Lifecycle state of one engine instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonStatus {
    Starting,
    Idle,
    Syncing,
    Paused,
    Error,
    Stopped,
}

impl DaemonStatus {
    /// Whether the engine may move from `self` to `target`
    pub fn can_transition_to(&self, target: DaemonStatus) -> bool {
        use DaemonStatus::*;

        if *self == target {
            return true;
        }

        match (self, target) {
            // Fatal errors are reachable from anywhere
            (_, Error) => true,
            // Explicit stop is always honoured
            (_, Stopped) => true,

            (Starting, Idle) | (Starting, Syncing) | (Starting, Paused) => true,
            (Idle, Syncing) | (Syncing, Idle) => true,
            (Idle, Paused) | (Syncing, Paused) => true,
            (Paused, Idle) | (Paused, Syncing) => true,
            (Error, Starting) | (Stopped, Starting) => true,

            _ => false,
        }
    }

    /// Validated transition
    ///
    /// # Errors
    /// Returns `DomainError::InvalidState` for transitions outside the machine
    pub fn transition_to(self, target: DaemonStatus) -> Result<DaemonStatus, DomainError> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(DomainError::InvalidState {
                from: self.to_string(),
                to: target.to_string(),
            })
        }
    }

    /// Event intake (watcher, poller, dispatcher) is active
    pub fn is_running(&self) -> bool {
        matches!(self, DaemonStatus::Idle | DaemonStatus::Syncing)
    }
}

impl std::fmt::Display for DaemonStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DaemonStatus::Starting => "starting",
            DaemonStatus::Idle => "idle",
            DaemonStatus::Syncing => "syncing",
            DaemonStatus::Paused => "paused",
            DaemonStatus::Error => "error",
            DaemonStatus::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// A recoverable failure scoped to one path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncErrorInfo {
    pub path: RemotePath,
    /// Short machine-friendly classification, e.g. `permission_denied`
    pub kind: String,
    pub message: String,
    /// Consecutive failed attempts for this path
    pub attempts: u32,
    /// Set once `attempts` exceeds the retry budget; the path is skipped
    /// until a new change is observed for it
    pub skipped: bool,
    pub timestamp: DateTime<Utc>,
}

/// Classes of failure that stop event intake until restarted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FatalErrorKind {
    WatchLimitExceeded,
    LocalRootMissing,
    IndexUnreadable,
}

impl std::fmt::Display for FatalErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FatalErrorKind::WatchLimitExceeded => "WatchLimitExceeded",
            FatalErrorKind::LocalRootMissing => "LocalRootMissing",
            FatalErrorKind::IndexUnreadable => "IndexUnreadable",
        };
        write!(f, "{s}")
    }
}

/// A failure requiring external remediation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FatalError {
    #[serde(rename = "type")]
    pub kind: FatalErrorKind,
    pub title: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl FatalError {
    pub fn new(kind: FatalErrorKind, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Answer of `get_file_status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Synced,
    Unwatched,
    Error,
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileStatus::Synced => write!(f, "synced"),
            FileStatus::Unwatched => write!(f, "unwatched"),
            FileStatus::Error => write!(f, "error"),
        }
    }
}

/// Point-in-time view of the daemon handed to external callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub status: DaemonStatus,
    /// Increments on every observable change; the long-poll baseline
    pub generation: u64,
    pub sync_errors: Vec<SyncErrorInfo>,
    pub fatal_errors: Vec<FatalError>,
    pub queued: usize,
    pub in_flight: usize,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            status: DaemonStatus::Stopped,
            generation: 0,
            sync_errors: Vec::new(),
            fatal_errors: Vec::new(),
            queued: 0,
            in_flight: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use DaemonStatus::*;

    #[test]
    fn test_normal_lifecycle() {
        let s = Stopped.transition_to(Starting).unwrap();
        let s = s.transition_to(Idle).unwrap();
        let s = s.transition_to(Syncing).unwrap();
        let s = s.transition_to(Idle).unwrap();
        let s = s.transition_to(Paused).unwrap();
        let s = s.transition_to(Idle).unwrap();
        assert_eq!(s, Idle);
    }

    #[test]
    fn test_error_reachable_from_any_state() {
        for s in [Starting, Idle, Syncing, Paused, Stopped] {
            assert!(s.can_transition_to(Error), "{s} -> error");
        }
    }

    #[test]
    fn test_error_exits() {
        assert!(Error.can_transition_to(Stopped));
        assert!(Error.can_transition_to(Starting));
        assert!(!Error.can_transition_to(Idle));
        assert!(!Error.can_transition_to(Syncing));
    }

    #[test]
    fn test_invalid_transition_reports_states() {
        let err = Stopped.transition_to(Syncing).unwrap_err();
        assert_eq!(
            err,
            DomainError::InvalidState {
                from: "stopped".into(),
                to: "syncing".into()
            }
        );
    }

    #[test]
    fn test_is_running() {
        assert!(Idle.is_running());
        assert!(Syncing.is_running());
        assert!(!Paused.is_running());
        assert!(!Error.is_running());
    }

    #[test]
    fn test_fatal_error_serializes_type_tag() {
        let err = FatalError::new(FatalErrorKind::WatchLimitExceeded, "t", "m");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["type"], "WatchLimitExceeded");
    }

    #[test]
    fn test_file_status_display() {
        assert_eq!(FileStatus::Unwatched.to_string(), "unwatched");
        assert_eq!(
            serde_json::to_string(&FileStatus::Synced).unwrap(),
            "\"synced\""
        );
    }
}
