//! D-Bus service for the DriftSync daemon
//!
//! [`DaemonInterface`] forwards every call to an `ISyncControl`
//! implementation. [`DbusService`] registers it on the session bus and
//! relays status changes as `StatusChanged` signals.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use driftsync_core::domain::RemotePath;
use driftsync_core::ports::{ISyncControl, SyncControlError};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// D-Bus well-known name for the DriftSync daemon
pub const DBUS_NAME: &str = "org.driftsync.Daemon";

/// D-Bus object path for the service
pub const DBUS_PATH: &str = "/org/driftsync/Daemon";

/// Upper bound for a single `StatusChangeLongpoll` call
const MAX_LONGPOLL: Duration = Duration::from_secs(300);

/// Long-poll timeout used by the signal relay
const RELAY_POLL: Duration = Duration::from_secs(60);

// ============================================================================
// Errors
// ============================================================================

/// Typed failures returned to D-Bus callers
#[derive(Debug, zbus::DBusError)]
#[zbus(prefix = "org.driftsync.Daemon.Error")]
pub enum ControlError {
    #[zbus(error)]
    ZBus(zbus::Error),
    NotFound(String),
    InvalidPath(String),
    InvalidState(String),
    AlreadyExists(String),
    Internal(String),
}

impl From<SyncControlError> for ControlError {
    fn from(err: SyncControlError) -> Self {
        match err {
            SyncControlError::NotFound(m) => ControlError::NotFound(m),
            SyncControlError::InvalidPath(m) => ControlError::InvalidPath(m),
            SyncControlError::InvalidState(m) => ControlError::InvalidState(m),
            SyncControlError::AlreadyExists(m) => ControlError::AlreadyExists(m),
            SyncControlError::Internal(m) => ControlError::Internal(m),
        }
    }
}

fn remote_path(path: &str) -> Result<RemotePath, ControlError> {
    RemotePath::new(path.to_string()).map_err(|e| ControlError::InvalidPath(e.to_string()))
}

fn to_json<T: Serialize>(value: &T) -> Result<String, ControlError> {
    serde_json::to_string(value).map_err(|e| ControlError::Internal(e.to_string()))
}

// ============================================================================
// DaemonInterface
// ============================================================================

/// `org.driftsync.Daemon` backed by an [`ISyncControl`]
pub struct DaemonInterface {
    control: Arc<dyn ISyncControl>,
}

impl DaemonInterface {
    pub fn new(control: Arc<dyn ISyncControl>) -> Self {
        Self { control }
    }
}

#[zbus::interface(name = "org.driftsync.Daemon")]
impl DaemonInterface {
    /// Current status snapshot as JSON
    ///
    /// Fields: `status`, `generation`, `sync_errors`, `fatal_errors`,
    /// `queued`, `in_flight`.
    async fn status(&self) -> Result<String, ControlError> {
        to_json(&self.control.status().await)
    }

    /// Waits until the status generation moves past `baseline`
    ///
    /// Returns `{"changed": bool, "status": {...}}`; `changed` is false when
    /// `timeout_secs` elapsed first.
    async fn status_change_longpoll(
        &self,
        baseline: u64,
        timeout_secs: u32,
    ) -> Result<String, ControlError> {
        let timeout = Duration::from_secs(u64::from(timeout_secs)).min(MAX_LONGPOLL);
        let change = self.control.status_change_longpoll(baseline, timeout).await;
        to_json(&serde_json::json!({
            "changed": change.changed,
            "status": change.snapshot,
        }))
    }

    async fn start_sync(&self) -> Result<(), ControlError> {
        info!("StartSync requested over D-Bus");
        Ok(self.control.start_sync().await?)
    }

    async fn stop_sync(&self) -> Result<(), ControlError> {
        info!("StopSync requested over D-Bus");
        Ok(self.control.stop_sync().await?)
    }

    async fn pause_sync(&self) -> Result<(), ControlError> {
        Ok(self.control.pause_sync().await?)
    }

    async fn resume_sync(&self) -> Result<(), ControlError> {
        Ok(self.control.resume_sync().await?)
    }

    /// `synced`, `unwatched` or `error` for an absolute local path
    async fn get_file_status(&self, local_path: &str) -> String {
        self.control
            .get_file_status(&PathBuf::from(local_path))
            .await
            .to_string()
    }

    async fn exclude_item(&self, path: &str) -> Result<(), ControlError> {
        let path = remote_path(path)?;
        Ok(self.control.exclude_item(&path).await?)
    }

    async fn include_item(&self, path: &str) -> Result<(), ControlError> {
        let path = remote_path(path)?;
        Ok(self.control.include_item(&path).await?)
    }

    async fn excluded_items(&self) -> Vec<String> {
        self.control
            .excluded_items()
            .await
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    async fn set_excluded_items(&self, paths: Vec<String>) -> Result<(), ControlError> {
        let paths = paths
            .iter()
            .map(|p| remote_path(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.control.set_excluded_items(paths).await?)
    }

    /// `included`, `excluded` or `partially excluded`
    async fn excluded_status(&self, path: &str) -> Result<String, ControlError> {
        let path = remote_path(path)?;
        Ok(self.control.excluded_status(&path).await?.to_string())
    }

    /// History entries as a JSON array, newest first
    async fn history(&self) -> Result<String, ControlError> {
        to_json(&self.control.history().await)
    }

    /// Every index entry as a JSON array
    async fn get_index(&self) -> Result<String, ControlError> {
        to_json(&self.control.get_index().await)
    }

    async fn activity(&self) -> Vec<String> {
        self.control
            .activity()
            .await
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    /// Seconds since the last completed change
    async fn idle_time(&self) -> u64 {
        self.control.idle_time().await.as_secs()
    }

    async fn clear_sync_errors(&self) {
        self.control.clear_sync_errors().await;
    }

    async fn reset_sync_state(&self) -> Result<(), ControlError> {
        Ok(self.control.reset_sync_state().await?)
    }

    async fn rebuild_index(&self) -> Result<(), ControlError> {
        Ok(self.control.rebuild_index().await?)
    }

    async fn move_local_root(&self, new_root: &str) -> Result<(), ControlError> {
        Ok(self.control.move_local_root(PathBuf::from(new_root)).await?)
    }

    /// Emitted whenever the status snapshot changes
    #[zbus(signal)]
    async fn status_changed(
        signal_ctxt: &zbus::SignalContext<'_>,
        status: &str,
        generation: u64,
    ) -> zbus::Result<()>;
}

// ============================================================================
// DbusService
// ============================================================================

/// Owns the session-bus connection serving [`DaemonInterface`]
pub struct DbusService {
    control: Arc<dyn ISyncControl>,
}

impl DbusService {
    pub fn new(control: Arc<dyn ISyncControl>) -> Self {
        Self { control }
    }

    /// Registers the interface, claims [`DBUS_NAME`] and starts the signal relay
    ///
    /// The connection must be kept alive for the service to stay reachable;
    /// the relay task ends when the connection is dropped.
    ///
    /// # Errors
    /// Fails when the session bus is unavailable or the name is already owned.
    pub async fn start(&self) -> anyhow::Result<(zbus::Connection, JoinHandle<()>)> {
        info!("Starting D-Bus service on session bus");
        let connection = zbus::connection::Builder::session()?
            .name(DBUS_NAME)?
            .serve_at(DBUS_PATH, DaemonInterface::new(self.control.clone()))?
            .build()
            .await?;

        let relay = tokio::spawn(relay_status(connection.clone(), self.control.clone()));
        info!(name = DBUS_NAME, path = DBUS_PATH, "D-Bus service started");
        Ok((connection, relay))
    }

    /// True when no other process owns [`DBUS_NAME`]
    pub async fn name_available() -> anyhow::Result<bool> {
        let connection = zbus::Connection::session().await?;
        let proxy = zbus::fdo::DBusProxy::new(&connection).await?;
        Ok(proxy.get_name_owner(DBUS_NAME.try_into()?).await.is_err())
    }
}

/// Forwards every status change as a `StatusChanged` signal
async fn relay_status(connection: zbus::Connection, control: Arc<dyn ISyncControl>) {
    let iface = match connection
        .object_server()
        .interface::<_, DaemonInterface>(DBUS_PATH)
        .await
    {
        Ok(iface) => iface,
        Err(e) => {
            warn!(error = %e, "Status relay could not find the interface");
            return;
        }
    };

    let mut generation = control.status().await.generation;
    loop {
        let change = control.status_change_longpoll(generation, RELAY_POLL).await;
        if !change.changed {
            continue;
        }
        generation = change.snapshot.generation;
        let status = change.snapshot.status.to_string();
        if let Err(e) =
            DaemonInterface::status_changed(iface.signal_context(), &status, generation).await
        {
            debug!(error = %e, "StatusChanged not delivered, stopping relay");
            return;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Mutex;

    use driftsync_core::domain::{
        DaemonStatus, ExclusionStatus, FileStatus, HistoryEntry, IndexEntry, StatusSnapshot,
    };
    use driftsync_core::ports::StatusChange;

    use super::*;

    /// Records calls and answers with canned values
    #[derive(Default)]
    struct FakeControl {
        calls: Mutex<Vec<String>>,
        excluded: Mutex<Vec<RemotePath>>,
    }

    impl FakeControl {
        fn log(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl ISyncControl for FakeControl {
        async fn status(&self) -> StatusSnapshot {
            StatusSnapshot {
                status: DaemonStatus::Idle,
                generation: 7,
                ..StatusSnapshot::default()
            }
        }

        async fn status_change_longpoll(&self, baseline: u64, _timeout: Duration) -> StatusChange {
            let snapshot = self.status().await;
            StatusChange {
                changed: snapshot.generation != baseline,
                snapshot,
            }
        }

        async fn start_sync(&self) -> Result<(), SyncControlError> {
            self.log("start");
            Ok(())
        }

        async fn stop_sync(&self) -> Result<(), SyncControlError> {
            self.log("stop");
            Ok(())
        }

        async fn pause_sync(&self) -> Result<(), SyncControlError> {
            Err(SyncControlError::InvalidState("Syncing is not started".into()))
        }

        async fn resume_sync(&self) -> Result<(), SyncControlError> {
            Ok(())
        }

        async fn get_file_status(&self, local_path: &Path) -> FileStatus {
            if local_path.starts_with("/sync") {
                FileStatus::Synced
            } else {
                FileStatus::Unwatched
            }
        }

        async fn exclude_item(&self, path: &RemotePath) -> Result<(), SyncControlError> {
            if path.as_str() == "/missing" {
                return Err(SyncControlError::NotFound(path.to_string()));
            }
            self.log(format!("exclude {path}"));
            self.excluded.lock().unwrap().push(path.clone());
            Ok(())
        }

        async fn include_item(&self, path: &RemotePath) -> Result<(), SyncControlError> {
            self.log(format!("include {path}"));
            Ok(())
        }

        async fn excluded_items(&self) -> Vec<RemotePath> {
            self.excluded.lock().unwrap().clone()
        }

        async fn set_excluded_items(&self, paths: Vec<RemotePath>) -> Result<(), SyncControlError> {
            *self.excluded.lock().unwrap() = paths;
            Ok(())
        }

        async fn excluded_status(
            &self,
            _path: &RemotePath,
        ) -> Result<ExclusionStatus, SyncControlError> {
            Ok(ExclusionStatus::PartiallyExcluded)
        }

        async fn history(&self) -> Vec<HistoryEntry> {
            Vec::new()
        }

        async fn get_index(&self) -> Vec<IndexEntry> {
            vec![IndexEntry::folder(RemotePath::new("/docs".into()).unwrap())]
        }

        async fn activity(&self) -> Vec<RemotePath> {
            vec![RemotePath::new("/busy.txt".into()).unwrap()]
        }

        async fn idle_time(&self) -> Duration {
            Duration::from_millis(42_500)
        }

        async fn clear_sync_errors(&self) {
            self.log("clear");
        }

        async fn reset_sync_state(&self) -> Result<(), SyncControlError> {
            Ok(())
        }

        async fn rebuild_index(&self) -> Result<(), SyncControlError> {
            Ok(())
        }

        async fn move_local_root(&self, new_root: PathBuf) -> Result<(), SyncControlError> {
            Err(SyncControlError::AlreadyExists(new_root.display().to_string()))
        }
    }

    fn interface() -> (DaemonInterface, Arc<FakeControl>) {
        let fake = Arc::new(FakeControl::default());
        (DaemonInterface::new(fake.clone()), fake)
    }

    #[test]
    fn test_dbus_constants() {
        assert_eq!(DBUS_NAME, "org.driftsync.Daemon");
        assert_eq!(DBUS_PATH, "/org/driftsync/Daemon");
    }

    #[test]
    fn test_control_error_mapping() {
        assert!(matches!(
            ControlError::from(SyncControlError::NotFound("/a".into())),
            ControlError::NotFound(m) if m == "/a"
        ));
        assert!(matches!(
            ControlError::from(SyncControlError::InvalidState("x".into())),
            ControlError::InvalidState(_)
        ));
        assert!(matches!(
            ControlError::from(SyncControlError::Internal("x".into())),
            ControlError::Internal(_)
        ));
    }

    #[tokio::test]
    async fn test_status_is_json() {
        let (iface, _) = interface();
        let status: serde_json::Value =
            serde_json::from_str(&iface.status().await.unwrap()).unwrap();
        assert_eq!(status["generation"], 7);
        assert!(status["fatal_errors"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_longpoll_reports_change_against_baseline() {
        let (iface, _) = interface();
        let reply: serde_json::Value =
            serde_json::from_str(&iface.status_change_longpoll(3, 1).await.unwrap()).unwrap();
        assert_eq!(reply["changed"], true);
        assert_eq!(reply["status"]["generation"], 7);

        let reply: serde_json::Value =
            serde_json::from_str(&iface.status_change_longpoll(7, 1).await.unwrap()).unwrap();
        assert_eq!(reply["changed"], false);
    }

    #[tokio::test]
    async fn test_lifecycle_calls_are_forwarded() {
        let (iface, fake) = interface();
        iface.start_sync().await.unwrap();
        iface.stop_sync().await.unwrap();
        assert!(matches!(
            iface.pause_sync().await,
            Err(ControlError::InvalidState(_))
        ));
        assert_eq!(fake.calls(), vec!["start", "stop"]);
    }

    #[tokio::test]
    async fn test_exclusion_calls() {
        let (iface, fake) = interface();
        iface.exclude_item("/Photos").await.unwrap();
        assert_eq!(iface.excluded_items().await, vec!["/Photos"]);
        assert!(matches!(
            iface.exclude_item("/missing").await,
            Err(ControlError::NotFound(_))
        ));
        assert!(matches!(
            iface.exclude_item("relative/path").await,
            Err(ControlError::InvalidPath(_))
        ));

        iface
            .set_excluded_items(vec!["/a".into(), "/b".into()])
            .await
            .unwrap();
        assert_eq!(iface.excluded_items().await, vec!["/a", "/b"]);
        assert_eq!(
            iface.excluded_status("/a").await.unwrap(),
            "partially excluded"
        );
        assert_eq!(fake.calls(), vec!["exclude /Photos"]);
    }

    #[tokio::test]
    async fn test_queries() {
        let (iface, _) = interface();
        assert_eq!(iface.get_file_status("/sync/a.txt").await, "synced");
        assert_eq!(iface.get_file_status("/tmp/a.txt").await, "unwatched");
        assert_eq!(iface.activity().await, vec!["/busy.txt"]);
        assert_eq!(iface.idle_time().await, 42);

        let index: serde_json::Value =
            serde_json::from_str(&iface.get_index().await.unwrap()).unwrap();
        assert_eq!(index.as_array().unwrap().len(), 1);
        assert_eq!(iface.history().await.unwrap(), "[]");
    }

    #[tokio::test]
    async fn test_move_local_root_conflict() {
        let (iface, _) = interface();
        assert!(matches!(
            iface.move_local_root("/taken").await,
            Err(ControlError::AlreadyExists(_))
        ));
    }
}
