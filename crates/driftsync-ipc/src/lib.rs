//! DriftSync IPC - D-Bus control surface
//!
//! Exposes a running engine's [`ISyncControl`] on the session bus so the
//! CLI (or any other client) can drive it and read its status.
//!
//! # Interface
//! - `org.driftsync.Daemon` at `/org/driftsync/Daemon`
//!
//! Structured replies (status, history, index) are JSON strings; failures
//! are typed D-Bus errors under `org.driftsync.Daemon.Error`.
//!
//! [`ISyncControl`]: driftsync_core::ports::ISyncControl

pub mod service;

pub use service::{ControlError, DaemonInterface, DbusService, DBUS_NAME, DBUS_PATH};
