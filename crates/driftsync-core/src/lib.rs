//! DriftSync Core - Domain logic and business rules
//!
//! This crate contains the hexagonal architecture core with:
//! - **Domain entities** - `IndexEntry`, `SyncEvent`, `ExclusionSet`, `DaemonStatus`, `HistoryEntry`
//! - **Port definitions** - Traits for adapters: `IRemoteStore`, `IIndexStore`, `ISettingsStore`,
//!   `IHistoryStore`, `ILocalFileSystem`, `ISyncControl`
//! - **Configuration** - YAML daemon configuration with validation
//!
//! # Architecture
//!
//! This crate follows the hexagonal (ports & adapters) architecture pattern.
//! The domain module contains pure business logic with no external dependencies.
//! Ports define trait interfaces that adapter crates implement.

pub mod config;
pub mod domain;
pub mod ports;
