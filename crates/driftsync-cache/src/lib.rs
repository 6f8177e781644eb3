//! DriftSync Cache - Local state persistence
//!
//! SQLite-based storage for:
//! - The path index (last synchronized state per path)
//! - Durable settings (excluded items, remote cursor, local root)
//! - The history log
//!
//! One [`SqliteStateRepository`] backs all three state ports of
//! `driftsync-core`. Open the database with
//! [`DatabasePool::open_or_recreate`] so an unreadable file is moved aside
//! instead of stopping the daemon.
//!
//!
//! ```no_run
//! use std::path::Path;
//! use driftsync_cache::{DatabasePool, SqliteStateRepository};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let (pool, _recovered) =
//!     DatabasePool::open_or_recreate(Path::new("/home/user/.local/share/driftsync/state.db"))
//!         .await?;
//! let repo = SqliteStateRepository::new(pool.pool().clone());
//! // Use repo as IIndexStore / ISettingsStore / IHistoryStore...
//! # Ok(())
//! # }
//! ```

pub mod pool;
pub mod repository;

pub use pool::DatabasePool;
pub use repository::SqliteStateRepository;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cannot open state database: {0}")]
    ConnectionFailed(String),

    #[error("State query failed: {0}")]
    QueryFailed(String),

    #[error("State schema migration failed: {0}")]
    MigrationFailed(String),

    /// A stored row no longer decodes into its domain type
    #[error("Corrupt state row: {0}")]
    SerializationError(String),
}

impl From<sqlx::Error> for CacheError {
    fn from(e: sqlx::Error) -> Self {
        CacheError::QueryFailed(e.to_string())
    }
}
