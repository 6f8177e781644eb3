//! SQLite pool for the daemon's state database
//!
//! File databases run in WAL mode with a busy timeout; the schema is applied
//! on every open and is idempotent.

use std::path::{Path, PathBuf};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::CacheError;

/// Up to five connections for a file, exactly one in memory
pub struct DatabasePool {
    pool: SqlitePool,
}

impl DatabasePool {
    /// Opens (creating if needed) the database at `db_path`
    ///
    /// # Errors
    ///
    /// `ConnectionFailed` when the file cannot be opened as SQLite,
    /// `MigrationFailed` when the schema cannot be applied.
    pub async fn new(db_path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CacheError::ConnectionFailed(format!("{}: {e}", parent.display()))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| {
                CacheError::ConnectionFailed(format!("{}: {e}", db_path.display()))
            })?;

        Self::run_migrations(&pool).await?;

        tracing::info!(path = %db_path.display(), "State database open");

        Ok(Self { pool })
    }

    /// Opens the database, moving an unreadable file aside and starting fresh
    ///
    /// The damaged file is renamed to `<name>.corrupt` so it can be inspected.
    /// Returns the pool and whether a recovery happened; after a recovery the
    /// caller must treat the index as lost and reindex.
    ///
    /// # Errors
    ///
    /// Fails only when the fresh database cannot be created either.
    pub async fn open_or_recreate(db_path: &Path) -> Result<(Self, bool), CacheError> {
        match Self::new(db_path).await {
            Ok(pool) => Ok((pool, false)),
            Err(first) => {
                tracing::warn!(
                    path = %db_path.display(),
                    error = %first,
                    "State database unreadable, recreating"
                );
                let aside = corrupt_path(db_path);
                std::fs::rename(db_path, &aside).map_err(|e| {
                    CacheError::ConnectionFailed(format!(
                        "Failed to move {} aside: {}",
                        db_path.display(),
                        e
                    ))
                })?;
                for suffix in ["-wal", "-shm"] {
                    let mut sidecar = db_path.as_os_str().to_owned();
                    sidecar.push(suffix);
                    let _ = std::fs::remove_file(PathBuf::from(sidecar));
                }
                let pool = Self::new(db_path).await?;
                Ok((pool, true))
            }
        }
    }

    /// Private in-memory database, used by tests
    ///
    /// An in-memory SQLite database lives in one connection, so the pool
    /// holds exactly one.
    pub async fn in_memory() -> Result<Self, CacheError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| {
                CacheError::ConnectionFailed(format!("in-memory database: {e}"))
            })?;

        Self::run_migrations(&pool).await?;

        tracing::debug!("In-memory state database open");

        Ok(Self { pool })
    }

    /// Returns a reference to the underlying SQLite connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Closes all connections, flushing the WAL
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Runs the initial schema migration
    async fn run_migrations(pool: &SqlitePool) -> Result<(), CacheError> {
        let migration_sql = include_str!("migrations/20261018_initial.sql");
        sqlx::raw_sql(migration_sql)
            .execute(pool)
            .await
            .map_err(|e| {
                CacheError::MigrationFailed(format!("initial schema: {e}"))
            })?;

        tracing::debug!("State schema applied");
        Ok(())
    }
}

fn corrupt_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_owned();
    name.push(".corrupt");
    PathBuf::from(name)
}
