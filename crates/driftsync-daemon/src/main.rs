//! DriftSync Daemon - Background synchronization service
//!
//! Runs as a user service and:
//! - Keeps the configured local folder in sync with the remote tree
//! - Serves the control interface on the D-Bus session bus
//! - Shuts down gracefully on SIGTERM/SIGINT
//!
//! # Architecture
//!
//! The daemon opens the state database, builds the remote and local
//! adapters, hands them to a `SyncEngine` and starts syncing. The engine
//! runs its own tasks; the main task only waits for a shutdown signal and
//! then stops the engine so in-flight work is cancelled cleanly.
//!
//! The config file is read from `$DRIFTSYNC_CONFIG` when set, otherwise from
//! `Config::default_path()`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use driftsync_cache::{DatabasePool, SqliteStateRepository};
use driftsync_core::config::{expand_home, Config, LoggingConfig};
use driftsync_core::ports::ISyncControl;
use driftsync_ipc::{DbusService, DBUS_NAME};
use driftsync_sync::{DirectoryRemoteStore, LocalFileSystemAdapter, SyncEngine};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Environment variable overriding the config file location
const CONFIG_ENV: &str = "DRIFTSYNC_CONFIG";

// ============================================================================
// Configuration
// ============================================================================

fn config_path() -> PathBuf {
    std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path)
}

/// Loads and validates the config at `path`, expanding `~` in every path
///
/// A missing file yields the defaults; an unparsable or invalid one is an
/// error.
fn load_config(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        Config::load(path).with_context(|| format!("Failed to parse {}", path.display()))?
    } else {
        Config::default()
    };

    let errors = config.validate();
    if !errors.is_empty() {
        let listed: Vec<String> = errors.iter().map(ToString::to_string).collect();
        anyhow::bail!("Invalid configuration in {}: {}", path.display(), listed.join("; "));
    }

    config.sync.root = expand_home(&config.sync.root);
    config.remote.path = expand_home(&config.remote.path);
    config.state.database = expand_home(&config.state.database);
    Ok(config)
}

/// Installs the global subscriber; `RUST_LOG` wins over `logging.level`
fn init_tracing(logging: &LoggingConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

// ============================================================================
// DaemonService
// ============================================================================

/// Owns the engine and the D-Bus connection for the lifetime of the process
struct DaemonService {
    config: Config,
    shutdown: CancellationToken,
}

impl DaemonService {
    fn new(config: Config, shutdown: CancellationToken) -> Self {
        Self { config, shutdown }
    }

    async fn build_engine(&self) -> Result<(SyncEngine, DatabasePool)> {
        let db_path = &self.config.state.database;
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let (db_pool, recreated) = DatabasePool::open_or_recreate(db_path)
            .await
            .context("Failed to open state database")?;
        if recreated {
            warn!(
                path = %db_path.display(),
                "State database was unreadable and has been recreated; a full reindex will run"
            );
        }
        let repo = Arc::new(SqliteStateRepository::new(db_pool.pool().clone()));

        let remote = DirectoryRemoteStore::open(
            self.config.remote.path.clone(),
            Duration::from_millis(self.config.remote.scan_interval_ms),
        )
        .await
        .context("Failed to open remote store")?;
        info!(remote = %self.config.remote.path.display(), "Remote store ready");

        let engine = SyncEngine::new(
            self.config.clone(),
            Arc::new(remote),
            Arc::new(LocalFileSystemAdapter::new()),
            repo.clone(),
            repo.clone(),
            repo,
        );
        Ok((engine, db_pool))
    }

    /// Runs until the shutdown token fires
    ///
    /// 1. Opens the database and builds the engine
    /// 2. Starts the D-Bus service (also the single-instance lock)
    /// 3. Starts syncing
    /// 4. Waits for shutdown, then stops the engine
    async fn run(&self) -> Result<()> {
        let (engine, db_pool) = self.build_engine().await?;
        let control: Arc<dyn ISyncControl> = Arc::new(engine.clone());

        let dbus = DbusService::new(control.clone());
        let (_connection, relay) = match dbus.start().await {
            Ok(started) => started,
            Err(e) => {
                let detail = format!("{e:#}");
                if detail.contains("NameTaken") || detail.contains("already") {
                    error!(name = DBUS_NAME, "Another driftsyncd instance is already running");
                    anyhow::bail!("Another instance of driftsyncd is already running");
                }
                return Err(e).context("Failed to start D-Bus service");
            }
        };

        // A failed start leaves the daemon up so the error is visible and a
        // restart can be requested over D-Bus
        if let Err(e) = control.start_sync().await {
            error!(error = %e, "Syncing could not be started");
        }

        self.shutdown.cancelled().await;
        info!("Shutting down");

        if let Err(e) = control.stop_sync().await {
            warn!(error = %e, "Engine did not stop cleanly");
        }
        relay.abort();
        db_pool.close().await;
        Ok(())
    }
}

// ============================================================================
// Graceful shutdown signal handler
// ============================================================================

/// Waits for SIGTERM or SIGINT and cancels `token`
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT (Ctrl+C)"),
        _ = terminate => info!("Received SIGTERM"),
    }
    token.cancel();
}

// ============================================================================
// Main entry point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let path = config_path();
    let config = load_config(&path)?;
    init_tracing(&config.logging);
    info!(
        config = %path.display(),
        root = %config.sync.root.display(),
        "DriftSync daemon starting"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let result = DaemonService::new(config, shutdown).run().await;
    match &result {
        Ok(()) => info!("DriftSync daemon shut down gracefully"),
        Err(e) => error!(error = %e, "DriftSync daemon exiting with error"),
    }
    result
}

// ============================================================================
// Tests
// ============================================================================
