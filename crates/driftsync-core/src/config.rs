//! Daemon settings read from `config.yaml`
//!
//! Every section has its own `Default`, so a partial file is fine. Call
//! [`Config::validate`] before handing the result to the engine; tests
//! usually go through [`ConfigBuilder`] instead.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for DriftSync.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub workers: WorkersConfig,
    pub retry: RetryConfig,
    pub history: HistoryConfig,
    pub remote: RemoteConfig,
    pub state: StateConfig,
    pub logging: LoggingConfig,
}

/// Synchronization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Local folder kept in step with the remote.
    pub root: PathBuf,
    /// Propagate local changes to the remote.
    pub upload: bool,
    /// Propagate remote changes to the local folder.
    pub download: bool,
    /// Window in which bursts of local events for one path collapse.
    pub debounce_ms: u64,
    /// How long queues must stay empty before the daemon reports idle.
    pub quiescence_ms: u64,
    /// Upper bound for a single remote long-poll.
    pub longpoll_timeout_secs: u64,
    /// Days between full remote listing + local scan passes.
    pub reindex_interval_days: u32,
    /// Failed attempts after which a path is skipped until it changes again.
    pub max_path_retries: u32,
    /// Path-scoped sync errors kept for reporting; the oldest retryable one
    /// is dropped first.
    pub max_sync_errors: usize,
}

/// Reconciliation worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    /// Paths reconciled in parallel.
    pub concurrency: usize,
    /// Capacity of each per-source event queue.
    pub queue_capacity: usize,
}

/// Exponential backoff for transient remote failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

/// History log retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub max_entries: usize,
    pub keep_days: u32,
}

/// Directory-backed remote store used by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Root of the directory treated as the remote (e.g. a mounted share).
    pub path: PathBuf,
    /// Milliseconds between snapshots of the remote directory.
    pub scan_interval_ms: u64,
}

/// Persistent state location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// SQLite database holding the index, settings and history.
    pub database: PathBuf,
}

/// Subscriber setup for the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Output format: `text` or `json`.
    pub format: String,
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Parses the YAML at `path`; no validation happens here.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// [`Config::load`], or the defaults when the file is missing or broken.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// `$XDG_CONFIG_HOME/driftsync/config.yaml`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("driftsync")
            .join("config.yaml")
    }
}

/// Expands a leading `~` to the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            root: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("~"))
                .join("DriftSync"),
            upload: true,
            download: true,
            debounce_ms: 500,
            quiescence_ms: 1000,
            longpoll_timeout_secs: 30,
            reindex_interval_days: 14,
            max_path_retries: 3,
            max_sync_errors: 1000,
        }
    }
}

impl SyncConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn quiescence(&self) -> Duration {
        Duration::from_millis(self.quiescence_ms)
    }

    pub fn longpoll_timeout(&self) -> Duration {
        Duration::from_secs(self.longpoll_timeout_secs)
    }

    pub fn reindex_interval(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.reindex_interval_days))
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            queue_capacity: 4096,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            keep_days: 14,
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            path: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("~"))
                .join("DriftSyncRemote"),
            scan_interval_ms: 2000,
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("~/.local/share"))
            .join("driftsync");
        Self {
            database: data_dir.join("state.db"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// One rejected field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"sync.debounce_ms"`.
    pub field: String,
    /// What is wrong with the value.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Accepted `logging.level` values.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Valid values for `logging.format`.
const VALID_LOG_FORMATS: &[&str] = &["text", "json"];

fn positive(errors: &mut Vec<ValidationError>, field: &str, value: u64) {
    if value == 0 {
        errors.push(ValidationError {
            field: field.into(),
            message: "must be greater than 0".into(),
        });
    }
}

impl Config {
    /// Collects every problem instead of stopping at the first; empty means usable.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- sync ---
        positive(&mut errors, "sync.debounce_ms", self.sync.debounce_ms);
        positive(
            &mut errors,
            "sync.longpoll_timeout_secs",
            self.sync.longpoll_timeout_secs,
        );
        positive(
            &mut errors,
            "sync.reindex_interval_days",
            u64::from(self.sync.reindex_interval_days),
        );
        positive(
            &mut errors,
            "sync.max_path_retries",
            u64::from(self.sync.max_path_retries),
        );
        positive(
            &mut errors,
            "sync.max_sync_errors",
            self.sync.max_sync_errors as u64,
        );

        // Check sync root only when it does not start with `~` (tilde is expanded at runtime).
        let root_str = self.sync.root.to_string_lossy();
        if !root_str.starts_with('~') && !self.sync.root.is_absolute() {
            errors.push(ValidationError {
                field: "sync.root".into(),
                message: format!("must be an absolute path: {}", self.sync.root.display()),
            });
        }

        // --- workers ---
        positive(
            &mut errors,
            "workers.concurrency",
            self.workers.concurrency as u64,
        );
        positive(
            &mut errors,
            "workers.queue_capacity",
            self.workers.queue_capacity as u64,
        );

        // --- retry ---
        positive(&mut errors, "retry.base_delay_ms", self.retry.base_delay_ms);
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            errors.push(ValidationError {
                field: "retry.max_delay_ms".into(),
                message: format!(
                    "must be at least base_delay_ms ({})",
                    self.retry.base_delay_ms
                ),
            });
        }

        // --- history ---
        positive(
            &mut errors,
            "history.max_entries",
            self.history.max_entries as u64,
        );
        positive(
            &mut errors,
            "history.keep_days",
            u64::from(self.history.keep_days),
        );

        // --- remote ---
        positive(
            &mut errors,
            "remote.scan_interval_ms",
            self.remote.scan_interval_ms,
        );
        let remote_str = self.remote.path.to_string_lossy();
        if !remote_str.starts_with('~') && self.remote.path == self.sync.root {
            errors.push(ValidationError {
                field: "remote.path".into(),
                message: "must differ from sync.root".into(),
            });
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}', expected one of: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }
        if !VALID_LOG_FORMATS.contains(&self.logging.format.as_str()) {
            errors.push(ValidationError {
                field: "logging.format".into(),
                message: format!(
                    "invalid format '{}', expected one of: {}",
                    self.logging.format,
                    VALID_LOG_FORMATS.join(", ")
                ),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Fluent builder for [`Config`], starting from defaults.
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a builder pre-populated with [`Config::default`] values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- sync ---

    pub fn sync_root(mut self, root: PathBuf) -> Self {
        self.config.sync.root = root;
        self
    }

    pub fn sync_upload(mut self, enabled: bool) -> Self {
        self.config.sync.upload = enabled;
        self
    }

    pub fn sync_download(mut self, enabled: bool) -> Self {
        self.config.sync.download = enabled;
        self
    }

    pub fn sync_debounce_ms(mut self, ms: u64) -> Self {
        self.config.sync.debounce_ms = ms;
        self
    }

    pub fn sync_quiescence_ms(mut self, ms: u64) -> Self {
        self.config.sync.quiescence_ms = ms;
        self
    }

    pub fn sync_longpoll_timeout_secs(mut self, secs: u64) -> Self {
        self.config.sync.longpoll_timeout_secs = secs;
        self
    }

    pub fn sync_reindex_interval_days(mut self, days: u32) -> Self {
        self.config.sync.reindex_interval_days = days;
        self
    }

    pub fn sync_max_path_retries(mut self, n: u32) -> Self {
        self.config.sync.max_path_retries = n;
        self
    }

    pub fn sync_max_sync_errors(mut self, n: usize) -> Self {
        self.config.sync.max_sync_errors = n;
        self
    }

    // --- workers ---

    pub fn workers_concurrency(mut self, n: usize) -> Self {
        self.config.workers.concurrency = n;
        self
    }

    pub fn workers_queue_capacity(mut self, n: usize) -> Self {
        self.config.workers.queue_capacity = n;
        self
    }

    // --- retry ---

    pub fn retry_max_retries(mut self, n: u32) -> Self {
        self.config.retry.max_retries = n;
        self
    }

    pub fn retry_base_delay_ms(mut self, ms: u64) -> Self {
        self.config.retry.base_delay_ms = ms;
        self
    }

    pub fn retry_max_delay_ms(mut self, ms: u64) -> Self {
        self.config.retry.max_delay_ms = ms;
        self
    }

    // --- history ---

    pub fn history_max_entries(mut self, n: usize) -> Self {
        self.config.history.max_entries = n;
        self
    }

    pub fn history_keep_days(mut self, days: u32) -> Self {
        self.config.history.keep_days = days;
        self
    }

    // --- remote ---

    pub fn remote_path(mut self, path: PathBuf) -> Self {
        self.config.remote.path = path;
        self
    }

    pub fn remote_scan_interval_ms(mut self, ms: u64) -> Self {
        self.config.remote.scan_interval_ms = ms;
        self
    }

    // --- state ---

    pub fn state_database(mut self, path: PathBuf) -> Self {
        self.config.state.database = path;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn logging_format(mut self, format: impl Into<String>) -> Self {
        self.config.logging.format = format.into();
        self
    }

    // --- build ---

    /// Returns the config without validating it.
    pub fn build(self) -> Config {
        self.config
    }

    /// [`ConfigBuilder::build`] followed by [`Config::validate`].
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    // -- Defaults --

    #[test]
    fn default_config_has_sensible_values() {
        let cfg = Config::default();
        assert!(cfg.sync.upload);
        assert!(cfg.sync.download);
        assert_eq!(cfg.sync.debounce_ms, 500);
        assert_eq!(cfg.sync.quiescence_ms, 1000);
        assert_eq!(cfg.sync.longpoll_timeout_secs, 30);
        assert_eq!(cfg.sync.reindex_interval_days, 14);
        assert_eq!(cfg.sync.max_path_retries, 3);
        assert_eq!(cfg.sync.max_sync_errors, 1000);
        assert!(cfg.sync.root.to_string_lossy().contains("DriftSync"));
        assert_eq!(cfg.workers.concurrency, 4);
        assert_eq!(cfg.workers.queue_capacity, 4096);
        assert_eq!(cfg.retry.max_retries, 5);
        assert_eq!(cfg.retry.base_delay_ms, 1000);
        assert_eq!(cfg.retry.max_delay_ms, 60_000);
        assert_eq!(cfg.history.max_entries, 1000);
        assert_eq!(cfg.history.keep_days, 14);
        assert_eq!(cfg.remote.scan_interval_ms, 2000);
        assert!(cfg.state.database.ends_with("driftsync/state.db"));
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.logging.format, "text");
    }

    #[test]
    fn default_config_passes_validation() {
        let errors = Config::default().validate();
        assert!(errors.is_empty(), "unexpected validation errors: {errors:?}");
    }

    #[test]
    fn duration_helpers_convert_units() {
        let cfg = ConfigBuilder::new()
            .sync_debounce_ms(250)
            .sync_longpoll_timeout_secs(7)
            .sync_reindex_interval_days(2)
            .build();
        assert_eq!(cfg.sync.debounce(), Duration::from_millis(250));
        assert_eq!(cfg.sync.longpoll_timeout(), Duration::from_secs(7));
        assert_eq!(cfg.sync.reindex_interval(), chrono::Duration::days(2));
    }

    // -- Loading --

    #[test]
    fn load_from_yaml_file() {
        let yaml = r#"
sync:
  root: /tmp/test-driftsync
  upload: false
  download: true
  debounce_ms: 200
  quiescence_ms: 300
  longpoll_timeout_secs: 10
  reindex_interval_days: 7
  max_path_retries: 5
workers:
  concurrency: 2
  queue_capacity: 128
retry:
  max_retries: 3
  base_delay_ms: 100
  max_delay_ms: 1000
history:
  max_entries: 50
  keep_days: 3
remote:
  path: /mnt/share
  scan_interval_ms: 500
state:
  database: /tmp/state.db
logging:
  level: debug
  format: json
"#;
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        tmp.write_all(yaml.as_bytes()).unwrap();
        tmp.flush().unwrap();

        let cfg = Config::load(tmp.path()).expect("load config");
        assert_eq!(cfg.sync.root, PathBuf::from("/tmp/test-driftsync"));
        assert!(!cfg.sync.upload);
        assert_eq!(cfg.sync.debounce_ms, 200);
        assert_eq!(cfg.sync.quiescence_ms, 300);
        assert_eq!(cfg.sync.max_path_retries, 5);
        assert_eq!(cfg.workers.concurrency, 2);
        assert_eq!(cfg.workers.queue_capacity, 128);
        assert_eq!(cfg.retry.max_delay_ms, 1000);
        assert_eq!(cfg.history.max_entries, 50);
        assert_eq!(cfg.remote.path, PathBuf::from("/mnt/share"));
        assert_eq!(cfg.state.database, PathBuf::from("/tmp/state.db"));
        assert_eq!(cfg.logging.format, "json");
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn load_partial_yaml_fills_defaults() {
        let yaml = "sync:\n  root: /tmp/partial\nlogging:\n  level: warn\n";
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        tmp.write_all(yaml.as_bytes()).unwrap();
        tmp.flush().unwrap();

        let cfg = Config::load(tmp.path()).expect("load config");
        assert_eq!(cfg.sync.root, PathBuf::from("/tmp/partial"));
        assert_eq!(cfg.sync.debounce_ms, 500);
        assert_eq!(cfg.workers.concurrency, 4);
        assert_eq!(cfg.logging.level, "warn");
        assert_eq!(cfg.logging.format, "text");
    }

    #[test]
    fn load_or_default_returns_default_on_missing_file() {
        let cfg = Config::load_or_default(Path::new("/nonexistent/config.yaml"));
        assert_eq!(cfg.sync.debounce_ms, 500);
    }

    #[test]
    fn load_returns_error_on_invalid_yaml() {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        tmp.write_all(b"sync: [not, a, map").unwrap();
        tmp.flush().unwrap();
        assert!(Config::load(tmp.path()).is_err());
    }

    // -- Validation --

    #[test]
    fn validate_catches_zero_values() {
        let cfg = ConfigBuilder::new()
            .sync_debounce_ms(0)
            .workers_concurrency(0)
            .history_max_entries(0)
            .sync_max_sync_errors(0)
            .build();
        let fields: Vec<_> = cfg.validate().into_iter().map(|e| e.field).collect();
        assert!(fields.contains(&"sync.debounce_ms".to_string()));
        assert!(fields.contains(&"sync.max_sync_errors".to_string()));
        assert!(fields.contains(&"workers.concurrency".to_string()));
        assert!(fields.contains(&"history.max_entries".to_string()));
    }

    #[test]
    fn validate_catches_max_delay_below_base() {
        let cfg = ConfigBuilder::new()
            .retry_base_delay_ms(500)
            .retry_max_delay_ms(100)
            .build();
        let errors = cfg.validate();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "retry.max_delay_ms");
    }

    #[test]
    fn validate_catches_relative_root() {
        let cfg = ConfigBuilder::new()
            .sync_root(PathBuf::from("relative/dir"))
            .build();
        assert!(cfg.validate().iter().any(|e| e.field == "sync.root"));
    }

    #[test]
    fn validate_catches_remote_equal_to_root() {
        let cfg = ConfigBuilder::new()
            .sync_root(PathBuf::from("/data/sync"))
            .remote_path(PathBuf::from("/data/sync"))
            .build();
        assert!(cfg.validate().iter().any(|e| e.field == "remote.path"));
    }

    #[test]
    fn validate_catches_invalid_log_level_and_format() {
        let cfg = ConfigBuilder::new()
            .logging_level("verbose")
            .logging_format("xml")
            .build();
        let fields: Vec<_> = cfg.validate().into_iter().map(|e| e.field).collect();
        assert_eq!(fields, vec!["logging.level", "logging.format"]);
    }

    #[test]
    fn validate_accepts_all_valid_log_levels() {
        for level in VALID_LOG_LEVELS {
            let cfg = ConfigBuilder::new().logging_level(*level).build();
            assert!(cfg.validate().is_empty(), "level {level} rejected");
        }
    }

    // -- Builder --

    #[test]
    fn builder_build_validated_fails_for_invalid_config() {
        let result = ConfigBuilder::new().workers_queue_capacity(0).build_validated();
        let errors = result.unwrap_err();
        assert_eq!(errors[0].field, "workers.queue_capacity");
    }

    #[test]
    fn builder_build_validated_succeeds_for_valid_config() {
        let cfg = ConfigBuilder::new()
            .sync_root(PathBuf::from("/tmp/a"))
            .remote_path(PathBuf::from("/tmp/b"))
            .sync_upload(false)
            .build_validated()
            .expect("valid config");
        assert!(!cfg.sync.upload);
    }

    // -- Misc --

    #[test]
    fn default_path_ends_with_config_yaml() {
        let path = Config::default_path();
        assert!(path.ends_with("driftsync/config.yaml"));
    }

    #[test]
    fn expand_home_replaces_tilde_only() {
        let abs = PathBuf::from("/srv/data");
        assert_eq!(expand_home(&abs), abs);
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home(Path::new("~/Sync")), home.join("Sync"));
        }
    }

    #[test]
    fn validation_error_display() {
        let err = ValidationError {
            field: "sync.debounce_ms".into(),
            message: "must be greater than 0".into(),
        };
        assert_eq!(err.to_string(), "sync.debounce_ms: must be greater than 0");
    }
}
