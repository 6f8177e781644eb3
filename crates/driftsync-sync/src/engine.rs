//! Sync engine
//!
//! [`SyncEngine`] wires the pieces of one daemon instance together and
//! implements [`ISyncControl`] on top of them.
//!
//! ## Session layout
//!
//! ```text
//! FileWatcher ─→ LocalEventPump ─┐
//!                                ├─→ WorkQueue ─→ Dispatcher ─→ Reconciler
//! RemotePoller ──────────────────┘                  (worker pool)
//! ```
//!
//! A session is created by `start_sync` and torn down by `stop_sync`. It owns
//! two cancellation tokens: `cancel` ends everything, `intake` (a child of
//! `cancel`) ends only the watcher and the poller and is what a fatal error
//! trips. Index, exclusions, history and status outlive sessions.
//!
//! ## Startup
//!
//! 1. Load index (an unreadable one is discarded), exclusions and history
//! 2. Start watching the local tree so nothing is missed during catch-up
//! 3. Remote catch-up: delta from the saved cursor, or a full listing diff
//! 4. Local scan against the index for changes made while stopped
//! 5. Continuous long-polling

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use driftsync_core::config::Config;
use driftsync_core::domain::{
    DaemonStatus, ExclusionStatus, FatalError, FatalErrorKind, FileStatus, HistoryEntry,
    IndexEntry, RemotePath, StatusSnapshot, SyncPath,
};
use driftsync_core::ports::{
    IHistoryStore, IIndexStore, ILocalFileSystem, IRemoteStore, ISettingsStore, ISyncControl,
    RemoteError, StatusChange, SyncControlError,
};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::dispatcher::{Dispatcher, PathProbe};
use crate::history::HistoryLog;
use crate::index::{IndexLoad, SyncIndex};
use crate::poller::RemotePoller;
use crate::queue::{WorkItem, WorkQueue};
use crate::reconciler::{Reconciler, SyncContext};
use crate::retry::RetryPolicy;
use crate::scan;
use crate::scheduler::LocalEventPump;
use crate::selective::{self, ExclusionState, TreeGate};
use crate::status::StatusMachine;
use crate::watcher::{watch_limit_fatal, FileWatcher, IgnoreRegistry};
use crate::{error_kind, SyncError};

/// How often a running session checks whether a full reindex is due
const REINDEX_CHECK: Duration = Duration::from_secs(3600);

/// Capacity of the raw watcher channel
const WATCHER_CAPACITY: usize = 4096;

fn control_error(err: anyhow::Error) -> SyncControlError {
    match RemoteError::classify(&err) {
        Some(RemoteError::NotFound(path)) => SyncControlError::NotFound(path.clone()),
        Some(RemoteError::InvalidName(name)) => SyncControlError::InvalidPath(name.clone()),
        _ => SyncControlError::from(err),
    }
}

// ============================================================================
// Session
// ============================================================================

/// Everything that exists only while syncing is started
struct Session {
    ctx: Arc<SyncContext>,
    queue: WorkQueue,
    paused: watch::Sender<bool>,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
    _watcher: Option<FileWatcher>,
}

impl Session {
    fn spawn<F>(&mut self, token: &CancellationToken, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = token.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = fut => {}
            }
        });
    }

    async fn shutdown(mut self) {
        self.cancel.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    error!(error = %e, "Engine task panicked");
                }
            }
        }
    }
}

// ============================================================================
// SyncEngine
// ============================================================================

struct EngineInner {
    config: Config,
    remote: Arc<dyn IRemoteStore>,
    local: Arc<dyn ILocalFileSystem>,
    settings: Arc<dyn ISettingsStore>,
    index: Arc<SyncIndex>,
    exclusions: Arc<ExclusionState>,
    history: Arc<HistoryLog>,
    status: Arc<StatusMachine>,
    ignore: Arc<IgnoreRegistry>,
    gate: TreeGate,
    probe: Arc<PathProbe>,
    root: RwLock<PathBuf>,
    /// Set once the startup catch-up of the current session is done
    caught_up: Arc<watch::Sender<bool>>,
    session: Mutex<Option<Session>>,
}

/// One daemon instance; cheap to clone
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn new(
        config: Config,
        remote: Arc<dyn IRemoteStore>,
        local: Arc<dyn ILocalFileSystem>,
        index_store: Arc<dyn IIndexStore>,
        settings: Arc<dyn ISettingsStore>,
        history_store: Arc<dyn IHistoryStore>,
    ) -> Self {
        let status = Arc::new(
            StatusMachine::new(config.sync.quiescence(), config.sync.max_path_retries)
                .with_error_limit(config.sync.max_sync_errors),
        );
        let history = Arc::new(HistoryLog::new(history_store, &config.history));
        Self {
            inner: Arc::new(EngineInner {
                root: RwLock::new(config.sync.root.clone()),
                remote,
                local,
                index: Arc::new(SyncIndex::new(index_store)),
                exclusions: Arc::new(ExclusionState::new(settings.clone())),
                settings,
                history,
                status,
                ignore: Arc::new(IgnoreRegistry::default()),
                gate: TreeGate::new(),
                probe: Arc::new(PathProbe::default()),
                caught_up: Arc::new(watch::channel(false).0),
                session: Mutex::new(None),
                config,
            }),
        }
    }

    /// Current local root
    pub fn root(&self) -> PathBuf {
        self.inner
            .root
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn set_root(&self, root: PathBuf) {
        *self.inner.root.write().unwrap_or_else(|p| p.into_inner()) = root;
    }

    /// Highest number of reconciliations seen running at once for one path
    pub fn peak_path_concurrency(&self) -> usize {
        self.inner.probe.peak()
    }

    /// Waits until startup catch-up is done and the daemon reports IDLE
    ///
    /// Returns false on timeout.
    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        let status = &self.inner.status;
        let mut generation = status.subscribe();
        let mut caught_up = self.inner.caught_up.subscribe();
        let wait = async {
            loop {
                if *caught_up.borrow_and_update()
                    && status.status() == DaemonStatus::Idle
                    && status.is_quiet()
                {
                    return true;
                }
                tokio::select! {
                    changed = generation.changed() => if changed.is_err() { return false },
                    changed = caught_up.changed() => if changed.is_err() { return false },
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }

    fn context(&self, root: SyncPath) -> Arc<SyncContext> {
        let inner = &self.inner;
        Arc::new(SyncContext {
            root,
            remote: inner.remote.clone(),
            local: inner.local.clone(),
            index: inner.index.clone(),
            exclusions: inner.exclusions.clone(),
            history: inner.history.clone(),
            status: inner.status.clone(),
            ignore: inner.ignore.clone(),
            retry: RetryPolicy::from_config(&inner.config.retry),
            upload: inner.config.sync.upload,
            download: inner.config.sync.download,
        })
    }

    /// Reconciler for the running session, or a detached one while stopped
    async fn reconciler(&self) -> Result<Reconciler> {
        if let Some(session) = self.inner.session.lock().await.as_ref() {
            return Ok(Reconciler::new(session.ctx.clone()));
        }
        let root = SyncPath::new(self.root())?;
        Ok(Reconciler::new(self.context(root)))
    }

    async fn queue_follow_ups(&self, items: Vec<WorkItem>) {
        if items.is_empty() {
            return;
        }
        let queue = self.inner.session.lock().await.as_ref().map(|s| s.queue.clone());
        match queue {
            Some(queue) => {
                if let Err(e) = queue.push_all(items).await {
                    debug!(error = %e, "Follow-ups dropped, session ended");
                }
            }
            None => debug!(count = items.len(), "Not syncing, follow-ups left to the next start"),
        }
    }

    /// Queues a full remote listing diff and a local scan
    #[instrument(skip(self))]
    pub async fn sync_now(&self) -> Result<(), SyncControlError> {
        let (ctx, queue) = {
            let guard = self.inner.session.lock().await;
            let session = guard
                .as_ref()
                .ok_or_else(|| SyncControlError::InvalidState("Syncing is not started".into()))?;
            (session.ctx.clone(), session.queue.clone())
        };
        full_scan(&ctx, &queue, &self.inner.settings)
            .await
            .map_err(control_error)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    async fn resolve_root(&self) -> Result<PathBuf> {
        let root = match self.inner.settings.get_local_root().await? {
            Some(stored) => stored,
            None => {
                let configured = self.root();
                self.inner.settings.set_local_root(&configured).await?;
                configured
            }
        };
        self.set_root(root.clone());
        Ok(root)
    }

    fn fatal(&self, kind: FatalErrorKind, title: &str, message: String) -> SyncControlError {
        self.inner
            .status
            .raise_fatal(FatalError::new(kind, title, message.clone()));
        SyncControlError::InvalidState(message)
    }

    async fn start_session(&self) -> Result<Session, SyncControlError> {
        let inner = &self.inner;
        let config = &inner.config;

        let root = self.resolve_root().await.map_err(control_error)?;
        let root = match tokio::fs::canonicalize(&root).await {
            Ok(canonical) if canonical.is_dir() => {
                self.set_root(canonical.clone());
                canonical
            }
            _ => {
                return Err(self.fatal(
                    FatalErrorKind::LocalRootMissing,
                    "Sync folder missing",
                    format!("The sync folder {} does not exist.", root.display()),
                ))
            }
        };

        let mut full = false;
        match inner.index.load().await {
            Ok(IndexLoad::Loaded(_)) => {}
            Ok(IndexLoad::Discarded) => {
                warn!("Index discarded, running a full reindex");
                full = true;
            }
            Err(e) => {
                return Err(self.fatal(
                    FatalErrorKind::IndexUnreadable,
                    "Sync state unreadable",
                    format!("The sync index could not be read or reset: {e:#}"),
                ))
            }
        }
        inner.exclusions.load().await.map_err(control_error)?;
        inner.history.load().await.map_err(control_error)?;

        let last_reindex = inner.settings.get_last_reindex().await.map_err(control_error)?;
        if last_reindex.map_or(true, |at| Utc::now() - at >= config.sync.reindex_interval()) {
            full = true;
        }

        let ctx = self.context(SyncPath::new(root.clone())?);
        let (queue, receivers) =
            WorkQueue::new(config.workers.queue_capacity, inner.status.clone());
        let (paused_tx, paused_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        let intake = cancel.child_token();

        let watcher = if config.sync.upload {
            let (mut watcher, watcher_rx) =
                FileWatcher::new(WATCHER_CAPACITY).map_err(control_error)?;
            if let Err(e) = watcher.watch(&root) {
                let detail = format!("{e:#}");
                return Err(match e.downcast_ref::<SyncError>() {
                    Some(SyncError::WatchLimitExceeded(_)) => {
                        inner.status.raise_fatal(watch_limit_fatal(&detail));
                        SyncControlError::InvalidState(detail)
                    }
                    _ => self.fatal(
                        FatalErrorKind::LocalRootMissing,
                        "Sync folder unavailable",
                        detail,
                    ),
                });
            }
            Some((watcher, watcher_rx))
        } else {
            info!("Uploads disabled, not watching the local tree");
            None
        };

        let (watcher, watcher_rx) = match watcher {
            Some((w, rx)) => (Some(w), Some(rx)),
            None => (None, None),
        };
        let mut session = Session {
            ctx: ctx.clone(),
            queue: queue.clone(),
            paused: paused_tx,
            cancel: cancel.clone(),
            tasks: JoinSet::new(),
            _watcher: watcher,
        };

        let reconciler = Arc::new(Reconciler::new(ctx.clone()));
        let dispatcher = Dispatcher::new(
            reconciler,
            queue.clone(),
            inner.gate.clone(),
            config.workers.concurrency,
            paused_rx,
            inner.probe.clone(),
        );
        session.spawn(&cancel, dispatcher.run(receivers, cancel.clone()));

        if let Some(watcher_rx) = watcher_rx {
            let pump =
                LocalEventPump::new(ctx.clone(), queue.clone(), watcher_rx, config.sync.debounce());
            session.spawn(&intake, pump.run(intake.clone()));
        }

        inner.caught_up.send_replace(false);
        session.spawn(
            &intake,
            catch_up_then_poll(
                ctx.clone(),
                queue.clone(),
                inner.settings.clone(),
                config.sync.longpoll_timeout(),
                full,
                inner.caught_up.clone(),
                intake.clone(),
            ),
        );

        let status = inner.status.clone();
        let tick = (config.sync.quiescence() / 4).max(Duration::from_millis(10));
        session.spawn(&cancel, async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                status.settle();
            }
        });

        session.spawn(
            &intake,
            reindex_timer(ctx, queue, inner.settings.clone(), config.sync.reindex_interval()),
        );

        info!(root = %root.display(), full, "Sync session started");
        Ok(session)
    }
}

// ============================================================================
// Background tasks
// ============================================================================

/// Queues a full remote resync and a local scan, then records the reindex
async fn full_scan(
    ctx: &Arc<SyncContext>,
    queue: &WorkQueue,
    settings: &Arc<dyn ISettingsStore>,
) -> Result<()> {
    if ctx.download {
        let poller =
            RemotePoller::new(ctx.clone(), queue.clone(), settings.clone(), Duration::ZERO);
        poller.full_resync().await?;
    }
    if ctx.upload {
        let events = scan::local_diff(ctx).await?;
        queue.push_all(events.into_iter().map(WorkItem::rescan)).await?;
    }
    settings.set_last_reindex(Utc::now()).await?;
    Ok(())
}

/// Startup catch-up, then continuous polling
async fn catch_up_then_poll(
    ctx: Arc<SyncContext>,
    queue: WorkQueue,
    settings: Arc<dyn ISettingsStore>,
    longpoll_timeout: Duration,
    full: bool,
    caught_up: Arc<watch::Sender<bool>>,
    intake: CancellationToken,
) {
    let stream = RemotePath::root();
    let poller = RemotePoller::new(ctx.clone(), queue.clone(), settings.clone(), longpoll_timeout);
    let mut failures: u32 = 0;

    let cursor = loop {
        let attempt = async {
            if full {
                full_scan(&ctx, &queue, &settings).await?;
                return settings.get_cursor().await;
            }
            let cursor = if ctx.download {
                Some(poller.catch_up().await?)
            } else {
                None
            };
            if ctx.upload {
                let events = scan::local_diff(&ctx).await?;
                queue.push_all(events.into_iter().map(WorkItem::rescan)).await?;
            }
            Ok::<_, anyhow::Error>(cursor)
        };
        match attempt.await {
            Ok(cursor) => {
                ctx.status.clear_sync_error(&stream.key());
                break cursor;
            }
            Err(e) if queue.is_closed() => {
                debug!(error = %e, "Session ended during catch-up");
                return;
            }
            Err(e) => {
                let delay = ctx.retry.delay_for(failures);
                warn!(error = %e, delay_ms = delay.as_millis() as u64, "Catch-up failed, retrying");
                ctx.status
                    .record_sync_error(&stream, error_kind(&e), &format!("{e:#}"));
                failures = failures.saturating_add(1);
                tokio::time::sleep(delay).await;
            }
        }
    };
    info!("Catch-up complete");
    caught_up.send_replace(true);

    match cursor {
        Some(cursor) if ctx.download => poller.run(cursor, intake).await,
        _ => info!("Downloads disabled, remote poller not started"),
    }
}

/// Runs a full reindex whenever the configured interval has elapsed
async fn reindex_timer(
    ctx: Arc<SyncContext>,
    queue: WorkQueue,
    settings: Arc<dyn ISettingsStore>,
    interval: chrono::Duration,
) {
    let check = interval
        .to_std()
        .unwrap_or(REINDEX_CHECK)
        .min(REINDEX_CHECK)
        .max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval(check);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let due = match settings.get_last_reindex().await {
            Ok(last) => last.map_or(true, |at| Utc::now() - at >= interval),
            Err(e) => {
                warn!(error = %e, "Could not read last reindex time");
                false
            }
        };
        if due {
            info!("Periodic full reindex");
            if let Err(e) = full_scan(&ctx, &queue, &settings).await {
                warn!(error = %e, "Periodic reindex failed");
            }
        }
    }
}

// ============================================================================
// ISyncControl
// ============================================================================

#[async_trait::async_trait]
impl ISyncControl for SyncEngine {
    async fn status(&self) -> StatusSnapshot {
        self.inner.status.snapshot()
    }

    async fn status_change_longpoll(&self, baseline: u64, timeout: Duration) -> StatusChange {
        self.inner.status.longpoll(baseline, timeout).await
    }

    #[instrument(skip(self))]
    async fn start_sync(&self) -> Result<(), SyncControlError> {
        let mut guard = self.inner.session.lock().await;
        let status = self.inner.status.status();
        if guard.is_some() {
            if status != DaemonStatus::Error {
                debug!(status = %status, "Already started");
                return Ok(());
            }
            // Restart after a fatal error
            if let Some(old) = guard.take() {
                old.shutdown().await;
            }
            self.inner.status.reset_load();
        }

        self.inner.status.clear_fatal_errors();
        self.inner.status.transition(DaemonStatus::Starting)?;
        match self.start_session().await {
            Ok(session) => {
                *guard = Some(session);
                // A fatal error may already have been raised by a session task
                if let Err(e) = self.inner.status.transition(DaemonStatus::Idle) {
                    warn!(error = %e, "Session started but not running");
                }
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Failed to start syncing");
                if self.inner.status.status() == DaemonStatus::Starting {
                    self.inner.status.transition(DaemonStatus::Stopped)?;
                }
                Err(e)
            }
        }
    }

    #[instrument(skip(self))]
    async fn stop_sync(&self) -> Result<(), SyncControlError> {
        let session = self.inner.session.lock().await.take();
        if let Some(session) = session {
            session.shutdown().await;
        }
        self.inner.status.reset_load();
        self.inner.status.transition(DaemonStatus::Stopped)?;
        Ok(())
    }

    async fn pause_sync(&self) -> Result<(), SyncControlError> {
        let guard = self.inner.session.lock().await;
        let session = guard
            .as_ref()
            .ok_or_else(|| SyncControlError::InvalidState("Syncing is not started".into()))?;
        self.inner.status.transition(DaemonStatus::Paused)?;
        session.paused.send_replace(true);
        info!("Syncing paused");
        Ok(())
    }

    async fn resume_sync(&self) -> Result<(), SyncControlError> {
        let guard = self.inner.session.lock().await;
        let session = guard
            .as_ref()
            .ok_or_else(|| SyncControlError::InvalidState("Syncing is not started".into()))?;
        match self.inner.status.status() {
            DaemonStatus::Paused => {}
            DaemonStatus::Idle | DaemonStatus::Syncing => return Ok(()),
            other => {
                return Err(SyncControlError::InvalidState(format!(
                    "Cannot resume while {other}"
                )))
            }
        }
        session.paused.send_replace(false);
        self.inner.status.transition(DaemonStatus::Idle)?;
        info!("Syncing resumed");
        Ok(())
    }

    async fn get_file_status(&self, local_path: &Path) -> FileStatus {
        if !self.inner.status.status().is_running() {
            return FileStatus::Unwatched;
        }
        let Ok(root) = SyncPath::new(self.root()) else {
            return FileStatus::Unwatched;
        };
        let Ok(path) = root.remote_for(local_path) else {
            return FileStatus::Unwatched;
        };
        if tokio::fs::symlink_metadata(local_path).await.is_err()
            || self.inner.exclusions.is_excluded(&path)
        {
            return FileStatus::Unwatched;
        }
        if self.inner.status.has_error_at_or_below(&path.key()) {
            FileStatus::Error
        } else {
            FileStatus::Synced
        }
    }

    #[instrument(skip(self))]
    async fn exclude_item(&self, path: &RemotePath) -> Result<(), SyncControlError> {
        if path.is_root() {
            return Err(SyncControlError::InvalidPath("The root cannot be excluded".into()));
        }
        let reconciler = self.reconciler().await.map_err(control_error)?;
        selective::exclude(&reconciler, &self.inner.gate, path)
            .await
            .map_err(control_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn include_item(&self, path: &RemotePath) -> Result<(), SyncControlError> {
        let reconciler = self.reconciler().await.map_err(control_error)?;
        let report = selective::include(&reconciler, &self.inner.gate, path)
            .await
            .map_err(control_error)?;
        self.queue_follow_ups(report.follow_ups.into_iter().map(WorkItem::rescan).collect())
            .await;
        Ok(())
    }

    async fn excluded_items(&self) -> Vec<RemotePath> {
        self.inner.exclusions.snapshot().paths().to_vec()
    }

    #[instrument(skip(self, paths), fields(count = paths.len()))]
    async fn set_excluded_items(&self, paths: Vec<RemotePath>) -> Result<(), SyncControlError> {
        if paths.iter().any(RemotePath::is_root) {
            return Err(SyncControlError::InvalidPath("The root cannot be excluded".into()));
        }
        let reconciler = self.reconciler().await.map_err(control_error)?;
        let report = selective::set_excluded_items(&reconciler, &self.inner.gate, paths)
            .await
            .map_err(control_error)?;
        self.queue_follow_ups(report.follow_ups.into_iter().map(WorkItem::rescan).collect())
            .await;
        Ok(())
    }

    async fn excluded_status(
        &self,
        path: &RemotePath,
    ) -> Result<ExclusionStatus, SyncControlError> {
        let exists = self
            .inner
            .remote
            .get_metadata(path)
            .await
            .map_err(control_error)?
            .is_some();
        if !exists && !path.is_root() {
            return Err(SyncControlError::NotFound(path.to_string()));
        }
        Ok(self.inner.exclusions.status(path))
    }

    async fn history(&self) -> Vec<HistoryEntry> {
        self.inner.history.recent()
    }

    async fn get_index(&self) -> Vec<IndexEntry> {
        self.inner.index.all().await
    }

    async fn activity(&self) -> Vec<RemotePath> {
        self.inner.status.activity()
    }

    async fn idle_time(&self) -> Duration {
        self.inner.status.idle_time()
    }

    async fn clear_sync_errors(&self) {
        self.inner.status.clear_sync_errors();
    }

    #[instrument(skip(self))]
    async fn reset_sync_state(&self) -> Result<(), SyncControlError> {
        let guard = self.inner.session.lock().await;
        if guard.is_some() || self.inner.status.status() != DaemonStatus::Stopped {
            return Err(SyncControlError::InvalidState(
                "Sync state can only be reset while stopped".into(),
            ));
        }
        self.inner.index.clear().await.map_err(control_error)?;
        self.inner.settings.set_cursor(None).await.map_err(control_error)?;
        self.inner.history.clear().await.map_err(control_error)?;
        self.inner.status.clear_sync_errors();
        info!("Sync state reset");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn rebuild_index(&self) -> Result<(), SyncControlError> {
        let was_running = self.inner.session.lock().await.is_some();
        self.stop_sync().await?;
        self.inner.index.clear().await.map_err(control_error)?;
        self.inner.settings.set_cursor(None).await.map_err(control_error)?;
        info!("Index cleared for rebuild");
        if was_running {
            self.start_sync().await?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn move_local_root(&self, new_root: PathBuf) -> Result<(), SyncControlError> {
        let target = SyncPath::new(new_root)?.into_path_buf();
        let current = self.resolve_root().await.map_err(control_error)?;
        if target == current {
            return Ok(());
        }
        if tokio::fs::symlink_metadata(&target).await.is_ok() {
            return Err(SyncControlError::AlreadyExists(target.display().to_string()));
        }

        let was_running = self.inner.session.lock().await.is_some();
        if was_running {
            self.stop_sync().await?;
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))
                .map_err(control_error)?;
        }
        tokio::fs::rename(&current, &target)
            .await
            .with_context(|| {
                format!("Failed to move {} to {}", current.display(), target.display())
            })
            .map_err(control_error)?;
        self.inner
            .settings
            .set_local_root(&target)
            .await
            .map_err(control_error)?;
        self.set_root(target.clone());
        info!(from = %current.display(), to = %target.display(), "Local root moved");

        if was_running {
            self.start_sync().await?;
        }
        Ok(())
    }
}
