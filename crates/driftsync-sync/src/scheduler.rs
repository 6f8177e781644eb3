//! Local event pump - turns watcher output into queued sync events
//!
//! ## Flow
//!
//! ```text
//! FileWatcher ──→ mpsc::Receiver ──→ filter ──→ DebouncedChangeQueue
//!                                                     │ settled
//!                                               MoveCorrelator ──→ WorkQueue
//! ```
//!
//! Events are dropped before debouncing when they belong to temporary
//! files, to writes the engine made itself, or to excluded subtrees. While
//! anything is held in the debounce queue or the correlator the pump keeps
//! one unit of load on the status machine, so the daemon does not report
//! IDLE with changes still in the pipeline.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use driftsync_core::domain::{
    EventSource, FatalError, FatalErrorKind, ItemType, RemotePath, SyncEvent,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::filesystem::is_temp_name;
use crate::moves::MoveCorrelator;
use crate::queue::{WorkItem, WorkQueue};
use crate::reconciler::SyncContext;
use crate::scan;
use crate::watcher::{watch_limit_fatal, ChangeEvent, DebouncedChangeQueue, WatcherMessage};

/// Window in which a local deletion can pair with a creation into a move
const MOVE_WINDOW: Duration = Duration::from_secs(1);

pub struct LocalEventPump {
    ctx: Arc<SyncContext>,
    queue: WorkQueue,
    watcher_rx: mpsc::Receiver<WatcherMessage>,
    debounce: DebouncedChangeQueue,
    moves: MoveCorrelator,
    poll_interval: Duration,
    holding: bool,
}

impl LocalEventPump {
    pub fn new(
        ctx: Arc<SyncContext>,
        queue: WorkQueue,
        watcher_rx: mpsc::Receiver<WatcherMessage>,
        debounce_delay: Duration,
    ) -> Self {
        info!(
            debounce_ms = debounce_delay.as_millis() as u64,
            "Creating local event pump"
        );
        let poll_interval =
            (debounce_delay / 4).clamp(Duration::from_millis(10), Duration::from_millis(250));
        Self {
            ctx,
            queue,
            watcher_rx,
            debounce: DebouncedChangeQueue::new(debounce_delay),
            moves: MoveCorrelator::new(MOVE_WINDOW),
            poll_interval,
            holding: false,
        }
    }

    /// Main loop; `intake` is cancelled on stop and by fatal errors
    pub async fn run(mut self, intake: CancellationToken) {
        info!(root = %self.ctx.root, "Local event pump starting");
        let mut poll_timer = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = intake.cancelled() => break,

                // Branch 1: raw watcher output
                message = self.watcher_rx.recv() => match message {
                    Some(WatcherMessage::Change(change)) => self.accept(change),
                    Some(WatcherMessage::Rescan) => {
                        warn!("Watcher lost events, rescanning local tree");
                        self.rescan().await;
                    }
                    Some(WatcherMessage::WatchLimitExceeded(detail)) => {
                        self.ctx.status.raise_fatal(watch_limit_fatal(&detail));
                        intake.cancel();
                        break;
                    }
                    Some(WatcherMessage::Failed(detail)) => {
                        warn!(error = %detail, "Watcher reported an error");
                        if self.root_missing().await {
                            self.root_gone(&intake);
                            break;
                        }
                    }
                    None => {
                        info!("Watcher channel closed");
                        break;
                    }
                },

                // Branch 2: settle the debounce queue and expire held deletions
                _ = poll_timer.tick() => {
                    let settled = self.debounce.poll();
                    if !settled.is_empty() {
                        debug!(count = settled.len(), "Settled local changes");
                    }
                    let root_deleted = settled.iter().any(|c| self.is_root_deletion(c));
                    if root_deleted && self.root_missing().await {
                        self.root_gone(&intake);
                        break;
                    }
                    let mut events = Vec::new();
                    for change in settled {
                        events.extend(self.translate(change).await);
                    }
                    events.extend(
                        self.moves
                            .expire(Instant::now())
                            .into_iter()
                            .map(|path| SyncEvent::deleted(path, EventSource::Local)),
                    );
                    let items = events.into_iter().map(WorkItem::observed);
                    if self.queue.push_all(items).await.is_err() {
                        break;
                    }
                    self.ctx.ignore.purge_expired();
                    self.update_hold();
                }
            }
        }

        if self.holding {
            self.ctx.status.dropped(&[]);
        }
        info!("Local event pump stopped");
    }

    // ========================================================================
    // Filtering
    // ========================================================================

    fn accept(&mut self, change: ChangeEvent) {
        if self.ctx.ignore.consume(&change) {
            debug!(event = ?change, "Own write observed");
            return;
        }
        let wanted = match &change {
            ChangeEvent::Renamed { old, new } => self.wanted(old) || self.wanted(new),
            other => self.wanted(other.path()) || self.is_root_deletion(other),
        };
        if wanted {
            debug!(event = ?change, "Local change");
            self.debounce.push(change);
            self.update_hold();
        }
    }

    /// Inside the root, not a temp file, not excluded
    fn wanted(&self, path: &Path) -> bool {
        if path.file_name().and_then(|n| n.to_str()).is_some_and(is_temp_name) {
            return false;
        }
        match self.remote_path(path) {
            Some(remote) => !remote.is_root() && !self.ctx.exclusions.is_excluded(&remote),
            None => false,
        }
    }

    fn remote_path(&self, path: &Path) -> Option<RemotePath> {
        self.ctx.root.remote_for(path).ok()
    }

    fn is_root_deletion(&self, change: &ChangeEvent) -> bool {
        matches!(change, ChangeEvent::Deleted(p) if p == self.ctx.root.as_path())
    }

    fn update_hold(&mut self) {
        let busy = !self.debounce.is_empty() || !self.moves.is_empty();
        if busy && !self.holding {
            self.ctx.status.enqueued(&[]);
        } else if !busy && self.holding {
            self.ctx.status.dropped(&[]);
        }
        self.holding = busy;
    }

    // ========================================================================
    // Translation
    // ========================================================================

    async fn translate(&mut self, change: ChangeEvent) -> Option<SyncEvent> {
        match change {
            ChangeEvent::Created(path) => {
                let remote = self.wanted_path(&path)?;
                let hash = match self.ctx.local.get_state(&path).await {
                    Ok(state) if state.item_type() == Some(ItemType::File) => {
                        self.ctx.local.compute_hash(&path).await.ok()
                    }
                    _ => None,
                };
                Some(match self.moves.on_added(&remote, hash.as_ref()) {
                    Some(from) if from == remote => SyncEvent::changed(remote, EventSource::Local),
                    Some(from) => SyncEvent::moved(from, remote, EventSource::Local),
                    None => SyncEvent::added(remote, EventSource::Local),
                })
            }
            ChangeEvent::Modified(path) => {
                let remote = self.wanted_path(&path)?;
                Some(SyncEvent::changed(remote, EventSource::Local))
            }
            ChangeEvent::Deleted(path) => {
                let remote = self.wanted_path(&path)?;
                let hash = self
                    .ctx
                    .index
                    .get(&remote.key())
                    .await
                    .and_then(|e| e.content_hash().cloned());
                self.moves.on_deleted(remote, hash);
                None
            }
            ChangeEvent::Renamed { old, new } => self.translate_rename(old, new),
        }
    }

    fn wanted_path(&self, path: &Path) -> Option<RemotePath> {
        if !self.wanted(path) {
            return None;
        }
        self.remote_path(path)
    }

    fn translate_rename(&mut self, old: PathBuf, new: PathBuf) -> Option<SyncEvent> {
        let old_is_temp = old
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(is_temp_name);
        let to = self.wanted_path(&new);
        if old_is_temp {
            // Editors save by renaming a scratch file over the target
            return to.map(|path| SyncEvent::changed(path, EventSource::Local));
        }
        match (self.wanted_path(&old), to) {
            (Some(from), Some(to)) => Some(SyncEvent::moved(from, to, EventSource::Local)),
            (Some(from), None) => Some(SyncEvent::deleted(from, EventSource::Local)),
            (None, Some(to)) => Some(SyncEvent::added(to, EventSource::Local)),
            (None, None) => None,
        }
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    async fn rescan(&mut self) {
        match scan::local_diff(&self.ctx).await {
            Ok(events) => {
                let items = events.into_iter().map(WorkItem::rescan);
                if let Err(e) = self.queue.push_all(items).await {
                    debug!(error = %e, "Queue closed during rescan");
                }
            }
            Err(e) => warn!(error = %e, "Local rescan failed"),
        }
    }

    async fn root_missing(&self) -> bool {
        tokio::fs::metadata(self.ctx.root.as_path()).await.is_err()
    }

    fn root_gone(&self, intake: &CancellationToken) {
        error!(root = %self.ctx.root, "Sync root disappeared");
        self.ctx.status.raise_fatal(FatalError::new(
            FatalErrorKind::LocalRootMissing,
            "Sync folder missing",
            format!(
                "The folder {} was moved or deleted. \
                 Restore it or choose a new location, then restart syncing.",
                self.ctx.root
            ),
        ));
        intake.cancel();
    }
}
