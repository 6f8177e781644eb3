//! Remote poller - turns the remote change stream into queued sync events
//!
//! ## Flow
//!
//! ```text
//! IRemoteStore::longpoll ──→ list_changes ──→ MoveCorrelator ──→ WorkQueue
//!        │                        │
//!        └── CursorReset ─────────┴──→ full listing diffed against the index
//! ```
//!
//! The cursor is persisted after the events of a page are queued. Transient
//! failures are retried with backoff and show up as a sync error on `/`
//! until the stream recovers; they are never fatal.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use driftsync_core::domain::{Cursor, EventSource, RemotePath, SyncEvent};
use driftsync_core::ports::{ISettingsStore, RemoteChange, RemoteError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error_kind;
use crate::moves::MoveCorrelator;
use crate::queue::{WorkItem, WorkQueue};
use crate::reconciler::SyncContext;
use crate::retry::with_retry;
use crate::scan;

/// Window in which a remote deletion can pair with an upsert into a move
const MOVE_WINDOW: Duration = Duration::from_secs(2);

pub struct RemotePoller {
    ctx: Arc<SyncContext>,
    queue: WorkQueue,
    settings: Arc<dyn ISettingsStore>,
    longpoll_timeout: Duration,
}

impl RemotePoller {
    pub fn new(
        ctx: Arc<SyncContext>,
        queue: WorkQueue,
        settings: Arc<dyn ISettingsStore>,
        longpoll_timeout: Duration,
    ) -> Self {
        Self {
            ctx,
            queue,
            settings,
            longpoll_timeout,
        }
    }

    /// Queues everything that changed remotely since the saved cursor
    ///
    /// Without a usable cursor this is a full listing diff. Returns the
    /// cursor to continue from.
    pub async fn catch_up(&self) -> Result<Cursor> {
        match self.settings.get_cursor().await? {
            Some(cursor) => match self.drain(cursor).await {
                Err(e) if matches!(RemoteError::classify(&e), Some(RemoteError::CursorReset)) => {
                    warn!("Saved cursor is stale, falling back to a full listing");
                    self.full_resync().await
                }
                other => other,
            },
            None => self.full_resync().await,
        }
    }

    /// Full remote listing diffed against the index
    ///
    /// The cursor is taken before listing so nothing between the two is lost.
    pub async fn full_resync(&self) -> Result<Cursor> {
        let remote = &self.ctx.remote;
        let cursor = with_retry(&self.ctx.retry, "latest_cursor", || remote.latest_cursor()).await?;
        let events = scan::remote_diff(&self.ctx).await?;
        info!(events = events.len(), "Queuing full remote resync");
        self.queue
            .push_all(events.into_iter().map(WorkItem::rescan))
            .await?;
        self.settings.set_cursor(Some(&cursor)).await?;
        Ok(cursor)
    }

    /// Reads pages until the stream has nothing more, queuing every change
    pub async fn drain(&self, mut cursor: Cursor) -> Result<Cursor> {
        let remote = &self.ctx.remote;
        let mut correlator = MoveCorrelator::new(MOVE_WINDOW);
        loop {
            let page = with_retry(&self.ctx.retry, "list_changes", || remote.list_changes(&cursor))
                .await?;
            let mut events = Vec::with_capacity(page.changes.len());
            for change in page.changes {
                if let Some(event) = self.correlate(&mut correlator, change).await {
                    events.push(event);
                }
            }
            if !page.has_more {
                events.extend(
                    correlator
                        .flush()
                        .into_iter()
                        .map(|path| SyncEvent::deleted(path, EventSource::Remote)),
                );
            }

            let events: Vec<_> = events
                .into_iter()
                .filter(|e| !e.paths().iter().all(|p| self.ctx.exclusions.is_excluded(p)))
                .collect();
            if !events.is_empty() {
                debug!(count = events.len(), "Remote changes queued");
            }
            self.queue
                .push_all(events.into_iter().map(WorkItem::observed))
                .await?;

            cursor = page.cursor;
            self.settings.set_cursor(Some(&cursor)).await?;
            if !page.has_more {
                return Ok(cursor);
            }
        }
    }

    async fn correlate(
        &self,
        correlator: &mut MoveCorrelator,
        change: RemoteChange,
    ) -> Option<SyncEvent> {
        match change {
            RemoteChange::Deleted { path } => {
                let hash = self
                    .ctx
                    .index
                    .get(&path.key())
                    .await
                    .and_then(|e| e.content_hash().cloned());
                correlator.on_deleted(path, hash);
                None
            }
            RemoteChange::Upserted(meta) => {
                let source = correlator.on_added(&meta.path, meta.content_hash.as_ref());
                Some(match source {
                    Some(from) if from == meta.path => {
                        SyncEvent::changed(meta.path, EventSource::Remote)
                    }
                    Some(from) => SyncEvent::moved(from, meta.path, EventSource::Remote),
                    None if self.ctx.index.contains(&meta.path.key()).await => {
                        SyncEvent::changed(meta.path, EventSource::Remote)
                    }
                    None => SyncEvent::added(meta.path, EventSource::Remote),
                })
            }
        }
    }

    /// Long-polls and drains until cancelled
    pub async fn run(self, mut cursor: Cursor, cancel: CancellationToken) {
        info!(cursor = %cursor, "Remote poller starting");
        let stream = RemotePath::root();
        let mut failures: u32 = 0;

        loop {
            let remote = &self.ctx.remote;
            let step = tokio::select! {
                _ = cancel.cancelled() => break,
                polled = remote.longpoll(&cursor, self.longpoll_timeout) => polled,
            };

            let outcome = match step {
                Ok(false) => Ok(cursor.clone()),
                Ok(true) => tokio::select! {
                    _ = cancel.cancelled() => break,
                    drained = self.drain(cursor.clone()) => drained,
                },
                Err(e) => Err(e),
            };

            match outcome {
                Ok(next) => {
                    if failures > 0 {
                        info!("Remote change stream recovered");
                        self.ctx.status.clear_sync_error(&stream.key());
                    }
                    failures = 0;
                    cursor = next;
                }
                Err(e) if matches!(RemoteError::classify(&e), Some(RemoteError::CursorReset)) => {
                    warn!("Cursor invalidated by the remote, running a full resync");
                    match self.full_resync().await {
                        Ok(next) => cursor = next,
                        Err(e) => failures = self.backoff(&stream, &e, failures, &cancel).await,
                    }
                }
                Err(e) if self.queue.is_closed() => {
                    debug!(error = %e, "Work queue closed, poller exiting");
                    break;
                }
                Err(e) => failures = self.backoff(&stream, &e, failures, &cancel).await,
            }
        }

        info!("Remote poller stopped");
    }

    /// Records a stream failure and waits before the next attempt
    async fn backoff(
        &self,
        stream: &RemotePath,
        err: &anyhow::Error,
        failures: u32,
        cancel: &CancellationToken,
    ) -> u32 {
        let delay = self.ctx.retry.delay_for(failures);
        warn!(
            error = %err,
            failures,
            delay_ms = delay.as_millis() as u64,
            "Remote change stream failed"
        );
        self.ctx
            .status
            .record_sync_error(stream, error_kind(err), &format!("{err:#}"));
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
        failures.saturating_add(1)
    }
}
