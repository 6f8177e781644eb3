//! Bounded work queues between event sources and the dispatcher
//!
//! Local and remote events travel on separate channels so that a burst on
//! one side cannot starve the other. Both channels are bounded; producers
//! wait when the dispatcher falls behind.

use std::sync::Arc;

use anyhow::Result;
use driftsync_core::domain::SyncEvent;
use tokio::sync::mpsc;
use tracing::debug;

use crate::status::StatusMachine;

/// Why an event entered the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Reported by the watcher or the change stream
    Observed,
    /// Produced by a full scan or a follow-up of another reconciliation
    Rescan,
    /// Re-attempt after a failure
    Retry,
}

#[derive(Debug, Clone)]
pub struct WorkItem {
    pub event: SyncEvent,
    pub trigger: Trigger,
}

impl WorkItem {
    pub fn observed(event: SyncEvent) -> Self {
        Self {
            event,
            trigger: Trigger::Observed,
        }
    }

    pub fn rescan(event: SyncEvent) -> Self {
        Self {
            event,
            trigger: Trigger::Rescan,
        }
    }

    pub fn retry(event: SyncEvent) -> Self {
        Self {
            event,
            trigger: Trigger::Retry,
        }
    }
}

/// Producer side, cheap to clone
#[derive(Clone)]
pub struct WorkQueue {
    local: mpsc::Sender<WorkItem>,
    remote: mpsc::Sender<WorkItem>,
    status: Arc<StatusMachine>,
}

/// Consumer side, owned by the dispatcher
pub struct WorkReceivers {
    pub local: mpsc::Receiver<WorkItem>,
    pub remote: mpsc::Receiver<WorkItem>,
}

impl WorkQueue {
    pub fn new(capacity: usize, status: Arc<StatusMachine>) -> (Self, WorkReceivers) {
        let (local_tx, local_rx) = mpsc::channel(capacity.max(1));
        let (remote_tx, remote_rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                local: local_tx,
                remote: remote_tx,
                status,
            },
            WorkReceivers {
                local: local_rx,
                remote: remote_rx,
            },
        )
    }

    /// Queues an item, waiting for capacity
    ///
    /// # Errors
    /// Fails when the dispatcher is gone (engine stopped).
    pub async fn push(&self, item: WorkItem) -> Result<()> {
        let paths: Vec<_> = item.event.paths().into_iter().cloned().collect();
        let refs: Vec<_> = paths.iter().collect();
        self.status.enqueued(&refs);
        debug!(
            change = ?item.event.change,
            source = %item.event.source,
            trigger = ?item.trigger,
            "Queued"
        );

        let sender = match item.event.source {
            driftsync_core::domain::EventSource::Local => &self.local,
            driftsync_core::domain::EventSource::Remote => &self.remote,
        };
        if sender.send(item).await.is_err() {
            self.status.dropped(&refs);
            anyhow::bail!("Work queue closed");
        }
        Ok(())
    }

    /// Queues every item in order
    pub async fn push_all<I>(&self, items: I) -> Result<()>
    where
        I: IntoIterator<Item = WorkItem>,
    {
        for item in items {
            self.push(item).await?;
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.local.is_closed() || self.remote.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use driftsync_core::domain::{DaemonStatus, EventSource, RemotePath};

    use super::*;

    fn rp(s: &str) -> RemotePath {
        RemotePath::new(s.to_string()).unwrap()
    }

    #[tokio::test]
    async fn test_push_routes_by_source_and_counts_load() {
        let status = Arc::new(StatusMachine::new(Duration::ZERO, 3));
        status.transition(DaemonStatus::Starting).unwrap();
        let (queue, mut rx) = WorkQueue::new(4, status.clone());

        queue
            .push(WorkItem::observed(SyncEvent::added(rp("/a"), EventSource::Local)))
            .await
            .unwrap();
        queue
            .push(WorkItem::rescan(SyncEvent::moved(
                rp("/b"),
                rp("/c"),
                EventSource::Remote,
            )))
            .await
            .unwrap();

        assert_eq!(status.snapshot().queued, 2);
        assert_eq!(status.activity(), vec![rp("/a"), rp("/b"), rp("/c")]);

        let local = rx.local.recv().await.unwrap();
        assert_eq!(local.event.primary_path(), &rp("/a"));
        let remote = rx.remote.recv().await.unwrap();
        assert_eq!(remote.trigger, Trigger::Rescan);
    }

    #[tokio::test]
    async fn test_push_after_close_is_dropped() {
        let status = Arc::new(StatusMachine::new(Duration::ZERO, 3));
        let (queue, rx) = WorkQueue::new(1, status.clone());
        drop(rx);

        let result = queue
            .push(WorkItem::observed(SyncEvent::added(rp("/a"), EventSource::Local)))
            .await;
        assert!(result.is_err());
        assert!(status.is_quiet());
        assert!(status.activity().is_empty());
    }
}
