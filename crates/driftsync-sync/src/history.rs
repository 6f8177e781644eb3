//! Bounded history of completed reconciliation outcomes
//!
//! The log keeps the newest `max_entries` outcomes in memory and mirrors
//! every append to an [`IHistoryStore`] so history survives restarts.
//! Persistence failures are logged and never fail the reconciliation that
//! produced the entry.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use driftsync_core::config::HistoryConfig;
use driftsync_core::domain::HistoryEntry;
use driftsync_core::ports::IHistoryStore;
use tracing::{debug, warn};

pub struct HistoryLog {
    store: Arc<dyn IHistoryStore>,
    ring: Mutex<VecDeque<HistoryEntry>>,
    max_entries: usize,
    keep_days: u32,
}

impl HistoryLog {
    pub fn new(store: Arc<dyn IHistoryStore>, config: &HistoryConfig) -> Self {
        Self {
            store,
            ring: Mutex::new(VecDeque::with_capacity(config.max_entries.min(1024))),
            max_entries: config.max_entries.max(1),
            keep_days: config.keep_days,
        }
    }

    /// Applies retention to the store and reloads the ring from it
    pub async fn load(&self) -> anyhow::Result<()> {
        let cutoff = Utc::now() - Duration::days(i64::from(self.keep_days));
        let pruned = self.store.prune(self.max_entries, cutoff).await?;
        let mut recent = self.store.load_recent(self.max_entries).await?;
        recent.reverse();

        debug!(pruned, loaded = recent.len(), "History loaded");
        *self.lock() = recent.into_iter().collect();
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<HistoryEntry>> {
        self.ring.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends one outcome
    pub async fn record(&self, entry: HistoryEntry) {
        if let Err(e) = self.store.append(&entry).await {
            warn!(path = %entry.path, error = %e, "Failed to persist history entry");
        }

        let mut ring = self.lock();
        ring.push_back(entry);
        while ring.len() > self.max_entries {
            ring.pop_front();
        }
    }

    /// Snapshot, newest first
    pub fn recent(&self) -> Vec<HistoryEntry> {
        self.lock().iter().rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub async fn clear(&self) -> anyhow::Result<()> {
        self.store.clear().await?;
        self.lock().clear();
        Ok(())
    }
}
