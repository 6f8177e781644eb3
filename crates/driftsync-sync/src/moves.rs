//! Move detection by correlating deletions with additions
//!
//! Neither replica reports moves reliably: the remote change stream only
//! knows deletions and upserts, and the kernel loses the pairing when an item
//! crosses a watch boundary. A deletion is therefore held for a short window;
//! an addition with the same content (or the same path in different casing)
//! arriving inside that window turns the pair into a single move.

use std::time::{Duration, Instant};

use driftsync_core::domain::{ContentHash, RemotePath};
use tracing::debug;

struct PendingDelete {
    path: RemotePath,
    hash: Option<ContentHash>,
    at: Instant,
}

pub struct MoveCorrelator {
    window: Duration,
    pending: Vec<PendingDelete>,
}

impl MoveCorrelator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: Vec::new(),
        }
    }

    /// Holds a deletion; `hash` is the last indexed content, `None` for folders
    pub fn on_deleted(&mut self, path: RemotePath, hash: Option<ContentHash>) {
        let key = path.key();
        self.pending.retain(|p| p.path.key() != key);
        self.pending.push(PendingDelete {
            path,
            hash,
            at: Instant::now(),
        });
    }

    /// Pairs an addition with a held deletion
    ///
    /// Returns the source path when the addition completes a move.
    pub fn on_added(
        &mut self,
        path: &RemotePath,
        hash: Option<&ContentHash>,
    ) -> Option<RemotePath> {
        let key = path.key();
        let position = self
            .pending
            .iter()
            .position(|p| p.path.key() == key)
            .or_else(|| {
                let hash = hash?;
                self.pending
                    .iter()
                    .position(|p| p.hash.as_ref() == Some(hash))
            })?;

        let source = self.pending.remove(position).path;
        debug!(from = %source, to = %path, "Correlated deletion and addition into a move");
        Some(source)
    }

    /// Releases deletions whose window has passed, oldest first
    pub fn expire(&mut self, now: Instant) -> Vec<RemotePath> {
        let window = self.window;
        let mut expired = Vec::new();
        self.pending.retain(|p| {
            if now.duration_since(p.at) >= window {
                expired.push(p.path.clone());
                false
            } else {
                true
            }
        });
        expired
    }

    /// Releases every held deletion
    pub fn flush(&mut self) -> Vec<RemotePath> {
        self.pending.drain(..).map(|p| p.path).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
