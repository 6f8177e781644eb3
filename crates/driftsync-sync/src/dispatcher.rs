//! Worker pool draining the local and remote queues
//!
//! The dispatcher owns both receivers and a backlog. An item starts only when
//! no in-flight item touches the same path, an ancestor or a descendant of
//! it; otherwise it waits in the backlog behind the running one, keeping
//! per-path arrival order. Follow-ups produced by a reconciliation go to the
//! backlog directly so a worker never blocks on a full queue.
//!
//! Failed items are recorded as sync errors and re-queued after a backoff
//! until their retry budget is spent; from then on only a freshly observed
//! change runs them again.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use dashmap::DashMap;
use driftsync_core::domain::{PathKey, RemotePath};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::queue::{Trigger, WorkItem, WorkQueue, WorkReceivers};
use crate::reconciler::{ReconcileReport, Reconciler};
use crate::selective::TreeGate;

/// Items held back per worker before the dispatcher stops reading the queues
const BACKLOG_PER_WORKER: usize = 16;

// ============================================================================
// PathProbe
// ============================================================================

/// Counts reconciliations running per path and remembers the maximum
#[derive(Default)]
pub struct PathProbe {
    running: DashMap<PathKey, usize>,
    peak: AtomicUsize,
}

impl PathProbe {
    fn enter(self: &Arc<Self>, keys: Vec<PathKey>) -> ProbeGuard {
        for key in &keys {
            let mut count = self.running.entry(key.clone()).or_insert(0);
            *count += 1;
            self.peak.fetch_max(*count, Ordering::SeqCst);
        }
        ProbeGuard {
            probe: self.clone(),
            keys,
        }
    }

    /// Highest number of simultaneous reconciliations seen for one path
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct ProbeGuard {
    probe: Arc<PathProbe>,
    keys: Vec<PathKey>,
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        for key in &self.keys {
            self.probe.running.remove_if_mut(key, |_, count| {
                *count = count.saturating_sub(1);
                *count == 0
            });
        }
    }
}

/// Aborts the wrapped task when dropped
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

type Finished = (u64, WorkItem, anyhow::Result<ReconcileReport>);

pub struct Dispatcher {
    reconciler: Arc<Reconciler>,
    queue: WorkQueue,
    gate: TreeGate,
    concurrency: usize,
    paused: watch::Receiver<bool>,
    probe: Arc<PathProbe>,
}

fn overlaps(a: &PathKey, b: &PathKey) -> bool {
    a.is_equal_or_descendant_of(b) || b.is_descendant_of(a)
}

fn keys_of(item: &WorkItem) -> Vec<PathKey> {
    item.event.paths().into_iter().map(RemotePath::key).collect()
}

impl Dispatcher {
    pub fn new(
        reconciler: Arc<Reconciler>,
        queue: WorkQueue,
        gate: TreeGate,
        concurrency: usize,
        paused: watch::Receiver<bool>,
        probe: Arc<PathProbe>,
    ) -> Self {
        Self {
            reconciler,
            queue,
            gate,
            concurrency: concurrency.max(1),
            paused,
            probe,
        }
    }

    /// Runs until `cancel` fires or both queues close
    pub async fn run(mut self, mut receivers: WorkReceivers, cancel: CancellationToken) {
        info!(concurrency = self.concurrency, "Dispatcher starting");
        let status = self.reconciler.context().status.clone();
        let mut backlog: VecDeque<WorkItem> = VecDeque::new();
        let mut running: HashMap<u64, Vec<PathKey>> = HashMap::new();
        let mut tasks: JoinSet<Finished> = JoinSet::new();
        let mut retries: JoinSet<()> = JoinSet::new();
        let mut next_id: u64 = 0;
        let mut local_open = true;
        let mut remote_open = true;
        let max_backlog = self.concurrency * BACKLOG_PER_WORKER;

        loop {
            let paused = *self.paused.borrow();
            if !paused {
                self.start_ready(&mut backlog, &mut running, &mut tasks, &mut next_id);
            }
            if !local_open && !remote_open && backlog.is_empty() && tasks.is_empty() {
                break;
            }
            let reading = !paused && backlog.len() < max_backlog;

            tokio::select! {
                _ = cancel.cancelled() => break,

                changed = self.paused.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    debug!(paused = *self.paused.borrow(), "Dispatcher pause state changed");
                }

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => match joined {
                    Ok((id, item, result)) => {
                        running.remove(&id);
                        self.complete(item, result, &mut backlog, &mut retries, &cancel);
                    }
                    Err(e) => warn!(error = %e, "Worker task ended abnormally"),
                },

                Some(_) = retries.join_next(), if !retries.is_empty() => {}

                item = receivers.local.recv(), if reading && local_open => match item {
                    Some(item) => backlog.push_back(item),
                    None => local_open = false,
                },

                item = receivers.remote.recv(), if reading && remote_open => match item {
                    Some(item) => backlog.push_back(item),
                    None => remote_open = false,
                },
            }
        }

        tasks.abort_all();
        retries.abort_all();
        while tasks.join_next().await.is_some() {}
        for item in backlog.drain(..) {
            status.dropped(&item.event.paths());
        }
        info!("Dispatcher stopped");
    }

    /// Starts every backlog item whose paths are free, in order
    fn start_ready(
        &self,
        backlog: &mut VecDeque<WorkItem>,
        running: &mut HashMap<u64, Vec<PathKey>>,
        tasks: &mut JoinSet<Finished>,
        next_id: &mut u64,
    ) {
        let status = &self.reconciler.context().status;
        let mut deferred: VecDeque<WorkItem> = VecDeque::with_capacity(backlog.len());
        let mut deferred_keys: Vec<PathKey> = Vec::new();

        while let Some(item) = backlog.pop_front() {
            let keys = keys_of(&item);

            if item.trigger == Trigger::Observed {
                for key in &keys {
                    status.unskip(key);
                }
            } else if keys.iter().any(|k| status.is_skipped(k)) {
                debug!(change = ?item.event.change, "Path is skipped after repeated failures");
                status.dropped(&item.event.paths());
                continue;
            }

            let blocked = tasks.len() >= self.concurrency
                || keys.iter().any(|k| {
                    running.values().flatten().any(|r| overlaps(k, r))
                        || deferred_keys.iter().any(|d| overlaps(k, d))
                });
            if blocked {
                deferred_keys.extend(keys);
                deferred.push_back(item);
                continue;
            }

            let id = *next_id;
            *next_id += 1;
            running.insert(id, keys.clone());
            status.started();

            let reconciler = self.reconciler.clone();
            let gate = self.gate.clone();
            let probe = self.probe.clone();
            tasks.spawn(async move {
                let event = item.event.clone();
                let work = tokio::spawn(async move {
                    let _shared = gate.shared().await;
                    let _probe = probe.enter(keys);
                    reconciler.handle(&event).await
                });
                let _abort = AbortOnDrop(work.abort_handle());
                let result = match work.await {
                    Ok(result) => result,
                    Err(e) => Err(anyhow!("Reconciliation task failed: {e}")),
                };
                (id, item, result)
            });
        }

        *backlog = deferred;
    }

    fn complete(
        &self,
        item: WorkItem,
        result: anyhow::Result<ReconcileReport>,
        backlog: &mut VecDeque<WorkItem>,
        retries: &mut JoinSet<()>,
        cancel: &CancellationToken,
    ) {
        let ctx = self.reconciler.context();
        let paths = item.event.paths();
        match result {
            Ok(report) => {
                for follow_up in report.follow_ups {
                    ctx.status.enqueued(&follow_up.paths());
                    backlog.push_back(WorkItem::rescan(follow_up));
                }
                ctx.status.finished(&paths, report.changed);
            }
            Err(e) => {
                let path = item.event.primary_path().clone();
                let info = self.reconciler.record_failure(&path, &e);
                ctx.status.finished(&paths, false);
                if info.skipped {
                    warn!(
                        path = %path,
                        attempts = info.attempts,
                        "Giving up until the next change"
                    );
                    return;
                }

                let delay = ctx.retry.delay_for(info.attempts.saturating_sub(1));
                let queue = self.queue.clone();
                let cancel = cancel.clone();
                let event = item.event.clone();
                retries.spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {
                            if let Err(e) = queue.push(WorkItem::retry(event)).await {
                                debug!(error = %e, "Retry dropped, queue closed");
                            }
                        }
                    }
                });
            }
        }
    }
}
