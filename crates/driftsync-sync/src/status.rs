//! Daemon status machine
//!
//! Aggregates the engine's lifecycle state, the queue load, path-scoped sync
//! errors and fatal errors. Every observable change bumps a generation
//! counter published on a `tokio::sync::watch` channel, which is what
//! [`StatusMachine::longpoll`] waits on.
//!
//! SYNCING holds while work is queued or in flight. Once the load drops to
//! zero the machine stays SYNCING for a quiescence window; [`settle`] moves
//! it to IDLE afterwards.
//!
//! [`settle`]: StatusMachine::settle

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use driftsync_core::domain::{
    DaemonStatus, DomainError, FatalError, PathKey, RemotePath, StatusSnapshot, SyncErrorInfo,
};
use driftsync_core::ports::StatusChange;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

struct StatusState {
    status: DaemonStatus,
    generation: u64,
    sync_errors: BTreeMap<PathKey, SyncErrorInfo>,
    fatal_errors: Vec<FatalError>,
    queued: usize,
    in_flight: usize,
    /// Paths queued or in flight, with a reference count
    activity: HashMap<PathKey, (RemotePath, usize)>,
    /// When the load last dropped to zero
    quiet_since: Instant,
    last_change: Instant,
}

impl StatusState {
    fn load(&self) -> usize {
        self.queued + self.in_flight
    }
}

/// Shared status of one engine instance
pub struct StatusMachine {
    state: Mutex<StatusState>,
    generation_tx: watch::Sender<u64>,
    quiescence: Duration,
    max_path_retries: u32,
    max_sync_errors: usize,
}

/// Sync errors kept when no limit is configured
pub const DEFAULT_MAX_SYNC_ERRORS: usize = 1000;

impl StatusMachine {
    pub fn new(quiescence: Duration, max_path_retries: u32) -> Self {
        let now = Instant::now();
        let (generation_tx, _) = watch::channel(0);
        Self {
            state: Mutex::new(StatusState {
                status: DaemonStatus::Stopped,
                generation: 0,
                sync_errors: BTreeMap::new(),
                fatal_errors: Vec::new(),
                queued: 0,
                in_flight: 0,
                activity: HashMap::new(),
                quiet_since: now,
                last_change: now,
            }),
            generation_tx,
            quiescence,
            max_path_retries,
            max_sync_errors: DEFAULT_MAX_SYNC_ERRORS,
        }
    }

    /// Caps the number of path-scoped errors kept at once (at least one)
    pub fn with_error_limit(mut self, max_sync_errors: usize) -> Self {
        self.max_sync_errors = max_sync_errors.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, StatusState> {
        // A panic while holding the lock leaves plain data behind; keep going
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bump(&self, state: &mut StatusState) {
        state.generation += 1;
        self.generation_tx.send_replace(state.generation);
    }

    fn snapshot_of(state: &StatusState) -> StatusSnapshot {
        StatusSnapshot {
            status: state.status,
            generation: state.generation,
            sync_errors: state.sync_errors.values().cloned().collect(),
            fatal_errors: state.fatal_errors.clone(),
            queued: state.queued,
            in_flight: state.in_flight,
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub fn snapshot(&self) -> StatusSnapshot {
        Self::snapshot_of(&self.lock())
    }

    pub fn status(&self) -> DaemonStatus {
        self.lock().status
    }

    /// Validated transition
    ///
    /// # Errors
    /// Returns `DomainError::InvalidState` when the machine forbids it
    pub fn transition(&self, target: DaemonStatus) -> Result<(), DomainError> {
        let mut state = self.lock();
        let from = state.status;
        state.status = from.transition_to(target)?;
        if from != target {
            info!(from = %from, to = %target, "Daemon status changed");
            if target.is_running() && state.load() > 0 {
                state.status = DaemonStatus::Syncing;
            }
            self.bump(&mut state);
        }
        Ok(())
    }

    /// Records a fatal error and moves to ERROR
    pub fn raise_fatal(&self, fatal: FatalError) {
        let mut state = self.lock();
        error!(
            kind = %fatal.kind,
            title = %fatal.title,
            message = %fatal.message,
            "Fatal error"
        );
        state.fatal_errors.push(fatal);
        state.status = DaemonStatus::Error;
        self.bump(&mut state);
    }

    /// Drops fatal errors; only done on an explicit restart
    pub fn clear_fatal_errors(&self) {
        let mut state = self.lock();
        if !state.fatal_errors.is_empty() {
            state.fatal_errors.clear();
            self.bump(&mut state);
        }
    }

    pub fn has_fatal_errors(&self) -> bool {
        !self.lock().fatal_errors.is_empty()
    }

    // ========================================================================
    // Load accounting
    // ========================================================================

    /// An event for `paths` entered a queue
    pub fn enqueued(&self, paths: &[&RemotePath]) {
        let mut state = self.lock();
        state.queued += 1;
        for path in paths {
            state
                .activity
                .entry(path.key())
                .or_insert_with(|| ((*path).clone(), 0))
                .1 += 1;
        }
        if state.status == DaemonStatus::Idle {
            state.status = DaemonStatus::Syncing;
        }
        self.bump(&mut state);
    }

    /// A queued event was handed to a worker
    pub fn started(&self) {
        let mut state = self.lock();
        state.queued = state.queued.saturating_sub(1);
        state.in_flight += 1;
        self.bump(&mut state);
    }

    /// A worker finished; `changed` is true when it modified either replica
    pub fn finished(&self, paths: &[&RemotePath], changed: bool) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        self.release_paths(&mut state, paths);
        if changed {
            state.last_change = Instant::now();
        }
        if state.load() == 0 {
            state.quiet_since = Instant::now();
        }
        self.bump(&mut state);
    }

    /// A queued event was discarded without running
    pub fn dropped(&self, paths: &[&RemotePath]) {
        let mut state = self.lock();
        state.queued = state.queued.saturating_sub(1);
        self.release_paths(&mut state, paths);
        if state.load() == 0 {
            state.quiet_since = Instant::now();
        }
        self.bump(&mut state);
    }

    fn release_paths(&self, state: &mut StatusState, paths: &[&RemotePath]) {
        for path in paths {
            let key = path.key();
            let remove = match state.activity.get_mut(&key) {
                Some((_, count)) => {
                    *count = count.saturating_sub(1);
                    *count == 0
                }
                None => false,
            };
            if remove {
                state.activity.remove(&key);
            }
        }
    }

    /// Forgets all queue accounting (engine stopped)
    pub fn reset_load(&self) {
        let mut state = self.lock();
        state.queued = 0;
        state.in_flight = 0;
        state.activity.clear();
        state.quiet_since = Instant::now();
        self.bump(&mut state);
    }

    /// SYNCING → IDLE once the quiescence window has passed without load
    ///
    /// Returns true when the transition happened.
    pub fn settle(&self) -> bool {
        let mut state = self.lock();
        if state.status == DaemonStatus::Syncing
            && state.load() == 0
            && state.quiet_since.elapsed() >= self.quiescence
        {
            state.status = DaemonStatus::Idle;
            debug!("Quiescent, now idle");
            self.bump(&mut state);
            return true;
        }
        false
    }

    pub fn is_quiet(&self) -> bool {
        self.lock().load() == 0
    }

    pub fn activity(&self) -> Vec<RemotePath> {
        let state = self.lock();
        let mut paths: Vec<RemotePath> = state.activity.values().map(|(p, _)| p.clone()).collect();
        paths.sort_by_key(RemotePath::key);
        paths
    }

    /// Time since the last completed change (or since startup)
    pub fn idle_time(&self) -> Duration {
        self.lock().last_change.elapsed()
    }

    // ========================================================================
    // Path-scoped sync errors
    // ========================================================================

    /// Records one failed attempt for `path`
    ///
    /// Returns the updated record; `skipped` is set once the attempts exceed
    /// the retry budget.
    pub fn record_sync_error(&self, path: &RemotePath, kind: &str, message: &str) -> SyncErrorInfo {
        self.record(path, kind, message, false)
    }

    /// Records a failure that retrying cannot fix; the path is skipped at once
    pub fn record_permanent_error(
        &self,
        path: &RemotePath,
        kind: &str,
        message: &str,
    ) -> SyncErrorInfo {
        self.record(path, kind, message, true)
    }

    fn record(
        &self,
        path: &RemotePath,
        kind: &str,
        message: &str,
        permanent: bool,
    ) -> SyncErrorInfo {
        let mut state = self.lock();
        let attempts = state
            .sync_errors
            .get(&path.key())
            .map_or(0, |e| e.attempts)
            + 1;
        let info = SyncErrorInfo {
            path: path.clone(),
            kind: kind.to_string(),
            message: message.to_string(),
            attempts,
            skipped: permanent || attempts > self.max_path_retries,
            timestamp: Utc::now(),
        };
        warn!(
            path = %path,
            kind,
            attempts,
            skipped = info.skipped,
            error = message,
            "Sync error recorded"
        );
        let key = path.key();
        if !state.sync_errors.contains_key(&key) {
            self.make_room(&mut state);
        }
        state.sync_errors.insert(key, info.clone());
        self.bump(&mut state);
        info
    }

    /// Evicts the oldest retryable error (or the oldest of all) when full
    fn make_room(&self, state: &mut StatusState) {
        while state.sync_errors.len() >= self.max_sync_errors {
            let oldest = |skipped: Option<bool>| {
                state
                    .sync_errors
                    .values()
                    .filter(|e| skipped.map_or(true, |s| e.skipped == s))
                    .min_by_key(|e| e.timestamp)
                    .map(|e| e.path.key())
            };
            let Some(victim) = oldest(Some(false)).or_else(|| oldest(None)) else {
                return;
            };
            debug!(path = %victim, "Sync error evicted to stay within the limit");
            state.sync_errors.remove(&victim);
        }
    }

    pub fn is_skipped(&self, key: &PathKey) -> bool {
        self.lock()
            .sync_errors
            .get(key)
            .is_some_and(|e| e.skipped)
    }

    /// A new change was observed: the path gets a fresh retry budget
    pub fn unskip(&self, key: &PathKey) {
        let mut state = self.lock();
        if let Some(entry) = state.sync_errors.get_mut(key) {
            if entry.skipped || entry.attempts > 0 {
                entry.skipped = false;
                entry.attempts = 0;
                self.bump(&mut state);
            }
        }
    }

    /// Called after a path synced successfully
    pub fn clear_sync_error(&self, key: &PathKey) {
        let mut state = self.lock();
        if state.sync_errors.remove(key).is_some() {
            self.bump(&mut state);
        }
    }

    pub fn clear_sync_errors(&self) {
        let mut state = self.lock();
        if !state.sync_errors.is_empty() {
            state.sync_errors.clear();
            self.bump(&mut state);
        }
    }

    /// True if `key` or any descendant has a sync error
    pub fn has_error_at_or_below(&self, key: &PathKey) -> bool {
        self.lock()
            .sync_errors
            .keys()
            .any(|k| k.is_equal_or_descendant_of(key))
    }

    // ========================================================================
    // Waiting
    // ========================================================================

    /// Generation counter updates
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation_tx.subscribe()
    }

    /// Waits until the generation differs from `baseline` or `timeout` elapses
    pub async fn longpoll(&self, baseline: u64, timeout: Duration) -> StatusChange {
        let mut rx = self.subscribe();
        let changed = if *rx.borrow_and_update() != baseline {
            true
        } else {
            matches!(tokio::time::timeout(timeout, rx.changed()).await, Ok(Ok(())))
        };
        StatusChange {
            changed,
            snapshot: self.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use driftsync_core::domain::{FatalErrorKind, FatalError};

    use super::*;

    fn rp(s: &str) -> RemotePath {
        RemotePath::new(s.to_string()).unwrap()
    }

    fn running() -> StatusMachine {
        let machine = StatusMachine::new(Duration::from_millis(0), 2);
        machine.transition(DaemonStatus::Starting).unwrap();
        machine.transition(DaemonStatus::Idle).unwrap();
        machine
    }

    #[test]
    fn test_load_drives_syncing_and_settle_returns_to_idle() {
        let machine = running();
        let a = rp("/a");

        machine.enqueued(&[&a]);
        assert_eq!(machine.status(), DaemonStatus::Syncing);
        assert_eq!(machine.activity(), vec![a.clone()]);

        machine.started();
        assert!(!machine.settle());

        machine.finished(&[&a], true);
        assert!(machine.activity().is_empty());
        assert!(machine.settle());
        assert_eq!(machine.status(), DaemonStatus::Idle);
    }

    #[test]
    fn test_settle_waits_for_quiescence_window() {
        let machine = StatusMachine::new(Duration::from_secs(60), 2);
        machine.transition(DaemonStatus::Starting).unwrap();
        machine.transition(DaemonStatus::Idle).unwrap();
        let a = rp("/a");
        machine.enqueued(&[&a]);
        machine.started();
        machine.finished(&[&a], false);
        assert!(!machine.settle());
        assert_eq!(machine.status(), DaemonStatus::Syncing);
    }

    #[test]
    fn test_paused_is_not_flipped_by_load() {
        let machine = running();
        machine.transition(DaemonStatus::Paused).unwrap();
        machine.enqueued(&[&rp("/a")]);
        assert_eq!(machine.status(), DaemonStatus::Paused);

        machine.transition(DaemonStatus::Idle).unwrap();
        assert_eq!(machine.status(), DaemonStatus::Syncing);
    }

    #[test]
    fn test_invalid_transition_is_rejected() {
        let machine = StatusMachine::new(Duration::ZERO, 2);
        assert!(machine.transition(DaemonStatus::Paused).is_err());
        assert_eq!(machine.status(), DaemonStatus::Stopped);
    }

    #[test]
    fn test_sync_error_budget_and_unskip() {
        let machine = running();
        let p = rp("/bad.txt");

        assert!(!machine.record_sync_error(&p, "io_error", "boom").skipped);
        assert!(!machine.record_sync_error(&p, "io_error", "boom").skipped);
        let third = machine.record_sync_error(&p, "io_error", "boom");
        assert_eq!(third.attempts, 3);
        assert!(third.skipped);
        assert!(machine.is_skipped(&p.key()));

        machine.unskip(&p.key());
        assert!(!machine.is_skipped(&p.key()));
        assert_eq!(machine.snapshot().sync_errors.len(), 1);

        machine.clear_sync_error(&p.key());
        assert!(machine.snapshot().sync_errors.is_empty());
    }

    #[test]
    fn test_permanent_error_is_skipped_immediately() {
        let machine = running();
        let info = machine.record_permanent_error(&rp("/CON"), "invalid_name", "reserved");
        assert!(info.skipped);
        assert!(machine.has_error_at_or_below(&rp("/").key()));
        assert!(!machine.has_error_at_or_below(&rp("/other").key()));
    }

    #[test]
    fn test_fatal_error_keeps_sync_errors() {
        let machine = running();
        machine.record_sync_error(&rp("/x"), "io_error", "boom");
        machine.raise_fatal(FatalError::new(
            FatalErrorKind::WatchLimitExceeded,
            "Too many watches",
            "Raise fs.inotify.max_user_watches",
        ));

        let snap = machine.snapshot();
        assert_eq!(snap.status, DaemonStatus::Error);
        assert_eq!(snap.fatal_errors.len(), 1);
        assert_eq!(snap.sync_errors.len(), 1);
    }

    #[test]
    fn test_sync_errors_stay_within_limit() {
        let machine = StatusMachine::new(Duration::ZERO, 2).with_error_limit(2);
        for path in ["/a", "/b", "/c"] {
            machine.record_sync_error(&rp(path), "io_error", "boom");
        }

        let paths: Vec<RemotePath> = machine
            .snapshot()
            .sync_errors
            .into_iter()
            .map(|e| e.path)
            .collect();
        assert_eq!(paths, vec![rp("/b"), rp("/c")]);
    }

    #[test]
    fn test_eviction_prefers_retryable_errors() {
        let machine = StatusMachine::new(Duration::ZERO, 2).with_error_limit(2);
        machine.record_permanent_error(&rp("/a"), "invalid_name", "rejected");
        machine.record_sync_error(&rp("/b"), "io_error", "boom");
        machine.record_sync_error(&rp("/b"), "io_error", "boom again");
        machine.record_sync_error(&rp("/c"), "io_error", "boom");

        let snap = machine.snapshot();
        assert_eq!(snap.sync_errors.len(), 2);
        assert!(machine.is_skipped(&rp("/a").key()));
        assert!(!snap.sync_errors.iter().any(|e| e.path == rp("/b")));
    }

    #[test]
    fn test_clear_sync_errors_bumps_generation_once() {
        let machine = running();
        machine.record_sync_error(&rp("/x"), "io_error", "boom");
        machine.record_sync_error(&rp("/y"), "io_error", "boom");
        let before = machine.snapshot().generation;

        machine.clear_sync_errors();
        let after = machine.snapshot();
        assert!(after.sync_errors.is_empty());
        assert_eq!(after.generation, before + 1);

        machine.clear_sync_errors();
        assert_eq!(machine.snapshot().generation, before + 1);
    }

    #[test]
    fn test_completed_change_resets_idle_time() {
        let machine = running();
        let a = rp("/a");
        std::thread::sleep(Duration::from_millis(30));
        assert!(machine.idle_time() >= Duration::from_millis(30));

        machine.enqueued(&[&a]);
        machine.started();
        machine.finished(&[&a], true);
        assert!(machine.idle_time() < Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_longpoll_returns_immediately_for_stale_baseline() {
        let machine = running();
        let generation = machine.snapshot().generation;
        let change = machine
            .longpoll(generation - 1, Duration::from_secs(30))
            .await;
        assert!(change.changed);
        assert_eq!(change.snapshot.generation, generation);
    }

    #[tokio::test]
    async fn test_longpoll_times_out_without_change() {
        let machine = running();
        let generation = machine.snapshot().generation;
        let change = machine
            .longpoll(generation, Duration::from_millis(20))
            .await;
        assert!(!change.changed);
    }

    #[tokio::test]
    async fn test_longpoll_wakes_on_change() {
        let machine = std::sync::Arc::new(running());
        let generation = machine.snapshot().generation;

        let waiter = {
            let machine = machine.clone();
            tokio::spawn(async move { machine.longpoll(generation, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        machine.transition(DaemonStatus::Paused).unwrap();

        let change = waiter.await.unwrap();
        assert!(change.changed);
        assert_eq!(change.snapshot.status, DaemonStatus::Paused);
    }
}
