//! File watching, debouncing and self-write suppression
//!
//! [`FileWatcher`] turns `notify` events under the sync root into
//! [`WatcherMessage`] values. [`DebouncedChangeQueue`] holds a path back until
//! it has been quiet for the debounce window, keeping only its latest event.
//! The [`IgnoreRegistry`] holds the events the engine expects its own writes
//! to cause, so each of them is swallowed once instead of bouncing back as a
//! local change.
//!
//! ## Architecture
//!
//! ```text
//! inotify
//!    │
//!    ▼
//! FileWatcher ──→ mpsc::channel ──→ LocalEventPump ──→ WorkQueue
//!                                     │   │
//!                      IgnoreRegistry ┘   └ DebouncedChangeQueue
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dashmap::DashMap;
use driftsync_core::domain::{FatalError, FatalErrorKind};
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::SyncError;

/// How long an announced engine write waits for its watcher event
pub const IGNORE_WINDOW: Duration = Duration::from_secs(2);

// ============================================================================
// ChangeEvent / WatcherMessage
// ============================================================================

/// A filesystem change detected by the watcher, decoupled from `notify`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Created(PathBuf),
    /// Content or metadata changed
    Modified(PathBuf),
    Deleted(PathBuf),
    /// Both ends inside the watched tree
    Renamed { old: PathBuf, new: PathBuf },
}

impl ChangeEvent {
    /// The affected path; the destination for renames
    pub fn path(&self) -> &Path {
        match self {
            ChangeEvent::Created(p) => p,
            ChangeEvent::Modified(p) => p,
            ChangeEvent::Deleted(p) => p,
            ChangeEvent::Renamed { new, .. } => new,
        }
    }

    /// Deletions sort first so the move correlator sees them before creations
    fn delivery_rank(&self) -> u8 {
        match self {
            ChangeEvent::Deleted(_) => 0,
            ChangeEvent::Renamed { .. } => 1,
            ChangeEvent::Created(_) | ChangeEvent::Modified(_) => 2,
        }
    }
}

/// Everything the watcher thread reports
#[derive(Debug)]
pub enum WatcherMessage {
    Change(ChangeEvent),
    /// The kernel dropped events; the tree must be rescanned
    Rescan,
    /// The per-user watch limit was hit
    WatchLimitExceeded(String),
    /// Any other watcher failure
    Failed(String),
}

// ============================================================================
// FileWatcher
// ============================================================================

/// Watches the sync root recursively using the OS-native mechanism
///
/// ## Usage
///
/// ```ignore
/// let (mut watcher, rx) = FileWatcher::new(1024)?;
/// watcher.watch(root)?;
/// // rx.recv().await yields WatcherMessage values
/// drop(watcher); // stops watching
/// ```
pub struct FileWatcher {
    watcher: RecommendedWatcher,
}

impl FileWatcher {
    /// Creates a watcher and the receiver its messages arrive on
    ///
    /// # Errors
    /// Returns an error if the underlying OS watcher cannot be created
    pub fn new(capacity: usize) -> Result<(Self, mpsc::Receiver<WatcherMessage>)> {
        let (tx, rx) = mpsc::channel::<WatcherMessage>(capacity.max(1));

        let watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| {
                let message = match res {
                    Ok(event) if event.need_rescan() => Some(WatcherMessage::Rescan),
                    Ok(event) => map_notify_event(&event).map(WatcherMessage::Change),
                    Err(err) if is_watch_limit_error(&err) => {
                        Some(WatcherMessage::WatchLimitExceeded(err.to_string()))
                    }
                    Err(err) => {
                        error!(error = %err, "File watcher error");
                        Some(WatcherMessage::Failed(err.to_string()))
                    }
                };
                if let Some(message) = message {
                    if tx.blocking_send(message).is_err() {
                        debug!("Watcher receiver dropped");
                    }
                }
            },
            notify::Config::default(),
        )
        .context("Failed to create file watcher")?;

        Ok((Self { watcher }, rx))
    }

    /// Starts watching `path` recursively
    ///
    /// # Errors
    /// `SyncError::WatchLimitExceeded` when the kernel refuses more watches;
    /// any other failure is returned with context.
    pub fn watch(&mut self, path: &Path) -> Result<()> {
        info!(path = %path.display(), "Starting recursive watch");

        match self.watcher.watch(path, RecursiveMode::Recursive) {
            Ok(()) => Ok(()),
            Err(err) if is_watch_limit_error(&err) => {
                Err(SyncError::WatchLimitExceeded(err.to_string()).into())
            }
            Err(err) => Err(anyhow::Error::new(err))
                .with_context(|| format!("Failed to watch path: {}", path.display())),
        }
    }
}

/// True when a watcher error means the inotify watch budget is exhausted
pub fn is_watch_limit_error(err: &notify::Error) -> bool {
    match &err.kind {
        notify::ErrorKind::MaxFilesWatch => true,
        notify::ErrorKind::Io(io) => {
            matches!(io.raw_os_error(), Some(libc::ENOSPC) | Some(libc::EMFILE))
        }
        _ => false,
    }
}

/// The fatal error raised when the watch limit is hit
pub fn watch_limit_fatal(detail: &str) -> FatalError {
    FatalError::new(
        FatalErrorKind::WatchLimitExceeded,
        "Too many folders to watch",
        format!(
            "The system limit on watched folders was reached ({detail}). \
             Raise fs.inotify.max_user_watches (for example \
             `sysctl fs.inotify.max_user_watches=524288`) and restart syncing."
        ),
    )
}

// ============================================================================
// Event mapping - notify::Event → ChangeEvent
// ============================================================================

/// Converts a `notify::Event` into our internal `ChangeEvent`
///
/// - `Create(*)` -> `Created`
/// - `Modify(Name(From))` -> `Deleted`, `Modify(Name(To))` -> `Created`
/// - `Modify(Name(Both))` with 2 paths -> `Renamed`
/// - `Remove(*)` -> `Deleted`
/// - Other `Modify(*)` -> `Modified`
///
/// Access events and events without paths are dropped.
fn map_notify_event(event: &notify::Event) -> Option<ChangeEvent> {
    let paths = &event.paths;

    match &event.kind {
        EventKind::Create(_) => Some(ChangeEvent::Created(paths.first()?.clone())),

        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            Some(ChangeEvent::Deleted(paths.first()?.clone()))
        }

        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            Some(ChangeEvent::Created(paths.first()?.clone()))
        }

        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            if paths.len() >= 2 {
                Some(ChangeEvent::Renamed {
                    old: paths[0].clone(),
                    new: paths[1].clone(),
                })
            } else {
                let path = paths.first()?;
                debug!(path = %path.display(), "Rename with single path, treating as Modified");
                Some(ChangeEvent::Modified(path.clone()))
            }
        }

        EventKind::Remove(_) => Some(ChangeEvent::Deleted(paths.first()?.clone())),

        EventKind::Modify(_) => Some(ChangeEvent::Modified(paths.first()?.clone())),

        _ => {
            debug!(kind = ?event.kind, "Ignoring event kind");
            None
        }
    }
}

// ============================================================================
// DebouncedChangeQueue
// ============================================================================

/// Queue that coalesces rapid filesystem changes into debounced events
///
/// When multiple events arrive for the same path in quick succession, only
/// the latest one is kept and its timestamp is reset. Events are emitted by
/// [`poll`](DebouncedChangeQueue::poll) once they have been quiet for longer
/// than the debounce delay.
pub struct DebouncedChangeQueue {
    /// Latest event per path, with its timestamp and arrival sequence
    pending: HashMap<PathBuf, (ChangeEvent, Instant, u64)>,
    debounce_delay: Duration,
    sequence: u64,
}

impl DebouncedChangeQueue {
    pub fn new(debounce_delay: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            debounce_delay,
            sequence: 0,
        }
    }

    /// Inserts or updates the change for the event's path
    ///
    /// A rename supersedes anything still pending for its source path.
    pub fn push(&mut self, event: ChangeEvent) {
        if let ChangeEvent::Renamed { old, .. } = &event {
            self.pending.remove(old);
        }
        let path = event.path().to_path_buf();
        debug!(path = %path.display(), event = ?event, "Enqueuing change event");
        self.sequence += 1;
        self.pending
            .insert(path, (event, Instant::now(), self.sequence));
    }

    /// Returns all changes older than the debounce delay
    ///
    /// Deletions come first, then renames, then everything else; within a
    /// group events keep their arrival order.
    pub fn poll(&mut self) -> Vec<ChangeEvent> {
        self.drain_older_than(self.debounce_delay)
    }

    /// Returns every pending change regardless of age
    pub fn flush(&mut self) -> Vec<ChangeEvent> {
        self.drain_older_than(Duration::ZERO)
    }

    fn drain_older_than(&mut self, age: Duration) -> Vec<ChangeEvent> {
        let now = Instant::now();
        let settled_paths: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, (_, at, _))| now.duration_since(*at) >= age)
            .map(|(path, _)| path.clone())
            .collect();

        let mut settled: Vec<(ChangeEvent, u64)> = settled_paths
            .iter()
            .filter_map(|path| self.pending.remove(path))
            .map(|(event, _, seq)| (event, seq))
            .collect();
        settled.sort_by_key(|(event, seq)| (event.delivery_rank(), *seq));

        if !settled.is_empty() {
            debug!(count = settled.len(), "Polled settled change events");
        }
        settled.into_iter().map(|(event, _)| event).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

// ============================================================================
// IgnoreRegistry
// ============================================================================

/// One outstanding expectation per kind for a path
#[derive(Debug, Default)]
struct Expected {
    arrival: Option<Instant>,
    removal: Option<Instant>,
    removal_tree: Option<Instant>,
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Arrival,
    Removal,
}

impl Expected {
    fn slot(&mut self, slot: Slot) -> &mut Option<Instant> {
        match slot {
            Slot::Arrival => &mut self.arrival,
            Slot::Removal => &mut self.removal,
        }
    }

    fn drop_expired(&mut self, now: Instant) -> bool {
        for slot in [&mut self.arrival, &mut self.removal, &mut self.removal_tree] {
            if slot.is_some_and(|expiry| expiry <= now) {
                *slot = None;
            }
        }
        self.arrival.is_some() || self.removal.is_some() || self.removal_tree.is_some()
    }
}

/// Watcher events the engine is about to cause on the local tree
///
/// Each registration names the kind of event it expects. Arrivals, single
/// removals and renames are consumed by the first matching event; a removed
/// tree absorbs deletions at or below it until its window ends. Events of
/// any other kind pass through, so a user edit racing an engine write still
/// reaches the reconciler.
#[derive(Debug)]
pub struct IgnoreRegistry {
    expected: DashMap<PathBuf, Expected>,
    renames: DashMap<PathBuf, (PathBuf, Instant)>,
    window: Duration,
}

impl Default for IgnoreRegistry {
    fn default() -> Self {
        Self::new(IGNORE_WINDOW)
    }
}

impl IgnoreRegistry {
    pub fn new(window: Duration) -> Self {
        Self {
            expected: DashMap::new(),
            renames: DashMap::new(),
            window,
        }
    }

    /// A file or folder is about to appear or be rewritten at `path`
    pub fn expect_write(&self, path: &Path) {
        let expiry = Instant::now() + self.window;
        self.expected.entry(path.to_path_buf()).or_default().arrival = Some(expiry);
    }

    /// A single item at `path` is about to be removed
    pub fn expect_removal(&self, path: &Path) {
        let expiry = Instant::now() + self.window;
        self.expected.entry(path.to_path_buf()).or_default().removal = Some(expiry);
    }

    /// `path` and everything below it is about to be removed
    pub fn expect_removal_tree(&self, path: &Path) {
        let expiry = Instant::now() + self.window;
        self.expected.entry(path.to_path_buf()).or_default().removal_tree = Some(expiry);
    }

    /// `from` is about to be renamed to `to`
    ///
    /// Covers both the paired rename event and its separate halves.
    pub fn expect_rename(&self, from: &Path, to: &Path) {
        self.expect_removal(from);
        self.expect_write(to);
        let expiry = Instant::now() + self.window;
        self.renames
            .insert(from.to_path_buf(), (to.to_path_buf(), expiry));
    }

    /// True if `change` is one the engine announced; the announcement is used up
    pub fn consume(&self, change: &ChangeEvent) -> bool {
        let now = Instant::now();
        match change {
            ChangeEvent::Created(path) | ChangeEvent::Modified(path) => {
                self.take(path, Slot::Arrival, now)
            }
            ChangeEvent::Deleted(path) => {
                self.take(path, Slot::Removal, now) || self.under_removed_tree(path, now)
            }
            ChangeEvent::Renamed { old, new } => {
                let paired = self
                    .renames
                    .remove_if(old, |_, (to, expiry)| to == new && *expiry > now)
                    .is_some();
                if paired {
                    self.take(old, Slot::Removal, now);
                    self.take(new, Slot::Arrival, now);
                }
                paired
            }
        }
    }

    fn take(&self, path: &Path, slot: Slot, now: Instant) -> bool {
        let Some(mut expected) = self.expected.get_mut(path) else {
            return false;
        };
        matches!(expected.slot(slot).take(), Some(expiry) if expiry > now)
    }

    fn under_removed_tree(&self, path: &Path, now: Instant) -> bool {
        path.ancestors().any(|ancestor| {
            self.expected.get(ancestor).is_some_and(|expected| {
                expected.removal_tree.is_some_and(|expiry| expiry > now)
            })
        })
    }

    /// Drops registrations whose window has passed
    pub fn purge_expired(&self) {
        let now = Instant::now();
        let before = self.len();
        self.expected.retain(|_, expected| expected.drop_expired(now));
        self.renames.retain(|_, (_, expiry)| *expiry > now);
        let purged = before - self.len();
        if purged > 0 {
            debug!(purged, "Expired write expectations dropped");
        }
    }

    pub fn len(&self) -> usize {
        self.expected.len() + self.renames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.expected.is_empty() && self.renames.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ------------------------------------------------------------------
    // DebouncedChangeQueue
    // ------------------------------------------------------------------

    #[test]
    fn test_push_coalesces_same_path() {
        let mut queue = DebouncedChangeQueue::new(Duration::from_millis(100));
        queue.push(ChangeEvent::Created(PathBuf::from("/a.txt")));
        queue.push(ChangeEvent::Modified(PathBuf::from("/a.txt")));
        queue.push(ChangeEvent::Deleted(PathBuf::from("/b.txt")));
        assert_eq!(queue.pending_count(), 2);
    }

    #[test]
    fn test_poll_keeps_latest_event_type() {
        let mut queue = DebouncedChangeQueue::new(Duration::ZERO);
        queue.push(ChangeEvent::Created(PathBuf::from("/a.txt")));
        queue.push(ChangeEvent::Deleted(PathBuf::from("/a.txt")));

        let settled = queue.poll();
        assert_eq!(settled, vec![ChangeEvent::Deleted(PathBuf::from("/a.txt"))]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_poll_returns_nothing_for_recent_events() {
        let mut queue = DebouncedChangeQueue::new(Duration::from_secs(60));
        queue.push(ChangeEvent::Created(PathBuf::from("/a.txt")));
        assert!(queue.poll().is_empty());
        assert_eq!(queue.flush().len(), 1);
    }

    #[test]
    fn test_coalescing_resets_timestamp() {
        let mut queue = DebouncedChangeQueue::new(Duration::from_millis(50));
        queue.push(ChangeEvent::Created(PathBuf::from("/a.txt")));
        std::thread::sleep(Duration::from_millis(30));
        queue.push(ChangeEvent::Modified(PathBuf::from("/a.txt")));
        std::thread::sleep(Duration::from_millis(30));
        assert!(queue.poll().is_empty());

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(
            queue.poll(),
            vec![ChangeEvent::Modified(PathBuf::from("/a.txt"))]
        );
    }

    #[test]
    fn test_deletions_are_delivered_first() {
        let mut queue = DebouncedChangeQueue::new(Duration::ZERO);
        queue.push(ChangeEvent::Created(PathBuf::from("/new.txt")));
        queue.push(ChangeEvent::Deleted(PathBuf::from("/old.txt")));

        let settled = queue.poll();
        assert_eq!(settled[0], ChangeEvent::Deleted(PathBuf::from("/old.txt")));
        assert_eq!(settled[1], ChangeEvent::Created(PathBuf::from("/new.txt")));
    }

    #[test]
    fn test_rename_supersedes_pending_source() {
        let mut queue = DebouncedChangeQueue::new(Duration::ZERO);
        queue.push(ChangeEvent::Deleted(PathBuf::from("/old.txt")));
        queue.push(ChangeEvent::Created(PathBuf::from("/new.txt")));
        queue.push(ChangeEvent::Renamed {
            old: PathBuf::from("/old.txt"),
            new: PathBuf::from("/new.txt"),
        });

        assert_eq!(
            queue.poll(),
            vec![ChangeEvent::Renamed {
                old: PathBuf::from("/old.txt"),
                new: PathBuf::from("/new.txt"),
            }]
        );
    }

    // ------------------------------------------------------------------
    // Event mapping
    // ------------------------------------------------------------------

    fn event(kind: EventKind, paths: &[&str]) -> notify::Event {
        notify::Event {
            kind,
            paths: paths.iter().map(PathBuf::from).collect(),
            attrs: Default::default(),
        }
    }

    #[test]
    fn test_map_create_and_remove() {
        let created = event(EventKind::Create(notify::event::CreateKind::File), &["/a"]);
        assert_eq!(
            map_notify_event(&created),
            Some(ChangeEvent::Created(PathBuf::from("/a")))
        );

        let removed = event(EventKind::Remove(notify::event::RemoveKind::Folder), &["/d"]);
        assert_eq!(
            map_notify_event(&removed),
            Some(ChangeEvent::Deleted(PathBuf::from("/d")))
        );
    }

    #[test]
    fn test_map_rename_halves() {
        let from = event(EventKind::Modify(ModifyKind::Name(RenameMode::From)), &["/a"]);
        assert_eq!(
            map_notify_event(&from),
            Some(ChangeEvent::Deleted(PathBuf::from("/a")))
        );

        let to = event(EventKind::Modify(ModifyKind::Name(RenameMode::To)), &["/b"]);
        assert_eq!(
            map_notify_event(&to),
            Some(ChangeEvent::Created(PathBuf::from("/b")))
        );

        let both = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/a", "/b"],
        );
        assert_eq!(
            map_notify_event(&both),
            Some(ChangeEvent::Renamed {
                old: PathBuf::from("/a"),
                new: PathBuf::from("/b"),
            })
        );
    }

    #[test]
    fn test_map_ignores_access_and_empty_events() {
        let access = event(EventKind::Access(notify::event::AccessKind::Read), &["/a"]);
        assert!(map_notify_event(&access).is_none());

        let empty = event(EventKind::Create(notify::event::CreateKind::File), &[]);
        assert!(map_notify_event(&empty).is_none());
    }

    // ------------------------------------------------------------------
    // Watch limit classification
    // ------------------------------------------------------------------

    #[test]
    fn test_watch_limit_errors_are_recognized() {
        assert!(is_watch_limit_error(&notify::Error::new(
            notify::ErrorKind::MaxFilesWatch
        )));
        assert!(is_watch_limit_error(&notify::Error::io(
            std::io::Error::from_raw_os_error(libc::ENOSPC)
        )));
        assert!(!is_watch_limit_error(&notify::Error::path_not_found()));

        let fatal = watch_limit_fatal("inotify");
        assert_eq!(fatal.kind, FatalErrorKind::WatchLimitExceeded);
        assert!(fatal.message.contains("max_user_watches"));
    }

    // ------------------------------------------------------------------
    // IgnoreRegistry
    // ------------------------------------------------------------------

    fn created(p: &str) -> ChangeEvent {
        ChangeEvent::Created(PathBuf::from(p))
    }

    fn modified(p: &str) -> ChangeEvent {
        ChangeEvent::Modified(PathBuf::from(p))
    }

    fn deleted(p: &str) -> ChangeEvent {
        ChangeEvent::Deleted(PathBuf::from(p))
    }

    #[test]
    fn test_expected_write_is_consumed_once() {
        let registry = IgnoreRegistry::new(Duration::from_secs(60));
        registry.expect_write(Path::new("/root/a.txt"));

        assert!(registry.consume(&created("/root/a.txt")));
        assert!(!registry.consume(&modified("/root/a.txt")));
    }

    #[test]
    fn test_expected_write_does_not_hide_a_deletion() {
        let registry = IgnoreRegistry::new(Duration::from_secs(60));
        registry.expect_write(Path::new("/root/a.txt"));

        assert!(!registry.consume(&deleted("/root/a.txt")));
        assert!(!registry.consume(&created("/root/b.txt")));
        assert!(registry.consume(&modified("/root/a.txt")));
    }

    #[test]
    fn test_removed_tree_absorbs_deletions_below_it() {
        let registry = IgnoreRegistry::new(Duration::from_secs(60));
        registry.expect_removal_tree(Path::new("/root/dir"));

        assert!(registry.consume(&deleted("/root/dir/sub/file")));
        assert!(registry.consume(&deleted("/root/dir")));
        assert!(!registry.consume(&created("/root/dir/new.txt")));
        assert!(!registry.consume(&deleted("/root/other")));
    }

    #[test]
    fn test_rename_consumes_pair_and_halves() {
        let registry = IgnoreRegistry::new(Duration::from_secs(60));
        registry.expect_rename(Path::new("/root/a"), Path::new("/root/b"));

        assert!(registry.consume(&deleted("/root/a")));
        assert!(registry.consume(&created("/root/b")));
        assert!(registry.consume(&ChangeEvent::Renamed {
            old: PathBuf::from("/root/a"),
            new: PathBuf::from("/root/b"),
        }));
        assert!(!registry.consume(&modified("/root/b")));

        registry.purge_expired();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_paired_rename_alone_clears_its_halves() {
        let registry = IgnoreRegistry::new(Duration::from_secs(60));
        registry.expect_rename(Path::new("/root/a"), Path::new("/root/b"));

        assert!(registry.consume(&ChangeEvent::Renamed {
            old: PathBuf::from("/root/a"),
            new: PathBuf::from("/root/b"),
        }));
        assert!(!registry.consume(&modified("/root/b")));
    }

    #[test]
    fn test_expectations_expire() {
        let registry = IgnoreRegistry::new(Duration::ZERO);
        registry.expect_write(Path::new("/root/a.txt"));
        registry.expect_removal_tree(Path::new("/root/dir"));
        assert!(!registry.consume(&deleted("/root/dir/x")));

        registry.purge_expired();
        assert!(registry.is_empty());
    }
}
