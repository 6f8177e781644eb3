//! Per-path reconciliation
//!
//! A reconciliation re-reads three states for one path (the indexed one, the
//! local one and the remote one), lets [`ChangeDetector`] pick an action and
//! applies it. Events only say *where* to look; nothing in an event is
//! trusted, so duplicate or reordered events are harmless.
//!
//! ## Rules
//!
//! - The index changes only after the corresponding write succeeded.
//! - A remote write that loses a race (`RevisionMismatch`, `NotFound`) makes
//!   the reconciler re-read and re-plan, a bounded number of times.
//! - Folder deletions are careful: anything below the folder that the index
//!   does not know in its current form survives and is synced instead.
//! - Once a path exists remotely, the remote display casing wins.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use driftsync_conflict::{ChangeDetector, ConflictNamer, Observed, SyncAction};
use driftsync_core::domain::{
    Change, EventSource, HistoryAction, HistoryEntry, IndexEntry, ItemType, PathKey, RemotePath,
    SyncErrorInfo, SyncEvent, SyncPath,
};
use driftsync_core::ports::{ILocalFileSystem, IRemoteStore, RemoteError, RemoteMetadata, WriteMode};
use tracing::{debug, info, instrument, warn};

use crate::error_kind;
use crate::filesystem::ContentHasher;
use crate::history::HistoryLog;
use crate::index::SyncIndex;
use crate::remote::validate_path;
use crate::retry::{with_retry, RetryPolicy};
use crate::selective::ExclusionState;
use crate::status::StatusMachine;
use crate::watcher::IgnoreRegistry;

/// Re-plans allowed when the state changes underneath a reconciliation
const MAX_REPLANS: usize = 3;

/// Everything a reconciliation touches
pub struct SyncContext {
    pub root: SyncPath,
    pub remote: Arc<dyn IRemoteStore>,
    pub local: Arc<dyn ILocalFileSystem>,
    pub index: Arc<SyncIndex>,
    pub exclusions: Arc<ExclusionState>,
    pub history: Arc<HistoryLog>,
    pub status: Arc<StatusMachine>,
    pub ignore: Arc<IgnoreRegistry>,
    pub retry: RetryPolicy,
    pub upload: bool,
    pub download: bool,
}

/// What a reconciliation did
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Either replica was modified
    pub changed: bool,
    /// Paths that need their own reconciliation afterwards
    pub follow_ups: Vec<SyncEvent>,
}

impl ReconcileReport {
    pub fn merge(&mut self, other: ReconcileReport) {
        self.changed |= other.changed;
        self.follow_ups.extend(other.follow_ups);
    }
}

struct LocalSide {
    observed: Observed,
    /// On-disk location, or where the item would be created
    path: PathBuf,
    found: bool,
    modified: Option<DateTime<Utc>>,
}

struct RemoteSide {
    observed: Observed,
    meta: Option<RemoteMetadata>,
}

enum Step {
    Done,
    Replan,
}

/// The state moved while we were acting on it
fn is_race(err: &anyhow::Error) -> bool {
    matches!(
        RemoteError::classify(err),
        Some(RemoteError::RevisionMismatch(_) | RemoteError::NotFound(_))
    ) || error_kind(err) == "not_found"
}

fn is_remote_not_found(err: &anyhow::Error) -> bool {
    matches!(RemoteError::classify(err), Some(RemoteError::NotFound(_)))
}

/// The local observation still matches what the index recorded
fn local_matches_index(entry: &IndexEntry, observed: &Observed) -> bool {
    match observed {
        Observed::Folder => entry.is_folder(),
        Observed::File { hash, .. } => !entry.is_folder() && entry.content_hash() == Some(hash),
        Observed::Absent => false,
    }
}

/// The remote item still sits at the indexed revision
fn remote_matches_index(meta: &RemoteMetadata, entry: Option<&IndexEntry>) -> bool {
    entry.is_some_and(|e| {
        e.item_type() == meta.item_type && (meta.is_folder() || e.revision() == &meta.revision)
    })
}

pub struct Reconciler {
    ctx: Arc<SyncContext>,
}

impl Reconciler {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    // ========================================================================
    // Entry points
    // ========================================================================

    /// Reconciles every path an event touches
    #[instrument(skip(self, event), fields(change = ?event.change, source = %event.source))]
    pub async fn handle(&self, event: &SyncEvent) -> Result<ReconcileReport> {
        match &event.change {
            Change::Moved { from, to } => {
                if let Some(report) = self.try_move(from, to, event.source).await? {
                    return Ok(report);
                }
                let mut report = self.reconcile_path(from).await?;
                report.merge(self.reconcile_path(to).await?);
                Ok(report)
            }
            Change::Added { path } | Change::Changed { path } | Change::Deleted { path } => {
                self.reconcile_path(path).await
            }
        }
    }

    /// Brings one path to agreement
    ///
    /// # Errors
    /// Anything that is not a lost race; the caller records it as a sync
    /// error for the path.
    pub async fn reconcile_path(&self, path: &RemotePath) -> Result<ReconcileReport> {
        if path.is_root() {
            return Ok(ReconcileReport::default());
        }
        if self.ctx.exclusions.is_excluded(path) {
            debug!(path = %path, "Excluded, skipping");
            return Ok(ReconcileReport::default());
        }

        let mut report = ReconcileReport::default();
        for attempt in 0..MAX_REPLANS {
            match self.reconcile_once(path, &mut report).await {
                Ok(Step::Done) => {
                    self.ctx.status.clear_sync_error(&path.key());
                    return Ok(report);
                }
                Ok(Step::Replan) => debug!(path = %path, attempt, "State moved, replanning"),
                Err(e) if is_race(&e) => {
                    debug!(path = %path, attempt, error = %e, "Lost a race, replanning");
                }
                Err(e) => return Err(e),
            }
        }
        Err(RemoteError::RevisionMismatch(path.to_string()))
            .context("Path kept changing during reconciliation")
    }

    /// Records a failed reconciliation for `path`
    pub fn record_failure(&self, path: &RemotePath, err: &anyhow::Error) -> SyncErrorInfo {
        let kind = error_kind(err);
        let message = format!("{err:#}");
        match kind {
            "invalid_name" | "permission_denied" => {
                self.ctx.status.record_permanent_error(path, kind, &message)
            }
            _ => self.ctx.status.record_sync_error(path, kind, &message),
        }
    }

    /// Reconciles `root` and every remote item below it, in parent-first order
    ///
    /// Failures are recorded per path. Follow-ups inside the pulled subtree
    /// are dropped since the listing already covered them.
    pub async fn pull_subtree(&self, root: &RemotePath) -> Result<ReconcileReport> {
        let remote = &self.ctx.remote;
        let mut paths = Vec::new();
        if !root.is_root() {
            paths.push(root.clone());
        }
        let is_folder = root.is_root()
            || with_retry(&self.ctx.retry, "get_metadata", || remote.get_metadata(root))
                .await?
                .is_some_and(|m| m.is_folder());
        if is_folder {
            let listing =
                with_retry(&self.ctx.retry, "list_folder", || remote.list_folder(root, true))
                    .await?;
            paths.extend(listing.into_iter().map(|m| m.path));
        }
        paths.sort_by_key(RemotePath::key);

        let mut report = ReconcileReport::default();
        for path in paths {
            if self.ctx.exclusions.is_excluded(&path) {
                continue;
            }
            match self.reconcile_path(&path).await {
                Ok(r) => report.merge(r),
                Err(e) => {
                    self.record_failure(&path, &e);
                }
            }
        }
        report.follow_ups.retain(|event| {
            event.source == EventSource::Local
                || !event.primary_path().is_equal_or_descendant_of(root)
        });
        Ok(report)
    }

    /// Deletes the local copy of `path` and forgets its index subtree
    pub async fn drop_local_subtree(&self, path: &RemotePath) -> Result<()> {
        let ctx = &self.ctx;
        if let Some(found) = ctx.local.find_cased(&ctx.root.local_for(path)).await? {
            ctx.ignore.expect_removal_tree(&found);
            ctx.local.remove(&found).await?;
            info!(path = %path, "Local copy removed");
        }
        ctx.index.delete_subtree(&path.key()).await?;
        Ok(())
    }

    // ========================================================================
    // Observation and planning
    // ========================================================================

    async fn observe_local(&self, path: &RemotePath) -> Result<LocalSide> {
        let ctx = &self.ctx;
        let desired = ctx.root.local_for(path);
        let Some(found) = ctx.local.find_cased(&desired).await? else {
            return Ok(LocalSide {
                observed: Observed::Absent,
                path: desired,
                found: false,
                modified: None,
            });
        };

        let state = ctx.local.get_state(&found).await?;
        let observed = match state.item_type() {
            None => Observed::Absent,
            Some(ItemType::Folder) => Observed::Folder,
            Some(ItemType::File) => Observed::local_file(ctx.local.compute_hash(&found).await?),
        };
        Ok(LocalSide {
            found: !observed.is_absent(),
            observed,
            path: found,
            modified: state.modified,
        })
    }

    async fn observe_remote(&self, path: &RemotePath) -> Result<RemoteSide> {
        let remote = &self.ctx.remote;
        let meta = with_retry(&self.ctx.retry, "get_metadata", || remote.get_metadata(path)).await?;
        let observed = match &meta {
            None => Observed::Absent,
            Some(m) if m.is_folder() => Observed::Folder,
            Some(m) => {
                let hash = m
                    .content_hash
                    .clone()
                    .ok_or_else(|| anyhow!("Remote file {} has no content hash", m.path))?;
                Observed::remote_file(hash, m.revision.clone())
            }
        };
        Ok(RemoteSide { observed, meta })
    }

    fn direction_allows(&self, action: SyncAction) -> bool {
        match action {
            SyncAction::Upload | SyncAction::DeleteRemote => self.ctx.upload,
            SyncAction::Download | SyncAction::DeleteLocal => self.ctx.download,
            SyncAction::Conflict => self.ctx.upload && self.ctx.download,
            SyncAction::NoOp | SyncAction::Adopt | SyncAction::Forget => true,
        }
    }

    async fn reconcile_once(
        &self,
        path: &RemotePath,
        report: &mut ReconcileReport,
    ) -> Result<Step> {
        let entry = self.ctx.index.get(&path.key()).await;
        let local = self.observe_local(path).await?;
        let remote = self.observe_remote(path).await?;

        let decision = ChangeDetector::plan(entry.as_ref(), &local.observed, &remote.observed);
        if !self.direction_allows(decision.action) {
            debug!(
                path = %path,
                action = ?decision.action,
                "Direction disabled, leaving path alone"
            );
            return Ok(Step::Done);
        }

        match decision.action {
            SyncAction::NoOp => self.align_index_casing(entry, &remote).await,
            SyncAction::Upload => self.upload(entry.as_ref(), &local, &remote, report).await,
            SyncAction::Download => self.download(entry.as_ref(), &local, &remote, report).await,
            SyncAction::Adopt => self.adopt(entry.as_ref(), &local, &remote, report).await,
            SyncAction::Conflict => self.conflict(entry.as_ref(), &local, &remote, report).await,
            SyncAction::DeleteRemote => match entry {
                Some(entry) => self.delete_remote(path, &entry, &remote, report).await,
                None => Ok(Step::Replan),
            },
            SyncAction::DeleteLocal => match entry {
                Some(entry) => self.delete_local(path, &entry, &local, report).await,
                None => Ok(Step::Replan),
            },
            SyncAction::Forget => {
                self.ctx.index.delete_subtree(&path.key()).await?;
                Ok(Step::Done)
            }
        }
    }

    // ========================================================================
    // Actions
    // ========================================================================

    async fn align_index_casing(
        &self,
        entry: Option<IndexEntry>,
        remote: &RemoteSide,
    ) -> Result<Step> {
        if let (Some(mut entry), Some(meta)) = (entry, remote.meta.as_ref()) {
            if entry.path_cased() != &meta.path {
                debug!(from = %entry.path_cased(), to = %meta.path, "Adopting remote casing");
                entry.set_path_cased(meta.path.clone())?;
                self.ctx.index.put(entry).await?;
            }
        }
        Ok(Step::Done)
    }

    async fn upload(
        &self,
        entry: Option<&IndexEntry>,
        local: &LocalSide,
        remote: &RemoteSide,
        report: &mut ReconcileReport,
    ) -> Result<Step> {
        let ctx = &self.ctx;
        if !local.found {
            return Ok(Step::Replan);
        }
        let target = match &remote.meta {
            Some(meta) => meta.path.clone(),
            None => ctx.root.remote_for(&local.path)?,
        };
        validate_path(&target)?;
        let action = if remote.meta.is_some() {
            HistoryAction::Changed
        } else {
            HistoryAction::Added
        };

        // The remote holds the other kind of item: replace it
        let mut replaced = false;
        if let Some(meta) = &remote.meta {
            if local.observed.item_type() != Some(meta.item_type) {
                self.remote_delete(&meta.path).await?;
                ctx.index.delete_subtree(&meta.path.key()).await?;
                replaced = true;
            }
        }

        let remote_store = &ctx.remote;
        match &local.observed {
            Observed::Folder => {
                let meta = with_retry(&ctx.retry, "create_folder", || {
                    remote_store.create_folder(&target)
                })
                .await?;
                ctx.index.put(IndexEntry::folder(meta.path.clone())).await?;
                if entry.is_none() || replaced {
                    report.follow_ups.extend(self.local_children(&local.path).await?);
                }
                self.record(&meta.path, action, ItemType::Folder, EventSource::Local)
                    .await;
            }
            Observed::File { .. } => {
                let data = ctx.local.read_file(&local.path).await?;
                let hash = ContentHasher::hash_bytes(&data);
                let mode = match &remote.meta {
                    Some(meta) if !replaced => WriteMode::Update(meta.revision.clone()),
                    _ => WriteMode::Add,
                };
                let meta = with_retry(&ctx.retry, "upload", || {
                    remote_store.upload(&target, &data, mode.clone())
                })
                .await?;
                info!(path = %meta.path, rev = %meta.revision, bytes = data.len(), "Uploaded");
                ctx.index
                    .put(IndexEntry::file(
                        meta.path.clone(),
                        meta.revision.clone(),
                        hash,
                        local.modified,
                    )?)
                    .await?;
                self.record(&meta.path, action, ItemType::File, EventSource::Local)
                    .await;
            }
            Observed::Absent => return Ok(Step::Replan),
        }
        report.changed = true;
        Ok(Step::Done)
    }

    async fn download(
        &self,
        entry: Option<&IndexEntry>,
        local: &LocalSide,
        remote: &RemoteSide,
        report: &mut ReconcileReport,
    ) -> Result<Step> {
        let ctx = &self.ctx;
        let Some(meta) = remote.meta.clone() else {
            return Ok(Step::Replan);
        };
        let action = if local.found || entry.is_some() {
            HistoryAction::Changed
        } else {
            HistoryAction::Added
        };

        let mut local_present = local.found;
        if local.found && local.observed.item_type() != Some(meta.item_type) {
            match local.observed {
                // A folder may hold unsynced content; keep it under a conflict name
                Observed::Folder => {
                    let copy = self.set_aside(&local.path).await?;
                    report
                        .follow_ups
                        .push(SyncEvent::added(copy, EventSource::Local));
                }
                _ => {
                    ctx.ignore.expect_removal(&local.path);
                    ctx.local.remove(&local.path).await?;
                }
            }
            ctx.index.delete_subtree(&meta.path.key()).await?;
            local_present = false;
        }

        let target = if local_present {
            local.path.clone()
        } else {
            self.local_target(&meta.path).await?
        };

        if meta.is_folder() {
            if !local_present {
                ctx.ignore.expect_write(&target);
                ctx.local.create_directory(&target).await?;
            }
            self.match_local_casing(&target, &meta.path).await?;
            ctx.index.put(IndexEntry::folder(meta.path.clone())).await?;
            if !local_present {
                report.follow_ups.extend(self.remote_children(&meta.path).await?);
            }
            self.record(&meta.path, action, ItemType::Folder, EventSource::Remote)
                .await;
        } else {
            let remote_store = &ctx.remote;
            let (fresh, data) =
                with_retry(&ctx.retry, "download", || remote_store.download(&meta.path)).await?;
            let hash = ContentHasher::hash_bytes(&data);

            // Do not clobber a local edit made while we were downloading
            if local_present {
                if let Observed::File { hash: seen, .. } = &local.observed {
                    if &ctx.local.compute_hash(&target).await? != seen {
                        return Ok(Step::Replan);
                    }
                }
            }

            ctx.ignore.expect_write(&target);
            let state = ctx.local.write_file(&target, &data).await?;
            self.match_local_casing(&target, &fresh.path).await?;
            info!(path = %fresh.path, rev = %fresh.revision, bytes = data.len(), "Downloaded");
            ctx.index
                .put(IndexEntry::file(
                    fresh.path.clone(),
                    fresh.revision.clone(),
                    hash,
                    state.modified,
                )?)
                .await?;
            self.record(&fresh.path, action, ItemType::File, EventSource::Remote)
                .await;
        }
        report.changed = true;
        Ok(Step::Done)
    }

    async fn adopt(
        &self,
        entry: Option<&IndexEntry>,
        local: &LocalSide,
        remote: &RemoteSide,
        report: &mut ReconcileReport,
    ) -> Result<Step> {
        let Some(meta) = &remote.meta else {
            return Ok(Step::Replan);
        };
        let adopted = match &remote.observed {
            Observed::Folder => IndexEntry::folder(meta.path.clone()),
            Observed::File { hash, .. } => IndexEntry::file(
                meta.path.clone(),
                meta.revision.clone(),
                hash.clone(),
                local.modified,
            )?,
            Observed::Absent => return Ok(Step::Replan),
        };
        debug!(path = %meta.path, "Both sides agree, adopting remote state");
        self.ctx.index.put(adopted).await?;

        if entry.is_none() && meta.is_folder() {
            report.follow_ups.extend(self.local_children(&local.path).await?);
            report.follow_ups.extend(self.remote_children(&meta.path).await?);
        }
        Ok(Step::Done)
    }

    /// Keeps the local version under a conflict name, then takes the remote one
    async fn conflict(
        &self,
        entry: Option<&IndexEntry>,
        local: &LocalSide,
        remote: &RemoteSide,
        report: &mut ReconcileReport,
    ) -> Result<Step> {
        if !local.found || remote.meta.is_none() {
            return Ok(Step::Replan);
        }

        let copy = self.set_aside(&local.path).await?;
        warn!(
            path = %local.path.display(),
            copy = %copy,
            "Conflicting edits, kept local version as a conflicted copy"
        );
        report
            .follow_ups
            .push(SyncEvent::added(copy, EventSource::Local));

        let vacated = LocalSide {
            observed: Observed::Absent,
            path: local.path.clone(),
            found: false,
            modified: None,
        };
        let step = self.download(entry, &vacated, remote, report).await?;
        report.changed = true;
        Ok(step)
    }

    async fn delete_remote(
        &self,
        path: &RemotePath,
        entry: &IndexEntry,
        remote: &RemoteSide,
        report: &mut ReconcileReport,
    ) -> Result<Step> {
        let ctx = &self.ctx;
        let Some(meta) = &remote.meta else {
            ctx.index.delete_subtree(&path.key()).await?;
            return Ok(Step::Done);
        };

        if !entry.is_folder() {
            self.remote_delete(&meta.path).await?;
            ctx.index.delete(&path.key()).await?;
            self.record(&meta.path, HistoryAction::Removed, ItemType::File, EventSource::Local)
                .await;
            report.changed = true;
            return Ok(Step::Done);
        }

        let remote_store = &ctx.remote;
        let listing = with_retry(&ctx.retry, "list_folder", || {
            remote_store.list_folder(&meta.path, true)
        })
        .await?;
        let indexed: HashMap<PathKey, IndexEntry> = ctx
            .index
            .subtree(&path.key())
            .await
            .into_iter()
            .map(|e| (e.path_lower().clone(), e))
            .collect();

        let survivors: Vec<&RemoteMetadata> = listing
            .iter()
            .filter(|m| !remote_matches_index(m, indexed.get(&m.path.key())))
            .collect();

        if survivors.is_empty() {
            self.remote_delete(&meta.path).await?;
            ctx.index.delete_subtree(&path.key()).await?;
            self.record(&meta.path, HistoryAction::Removed, ItemType::Folder, EventSource::Local)
                .await;
            report.changed = true;
            return Ok(Step::Done);
        }

        info!(
            path = %meta.path,
            survivors = survivors.len(),
            "Folder changed remotely, deleting only unchanged items"
        );
        let doomed: Vec<&RemoteMetadata> = listing
            .iter()
            .filter(|m| !survivors.iter().any(|s| s.path.is_equal_or_descendant_of(&m.path)))
            .collect();
        let doomed_keys: HashSet<PathKey> = doomed.iter().map(|m| m.path.key()).collect();
        for item in &doomed {
            let topmost = item
                .path
                .parent()
                .map_or(true, |p| !doomed_keys.contains(&p.key()));
            if topmost {
                self.remote_delete(&item.path).await?;
                self.record(&item.path, HistoryAction::Removed, item.item_type, EventSource::Local)
                    .await;
            }
        }

        // What stays is unindexed now and comes back down as new items
        ctx.index.delete_subtree(&path.key()).await?;
        let mut kept: Vec<RemotePath> = listing
            .iter()
            .filter(|m| !doomed_keys.contains(&m.path.key()))
            .map(|m| m.path.clone())
            .collect();
        kept.push(meta.path.clone());
        kept.sort_by_key(RemotePath::key);
        report.follow_ups.extend(
            kept.into_iter()
                .map(|p| SyncEvent::changed(p, EventSource::Remote)),
        );
        report.changed = true;
        Ok(Step::Done)
    }

    async fn delete_local(
        &self,
        path: &RemotePath,
        entry: &IndexEntry,
        local: &LocalSide,
        report: &mut ReconcileReport,
    ) -> Result<Step> {
        let ctx = &self.ctx;
        match local.observed {
            Observed::Absent => {
                ctx.index.delete_subtree(&path.key()).await?;
                return Ok(Step::Done);
            }
            Observed::File { .. } => {
                ctx.ignore.expect_removal(&local.path);
                ctx.local.remove(&local.path).await?;
                ctx.index.delete(&path.key()).await?;
                self.record(
                    entry.path_cased(),
                    HistoryAction::Removed,
                    ItemType::File,
                    EventSource::Remote,
                )
                .await;
                report.changed = true;
                return Ok(Step::Done);
            }
            Observed::Folder => {}
        }

        let items = ctx.local.list_tree(&local.path).await?;
        let indexed: HashMap<PathKey, IndexEntry> = ctx
            .index
            .subtree(&path.key())
            .await
            .into_iter()
            .map(|e| (e.path_lower().clone(), e))
            .collect();

        let mut survivors: Vec<&Path> = Vec::new();
        for item in &items {
            let key = ctx.root.remote_for(&item.path)?.key();
            let unchanged = match indexed.get(&key) {
                None => false,
                Some(e) if e.item_type() != item.item_type => false,
                Some(e) if e.is_folder() => true,
                Some(e) if e.local_mtime().is_some() && e.local_mtime() == item.modified => true,
                Some(e) => e.content_hash() == Some(&ctx.local.compute_hash(&item.path).await?),
            };
            if !unchanged {
                survivors.push(&item.path);
            }
        }

        if survivors.is_empty() {
            ctx.ignore.expect_removal_tree(&local.path);
            ctx.local.remove(&local.path).await?;
            ctx.index.delete_subtree(&path.key()).await?;
            self.record(
                entry.path_cased(),
                HistoryAction::Removed,
                ItemType::Folder,
                EventSource::Remote,
            )
            .await;
            report.changed = true;
            return Ok(Step::Done);
        }

        info!(
            path = %local.path.display(),
            survivors = survivors.len(),
            "Folder changed locally, deleting only unchanged items"
        );
        let doomed: Vec<&Path> = items
            .iter()
            .map(|i| i.path.as_path())
            .filter(|p| !survivors.iter().any(|s| s.starts_with(p)))
            .collect();
        let doomed_set: HashSet<&Path> = doomed.iter().copied().collect();
        for item in &doomed {
            let topmost = item.parent().map_or(true, |p| !doomed_set.contains(p));
            if topmost {
                ctx.ignore.expect_removal_tree(item);
                ctx.local.remove(item).await?;
                let removed = ctx.root.remote_for(item)?;
                let item_type = indexed
                    .get(&removed.key())
                    .map_or(ItemType::File, IndexEntry::item_type);
                self.record(&removed, HistoryAction::Removed, item_type, EventSource::Remote)
                    .await;
            }
        }

        ctx.index.delete_subtree(&path.key()).await?;
        let mut kept: Vec<RemotePath> = vec![ctx.root.remote_for(&local.path)?];
        for item in &items {
            if !doomed_set.contains(item.path.as_path()) {
                kept.push(ctx.root.remote_for(&item.path)?);
            }
        }
        kept.sort_by_key(RemotePath::key);
        report.follow_ups.extend(
            kept.into_iter()
                .map(|p| SyncEvent::added(p, EventSource::Local)),
        );
        report.changed = true;
        Ok(Step::Done)
    }

    // ========================================================================
    // Moves
    // ========================================================================

    /// Replays a move on the other replica when the moved item is unchanged
    ///
    /// Returns `None` when the preconditions do not hold; the caller then
    /// reconciles source and destination independently.
    async fn try_move(
        &self,
        from: &RemotePath,
        to: &RemotePath,
        source: EventSource,
    ) -> Result<Option<ReconcileReport>> {
        let ctx = &self.ctx;
        if from == to || ctx.exclusions.is_excluded(from) || ctx.exclusions.is_excluded(to) {
            return Ok(None);
        }
        let Some(entry) = ctx.index.get(&from.key()).await else {
            return Ok(None);
        };
        let casing_only = from.key() == to.key();

        let result = match source {
            EventSource::Local if ctx.upload => {
                self.move_remote(&entry, from, to, casing_only).await
            }
            EventSource::Remote if ctx.download => {
                self.move_local(&entry, from, to, casing_only).await
            }
            _ => return Ok(None),
        };
        match result {
            Err(e) if is_race(&e) => {
                debug!(from = %from, to = %to, error = %e, "Move raced, reconciling both ends");
                Ok(None)
            }
            other => other,
        }
    }

    /// A local move, replayed on the remote
    async fn move_remote(
        &self,
        entry: &IndexEntry,
        from: &RemotePath,
        to: &RemotePath,
        casing_only: bool,
    ) -> Result<Option<ReconcileReport>> {
        let ctx = &self.ctx;
        if validate_path(to).is_err() {
            return Ok(None);
        }
        let local_to = self.observe_local(to).await?;
        if !local_matches_index(entry, &local_to.observed) {
            return Ok(None);
        }
        if !casing_only && self.observe_local(from).await?.found {
            return Ok(None);
        }
        let Some(remote_from) = self.observe_remote(from).await?.meta else {
            return Ok(None);
        };
        if !remote_matches_index(&remote_from, Some(entry)) {
            return Ok(None);
        }
        let target = ctx.root.remote_for(&local_to.path)?;
        if !casing_only && self.observe_remote(&target).await?.meta.is_some() {
            return Ok(None);
        }

        let moved = if remote_from.path == target {
            remote_from.clone()
        } else {
            let remote_store = &ctx.remote;
            with_retry(&ctx.retry, "move_item", || {
                remote_store.move_item(&remote_from.path, &target)
            })
            .await?
        };
        ctx.index.move_subtree(entry.path_cased(), &moved.path).await?;
        if let Some(hash) = entry.content_hash() {
            ctx.index
                .put(IndexEntry::file(
                    moved.path.clone(),
                    moved.revision.clone(),
                    hash.clone(),
                    local_to.modified,
                )?)
                .await?;
        }

        info!(from = %from, to = %moved.path, "Move replayed remotely");
        self.record_move(
            entry.path_cased(),
            &moved.path,
            entry.item_type(),
            EventSource::Local,
            casing_only,
        )
        .await;
        Ok(Some(ReconcileReport {
            changed: true,
            follow_ups: Vec::new(),
        }))
    }

    /// A remote move, replayed locally
    async fn move_local(
        &self,
        entry: &IndexEntry,
        from: &RemotePath,
        to: &RemotePath,
        casing_only: bool,
    ) -> Result<Option<ReconcileReport>> {
        let ctx = &self.ctx;
        let remote_to = self.observe_remote(to).await?;
        let Some(meta_to) = remote_to.meta.clone() else {
            return Ok(None);
        };
        if !local_matches_index(entry, &remote_to.observed) {
            return Ok(None);
        }
        if !casing_only && self.observe_remote(from).await?.meta.is_some() {
            return Ok(None);
        }
        let local_from = self.observe_local(from).await?;
        if !local_matches_index(entry, &local_from.observed) {
            return Ok(None);
        }

        let desired = if casing_only {
            match meta_to.path.file_name() {
                Some(name) => local_from.path.with_file_name(name),
                None => return Ok(None),
            }
        } else {
            if ctx
                .local
                .find_cased(&ctx.root.local_for(&meta_to.path))
                .await?
                .is_some()
            {
                return Ok(None);
            }
            self.local_target(&meta_to.path).await?
        };

        if desired != local_from.path {
            ctx.ignore.expect_rename(&local_from.path, &desired);
            ctx.local.rename(&local_from.path, &desired).await?;
        }
        ctx.index.move_subtree(entry.path_cased(), &meta_to.path).await?;
        if let Some(hash) = entry.content_hash() {
            ctx.index
                .put(IndexEntry::file(
                    meta_to.path.clone(),
                    meta_to.revision.clone(),
                    hash.clone(),
                    local_from.modified,
                )?)
                .await?;
        }

        info!(from = %from, to = %meta_to.path, "Move replayed locally");
        self.record_move(
            entry.path_cased(),
            &meta_to.path,
            entry.item_type(),
            EventSource::Remote,
            casing_only,
        )
        .await;
        Ok(Some(ReconcileReport {
            changed: true,
            follow_ups: Vec::new(),
        }))
    }

    async fn record_move(
        &self,
        from: &RemotePath,
        to: &RemotePath,
        item_type: ItemType,
        origin: EventSource,
        casing_only: bool,
    ) {
        if casing_only {
            self.record(to, HistoryAction::Changed, item_type, origin).await;
        } else {
            self.record(from, HistoryAction::Removed, item_type, origin).await;
            self.record(to, HistoryAction::Added, item_type, origin).await;
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn record(
        &self,
        path: &RemotePath,
        action: HistoryAction,
        item_type: ItemType,
        origin: EventSource,
    ) {
        self.ctx
            .history
            .record(HistoryEntry::new(path.clone(), action, item_type, origin))
            .await;
    }

    /// Deletes a remote item; an item that is already gone counts as deleted
    async fn remote_delete(&self, path: &RemotePath) -> Result<()> {
        let remote_store = &self.ctx.remote;
        match with_retry(&self.ctx.retry, "delete", || remote_store.delete(path)).await {
            Err(e) if is_remote_not_found(&e) => {
                debug!(path = %path, "Already gone remotely");
                Ok(())
            }
            other => other,
        }
    }

    /// Where a remote item lands locally, reusing the on-disk casing of its parent
    async fn local_target(&self, path: &RemotePath) -> Result<PathBuf> {
        let ctx = &self.ctx;
        let desired = ctx.root.local_for(path);
        let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
            return Ok(desired);
        };
        Ok(match ctx.local.find_cased(&ctx.root.local_for(&parent)).await? {
            Some(found) => found.join(name),
            None => desired,
        })
    }

    /// Renames `current` so its last component carries the remote casing
    async fn match_local_casing(&self, current: &Path, remote: &RemotePath) -> Result<PathBuf> {
        let Some(name) = remote.file_name() else {
            return Ok(current.to_path_buf());
        };
        if current.file_name().and_then(|n| n.to_str()) == Some(name) {
            return Ok(current.to_path_buf());
        }
        let desired = current.with_file_name(name);
        self.ctx.ignore.expect_rename(current, &desired);
        self.ctx.local.rename(current, &desired).await?;
        debug!(from = %current.display(), to = %desired.display(), "Local casing aligned");
        Ok(desired)
    }

    /// Moves a local item out of the way under a conflict name
    async fn set_aside(&self, path: &Path) -> Result<RemotePath> {
        let ctx = &self.ctx;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("No file name in {}", path.display()))?;
        let parent = path
            .parent()
            .ok_or_else(|| anyhow!("No parent for {}", path.display()))?;
        let at = Utc::now();
        let mut copy = None;
        for candidate in ConflictNamer::candidates(name, at) {
            let candidate = parent.join(candidate);
            if !ctx.local.get_state(&candidate).await?.exists {
                copy = Some(candidate);
                break;
            }
        }
        let copy = copy.unwrap_or_else(|| parent.join(ConflictNamer::random_candidate(name, at)));

        ctx.ignore.expect_rename(path, &copy);
        ctx.local.rename(path, &copy).await?;
        Ok(ctx.root.remote_for(&copy)?)
    }

    async fn local_children(&self, dir: &Path) -> Result<Vec<SyncEvent>> {
        let mut events = Vec::new();
        for item in self.ctx.local.list_tree(dir).await? {
            events.push(SyncEvent::added(
                self.ctx.root.remote_for(&item.path)?,
                EventSource::Local,
            ));
        }
        Ok(events)
    }

    async fn remote_children(&self, path: &RemotePath) -> Result<Vec<SyncEvent>> {
        let remote_store = &self.ctx.remote;
        let listed = with_retry(&self.ctx.retry, "list_folder", || {
            remote_store.list_folder(path, false)
        })
        .await;
        match listed {
            Ok(children) => Ok(children
                .into_iter()
                .map(|m| SyncEvent::added(m.path, EventSource::Remote))
                .collect()),
            Err(e) if is_remote_not_found(&e) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}
