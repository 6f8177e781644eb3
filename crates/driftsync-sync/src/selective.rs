//! Selective sync
//!
//! [`ExclusionState`] holds the persisted exclusion set. Mutations run under
//! the exclusive side of [`TreeGate`], so they wait for in-flight
//! reconciliations to finish and none start until the local tree matches the
//! new set.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard};

use anyhow::Result;
use driftsync_core::domain::{ExclusionSet, ExclusionStatus, PathKey, RemotePath};
use driftsync_core::ports::{ISettingsStore, RemoteError};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock as AsyncRwLock};
use tracing::{info, instrument};

use crate::reconciler::{ReconcileReport, Reconciler};
use crate::retry::with_retry;

/// Persisted set of excluded remote subtrees
pub struct ExclusionState {
    settings: Arc<dyn ISettingsStore>,
    set: RwLock<ExclusionSet>,
}

impl ExclusionState {
    pub fn new(settings: Arc<dyn ISettingsStore>) -> Self {
        Self {
            settings,
            set: RwLock::new(ExclusionSet::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, ExclusionSet> {
        self.set.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replaces the in-memory set with the stored one
    pub async fn load(&self) -> Result<usize> {
        let stored = self.settings.get_excluded_items().await?;
        let count = stored.len();
        *self.set.write().unwrap_or_else(|p| p.into_inner()) = stored;
        Ok(count)
    }

    pub fn snapshot(&self) -> ExclusionSet {
        self.read().clone()
    }

    pub fn is_excluded(&self, path: &RemotePath) -> bool {
        self.read().is_excluded(path)
    }

    pub fn status(&self, path: &RemotePath) -> ExclusionStatus {
        self.read().status(path)
    }

    /// Persists `set`, then makes it current
    pub async fn replace(&self, set: ExclusionSet) -> Result<()> {
        self.settings.set_excluded_items(&set).await?;
        *self.set.write().unwrap_or_else(|p| p.into_inner()) = set;
        Ok(())
    }
}

/// Reconciliations hold the shared side; exclusion changes hold the
/// exclusive side
#[derive(Clone, Default)]
pub struct TreeGate {
    lock: Arc<AsyncRwLock<()>>,
}

impl TreeGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn shared(&self) -> OwnedRwLockReadGuard<()> {
        self.lock.clone().read_owned().await
    }

    pub async fn exclusive(&self) -> OwnedRwLockWriteGuard<()> {
        self.lock.clone().write_owned().await
    }
}

// ============================================================================
// Mutations
// ============================================================================

/// Checks that `path` exists remotely before the set changes
async fn require_remote(reconciler: &Reconciler, path: &RemotePath) -> Result<()> {
    let ctx = reconciler.context();
    let remote = &ctx.remote;
    let meta = with_retry(&ctx.retry, "get_metadata", || remote.get_metadata(path)).await?;
    if meta.is_none() {
        return Err(RemoteError::NotFound(path.to_string()).into());
    }
    Ok(())
}

/// Excludes `path` and deletes its local copy before returning
///
/// Returns false when `path` was already excluded.
#[instrument(skip(reconciler, gate))]
pub async fn exclude(reconciler: &Reconciler, gate: &TreeGate, path: &RemotePath) -> Result<bool> {
    require_remote(reconciler, path).await?;
    let _guard = gate.exclusive().await;
    let ctx = reconciler.context();

    let mut set = ctx.exclusions.snapshot();
    if !set.exclude(path.clone()) {
        return Ok(false);
    }
    ctx.exclusions.replace(set).await?;
    reconciler.drop_local_subtree(path).await?;
    info!(path = %path, "Excluded from sync");
    Ok(true)
}

/// Re-includes `path` and pulls its remote content before returning
///
/// Follow-ups for local items found during the pull are returned for the
/// caller to queue.
#[instrument(skip(reconciler, gate))]
pub async fn include(
    reconciler: &Reconciler,
    gate: &TreeGate,
    path: &RemotePath,
) -> Result<ReconcileReport> {
    require_remote(reconciler, path).await?;
    let _guard = gate.exclusive().await;
    let ctx = reconciler.context();

    let mut set = ctx.exclusions.snapshot();
    let chain = set.expansion_chain(path);
    let mut children: HashMap<PathKey, Vec<RemotePath>> = HashMap::new();
    for folder in &chain {
        let remote = &ctx.remote;
        let listing =
            with_retry(&ctx.retry, "list_folder", || remote.list_folder(folder, false)).await?;
        children.insert(folder.key(), listing.into_iter().map(|m| m.path).collect());
    }

    let removed = set.include(path, &children);
    if removed.is_empty() && chain.is_empty() {
        return Ok(ReconcileReport::default());
    }
    ctx.exclusions.replace(set).await?;
    info!(path = %path, removed = removed.len(), "Included in sync");

    // Everything that left the set needs a pull, but not what stayed excluded
    let mut report = ReconcileReport::default();
    let targets = if chain.is_empty() {
        removed
    } else {
        vec![path.clone()]
    };
    for target in targets {
        let mut ancestors = target.ancestors();
        ancestors.retain(|a| !a.is_root());
        for ancestor in ancestors {
            report.merge(reconciler.reconcile_path(&ancestor).await?);
        }
        report.merge(reconciler.pull_subtree(&target).await?);
    }
    report
        .follow_ups
        .retain(|e| !ctx.exclusions.is_excluded(e.primary_path()));
    Ok(report)
}

/// Replaces the whole set, applying the difference as excludes and includes
#[instrument(skip(reconciler, gate, paths), fields(count = paths.len()))]
pub async fn set_excluded_items(
    reconciler: &Reconciler,
    gate: &TreeGate,
    paths: Vec<RemotePath>,
) -> Result<ReconcileReport> {
    let ctx = reconciler.context();
    let target = ExclusionSet::from_paths(paths);
    let current = ctx.exclusions.snapshot();

    let mut report = ReconcileReport::default();
    for root in current.paths() {
        if !target.is_excluded(root) {
            report.merge(include(reconciler, gate, root).await?);
        }
    }
    // Includes may have split roots into siblings; compare against the new state
    let current = ctx.exclusions.snapshot();
    for root in target.paths() {
        if !current.is_excluded(root) || current.excluded_root_of(root) != Some(root) {
            exclude(reconciler, gate, root).await?;
        }
    }

    // Roots left over from splitting that the caller did not ask for
    let current = ctx.exclusions.snapshot();
    for root in current.paths() {
        if !target.is_excluded(root) {
            report.merge(include(reconciler, gate, root).await?);
        }
    }
    Ok(report)
}
