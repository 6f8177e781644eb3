//! Selective sync exclusion set
//!
//! The set stores only topmost excluded roots. A path is excluded when it
//! equals or lies below one of them. All comparisons ignore casing.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::newtypes::{PathKey, RemotePath};

/// Exclusion state of a single path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExclusionStatus {
    #[serde(rename = "included")]
    Included,
    #[serde(rename = "excluded")]
    Excluded,
    /// Not excluded itself, but some descendant is
    #[serde(rename = "partially excluded")]
    PartiallyExcluded,
}

impl std::fmt::Display for ExclusionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExclusionStatus::Included => write!(f, "included"),
            ExclusionStatus::Excluded => write!(f, "excluded"),
            ExclusionStatus::PartiallyExcluded => write!(f, "partially excluded"),
        }
    }
}

/// Ordered set of excluded subtree roots
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<RemotePath>", into = "Vec<RemotePath>")]
pub struct ExclusionSet {
    roots: Vec<RemotePath>,
}

impl ExclusionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set from arbitrary paths, collapsing descendants into the
    /// topmost listed ancestor
    pub fn from_paths<I>(paths: I) -> Self
    where
        I: IntoIterator<Item = RemotePath>,
    {
        let mut set = Self::new();
        for path in paths {
            set.exclude(path);
        }
        set
    }

    /// Excluded roots in key order
    pub fn paths(&self) -> &[RemotePath] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// True if `path` equals or descends from an excluded root
    pub fn is_excluded(&self, path: &RemotePath) -> bool {
        self.excluded_root_of(path).is_some()
    }

    /// The root that excludes `path`, if any
    pub fn excluded_root_of(&self, path: &RemotePath) -> Option<&RemotePath> {
        let key = path.key();
        self.roots
            .iter()
            .find(|root| key.is_equal_or_descendant_of(&root.key()))
    }

    /// Included, excluded, or partially excluded
    pub fn status(&self, path: &RemotePath) -> ExclusionStatus {
        if self.is_excluded(path) {
            return ExclusionStatus::Excluded;
        }
        let key = path.key();
        if self.roots.iter().any(|root| root.key().is_descendant_of(&key)) {
            ExclusionStatus::PartiallyExcluded
        } else {
            ExclusionStatus::Included
        }
    }

    /// Adds `path` as a root, dropping any roots below it
    ///
    /// Returns false when `path` was already excluded.
    pub fn exclude(&mut self, path: RemotePath) -> bool {
        if path.is_root() || self.is_excluded(&path) {
            return false;
        }
        let key = path.key();
        self.roots.retain(|root| !root.key().is_descendant_of(&key));
        self.roots.push(path);
        self.roots.sort_by_key(RemotePath::key);
        true
    }

    /// Folders whose children must be listed before `path` can be included
    ///
    /// Empty unless `path` lies strictly below an excluded root; otherwise the
    /// chain runs from that root down to the direct parent of `path`.
    pub fn expansion_chain(&self, path: &RemotePath) -> Vec<RemotePath> {
        let Some(root) = self.excluded_root_of(path) else {
            return Vec::new();
        };
        if root.key() == path.key() {
            return Vec::new();
        }
        let root_key = root.key();
        path.ancestors()
            .into_iter()
            .filter(|a| a.key().is_equal_or_descendant_of(&root_key))
            .collect()
    }

    /// Re-includes `path`
    ///
    /// Roots at or below `path` are dropped. If `path` sits below an excluded
    /// root, that root is replaced by the siblings along the chain down to
    /// `path`, so only `path` and its ancestors become included. `children`
    /// must hold the listing of every folder from [`Self::expansion_chain`].
    ///
    /// Returns the roots that were removed.
    pub fn include(
        &mut self,
        path: &RemotePath,
        children: &HashMap<PathKey, Vec<RemotePath>>,
    ) -> Vec<RemotePath> {
        let chain = self.expansion_chain(path);
        let key = path.key();

        let mut removed = Vec::new();
        self.roots.retain(|root| {
            let root_key = root.key();
            let drop = root_key.is_equal_or_descendant_of(&key) || key.is_descendant_of(&root_key);
            if drop {
                removed.push(root.clone());
            }
            !drop
        });

        for folder in &chain {
            let Some(listing) = children.get(&folder.key()) else {
                continue;
            };
            for child in listing {
                if !key.is_equal_or_descendant_of(&child.key()) {
                    self.roots.push(child.clone());
                }
            }
        }

        self.roots.sort_by_key(RemotePath::key);
        self.roots.dedup_by_key(|p| p.key());
        removed
    }
}

impl From<Vec<RemotePath>> for ExclusionSet {
    fn from(paths: Vec<RemotePath>) -> Self {
        Self::from_paths(paths)
    }
}

impl From<ExclusionSet> for Vec<RemotePath> {
    fn from(set: ExclusionSet) -> Self {
        set.roots
    }
}
