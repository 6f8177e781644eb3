//! IndexEntry domain entity
//!
//! One entry per synchronized file or folder. An entry exists exactly when
//! the engine believes the item is in sync on both sides.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::{ContentHash, PathKey, RemotePath, Revision};

/// Kind of synchronized item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    File,
    Folder,
}

impl ItemType {
    /// Returns true for folders
    pub fn is_folder(&self) -> bool {
        matches!(self, ItemType::Folder)
    }
}

impl std::fmt::Display for ItemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemType::File => write!(f, "file"),
            ItemType::Folder => write!(f, "folder"),
        }
    }
}

impl std::str::FromStr for ItemType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(ItemType::File),
            "folder" => Ok(ItemType::Folder),
            other => Err(DomainError::ValidationFailed(format!(
                "Unknown item type: {other}"
            ))),
        }
    }
}

/// Last known synchronized state of one path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    path_lower: PathKey,
    path_cased: RemotePath,
    item_type: ItemType,
    revision: Revision,
    content_hash: Option<ContentHash>,
    local_mtime: Option<DateTime<Utc>>,
}

impl IndexEntry {
    /// Creates a file entry
    ///
    /// # Errors
    /// Returns `DomainError::ValidationFailed` if `revision` is the folder sentinel
    pub fn file(
        path: RemotePath,
        revision: Revision,
        content_hash: ContentHash,
        local_mtime: Option<DateTime<Utc>>,
    ) -> Result<Self, DomainError> {
        if revision.is_folder() {
            return Err(DomainError::ValidationFailed(format!(
                "File {path} cannot carry the folder revision"
            )));
        }
        if path.is_root() {
            return Err(DomainError::ValidationFailed(
                "The root cannot be indexed as a file".to_string(),
            ));
        }
        Ok(Self {
            path_lower: path.key(),
            path_cased: path,
            item_type: ItemType::File,
            revision,
            content_hash: Some(content_hash),
            local_mtime,
        })
    }

    /// Creates a folder entry carrying the folder revision sentinel
    #[must_use]
    pub fn folder(path: RemotePath) -> Self {
        Self {
            path_lower: path.key(),
            path_cased: path,
            item_type: ItemType::Folder,
            revision: Revision::folder(),
            content_hash: None,
            local_mtime: None,
        }
    }

    /// Reconstructs an entry from persisted fields, re-checking invariants
    ///
    /// # Errors
    /// Returns error when the stored combination is inconsistent
    pub fn restore(
        path_cased: RemotePath,
        item_type: ItemType,
        revision: Revision,
        content_hash: Option<ContentHash>,
        local_mtime: Option<DateTime<Utc>>,
    ) -> Result<Self, DomainError> {
        match item_type {
            ItemType::Folder => {
                if !revision.is_folder() {
                    return Err(DomainError::ValidationFailed(format!(
                        "Folder {path_cased} has a content revision"
                    )));
                }
                Ok(Self::folder(path_cased))
            }
            ItemType::File => {
                let hash = content_hash.ok_or_else(|| {
                    DomainError::ValidationFailed(format!("File {path_cased} has no hash"))
                })?;
                Self::file(path_cased, revision, hash, local_mtime)
            }
        }
    }

    // --- accessors ---

    pub fn path_lower(&self) -> &PathKey {
        &self.path_lower
    }

    pub fn path_cased(&self) -> &RemotePath {
        &self.path_cased
    }

    pub fn item_type(&self) -> ItemType {
        self.item_type
    }

    pub fn is_folder(&self) -> bool {
        self.item_type.is_folder()
    }

    pub fn revision(&self) -> &Revision {
        &self.revision
    }

    pub fn content_hash(&self) -> Option<&ContentHash> {
        self.content_hash.as_ref()
    }

    pub fn local_mtime(&self) -> Option<DateTime<Utc>> {
        self.local_mtime
    }

    /// Replaces the display casing; the key must not change
    ///
    /// # Errors
    /// Returns error if `path` folds to a different key
    pub fn set_path_cased(&mut self, path: RemotePath) -> Result<(), DomainError> {
        if path.key() != self.path_lower {
            return Err(DomainError::ValidationFailed(format!(
                "{path} is not a casing variant of {}",
                self.path_cased
            )));
        }
        self.path_cased = path;
        Ok(())
    }
}
