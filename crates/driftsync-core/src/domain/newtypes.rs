//! Paths, revisions, fingerprints and cursors
//!
//! Every value here is checked once when it is built, so code holding one
//! never re-validates it.

use std::fmt::{self, Display, Formatter};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::DomainError;

// ============================================================================
// Local path types
// ============================================================================

/// Absolute, normalized local path (no `.` or `..` components)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "PathBuf", into = "PathBuf")]
pub struct SyncPath(PathBuf);

impl SyncPath {
    /// Fails with `InvalidPath` for relative input
    pub fn new(path: PathBuf) -> Result<Self, DomainError> {
        if !path.is_absolute() {
            return Err(DomainError::InvalidPath(format!(
                "Path must be absolute: {}",
                path.display()
            )));
        }

        let normalized = Self::normalize_path(&path)?;
        Ok(Self(normalized))
    }

    /// Like [`SyncPath::new`], additionally requiring `path` to sit under `sync_root`
    pub fn new_within_root(path: PathBuf, sync_root: &SyncPath) -> Result<Self, DomainError> {
        let sync_path = Self::new(path)?;

        if !sync_path.0.starts_with(&sync_root.0) {
            return Err(DomainError::PathNotInSyncRoot(format!(
                "{} is not within sync root {}",
                sync_path.0.display(),
                sync_root.0.display()
            )));
        }

        Ok(sync_path)
    }

    /// Get the inner path reference
    #[must_use]
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Convert to owned PathBuf
    #[must_use]
    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }

    /// Local location of a remote path below this root
    #[must_use]
    pub fn local_for(&self, remote: &RemotePath) -> PathBuf {
        if remote.is_root() {
            return self.0.clone();
        }
        self.0.join(remote.as_str().trim_start_matches('/'))
    }

    /// Remote path that mirrors a local path below this root
    ///
    /// # Errors
    /// Returns error if `local` is outside the root or not valid UTF-8
    pub fn remote_for(&self, local: &Path) -> Result<RemotePath, DomainError> {
        let relative = local.strip_prefix(&self.0).map_err(|_| {
            DomainError::PathNotInSyncRoot(format!(
                "{} is not within {}",
                local.display(),
                self.0.display()
            ))
        })?;

        let mut remote = String::new();
        for component in relative.components() {
            match component {
                Component::Normal(c) => {
                    let name = c.to_str().ok_or_else(|| {
                        DomainError::InvalidPath(format!(
                            "Path is not valid UTF-8: {}",
                            local.display()
                        ))
                    })?;
                    remote.push('/');
                    remote.push_str(name);
                }
                Component::CurDir => {}
                _ => {
                    return Err(DomainError::InvalidPath(format!(
                        "Unexpected path component in {}",
                        local.display()
                    )))
                }
            }
        }

        if remote.is_empty() {
            Ok(RemotePath::root())
        } else {
            RemotePath::new(remote)
        }
    }

    /// Normalize a path by resolving . and .. components
    fn normalize_path(path: &Path) -> Result<PathBuf, DomainError> {
        let mut normalized = PathBuf::new();

        for component in path.components() {
            match component {
                Component::Prefix(p) => normalized.push(p.as_os_str()),
                Component::RootDir => normalized.push("/"),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(DomainError::InvalidPath(
                            "Path escapes root via ..".to_string(),
                        ));
                    }
                }
                Component::Normal(c) => normalized.push(c),
            }
        }

        Ok(normalized)
    }
}

impl Display for SyncPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl TryFrom<PathBuf> for SyncPath {
    type Error = DomainError;

    fn try_from(path: PathBuf) -> Result<Self, Self::Error> {
        Self::new(path)
    }
}

impl From<SyncPath> for PathBuf {
    fn from(sync_path: SyncPath) -> Self {
        sync_path.0
    }
}

impl AsRef<Path> for SyncPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

// ============================================================================
// Remote namespace paths
// ============================================================================

/// A path in the remote namespace, carrying its display casing
///
/// Always starts with `/`; the root is `/`. Comparisons between remote paths
/// that must ignore casing go through [`PathKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RemotePath(String);

impl RemotePath {
    /// Create a new RemotePath
    ///
    /// # Errors
    /// Returns error if the path doesn't start with `/`, has empty, `.` or
    /// `..` components, or ends with a slash
    pub fn new(path: String) -> Result<Self, DomainError> {
        if !path.starts_with('/') {
            return Err(DomainError::InvalidRemotePath(format!(
                "Remote path must start with '/': {path}"
            )));
        }

        if path == "/" {
            return Ok(Self(path));
        }

        if path.ends_with('/') {
            return Err(DomainError::InvalidRemotePath(format!(
                "Remote path must not end with '/': {path}"
            )));
        }

        if path.contains('\0') {
            return Err(DomainError::InvalidRemotePath(format!(
                "Remote path contains a NUL byte: {path:?}"
            )));
        }

        for component in path[1..].split('/') {
            if component.is_empty() {
                return Err(DomainError::InvalidRemotePath(format!(
                    "Remote path contains invalid double slashes: {path}"
                )));
            }
            if component == "." || component == ".." {
                return Err(DomainError::InvalidRemotePath(format!(
                    "Remote path contains invalid traversal: {path}"
                )));
            }
        }

        Ok(Self(path))
    }

    /// Create the root path "/"
    #[must_use]
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true for `/`
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Case-folded lookup key for this path
    #[must_use]
    pub fn key(&self) -> PathKey {
        PathKey(self.0.to_lowercase())
    }

    /// Join a single path component
    ///
    /// # Errors
    /// Returns error if component is invalid
    pub fn join(&self, component: &str) -> Result<Self, DomainError> {
        if component.is_empty()
            || component.contains('/')
            || component == "."
            || component == ".."
        {
            return Err(DomainError::InvalidRemotePath(format!(
                "Invalid path component: {component}"
            )));
        }

        let new_path = if self.is_root() {
            format!("/{component}")
        } else {
            format!("{}/{component}", self.0)
        };

        Self::new(new_path)
    }

    /// Get the parent path
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }

        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// Get the last path component
    #[must_use]
    pub fn file_name(&self) -> Option<&str> {
        if self.is_root() {
            return None;
        }

        self.0.rsplit('/').next()
    }

    /// Same parent, different last component
    ///
    /// # Errors
    /// Returns error for the root or an invalid name
    pub fn with_file_name(&self, name: &str) -> Result<Self, DomainError> {
        let parent = self.parent().ok_or_else(|| {
            DomainError::InvalidRemotePath("The root has no file name".to_string())
        })?;
        parent.join(name)
    }

    /// Case-insensitive: `self` equals `other` or lies below it
    #[must_use]
    pub fn is_equal_or_descendant_of(&self, other: &RemotePath) -> bool {
        self.key().is_equal_or_descendant_of(&other.key())
    }

    /// Case-insensitive: `self` lies strictly below `other`
    #[must_use]
    pub fn is_descendant_of(&self, other: &RemotePath) -> bool {
        self.key().is_descendant_of(&other.key())
    }

    /// Ancestors from the root down to the direct parent
    #[must_use]
    pub fn ancestors(&self) -> Vec<RemotePath> {
        let mut chain = Vec::new();
        let mut current = self.parent();
        while let Some(p) = current {
            current = p.parent();
            chain.push(p);
        }
        chain.reverse();
        chain
    }
}

impl Display for RemotePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RemotePath {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for RemotePath {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<RemotePath> for String {
    fn from(path: RemotePath) -> Self {
        path.0
    }
}

/// Case-folded remote path: the only key used for index lookups
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PathKey(String);

impl PathKey {
    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Rebuild a key from its stored form, re-folding defensively
    #[must_use]
    pub fn from_stored(s: &str) -> Self {
        Self(s.to_lowercase())
    }

    /// `self` lies strictly below `other`
    #[must_use]
    pub fn is_descendant_of(&self, other: &PathKey) -> bool {
        if other.0 == "/" {
            return self.0 != "/";
        }
        self.0.len() > other.0.len()
            && self.0.starts_with(&other.0)
            && self.0.as_bytes()[other.0.len()] == b'/'
    }

    /// `self` equals `other` or lies below it
    #[must_use]
    pub fn is_equal_or_descendant_of(&self, other: &PathKey) -> bool {
        self == other || self.is_descendant_of(other)
    }
}

impl Display for PathKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&RemotePath> for PathKey {
    fn from(path: &RemotePath) -> Self {
        path.key()
    }
}

// ============================================================================
// Remote versioning types
// ============================================================================

/// Opaque remote version token assigned per write
///
/// Folders carry the [`Revision::FOLDER`] sentinel since they have no content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Revision(String);

impl Revision {
    /// Sentinel revision stored for directories
    pub const FOLDER: &'static str = "folder";

    /// Create a new Revision
    ///
    /// # Errors
    /// Returns error if the revision is empty or contains whitespace
    pub fn new(rev: String) -> Result<Self, DomainError> {
        if rev.is_empty() {
            return Err(DomainError::InvalidRevision(
                "Revision cannot be empty".to_string(),
            ));
        }
        if rev.chars().any(char::is_whitespace) {
            return Err(DomainError::InvalidRevision(format!(
                "Revision contains whitespace: {rev}"
            )));
        }
        Ok(Self(rev))
    }

    /// The folder sentinel
    #[must_use]
    pub fn folder() -> Self {
        Self(Self::FOLDER.to_string())
    }

    /// Returns true for the folder sentinel
    #[must_use]
    pub fn is_folder(&self) -> bool {
        self.0 == Self::FOLDER
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Revision {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Revision {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for Revision {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<Revision> for String {
    fn from(rev: Revision) -> Self {
        rev.0
    }
}

/// Content fingerprint: lowercase hex SHA-256 over 4 MiB block digests
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    /// Length of the hex encoding of a SHA-256 digest
    const HEX_LEN: usize = 64;

    /// Create a new ContentHash
    ///
    /// # Errors
    /// Returns error if the hash is not 64 hex characters
    pub fn new(hash: String) -> Result<Self, DomainError> {
        if hash.len() != Self::HEX_LEN {
            return Err(DomainError::InvalidHash(format!(
                "Hash has wrong length: expected {} characters, got {}",
                Self::HEX_LEN,
                hash.len()
            )));
        }

        if !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DomainError::InvalidHash(format!(
                "Hash is not hexadecimal: {hash}"
            )));
        }

        Ok(Self(hash.to_ascii_lowercase()))
    }

    /// Build from a raw 32-byte digest
    #[must_use]
    pub fn from_digest(digest: &[u8; 32]) -> Self {
        let mut hex = String::with_capacity(Self::HEX_LEN);
        for byte in digest {
            hex.push_str(&format!("{byte:02x}"));
        }
        Self(hex)
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContentHash {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for ContentHash {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.0
    }
}

/// Opaque resumable position in the remote change stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cursor(String);

impl Cursor {
    /// Create a new Cursor
    ///
    /// # Errors
    /// Returns error if the cursor is empty
    pub fn new(cursor: String) -> Result<Self, DomainError> {
        if cursor.is_empty() {
            return Err(DomainError::InvalidCursor(
                "Cursor cannot be empty".to_string(),
            ));
        }
        Ok(Self(cursor))
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Cursor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Cursor {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for Cursor {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<Cursor> for String {
    fn from(cursor: Cursor) -> Self {
        cursor.0
    }
}

// ============================================================================
// Tests
// ============================================================================
