//! Local filesystem adapter (secondary/driven adapter)
//!
//! Implements [`ILocalFileSystem`] using `tokio::fs` for async file operations.
//!
//! ## Design Decisions
//!
//! - **Atomic writes**: content goes to a hidden temporary file in the target
//!   directory, then is renamed over the target. Temporary names are
//!   recognisable through [`is_temp_name`] so the watcher and the tree walk
//!   can skip them.
//! - **Content hash**: [`ContentHasher`] splits the stream into 4 MiB blocks,
//!   hashes each block with SHA-256 and hashes the concatenated block
//!   digests again. Local and remote hashes are therefore comparable without
//!   downloading content.
//! - **Casing**: the tree keeps whatever casing is on disk; [`find_cased`]
//!   resolves a path case-insensitively, one component at a time.
//!
//! [`find_cased`]: ILocalFileSystem::find_cased

use std::io::Read;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use driftsync_core::domain::{ContentHash, ItemType};
use driftsync_core::ports::{FileSystemState, ILocalFileSystem, LocalItem};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use crate::SyncError;

/// Prefix of temporary files created by atomic writes
pub const TEMP_PREFIX: &str = ".~driftsync.";

/// Returns true for names produced by [`temp_path_for`]
pub fn is_temp_name(name: &str) -> bool {
    name.starts_with(TEMP_PREFIX) && name.ends_with(".tmp")
}

/// Hidden sibling used while `target` is being written
fn temp_path_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let nonce = &uuid::Uuid::new_v4().simple().to_string()[..8];
    target.with_file_name(format!("{TEMP_PREFIX}{name}.{nonce}.tmp"))
}

// ============================================================================
// LocalFileSystemAdapter struct
// ============================================================================

/// Adapter that bridges the [`ILocalFileSystem`] port to the real filesystem.
///
/// This is a zero-sized struct because all operations take absolute paths.
/// The sync root lives at a higher layer.
#[derive(Debug, Clone, Default)]
pub struct LocalFileSystemAdapter;

impl LocalFileSystemAdapter {
    /// Create a new `LocalFileSystemAdapter`.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

// ============================================================================
// Content hashing
// ============================================================================

/// Streaming block hasher producing [`ContentHash`] values
///
/// ```text
/// hash = SHA256( SHA256(block_0) || SHA256(block_1) || ... )
/// ```
///
/// Every block but the last is exactly [`ContentHasher::BLOCK_SIZE`] bytes.
pub struct ContentHasher {
    overall: Sha256,
    block: Sha256,
    block_len: usize,
}

impl ContentHasher {
    /// Block size in bytes
    pub const BLOCK_SIZE: usize = 4 * 1024 * 1024;

    pub fn new() -> Self {
        Self {
            overall: Sha256::new(),
            block: Sha256::new(),
            block_len: 0,
        }
    }

    pub fn update(&mut self, mut input: &[u8]) {
        while !input.is_empty() {
            let take = (Self::BLOCK_SIZE - self.block_len).min(input.len());
            self.block.update(&input[..take]);
            self.block_len += take;
            input = &input[take..];

            if self.block_len == Self::BLOCK_SIZE {
                let digest = self.block.finalize_reset();
                self.overall.update(digest);
                self.block_len = 0;
            }
        }
    }

    pub fn finalize(mut self) -> ContentHash {
        if self.block_len > 0 {
            let digest = self.block.finalize();
            self.overall.update(digest);
        }
        let digest = self.overall.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        ContentHash::from_digest(&out)
    }

    /// Hash of an in-memory buffer
    pub fn hash_bytes(data: &[u8]) -> ContentHash {
        let mut hasher = Self::new();
        hasher.update(data);
        hasher.finalize()
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

fn modified_of(metadata: &std::fs::Metadata) -> Option<DateTime<Utc>> {
    metadata.modified().ok().map(DateTime::<Utc>::from)
}

// ============================================================================
// ILocalFileSystem implementation
// ============================================================================

#[async_trait::async_trait]
impl ILocalFileSystem for LocalFileSystemAdapter {
    #[instrument(skip(self), fields(path = %path.display()))]
    async fn read_file(&self, path: &Path) -> anyhow::Result<Vec<u8>> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| SyncError::from_io(e, path))?;
        debug!(bytes = data.len(), "file read complete");
        Ok(data)
    }

    #[instrument(skip(self, data), fields(path = %path.display(), bytes = data.len()))]
    async fn write_file(&self, path: &Path, data: &[u8]) -> anyhow::Result<FileSystemState> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SyncError::from_io(e, parent))?;
        }

        // Same directory, so the rename stays on one filesystem
        let tmp_path = temp_path_for(path);
        debug!(?tmp_path, "writing to temporary file");
        if let Err(e) = tokio::fs::write(&tmp_path, data).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(SyncError::from_io(e, path).into());
        }

        if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(SyncError::from_io(e, path).into());
        }

        debug!("atomic write complete");
        self.get_state(path).await
    }

    #[instrument(skip(self), fields(path = %path.display()))]
    async fn create_directory(&self, path: &Path) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| SyncError::from_io(e, path))?;
        debug!("directory created");
        Ok(())
    }

    #[instrument(skip(self), fields(path = %path.display()))]
    async fn remove(&self, path: &Path) -> anyhow::Result<()> {
        let metadata = match tokio::fs::symlink_metadata(path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("already absent");
                return Ok(());
            }
            Err(e) => return Err(SyncError::from_io(e, path).into()),
        };

        let result = if metadata.is_dir() {
            tokio::fs::remove_dir_all(path).await
        } else {
            tokio::fs::remove_file(path).await
        };

        match result {
            Ok(()) => {
                debug!(is_dir = metadata.is_dir(), "removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::from_io(e, path).into()),
        }
    }

    #[instrument(skip(self), fields(from = %from.display(), to = %to.display()))]
    async fn rename(&self, from: &Path, to: &Path) -> anyhow::Result<()> {
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SyncError::from_io(e, parent))?;
        }
        tokio::fs::rename(from, to)
            .await
            .map_err(|e| SyncError::from_io(e, from))?;
        debug!("renamed");
        Ok(())
    }

    #[instrument(skip(self), fields(path = %path.display()))]
    async fn get_state(&self, path: &Path) -> anyhow::Result<FileSystemState> {
        match tokio::fs::metadata(path).await {
            Ok(metadata) => {
                let is_file = metadata.is_file();
                Ok(FileSystemState {
                    exists: true,
                    is_file,
                    size: if is_file { metadata.len() } else { 0 },
                    modified: modified_of(&metadata),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("path does not exist");
                Ok(FileSystemState::not_found())
            }
            Err(e) => Err(SyncError::from_io(e, path).into()),
        }
    }

    #[instrument(skip(self), fields(path = %path.display()))]
    async fn compute_hash(&self, path: &Path) -> anyhow::Result<ContentHash> {
        let owned = path.to_path_buf();
        let hash = tokio::task::spawn_blocking(move || -> Result<ContentHash, SyncError> {
            let mut file =
                std::fs::File::open(&owned).map_err(|e| SyncError::from_io(e, &owned))?;
            let mut hasher = ContentHasher::new();
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = file
                    .read(&mut buf)
                    .map_err(|e| SyncError::from_io(e, &owned))?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            Ok(hasher.finalize())
        })
        .await??;

        debug!(hash = %hash, "hash computed");
        Ok(hash)
    }

    #[instrument(skip(self), fields(root = %root.display()))]
    async fn list_tree(&self, root: &Path) -> anyhow::Result<Vec<LocalItem>> {
        let mut items = Vec::new();
        let mut pending = vec![root.to_path_buf()];

        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| SyncError::from_io(e, &dir))?;

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| SyncError::from_io(e, &dir))?
            {
                let path = entry.path();
                if entry.file_name().to_str().is_some_and(is_temp_name) {
                    continue;
                }

                let metadata = match tokio::fs::symlink_metadata(&path).await {
                    Ok(m) => m,
                    // Raced with a delete
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(SyncError::from_io(e, &path).into()),
                };

                if metadata.is_dir() {
                    pending.push(path.clone());
                    items.push(LocalItem {
                        path,
                        item_type: ItemType::Folder,
                        size: 0,
                        modified: modified_of(&metadata),
                    });
                } else if metadata.is_file() {
                    items.push(LocalItem {
                        path,
                        item_type: ItemType::File,
                        size: metadata.len(),
                        modified: modified_of(&metadata),
                    });
                } else {
                    warn!(path = %path.display(), "Skipping special file or symlink");
                }
            }
        }

        items.sort_by(|a, b| a.path.cmp(&b.path));
        debug!(count = items.len(), "tree listed");
        Ok(items)
    }

    #[instrument(skip(self), fields(path = %path.display()))]
    async fn find_cased(&self, path: &Path) -> anyhow::Result<Option<PathBuf>> {
        let mut resolved = PathBuf::new();

        for component in path.components() {
            let name = match component {
                Component::Normal(name) => name,
                other => {
                    resolved.push(other.as_os_str());
                    continue;
                }
            };

            let exact = resolved.join(name);
            if tokio::fs::symlink_metadata(&exact).await.is_ok() {
                resolved = exact;
                continue;
            }

            let wanted = name.to_string_lossy().to_lowercase();
            let mut entries = match tokio::fs::read_dir(&resolved).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(SyncError::from_io(e, &resolved).into()),
            };

            let mut found = None;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| SyncError::from_io(e, &resolved))?
            {
                if entry.file_name().to_string_lossy().to_lowercase() == wanted {
                    found = Some(entry.path());
                    break;
                }
            }

            match found {
                Some(p) => resolved = p,
                None => return Ok(None),
            }
        }

        Ok(Some(resolved))
    }
}

// ============================================================================
// Unit tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn adapter() -> LocalFileSystemAdapter {
        LocalFileSystemAdapter::new()
    }

    // ------------------------------------------------------------------
    // read / write
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_read_write_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hello.txt");

        let state = adapter().write_file(&path, b"hello world").await.unwrap();
        assert!(state.is_regular_file());
        assert_eq!(state.size, 11);
        assert!(state.modified.is_some());

        let data = adapter().read_file(&path).await.unwrap();
        assert_eq!(data, b"hello world");
    }

    #[tokio::test]
    async fn test_write_creates_parent_dirs_and_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a").join("b").join("deep.txt");

        adapter().write_file(&path, b"nested").await.unwrap();
        adapter().write_file(&path, b"replaced").await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"replaced");
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| is_temp_name(&e.file_name().to_string_lossy()))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_read_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = adapter()
            .read_file(&dir.path().join("missing"))
            .await
            .unwrap_err();
        assert_eq!(crate::error_kind(&err), "not_found");
    }

    // ------------------------------------------------------------------
    // remove / rename
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_remove_file_directory_and_missing() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("f.txt");
        std::fs::write(&file, b"x").unwrap();
        let tree = dir.path().join("tree");
        std::fs::create_dir_all(tree.join("sub")).unwrap();
        std::fs::write(tree.join("sub").join("g.txt"), b"y").unwrap();

        adapter().remove(&file).await.unwrap();
        adapter().remove(&tree).await.unwrap();
        adapter().remove(&dir.path().join("never")).await.unwrap();

        assert!(!file.exists());
        assert!(!tree.exists());
    }

    #[tokio::test]
    async fn test_rename_creates_target_parent() {
        let dir = TempDir::new().unwrap();
        let from = dir.path().join("a.txt");
        std::fs::write(&from, b"x").unwrap();
        let to = dir.path().join("new").join("b.txt");

        adapter().rename(&from, &to).await.unwrap();
        assert!(!from.exists());
        assert_eq!(std::fs::read(&to).unwrap(), b"x");
    }

    // ------------------------------------------------------------------
    // get_state
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_get_state_file_directory_missing() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("s.txt");
        std::fs::write(&file, b"12345").unwrap();

        let state = adapter().get_state(&file).await.unwrap();
        assert_eq!(state.item_type(), Some(ItemType::File));
        assert_eq!(state.size, 5);

        let state = adapter().get_state(dir.path()).await.unwrap();
        assert!(state.is_directory());
        assert_eq!(state.size, 0);

        let state = adapter()
            .get_state(&dir.path().join("nope"))
            .await
            .unwrap();
        assert_eq!(state, FileSystemState::not_found());
    }

    // ------------------------------------------------------------------
    // hashing
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_compute_hash_matches_in_memory_hash() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("h.bin");
        std::fs::write(&path, b"some content").unwrap();

        let on_disk = adapter().compute_hash(&path).await.unwrap();
        assert_eq!(on_disk, ContentHasher::hash_bytes(b"some content"));
        assert_ne!(on_disk, ContentHasher::hash_bytes(b"other content"));
    }

    #[test]
    fn test_hasher_is_independent_of_chunking() {
        let data: Vec<u8> = (0..(ContentHasher::BLOCK_SIZE + 1000))
            .map(|i| (i % 251) as u8)
            .collect();

        let whole = ContentHasher::hash_bytes(&data);
        let mut hasher = ContentHasher::new();
        for chunk in data.chunks(65_537) {
            hasher.update(chunk);
        }
        assert_eq!(hasher.finalize(), whole);
    }

    #[test]
    fn test_hasher_uses_block_digests() {
        // One full block: the result is SHA256(SHA256(block))
        let block = vec![7u8; ContentHasher::BLOCK_SIZE];
        let inner = Sha256::digest(&block);
        let outer = Sha256::digest(inner);
        let mut expected = [0u8; 32];
        expected.copy_from_slice(&outer);

        assert_eq!(
            ContentHasher::hash_bytes(&block),
            ContentHash::from_digest(&expected)
        );
    }

    // ------------------------------------------------------------------
    // tree walk and casing
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_list_tree_skips_temp_files() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("d")).unwrap();
        std::fs::write(dir.path().join("d").join("x.txt"), b"1").unwrap();
        std::fs::write(dir.path().join(".~driftsync.x.txt.abcd1234.tmp"), b"").unwrap();

        let items = adapter().list_tree(dir.path()).await.unwrap();
        let names: Vec<_> = items
            .iter()
            .map(|i| i.path.strip_prefix(dir.path()).unwrap().to_path_buf())
            .collect();
        assert_eq!(names, vec![PathBuf::from("d"), PathBuf::from("d/x.txt")]);
        assert_eq!(items[0].item_type, ItemType::Folder);
        assert_eq!(items[1].size, 1);
    }

    #[tokio::test]
    async fn test_find_cased_resolves_each_component() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("Docs").join("Sub")).unwrap();
        std::fs::write(dir.path().join("Docs").join("Sub").join("Report.TXT"), b"r").unwrap();

        let found = adapter()
            .find_cased(&dir.path().join("docs").join("SUB").join("report.txt"))
            .await
            .unwrap();
        assert_eq!(
            found,
            Some(dir.path().join("Docs").join("Sub").join("Report.TXT"))
        );

        let missing = adapter()
            .find_cased(&dir.path().join("docs").join("nothing"))
            .await
            .unwrap();
        assert!(missing.is_none());
    }
}
