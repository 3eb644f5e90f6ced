//! The filesystem surface the git engine runs against.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;

use crate::{Error, Result};

/// Mode reported for synthesized directories.
pub const DIR_MODE: u32 = 0o40755;
/// Mode reported for every file; the object store has no permission model.
pub const FILE_MODE: u32 = 0o100644;

/// Kind of filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// Stat-like record for a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub kind: EntryKind,
    /// Size in bytes (0 for directories).
    pub size: u64,
    pub mode: u32,
}

impl Metadata {
    pub fn directory() -> Self {
        Self {
            kind: EntryKind::Directory,
            size: 0,
            mode: DIR_MODE,
        }
    }

    pub fn file(size: u64) -> Self {
        Self {
            kind: EntryKind::File,
            size,
            mode: FILE_MODE,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}

/// Minimal filesystem over one repository's storage prefix.
///
/// Paths are relative to the repository root (`HEAD`, `refs/heads/main`,
/// `objects/ab/cdef..`). Missing paths fail with [`Error::NotFound`].
#[async_trait]
pub trait RepoFs: Send + Sync {
    /// Read the entire contents of a file.
    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Read a file as UTF-8 text.
    async fn read_to_string(&self, path: &str) -> Result<String> {
        let data = self.read(path).await?;
        String::from_utf8(data.to_vec()).map_err(|_| Error::InvalidUtf8(path.to_string()))
    }

    /// Write a file, replacing any previous content.
    async fn write(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Delete a file.
    async fn unlink(&self, path: &str) -> Result<()>;

    /// Immediate child names of a directory, sorted and deduplicated.
    ///
    /// A path with nothing below it yields an empty list.
    async fn readdir(&self, path: &str) -> Result<Vec<String>>;

    /// Record a directory so later `stat` calls see it.
    async fn mkdir(&self, path: &str) -> Result<()>;

    /// Remove a directory; with `recursive`, every key below it as well.
    async fn rmdir(&self, path: &str, recursive: bool) -> Result<()>;

    /// Metadata for a file or directory.
    async fn stat(&self, path: &str) -> Result<Metadata>;

    /// Same as [`RepoFs::stat`]; there are no symlinks to not follow.
    async fn lstat(&self, path: &str) -> Result<Metadata> {
        self.stat(path).await
    }

    /// Always fails: repositories stored here contain no symlinks.
    async fn readlink(&self, path: &str) -> Result<String> {
        Err(Error::NotFound(path.to_string()))
    }

    /// Accepted and ignored.
    async fn symlink(&self, _target: &str, _path: &str) -> Result<()> {
        Ok(())
    }

    /// Read many files at once. Missing paths are left out of the result,
    /// which is keyed by the paths as given.
    async fn batch_get(&self, paths: &[String]) -> Result<HashMap<String, Bytes>>;

    /// Forget any cached state for `path` so the next read hits the store.
    fn invalidate(&self, path: &str);

    /// Whether the path is a readable file.
    async fn exists(&self, path: &str) -> Result<bool> {
        match self.stat(path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}
