//! Storage Context (spec §4.A): an abstract file-I/O surface with `local`
//! and `in-memory` backends, both resolving paths scoped to one movie.
//!
//! The planner stages writes against [`MemoryBackend`] and only commits to
//! [`LocalBackend`] after the caller confirms the plan — a cancelled plan
//! then leaves disk untouched.
#![deny(unsafe_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

/// Errors raised by a [`StorageBackend`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The requested path does not exist.
    #[error("path not found: {path}")]
    NotFound {
        /// The path that was requested.
        path: String,
    },
    /// An underlying I/O operation failed.
    #[error("storage I/O error at {path}: {source}")]
    Io {
        /// The path being operated on.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The stored bytes were not valid UTF-8 when `read_string` was called.
    #[error("non-UTF-8 content at {path}")]
    NotUtf8 {
        /// The path that was requested.
        path: String,
    },
}

/// Metadata accompanying a [`StorageBackend::write`] call.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// MIME type of the payload, if known; backends may use this to choose a
    /// file extension (see `mge-blob`) but never alter the bytes themselves.
    pub mime_type: Option<String>,
}

/// Options for [`StorageBackend::list`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ListOptions {
    /// When `true`, recurse into subdirectories; otherwise list only the
    /// immediate children of `dir`.
    pub deep: bool,
}

/// Abstract file-I/O surface. Every path passed to a method is relative to
/// the backend's own root; callers that need movie scoping build a
/// [`MovieStorage`] on top of a backend instead of path-joining by hand.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read `path` and decode it as UTF-8.
    async fn read_string(&self, path: &str) -> Result<String, StorageError>;

    /// Read `path` as raw bytes.
    async fn read_bytes(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    /// Write `bytes` to `path`, creating parent directories as needed.
    /// Overwrites any existing content.
    async fn write(
        &self,
        path: &str,
        bytes: Vec<u8>,
        options: WriteOptions,
    ) -> Result<(), StorageError>;

    /// `true` if `path` names an existing file.
    async fn exists(&self, path: &str) -> Result<bool, StorageError>;

    /// `true` if `path` names an existing directory.
    async fn directory_exists(&self, path: &str) -> Result<bool, StorageError>;

    /// List entries under `dir`, relative to the backend root.
    async fn list(&self, dir: &str, options: ListOptions) -> Result<Vec<String>, StorageError>;

    /// Recursively remove everything under `dir`. Used only by workspace
    /// `clean` (spec §6); blobs are otherwise never deleted. A missing `dir`
    /// is not an error.
    async fn remove_dir(&self, dir: &str) -> Result<(), StorageError>;

    /// Write `bytes` to `path` such that a reader never observes a partial
    /// write: commit-point writes like `current.json` (spec §3 invariant 4,
    /// §6) need this, ordinary writes (blobs, event-log appends, manifests)
    /// don't. The default implementation just calls [`StorageBackend::write`];
    /// backends for which that isn't already atomic (i.e. [`LocalBackend`])
    /// override it with a write-temp-then-rename sequence.
    async fn write_atomic(
        &self,
        path: &str,
        bytes: Vec<u8>,
        options: WriteOptions,
    ) -> Result<(), StorageError> {
        self.write(path, bytes, options).await
    }
}

/// Resolves every path relative to `<root>/<base_path>/<movie_id>/…` before
/// delegating to an inner [`StorageBackend`].
pub struct MovieStorage<B: StorageBackend> {
    backend: B,
    base_path: String,
    movie_id: String,
}

impl<B: StorageBackend> MovieStorage<B> {
    /// Scope `backend` to `base_path/movie_id`.
    pub fn new(backend: B, base_path: impl Into<String>, movie_id: impl Into<String>) -> Self {
        Self {
            backend,
            base_path: base_path.into(),
            movie_id: movie_id.into(),
        }
    }

    fn scoped(&self, path: &str) -> String {
        let trimmed = path.trim_start_matches('/');
        format!("{}/{}/{}", self.base_path, self.movie_id, trimmed)
    }

    /// Borrow the scoped path a raw `path` resolves to, without performing
    /// any I/O. Used by callers (e.g. the blob store) that need to hand a
    /// filesystem path to an external renderer.
    #[must_use]
    pub fn resolve(&self, path: &str) -> String {
        self.scoped(path)
    }

    pub async fn read_string(&self, path: &str) -> Result<String, StorageError> {
        self.backend.read_string(&self.scoped(path)).await
    }

    pub async fn read_bytes(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        self.backend.read_bytes(&self.scoped(path)).await
    }

    pub async fn write(
        &self,
        path: &str,
        bytes: Vec<u8>,
        options: WriteOptions,
    ) -> Result<(), StorageError> {
        self.backend.write(&self.scoped(path), bytes, options).await
    }

    pub async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        self.backend.exists(&self.scoped(path)).await
    }

    pub async fn directory_exists(&self, path: &str) -> Result<bool, StorageError> {
        self.backend.directory_exists(&self.scoped(path)).await
    }

    pub async fn list(&self, dir: &str, options: ListOptions) -> Result<Vec<String>, StorageError> {
        self.backend.list(&self.scoped(dir), options).await
    }

    pub async fn remove_dir(&self, dir: &str) -> Result<(), StorageError> {
        self.backend.remove_dir(&self.scoped(dir)).await
    }

    pub async fn write_atomic(
        &self,
        path: &str,
        bytes: Vec<u8>,
        options: WriteOptions,
    ) -> Result<(), StorageError> {
        self.backend.write_atomic(&self.scoped(path), bytes, options).await
    }
}

/// A [`StorageBackend`] backed by the real filesystem, rooted at `root`.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Root every relative path at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    async fn read_string(&self, path: &str) -> Result<String, StorageError> {
        let full = self.full_path(path);
        tokio::fs::read_to_string(&full)
            .await
            .map_err(|source| io_err(path, source))
    }

    async fn read_bytes(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let full = self.full_path(path);
        tokio::fs::read(&full)
            .await
            .map_err(|source| io_err(path, source))
    }

    async fn write(
        &self,
        path: &str,
        bytes: Vec<u8>,
        _options: WriteOptions,
    ) -> Result<(), StorageError> {
        let full = self.full_path(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| io_err(path, source))?;
        }
        tokio::fs::write(&full, bytes)
            .await
            .map_err(|source| io_err(path, source))
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        Ok(tokio::fs::metadata(self.full_path(path))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false))
    }

    async fn directory_exists(&self, path: &str) -> Result<bool, StorageError> {
        Ok(tokio::fs::metadata(self.full_path(path))
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false))
    }

    async fn list(&self, dir: &str, options: ListOptions) -> Result<Vec<String>, StorageError> {
        let full = self.full_path(dir);
        if !full.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        if options.deep {
            for entry in walkdir::WalkDir::new(&full)
                .into_iter()
                .filter_map(Result::ok)
            {
                if entry.file_type().is_file() {
                    if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                        out.push(rel.to_string_lossy().replace('\\', "/"));
                    }
                }
            }
        } else {
            let mut read_dir = tokio::fs::read_dir(&full)
                .await
                .map_err(|source| io_err(dir, source))?;
            while let Some(entry) = read_dir
                .next_entry()
                .await
                .map_err(|source| io_err(dir, source))?
            {
                if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                    out.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        out.sort();
        Ok(out)
    }

    async fn remove_dir(&self, dir: &str) -> Result<(), StorageError> {
        let full = self.full_path(dir);
        match tokio::fs::remove_dir_all(&full).await {
            Ok(()) => Ok(()),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(io_err(dir, source)),
        }
    }

    async fn write_atomic(
        &self,
        path: &str,
        bytes: Vec<u8>,
        _options: WriteOptions,
    ) -> Result<(), StorageError> {
        let full = self.full_path(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| io_err(path, source))?;
        }
        let tmp = PathBuf::from(format!("{}.tmp-{}", full.display(), std::process::id()));
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|source| io_err(path, source))?;
        tokio::fs::rename(&tmp, &full)
            .await
            .map_err(|source| io_err(path, source))
    }
}

fn io_err(path: &str, source: std::io::Error) -> StorageError {
    if source.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound {
            path: path.to_string(),
        }
    } else {
        StorageError::Io {
            path: path.to_string(),
            source,
        }
    }
}

/// A [`StorageBackend`] backed by an in-process `BTreeMap`. Used by the
/// planner to stage writes without touching disk.
#[derive(Default)]
pub struct MemoryBackend {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    /// Create an empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn normalize(path: &str) -> String {
        path.trim_start_matches('/').to_string()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn read_string(&self, path: &str) -> Result<String, StorageError> {
        let bytes = self.read_bytes(path).await?;
        String::from_utf8(bytes).map_err(|_| StorageError::NotUtf8 {
            path: path.to_string(),
        })
    }

    async fn read_bytes(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let key = Self::normalize(path);
        let files = self.files.lock().expect("memory backend lock poisoned");
        files
            .get(&key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                path: path.to_string(),
            })
    }

    async fn write(
        &self,
        path: &str,
        bytes: Vec<u8>,
        _options: WriteOptions,
    ) -> Result<(), StorageError> {
        let key = Self::normalize(path);
        let mut files = self.files.lock().expect("memory backend lock poisoned");
        files.insert(key, bytes);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        let key = Self::normalize(path);
        let files = self.files.lock().expect("memory backend lock poisoned");
        Ok(files.contains_key(&key))
    }

    async fn directory_exists(&self, path: &str) -> Result<bool, StorageError> {
        let prefix = format!("{}/", Self::normalize(path).trim_end_matches('/'));
        let files = self.files.lock().expect("memory backend lock poisoned");
        Ok(files.keys().any(|k| k.starts_with(&prefix)))
    }

    async fn list(&self, dir: &str, options: ListOptions) -> Result<Vec<String>, StorageError> {
        let prefix = {
            let d = Self::normalize(dir);
            if d.is_empty() {
                String::new()
            } else {
                format!("{}/", d.trim_end_matches('/'))
            }
        };
        let files = self.files.lock().expect("memory backend lock poisoned");
        let mut out: Vec<String> = files
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .filter(|k| {
                if options.deep {
                    true
                } else {
                    !k[prefix.len()..].contains('/')
                }
            })
            .cloned()
            .collect();
        out.sort();
        Ok(out)
    }

    async fn remove_dir(&self, dir: &str) -> Result<(), StorageError> {
        let prefix = format!("{}/", Self::normalize(dir).trim_end_matches('/'));
        let mut files = self.files.lock().expect("memory backend lock poisoned");
        files.retain(|k, _| !k.starts_with(&prefix));
        Ok(())
    }
}
