//! Content-addressed Blob Store (spec §4.C):
//! `blobs/<hash[0..2]>/<hash>[.ext]`, `put`/`get`/`exists`.
#![deny(unsafe_code)]

use mge_core::{BlobRef, sha256_hex};
use mge_storage::{ListOptions, StorageBackend, StorageError, WriteOptions};

/// Errors raised by the blob store.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    /// The underlying storage backend failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// No blob matching `hash` exists (any extension).
    #[error("no blob found for hash {hash}")]
    NotFound {
        /// The hash that was looked up.
        hash: String,
    },
}

/// A payload to persist: raw bytes plus an optional MIME type used only to
/// pick a file extension.
#[derive(Debug, Clone)]
pub struct BlobPayload {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

impl BlobPayload {
    /// Wrap bytes with no declared MIME type.
    #[must_use]
    pub fn bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            mime_type: None,
        }
    }

    /// Wrap bytes with a declared MIME type.
    #[must_use]
    pub fn with_mime(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: Some(mime_type.into()),
        }
    }
}

/// Map a MIME type to the file extension the blob store appends. Unknown or
/// absent MIME types get no extension.
#[must_use]
pub fn extension_for_mime(mime_type: Option<&str>) -> Option<&'static str> {
    match mime_type {
        Some("application/json") => Some("json"),
        Some("text/plain") => Some("txt"),
        Some("text/markdown") => Some("md"),
        Some("image/png") => Some("png"),
        Some("image/jpeg") => Some("jpg"),
        Some("image/webp") => Some("webp"),
        Some("audio/mpeg") => Some("mp3"),
        Some("audio/wav") | Some("audio/x-wav") => Some("wav"),
        Some("video/mp4") => Some("mp4"),
        Some("application/octet-stream") | None => None,
        Some(_) => None,
    }
}

fn blob_path(hash: &str, ext: Option<&str>) -> String {
    let prefix = &hash[..hash.len().min(2)];
    match ext {
        Some(e) => format!("blobs/{prefix}/{hash}.{e}"),
        None => format!("blobs/{prefix}/{hash}"),
    }
}

/// Content-addressed store layered over a [`StorageBackend`].
pub struct BlobStore<'a, B: StorageBackend> {
    storage: &'a mge_storage::MovieStorage<B>,
}

impl<'a, B: StorageBackend> BlobStore<'a, B> {
    /// Build a blob store scoped to `storage`'s movie.
    #[must_use]
    pub fn new(storage: &'a mge_storage::MovieStorage<B>) -> Self {
        Self { storage }
    }

    /// Hash `payload`, write it once under its content-addressed path, and
    /// return the resulting reference. A second `put` of identical bytes is
    /// a no-op write (the file already exists with identical content).
    pub async fn put(&self, payload: BlobPayload) -> Result<BlobRef, BlobError> {
        let hash = sha256_hex(&payload.bytes);
        let ext = extension_for_mime(payload.mime_type.as_deref());
        let path = blob_path(&hash, ext);
        if !self.storage.exists(&path).await? {
            self.storage
                .write(
                    &path,
                    payload.bytes.clone(),
                    WriteOptions {
                        mime_type: payload.mime_type.clone(),
                    },
                )
                .await?;
        }
        Ok(BlobRef {
            hash,
            size: payload.bytes.len() as u64,
            mime_type: payload.mime_type,
        })
    }

    /// Stream the bytes referenced by `blob_ref` back out.
    pub async fn get(&self, blob_ref: &BlobRef) -> Result<Vec<u8>, BlobError> {
        let ext = extension_for_mime(blob_ref.mime_type.as_deref());
        let path = blob_path(&blob_ref.hash, ext);
        match self.storage.read_bytes(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(StorageError::NotFound { .. }) => {
                // Fall back to scanning the prefix directory: the caller may
                // not know the exact extension a blob was written with.
                self.find_by_hash(&blob_ref.hash).await
            }
            Err(other) => Err(other.into()),
        }
    }

    /// `true` if a blob for `hash` exists under any extension.
    pub async fn exists(&self, hash: &str) -> Result<bool, BlobError> {
        let prefix = &hash[..hash.len().min(2)];
        let entries = self
            .storage
            .list(&format!("blobs/{prefix}"), ListOptions::default())
            .await?;
        Ok(entries.iter().any(|e| file_stem_matches(e, hash)))
    }

    /// Resolve the on-disk path a blob lives at, without reading it — used
    /// to hand external renderers a direct file path (spec §4.O).
    pub async fn blob_path(&self, blob_ref: &BlobRef) -> Result<String, BlobError> {
        let ext = extension_for_mime(blob_ref.mime_type.as_deref());
        let path = blob_path(&blob_ref.hash, ext);
        if self.storage.exists(&path).await? {
            return Ok(self.storage.resolve(&path));
        }
        let prefix = &blob_ref.hash[..blob_ref.hash.len().min(2)];
        let entries = self
            .storage
            .list(&format!("blobs/{prefix}"), ListOptions::default())
            .await?;
        entries
            .into_iter()
            .find(|e| file_stem_matches(e, &blob_ref.hash))
            .map(|e| self.storage.resolve(&e))
            .ok_or_else(|| BlobError::NotFound {
                hash: blob_ref.hash.clone(),
            })
    }

    async fn find_by_hash(&self, hash: &str) -> Result<Vec<u8>, BlobError> {
        let prefix = &hash[..hash.len().min(2)];
        let entries = self
            .storage
            .list(&format!("blobs/{prefix}"), ListOptions::default())
            .await?;
        for entry in entries {
            if file_stem_matches(&entry, hash) {
                return Ok(self.storage.read_bytes(&entry).await?);
            }
        }
        Err(BlobError::NotFound {
            hash: hash.to_string(),
        })
    }
}

fn file_stem_matches(entry: &str, hash: &str) -> bool {
    let name = entry.rsplit('/').next().unwrap_or(entry);
    name == hash || name.starts_with(&format!("{hash}."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mge_storage::MemoryBackend;

    #[tokio::test]
    async fn put_is_content_addressed_and_idempotent() {
        let backend = MemoryBackend::new();
        let storage = mge_storage::MovieStorage::new(backend, "movies", "m1");
        let store = BlobStore::new(&storage);

        let first = store.put(BlobPayload::bytes(b"hello".to_vec())).await.unwrap();
        let second = store.put(BlobPayload::bytes(b"hello".to_vec())).await.unwrap();
        assert_eq!(first.hash, second.hash);
        assert_eq!(first.size, 5);
    }

    #[tokio::test]
    async fn put_with_mime_appends_extension() {
        let backend = MemoryBackend::new();
        let storage = mge_storage::MovieStorage::new(backend, "movies", "m1");
        let store = BlobStore::new(&storage);

        let blob_ref = store
            .put(BlobPayload::with_mime(b"{}".to_vec(), "application/json"))
            .await
            .unwrap();
        let path = store.blob_path(&blob_ref).await.unwrap();
        assert!(path.ends_with(".json"), "path was {path}");
    }

    #[tokio::test]
    async fn get_round_trips_bytes() {
        let backend = MemoryBackend::new();
        let storage = mge_storage::MovieStorage::new(backend, "movies", "m1");
        let store = BlobStore::new(&storage);

        let blob_ref = store
            .put(BlobPayload::with_mime(b"payload".to_vec(), "text/plain"))
            .await
            .unwrap();
        let bytes = store.get(&blob_ref).await.unwrap();
        assert_eq!(bytes, b"payload");
    }

    #[tokio::test]
    async fn exists_reflects_stored_hash() {
        let backend = MemoryBackend::new();
        let storage = mge_storage::MovieStorage::new(backend, "movies", "m1");
        let store = BlobStore::new(&storage);

        let blob_ref = store.put(BlobPayload::bytes(b"x".to_vec())).await.unwrap();
        assert!(store.exists(&blob_ref.hash).await.unwrap());
        assert!(!store.exists("0000000000000000000000000000000000000000000000000000000000000000").await.unwrap());
    }

    #[test]
    fn extension_table_covers_common_media_types() {
        assert_eq!(extension_for_mime(Some("image/png")), Some("png"));
        assert_eq!(extension_for_mime(Some("audio/mpeg")), Some("mp3"));
        assert_eq!(extension_for_mime(Some("video/mp4")), Some("mp4"));
        assert_eq!(extension_for_mime(None), None);
    }
}
