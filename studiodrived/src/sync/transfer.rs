use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use sha2::{Digest, Sha256};
use studiodrive_core::{
    BackendError, ItemCategory, ItemWrite, MetadataStore, ObjectStore, RemoteItem,
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;

use super::fileops;

pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;
pub const DEFAULT_SINGLE_SHOT_LIMIT: u64 = 8 * 1024 * 1024;
pub const DEFAULT_WHOLE_FETCH_THRESHOLD: u64 = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("download integrity check failed: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },
    #[error("item {0} has no content locator")]
    MissingLocator(String),
    #[error("object {locator} ended at {received} of {expected} bytes")]
    ShortRead {
        locator: String,
        received: u64,
        expected: u64,
    },
    #[error("source is not a regular file: {0}")]
    NotAFile(PathBuf),
}

impl TransferError {
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Backend(err) => err.is_retryable(),
            TransferError::Io(err) => !matches!(
                err.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
            ),
            TransferError::IntegrityMismatch { .. } | TransferError::ShortRead { .. } => true,
            TransferError::MissingLocator(_) | TransferError::NotAFile(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    pub chunk_size: usize,
    pub single_shot_limit: u64,
    pub whole_fetch_threshold: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            single_shot_limit: DEFAULT_SINGLE_SHOT_LIMIT,
            whole_fetch_threshold: DEFAULT_WHOLE_FETCH_THRESHOLD,
        }
    }
}

/// Identifies the remote slot an upload or delete targets.
#[derive(Debug, Clone, Copy)]
pub struct ItemSlot<'a> {
    pub project_id: &'a str,
    pub category: ItemCategory,
    pub name: &'a str,
}

impl ItemSlot<'_> {
    pub fn default_locator(&self) -> String {
        format!("{}/{}/{}", self.project_id, self.category.as_str(), self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uploaded {
    pub item: RemoteItem,
    pub hash: String,
}

/// Moves bytes between the mirror and the object store.
#[derive(Clone)]
pub struct TransferExecutor {
    metadata: Arc<dyn MetadataStore>,
    objects: Arc<dyn ObjectStore>,
    config: TransferConfig,
}

impl TransferExecutor {
    pub fn new(metadata: Arc<dyn MetadataStore>, objects: Arc<dyn ObjectStore>) -> Self {
        Self::with_config(metadata, objects, TransferConfig::default())
    }

    pub fn with_config(
        metadata: Arc<dyn MetadataStore>,
        objects: Arc<dyn ObjectStore>,
        config: TransferConfig,
    ) -> Self {
        Self {
            metadata,
            objects,
            config: TransferConfig {
                chunk_size: config.chunk_size.max(1),
                ..config
            },
        }
    }

    pub fn config(&self) -> TransferConfig {
        self.config
    }

    /// Sends `source` to the object store, then records its metadata.
    pub async fn upload(
        &self,
        slot: ItemSlot<'_>,
        source: &Path,
        existing_locator: Option<&str>,
        progress: &watch::Sender<f32>,
    ) -> Result<Uploaded, TransferError> {
        let meta = tokio::fs::metadata(source).await?;
        if !meta.is_file() {
            return Err(TransferError::NotAFile(source.to_path_buf()));
        }
        let hash = fileops::hash_file(source).await?;
        let size = meta.len();
        let modified = fileops::mtime_millis(&meta);
        let locator = existing_locator
            .map(str::to_string)
            .unwrap_or_else(|| slot.default_locator());

        if size <= self.config.single_shot_limit {
            let bytes = tokio::fs::read(source).await?;
            self.objects.write_object(&locator, bytes).await?;
            report(progress, 1.0);
        } else {
            let mut file = tokio::fs::File::open(source).await?;
            let mut buffer = vec![0u8; self.config.chunk_size];
            let mut sent = 0u64;
            let mut parts = 0u32;
            loop {
                let read = fill_chunk(&mut file, &mut buffer).await?;
                if read == 0 {
                    break;
                }
                self.objects
                    .write_part(&locator, parts, buffer[..read].to_vec())
                    .await?;
                parts += 1;
                sent += read as u64;
                report(progress, sent as f32 / size as f32);
            }
            self.objects.complete_multipart(&locator, parts).await?;
            tracing::debug!(%locator, parts, size, "multipart upload completed");
        }

        let item = self
            .metadata
            .upsert_item(&ItemWrite {
                project_id: slot.project_id.to_string(),
                category: slot.category,
                name: slot.name.to_string(),
                locator,
                hash: hash.clone(),
                size,
                modified,
            })
            .await?;
        Ok(Uploaded { item, hash })
    }

    /// Writes `item`'s content to `target` via a partial file and returns the
    /// hash of the bytes written.
    pub async fn download(
        &self,
        item: &RemoteItem,
        target: &Path,
        progress: &watch::Sender<f32>,
    ) -> Result<String, TransferError> {
        let locator = item
            .locator
            .as_deref()
            .ok_or_else(|| TransferError::MissingLocator(item.id.clone()))?;
        let size = self.objects.object_size(locator).await?;

        fileops::ensure_parent(target).await?;
        let partial = fileops::partial_path(target);
        let result = self
            .fetch_into(locator, size, &partial, item.hash.as_deref(), progress)
            .await;
        let actual = match result {
            Ok(actual) => actual,
            Err(err) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(err);
            }
        };
        tokio::fs::rename(&partial, target).await?;
        report(progress, 1.0);
        Ok(actual)
    }

    async fn fetch_into(
        &self,
        locator: &str,
        size: u64,
        partial: &Path,
        expected_hash: Option<&str>,
        progress: &watch::Sender<f32>,
    ) -> Result<String, TransferError> {
        let mut file = tokio::fs::File::create(partial).await?;
        let mut hasher = Sha256::new();

        if size < self.config.whole_fetch_threshold {
            let bytes = self.objects.read_object(locator).await?;
            hasher.update(&bytes);
            file.write_all(&bytes).await?;
        } else {
            let chunk = self.config.chunk_size as u64;
            let mut offset = 0u64;
            while offset < size {
                let len = chunk.min(size - offset);
                let bytes = self.objects.read_range(locator, offset, len).await?;
                if bytes.is_empty() {
                    return Err(TransferError::ShortRead {
                        locator: locator.to_string(),
                        received: offset,
                        expected: size,
                    });
                }
                hasher.update(&bytes);
                file.write_all(&bytes).await?;
                offset += bytes.len() as u64;
                report(progress, offset as f32 / size as f32);
            }
        }

        file.flush().await?;
        file.sync_all().await?;

        let actual = format!("{:x}", hasher.finalize());
        if let Some(expected) = expected_hash
            && !expected.eq_ignore_ascii_case(&actual)
        {
            return Err(TransferError::IntegrityMismatch {
                expected: expected.to_ascii_lowercase(),
                actual,
            });
        }
        Ok(actual)
    }

    /// Removes the record and the object; either already being gone is fine.
    pub async fn delete(
        &self,
        slot: ItemSlot<'_>,
        locator: Option<&str>,
    ) -> Result<(), TransferError> {
        match self
            .metadata
            .delete_item(slot.project_id, slot.category, slot.name)
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                tracing::debug!(name = slot.name, "remote record already removed");
            }
            Err(err) => return Err(err.into()),
        }
        if let Some(locator) = locator {
            match self.objects.delete_object(locator).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

fn report(progress: &watch::Sender<f32>, value: f32) {
    progress.send_replace(value.clamp(0.0, 1.0));
}

async fn fill_chunk<R: AsyncRead + Unpin>(reader: &mut R, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let read = reader.read(&mut buffer[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use studiodrive_core::{MemoryBackend, Project};
    use tempfile::tempdir;

    fn small_config() -> TransferConfig {
        TransferConfig {
            chunk_size: 4,
            single_shot_limit: 8,
            whole_fetch_threshold: 8,
        }
    }

    fn backend() -> Arc<MemoryBackend> {
        let backend = Arc::new(MemoryBackend::with_identity("u1", "User"));
        backend.add_project(Project {
            id: "P1".into(),
            name: "Album".into(),
            owner: "u1".into(),
            modified: 0,
        });
        backend
    }

    fn executor(backend: &Arc<MemoryBackend>) -> TransferExecutor {
        TransferExecutor::with_config(backend.clone(), backend.clone(), small_config())
    }

    fn slot(name: &str) -> ItemSlot<'_> {
        ItemSlot {
            project_id: "P1",
            category: ItemCategory::Tracks,
            name,
        }
    }

    #[tokio::test]
    async fn small_upload_is_single_shot_and_records_hash() {
        let backend = backend();
        let dir = tempdir().unwrap();
        let source = dir.path().join("song.wav");
        std::fs::write(&source, b"abc").unwrap();
        let (tx, rx) = watch::channel(0.0);

        let uploaded = executor(&backend)
            .upload(slot("song.wav"), &source, None, &tx)
            .await
            .unwrap();

        assert_eq!(uploaded.hash, fileops::hash_bytes(b"abc"));
        assert_eq!(uploaded.item.locator.as_deref(), Some("P1/tracks/song.wav"));
        assert_eq!(backend.object("P1/tracks/song.wav").unwrap(), b"abc");
        assert_eq!(*rx.borrow(), 1.0);
        assert_eq!(backend.write_attempts(), 1);
    }

    #[tokio::test]
    async fn large_upload_goes_out_in_parts() {
        let backend = backend();
        let dir = tempdir().unwrap();
        let source = dir.path().join("big.wav");
        let payload = b"0123456789abcdefghij".to_vec();
        std::fs::write(&source, &payload).unwrap();
        let (tx, _rx) = watch::channel(0.0);

        executor(&backend)
            .upload(slot("big.wav"), &source, Some("custom/loc"), &tx)
            .await
            .unwrap();

        assert_eq!(backend.object("custom/loc").unwrap(), payload);
        assert_eq!(backend.write_attempts(), 5);
        let record = backend
            .item("P1", ItemCategory::Tracks, "big.wav")
            .unwrap();
        assert_eq!(record.size, payload.len() as u64);
    }

    #[tokio::test]
    async fn chunked_download_reassembles_and_verifies() {
        let backend = backend();
        let payload = b"0123456789abcdefghij".to_vec();
        let item = backend.seed_item(
            ItemWrite {
                project_id: "P1".into(),
                category: ItemCategory::Tracks,
                name: "big.wav".into(),
                locator: "P1/tracks/big.wav".into(),
                hash: fileops::hash_bytes(&payload),
                size: payload.len() as u64,
                modified: 1,
            },
            payload.clone(),
        );
        let dir = tempdir().unwrap();
        let target = dir.path().join("Tracks/big.wav");
        let (tx, rx) = watch::channel(0.0);

        let hash = executor(&backend).download(&item, &target, &tx).await.unwrap();

        assert_eq!(hash, fileops::hash_bytes(&payload));
        assert_eq!(std::fs::read(&target).unwrap(), payload);
        assert!(!fileops::partial_path(&target).exists());
        assert_eq!(*rx.borrow(), 1.0);
    }

    #[tokio::test]
    async fn hash_mismatch_discards_partial_and_keeps_target() {
        let backend = backend();
        let item = backend.seed_item(
            ItemWrite {
                project_id: "P1".into(),
                category: ItemCategory::Tracks,
                name: "song.wav".into(),
                locator: "P1/tracks/song.wav".into(),
                hash: fileops::hash_bytes(b"expected"),
                size: 8,
                modified: 1,
            },
            b"tampered".to_vec(),
        );
        let dir = tempdir().unwrap();
        let target = dir.path().join("song.wav");
        std::fs::write(&target, b"previous").unwrap();
        let (tx, _rx) = watch::channel(0.0);

        let err = executor(&backend)
            .download(&item, &target, &tx)
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::IntegrityMismatch { .. }));
        assert!(err.is_retryable());
        assert_eq!(std::fs::read(&target).unwrap(), b"previous");
        assert!(!fileops::partial_path(&target).exists());
    }

    #[tokio::test]
    async fn delete_tolerates_missing_record_and_object() {
        let backend = backend();
        executor(&backend)
            .delete(slot("gone.wav"), Some("P1/tracks/gone.wav"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn injected_failure_is_retryable() {
        let backend = backend();
        backend.fail_next_writes(1);
        let dir = tempdir().unwrap();
        let source = dir.path().join("song.wav");
        std::fs::write(&source, b"abc").unwrap();
        let (tx, _rx) = watch::channel(0.0);

        let err = executor(&backend)
            .upload(slot("song.wav"), &source, None, &tx)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
