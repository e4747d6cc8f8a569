use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use sha2::{Digest, Sha256};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const READ_BUFFER_SIZE: usize = 64 * 1024;
pub const COPY_CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum FileOpsError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("directory {path} is not writable: {source}")]
    NotWritable { path: PathBuf, source: io::Error },
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

pub async fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn mtime_millis(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or_else(now_millis)
}

/// Hash, size and mtime of a local file, or `None` when it does not exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVersion {
    pub hash: String,
    pub size: u64,
    pub modified: i64,
}

pub async fn local_version(path: &Path) -> io::Result<Option<LocalVersion>> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => meta,
        Ok(_) => return Ok(None),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    let hash = hash_file(path).await?;
    Ok(Some(LocalVersion {
        hash,
        size: meta.len(),
        modified: mtime_millis(&meta),
    }))
}

pub fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}

pub async fn ensure_parent(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

/// Writes `bytes` next to `target` and renames over it once flushed.
pub async fn write_atomic(target: &Path, bytes: &[u8]) -> io::Result<()> {
    ensure_parent(target).await?;
    let partial = partial_path(target);
    let mut file = tokio::fs::File::create(&partial).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);
    if let Err(err) = tokio::fs::rename(&partial, target).await {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(err);
    }
    Ok(())
}

/// Copies `source` to `target` chunk by chunk through a partial file.
///
/// `on_chunk` receives `(copied, total)` after every chunk. The target path
/// only ever holds the previous content or the complete copy.
pub async fn copy_atomic<F>(source: &Path, target: &Path, mut on_chunk: F) -> io::Result<u64>
where
    F: FnMut(u64, u64),
{
    ensure_parent(target).await?;
    let mut reader = tokio::fs::File::open(source).await?;
    let total = reader.metadata().await?.len();
    let partial = partial_path(target);
    let mut writer = tokio::fs::File::create(&partial).await?;
    let mut buffer = vec![0u8; COPY_CHUNK_SIZE];
    let mut copied = 0u64;

    let result: io::Result<()> = async {
        loop {
            let read = reader.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            writer.write_all(&buffer[..read]).await?;
            copied += read as u64;
            on_chunk(copied, total);
        }
        writer.flush().await?;
        writer.sync_all().await?;
        Ok(())
    }
    .await;

    drop(writer);
    if let Err(err) = result {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(err);
    }
    tokio::fs::rename(&partial, target).await?;
    Ok(copied)
}

/// Creates and removes a probe file to check that `dir` accepts writes.
pub async fn probe_writable(dir: &Path) -> Result<(), FileOpsError> {
    let probe = dir.join(format!(".studiodrive-probe-{}", std::process::id()));
    let outcome = async {
        tokio::fs::write(&probe, b"probe").await?;
        tokio::fs::remove_file(&probe).await
    }
    .await;
    outcome.map_err(|source| FileOpsError::NotWritable {
        path: dir.to_path_buf(),
        source,
    })
}

pub async fn remove_file_if_exists(path: &Path) -> io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}
