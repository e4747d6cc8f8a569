use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

use super::fileops;

/// Token every conflict copy carries in its file name.
pub const CONFLICT_MARKER: &str = "(conflict-";

const STAMP_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]-[minute]-[second]Z");
const STAMP_LEN: usize = 20;

#[derive(Debug, Error)]
pub enum ConflictError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timestamp format error: {0}")]
    Format(#[from] time::error::Format),
    #[error("path has no file name: {0}")]
    InvalidName(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictType {
    LocalNewer,
    RemoteNewer,
    BothModified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictAction {
    UploadLocal,
    DownloadRemote,
    CreateConflict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub conflict_type: ConflictType,
    pub action: ConflictAction,
    pub remote_locator: Option<String>,
    /// Set only for [`ConflictAction::CreateConflict`].
    pub conflict_copy: Option<PathBuf>,
}

/// Decides which side wins from hashes and mtimes (milliseconds).
///
/// Identical content is never a conflict. Otherwise the side whose mtime is
/// ahead by more than `tolerance_ms` wins, and anything closer is
/// `BothModified`. A missing remote hash counts as different content.
pub fn classify(
    local_hash: &str,
    remote_hash: Option<&str>,
    local_mtime: i64,
    remote_mtime: i64,
    tolerance_ms: i64,
) -> Option<ConflictType> {
    if remote_hash.is_some_and(|remote| remote.eq_ignore_ascii_case(local_hash)) {
        return None;
    }
    let tolerance = tolerance_ms.max(0);
    if local_mtime > remote_mtime.saturating_add(tolerance) {
        Some(ConflictType::LocalNewer)
    } else if remote_mtime > local_mtime.saturating_add(tolerance) {
        Some(ConflictType::RemoteNewer)
    } else {
        Some(ConflictType::BothModified)
    }
}

pub async fn detect_conflict(
    local_file: &Path,
    remote_hash: Option<&str>,
    remote_modified: i64,
    tolerance_ms: i64,
) -> Result<Option<ConflictType>, ConflictError> {
    let Some(local) = fileops::local_version(local_file).await? else {
        return Ok(None);
    };
    Ok(classify(
        &local.hash,
        remote_hash,
        local.modified,
        remote_modified,
        tolerance_ms,
    ))
}

pub async fn resolve_conflict(
    local_file: &Path,
    remote_locator: Option<&str>,
    conflict_type: ConflictType,
    user_id: &str,
    now: OffsetDateTime,
) -> Result<Resolution, ConflictError> {
    let (action, conflict_copy) = match conflict_type {
        ConflictType::LocalNewer => (ConflictAction::UploadLocal, None),
        ConflictType::RemoteNewer => (ConflictAction::DownloadRemote, None),
        ConflictType::BothModified => {
            let copy = create_conflict_copy(local_file, user_id, now).await?;
            (ConflictAction::CreateConflict, Some(copy))
        }
    };
    Ok(Resolution {
        conflict_type,
        action,
        remote_locator: remote_locator.map(str::to_string),
        conflict_copy,
    })
}

/// Only a plain remote win is safe to apply without a human.
pub fn can_auto_resolve(conflict_type: ConflictType) -> bool {
    matches!(conflict_type, ConflictType::RemoteNewer)
}

pub fn conflict_file_name(
    original: &str,
    user_id: &str,
    at: OffsetDateTime,
) -> Result<String, ConflictError> {
    let stamp = at.to_offset(UtcOffset::UTC).format(STAMP_FORMAT)?;
    let user = sanitize_user(user_id);
    if let Some((stem, ext)) = original.rsplit_once('.')
        && !stem.is_empty()
    {
        return Ok(format!("{stem} {CONFLICT_MARKER}{user}-{stamp}).{ext}"));
    }
    Ok(format!("{original} {CONFLICT_MARKER}{user}-{stamp})"))
}

pub fn is_conflict_file(name: &str) -> bool {
    conflict_timestamp(name).is_some()
}

/// Timestamp encoded in a conflict file name.
pub fn conflict_timestamp(name: &str) -> Option<OffsetDateTime> {
    let start = name.rfind(CONFLICT_MARKER)? + CONFLICT_MARKER.len();
    let rest = &name[start..];
    let inner = &rest[..rest.find(')')?];
    if inner.len() < STAMP_LEN + 1 {
        return None;
    }
    let stamp = inner.get(inner.len() - STAMP_LEN..)?;
    PrimitiveDateTime::parse(stamp, STAMP_FORMAT)
        .ok()
        .map(PrimitiveDateTime::assume_utc)
}

/// Copies `local_file` next to itself under a conflict name.
pub async fn create_conflict_copy(
    local_file: &Path,
    user_id: &str,
    at: OffsetDateTime,
) -> Result<PathBuf, ConflictError> {
    let name = local_file
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| ConflictError::InvalidName(local_file.to_path_buf()))?;
    let copy = local_file.with_file_name(conflict_file_name(name, user_id, at)?);
    fileops::copy_atomic(local_file, &copy, |_, _| {}).await?;
    Ok(copy)
}

pub async fn list_conflict_files(root: &Path) -> Result<Vec<PathBuf>, ConflictError> {
    let mut stack = vec![root.to_path_buf()];
    let mut out = Vec::new();
    while let Some(dir) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let path = entry.path();
            if file_type.is_dir() {
                stack.push(path);
            } else if entry.file_name().to_str().is_some_and(is_conflict_file) {
                out.push(path);
            }
        }
    }
    out.sort();
    Ok(out)
}

/// Deletes conflict copies older than `retention`; returns how many went.
pub async fn cleanup_conflict_files(
    root: &Path,
    retention: Duration,
    now: OffsetDateTime,
) -> Result<usize, ConflictError> {
    let cutoff = now - retention;
    let mut removed = 0;
    for path in list_conflict_files(root).await? {
        let Some(stamp) = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(conflict_timestamp)
        else {
            continue;
        };
        if stamp < cutoff && fileops::remove_file_if_exists(&path).await? {
            tracing::info!(path = %path.display(), "removed expired conflict copy");
            removed += 1;
        }
    }
    Ok(removed)
}

fn sanitize_user(user_id: &str) -> String {
    let cleaned: String = user_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}
