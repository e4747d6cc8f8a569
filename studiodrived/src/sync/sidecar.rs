//! JSON state files kept next to mirrored items and at each project root.

use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use studiodrive_core::{Project, RemoteItem};
use thiserror::Error;

use super::fileops;
use super::paths::sidecar_path;

#[derive(Debug, Error)]
pub enum SidecarError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemSyncState {
    #[default]
    Pending,
    Synced,
    Syncing,
    Uploading,
    Downloading,
    Error,
    Conflict,
}

/// Contents of `<name>.metadata`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemSidecar {
    pub item: RemoteItem,
    #[serde(default)]
    pub sync_state: ItemSyncState,
    /// Hash of the bytes this process last wrote to or read from the item
    /// path. A local event carrying the same hash is an echo.
    #[serde(default)]
    pub local_hash: Option<String>,
    #[serde(default)]
    pub hydrated: bool,
}

impl ItemSidecar {
    /// Sidecar for an empty stand-in file; `local_hash` is the empty digest.
    pub fn placeholder(item: RemoteItem) -> Self {
        Self {
            item,
            sync_state: ItemSyncState::Pending,
            local_hash: Some(fileops::hash_bytes(&[])),
            hydrated: false,
        }
    }

    pub fn synced(item: RemoteItem, local_hash: String) -> Self {
        Self {
            item,
            sync_state: ItemSyncState::Synced,
            local_hash: Some(local_hash),
            hydrated: true,
        }
    }
}

/// Contents of `.project.metadata`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    pub project: Project,
    pub written_at: i64,
}

/// Reads the sidecar for `item_path`. Missing or unreadable JSON yields `None`
/// so a corrupt file is rebuilt from remote state.
pub async fn read_sidecar(item_path: &Path) -> Result<Option<ItemSidecar>, SidecarError> {
    let path = sidecar_path(item_path);
    let raw = match tokio::fs::read(&path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    match serde_json::from_slice(&raw) {
        Ok(sidecar) => Ok(Some(sidecar)),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "discarding malformed sidecar");
            Ok(None)
        }
    }
}

pub async fn write_sidecar(item_path: &Path, sidecar: &ItemSidecar) -> Result<(), SidecarError> {
    let bytes = serde_json::to_vec_pretty(sidecar)?;
    fileops::write_atomic(&sidecar_path(item_path), &bytes).await?;
    Ok(())
}

pub async fn remove_sidecar(item_path: &Path) -> Result<bool, SidecarError> {
    Ok(fileops::remove_file_if_exists(&sidecar_path(item_path)).await?)
}

/// Rewrites only the state field; no-op when there is no sidecar.
pub async fn update_state(item_path: &Path, state: ItemSyncState) -> Result<(), SidecarError> {
    if let Some(mut sidecar) = read_sidecar(item_path).await?
        && sidecar.sync_state != state
    {
        sidecar.sync_state = state;
        write_sidecar(item_path, &sidecar).await?;
    }
    Ok(())
}

pub async fn write_project_snapshot(
    path: &Path,
    project: &Project,
) -> Result<(), SidecarError> {
    let snapshot = ProjectSnapshot {
        project: project.clone(),
        written_at: fileops::now_millis(),
    };
    let bytes = serde_json::to_vec_pretty(&snapshot)?;
    fileops::write_atomic(path, &bytes).await?;
    Ok(())
}

pub async fn read_project_snapshot(path: &Path) -> Result<Option<ProjectSnapshot>, SidecarError> {
    match tokio::fs::read(path).await {
        Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use studiodrive_core::ItemCategory;
    use tempfile::tempdir;

    fn item() -> RemoteItem {
        RemoteItem {
            id: "t1".into(),
            project_id: "P1".into(),
            category: ItemCategory::Tracks,
            name: "song.wav".into(),
            locator: Some("P1/tracks/song.wav".into()),
            hash: Some("abc".into()),
            modified: 10,
            size: 3,
        }
    }

    #[tokio::test]
    async fn sidecar_is_written_next_to_item() {
        let dir = tempdir().unwrap();
        let item_path = dir.path().join("song.wav");
        write_sidecar(&item_path, &ItemSidecar::placeholder(item()))
            .await
            .unwrap();

        assert!(dir.path().join("song.wav.metadata").exists());
        let loaded = read_sidecar(&item_path).await.unwrap().unwrap();
        assert_eq!(loaded.item, item());
        assert!(!loaded.hydrated);
        assert_eq!(loaded.local_hash, Some(fileops::hash_bytes(b"")));
    }

    #[tokio::test]
    async fn malformed_sidecar_reads_as_missing() {
        let dir = tempdir().unwrap();
        let item_path = dir.path().join("song.wav");
        std::fs::write(dir.path().join("song.wav.metadata"), b"{not json").unwrap();
        assert!(read_sidecar(&item_path).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_state_keeps_other_fields() {
        let dir = tempdir().unwrap();
        let item_path = dir.path().join("song.wav");
        write_sidecar(&item_path, &ItemSidecar::synced(item(), "h".into()))
            .await
            .unwrap();
        update_state(&item_path, ItemSyncState::Uploading)
            .await
            .unwrap();
        let loaded = read_sidecar(&item_path).await.unwrap().unwrap();
        assert_eq!(loaded.sync_state, ItemSyncState::Uploading);
        assert_eq!(loaded.local_hash.as_deref(), Some("h"));
    }

    #[tokio::test]
    async fn project_snapshot_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".project.metadata");
        let project = Project {
            id: "P1".into(),
            name: "Album".into(),
            owner: "u1".into(),
            modified: 0,
        };
        write_project_snapshot(&path, &project).await.unwrap();
        let snapshot = read_project_snapshot(&path).await.unwrap().unwrap();
        assert_eq!(snapshot.project, project);
    }
}
