use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::broadcast;

use crate::sync::queue::TaskKind;

const NOTIFICATION_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProjectSyncStatus {
    Pending,
    Synced,
    Syncing,
    Error,
    Conflict,
}

impl ProjectSyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProjectSyncStatus::Pending => "pending",
            ProjectSyncStatus::Synced => "synced",
            ProjectSyncStatus::Syncing => "syncing",
            ProjectSyncStatus::Error => "error",
            ProjectSyncStatus::Conflict => "conflict",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncNotification {
    ProjectStatusChanged {
        project_id: String,
        status: ProjectSyncStatus,
    },
    ConflictCreated {
        project_id: String,
        original: PathBuf,
        copy: PathBuf,
    },
    TaskFailed {
        kind: TaskKind,
        path: PathBuf,
        error: String,
    },
    /// A local deletion was refused and the item put back.
    ItemRestored {
        project_id: String,
        path: PathBuf,
    },
}

/// Fan-out point for user-facing sync notifications plus the latest status
/// of every known project.
pub struct StatusHub {
    tx: broadcast::Sender<SyncNotification>,
    projects: Mutex<HashMap<String, ProjectSyncStatus>>,
}

impl Default for StatusHub {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            tx,
            projects: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncNotification> {
        self.tx.subscribe()
    }

    pub fn notify(&self, notification: SyncNotification) {
        let _ = self.tx.send(notification);
    }

    /// Records the status and notifies only on an actual change.
    pub fn set_project_status(&self, project_id: &str, status: ProjectSyncStatus) {
        let previous = self
            .lock()
            .insert(project_id.to_string(), status);
        if previous != Some(status) {
            tracing::debug!(project_id, status = status.as_str(), "project status changed");
            self.notify(SyncNotification::ProjectStatusChanged {
                project_id: project_id.to_string(),
                status,
            });
        }
    }

    pub fn project_status(&self, project_id: &str) -> Option<ProjectSyncStatus> {
        self.lock().get(project_id).copied()
    }

    pub fn project_statuses(&self) -> BTreeMap<String, ProjectSyncStatus> {
        self.lock()
            .iter()
            .map(|(id, status)| (id.clone(), *status))
            .collect()
    }

    pub fn remove_project(&self, project_id: &str) {
        self.lock().remove(project_id);
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Worst status across projects: error, then conflict, then syncing.
    pub fn overall(&self) -> ProjectSyncStatus {
        let projects = self.lock();
        let mut has_conflict = false;
        let mut has_syncing = false;
        let mut all_synced = !projects.is_empty();
        for status in projects.values() {
            match status {
                ProjectSyncStatus::Error => return ProjectSyncStatus::Error,
                ProjectSyncStatus::Conflict => has_conflict = true,
                ProjectSyncStatus::Syncing => has_syncing = true,
                ProjectSyncStatus::Pending => all_synced = false,
                ProjectSyncStatus::Synced => {}
            }
        }
        if has_conflict {
            ProjectSyncStatus::Conflict
        } else if has_syncing {
            ProjectSyncStatus::Syncing
        } else if all_synced {
            ProjectSyncStatus::Synced
        } else {
            ProjectSyncStatus::Pending
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ProjectSyncStatus>> {
        self.projects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_change_is_announced_once() {
        let hub = StatusHub::new();
        let mut rx = hub.subscribe();
        hub.set_project_status("P1", ProjectSyncStatus::Syncing);
        hub.set_project_status("P1", ProjectSyncStatus::Syncing);
        hub.set_project_status("P1", ProjectSyncStatus::Synced);

        assert_eq!(
            rx.try_recv().unwrap(),
            SyncNotification::ProjectStatusChanged {
                project_id: "P1".into(),
                status: ProjectSyncStatus::Syncing,
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            SyncNotification::ProjectStatusChanged {
                project_id: "P1".into(),
                status: ProjectSyncStatus::Synced,
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn overall_prefers_error_then_conflict_then_syncing() {
        let hub = StatusHub::new();
        assert_eq!(hub.overall(), ProjectSyncStatus::Pending);
        hub.set_project_status("P1", ProjectSyncStatus::Synced);
        assert_eq!(hub.overall(), ProjectSyncStatus::Synced);
        hub.set_project_status("P2", ProjectSyncStatus::Syncing);
        assert_eq!(hub.overall(), ProjectSyncStatus::Syncing);
        hub.set_project_status("P3", ProjectSyncStatus::Conflict);
        assert_eq!(hub.overall(), ProjectSyncStatus::Conflict);
        hub.set_project_status("P4", ProjectSyncStatus::Error);
        assert_eq!(hub.overall(), ProjectSyncStatus::Error);
        hub.remove_project("P4");
        assert_eq!(hub.overall(), ProjectSyncStatus::Conflict);
    }
}
