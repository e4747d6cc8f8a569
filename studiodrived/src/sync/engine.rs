use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use studiodrive_core::{
    BackendError, ChangeKind, ChangeScope, Identity, IdentityProvider, ItemCategory,
    MetadataStore, ObjectStore, Project, ProjectAction, RemoteChange, RemoteItem,
};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::backoff::Backoff;
use super::conflict::{self, ConflictError, ConflictType};
use super::fileops::{self, FileOpsError};
use super::ignore::IgnoreRules;
use super::journal::{JournalError, TaskJournal};
use super::local_watcher::{DEFAULT_QUIET_WINDOW, LocalEvent, LocalWatcher, WatchError};
use super::paths::{MirrorLayout, PathError};
use super::queue::{
    QueueConfig, QueueEvent, QueueStatus, SyncQueue, SyncTask, TaskExecutor, TaskFailure,
    TaskId, TaskKind, TaskOutcome, TaskStatus,
};
use super::sidecar::{self, ItemSidecar, ItemSyncState, SidecarError};
use super::transfer::{ItemSlot, TransferConfig, TransferError, TransferExecutor};
use crate::settings::{ConflictPolicy, Settings, clamp_sync_interval};
use crate::status::{ProjectSyncStatus, StatusHub, SyncNotification};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no authenticated identity")]
    AuthRequired,
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("file error: {0}")]
    FileOps(#[from] FileOpsError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("sidecar error: {0}")]
    Sidecar(#[from] SidecarError),
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("watcher error: {0}")]
    Watch(#[from] WatchError),
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),
    #[error("conflict error: {0}")]
    Conflict(#[from] ConflictError),
    #[error("permission denied: {action} on project {project_id}")]
    PermissionDenied {
        project_id: String,
        action: &'static str,
    },
    #[error("unknown item: {0}")]
    UnknownItem(String),
    #[error("a transfer for {} is already pending", .0.display())]
    PathBusy(PathBuf),
    #[error("task failed: {0}")]
    TaskFailed(String),
    #[error("sync engine stopped")]
    Stopped,
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Backend(err) => err.is_retryable(),
            EngineError::Transfer(err) => err.is_retryable(),
            EngineError::Io(err) => !matches!(
                err.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
            ),
            _ => false,
        }
    }
}

impl From<EngineError> for TaskFailure {
    fn from(err: EngineError) -> Self {
        Self {
            retryable: err.is_retryable(),
            message: err.to_string(),
        }
    }
}

/// Lifecycle of a mirrored project.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectPhase {
    Discovered,
    StructureCreated,
    ContentSyncing,
    Listening,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub conflict_policy: ConflictPolicy,
    pub conflict_tolerance_ms: i64,
    pub sync_interval: Duration,
    pub poll_interval: Duration,
    pub max_cache_bytes: u64,
    pub conflict_retention: Option<Duration>,
    pub enable_local_watcher: bool,
    pub watch_quiet: Duration,
    pub queue: QueueConfig,
    pub transfer: TransferConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::with_root(PathBuf::new()))
    }
}

impl EngineConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            conflict_policy: settings.conflict_policy,
            conflict_tolerance_ms: settings.conflict_tolerance_ms,
            sync_interval: clamp_sync_interval(settings.sync_interval),
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_cache_bytes: settings.max_cache_bytes,
            conflict_retention: Some(settings.conflict_retention()),
            enable_local_watcher: settings.enable_local_watcher,
            watch_quiet: DEFAULT_QUIET_WINDOW,
            queue: QueueConfig {
                max_uploads: settings.max_concurrent_uploads.max(1),
                max_downloads: settings.max_concurrent_downloads.max(1),
                ..QueueConfig::default()
            },
            transfer: TransferConfig::default(),
        }
    }
}

/// The three backend collaborators the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub metadata: Arc<dyn MetadataStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub identity: Arc<dyn IdentityProvider>,
}

impl Collaborators {
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: MetadataStore + ObjectStore + IdentityProvider + 'static,
    {
        Self {
            metadata: backend.clone(),
            objects: backend.clone(),
            identity: backend,
        }
    }
}

type ItemKey = (String, ItemCategory, String);

struct ProjectEntry {
    project: Project,
    phase: ProjectPhase,
}

#[derive(Default)]
struct EngineState {
    projects: HashMap<String, ProjectEntry>,
    items: HashMap<ItemKey, RemoteItem>,
    subscriptions: HashMap<String, CancellationToken>,
    root_cancel: Option<CancellationToken>,
}

struct EngineRuntime {
    cancel: CancellationToken,
    watcher: Option<LocalWatcher>,
    tasks: Vec<JoinHandle<()>>,
}

/// Routes queued tasks back into the engine through a weak handle.
struct EngineExecutor {
    engine: Weak<SyncEngine>,
}

#[async_trait]
impl TaskExecutor for EngineExecutor {
    async fn execute(
        &self,
        task: &SyncTask,
        progress: &watch::Sender<f32>,
    ) -> Result<TaskOutcome, TaskFailure> {
        let Some(engine) = self.engine.upgrade() else {
            return Err(TaskFailure::permanent("sync engine dropped"));
        };
        engine
            .execute_task(task, progress)
            .await
            .map_err(TaskFailure::from)
    }
}

/// Orchestrates the mirror: bootstrap, remote subscriptions, local events,
/// periodic resync and the conflict gate in front of every transfer.
pub struct SyncEngine {
    layout: MirrorLayout,
    metadata: Arc<dyn MetadataStore>,
    identity: Arc<dyn IdentityProvider>,
    transfer: TransferExecutor,
    queue: SyncQueue,
    journal: Option<TaskJournal>,
    status: Arc<StatusHub>,
    rules: IgnoreRules,
    config: Mutex<EngineConfig>,
    state: Mutex<EngineState>,
    runtime: tokio::sync::Mutex<Option<EngineRuntime>>,
    poll_backoff: Backoff,
}

impl SyncEngine {
    pub fn new(
        drive_root: impl Into<PathBuf>,
        collaborators: Collaborators,
        journal: Option<TaskJournal>,
        status: Arc<StatusHub>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let layout = MirrorLayout::new(drive_root);
        Arc::new_cyclic(|weak| {
            let executor = Arc::new(EngineExecutor {
                engine: weak.clone(),
            });
            let queue = match &journal {
                Some(journal) => SyncQueue::with_journal(executor, config.queue, journal.clone()),
                None => SyncQueue::new(executor, config.queue),
            };
            let transfer = TransferExecutor::with_config(
                collaborators.metadata.clone(),
                collaborators.objects.clone(),
                config.transfer,
            );
            Self {
                layout,
                metadata: collaborators.metadata,
                identity: collaborators.identity,
                transfer,
                queue,
                journal,
                status,
                rules: IgnoreRules::default(),
                config: Mutex::new(config),
                state: Mutex::new(EngineState::default()),
                runtime: tokio::sync::Mutex::new(None),
                poll_backoff: Backoff::new(Duration::from_secs(1), Duration::from_secs(60), true),
            }
        })
    }

    pub fn drive_root(&self) -> &Path {
        self.layout.root()
    }

    pub fn layout(&self) -> &MirrorLayout {
        &self.layout
    }

    pub async fn is_running(&self) -> bool {
        self.runtime.lock().await.is_some()
    }

    pub fn config(&self) -> EngineConfig {
        lock(&self.config).clone()
    }

    /// Applies runtime-adjustable settings in place.
    pub fn apply_config(&self, config: EngineConfig) {
        self.queue
            .set_limits(config.queue.max_uploads, config.queue.max_downloads);
        *lock(&self.config) = config;
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), EngineError> {
        let mut runtime = self.runtime.lock().await;
        if runtime.is_some() {
            return Ok(());
        }
        let identity = self.identity.identity().ok_or(EngineError::AuthRequired)?;
        let cancel = CancellationToken::new();
        match self.launch(&identity, &cancel).await {
            Ok(started) => {
                *runtime = Some(started);
                tracing::info!(root = %self.layout.root().display(), identity = %identity.id, "sync engine started");
                Ok(())
            }
            Err(err) => {
                tracing::error!(error = %err, "sync engine failed to start");
                cancel.cancel();
                self.queue.stop();
                self.clear_caches();
                Err(err)
            }
        }
    }

    async fn launch(
        self: &Arc<Self>,
        identity: &Identity,
        cancel: &CancellationToken,
    ) -> Result<EngineRuntime, EngineError> {
        let root = self.layout.root().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        fileops::probe_writable(&root).await?;
        lock(&self.state).root_cancel = Some(cancel.clone());

        let projects_anchor = self.initial_anchor(&ChangeScope::Projects).await?;
        let projects = self.metadata.list_projects(&identity.id).await?;
        for project in projects {
            self.bootstrap_project(project).await?;
        }

        let config = self.config();
        self.queue.start().await;

        let mut tasks = Vec::new();
        let watcher = if config.enable_local_watcher {
            let (watcher, events) =
                LocalWatcher::start(&root, self.rules.clone(), config.watch_quiet)?;
            tasks.push(self.spawn_local_events(events, cancel.clone()));
            Some(watcher)
        } else {
            None
        };
        tasks.push(self.spawn_poll(ChangeScope::Projects, projects_anchor, cancel.child_token()));
        tasks.push(self.spawn_queue_listener(cancel.clone()));
        tasks.push(self.spawn_resync_timer(cancel.clone()));

        Ok(EngineRuntime {
            cancel: cancel.clone(),
            watcher,
            tasks,
        })
    }

    /// Stops timers, subscriptions, the watcher and the queue. In-flight
    /// transfers finish on their own.
    pub async fn stop(&self) {
        let Some(runtime) = self.runtime.lock().await.take() else {
            return;
        };
        runtime.cancel.cancel();
        if let Some(watcher) = runtime.watcher {
            watcher.stop().await;
        }
        futures_util::future::join_all(runtime.tasks).await;
        self.queue.stop();
        self.clear_caches();
        tracing::info!("sync engine stopped");
    }

    fn clear_caches(&self) {
        let mut state = lock(&self.state);
        for (_, token) in state.subscriptions.drain() {
            token.cancel();
        }
        state.projects.clear();
        state.items.clear();
        state.root_cancel = None;
        drop(state);
        self.status.clear();
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.queue.get_queue_status()
    }

    pub fn project_statuses(&self) -> std::collections::BTreeMap<String, ProjectSyncStatus> {
        self.status.project_statuses()
    }

    pub fn project_phase(&self, project_id: &str) -> Option<ProjectPhase> {
        lock(&self.state)
            .projects
            .get(project_id)
            .map(|entry| entry.phase)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncNotification> {
        self.status.subscribe()
    }

    pub fn cached_item(
        &self,
        project_id: &str,
        category: ItemCategory,
        name: &str,
    ) -> Option<RemoteItem> {
        lock(&self.state)
            .items
            .get(&(project_id.to_string(), category, name.to_string()))
            .cloned()
    }

    fn item_by_id(&self, item_id: &str) -> Option<RemoteItem> {
        lock(&self.state)
            .items
            .values()
            .find(|item| item.id == item_id)
            .cloned()
    }

    fn user_id(&self) -> String {
        self.identity
            .identity()
            .map(|identity| identity.id)
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Hydrates an item through the download lane and returns the bytes now
    /// on disk. Local edits go through the conflict gate, so the result is
    /// the local copy when it won.
    pub async fn fetch_content(&self, item_id: &str) -> Result<Vec<u8>, EngineError> {
        let item = self
            .item_by_id(item_id)
            .ok_or_else(|| EngineError::UnknownItem(item_id.to_string()))?;
        let path = self
            .layout
            .item_path(&item.project_id, item.category, &item.name)?;
        let cancel = lock(&self.state)
            .root_cancel
            .clone()
            .ok_or(EngineError::Stopped)?;
        let mut events = self.queue.subscribe();
        let id = self
            .queue
            .add_download_task(item.locator.as_deref(), &path, &item.project_id, item.category)
            .await
            .ok_or_else(|| EngineError::PathBusy(path.clone()))?;
        tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Stopped),
            finished = self.wait_for_task(&mut events, id) => finished?,
        }
        tracing::debug!(item_id, path = %path.display(), "content hydrated");
        Ok(tokio::fs::read(&path).await?)
    }

    async fn wait_for_task(
        &self,
        events: &mut broadcast::Receiver<QueueEvent>,
        id: TaskId,
    ) -> Result<(), EngineError> {
        loop {
            match events.recv().await {
                Ok(QueueEvent::Completed { id: done, .. }) if done == id => return Ok(()),
                Ok(QueueEvent::Failed { id: failed, error, .. }) if failed == id => {
                    return Err(EngineError::TaskFailed(error));
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    let recent = self.queue.get_queue_status().recent;
                    if let Some(task) = recent.iter().find(|task| task.id == id) {
                        return match task.status {
                            TaskStatus::Failed => Err(EngineError::TaskFailed(
                                task.last_error.clone().unwrap_or_default(),
                            )),
                            _ => Ok(()),
                        };
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Err(EngineError::Stopped),
            }
        }
    }

    /// Places `local_path` at the item's mirror path and queues its upload.
    pub async fn push_content(
        &self,
        item_id: &str,
        local_path: &Path,
    ) -> Result<Option<TaskId>, EngineError> {
        let item = self
            .item_by_id(item_id)
            .ok_or_else(|| EngineError::UnknownItem(item_id.to_string()))?;
        let target = self
            .layout
            .item_path(&item.project_id, item.category, &item.name)?;
        if local_path != target {
            fileops::copy_atomic(local_path, &target, |_, _| {}).await?;
        }
        Ok(self
            .queue
            .add_upload_task(&target, &item.project_id, item.category)
            .await)
    }

    /// Diffs the remote tree against the cache and reconciles every project,
    /// then prunes expired conflict copies and enforces the cache limit.
    pub async fn resync_all(self: &Arc<Self>) -> Result<(), EngineError> {
        let identity = self.identity.identity().ok_or(EngineError::AuthRequired)?;
        let remote = self.metadata.list_projects(&identity.id).await?;
        let known: Vec<String> = lock(&self.state).projects.keys().cloned().collect();

        for project_id in known {
            if !remote.iter().any(|project| project.id == project_id) {
                self.remove_project(&project_id).await?;
            }
        }
        for project in remote {
            let cached = lock(&self.state)
                .projects
                .get(&project.id)
                .map(|entry| entry.project.clone());
            match cached {
                None => self.bootstrap_project(project).await?,
                Some(existing) => {
                    if existing != project {
                        self.update_project(project.clone()).await?;
                    }
                    self.reconcile_items(&project.id).await?;
                }
            }
        }

        let config = self.config();
        if let Some(retention) = config.conflict_retention {
            let removed = conflict::cleanup_conflict_files(
                self.layout.root(),
                retention,
                OffsetDateTime::now_utc(),
            )
            .await?;
            if removed > 0 {
                tracing::info!(removed, "expired conflict copies removed");
            }
        }
        if config.max_cache_bytes > 0 {
            self.enforce_cache_limit(config.max_cache_bytes).await?;
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

include!("engine_remote.rs");
include!("engine_local.rs");

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
