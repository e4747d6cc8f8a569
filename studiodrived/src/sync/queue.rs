use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use studiodrive_core::ItemCategory;
use thiserror::Error;
use tokio::sync::{Notify, broadcast, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::backoff::RetryPolicy;
use super::journal::{JournaledTask, TaskJournal};
use super::transfer::TransferError;

pub const DEFAULT_MAX_UPLOADS: usize = 2;
pub const DEFAULT_MAX_DOWNLOADS: usize = 4;
pub const DEFAULT_DISPATCH_INTERVAL: Duration = Duration::from_secs(1);
const HISTORY_LIMIT: usize = 64;
const EVENT_CAPACITY: usize = 256;

pub type TaskId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Upload,
    Download,
    Delete,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Upload => "upload",
            TaskKind::Download => "download",
            TaskKind::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "upload" => Some(TaskKind::Upload),
            "download" => Some(TaskKind::Download),
            "delete" => Some(TaskKind::Delete),
            _ => None,
        }
    }

    /// Deletes mutate the remote side and share the upload lane.
    fn lane(self) -> Lane {
        match self {
            TaskKind::Upload | TaskKind::Delete => Lane::Upload,
            TaskKind::Download => Lane::Download,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lane {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncTask {
    pub id: TaskId,
    pub kind: TaskKind,
    pub local_path: PathBuf,
    pub remote_locator: Option<String>,
    pub project_id: String,
    pub category: ItemCategory,
    pub status: TaskStatus,
    pub progress: f32,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Queued {
        id: TaskId,
        kind: TaskKind,
        path: PathBuf,
    },
    Started {
        id: TaskId,
    },
    Progress {
        id: TaskId,
        progress: f32,
    },
    Retrying {
        id: TaskId,
        attempt: u32,
        error: String,
    },
    Completed {
        id: TaskId,
        kind: TaskKind,
        path: PathBuf,
    },
    Failed {
        id: TaskId,
        kind: TaskKind,
        path: PathBuf,
        error: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueStatus {
    pub pending_uploads: usize,
    pub pending_downloads: usize,
    pub active_uploads: usize,
    pub active_downloads: usize,
    pub waiting_retry: usize,
    pub active: Vec<SyncTask>,
    pub recent: Vec<SyncTask>,
}

impl QueueStatus {
    pub fn is_idle(&self) -> bool {
        self.pending_uploads == 0
            && self.pending_downloads == 0
            && self.active.is_empty()
            && self.waiting_retry == 0
    }
}

/// What a finished task asks the queue to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Done,
    FollowUp(TaskKind),
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TaskFailure {
    pub message: String,
    pub retryable: bool,
}

impl TaskFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<TransferError> for TaskFailure {
    fn from(err: TransferError) -> Self {
        Self {
            retryable: err.is_retryable(),
            message: err.to_string(),
        }
    }
}

#[async_trait]
pub trait TaskExecutor: Send + Sync + 'static {
    async fn execute(
        &self,
        task: &SyncTask,
        progress: &watch::Sender<f32>,
    ) -> Result<TaskOutcome, TaskFailure>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub max_uploads: usize,
    pub max_downloads: usize,
    pub dispatch_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_uploads: DEFAULT_MAX_UPLOADS,
            max_downloads: DEFAULT_MAX_DOWNLOADS,
            dispatch_interval: DEFAULT_DISPATCH_INTERVAL,
            retry: RetryPolicy::default(),
        }
    }
}

struct ActiveTask {
    task: SyncTask,
    progress: watch::Receiver<f32>,
}

#[derive(Default)]
struct QueueState {
    uploads: VecDeque<SyncTask>,
    downloads: VecDeque<SyncTask>,
    active: HashMap<TaskId, ActiveTask>,
    waiting: HashMap<TaskId, SyncTask>,
    /// Every path with a task that is admitted but not yet terminal.
    tracked: HashSet<PathBuf>,
    history: VecDeque<SyncTask>,
}

impl QueueState {
    fn lane_mut(&mut self, lane: Lane) -> &mut VecDeque<SyncTask> {
        match lane {
            Lane::Upload => &mut self.uploads,
            Lane::Download => &mut self.downloads,
        }
    }

    fn active_in(&self, lane: Lane) -> usize {
        self.active
            .values()
            .filter(|active| active.task.kind.lane() == lane)
            .count()
    }

    fn push_history(&mut self, task: SyncTask) {
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(task);
    }
}

struct QueueInner {
    config: Mutex<QueueConfig>,
    executor: Arc<dyn TaskExecutor>,
    journal: Option<TaskJournal>,
    state: Mutex<QueueState>,
    events: broadcast::Sender<QueueEvent>,
    next_id: AtomicU64,
    running: Mutex<Option<CancellationToken>>,
    wake: Notify,
}

/// Two-lane task scheduler with per-lane concurrency caps.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct SyncQueue {
    inner: Arc<QueueInner>,
}

struct Admission {
    kind: TaskKind,
    local_path: PathBuf,
    remote_locator: Option<String>,
    project_id: String,
    category: ItemCategory,
    retry_count: u32,
}

impl SyncQueue {
    pub fn new(executor: Arc<dyn TaskExecutor>, config: QueueConfig) -> Self {
        Self::build(executor, config, None)
    }

    pub fn with_journal(
        executor: Arc<dyn TaskExecutor>,
        config: QueueConfig,
        journal: TaskJournal,
    ) -> Self {
        Self::build(executor, config, Some(journal))
    }

    fn build(
        executor: Arc<dyn TaskExecutor>,
        config: QueueConfig,
        journal: Option<TaskJournal>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(QueueInner {
                config: Mutex::new(config),
                executor,
                journal,
                state: Mutex::new(QueueState::default()),
                events,
                next_id: AtomicU64::new(1),
                running: Mutex::new(None),
                wake: Notify::new(),
            }),
        }
    }

    pub async fn add_upload_task(
        &self,
        local_path: &Path,
        project_id: &str,
        category: ItemCategory,
    ) -> Option<TaskId> {
        self.inner
            .admit(Admission {
                kind: TaskKind::Upload,
                local_path: local_path.to_path_buf(),
                remote_locator: None,
                project_id: project_id.to_string(),
                category,
                retry_count: 0,
            })
            .await
    }

    pub async fn add_download_task(
        &self,
        remote_locator: Option<&str>,
        local_path: &Path,
        project_id: &str,
        category: ItemCategory,
    ) -> Option<TaskId> {
        self.inner
            .admit(Admission {
                kind: TaskKind::Download,
                local_path: local_path.to_path_buf(),
                remote_locator: remote_locator.map(str::to_string),
                project_id: project_id.to_string(),
                category,
                retry_count: 0,
            })
            .await
    }

    pub async fn add_delete_task(
        &self,
        local_path: &Path,
        remote_locator: Option<&str>,
        project_id: &str,
        category: ItemCategory,
    ) -> Option<TaskId> {
        self.inner
            .admit(Admission {
                kind: TaskKind::Delete,
                local_path: local_path.to_path_buf(),
                remote_locator: remote_locator.map(str::to_string),
                project_id: project_id.to_string(),
                category,
                retry_count: 0,
            })
            .await
    }

    /// Restores journaled tasks and starts the dispatch loop. No-op when
    /// already running.
    pub async fn start(&self) {
        let token = {
            let mut running = lock(&self.inner.running);
            if running.is_some() {
                return;
            }
            let token = CancellationToken::new();
            *running = Some(token.clone());
            token
        };
        self.inner.restore_journal().await;

        let inner = self.inner.clone();
        let interval = lock(&inner.config).dispatch_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = inner.wake.notified() => {}
                }
                QueueInner::dispatch(&inner);
            }
            tracing::debug!("dispatch loop stopped");
        });
        tracing::info!(?interval, "sync queue started");
    }

    /// Stops dispatching. In-flight tasks run to completion.
    pub fn stop(&self) {
        if let Some(token) = lock(&self.inner.running).take() {
            token.cancel();
            tracing::info!("sync queue stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.running).is_some()
    }

    /// Runs one dispatch tick and returns how many tasks were started.
    pub fn dispatch_once(&self) -> usize {
        QueueInner::dispatch(&self.inner)
    }

    pub fn get_queue_status(&self) -> QueueStatus {
        let state = lock(&self.inner.state);
        let mut active: Vec<SyncTask> = state
            .active
            .values()
            .map(|entry| {
                let mut task = entry.task.clone();
                task.progress = *entry.progress.borrow();
                task
            })
            .collect();
        active.sort_by_key(|task| task.id);
        QueueStatus {
            pending_uploads: state.uploads.len(),
            pending_downloads: state.downloads.len(),
            active_uploads: state.active_in(Lane::Upload),
            active_downloads: state.active_in(Lane::Download),
            waiting_retry: state.waiting.len(),
            active,
            recent: state.history.iter().cloned().collect(),
        }
    }

    pub fn is_tracked(&self, local_path: &Path) -> bool {
        lock(&self.inner.state).tracked.contains(local_path)
    }

    /// Whether any non-terminal task targets a path below `dir`.
    pub fn tracks_under(&self, dir: &Path) -> bool {
        lock(&self.inner.state)
            .tracked
            .iter()
            .any(|path| path.starts_with(dir))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Live progress of an active task.
    pub fn progress(&self, task_id: TaskId) -> Option<watch::Receiver<f32>> {
        lock(&self.inner.state)
            .active
            .get(&task_id)
            .map(|entry| entry.progress.clone())
    }

    /// Applies new caps; takes effect on the next dispatch tick.
    pub fn set_limits(&self, max_uploads: usize, max_downloads: usize) {
        let mut config = lock(&self.inner.config);
        config.max_uploads = max_uploads.max(1);
        config.max_downloads = max_downloads.max(1);
    }
}

impl QueueInner {
    async fn admit(self: &Arc<Self>, admission: Admission) -> Option<TaskId> {
        {
            let mut state = lock(&self.state);
            if !state.tracked.insert(admission.local_path.clone()) {
                tracing::debug!(
                    path = %admission.local_path.display(),
                    kind = admission.kind.as_str(),
                    "task for path already tracked; dropping"
                );
                return None;
            }
        }

        if let Some(journal) = &self.journal {
            let row = JournaledTask {
                kind: admission.kind,
                local_path: admission.local_path.clone(),
                remote_locator: admission.remote_locator.clone(),
                project_id: admission.project_id.clone(),
                category: admission.category,
                retry_count: admission.retry_count,
            };
            if let Err(err) = journal.record_task(&row).await {
                tracing::warn!(path = %row.local_path.display(), error = %err, "journal write failed");
            }
        }

        let task = SyncTask {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            kind: admission.kind,
            local_path: admission.local_path,
            remote_locator: admission.remote_locator,
            project_id: admission.project_id,
            category: admission.category,
            status: TaskStatus::Pending,
            progress: 0.0,
            retry_count: admission.retry_count,
            last_error: None,
        };
        let id = task.id;
        let event = QueueEvent::Queued {
            id,
            kind: task.kind,
            path: task.local_path.clone(),
        };
        tracing::debug!(task_id = id, kind = task.kind.as_str(), path = %task.local_path.display(), "task queued");
        {
            let mut state = lock(&self.state);
            state.lane_mut(task.kind.lane()).push_back(task);
        }
        let _ = self.events.send(event);
        self.wake.notify_one();
        Some(id)
    }

    async fn restore_journal(self: &Arc<Self>) {
        let Some(journal) = &self.journal else {
            return;
        };
        let rows = match journal.pending_tasks().await {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read task journal");
                return;
            }
        };
        let mut restored = 0usize;
        for row in rows {
            let admitted = self
                .admit(Admission {
                    kind: row.kind,
                    local_path: row.local_path,
                    remote_locator: row.remote_locator,
                    project_id: row.project_id,
                    category: row.category,
                    retry_count: row.retry_count,
                })
                .await;
            if admitted.is_some() {
                restored += 1;
            }
        }
        if restored > 0 {
            tracing::info!(restored, "restored journaled tasks");
        }
    }

    fn dispatch(self: &Arc<Self>) -> usize {
        let config = *lock(&self.config);
        let mut started = Vec::new();
        {
            let mut state = lock(&self.state);
            for (lane, cap) in [
                (Lane::Upload, config.max_uploads),
                (Lane::Download, config.max_downloads),
            ] {
                while state.active_in(lane) < cap {
                    let Some(mut task) = state.lane_mut(lane).pop_front() else {
                        break;
                    };
                    task.status = TaskStatus::Processing;
                    task.progress = 0.0;
                    let (tx, rx) = watch::channel(0.0f32);
                    state.active.insert(
                        task.id,
                        ActiveTask {
                            task: task.clone(),
                            progress: rx,
                        },
                    );
                    started.push((task, tx));
                }
            }
        }

        let count = started.len();
        for (task, progress) in started {
            let _ = self.events.send(QueueEvent::Started { id: task.id });
            tokio::spawn(run_task(self.clone(), task, progress));
        }
        count
    }

    async fn finish(self: &Arc<Self>, mut task: SyncTask, result: Result<TaskOutcome, TaskFailure>) {
        let id = task.id;
        match result {
            Ok(outcome) => {
                task.status = TaskStatus::Completed;
                task.progress = 1.0;
                task.last_error = None;
                self.retire(&task);
                tracing::info!(task_id = id, kind = task.kind.as_str(), path = %task.local_path.display(), "task completed");
                self.forget_journal(&task.local_path).await;
                let _ = self.events.send(QueueEvent::Completed {
                    id,
                    kind: task.kind,
                    path: task.local_path.clone(),
                });
                if let TaskOutcome::FollowUp(kind) = outcome {
                    self.admit(Admission {
                        kind,
                        local_path: task.local_path,
                        remote_locator: task.remote_locator,
                        project_id: task.project_id,
                        category: task.category,
                        retry_count: 0,
                    })
                    .await;
                }
            }
            Err(failure) => {
                task.retry_count += 1;
                task.last_error = Some(failure.message.clone());
                let policy = lock(&self.config).retry;
                if failure.retryable && policy.should_retry(task.retry_count) {
                    task.status = TaskStatus::Pending;
                    {
                        let mut state = lock(&self.state);
                        state.active.remove(&id);
                        state.waiting.insert(id, task.clone());
                    }
                    tracing::warn!(
                        task_id = id,
                        attempt = task.retry_count,
                        path = %task.local_path.display(),
                        error = %failure,
                        "task failed; will retry"
                    );
                    if let Some(journal) = &self.journal {
                        let row = JournaledTask {
                            kind: task.kind,
                            local_path: task.local_path.clone(),
                            remote_locator: task.remote_locator.clone(),
                            project_id: task.project_id.clone(),
                            category: task.category,
                            retry_count: task.retry_count,
                        };
                        if let Err(err) = journal.record_task(&row).await {
                            tracing::warn!(task_id = id, error = %err, "journal write failed");
                        }
                    }
                    let _ = self.events.send(QueueEvent::Retrying {
                        id,
                        attempt: task.retry_count,
                        error: failure.message,
                    });
                    let inner = self.clone();
                    let delay = policy.delay();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        inner.requeue(id);
                    });
                } else {
                    task.status = TaskStatus::Failed;
                    self.retire(&task);
                    tracing::error!(
                        task_id = id,
                        kind = task.kind.as_str(),
                        path = %task.local_path.display(),
                        attempts = task.retry_count,
                        error = %failure,
                        "task failed"
                    );
                    self.forget_journal(&task.local_path).await;
                    let _ = self.events.send(QueueEvent::Failed {
                        id,
                        kind: task.kind,
                        path: task.local_path,
                        error: failure.message,
                    });
                }
            }
        }
        self.wake.notify_one();
    }

    /// Moves a terminal task out of the active set and frees its path.
    fn retire(&self, task: &SyncTask) {
        let mut state = lock(&self.state);
        state.active.remove(&task.id);
        state.tracked.remove(&task.local_path);
        state.push_history(task.clone());
    }

    fn requeue(&self, id: TaskId) {
        {
            let mut state = lock(&self.state);
            let Some(task) = state.waiting.remove(&id) else {
                return;
            };
            state.lane_mut(task.kind.lane()).push_back(task);
        }
        self.wake.notify_one();
    }

    async fn forget_journal(&self, local_path: &Path) {
        if let Some(journal) = &self.journal
            && let Err(err) = journal.remove_task(local_path).await
        {
            tracing::warn!(path = %local_path.display(), error = %err, "journal delete failed");
        }
    }
}

async fn run_task(inner: Arc<QueueInner>, task: SyncTask, progress: watch::Sender<f32>) {
    let id = task.id;
    let mut watcher = progress.subscribe();
    let events = inner.events.clone();
    let forwarder = tokio::spawn(async move {
        while watcher.changed().await.is_ok() {
            let value = *watcher.borrow_and_update();
            let _ = events.send(QueueEvent::Progress {
                id,
                progress: value,
            });
        }
    });

    let executor = inner.executor.clone();
    let running = task.clone();
    let handle = tokio::spawn(async move { executor.execute(&running, &progress).await });
    let result = match handle.await {
        Ok(result) => result,
        Err(err) if err.is_panic() => Err(TaskFailure::permanent("task panicked")),
        Err(err) => Err(TaskFailure::retryable(format!("task aborted: {err}"))),
    };
    let _ = forwarder.await;
    inner.finish(task, result).await;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
