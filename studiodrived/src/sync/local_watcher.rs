use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::ignore::IgnoreRules;

pub const DEFAULT_QUIET_WINDOW: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watcher error: {0}")]
    Notify(#[from] notify::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LocalEvent {
    Changed(PathBuf),
    Removed(PathBuf),
}

impl LocalEvent {
    pub fn path(&self) -> &Path {
        match self {
            LocalEvent::Changed(path) | LocalEvent::Removed(path) => path,
        }
    }
}

/// Coalesces bursts per path; a path is released once it has been quiet for
/// the whole window, carrying its latest event.
#[derive(Debug)]
pub struct Debouncer {
    quiet: Duration,
    pending: HashMap<PathBuf, (LocalEvent, Instant)>,
}

impl Debouncer {
    pub fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            pending: HashMap::new(),
        }
    }

    pub fn record(&mut self, event: LocalEvent, now: Instant) {
        self.pending
            .insert(event.path().to_path_buf(), (event, now));
    }

    pub fn drain_ready(&mut self, now: Instant) -> Vec<LocalEvent> {
        let quiet = self.quiet;
        let ready: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, (_, last))| now.duration_since(*last) >= quiet)
            .map(|(path, _)| path.clone())
            .collect();
        let mut out: Vec<LocalEvent> = ready
            .into_iter()
            .filter_map(|path| self.pending.remove(&path).map(|(event, _)| event))
            .collect();
        out.sort_by(|a, b| a.path().cmp(b.path()));
        out
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .map(|(_, last)| *last + self.quiet)
            .min()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Translates one notify event into filtered local events.
pub fn map_event(root: &Path, rules: &IgnoreRules, event: Event) -> Vec<LocalEvent> {
    let mapped: Vec<LocalEvent> = match event.kind {
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() >= 2 => vec![
            LocalEvent::Removed(event.paths[0].clone()),
            LocalEvent::Changed(event.paths[1].clone()),
        ],
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            event.paths.into_iter().map(LocalEvent::Removed).collect()
        }
        EventKind::Modify(ModifyKind::Name(_)) => event
            .paths
            .into_iter()
            .map(|path| {
                if path.exists() {
                    LocalEvent::Changed(path)
                } else {
                    LocalEvent::Removed(path)
                }
            })
            .collect(),
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Create(_) | EventKind::Modify(_) => {
            event.paths.into_iter().map(LocalEvent::Changed).collect()
        }
        EventKind::Remove(_) => event.paths.into_iter().map(LocalEvent::Removed).collect(),
        _ => Vec::new(),
    };
    mapped
        .into_iter()
        .filter(|local| {
            local
                .path()
                .strip_prefix(root)
                .is_ok_and(|relative| !relative.as_os_str().is_empty() && !rules.is_ignored(relative))
        })
        .collect()
}

/// Recursive watcher on the mirror root feeding a debounce actor.
pub struct LocalWatcher {
    _watcher: RecommendedWatcher,
    cancel: CancellationToken,
    actor: Option<JoinHandle<()>>,
}

impl LocalWatcher {
    pub fn start(
        root: &Path,
        rules: IgnoreRules,
        quiet: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<LocalEvent>), WatchError> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let watch_root = root.to_path_buf();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for local in map_event(&watch_root, &rules, event) {
                    let _ = raw_tx.send(local);
                }
            }
            Err(err) => tracing::warn!(error = %err, "file watcher error"),
        })?;
        watcher.watch(root, RecursiveMode::Recursive)?;

        let cancel = CancellationToken::new();
        let actor = tokio::spawn(debounce_actor(raw_rx, out_tx, quiet, cancel.clone()));
        tracing::info!(root = %root.display(), "watching mirror");
        Ok((
            Self {
                _watcher: watcher,
                cancel,
                actor: Some(actor),
            },
            out_rx,
        ))
    }

    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(actor) = self.actor.take() {
            let _ = actor.await;
        }
    }
}

impl Drop for LocalWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn debounce_actor(
    mut raw: mpsc::UnboundedReceiver<LocalEvent>,
    out: mpsc::UnboundedSender<LocalEvent>,
    quiet: Duration,
    cancel: CancellationToken,
) {
    let mut debouncer = Debouncer::new(quiet);
    loop {
        let deadline = debouncer.next_deadline();
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = raw.recv() => match received {
                Some(event) => debouncer.record(event, Instant::now()),
                None => break,
            },
            _ = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            } => {
                for event in debouncer.drain_ready(Instant::now()) {
                    if out.send(event).is_err() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind};

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        Event {
            kind,
            paths: paths.iter().map(PathBuf::from).collect(),
            attrs: Default::default(),
        }
    }

    #[test]
    fn maps_writes_and_removals() {
        let root = Path::new("/mirror");
        let rules = IgnoreRules::default();
        let changed = map_event(
            root,
            &rules,
            event(
                EventKind::Modify(ModifyKind::Data(DataChange::Any)),
                &["/mirror/P1/Tracks/song.wav"],
            ),
        );
        assert_eq!(
            changed,
            vec![LocalEvent::Changed("/mirror/P1/Tracks/song.wav".into())]
        );
        let removed = map_event(
            root,
            &rules,
            event(
                EventKind::Remove(RemoveKind::File),
                &["/mirror/P1/Tracks/song.wav"],
            ),
        );
        assert_eq!(
            removed,
            vec![LocalEvent::Removed("/mirror/P1/Tracks/song.wav".into())]
        );
    }

    #[test]
    fn rename_becomes_removal_plus_change() {
        let mapped = map_event(
            Path::new("/mirror"),
            &IgnoreRules::default(),
            event(
                EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
                &["/mirror/P1/Tracks/a.wav", "/mirror/P1/Tracks/b.wav"],
            ),
        );
        assert_eq!(
            mapped,
            vec![
                LocalEvent::Removed("/mirror/P1/Tracks/a.wav".into()),
                LocalEvent::Changed("/mirror/P1/Tracks/b.wav".into()),
            ]
        );
    }

    #[test]
    fn ignored_names_never_surface() {
        let mapped = map_event(
            Path::new("/mirror"),
            &IgnoreRules::default(),
            event(
                EventKind::Create(CreateKind::File),
                &[
                    "/mirror/P1/Tracks/.DS_Store",
                    "/mirror/P1/Tracks/Thumbs.db",
                    "/mirror/P1/Tracks/render.tmp",
                    "/mirror/P1/Tracks/song.wav.metadata",
                    "/outside/P1/Tracks/a.wav",
                    "/mirror",
                ],
            ),
        );
        assert!(mapped.is_empty());
    }

    #[test]
    fn debouncer_waits_for_quiet_window() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(Duration::from_millis(500));
        let path = PathBuf::from("/mirror/P1/Tracks/song.wav");

        debouncer.record(LocalEvent::Changed(path.clone()), start);
        debouncer.record(
            LocalEvent::Changed(path.clone()),
            start + Duration::from_millis(300),
        );
        assert!(debouncer
            .drain_ready(start + Duration::from_millis(600))
            .is_empty());
        assert_eq!(
            debouncer.next_deadline(),
            Some(start + Duration::from_millis(800))
        );
        assert_eq!(
            debouncer.drain_ready(start + Duration::from_millis(800)),
            vec![LocalEvent::Changed(path)]
        );
        assert!(debouncer.is_empty());
    }

    #[test]
    fn latest_event_wins_within_window() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(Duration::from_millis(500));
        let path = PathBuf::from("/mirror/P1/Tracks/song.wav");
        debouncer.record(LocalEvent::Changed(path.clone()), start);
        debouncer.record(LocalEvent::Removed(path.clone()), start);
        assert_eq!(
            debouncer.drain_ready(start + Duration::from_secs(1)),
            vec![LocalEvent::Removed(path)]
        );
    }

    #[tokio::test]
    async fn watcher_delivers_debounced_change() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::create_dir_all(root.join("P1/Tracks")).unwrap();
        let (watcher, mut rx) =
            LocalWatcher::start(&root, IgnoreRules::default(), Duration::from_millis(50)).unwrap();

        let file = root.join("P1/Tracks/song.wav");
        std::fs::write(&file, b"take one").unwrap();
        std::fs::write(root.join("P1/Tracks/scratch.tmp"), b"x").unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("debounced event")
            .expect("open channel");
        assert_eq!(received, LocalEvent::Changed(file));
        watcher.stop().await;
    }
}
