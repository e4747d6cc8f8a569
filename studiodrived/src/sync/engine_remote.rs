impl SyncEngine {
    /// Anchor to resume `scope` from: the journaled one, else the store's head.
    async fn initial_anchor(&self, scope: &ChangeScope) -> Result<Option<String>, EngineError> {
        if let Some(journal) = &self.journal
            && let Some(anchor) = journal.load_anchor(&scope.key()).await?
        {
            return Ok(Some(anchor));
        }
        Ok(self.metadata.poll_changes(scope, None).await?.anchor)
    }

    fn set_phase(&self, project_id: &str, phase: ProjectPhase) {
        if let Some(entry) = lock(&self.state).projects.get_mut(project_id) {
            entry.phase = phase;
        }
    }

    async fn bootstrap_project(self: &Arc<Self>, project: Project) -> Result<(), EngineError> {
        let project_id = project.id.clone();
        tracing::info!(project_id = %project_id, name = %project.name, "bootstrapping project");
        lock(&self.state).projects.insert(
            project_id.clone(),
            ProjectEntry {
                project: project.clone(),
                phase: ProjectPhase::Discovered,
            },
        );
        self.status
            .set_project_status(&project_id, ProjectSyncStatus::Pending);

        if let Err(err) = self.populate_project(&project).await {
            tracing::error!(project_id = %project_id, error = %err, "project bootstrap failed");
            self.set_phase(&project_id, ProjectPhase::Error);
            self.status
                .set_project_status(&project_id, ProjectSyncStatus::Error);
            return Err(err);
        }
        self.set_phase(&project_id, ProjectPhase::Listening);
        self.refresh_project_status(&project_id).await;
        Ok(())
    }

    async fn populate_project(self: &Arc<Self>, project: &Project) -> Result<(), EngineError> {
        let scope = ChangeScope::Items {
            project_id: project.id.clone(),
        };
        let anchor = self.initial_anchor(&scope).await?;

        self.write_structure(project).await?;
        self.set_phase(&project.id, ProjectPhase::StructureCreated);
        self.status
            .set_project_status(&project.id, ProjectSyncStatus::Syncing);

        self.set_phase(&project.id, ProjectPhase::ContentSyncing);
        self.reconcile_items(&project.id).await?;

        let cancel = {
            let mut state = lock(&self.state);
            let Some(root) = state.root_cancel.clone() else {
                return Ok(());
            };
            let token = root.child_token();
            if let Some(previous) = state.subscriptions.insert(project.id.clone(), token.clone()) {
                previous.cancel();
            }
            token
        };
        // Item loops stop through their token; only the project loop is joined.
        drop(self.spawn_poll(scope, anchor, cancel));
        Ok(())
    }

    async fn write_structure(&self, project: &Project) -> Result<(), EngineError> {
        for category in ItemCategory::ALL {
            tokio::fs::create_dir_all(self.layout.category_dir(&project.id, category)?).await?;
        }
        sidecar::write_project_snapshot(&self.layout.project_snapshot_path(&project.id)?, project)
            .await?;
        Ok(())
    }

    async fn update_project(&self, project: Project) -> Result<(), EngineError> {
        tracing::debug!(project_id = %project.id, "project metadata changed");
        if let Some(entry) = lock(&self.state).projects.get_mut(&project.id) {
            entry.project = project.clone();
        }
        self.write_structure(&project).await
    }

    async fn remove_project(&self, project_id: &str) -> Result<(), EngineError> {
        {
            let mut state = lock(&self.state);
            if let Some(token) = state.subscriptions.remove(project_id) {
                token.cancel();
            }
            state.projects.remove(project_id);
            state.items.retain(|(owner, _, _), _| owner != project_id);
        }
        self.status.remove_project(project_id);

        let dir = self.layout.project_dir(project_id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        if let Some(journal) = &self.journal {
            let scope = ChangeScope::Items {
                project_id: project_id.to_string(),
            };
            journal.remove_anchor(&scope.key()).await?;
        }
        tracing::info!(project_id, "project removed from mirror");
        Ok(())
    }

    /// Lists every category and applies the listing, treating cached items
    /// that are no longer listed as removed.
    async fn reconcile_items(&self, project_id: &str) -> Result<(), EngineError> {
        for category in ItemCategory::ALL {
            let listed = self.metadata.list_items(project_id, category).await?;
            let stale: Vec<RemoteItem> = lock(&self.state)
                .items
                .iter()
                .filter(|((owner, cat, name), _)| {
                    owner == project_id
                        && *cat == category
                        && !listed.iter().any(|item| &item.name == name)
                })
                .map(|(_, item)| item.clone())
                .collect();
            for item in stale {
                self.apply_item_removed(item).await?;
            }
            for item in listed {
                self.apply_remote_item(item).await?;
            }
        }
        Ok(())
    }

    fn spawn_poll(
        self: &Arc<Self>,
        scope: ChangeScope,
        anchor: Option<String>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let engine = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut anchor = anchor;
            let mut failures = 0u32;
            loop {
                let delay = match engine.upgrade() {
                    Some(engine) if failures == 0 => engine.config().poll_interval,
                    Some(engine) => engine.poll_backoff.delay(failures),
                    None => break,
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                match engine.poll_scope(&scope, anchor.as_deref()).await {
                    Ok(next) => {
                        failures = 0;
                        anchor = next;
                    }
                    Err(err) => {
                        failures = failures.saturating_add(1);
                        tracing::warn!(scope = %scope.key(), attempt = failures, error = %err, "change poll failed");
                    }
                }
            }
            tracing::debug!(scope = %scope.key(), "change subscription stopped");
        })
    }

    /// Applies one batch of changes and returns the anchor to resume from.
    async fn poll_scope(
        self: &Arc<Self>,
        scope: &ChangeScope,
        anchor: Option<&str>,
    ) -> Result<Option<String>, EngineError> {
        let batch = self.metadata.poll_changes(scope, anchor).await?;
        if !batch.changes.is_empty() {
            tracing::debug!(scope = %scope.key(), count = batch.changes.len(), "remote changes received");
        }
        for change in batch.changes {
            if let Err(err) = self.apply_change(change).await {
                tracing::warn!(scope = %scope.key(), error = %err, "failed to apply remote change");
            }
        }
        let next = batch.anchor.or_else(|| anchor.map(str::to_string));
        if next.as_deref() != anchor
            && let (Some(journal), Some(value)) = (&self.journal, next.as_deref())
            && let Err(err) = journal.save_anchor(&scope.key(), value).await
        {
            tracing::warn!(scope = %scope.key(), error = %err, "failed to persist anchor");
        }
        Ok(next)
    }

    async fn apply_change(self: &Arc<Self>, change: RemoteChange) -> Result<(), EngineError> {
        match change {
            RemoteChange::Project {
                kind: ChangeKind::Removed,
                project,
            } => self.remove_project(&project.id).await,
            RemoteChange::Project { project, .. } => {
                let known = lock(&self.state).projects.contains_key(&project.id);
                if known {
                    self.update_project(project).await
                } else {
                    self.bootstrap_project(project).await
                }
            }
            RemoteChange::Item { kind, item } => {
                let known = lock(&self.state).projects.contains_key(&item.project_id);
                if !known {
                    return Ok(());
                }
                let project_id = item.project_id.clone();
                if kind == ChangeKind::Removed {
                    self.apply_item_removed(item).await?;
                } else {
                    self.apply_remote_item(item).await?;
                }
                self.refresh_project_status(&project_id).await;
                Ok(())
            }
        }
    }

    /// Brings the mirror entry for `item` in line with the remote record.
    async fn apply_remote_item(&self, item: RemoteItem) -> Result<(), EngineError> {
        let path = self
            .layout
            .item_path(&item.project_id, item.category, &item.name)?;
        lock(&self.state).items.insert(
            (item.project_id.clone(), item.category, item.name.clone()),
            item.clone(),
        );

        if !tokio::fs::try_exists(&path).await? {
            return self.write_placeholder(&path, item).await;
        }
        let Some(mut current) = sidecar::read_sidecar(&path).await? else {
            // Unknown local bytes; the conflict gate decides at execution.
            self.queue
                .add_download_task(item.locator.as_deref(), &path, &item.project_id, item.category)
                .await;
            return Ok(());
        };

        if !current.item.content_differs(&item) {
            if current.item != item {
                current.item = item;
                sidecar::write_sidecar(&path, &current).await?;
            }
            return Ok(());
        }
        if hashes_match(current.local_hash.as_deref(), item.hash.as_deref()) {
            current.item = item;
            current.sync_state = ItemSyncState::Synced;
            sidecar::write_sidecar(&path, &current).await?;
            return Ok(());
        }
        if !current.hydrated && local_matches_sidecar(&path, &current).await? {
            current.item = item;
            sidecar::write_sidecar(&path, &current).await?;
            return Ok(());
        }
        self.queue
            .add_download_task(item.locator.as_deref(), &path, &item.project_id, item.category)
            .await;
        Ok(())
    }

    async fn apply_item_removed(&self, item: RemoteItem) -> Result<(), EngineError> {
        let path = self
            .layout
            .item_path(&item.project_id, item.category, &item.name)?;
        lock(&self.state)
            .items
            .remove(&(item.project_id.clone(), item.category, item.name.clone()));

        if tokio::fs::try_exists(&path).await? {
            let edited = match sidecar::read_sidecar(&path).await? {
                Some(current) => !local_matches_sidecar(&path, &current).await?,
                None => true,
            };
            if edited {
                let copy =
                    conflict::create_conflict_copy(&path, &self.user_id(), OffsetDateTime::now_utc())
                        .await?;
                tracing::warn!(path = %path.display(), copy = %copy.display(), "remote removed a locally edited item; kept a conflict copy");
                self.status.notify(SyncNotification::ConflictCreated {
                    project_id: item.project_id.clone(),
                    original: path.clone(),
                    copy,
                });
            }
            fileops::remove_file_if_exists(&path).await?;
        }
        sidecar::remove_sidecar(&path).await?;
        tracing::debug!(path = %path.display(), "item removed remotely");
        Ok(())
    }

    /// Sidecar first so the watcher sees the empty file as an echo.
    async fn write_placeholder(&self, path: &Path, item: RemoteItem) -> Result<(), EngineError> {
        sidecar::write_sidecar(path, &ItemSidecar::placeholder(item)).await?;
        fileops::write_atomic(path, &[]).await?;
        tracing::debug!(path = %path.display(), "placeholder written");
        Ok(())
    }

    /// Syncing while the queue holds work under the project, then conflict
    /// while conflict copies remain, else synced.
    async fn refresh_project_status(&self, project_id: &str) {
        if !lock(&self.state).projects.contains_key(project_id) {
            return;
        }
        let Ok(dir) = self.layout.project_dir(project_id) else {
            return;
        };
        let status = if self.queue.tracks_under(&dir) {
            ProjectSyncStatus::Syncing
        } else {
            match conflict::list_conflict_files(&dir).await {
                Ok(copies) if !copies.is_empty() => ProjectSyncStatus::Conflict,
                Ok(_) => ProjectSyncStatus::Synced,
                Err(err) => {
                    tracing::warn!(project_id, error = %err, "failed to scan for conflict copies");
                    ProjectSyncStatus::Synced
                }
            }
        };
        self.status.set_project_status(project_id, status);
    }

    fn spawn_queue_listener(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let mut events = self.queue.subscribe();
        let engine = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = events.recv() => match received {
                        Ok(event) => event,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "queue listener lagged");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.on_queue_event(event).await;
            }
        })
    }

    async fn on_queue_event(&self, event: QueueEvent) {
        match event {
            QueueEvent::Queued { path, .. } => {
                if let Some(location) = self.layout.locate(&path) {
                    self.status
                        .set_project_status(&location.project_id, ProjectSyncStatus::Syncing);
                }
            }
            QueueEvent::Completed { path, .. } => {
                if let Some(location) = self.layout.locate(&path) {
                    self.refresh_project_status(&location.project_id).await;
                }
            }
            QueueEvent::Failed {
                kind, path, error, ..
            } => {
                if let Err(err) = sidecar::update_state(&path, ItemSyncState::Error).await {
                    tracing::debug!(path = %path.display(), error = %err, "could not mark sidecar failed");
                }
                if let Some(location) = self.layout.locate(&path) {
                    self.status
                        .set_project_status(&location.project_id, ProjectSyncStatus::Error);
                }
                self.status
                    .notify(SyncNotification::TaskFailed { kind, path, error });
            }
            QueueEvent::Started { .. }
            | QueueEvent::Progress { .. }
            | QueueEvent::Retrying { .. } => {}
        }
    }

    fn spawn_resync_timer(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let engine = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let Some(interval) = engine.upgrade().map(|engine| engine.config().sync_interval)
                else {
                    break;
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                if let Err(err) = engine.resync_all().await {
                    tracing::warn!(error = %err, "periodic resync failed");
                }
            }
        })
    }

    /// Dehydrates the least recently modified unedited items until hydrated
    /// content fits in `max_bytes`.
    async fn enforce_cache_limit(&self, max_bytes: u64) -> Result<(), EngineError> {
        let items: Vec<RemoteItem> = lock(&self.state).items.values().cloned().collect();
        let mut total = 0u64;
        let mut candidates = Vec::new();
        for item in items {
            let path = self
                .layout
                .item_path(&item.project_id, item.category, &item.name)?;
            let Some(current) = sidecar::read_sidecar(&path).await? else {
                continue;
            };
            if !current.hydrated {
                continue;
            }
            let meta = match tokio::fs::metadata(&path).await {
                Ok(meta) => meta,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            total = total.saturating_add(meta.len());
            if !self.queue.is_tracked(&path) && local_matches_sidecar(&path, &current).await? {
                candidates.push((fileops::mtime_millis(&meta), meta.len(), path, current));
            }
        }
        if total <= max_bytes {
            return Ok(());
        }

        candidates.sort_by_key(|(modified, ..)| *modified);
        let mut evicted = 0usize;
        for (_, size, path, current) in candidates {
            if total <= max_bytes {
                break;
            }
            sidecar::write_sidecar(&path, &ItemSidecar::placeholder(current.item)).await?;
            fileops::write_atomic(&path, &[]).await?;
            total = total.saturating_sub(size);
            evicted += 1;
        }
        tracing::info!(evicted, remaining = total, limit = max_bytes, "cache limit enforced");
        Ok(())
    }
}

fn hashes_match(left: Option<&str>, right: Option<&str>) -> bool {
    matches!((left, right), (Some(left), Some(right)) if left.eq_ignore_ascii_case(right))
}

/// Whether the file still holds the bytes the sidecar says were last synced.
async fn local_matches_sidecar(path: &Path, current: &ItemSidecar) -> Result<bool, EngineError> {
    let Some(expected) = current.local_hash.as_deref() else {
        return Ok(false);
    };
    match fileops::hash_file(path).await {
        Ok(actual) => Ok(actual.eq_ignore_ascii_case(expected)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(true),
        Err(err) => Err(err.into()),
    }
}
