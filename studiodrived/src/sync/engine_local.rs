impl SyncEngine {
    fn spawn_local_events(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<LocalEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let engine = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = events.recv() => match received {
                        Some(event) => event,
                        None => break,
                    },
                };
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                if let Err(err) = engine.handle_local_event(event.clone()).await {
                    tracing::warn!(path = %event.path().display(), error = %err, "failed to handle local change");
                }
            }
        })
    }

    /// Routes one debounced filesystem event into the queue.
    pub async fn handle_local_event(&self, event: LocalEvent) -> Result<Option<TaskId>, EngineError> {
        let path = event.path();
        let Some(location) = self.layout.locate(path) else {
            return Ok(None);
        };
        let ignored = path
            .strip_prefix(self.layout.root())
            .map_or(true, |relative| self.rules.is_ignored(relative));
        if ignored {
            return Ok(None);
        }
        let project = lock(&self.state)
            .projects
            .get(&location.project_id)
            .map(|entry| entry.project.clone());
        let Some(project) = project else {
            tracing::debug!(path = %path.display(), "event outside a known project");
            return Ok(None);
        };

        match &event {
            LocalEvent::Changed(path) => self.handle_local_change(path, &project).await,
            LocalEvent::Removed(path) => self.handle_local_removal(path, &project).await,
        }
    }

    async fn handle_local_change(
        &self,
        path: &Path,
        project: &Project,
    ) -> Result<Option<TaskId>, EngineError> {
        let Some(local) = fileops::local_version(path).await? else {
            return Ok(None);
        };
        if let Some(current) = sidecar::read_sidecar(path).await?
            && hashes_match(current.local_hash.as_deref(), Some(&local.hash))
        {
            tracing::trace!(path = %path.display(), "echo of own write");
            return Ok(None);
        }
        if !self.may(&project.id, ProjectAction::Write).await? {
            tracing::info!(path = %path.display(), project_id = %project.id, "no write permission; change stays local");
            return Ok(None);
        }
        let Some(location) = self.layout.locate(path) else {
            return Ok(None);
        };
        Ok(self
            .queue
            .add_upload_task(path, &project.id, location.category)
            .await)
    }

    /// Owners delete remotely; anyone else gets the item put back.
    async fn handle_local_removal(
        &self,
        path: &Path,
        project: &Project,
    ) -> Result<Option<TaskId>, EngineError> {
        let Some(location) = self.layout.locate(path) else {
            return Ok(None);
        };
        let Some(item) = self.cached_item(&project.id, location.category, &location.name) else {
            sidecar::remove_sidecar(path).await?;
            return Ok(None);
        };
        let identity = self.identity.identity().ok_or(EngineError::AuthRequired)?;

        if project.owner == identity.id {
            tracing::info!(path = %path.display(), "local deletion queued");
            return Ok(self
                .queue
                .add_delete_task(path, item.locator.as_deref(), &project.id, item.category)
                .await);
        }

        tracing::warn!(
            path = %path.display(),
            project_id = %project.id,
            identity = %identity.id,
            "deletion rejected: only the project owner may delete; restoring"
        );
        let locator = item.locator.clone();
        self.write_placeholder(path, item).await?;
        self.status.notify(SyncNotification::ItemRestored {
            project_id: project.id.clone(),
            path: path.to_path_buf(),
        });
        match locator {
            Some(locator) => Ok(self
                .queue
                .add_download_task(Some(&locator), path, &project.id, location.category)
                .await),
            None => Ok(None),
        }
    }

    /// A failed check counts as a denial.
    async fn may(&self, project_id: &str, action: ProjectAction) -> Result<bool, EngineError> {
        self.identity
            .has_permission(project_id, action)
            .await
            .map_err(|err| {
                tracing::warn!(project_id, action = action.as_str(), error = %err, "permission check failed");
                EngineError::from(err)
            })
    }

    async fn execute_task(
        &self,
        task: &SyncTask,
        progress: &watch::Sender<f32>,
    ) -> Result<TaskOutcome, EngineError> {
        let location = self
            .layout
            .locate(&task.local_path)
            .ok_or_else(|| EngineError::UnknownItem(task.local_path.display().to_string()))?;
        let slot = ItemSlot {
            project_id: &location.project_id,
            category: location.category,
            name: &location.name,
        };
        match task.kind {
            TaskKind::Download => self.run_download(task, slot, progress).await,
            TaskKind::Upload => self.run_upload(task, slot, progress).await,
            TaskKind::Delete => self.run_delete(task, slot).await,
        }
    }

    async fn run_download(
        &self,
        task: &SyncTask,
        slot: ItemSlot<'_>,
        progress: &watch::Sender<f32>,
    ) -> Result<TaskOutcome, EngineError> {
        let path = task.local_path.as_path();
        let Some(item) = self
            .metadata
            .get_item(slot.project_id, slot.category, slot.name)
            .await?
        else {
            tracing::debug!(path = %path.display(), "item gone before download");
            return Ok(TaskOutcome::Done);
        };
        let Some(local) = fileops::local_version(path).await? else {
            self.download_item(item, path, progress).await?;
            return Ok(TaskOutcome::Done);
        };
        if hashes_match(item.hash.as_deref(), Some(&local.hash)) {
            self.mark_synced(path, item, local.hash).await?;
            return Ok(TaskOutcome::Done);
        }
        let current = sidecar::read_sidecar(path).await?;
        let unmodified = current
            .as_ref()
            .is_some_and(|current| hashes_match(current.local_hash.as_deref(), Some(&local.hash)));
        if unmodified {
            self.download_item(item, path, progress).await?;
            return Ok(TaskOutcome::Done);
        }

        let tolerance = self.config().conflict_tolerance_ms;
        match conflict::classify(
            &local.hash,
            item.hash.as_deref(),
            local.modified,
            item.modified,
            tolerance,
        ) {
            None => {
                self.mark_synced(path, item, local.hash).await?;
                Ok(TaskOutcome::Done)
            }
            Some(ConflictType::RemoteNewer) => {
                self.download_item(item, path, progress).await?;
                Ok(TaskOutcome::Done)
            }
            Some(ConflictType::LocalNewer) => {
                tracing::info!(path = %path.display(), "local copy is newer; uploading instead");
                Ok(TaskOutcome::FollowUp(TaskKind::Upload))
            }
            Some(ConflictType::BothModified) => {
                self.settle_both_modified(task, slot, item, progress).await
            }
        }
    }

    async fn run_upload(
        &self,
        task: &SyncTask,
        slot: ItemSlot<'_>,
        progress: &watch::Sender<f32>,
    ) -> Result<TaskOutcome, EngineError> {
        let path = task.local_path.as_path();
        let Some(local) = fileops::local_version(path).await? else {
            tracing::debug!(path = %path.display(), "file gone before upload");
            return Ok(TaskOutcome::Done);
        };
        if !self.may(slot.project_id, ProjectAction::Write).await? {
            return Err(EngineError::PermissionDenied {
                project_id: slot.project_id.to_string(),
                action: ProjectAction::Write.as_str(),
            });
        }
        let Some(remote) = self
            .metadata
            .get_item(slot.project_id, slot.category, slot.name)
            .await?
        else {
            return self.upload_item(slot, path, None, progress).await;
        };
        if hashes_match(remote.hash.as_deref(), Some(&local.hash)) {
            self.mark_synced(path, remote, local.hash).await?;
            return Ok(TaskOutcome::Done);
        }
        let remote_unchanged = sidecar::read_sidecar(path)
            .await?
            .is_some_and(|current| !current.item.content_differs(&remote));
        if remote_unchanged {
            return self
                .upload_item(slot, path, remote.locator.as_deref(), progress)
                .await;
        }

        let tolerance = self.config().conflict_tolerance_ms;
        match conflict::classify(
            &local.hash,
            remote.hash.as_deref(),
            local.modified,
            remote.modified,
            tolerance,
        ) {
            None => {
                self.mark_synced(path, remote, local.hash).await?;
                Ok(TaskOutcome::Done)
            }
            Some(ConflictType::LocalNewer) => {
                self.upload_item(slot, path, remote.locator.as_deref(), progress)
                    .await
            }
            Some(ConflictType::RemoteNewer) => {
                tracing::info!(path = %path.display(), "remote copy is newer; downloading instead");
                Ok(TaskOutcome::FollowUp(TaskKind::Download))
            }
            Some(ConflictType::BothModified) => {
                self.settle_both_modified(task, slot, remote, progress).await
            }
        }
    }

    async fn run_delete(&self, task: &SyncTask, slot: ItemSlot<'_>) -> Result<TaskOutcome, EngineError> {
        let path = task.local_path.as_path();
        if tokio::fs::try_exists(path).await? {
            tracing::info!(path = %path.display(), "file reappeared; uploading instead of deleting");
            return Ok(TaskOutcome::FollowUp(TaskKind::Upload));
        }
        self.transfer
            .delete(slot, task.remote_locator.as_deref())
            .await?;
        lock(&self.state).items.remove(&(
            slot.project_id.to_string(),
            slot.category,
            slot.name.to_string(),
        ));
        sidecar::remove_sidecar(path).await?;
        tracing::info!(path = %path.display(), "item deleted remotely");
        Ok(TaskOutcome::Done)
    }

    /// Applies the conflict policy when both sides changed.
    async fn settle_both_modified(
        &self,
        task: &SyncTask,
        slot: ItemSlot<'_>,
        remote: RemoteItem,
        progress: &watch::Sender<f32>,
    ) -> Result<TaskOutcome, EngineError> {
        let path = task.local_path.as_path();
        let policy = self.config().conflict_policy;
        tracing::warn!(path = %path.display(), policy = %policy, "both sides modified");
        match policy {
            ConflictPolicy::Ask => {
                let resolution = conflict::resolve_conflict(
                    path,
                    remote.locator.as_deref(),
                    ConflictType::BothModified,
                    &self.user_id(),
                    OffsetDateTime::now_utc(),
                )
                .await?;
                if let Some(copy) = resolution.conflict_copy {
                    self.status.notify(SyncNotification::ConflictCreated {
                        project_id: slot.project_id.to_string(),
                        original: path.to_path_buf(),
                        copy,
                    });
                }
                self.download_item(remote, path, progress).await?;
                Ok(TaskOutcome::Done)
            }
            ConflictPolicy::Local if task.kind == TaskKind::Upload => {
                self.upload_item(slot, path, remote.locator.as_deref(), progress)
                    .await
            }
            ConflictPolicy::Local => Ok(TaskOutcome::FollowUp(TaskKind::Upload)),
            ConflictPolicy::Remote => {
                self.download_item(remote, path, progress).await?;
                Ok(TaskOutcome::Done)
            }
        }
    }

    async fn download_item(
        &self,
        item: RemoteItem,
        path: &Path,
        progress: &watch::Sender<f32>,
    ) -> Result<(), EngineError> {
        sidecar::update_state(path, ItemSyncState::Downloading).await?;
        let hash = self.transfer.download(&item, path, progress).await?;
        self.mark_synced(path, item, hash).await
    }

    async fn upload_item(
        &self,
        slot: ItemSlot<'_>,
        path: &Path,
        existing_locator: Option<&str>,
        progress: &watch::Sender<f32>,
    ) -> Result<TaskOutcome, EngineError> {
        sidecar::update_state(path, ItemSyncState::Uploading).await?;
        let uploaded = self
            .transfer
            .upload(slot, path, existing_locator, progress)
            .await?;
        self.mark_synced(path, uploaded.item, uploaded.hash).await?;
        Ok(TaskOutcome::Done)
    }

    async fn mark_synced(&self, path: &Path, item: RemoteItem, hash: String) -> Result<(), EngineError> {
        lock(&self.state).items.insert(
            (item.project_id.clone(), item.category, item.name.clone()),
            item.clone(),
        );
        sidecar::write_sidecar(path, &ItemSidecar::synced(item, hash)).await?;
        Ok(())
    }
}
