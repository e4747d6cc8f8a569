//! Process-wide owner of the sync components.
//!
//! Built once at startup from [`Settings`] and the backend collaborators; the
//! binary and any front end reach the engine, status hub and settings through
//! it instead of globals.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::Context;
use thiserror::Error;

use crate::settings::Settings;
use crate::status::StatusHub;
use crate::sync::engine::{Collaborators, EngineConfig, SyncEngine};
use crate::sync::journal::TaskJournal;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("drive root cannot change while the sync engine is running")]
    EngineRunning,
}

pub struct SyncContext {
    settings: RwLock<Settings>,
    collaborators: Collaborators,
    status: Arc<StatusHub>,
    journal: Option<TaskJournal>,
    engine: RwLock<Arc<SyncEngine>>,
}

impl SyncContext {
    pub async fn build(settings: Settings, collaborators: Collaborators) -> anyhow::Result<Self> {
        let journal = match &settings.journal_path {
            Some(path) => Some(
                TaskJournal::open(path)
                    .await
                    .with_context(|| format!("failed to open task journal at {}", path.display()))?,
            ),
            None => None,
        };
        let status = Arc::new(StatusHub::new());
        let engine = SyncEngine::new(
            settings.drive_root.clone(),
            collaborators.clone(),
            journal.clone(),
            status.clone(),
            EngineConfig::from_settings(&settings),
        );
        tracing::debug!(
            root = %settings.drive_root.display(),
            journal = journal.is_some(),
            policy = %settings.conflict_policy,
            "sync context built"
        );
        Ok(Self {
            settings: RwLock::new(settings),
            collaborators,
            status,
            journal,
            engine: RwLock::new(engine),
        })
    }

    pub fn engine(&self) -> Arc<SyncEngine> {
        read(&self.engine).clone()
    }

    pub fn settings(&self) -> Settings {
        read(&self.settings).clone()
    }

    pub fn status(&self) -> Arc<StatusHub> {
        self.status.clone()
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        let engine = self.engine();
        engine.start().await.with_context(|| {
            format!(
                "failed to start sync engine at {}",
                engine.drive_root().display()
            )
        })
    }

    pub async fn shutdown(&self) {
        self.engine().stop().await;
    }

    /// Replaces the settings. A new drive root rebuilds the engine, which
    /// must be stopped; everything else applies to the live engine.
    pub async fn update_settings(&self, mut settings: Settings) -> Result<(), ContextError> {
        settings.set_sync_interval(settings.sync_interval);
        let engine = self.engine();
        let root_changed = settings.drive_root != read(&self.settings).drive_root;
        if root_changed {
            if engine.is_running().await {
                return Err(ContextError::EngineRunning);
            }
            let rebuilt = SyncEngine::new(
                settings.drive_root.clone(),
                self.collaborators.clone(),
                self.journal.clone(),
                self.status.clone(),
                EngineConfig::from_settings(&settings),
            );
            *write(&self.engine) = rebuilt;
            tracing::info!(root = %settings.drive_root.display(), "drive root changed");
        } else {
            engine.apply_config(EngineConfig::from_settings(&settings));
        }
        *write(&self.settings) = settings;
        Ok(())
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
