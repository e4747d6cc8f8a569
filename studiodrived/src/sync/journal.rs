//! SQLite journal of admitted tasks and change-feed anchors.

use std::path::{Path, PathBuf};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool, migrate::Migrator};
use studiodrive_core::ItemCategory;
use thiserror::Error;

use super::fileops::now_millis;
use super::queue::TaskKind;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("data directory is unavailable")]
    MissingDataDir,
    #[error("invalid task kind: {0}")]
    InvalidKind(String),
    #[error("invalid category: {0}")]
    InvalidCategory(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournaledTask {
    pub kind: TaskKind,
    pub local_path: PathBuf,
    pub remote_locator: Option<String>,
    pub project_id: String,
    pub category: ItemCategory,
    pub retry_count: u32,
}

#[derive(Debug, Clone)]
pub struct TaskJournal {
    pool: SqlitePool,
}

impl TaskJournal {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(path: &Path) -> Result<Self, JournalError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let journal = Self { pool };
        journal.init().await?;
        Ok(journal)
    }

    /// A private database living as long as the journal.
    pub async fn in_memory() -> Result<Self, JournalError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let journal = Self { pool };
        journal.init().await?;
        Ok(journal)
    }

    pub async fn init(&self) -> Result<(), JournalError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn record_task(&self, task: &JournaledTask) -> Result<(), JournalError> {
        sqlx::query(
            "INSERT INTO tasks (local_path, kind, remote_locator, project_id, category, retry_count, enqueued_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(local_path) DO UPDATE SET
                kind = excluded.kind,
                remote_locator = excluded.remote_locator,
                project_id = excluded.project_id,
                category = excluded.category,
                retry_count = excluded.retry_count",
        )
        .bind(task.local_path.to_string_lossy().as_ref())
        .bind(task.kind.as_str())
        .bind(&task.remote_locator)
        .bind(&task.project_id)
        .bind(task.category.as_str())
        .bind(i64::from(task.retry_count))
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_task(&self, local_path: &Path) -> Result<(), JournalError> {
        sqlx::query("DELETE FROM tasks WHERE local_path = ?1")
            .bind(local_path.to_string_lossy().as_ref())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Tasks still owed, oldest first.
    pub async fn pending_tasks(&self) -> Result<Vec<JournaledTask>, JournalError> {
        let rows = sqlx::query(
            "SELECT local_path, kind, remote_locator, project_id, category, retry_count
             FROM tasks
             ORDER BY enqueued_at ASC, rowid ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let kind: String = row.try_get("kind")?;
            let category: String = row.try_get("category")?;
            let local_path: String = row.try_get("local_path")?;
            let retry_count: i64 = row.try_get("retry_count")?;
            out.push(JournaledTask {
                kind: TaskKind::parse(&kind).ok_or(JournalError::InvalidKind(kind))?,
                local_path: PathBuf::from(local_path),
                remote_locator: row.try_get("remote_locator")?,
                project_id: row.try_get("project_id")?,
                category: category
                    .parse()
                    .map_err(|_| JournalError::InvalidCategory(category.clone()))?,
                retry_count: u32::try_from(retry_count).unwrap_or(0),
            });
        }
        Ok(out)
    }

    pub async fn save_anchor(&self, scope: &str, anchor: &str) -> Result<(), JournalError> {
        sqlx::query(
            "INSERT INTO anchors (scope, anchor, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(scope) DO UPDATE SET anchor = excluded.anchor, updated_at = excluded.updated_at",
        )
        .bind(scope)
        .bind(anchor)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_anchor(&self, scope: &str) -> Result<Option<String>, JournalError> {
        let row = sqlx::query("SELECT anchor FROM anchors WHERE scope = ?1")
            .bind(scope)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| row.try_get::<String, _>("anchor"))
            .transpose()
            .map_err(Into::into)
    }

    pub async fn remove_anchor(&self, scope: &str) -> Result<(), JournalError> {
        sqlx::query("DELETE FROM anchors WHERE scope = ?1")
            .bind(scope)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

pub fn default_journal_path() -> Result<PathBuf, JournalError> {
    let mut path = dirs::data_dir().ok_or(JournalError::MissingDataDir)?;
    path.push("studiodrive");
    path.push("journal.db");
    Ok(path)
}
