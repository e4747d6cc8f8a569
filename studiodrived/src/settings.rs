use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::sync::journal::default_journal_path;
use crate::sync::queue::{DEFAULT_MAX_DOWNLOADS, DEFAULT_MAX_UPLOADS};

const DEFAULT_DRIVE_DIR_NAME: &str = "StudioDrive";
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 30;
pub const MIN_SYNC_INTERVAL_SECS: u64 = 10;
pub const MAX_SYNC_INTERVAL_SECS: u64 = 300;
const DEFAULT_MAX_CACHE_BYTES: u64 = 0;
const DEFAULT_CONFLICT_RETENTION_DAYS: u64 = 30;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("home directory is unavailable")]
    MissingHome,
    #[error("invalid conflict policy: {0}")]
    InvalidConflictPolicy(String),
}

/// What to do when both sides changed an item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Keep the local bytes as a conflict copy, then take the remote version.
    #[default]
    Ask,
    Local,
    Remote,
}

impl ConflictPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictPolicy::Ask => "ask",
            ConflictPolicy::Local => "local",
            ConflictPolicy::Remote => "remote",
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictPolicy {
    type Err = SettingsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ask" => Ok(ConflictPolicy::Ask),
            "local" => Ok(ConflictPolicy::Local),
            "remote" => Ok(ConflictPolicy::Remote),
            other => Err(SettingsError::InvalidConflictPolicy(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub drive_root: PathBuf,
    pub backend_url: Option<String>,
    pub api_token: Option<String>,
    /// `None` runs without a task journal.
    pub journal_path: Option<PathBuf>,
    pub sync_interval: Duration,
    pub conflict_policy: ConflictPolicy,
    /// Upper bound for hydrated content in the mirror; 0 disables eviction.
    pub max_cache_bytes: u64,
    pub conflict_tolerance_ms: i64,
    pub conflict_retention_days: u64,
    pub max_concurrent_uploads: usize,
    pub max_concurrent_downloads: usize,
    pub enable_local_watcher: bool,
}

impl Settings {
    /// Defaults rooted at `drive_root`, without backend or journal.
    pub fn with_root(drive_root: impl Into<PathBuf>) -> Self {
        Self {
            drive_root: drive_root.into(),
            backend_url: None,
            api_token: None,
            journal_path: None,
            sync_interval: Duration::from_secs(DEFAULT_SYNC_INTERVAL_SECS),
            conflict_policy: ConflictPolicy::Ask,
            max_cache_bytes: DEFAULT_MAX_CACHE_BYTES,
            conflict_tolerance_ms: 0,
            conflict_retention_days: DEFAULT_CONFLICT_RETENTION_DAYS,
            max_concurrent_uploads: DEFAULT_MAX_UPLOADS,
            max_concurrent_downloads: DEFAULT_MAX_DOWNLOADS,
            enable_local_watcher: true,
        }
    }

    pub fn from_env() -> Result<Self, SettingsError> {
        let home = dirs::home_dir().ok_or(SettingsError::MissingHome)?;
        Self::from_vars(|name| std::env::var(name).ok(), &home)
    }

    /// Builds settings from a variable lookup; `from_env` passes the process
    /// environment.
    pub fn from_vars<F>(vars: F, home: &Path) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let drive_root = vars("STUDIODRIVE_ROOT")
            .map(|value| expand_with_home(&value, home))
            .unwrap_or_else(|| home.join(DEFAULT_DRIVE_DIR_NAME));
        let journal_path = if read_bool_env(&vars, "STUDIODRIVE_DISABLE_JOURNAL", false) {
            None
        } else {
            vars("STUDIODRIVE_JOURNAL")
                .map(|value| expand_with_home(&value, home))
                .or_else(|| default_journal_path().ok())
        };
        let conflict_policy = match vars("STUDIODRIVE_CONFLICT_POLICY") {
            Some(value) => value.parse()?,
            None => ConflictPolicy::Ask,
        };

        let mut settings = Self {
            drive_root,
            backend_url: vars("STUDIODRIVE_BACKEND_URL").filter(|value| !value.is_empty()),
            api_token: vars("STUDIODRIVE_TOKEN").filter(|value| !value.is_empty()),
            journal_path,
            conflict_policy,
            max_cache_bytes: read_u64_env(&vars, "STUDIODRIVE_MAX_CACHE_BYTES", DEFAULT_MAX_CACHE_BYTES),
            conflict_tolerance_ms: read_u64_env(&vars, "STUDIODRIVE_CONFLICT_TOLERANCE_MS", 0)
                .min(i64::MAX as u64) as i64,
            conflict_retention_days: read_u64_env(
                &vars,
                "STUDIODRIVE_CONFLICT_RETENTION_DAYS",
                DEFAULT_CONFLICT_RETENTION_DAYS,
            ),
            max_concurrent_uploads: read_u64_env(
                &vars,
                "STUDIODRIVE_MAX_UPLOADS",
                DEFAULT_MAX_UPLOADS as u64,
            ) as usize,
            max_concurrent_downloads: read_u64_env(
                &vars,
                "STUDIODRIVE_MAX_DOWNLOADS",
                DEFAULT_MAX_DOWNLOADS as u64,
            ) as usize,
            enable_local_watcher: read_bool_env(&vars, "STUDIODRIVE_ENABLE_WATCHER", true),
            sync_interval: Duration::ZERO,
        };
        settings.set_sync_interval(Duration::from_secs(read_u64_env(
            &vars,
            "STUDIODRIVE_SYNC_INTERVAL_SECS",
            DEFAULT_SYNC_INTERVAL_SECS,
        )));
        Ok(settings)
    }

    /// Stores the interval clamped to the supported range.
    pub fn set_sync_interval(&mut self, interval: Duration) {
        self.sync_interval = clamp_sync_interval(interval);
    }

    pub fn conflict_retention(&self) -> Duration {
        Duration::from_secs(self.conflict_retention_days.saturating_mul(24 * 60 * 60))
    }
}

pub fn clamp_sync_interval(interval: Duration) -> Duration {
    interval.clamp(
        Duration::from_secs(MIN_SYNC_INTERVAL_SECS),
        Duration::from_secs(MAX_SYNC_INTERVAL_SECS),
    )
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_u64_env<F>(vars: &F, name: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    vars(name)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_env<F>(vars: &F, name: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    vars(name)
        .map(|value| match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        })
        .unwrap_or(default)
}
