use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub owner: String,
    #[serde(default)]
    pub modified: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemCategory {
    Tracks,
    References,
    WorkRequests,
}

impl ItemCategory {
    pub const ALL: [ItemCategory; 3] = [
        ItemCategory::Tracks,
        ItemCategory::References,
        ItemCategory::WorkRequests,
    ];

    /// Name of the category folder inside a project mirror.
    pub fn folder_name(self) -> &'static str {
        match self {
            ItemCategory::Tracks => "Tracks",
            ItemCategory::References => "References",
            ItemCategory::WorkRequests => "WorkRequests",
        }
    }

    pub fn from_folder_name(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|category| category.folder_name() == value)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ItemCategory::Tracks => "tracks",
            ItemCategory::References => "references",
            ItemCategory::WorkRequests => "work_requests",
        }
    }
}

impl fmt::Display for ItemCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCategory(pub String);

impl fmt::Display for UnknownCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown item category: {}", self.0)
    }
}

impl std::error::Error for UnknownCategory {}

impl FromStr for ItemCategory {
    type Err = UnknownCategory;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "tracks" => Ok(ItemCategory::Tracks),
            "references" => Ok(ItemCategory::References),
            "work_requests" => Ok(ItemCategory::WorkRequests),
            other => Err(UnknownCategory(other.to_string())),
        }
    }
}

/// A track, reference or work request as the metadata store reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteItem {
    pub id: String,
    pub project_id: String,
    pub category: ItemCategory,
    pub name: String,
    #[serde(default)]
    pub locator: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
    /// Unix milliseconds.
    #[serde(default)]
    pub modified: i64,
    #[serde(default)]
    pub size: u64,
}

impl RemoteItem {
    pub fn content_differs(&self, other: &RemoteItem) -> bool {
        self.hash != other.hash
            || self.modified != other.modified
            || self.size != other.size
            || self.locator != other.locator
    }
}

/// Body of a create/update call against the metadata store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemWrite {
    pub project_id: String,
    pub category: ItemCategory,
    pub name: String,
    pub locator: String,
    pub hash: String,
    pub size: u64,
    pub modified: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChangeScope {
    Projects,
    Items { project_id: String },
}

impl ChangeScope {
    pub fn key(&self) -> String {
        match self {
            ChangeScope::Projects => "projects".to_string(),
            ChangeScope::Items { project_id } => format!("project:{project_id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "lowercase")]
pub enum RemoteChange {
    Project { kind: ChangeKind, project: Project },
    Item { kind: ChangeKind, item: RemoteItem },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeBatch {
    #[serde(default)]
    pub changes: Vec<RemoteChange>,
    /// Cursor to resume from on the next poll.
    #[serde(default)]
    pub anchor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProjectAction {
    Read,
    Write,
    Delete,
}

impl ProjectAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ProjectAction::Read => "read",
            ProjectAction::Write => "write",
            ProjectAction::Delete => "delete",
        }
    }
}
