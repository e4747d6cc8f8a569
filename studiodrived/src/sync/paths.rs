use std::path::{Component, Path, PathBuf};

use studiodrive_core::ItemCategory;
use thiserror::Error;

pub const SIDECAR_EXTENSION: &str = "metadata";
pub const PROJECT_SNAPSHOT_NAME: &str = ".project.metadata";

#[derive(Debug, Error)]
pub enum PathError {
    #[error("name is empty")]
    Empty,
    #[error("name contains unsupported component: {0}")]
    UnsupportedComponent(String),
}

/// Where an item lives inside the mirror.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MirrorLocation {
    pub project_id: String,
    pub category: ItemCategory,
    pub name: String,
}

/// Maps `(project, category, name)` to mirror paths and back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorLayout {
    root: PathBuf,
}

impl MirrorLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn project_dir(&self, project_id: &str) -> Result<PathBuf, PathError> {
        Ok(self.root.join(single_component(project_id)?))
    }

    pub fn category_dir(
        &self,
        project_id: &str,
        category: ItemCategory,
    ) -> Result<PathBuf, PathError> {
        Ok(self.project_dir(project_id)?.join(category.folder_name()))
    }

    pub fn item_path(
        &self,
        project_id: &str,
        category: ItemCategory,
        name: &str,
    ) -> Result<PathBuf, PathError> {
        Ok(self
            .category_dir(project_id, category)?
            .join(single_component(name)?))
    }

    pub fn project_snapshot_path(&self, project_id: &str) -> Result<PathBuf, PathError> {
        Ok(self.project_dir(project_id)?.join(PROJECT_SNAPSHOT_NAME))
    }

    /// Reverse of [`MirrorLayout::item_path`]; `None` for anything that is not
    /// a direct child of a category folder.
    pub fn locate(&self, path: &Path) -> Option<MirrorLocation> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let mut parts = relative.components().map(|component| match component {
            Component::Normal(part) => part.to_str(),
            _ => None,
        });
        let project_id = parts.next()??;
        let category = ItemCategory::from_folder_name(parts.next()??)?;
        let name = parts.next()??;
        if parts.next().is_some() {
            return None;
        }
        Some(MirrorLocation {
            project_id: project_id.to_string(),
            category,
            name: name.to_string(),
        })
    }
}

pub fn sidecar_path(item_path: &Path) -> PathBuf {
    let mut name = item_path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(SIDECAR_EXTENSION);
    item_path.with_file_name(name)
}

fn single_component(name: &str) -> Result<&str, PathError> {
    if name.is_empty() {
        return Err(PathError::Empty);
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(name),
        _ => Err(PathError::UnsupportedComponent(name.to_string())),
    }
}
