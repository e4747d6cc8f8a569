//! In-process backend holding projects, items and objects in memory.
//!
//! Implements all three collaborator traits so the sync core can run without a
//! server, and lets callers inject failures on object transfers.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::records::{
    ChangeBatch, ChangeKind, ChangeScope, Identity, ItemCategory, ItemWrite, Project,
    ProjectAction, RemoteChange, RemoteItem,
};
use crate::remote::{BackendError, IdentityProvider, MetadataStore, ObjectStore};

type ItemKey = (String, ItemCategory, String);

#[derive(Default)]
struct MemoryState {
    projects: BTreeMap<String, Project>,
    items: BTreeMap<ItemKey, RemoteItem>,
    objects: HashMap<String, Vec<u8>>,
    staged: HashMap<String, BTreeMap<u32, Vec<u8>>>,
    log: Vec<(ChangeScope, RemoteChange)>,
    identity: Option<Identity>,
    denied: HashSet<(String, ProjectAction)>,
    failing_writes: u32,
    failing_reads: u32,
    failing_queries: u32,
    write_attempts: u32,
    next_item_id: u64,
}

impl MemoryState {
    fn record(&mut self, change: RemoteChange) {
        let scope = match &change {
            RemoteChange::Project { .. } => ChangeScope::Projects,
            RemoteChange::Item { item, .. } => ChangeScope::Items {
                project_id: item.project_id.clone(),
            },
        };
        self.log.push((scope, change));
    }

    fn take_write_failure(&mut self) -> Result<(), BackendError> {
        self.write_attempts += 1;
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(BackendError::Unavailable("injected write failure".into()));
        }
        Ok(())
    }

    fn take_read_failure(&mut self) -> Result<(), BackendError> {
        if self.failing_reads > 0 {
            self.failing_reads -= 1;
            return Err(BackendError::Unavailable("injected read failure".into()));
        }
        Ok(())
    }

    fn take_query_failure(&mut self) -> Result<(), BackendError> {
        if self.failing_queries > 0 {
            self.failing_queries -= 1;
            return Err(BackendError::Unavailable("injected query failure".into()));
        }
        Ok(())
    }

    fn upsert(&mut self, write: &ItemWrite) -> RemoteItem {
        let key = (write.project_id.clone(), write.category, write.name.clone());
        let existing_id = self.items.get(&key).map(|item| item.id.clone());
        let kind = if existing_id.is_some() {
            ChangeKind::Modified
        } else {
            ChangeKind::Added
        };
        let id = existing_id.unwrap_or_else(|| {
            self.next_item_id += 1;
            format!("item-{}", self.next_item_id)
        });
        let item = RemoteItem {
            id,
            project_id: write.project_id.clone(),
            category: write.category,
            name: write.name.clone(),
            locator: Some(write.locator.clone()),
            hash: Some(write.hash.clone()),
            modified: write.modified,
            size: write.size,
        };
        self.items.insert(key, item.clone());
        self.record(RemoteChange::Item {
            kind,
            item: item.clone(),
        });
        item
    }
}

#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identity(id: &str, name: &str) -> Self {
        let backend = Self::new();
        backend.sign_in(id, name);
        backend
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn sign_in(&self, id: &str, name: &str) {
        self.lock().identity = Some(Identity {
            id: id.to_string(),
            name: name.to_string(),
        });
    }

    pub fn sign_out(&self) {
        self.lock().identity = None;
    }

    pub fn add_project(&self, project: Project) {
        let mut state = self.lock();
        let kind = if state.projects.contains_key(&project.id) {
            ChangeKind::Modified
        } else {
            ChangeKind::Added
        };
        state.projects.insert(project.id.clone(), project.clone());
        state.record(RemoteChange::Project { kind, project });
    }

    pub fn remove_project(&self, project_id: &str) {
        let mut state = self.lock();
        if let Some(project) = state.projects.remove(project_id) {
            state.items.retain(|(owner, _, _), _| owner != project_id);
            state.record(RemoteChange::Project {
                kind: ChangeKind::Removed,
                project,
            });
        }
    }

    /// Stores `bytes` under the write's locator and upserts its record.
    pub fn seed_item(&self, write: ItemWrite, bytes: Vec<u8>) -> RemoteItem {
        let mut state = self.lock();
        state.objects.insert(write.locator.clone(), bytes);
        state.upsert(&write)
    }

    pub fn remove_item(&self, project_id: &str, category: ItemCategory, name: &str) {
        let mut state = self.lock();
        let key = (project_id.to_string(), category, name.to_string());
        if let Some(item) = state.items.remove(&key) {
            if let Some(locator) = &item.locator {
                state.objects.remove(locator);
            }
            state.record(RemoteChange::Item {
                kind: ChangeKind::Removed,
                item,
            });
        }
    }

    pub fn item(&self, project_id: &str, category: ItemCategory, name: &str) -> Option<RemoteItem> {
        let key = (project_id.to_string(), category, name.to_string());
        self.lock().items.get(&key).cloned()
    }

    pub fn object(&self, locator: &str) -> Option<Vec<u8>> {
        self.lock().objects.get(locator).cloned()
    }

    /// Replaces stored bytes without touching the record.
    pub fn overwrite_object(&self, locator: &str, bytes: Vec<u8>) {
        self.lock().objects.insert(locator.to_string(), bytes);
    }

    pub fn deny(&self, project_id: &str, action: ProjectAction) {
        self.lock()
            .denied
            .insert((project_id.to_string(), action));
    }

    pub fn fail_next_writes(&self, count: u32) {
        self.lock().failing_writes = count;
    }

    pub fn fail_next_reads(&self, count: u32) {
        self.lock().failing_reads = count;
    }

    /// Fails the next listings, change polls and permission checks.
    pub fn fail_next_queries(&self, count: u32) {
        self.lock().failing_queries = count;
    }

    /// Object writes attempted so far, failed ones included.
    pub fn write_attempts(&self) -> u32 {
        self.lock().write_attempts
    }
}

#[async_trait]
impl MetadataStore for MemoryBackend {
    async fn list_projects(&self, _identity: &str) -> Result<Vec<Project>, BackendError> {
        let mut state = self.lock();
        state.take_query_failure()?;
        Ok(state.projects.values().cloned().collect())
    }

    async fn list_items(
        &self,
        project_id: &str,
        category: ItemCategory,
    ) -> Result<Vec<RemoteItem>, BackendError> {
        let mut state = self.lock();
        state.take_query_failure()?;
        if !state.projects.contains_key(project_id) {
            return Err(BackendError::NotFound(project_id.to_string()));
        }
        Ok(state
            .items
            .iter()
            .filter(|((owner, item_category, _), _)| owner == project_id && *item_category == category)
            .map(|(_, item)| item.clone())
            .collect())
    }

    async fn get_item(
        &self,
        project_id: &str,
        category: ItemCategory,
        name: &str,
    ) -> Result<Option<RemoteItem>, BackendError> {
        Ok(self.item(project_id, category, name))
    }

    async fn upsert_item(&self, item: &ItemWrite) -> Result<RemoteItem, BackendError> {
        let mut state = self.lock();
        if !state.projects.contains_key(&item.project_id) {
            return Err(BackendError::NotFound(item.project_id.clone()));
        }
        Ok(state.upsert(item))
    }

    async fn delete_item(
        &self,
        project_id: &str,
        category: ItemCategory,
        name: &str,
    ) -> Result<(), BackendError> {
        let mut state = self.lock();
        let key = (project_id.to_string(), category, name.to_string());
        let item = state
            .items
            .remove(&key)
            .ok_or_else(|| BackendError::NotFound(format!("{project_id}/{category}/{name}")))?;
        state.record(RemoteChange::Item {
            kind: ChangeKind::Removed,
            item,
        });
        Ok(())
    }

    async fn poll_changes(
        &self,
        scope: &ChangeScope,
        anchor: Option<&str>,
    ) -> Result<ChangeBatch, BackendError> {
        let mut state = self.lock();
        state.take_query_failure()?;
        let head = state.log.len();
        let start = match anchor {
            None => head,
            Some(raw) => raw
                .parse::<usize>()
                .map_err(|_| BackendError::Malformed(format!("bad anchor {raw}")))?
                .min(head),
        };
        let changes = state.log[start..]
            .iter()
            .filter(|(change_scope, _)| change_scope == scope)
            .map(|(_, change)| change.clone())
            .collect();
        Ok(ChangeBatch {
            changes,
            anchor: Some(head.to_string()),
        })
    }
}

#[async_trait]
impl ObjectStore for MemoryBackend {
    async fn object_size(&self, locator: &str) -> Result<u64, BackendError> {
        let mut state = self.lock();
        state.take_read_failure()?;
        state
            .objects
            .get(locator)
            .map(|bytes| bytes.len() as u64)
            .ok_or_else(|| BackendError::NotFound(locator.to_string()))
    }

    async fn read_object(&self, locator: &str) -> Result<Vec<u8>, BackendError> {
        let mut state = self.lock();
        state.take_read_failure()?;
        state
            .objects
            .get(locator)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(locator.to_string()))
    }

    async fn read_range(
        &self,
        locator: &str,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>, BackendError> {
        let mut state = self.lock();
        state.take_read_failure()?;
        let bytes = state
            .objects
            .get(locator)
            .ok_or_else(|| BackendError::NotFound(locator.to_string()))?;
        let start = (offset as usize).min(bytes.len());
        let end = start.saturating_add(len as usize).min(bytes.len());
        Ok(bytes[start..end].to_vec())
    }

    async fn write_object(&self, locator: &str, bytes: Vec<u8>) -> Result<(), BackendError> {
        let mut state = self.lock();
        state.take_write_failure()?;
        state.objects.insert(locator.to_string(), bytes);
        Ok(())
    }

    async fn write_part(
        &self,
        locator: &str,
        part_number: u32,
        bytes: Vec<u8>,
    ) -> Result<(), BackendError> {
        let mut state = self.lock();
        state.take_write_failure()?;
        state
            .staged
            .entry(locator.to_string())
            .or_default()
            .insert(part_number, bytes);
        Ok(())
    }

    async fn complete_multipart(&self, locator: &str, parts: u32) -> Result<(), BackendError> {
        let mut state = self.lock();
        let staged = state
            .staged
            .remove(locator)
            .ok_or_else(|| BackendError::NotFound(format!("no staged parts for {locator}")))?;
        if staged.len() as u32 != parts || staged.keys().copied().ne(0..parts) {
            return Err(BackendError::Malformed(format!(
                "expected {parts} parts for {locator}, got {}",
                staged.len()
            )));
        }
        let assembled: Vec<u8> = staged.into_values().flatten().collect();
        state.objects.insert(locator.to_string(), assembled);
        Ok(())
    }

    async fn delete_object(&self, locator: &str) -> Result<(), BackendError> {
        let mut state = self.lock();
        state
            .objects
            .remove(locator)
            .map(|_| ())
            .ok_or_else(|| BackendError::NotFound(locator.to_string()))
    }
}

#[async_trait]
impl IdentityProvider for MemoryBackend {
    fn identity(&self) -> Option<Identity> {
        self.lock().identity.clone()
    }

    async fn has_permission(
        &self,
        project_id: &str,
        action: ProjectAction,
    ) -> Result<bool, BackendError> {
        let mut state = self.lock();
        state.take_query_failure()?;
        Ok(state.identity.is_some()
            && !state.denied.contains(&(project_id.to_string(), action)))
    }
}
