use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::limits::*;
use crate::model::*;

use super::{check_item_limits, ItemStore, ResourceLookup, StoreError};

type ItemKey = (String, String);

/// Process-local document store.
///
/// Lock order is always `projects` before `by_resource`; nothing holds a
/// `by_resource` guard while touching `projects`.
///
/// Capacity caps are enforced under the project's entry guard. New projects
/// reserve a slot in `project_count` before they are inserted.
pub struct InMemoryStore {
    projects: DashMap<String, HashMap<String, TimelineItem>>,
    /// Reverse lookup: resource id → (project id, item id) of items booked on it.
    by_resource: DashMap<String, HashSet<ItemKey>>,
    project_count: AtomicUsize,
    max_projects: usize,
    max_items_per_project: usize,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_caps(MAX_PROJECTS, MAX_ITEMS_PER_PROJECT)
    }

    pub fn with_caps(max_projects: usize, max_items_per_project: usize) -> Self {
        Self {
            projects: DashMap::new(),
            by_resource: DashMap::new(),
            project_count: AtomicUsize::new(0),
            max_projects,
            max_items_per_project,
        }
    }

    // ── Reads ────────────────────────────────────────────────

    pub fn project_count(&self) -> usize {
        self.project_count.load(Ordering::Acquire)
    }

    pub fn project_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.projects.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn items(&self, project_id: &str) -> Vec<TimelineItem> {
        let mut items: Vec<TimelineItem> = self
            .projects
            .get(project_id)
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        items
    }

    pub fn get(&self, project_id: &str, item_id: &str) -> Option<TimelineItem> {
        self.projects
            .get(project_id)
            .and_then(|p| p.get(item_id).cloned())
    }

    pub fn contains(&self, project_id: &str, item_id: &str) -> bool {
        self.projects
            .get(project_id)
            .is_some_and(|p| p.contains_key(item_id))
    }

    /// Items sharing any resource with `resource_ids`, ordered by (project, item).
    pub fn with_resources(&self, resource_ids: &BTreeSet<String>) -> Vec<ScopedItem> {
        let mut keys: BTreeSet<ItemKey> = BTreeSet::new();
        for rid in resource_ids {
            if let Some(holders) = self.by_resource.get(rid) {
                keys.extend(holders.iter().cloned());
            }
        }
        keys.into_iter()
            .filter_map(|(project_id, item_id)| {
                self.get(&project_id, &item_id)
                    .map(|item| ScopedItem { project_id, item })
            })
            .collect()
    }

    // ── Writes ───────────────────────────────────────────────

    /// Fail early with the error `put` would return right now, without
    /// writing. Callers that journal before applying use this to avoid
    /// logging writes that cannot land; `put` checks again under its guard.
    pub fn check_put(&self, project_id: &str, item: &TimelineItem) -> Result<(), StoreError> {
        check_item_limits(project_id, item)?;
        match self.projects.get(project_id) {
            Some(project) => self.check_item_room(&project, &item.id),
            None if self.project_count() >= self.max_projects => {
                Err(StoreError::LimitExceeded("too many projects"))
            }
            None => Ok(()),
        }
    }

    fn check_item_room(&self, project: &HashMap<String, TimelineItem>, item_id: &str) -> Result<(), StoreError> {
        if !project.contains_key(item_id) && project.len() >= self.max_items_per_project {
            return Err(StoreError::LimitExceeded("too many items in project"));
        }
        Ok(())
    }

    pub fn put(&self, project_id: &str, item: TimelineItem) -> Result<Option<TimelineItem>, StoreError> {
        check_item_limits(project_id, &item)?;
        let mut project = match self.projects.entry(project_id.to_string()) {
            Entry::Occupied(entry) => {
                self.check_item_room(entry.get(), &item.id)?;
                entry.into_ref()
            }
            Entry::Vacant(entry) => {
                let max = self.max_projects;
                self.project_count
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
                    .map_err(|_| StoreError::LimitExceeded("too many projects"))?;
                entry.insert(HashMap::new())
            }
        };
        let item_id = item.id.clone();
        let resources = item.assigned_resource_ids.clone();
        let previous = project.insert(item_id.clone(), item);
        if let Some(prev) = &previous {
            self.unindex(project_id, &prev.id, &prev.assigned_resource_ids);
        }
        self.index(project_id, &item_id, &resources);
        Ok(previous)
    }

    pub fn remove(&self, project_id: &str, item_id: &str) -> Option<TimelineItem> {
        let removed = {
            let mut project = self.projects.get_mut(project_id)?;
            let removed = project.remove(item_id)?;
            self.unindex(project_id, item_id, &removed.assigned_resource_ids);
            removed
        };
        self.release_if_empty(project_id);
        Some(removed)
    }

    fn release_if_empty(&self, project_id: &str) {
        if self.projects.remove_if(project_id, |_, items| items.is_empty()).is_some() {
            self.project_count.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub fn patch(&self, project_id: &str, item_id: &str, patch: &ValidationPatch) -> Result<(), StoreError> {
        let mut project = self
            .projects
            .get_mut(project_id)
            .ok_or_else(|| StoreError::not_found(project_id, item_id))?;
        let item = project
            .get_mut(item_id)
            .ok_or_else(|| StoreError::not_found(project_id, item_id))?;
        item.apply_patch(patch);
        Ok(())
    }

    // ── Resource index ───────────────────────────────────────

    fn index(&self, project_id: &str, item_id: &str, resources: &[String]) {
        for rid in resources {
            self.by_resource
                .entry(rid.clone())
                .or_default()
                .insert((project_id.to_string(), item_id.to_string()));
        }
    }

    fn unindex(&self, project_id: &str, item_id: &str, resources: &[String]) {
        let key = (project_id.to_string(), item_id.to_string());
        for rid in resources {
            if let Some(mut holders) = self.by_resource.get_mut(rid) {
                holders.remove(&key);
            }
            self.by_resource.remove_if(rid, |_, holders| holders.is_empty());
        }
    }

    // ── Journal support ──────────────────────────────────────

    /// Minimal record list that recreates the current contents.
    pub fn snapshot(&self) -> Vec<Record> {
        let mut records = Vec::new();
        for project_id in self.project_ids() {
            for item in self.items(&project_id) {
                records.push(Record::ItemWritten {
                    project_id: project_id.clone(),
                    item,
                });
            }
        }
        records
    }

    pub fn apply_record(&self, record: &Record) -> Result<(), StoreError> {
        match record {
            Record::ItemWritten { project_id, item } => {
                self.put(project_id, item.clone())?;
            }
            Record::ItemDeleted { project_id, item_id } => {
                self.remove(project_id, item_id);
            }
            Record::ItemPatched {
                project_id,
                item_id,
                validation_error,
                conflict,
            } => {
                let patch = ValidationPatch {
                    validation_error: validation_error.clone(),
                    conflict: conflict.clone(),
                };
                self.patch(project_id, item_id, &patch)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceLookup for InMemoryStore {
    async fn find_by_resource_intersection(
        &self,
        resource_ids: &BTreeSet<String>,
    ) -> Result<Vec<ScopedItem>, StoreError> {
        Ok(self.with_resources(resource_ids))
    }
}

#[async_trait]
impl ItemStore for InMemoryStore {
    async fn list_projects(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.project_ids())
    }

    async fn list_project_items(&self, project_id: &str) -> Result<Vec<TimelineItem>, StoreError> {
        Ok(self.items(project_id))
    }

    async fn get_item(&self, project_id: &str, item_id: &str) -> Result<Option<TimelineItem>, StoreError> {
        Ok(self.get(project_id, item_id))
    }

    async fn put_item(&self, project_id: &str, item: TimelineItem) -> Result<Option<TimelineItem>, StoreError> {
        self.put(project_id, item)
    }

    async fn delete_item(&self, project_id: &str, item_id: &str) -> Result<Option<TimelineItem>, StoreError> {
        Ok(self.remove(project_id, item_id))
    }

    async fn patch_item(
        &self,
        project_id: &str,
        item_id: &str,
        patch: &ValidationPatch,
    ) -> Result<(), StoreError> {
        self.patch(project_id, item_id, patch)
    }
}
