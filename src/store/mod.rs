mod journaled;
mod memory;

pub use journaled::JournaledStore;
pub use memory::InMemoryStore;

use std::collections::BTreeSet;

use async_trait::async_trait;
use thiserror::Error;

use crate::limits::*;
use crate::model::*;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("item not found: {project_id}/{item_id}")]
    NotFound { project_id: String, item_id: String },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("journal error: {0}")]
    Journal(String),
}

impl StoreError {
    pub fn not_found(project_id: &str, item_id: &str) -> Self {
        StoreError::NotFound {
            project_id: project_id.to_string(),
            item_id: item_id.to_string(),
        }
    }
}

/// Cross-project query used by conflict detection: every item, in any
/// project, whose resource set shares at least one id with `resource_ids`.
#[async_trait]
pub trait ResourceLookup: Send + Sync {
    async fn find_by_resource_intersection(
        &self,
        resource_ids: &BTreeSet<String>,
    ) -> Result<Vec<ScopedItem>, StoreError>;
}

/// Document store holding every project's timeline items.
#[async_trait]
pub trait ItemStore: ResourceLookup {
    async fn list_projects(&self) -> Result<Vec<String>, StoreError>;

    async fn list_project_items(&self, project_id: &str) -> Result<Vec<TimelineItem>, StoreError>;

    async fn get_item(&self, project_id: &str, item_id: &str) -> Result<Option<TimelineItem>, StoreError>;

    /// Full-document write. Returns the replaced document, if any.
    async fn put_item(&self, project_id: &str, item: TimelineItem) -> Result<Option<TimelineItem>, StoreError>;

    /// Returns the removed document, if any.
    async fn delete_item(&self, project_id: &str, item_id: &str) -> Result<Option<TimelineItem>, StoreError>;

    /// Partial update of `validationError` / `conflict`. Other fields are kept.
    async fn patch_item(
        &self,
        project_id: &str,
        item_id: &str,
        patch: &ValidationPatch,
    ) -> Result<(), StoreError>;
}

pub(crate) fn check_item_limits(project_id: &str, item: &TimelineItem) -> Result<(), StoreError> {
    if project_id.is_empty() || item.id.is_empty() {
        return Err(StoreError::LimitExceeded("empty id"));
    }
    if project_id.len() > MAX_ID_LEN || item.id.len() > MAX_ID_LEN {
        return Err(StoreError::LimitExceeded("id too long"));
    }
    if item.name.len() > MAX_NAME_LEN {
        return Err(StoreError::LimitExceeded("item name too long"));
    }
    if item.start_date.len() > MAX_DATE_LEN || item.end_date.len() > MAX_DATE_LEN {
        return Err(StoreError::LimitExceeded("date string too long"));
    }
    if item.dependencies.len() > MAX_DEPENDENCIES_PER_ITEM {
        return Err(StoreError::LimitExceeded("too many dependencies"));
    }
    if item.assigned_resource_ids.len() > MAX_RESOURCES_PER_ITEM {
        return Err(StoreError::LimitExceeded("too many assigned resources"));
    }
    if item
        .dependencies
        .iter()
        .chain(&item.assigned_resource_ids)
        .any(|id| id.len() > MAX_ID_LEN)
    {
        return Err(StoreError::LimitExceeded("referenced id too long"));
    }
    Ok(())
}
