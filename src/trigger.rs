use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{stream, FutureExt, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use ulid::Ulid;

use crate::model::*;
use crate::observability::*;
use crate::notify::NotifyHub;
use crate::store::{ItemStore, StoreError};
use crate::validator::{self, ValidationError, CYCLE_MESSAGE};

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("invalid event: {0}")]
    InvalidEvent(String),
}

/// A validation result for one item and whether it reached the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedPatch {
    pub project_id: String,
    pub item_id: String,
    pub patch: ValidationPatch,
    /// False when the document already matched and the write was skipped.
    pub written: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// The written item was validated.
    Validated(AppliedPatch),
    /// A deletion re-validated the items that referred to the deleted one.
    Revalidated(Vec<AppliedPatch>),
    /// Deletion with re-validation turned off.
    Ignored,
}

/// Reject events whose ids cannot be trusted.
pub fn check_event(event: &WriteEvent) -> Result<(), TriggerError> {
    if event.project_id.is_empty() || event.item_id.is_empty() {
        return Err(TriggerError::InvalidEvent("projectId and itemId are required".into()));
    }
    if let Some(after) = &event.after
        && after.id != event.item_id
    {
        return Err(TriggerError::InvalidEvent(format!(
            "after.id {:?} does not match itemId {:?}",
            after.id, event.item_id
        )));
    }
    Ok(())
}

/// Reacts to document writes by validating the written item and patching it.
pub struct TriggerHandler {
    store: Arc<dyn ItemStore>,
    notify: Arc<NotifyHub>,
    revalidate_on_delete: bool,
    concurrency: usize,
}

impl TriggerHandler {
    pub fn new(store: Arc<dyn ItemStore>, notify: Arc<NotifyHub>) -> Self {
        Self {
            store,
            notify,
            revalidate_on_delete: true,
            concurrency: 8,
        }
    }

    pub fn with_revalidate_on_delete(mut self, enabled: bool) -> Self {
        self.revalidate_on_delete = enabled;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn ItemStore> {
        &self.store
    }

    pub fn notify(&self) -> &Arc<NotifyHub> {
        &self.notify
    }

    /// Handle one write event. The store must already reflect the write.
    pub async fn handle(&self, event: &WriteEvent) -> Result<TriggerOutcome, TriggerError> {
        let span = info_span!(
            "trigger",
            run_id = %Ulid::new(),
            project_id = %event.project_id,
            item_id = %event.item_id,
        );
        self.dispatch(event).instrument(span).await
    }

    async fn dispatch(&self, event: &WriteEvent) -> Result<TriggerOutcome, TriggerError> {
        check_event(event)?;
        match &event.after {
            Some(after) => {
                metrics::counter!(EVENTS_TOTAL, "kind" => "write").increment(1);
                let siblings = self.store.list_project_items(&event.project_id).await?;
                let applied = self.validate_against(&event.project_id, after, &siblings).await?;
                Ok(TriggerOutcome::Validated(applied))
            }
            None => {
                metrics::counter!(EVENTS_TOTAL, "kind" => "delete").increment(1);
                self.handle_delete(event).await
            }
        }
    }

    /// Validate `item` against `siblings` and write the patch if it changes anything.
    async fn validate_against(
        &self,
        project_id: &str,
        item: &TimelineItem,
        siblings: &[TimelineItem],
    ) -> Result<AppliedPatch, TriggerError> {
        let validation =
            validator::validate_with_outcome(item, project_id, siblings, self.store.as_ref()).await?;
        debug!(project_id, item_id = %item.id, outcome = ?validation.outcome, "validated");

        let current = siblings.iter().find(|s| s.id == item.id).unwrap_or(item);
        let mut applied = AppliedPatch {
            project_id: project_id.to_string(),
            item_id: item.id.clone(),
            patch: validation.patch,
            written: false,
        };
        if applied.patch.is_empty() || applied.patch.is_noop_for(current) {
            metrics::counter!(PATCHES_SKIPPED_TOTAL).increment(1);
            return Ok(applied);
        }

        self.store
            .patch_item(project_id, &item.id, &applied.patch)
            .await?;
        metrics::counter!(PATCHES_WRITTEN_TOTAL).increment(1);
        applied.written = true;
        self.notify.send(&applied);
        Ok(applied)
    }

    /// Re-validate what the deleted item may have left stale: siblings that
    /// depended on it, siblings flagged with a cycle, and items anywhere whose
    /// conflict list names it.
    async fn handle_delete(&self, event: &WriteEvent) -> Result<TriggerOutcome, TriggerError> {
        if !self.revalidate_on_delete {
            debug!("deletion ignored");
            return Ok(TriggerOutcome::Ignored);
        }
        let project_id = event.project_id.as_str();
        let deleted_id = event.item_id.as_str();

        let siblings = self.store.list_project_items(project_id).await?;
        if siblings.is_empty() {
            self.notify.remove(project_id);
        }

        let mut targets: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for sibling in &siblings {
            let stale_cycle = sibling.validation_error.as_deref() == Some(CYCLE_MESSAGE);
            let named = sibling
                .conflict
                .as_ref()
                .is_some_and(|c| c.mentions(project_id, deleted_id));
            if sibling.depends_on(deleted_id) || stale_cycle || named {
                targets
                    .entry(project_id.to_string())
                    .or_default()
                    .insert(sibling.id.clone());
            }
        }

        let resource_ids: BTreeSet<String> = event
            .before
            .iter()
            .flat_map(|b| b.assigned_resource_ids.iter().cloned())
            .collect();
        if !resource_ids.is_empty() {
            for holder in self.store.find_by_resource_intersection(&resource_ids).await? {
                let named = holder
                    .item
                    .conflict
                    .as_ref()
                    .is_some_and(|c| c.mentions(project_id, deleted_id));
                if named {
                    targets
                        .entry(holder.project_id)
                        .or_default()
                        .insert(holder.item.id);
                }
            }
        }
        if let Some(ids) = targets.get_mut(project_id) {
            ids.remove(deleted_id);
        }

        let total: usize = targets.values().map(BTreeSet::len).sum();
        info!(targets = total, "re-validating after deletion");

        let mut applied = Vec::new();
        for (target_project, ids) in targets {
            let items = if target_project == project_id {
                siblings.clone()
            } else {
                self.store.list_project_items(&target_project).await?
            };
            let selected: Vec<&TimelineItem> = items.iter().filter(|i| ids.contains(&i.id)).collect();
            applied.extend(self.validate_many(&target_project, &selected, &items).await);
        }
        Ok(TriggerOutcome::Revalidated(applied))
    }

    /// Validate several items of one project with bounded concurrency.
    /// Per-item failures are logged and left out of the result.
    async fn validate_many(
        &self,
        project_id: &str,
        items: &[&TimelineItem],
        siblings: &[TimelineItem],
    ) -> Vec<AppliedPatch> {
        // Boxed eagerly; a lazily mapped stream leaves callers' futures !Send.
        let pending: Vec<BoxFuture<'_, (&TimelineItem, Result<AppliedPatch, TriggerError>)>> = items
            .iter()
            .map(|&item| async move { (item, self.validate_against(project_id, item, siblings).await) }.boxed())
            .collect();
        let results: Vec<_> = stream::iter(pending)
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut applied = Vec::with_capacity(results.len());
        for (item, result) in results {
            match result {
                Ok(a) => applied.push(a),
                Err(e) => {
                    metrics::counter!(REVALIDATION_FAILURES_TOTAL).increment(1);
                    warn!(project_id, item_id = %item.id, "re-validation failed: {e}");
                }
            }
        }
        applied.sort_by(|a, b| a.item_id.cmp(&b.item_id));
        applied
    }

    /// Re-validate every item of a project against one snapshot.
    pub async fn revalidate_project(&self, project_id: &str) -> Result<Vec<AppliedPatch>, TriggerError> {
        let items = self.store.list_project_items(project_id).await?;
        let all: Vec<&TimelineItem> = items.iter().collect();
        Ok(self.validate_many(project_id, &all, &items).await)
    }

    /// Re-validate every project. Returns the number of patches written.
    pub async fn revalidate_all(&self) -> Result<usize, TriggerError> {
        let mut written = 0;
        for project_id in self.store.list_projects().await? {
            match self.revalidate_project(&project_id).await {
                Ok(applied) => written += applied.iter().filter(|a| a.written).count(),
                Err(e) => warn!(project_id = %project_id, "project re-validation failed: {e}"),
            }
        }
        Ok(written)
    }
}
