mod conflict;
mod cycle;
mod dates;
mod error;

pub use conflict::find_conflicts;
pub use cycle::DependencyGraph;
pub use dates::{item_bounds, parse_timestamp};
pub use error::{DateField, ValidationError};

use std::collections::BTreeSet;
use std::time::Instant;

use tracing::debug;

use crate::model::*;
use crate::observability::{self, *};
use crate::store::ResourceLookup;

pub const DATE_ORDER_MESSAGE: &str = "Start date must be before end date.";
pub const CYCLE_MESSAGE: &str = "Circular dependency detected.";

/// Which terminal branch a validation pass took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Start is not before end; nothing else was checked.
    DateOrder,
    /// The project's dependency graph has a cycle; conflicts were not checked.
    Cycle,
    /// Dates and dependencies are sound; the patch carries a conflict result.
    Clean,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub outcome: Outcome,
    pub patch: ValidationPatch,
}

/// Validate `changed`, which belongs to `project_id`, and return the patch
/// to write back onto it.
///
/// `project_items` is the project's current item set. `lookup` is only
/// consulted when dates and dependencies pass and the item has resources.
pub async fn validate<L>(
    changed: &TimelineItem,
    project_id: &str,
    project_items: &[TimelineItem],
    lookup: &L,
) -> Result<ValidationPatch, ValidationError>
where
    L: ResourceLookup + ?Sized,
{
    validate_with_outcome(changed, project_id, project_items, lookup)
        .await
        .map(|v| v.patch)
}

/// Same as [`validate`], also reporting which branch was taken.
pub async fn validate_with_outcome<L>(
    changed: &TimelineItem,
    project_id: &str,
    project_items: &[TimelineItem],
    lookup: &L,
) -> Result<Validation, ValidationError>
where
    L: ResourceLookup + ?Sized,
{
    let started = Instant::now();
    let result = run(changed, project_id, project_items, lookup).await;
    metrics::histogram!(VALIDATION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    let label = observability::outcome_label(&result.as_ref().map(|v| v.outcome));
    metrics::counter!(VALIDATIONS_TOTAL, "outcome" => label).increment(1);
    result
}

async fn run<L>(
    changed: &TimelineItem,
    project_id: &str,
    project_items: &[TimelineItem],
    lookup: &L,
) -> Result<Validation, ValidationError>
where
    L: ResourceLookup + ?Sized,
{
    let (start, end) = item_bounds(changed)?;
    if start >= end {
        return Ok(Validation {
            outcome: Outcome::DateOrder,
            patch: ValidationPatch::error(DATE_ORDER_MESSAGE),
        });
    }

    // The changed item wins over whatever copy the snapshot holds.
    let graph = DependencyGraph::from_items(
        project_items
            .iter()
            .filter(|item| item.id != changed.id)
            .chain(std::iter::once(changed)),
    );
    if let Some(path) = graph.find_cycle() {
        debug!(project_id, item_id = %changed.id, ?path, "circular dependency");
        return Ok(Validation {
            outcome: Outcome::Cycle,
            patch: ValidationPatch::error(CYCLE_MESSAGE),
        });
    }

    let mut patch = ValidationPatch::default();
    if changed.validation_error.is_some() {
        patch.validation_error = Some(None);
    }
    let span = Span::new(start, end);
    patch.conflict = Some(check_resources(changed, project_id, &span, lookup).await?);

    Ok(Validation {
        outcome: Outcome::Clean,
        patch,
    })
}

async fn check_resources<L>(
    changed: &TimelineItem,
    project_id: &str,
    span: &Span,
    lookup: &L,
) -> Result<ConflictStatus, ValidationError>
where
    L: ResourceLookup + ?Sized,
{
    if changed.assigned_resource_ids.is_empty() {
        return Ok(ConflictStatus::clear());
    }

    let resource_ids: BTreeSet<String> = changed.assigned_resource_ids.iter().cloned().collect();
    let candidates = lookup
        .find_by_resource_intersection(&resource_ids)
        .await
        .map_err(|e| {
            metrics::counter!(LOOKUP_FAILURES_TOTAL).increment(1);
            ValidationError::Lookup(e)
        })?;

    let status = find_conflicts(project_id, &changed.id, span, &candidates)?;
    if status.is_conflict {
        metrics::counter!(CONFLICTS_DETECTED_TOTAL).increment(1);
        debug!(
            project_id,
            item_id = %changed.id,
            conflicts = status.conflicting_items.len(),
            "resource conflict"
        );
    }
    Ok(status)
}
