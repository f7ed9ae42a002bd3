use crate::model::*;

use super::dates::item_bounds;
use super::error::ValidationError;

/// Compare `span` (the changed item's range) against candidates sharing a
/// resource. The changed item is recognised by id and project together,
/// since ids are only unique within a project.
///
/// A candidate overlaps when `span.start < end && span.end > start` on its
/// own parsed dates, whatever their order. A candidate date that does not
/// parse fails the whole pass.
pub fn find_conflicts(
    project_id: &str,
    item_id: &str,
    span: &Span,
    candidates: &[ScopedItem],
) -> Result<ConflictStatus, ValidationError> {
    let mut refs = Vec::new();
    for candidate in candidates {
        if candidate.project_id == project_id && candidate.item.id == item_id {
            continue;
        }
        let (start, end) = item_bounds(&candidate.item).inspect_err(|e| {
            tracing::debug!(project_id = %candidate.project_id, "conflict candidate rejected: {e}");
        })?;
        if span.start < end && span.end > start {
            refs.push(ConflictRef {
                project_id: candidate.project_id.clone(),
                item_id: candidate.item.id.clone(),
            });
        }
    }
    Ok(ConflictStatus::from_refs(refs))
}
