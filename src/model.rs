use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

/// Unix milliseconds, UTC.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Adjacent spans (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Outcome of the last resource-conflict check on an item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictStatus {
    pub is_conflict: bool,
    pub conflicting_items: Vec<ConflictRef>,
}

impl ConflictStatus {
    pub fn clear() -> Self {
        Self::default()
    }

    /// Builds a status from an unordered list, sorting and deduplicating it.
    pub fn from_refs(mut refs: Vec<ConflictRef>) -> Self {
        refs.sort();
        refs.dedup();
        Self {
            is_conflict: !refs.is_empty(),
            conflicting_items: refs,
        }
    }

    pub fn mentions(&self, project_id: &str, item_id: &str) -> bool {
        self.conflicting_items
            .iter()
            .any(|r| r.project_id == project_id && r.item_id == item_id)
    }
}

/// Another item booked on a shared resource over an overlapping range.
/// Ordered by project first so conflict lists group naturally.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRef {
    pub project_id: String,
    pub item_id: String,
}

/// A scheduled unit of work inside a project's timeline.
///
/// Dates stay in their stored string form; they are parsed on every
/// validation pass so a malformed value surfaces as an error instead of
/// being silently coerced at load time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineItem {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub start_date: String,
    pub end_date: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub assigned_resource_ids: Vec<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub is_critical: Option<bool>,
    #[serde(default)]
    pub validation_error: Option<String>,
    #[serde(default)]
    pub conflict: Option<ConflictStatus>,
}

impl TimelineItem {
    pub fn depends_on(&self, id: &str) -> bool {
        self.dependencies.iter().any(|d| d == id)
    }

    /// Apply the validator-owned fields of a patch. All other fields are left alone.
    pub fn apply_patch(&mut self, patch: &ValidationPatch) {
        if let Some(error) = &patch.validation_error {
            self.validation_error = error.clone();
        }
        if let Some(conflict) = &patch.conflict {
            self.conflict = Some(conflict.clone());
        }
    }
}

/// An item paired with the project that owns it, as returned by
/// cross-project queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopedItem {
    pub project_id: String,
    pub item: TimelineItem,
}

/// Partial update produced by one validation pass.
///
/// `validation_error` distinguishes "leave alone" (`None`) from
/// "clear" (`Some(None)`) and "set" (`Some(Some(msg))`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationPatch {
    pub validation_error: Option<Option<String>>,
    pub conflict: Option<ConflictStatus>,
}

impl ValidationPatch {
    pub fn error(message: &str) -> Self {
        Self {
            validation_error: Some(Some(message.to_string())),
            conflict: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.validation_error.is_none() && self.conflict.is_none()
    }

    /// True when applying the patch would leave `item` unchanged.
    pub fn is_noop_for(&self, item: &TimelineItem) -> bool {
        let error_same = self
            .validation_error
            .as_ref()
            .is_none_or(|e| *e == item.validation_error);
        let conflict_same = self
            .conflict
            .as_ref()
            .is_none_or(|c| item.conflict.as_ref() == Some(c));
        error_same && conflict_same
    }
}

/// Serialized as a document patch: absent keys are untouched, `null` clears.
impl Serialize for ValidationPatch {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = self.validation_error.is_some() as usize + self.conflict.is_some() as usize;
        let mut map = serializer.serialize_map(Some(len))?;
        if let Some(error) = &self.validation_error {
            map.serialize_entry("validationError", error)?;
        }
        if let Some(conflict) = &self.conflict {
            map.serialize_entry("conflict", conflict)?;
        }
        map.end()
    }
}

/// A document write as delivered by the store's trigger mechanism.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteEvent {
    pub project_id: String,
    pub item_id: String,
    #[serde(default)]
    pub before: Option<TimelineItem>,
    #[serde(default)]
    pub after: Option<TimelineItem>,
}

impl WriteEvent {
    pub fn is_delete(&self) -> bool {
        self.after.is_none()
    }
}

/// One journal entry.
///
/// No `skip_serializing_if` anywhere below: bincode needs every field present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    ItemWritten {
        project_id: String,
        item: TimelineItem,
    },
    ItemDeleted {
        project_id: String,
        item_id: String,
    },
    ItemPatched {
        project_id: String,
        item_id: String,
        validation_error: Option<Option<String>>,
        conflict: Option<ConflictStatus>,
    },
}

impl Record {
    pub fn project_id(&self) -> &str {
        match self {
            Record::ItemWritten { project_id, .. }
            | Record::ItemDeleted { project_id, .. }
            | Record::ItemPatched { project_id, .. } => project_id,
        }
    }

    pub fn patched(project_id: &str, item_id: &str, patch: &ValidationPatch) -> Self {
        Record::ItemPatched {
            project_id: project_id.to_string(),
            item_id: item_id.to_string(),
            validation_error: patch.validation_error.clone(),
            conflict: patch.conflict.clone(),
        }
    }
}
