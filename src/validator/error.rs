use thiserror::Error;

use crate::store::StoreError;

/// Which date field of an item failed to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateField {
    Start,
    End,
}

impl std::fmt::Display for DateField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DateField::Start => f.write_str("startDate"),
            DateField::End => f.write_str("endDate"),
        }
    }
}

/// Faults that abort a validation pass. Cycles and conflicts are not errors;
/// they come back as data in the patch.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A date on the changed item or on a conflict candidate did not parse.
    #[error("invalid {field} {value:?} on item {item_id:?}: expected an ISO-8601 date or date-time")]
    InvalidDate {
        item_id: String,
        field: DateField,
        value: String,
    },
    #[error("resource lookup failed: {0}")]
    Lookup(#[source] StoreError),
}
