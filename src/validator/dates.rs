use chrono::{DateTime, NaiveDate, NaiveDateTime};

use crate::model::{Ms, TimelineItem};

use super::error::{DateField, ValidationError};

/// Parse an ISO-8601 date or date-time into UTC milliseconds.
///
/// Accepts RFC 3339 with an offset, a naive `YYYY-MM-DDTHH:MM:SS[.fff]`
/// (read as UTC), or a bare `YYYY-MM-DD` (midnight UTC).
pub fn parse_timestamp(value: &str) -> Option<Ms> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.timestamp_millis());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc().timestamp_millis());
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return date
            .and_hms_opt(0, 0, 0)
            .map(|midnight| midnight.and_utc().timestamp_millis());
    }
    None
}

fn parse_field(item: &TimelineItem, field: DateField, value: &str) -> Result<Ms, ValidationError> {
    parse_timestamp(value).ok_or_else(|| ValidationError::InvalidDate {
        item_id: item.id.clone(),
        field,
        value: value.to_string(),
    })
}

/// Parsed `(start, end)` of an item. Ordering is not checked here.
pub fn item_bounds(item: &TimelineItem) -> Result<(Ms, Ms), ValidationError> {
    let start = parse_field(item, DateField::Start, &item.start_date)?;
    let end = parse_field(item, DateField::End, &item.end_date)?;
    Ok((start, end))
}
