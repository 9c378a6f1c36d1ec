//! Row representation shared by the local store, the remote service and the
//! reconcilers.

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDateTime};
use serde_json::{Map, Value};

/// A single record, keyed by column name.
///
/// Local and remote copies of the same record are correlated by their `id`
/// column only.
pub type Row = Map<String, Value>;

/// Column used as the correlation key on every syncable table.
pub const ID_COLUMN: &str = "id";

/// Column used as the sole "which side is newer" signal.
pub const UPDATED_AT_COLUMN: &str = "updated_at";

/// Read the `id` of a row as a string.
///
/// Integer ids are rendered in decimal so both sides agree on identity.
pub fn row_id(row: &Row) -> Option<String> {
    match row.get(ID_COLUMN)? {
        Value::String(id) if !id.trim().is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Read the normalized `updated_at` of a row.
pub fn row_updated_at(row: &Row) -> Option<Timestamp> {
    row.get(UPDATED_AT_COLUMN).and_then(Timestamp::from_value)
}

/// Whether two copies of a record carry the same `updated_at`.
///
/// Two missing timestamps count as equal; one missing timestamp does not.
pub fn same_updated_at(local: &Row, remote: &Row) -> bool {
    row_updated_at(local) == row_updated_at(remote)
}

/// Normalized logical write time.
///
/// The local store keeps RFC 3339 text while the remote service may answer
/// with its own timestamp rendering; both are reduced to epoch milliseconds
/// when parsable. Unparsable values are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Timestamp {
    Millis(i64),
    Raw(String),
}

impl Timestamp {
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Number(number) => number
                .as_i64()
                // f64 epoch values are truncated to whole milliseconds
                .or_else(|| number.as_f64().map(|value| value as i64))
                .map(Self::Millis),
            Value::String(text) => Some(Self::parse(text)),
            other => Some(Self::Raw(other.to_string())),
        }
    }

    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
            return Self::Millis(parsed.timestamp_millis());
        }
        // Postgres renders `2024-01-01 10:00:00+00`
        if let Ok(parsed) = DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z") {
            return Self::Millis(parsed.timestamp_millis());
        }
        for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
            if let Ok(parsed) = NaiveDateTime::parse_from_str(text, format) {
                return Self::Millis(parsed.and_utc().timestamp_millis());
            }
        }
        if let Ok(millis) = text.parse::<i64>() {
            return Self::Millis(millis);
        }
        Self::Raw(text.to_string())
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Millis(left), Self::Millis(right)) => Some(left.cmp(right)),
            (Self::Raw(left), Self::Raw(right)) => Some(left.cmp(right)),
            _ => None,
        }
    }
}
