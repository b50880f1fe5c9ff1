//! Pure translation from the vendor JSON shape to internal entities.
//!
//! Nothing in here touches the network or the database; processors hand in
//! a raw record map and get typed entities (or a `MappingError`) back.

mod listing;
mod media;
mod records;

pub use listing::{map_listing, strip_expanded, MappedListing};
pub use media::{map_media, media_object_key, signed_url_expires_at, url_is_expired};
pub use records::{map_lookup, map_member, map_office, map_open_house, MappedMember, MappedOffice};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

/// A record that cannot be translated. The cycle driver logs and skips it.
#[derive(Debug, Error)]
pub enum MappingError {
    #[error("record is missing required field '{0}'")]
    MissingField(&'static str),

    #[error("field '{field}' holds unparseable timestamp '{value}'")]
    BadTimestamp { field: &'static str, value: String },
}

/// True when a JSON attribute name is vendor-local: a 2-3 letter uppercase
/// prefix followed by an underscore (`ABC_InternalFlag`).
pub fn is_vendor_local_key(name: &str) -> bool {
    match name.split_once('_') {
        Some((prefix, rest)) if !rest.is_empty() => {
            (2..=3).contains(&prefix.len()) && prefix.bytes().all(|b| b.is_ascii_uppercase())
        }
        _ => false,
    }
}

/// Collect every vendor-local attribute of `record` into a side bag.
pub fn partition_local_fields(record: &Map<String, Value>) -> Map<String, Value> {
    record
        .iter()
        .filter(|(k, _)| is_vendor_local_key(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Strip the 2-3 letter uppercase system prefix off a vendor listing id.
pub fn listing_id_display(listing_id: &str) -> String {
    let prefix_len = listing_id
        .chars()
        .take_while(|c| c.is_ascii_uppercase())
        .count();
    if (2..=3).contains(&prefix_len) {
        listing_id[prefix_len..].to_string()
    } else {
        listing_id.to_string()
    }
}

/// Well-known-text spatial point, longitude first.
pub fn wkt_point(latitude: f64, longitude: f64) -> String {
    format!("SRID=4326;POINT({longitude} {latitude})")
}

pub(crate) fn get_str(record: &Map<String, Value>, key: &str) -> Option<String> {
    record
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

pub(crate) fn get_bool(record: &Map<String, Value>, key: &str) -> Option<bool> {
    record.get(key).and_then(Value::as_bool)
}

pub(crate) fn get_i32(record: &Map<String, Value>, key: &str) -> Option<i32> {
    record.get(key).and_then(Value::as_i64).map(|v| v as i32)
}

pub(crate) fn get_f64(record: &Map<String, Value>, key: &str) -> Option<f64> {
    record.get(key).and_then(Value::as_f64)
}

/// Money/measurement fields ride as decimal strings to preserve precision;
/// the feed may send them as JSON numbers or strings.
pub(crate) fn get_decimal(record: &Map<String, Value>, key: &str) -> Option<String> {
    match record.get(key) {
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

pub(crate) fn get_string_array(record: &Map<String, Value>, key: &str) -> Vec<String> {
    record
        .get(key)
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Parse an optional ISO-8601 timestamp; malformed values collapse to None.
pub(crate) fn get_ts(record: &Map<String, Value>, key: &str) -> Option<DateTime<Utc>> {
    record
        .get(key)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Parse a required timestamp; missing or malformed is a hard error.
pub(crate) fn require_ts(
    record: &Map<String, Value>,
    key: &'static str,
) -> Result<DateTime<Utc>, MappingError> {
    let raw = record
        .get(key)
        .and_then(Value::as_str)
        .ok_or(MappingError::MissingField(key))?;
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| MappingError::BadTimestamp {
            field: key,
            value: raw.to_string(),
        })
}

pub(crate) fn require_str(
    record: &Map<String, Value>,
    key: &'static str,
) -> Result<String, MappingError> {
    get_str(record, key).ok_or(MappingError::MissingField(key))
}
