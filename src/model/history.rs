//! Append-only history rows emitted by the diff step.
//!
//! Rows are only written in replication mode and only for watched fields;
//! initial import never emits history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A list-price transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceChange {
    pub listing_key: String,
    pub old_price: Option<String>,
    pub new_price: Option<String>,
    /// "Price Increase" / "Price Decrease", or the vendor's own
    /// `MajorChangeType` when it accompanied the delta.
    pub change_type: String,
    pub recorded_at: DateTime<Utc>,
}

/// A standard-status transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub listing_key: String,
    pub old_status: Option<String>,
    pub new_status: String,
    pub recorded_at: DateTime<Utc>,
}

/// A generic watched-field transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub listing_key: String,
    pub field_name: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub recorded_at: DateTime<Utc>,
}
