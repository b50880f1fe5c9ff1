//! Member, office, open-house and lookup entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An agent record. Members own media (headshots) like listings own photos.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub member_key: String,
    pub member_mls_id: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub office_key: Option<String>,
    pub state_license: Option<String>,
    pub can_view: bool,
    pub hidden_at: Option<DateTime<Utc>>,
    pub modification_ts: DateTime<Utc>,
    pub photos_change_ts: Option<DateTime<Utc>>,
    pub local_fields: Map<String, Value>,
}

/// A brokerage office record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Office {
    pub office_key: String,
    pub office_mls_id: Option<String>,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state_or_province: Option<String>,
    pub postal_code: Option<String>,
    pub can_view: bool,
    pub hidden_at: Option<DateTime<Utc>>,
    pub modification_ts: DateTime<Utc>,
    pub photos_change_ts: Option<DateTime<Utc>>,
    pub local_fields: Map<String, Value>,
}

/// A scheduled open-house event.
///
/// References its listing by listing id, not listing key; the parent may
/// not have been replicated yet, so no FK is enforced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenHouse {
    pub open_house_key: String,
    pub listing_id: String,
    pub start_ts: Option<DateTime<Utc>>,
    pub end_ts: Option<DateTime<Utc>>,
    pub remarks: Option<String>,
    pub status: Option<String>,
    pub modification_ts: DateTime<Utc>,
}

/// One enumerated domain value, keyed by (vendor system, lookup name).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupValue {
    pub lookup_key: String,
    pub vendor_system: String,
    pub lookup_name: String,
    pub lookup_value: Option<String>,
    pub standard_lookup_value: Option<String>,
    pub modification_ts: DateTime<Utc>,
}
