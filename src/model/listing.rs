//! Listing entity and its owned child collections.
//!
//! Money and measurement fields are kept as decimal strings end to end so
//! precision survives the round trip into the database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A mirrored property listing.
///
/// Primary key is the opaque vendor `listing_key`; `listing_id` is the
/// prefixed human-facing identifier and is unique as well.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub listing_key: String,
    /// Vendor listing id including its 2-3 letter system prefix.
    pub listing_id: String,
    /// `listing_id` with the system prefix stripped, for display.
    pub listing_id_display: String,
    pub originating_system: String,

    // Pricing
    pub list_price: Option<String>,
    pub original_list_price: Option<String>,
    pub previous_list_price: Option<String>,
    pub close_price: Option<String>,

    // Status
    pub standard_status: Option<String>,
    /// Vendor-specific status, finer grained than `standard_status`.
    pub mls_status: Option<String>,
    /// Vendor's classification of the most recent major change, when sent.
    pub major_change_type: Option<String>,

    // Physical attributes
    pub property_type: Option<String>,
    pub property_sub_type: Option<String>,
    pub bedrooms_total: Option<i32>,
    pub bathrooms_total: Option<String>,
    pub living_area: Option<String>,
    pub lot_size_acres: Option<String>,
    pub year_built: Option<i32>,
    pub stories: Option<i32>,
    pub garage_spaces: Option<String>,

    // Geography
    pub unparsed_address: Option<String>,
    pub street_number: Option<String>,
    pub street_name: Option<String>,
    pub city: Option<String>,
    pub state_or_province: Option<String>,
    pub postal_code: Option<String>,
    pub county: Option<String>,
    pub subdivision_name: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// `SRID=4326;POINT(lng lat)` when both coordinates are present.
    pub location_point: Option<String>,

    // Parties
    pub list_agent_key: Option<String>,
    pub list_agent_mls_id: Option<String>,
    pub list_office_key: Option<String>,
    pub list_office_mls_id: Option<String>,
    pub buyer_agent_mls_id: Option<String>,
    pub buyer_office_mls_id: Option<String>,

    // Remarks
    pub public_remarks: Option<String>,
    pub syndication_remarks: Option<String>,

    // Schools
    pub elementary_school: Option<String>,
    pub middle_school: Option<String>,
    pub high_school: Option<String>,
    pub school_district: Option<String>,

    // Tax
    pub tax_annual_amount: Option<String>,
    pub tax_year: Option<i32>,
    pub parcel_number: Option<String>,

    // Compensation
    pub buyer_agency_compensation: Option<String>,
    pub buyer_agency_compensation_type: Option<String>,

    // Visibility
    pub can_view: bool,
    pub use_cases: Vec<String>,
    /// Set when the record was soft-hidden; drives the 30-day purge.
    pub hidden_at: Option<DateTime<Utc>>,

    pub photos_count: Option<i32>,

    // Timestamps
    pub modification_ts: DateTime<Utc>,
    pub originating_mod_ts: Option<DateTime<Utc>>,
    pub photos_change_ts: Option<DateTime<Utc>>,
    pub major_change_ts: Option<DateTime<Utc>>,
    pub original_entry_ts: Option<DateTime<Utc>>,

    /// Vendor-local attributes (2-3 letter uppercase prefix + underscore),
    /// relocated here instead of occupying columns.
    pub local_fields: Map<String, Value>,
}

/// A room belonging to a listing. The whole set is replaced on every upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub room_key: String,
    pub listing_key: String,
    pub room_type: Option<String>,
    pub room_level: Option<String>,
    pub room_dimensions: Option<String>,
    pub room_area: Option<String>,
    pub room_features: Vec<String>,
}

/// A unit-type row for multi-unit listings. Replaced wholesale like rooms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitType {
    pub unit_type_key: String,
    pub listing_key: String,
    pub unit_type: Option<String>,
    pub beds_total: Option<i32>,
    pub baths_total: Option<String>,
    pub units_total: Option<i32>,
    pub actual_rent: Option<String>,
}
