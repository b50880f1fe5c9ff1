//! Listing record mapping and the stripped raw-archive companion.

use serde_json::{Map, Value};

use crate::model::{Listing, MediaAsset, ResourceKind, Room, UnitType};

use super::{
    get_bool, get_decimal, get_f64, get_i32, get_str, get_string_array, get_ts, listing_id_display,
    map_media, partition_local_fields, require_str, require_ts, wkt_point, MappingError,
};

/// Sub-resources returned inline under `$expand` and removed from the
/// archived raw payload.
const EXPANDED_KEYS: [&str; 3] = ["Media", "Rooms", "UnitTypes"];

/// A fully-mapped listing record: the entity plus its owned collections.
#[derive(Debug, Clone)]
pub struct MappedListing {
    pub listing: Listing,
    pub rooms: Vec<Room>,
    pub unit_types: Vec<UnitType>,
    pub media: Vec<MediaAsset>,
}

/// Translate one raw feed record into internal entities.
///
/// `ListingKey` and a parseable `ModificationTimestamp` are the only hard
/// requirements; everything else degrades to `None`.
pub fn map_listing(record: &Map<String, Value>) -> Result<MappedListing, MappingError> {
    let listing_key = require_str(record, "ListingKey")?;
    let listing_id = require_str(record, "ListingId")?;
    let modification_ts = require_ts(record, "ModificationTimestamp")?;

    let latitude = get_f64(record, "Latitude");
    let longitude = get_f64(record, "Longitude");
    let location_point = match (latitude, longitude) {
        (Some(lat), Some(lng)) => Some(wkt_point(lat, lng)),
        _ => None,
    };

    let listing = Listing {
        listing_id_display: listing_id_display(&listing_id),
        listing_key: listing_key.clone(),
        listing_id,
        originating_system: get_str(record, "OriginatingSystemName").unwrap_or_default(),

        list_price: get_decimal(record, "ListPrice"),
        original_list_price: get_decimal(record, "OriginalListPrice"),
        previous_list_price: get_decimal(record, "PreviousListPrice"),
        close_price: get_decimal(record, "ClosePrice"),

        standard_status: get_str(record, "StandardStatus"),
        mls_status: get_str(record, "MlsStatus"),
        major_change_type: get_str(record, "MajorChangeType"),

        property_type: get_str(record, "PropertyType"),
        property_sub_type: get_str(record, "PropertySubType"),
        bedrooms_total: get_i32(record, "BedroomsTotal"),
        bathrooms_total: get_decimal(record, "BathroomsTotalDecimal"),
        living_area: get_decimal(record, "LivingArea"),
        lot_size_acres: get_decimal(record, "LotSizeAcres"),
        year_built: get_i32(record, "YearBuilt"),
        stories: get_i32(record, "StoriesTotal"),
        garage_spaces: get_decimal(record, "GarageSpaces"),

        unparsed_address: get_str(record, "UnparsedAddress"),
        street_number: get_str(record, "StreetNumber"),
        street_name: get_str(record, "StreetName"),
        city: get_str(record, "City"),
        state_or_province: get_str(record, "StateOrProvince"),
        postal_code: get_str(record, "PostalCode"),
        county: get_str(record, "CountyOrParish"),
        subdivision_name: get_str(record, "SubdivisionName"),
        latitude,
        longitude,
        location_point,

        list_agent_key: get_str(record, "ListAgentKey"),
        list_agent_mls_id: get_str(record, "ListAgentMlsId"),
        list_office_key: get_str(record, "ListOfficeKey"),
        list_office_mls_id: get_str(record, "ListOfficeMlsId"),
        buyer_agent_mls_id: get_str(record, "BuyerAgentMlsId"),
        buyer_office_mls_id: get_str(record, "BuyerOfficeMlsId"),

        public_remarks: get_str(record, "PublicRemarks"),
        syndication_remarks: get_str(record, "SyndicationRemarks"),

        elementary_school: get_str(record, "ElementarySchool"),
        middle_school: get_str(record, "MiddleOrJuniorSchool"),
        high_school: get_str(record, "HighSchool"),
        school_district: get_str(record, "HighSchoolDistrict"),

        tax_annual_amount: get_decimal(record, "TaxAnnualAmount"),
        tax_year: get_i32(record, "TaxYear"),
        parcel_number: get_str(record, "ParcelNumber"),

        buyer_agency_compensation: get_decimal(record, "BuyerAgencyCompensation"),
        buyer_agency_compensation_type: get_str(record, "BuyerAgencyCompensationType"),

        can_view: get_bool(record, "MlgCanView").unwrap_or(true),
        use_cases: get_string_array(record, "MlgCanUse"),
        hidden_at: None,

        photos_count: get_i32(record, "PhotosCount"),

        modification_ts,
        originating_mod_ts: get_ts(record, "OriginatingSystemModificationTimestamp"),
        photos_change_ts: get_ts(record, "PhotosChangeTimestamp"),
        major_change_ts: get_ts(record, "MajorChangeTimestamp"),
        original_entry_ts: get_ts(record, "OriginalEntryTimestamp"),

        local_fields: partition_local_fields(record),
    };

    let rooms = record
        .get("Rooms")
        .and_then(Value::as_array)
        .map(|arr| map_rooms(&listing_key, arr))
        .unwrap_or_default();
    let unit_types = record
        .get("UnitTypes")
        .and_then(Value::as_array)
        .map(|arr| map_unit_types(&listing_key, arr))
        .unwrap_or_default();
    let media = record
        .get("Media")
        .and_then(Value::as_array)
        .map(|arr| map_media(ResourceKind::Listing, &listing_key, arr))
        .unwrap_or_default();

    Ok(MappedListing {
        listing,
        rooms,
        unit_types,
        media,
    })
}

fn map_rooms(listing_key: &str, rooms: &[Value]) -> Vec<Room> {
    rooms
        .iter()
        .filter_map(|value| {
            let doc = value.as_object()?;
            Some(Room {
                room_key: get_str(doc, "RoomKey")?,
                listing_key: listing_key.to_string(),
                room_type: get_str(doc, "RoomType"),
                room_level: get_str(doc, "RoomLevel"),
                room_dimensions: get_str(doc, "RoomDimensions"),
                room_area: get_decimal(doc, "RoomArea"),
                room_features: get_string_array(doc, "RoomFeatures"),
            })
        })
        .collect()
}

fn map_unit_types(listing_key: &str, unit_types: &[Value]) -> Vec<UnitType> {
    unit_types
        .iter()
        .filter_map(|value| {
            let doc = value.as_object()?;
            Some(UnitType {
                unit_type_key: get_str(doc, "UnitTypeKey")?,
                listing_key: listing_key.to_string(),
                unit_type: get_str(doc, "UnitTypeType"),
                beds_total: get_i32(doc, "UnitTypeBedsTotal"),
                baths_total: get_decimal(doc, "UnitTypeBathsTotal"),
                units_total: get_i32(doc, "UnitTypeUnitsTotal"),
                actual_rent: get_decimal(doc, "UnitTypeActualRent"),
            })
        })
        .collect()
}

/// The raw-archive companion: the input JSON minus expanded sub-resources.
pub fn strip_expanded(record: &Map<String, Value>) -> Value {
    let mut stripped = record.clone();
    for key in EXPANDED_KEYS {
        stripped.remove(key);
    }
    Value::Object(stripped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn full_record() -> Map<String, Value> {
        json!({
            "ListingKey": "K100",
            "ListingId": "ABC55501",
            "OriginatingSystemName": "abc",
            "ModificationTimestamp": "2024-05-01T08:00:00.000Z",
            "PhotosChangeTimestamp": "2024-04-30T20:00:00.000Z",
            "ListPrice": 500000,
            "StandardStatus": "Active",
            "MlgCanView": true,
            "MlgCanUse": ["IDX", "VOW"],
            "Latitude": 44.9778,
            "Longitude": -93.2650,
            "LivingArea": "1850.5",
            "ABC_InternalZone": "R1",
            "Media": [
                { "MediaKey": "M1", "MediaURL": "https://cdn/a.jpg", "Order": 0 },
                { "MediaKey": "M2", "MediaURL": "https://cdn/b.jpg", "Order": 1 }
            ],
            "Rooms": [
                { "RoomKey": "R1", "RoomType": "Bedroom", "RoomLevel": "Upper" }
            ],
            "UnitTypes": []
        })
        .as_object()
        .unwrap()
        .clone()
    }

    #[test]
    fn test_map_listing_explicit_fields() {
        let mapped = map_listing(&full_record()).unwrap();
        let l = &mapped.listing;
        assert_eq!(l.listing_key, "K100");
        assert_eq!(l.listing_id, "ABC55501");
        assert_eq!(l.listing_id_display, "55501");
        assert_eq!(l.list_price.as_deref(), Some("500000"));
        assert_eq!(l.standard_status.as_deref(), Some("Active"));
        assert_eq!(l.use_cases, vec!["IDX", "VOW"]);
        assert!(l.can_view);
    }

    #[test]
    fn test_map_listing_spatial_point() {
        let mapped = map_listing(&full_record()).unwrap();
        assert_eq!(
            mapped.listing.location_point.as_deref(),
            Some("SRID=4326;POINT(-93.265 44.9778)")
        );

        let mut record = full_record();
        record.remove("Longitude");
        let mapped = map_listing(&record).unwrap();
        assert!(mapped.listing.location_point.is_none());
    }

    #[test]
    fn test_map_listing_relocates_vendor_locals() {
        let mapped = map_listing(&full_record()).unwrap();
        assert_eq!(
            mapped.listing.local_fields.get("ABC_InternalZone"),
            Some(&json!("R1"))
        );
    }

    #[test]
    fn test_map_listing_children() {
        let mapped = map_listing(&full_record()).unwrap();
        assert_eq!(mapped.media.len(), 2);
        assert_eq!(mapped.rooms.len(), 1);
        assert_eq!(mapped.rooms[0].listing_key, "K100");
        assert!(mapped.unit_types.is_empty());
    }

    #[test]
    fn test_map_listing_missing_modification_ts_is_hard_error() {
        let mut record = full_record();
        record.remove("ModificationTimestamp");
        assert!(matches!(
            map_listing(&record),
            Err(MappingError::MissingField("ModificationTimestamp"))
        ));
    }

    #[test]
    fn test_map_listing_malformed_modification_ts_is_hard_error() {
        let mut record = full_record();
        record.insert("ModificationTimestamp".into(), json!("05/01/2024"));
        assert!(matches!(
            map_listing(&record),
            Err(MappingError::BadTimestamp { .. })
        ));
    }

    #[test]
    fn test_strip_expanded_removes_only_subresources() {
        let record = full_record();
        let stripped = strip_expanded(&record);
        let obj = stripped.as_object().unwrap();
        assert!(!obj.contains_key("Media"));
        assert!(!obj.contains_key("Rooms"));
        assert!(!obj.contains_key("UnitTypes"));
        assert!(obj.contains_key("ListingKey"));
        assert!(obj.contains_key("ABC_InternalZone"));
    }

    #[test]
    fn test_strip_then_restore_equals_input() {
        let record = full_record();
        let stripped = strip_expanded(&record);
        let mut restored = stripped.as_object().unwrap().clone();
        for key in EXPANDED_KEYS {
            if let Some(v) = record.get(key) {
                restored.insert(key.to_string(), v.clone());
            }
        }
        assert_eq!(restored, record);
    }
}
