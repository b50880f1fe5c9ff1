//! Mapping for member, office, open-house and lookup records.

use serde_json::{Map, Value};

use crate::model::{LookupValue, MediaAsset, Member, Office, OpenHouse, ResourceKind};

use super::{
    get_bool, get_str, get_ts, map_media, partition_local_fields, require_str, require_ts,
    MappingError,
};

/// A mapped member plus their media (headshots).
#[derive(Debug, Clone)]
pub struct MappedMember {
    pub member: Member,
    pub media: Vec<MediaAsset>,
}

/// A mapped office plus its media (logos).
#[derive(Debug, Clone)]
pub struct MappedOffice {
    pub office: Office,
    pub media: Vec<MediaAsset>,
}

pub fn map_member(record: &Map<String, Value>) -> Result<MappedMember, MappingError> {
    let member_key = require_str(record, "MemberKey")?;
    let member = Member {
        member_key: member_key.clone(),
        member_mls_id: get_str(record, "MemberMlsId"),
        first_name: get_str(record, "MemberFirstName"),
        last_name: get_str(record, "MemberLastName"),
        full_name: get_str(record, "MemberFullName"),
        email: get_str(record, "MemberEmail"),
        phone: get_str(record, "MemberPreferredPhone"),
        office_key: get_str(record, "OfficeKey"),
        state_license: get_str(record, "MemberStateLicense"),
        can_view: get_bool(record, "MlgCanView").unwrap_or(true),
        hidden_at: None,
        modification_ts: require_ts(record, "ModificationTimestamp")?,
        photos_change_ts: get_ts(record, "PhotosChangeTimestamp"),
        local_fields: partition_local_fields(record),
    };
    let media = record
        .get("Media")
        .and_then(Value::as_array)
        .map(|arr| map_media(ResourceKind::Member, &member_key, arr))
        .unwrap_or_default();
    Ok(MappedMember { member, media })
}

pub fn map_office(record: &Map<String, Value>) -> Result<MappedOffice, MappingError> {
    let office_key = require_str(record, "OfficeKey")?;
    let office = Office {
        office_key: office_key.clone(),
        office_mls_id: get_str(record, "OfficeMlsId"),
        name: get_str(record, "OfficeName"),
        phone: get_str(record, "OfficePhone"),
        email: get_str(record, "OfficeEmail"),
        address: get_str(record, "OfficeAddress1"),
        city: get_str(record, "OfficeCity"),
        state_or_province: get_str(record, "OfficeStateOrProvince"),
        postal_code: get_str(record, "OfficePostalCode"),
        can_view: get_bool(record, "MlgCanView").unwrap_or(true),
        hidden_at: None,
        modification_ts: require_ts(record, "ModificationTimestamp")?,
        photos_change_ts: get_ts(record, "PhotosChangeTimestamp"),
        local_fields: partition_local_fields(record),
    };
    let media = record
        .get("Media")
        .and_then(Value::as_array)
        .map(|arr| map_media(ResourceKind::Office, &office_key, arr))
        .unwrap_or_default();
    Ok(MappedOffice { office, media })
}

pub fn map_open_house(record: &Map<String, Value>) -> Result<OpenHouse, MappingError> {
    Ok(OpenHouse {
        open_house_key: require_str(record, "OpenHouseKey")?,
        listing_id: require_str(record, "ListingId")?,
        start_ts: get_ts(record, "OpenHouseStartTime"),
        end_ts: get_ts(record, "OpenHouseEndTime"),
        remarks: get_str(record, "OpenHouseRemarks"),
        status: get_str(record, "OpenHouseStatus"),
        modification_ts: require_ts(record, "ModificationTimestamp")?,
    })
}

pub fn map_lookup(record: &Map<String, Value>) -> Result<LookupValue, MappingError> {
    Ok(LookupValue {
        lookup_key: require_str(record, "LookupKey")?,
        vendor_system: get_str(record, "OriginatingSystemName").unwrap_or_default(),
        lookup_name: require_str(record, "LookupName")?,
        lookup_value: get_str(record, "LookupValue"),
        standard_lookup_value: get_str(record, "StandardLookupValue"),
        modification_ts: require_ts(record, "ModificationTimestamp")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_map_member_with_media() {
        let record = json!({
            "MemberKey": "MK1",
            "MemberMlsId": "AG500",
            "MemberFullName": "Pat Example",
            "ModificationTimestamp": "2024-05-01T00:00:00Z",
            "PhotosChangeTimestamp": "2024-04-01T00:00:00Z",
            "XYZ_Team": "North",
            "Media": [ { "MediaKey": "HM1", "MediaURL": "https://cdn/h.jpg" } ]
        });
        let mapped = map_member(record.as_object().unwrap()).unwrap();
        assert_eq!(mapped.member.member_key, "MK1");
        assert_eq!(mapped.member.full_name.as_deref(), Some("Pat Example"));
        assert!(mapped.member.local_fields.contains_key("XYZ_Team"));
        assert_eq!(mapped.media.len(), 1);
        assert_eq!(mapped.media[0].resource_kind, ResourceKind::Member);
        assert_eq!(mapped.media[0].parent_key, "MK1");
    }

    #[test]
    fn test_map_office_minimal() {
        let record = json!({
            "OfficeKey": "OK1",
            "OfficeName": "Example Realty",
            "ModificationTimestamp": "2024-05-01T00:00:00Z"
        });
        let mapped = map_office(record.as_object().unwrap()).unwrap();
        assert_eq!(mapped.office.office_key, "OK1");
        assert!(mapped.office.can_view);
        assert!(mapped.media.is_empty());
    }

    #[test]
    fn test_map_open_house_requires_listing_id() {
        let record = json!({
            "OpenHouseKey": "OH1",
            "ModificationTimestamp": "2024-05-01T00:00:00Z"
        });
        assert!(matches!(
            map_open_house(record.as_object().unwrap()),
            Err(MappingError::MissingField("ListingId"))
        ));
    }

    #[test]
    fn test_map_lookup() {
        let record = json!({
            "LookupKey": "L1",
            "OriginatingSystemName": "abc",
            "LookupName": "StandardStatus",
            "LookupValue": "Active Under Contract",
            "ModificationTimestamp": "2024-05-01T00:00:00Z"
        });
        let lookup = map_lookup(record.as_object().unwrap()).unwrap();
        assert_eq!(lookup.vendor_system, "abc");
        assert_eq!(lookup.lookup_name, "StandardStatus");
    }
}
