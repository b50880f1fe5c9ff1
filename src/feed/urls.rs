//! Feed URL construction.
//!
//! The query grammar is OData-ish: `$filter`, `$expand`, `$top`. Spaces and
//! quotes inside the filter are percent-encoded by the URL parser at request
//! time; these builders keep the readable form.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::model::ResourceKind;

/// Comparison operator for the replication timestamp filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TsOp {
    /// Strictly greater: the normal replication lower bound.
    Gt,
    /// Greater or equal: resume-safe; pairs with the dedup-on-resume set.
    Ge,
}

impl TsOp {
    fn as_str(&self) -> &'static str {
        match self {
            TsOp::Gt => "gt",
            TsOp::Ge => "ge",
        }
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn append_common(url: &mut String, resource: ResourceKind) {
    if let Some(expand) = resource.expand() {
        url.push_str("&$expand=");
        url.push_str(expand);
    }
    url.push_str(&format!("&$top={}", resource.page_size()));
}

/// URL for an initial import: only currently-visible records.
pub fn build_initial_url(base: &str, resource: ResourceKind, vendor: &str) -> String {
    let mut url = format!(
        "{}/{}?$filter=OriginatingSystemName eq '{}' and MlgCanView eq true",
        base.trim_end_matches('/'),
        resource.api_resource(),
        vendor,
    );
    append_common(&mut url, resource);
    url
}

/// URL for a replication cycle from a high-water mark.
pub fn build_replication_url(
    base: &str,
    resource: ResourceKind,
    vendor: &str,
    hwm: DateTime<Utc>,
    op: TsOp,
) -> String {
    let mut url = format!(
        "{}/{}?$filter=OriginatingSystemName eq '{}' and ModificationTimestamp {} '{}'",
        base.trim_end_matches('/'),
        resource.api_resource(),
        vendor,
        op.as_str(),
        format_ts(hwm),
    );
    append_common(&mut url, resource);
    url
}

/// URL fetching a single record, expanded, for fresh media URLs.
pub fn build_single_record_url(base: &str, resource: ResourceKind, vendor: &str, id: &str) -> String {
    let id_field = match resource {
        ResourceKind::Listing => "ListingId",
        ResourceKind::Member => "MemberKey",
        ResourceKind::Office => "OfficeKey",
        ResourceKind::OpenHouse => "OpenHouseKey",
        ResourceKind::Lookup => "LookupKey",
    };
    let mut url = format!(
        "{}/{}?$filter=OriginatingSystemName eq '{}' and {} eq '{}'",
        base.trim_end_matches('/'),
        resource.api_resource(),
        vendor,
        id_field,
        id,
    );
    if let Some(expand) = resource.expand() {
        url.push_str("&$expand=");
        url.push_str(expand);
    }
    url.push_str("&$top=1");
    url
}
