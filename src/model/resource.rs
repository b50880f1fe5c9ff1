//! Replicated resource kinds and their feed-side parameters.

use serde::{Deserialize, Serialize};

/// A resource kind replicated from the remote feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Listing,
    Member,
    Office,
    OpenHouse,
    Lookup,
}

impl ResourceKind {
    /// All kinds in scheduling order (listing first; it is the FK parent).
    pub const ALL: [ResourceKind; 5] = [
        ResourceKind::Listing,
        ResourceKind::Member,
        ResourceKind::Office,
        ResourceKind::OpenHouse,
        ResourceKind::Lookup,
    ];

    /// Resource name as it appears in feed URLs.
    pub fn api_resource(&self) -> &'static str {
        match self {
            ResourceKind::Listing => "Property",
            ResourceKind::Member => "Member",
            ResourceKind::Office => "Office",
            ResourceKind::OpenHouse => "OpenHouse",
            ResourceKind::Lookup => "Lookup",
        }
    }

    /// `$expand` parameter for this resource, if any.
    pub fn expand(&self) -> Option<&'static str> {
        match self {
            ResourceKind::Listing => Some("Media,Rooms,UnitTypes"),
            ResourceKind::Member | ResourceKind::Office => Some("Media"),
            ResourceKind::OpenHouse | ResourceKind::Lookup => None,
        }
    }

    /// Page size: 1000 when expanding sub-resources, 5000 otherwise.
    pub fn page_size(&self) -> u32 {
        if self.expand().is_some() {
            1000
        } else {
            5000
        }
    }

    /// Prefix used for object-store keys owned by this resource.
    pub fn storage_prefix(&self) -> &'static str {
        match self {
            ResourceKind::Listing => "property",
            ResourceKind::Member => "member",
            ResourceKind::Office => "office",
            ResourceKind::OpenHouse => "openhouse",
            ResourceKind::Lookup => "lookup",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Listing => "listing",
            ResourceKind::Member => "member",
            ResourceKind::Office => "office",
            ResourceKind::OpenHouse => "open_house",
            ResourceKind::Lookup => "lookup",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "listing" => Some(ResourceKind::Listing),
            "member" => Some(ResourceKind::Member),
            "office" => Some(ResourceKind::Office),
            "open_house" => Some(ResourceKind::OpenHouse),
            "lookup" => Some(ResourceKind::Lookup),
            _ => None,
        }
    }

    /// True for resources that own media assets.
    pub fn owns_media(&self) -> bool {
        matches!(
            self,
            ResourceKind::Listing | ResourceKind::Member | ResourceKind::Office
        )
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
