//! Media asset metadata and its download state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ResourceKind;

/// Download state of a media asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaStatus {
    PendingDownload,
    Complete,
    Failed,
    Expired,
}

impl MediaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaStatus::PendingDownload => "pending_download",
            MediaStatus::Complete => "complete",
            MediaStatus::Failed => "failed",
            MediaStatus::Expired => "expired",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending_download" => Some(MediaStatus::PendingDownload),
            "complete" => Some(MediaStatus::Complete),
            "failed" => Some(MediaStatus::Failed),
            "expired" => Some(MediaStatus::Expired),
            _ => None,
        }
    }

    /// States the background downloader will pick up again.
    pub fn needs_recovery(&self) -> bool {
        matches!(self, MediaStatus::Failed | MediaStatus::Expired)
    }
}

/// Metadata row for one media asset (photo, floor plan, document).
///
/// The source URL is a signed CDN URL and is never authoritative; once the
/// bytes are in the object store the row stays `Complete` even after the
/// URL expires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaAsset {
    /// Vendor media key (primary key).
    pub media_key: String,
    pub resource_kind: ResourceKind,
    /// Key of the owning listing/member/office.
    pub parent_key: String,
    /// Signed CDN URL. Expires roughly eleven hours after issue.
    pub source_url: Option<String>,
    pub media_mod_ts: Option<DateTime<Utc>>,
    /// Deterministic object-store key; set once the upload succeeds.
    pub object_key: Option<String>,
    pub public_url: Option<String>,
    pub display_order: i32,
    pub category: Option<String>,
    pub file_size_bytes: Option<i64>,
    pub content_type: Option<String>,
    pub status: MediaStatus,
    pub retry_count: i32,
    pub updated_at: DateTime<Utc>,
}

impl MediaAsset {
    /// True when the bytes are safely in the object store, regardless of
    /// what the source URL has since done.
    pub fn has_stored_object(&self) -> bool {
        self.object_key.as_deref().is_some_and(|k| !k.is_empty())
            && self.public_url.as_deref().is_some_and(|u| !u.is_empty())
            && self.file_size_bytes.is_some_and(|b| b > 0)
    }
}

/// Audit row written for every completed background download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaDownloadAudit {
    pub media_key: String,
    pub parent_key: String,
    pub bytes: u64,
    pub elapsed_ms: i64,
    pub downloaded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asset(status: MediaStatus) -> MediaAsset {
        MediaAsset {
            media_key: "M1".into(),
            resource_kind: ResourceKind::Listing,
            parent_key: "K1".into(),
            source_url: None,
            media_mod_ts: None,
            object_key: None,
            public_url: None,
            display_order: 0,
            category: None,
            file_size_bytes: None,
            content_type: None,
            status,
            retry_count: 0,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            MediaStatus::PendingDownload,
            MediaStatus::Complete,
            MediaStatus::Failed,
            MediaStatus::Expired,
        ] {
            assert_eq!(MediaStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(MediaStatus::from_str("nope"), None);
    }

    #[test]
    fn test_needs_recovery() {
        assert!(MediaStatus::Failed.needs_recovery());
        assert!(MediaStatus::Expired.needs_recovery());
        assert!(!MediaStatus::PendingDownload.needs_recovery());
        assert!(!MediaStatus::Complete.needs_recovery());
    }

    #[test]
    fn test_has_stored_object_requires_all_three() {
        let mut m = asset(MediaStatus::Complete);
        assert!(!m.has_stored_object());

        m.object_key = Some("property/K1/M1.jpg".into());
        m.public_url = Some("https://cdn.example.com/property/K1/M1.jpg".into());
        assert!(!m.has_stored_object());

        m.file_size_bytes = Some(0);
        assert!(!m.has_stored_object());

        m.file_size_bytes = Some(1024);
        assert!(m.has_stored_object());
    }

    #[test]
    fn test_empty_key_does_not_count_as_stored() {
        let mut m = asset(MediaStatus::Complete);
        m.object_key = Some(String::new());
        m.public_url = Some("https://cdn.example.com/x.jpg".into());
        m.file_size_bytes = Some(10);
        assert!(!m.has_stored_object());
    }
}
