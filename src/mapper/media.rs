//! Media sub-document mapping and signed-URL inspection.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::model::{MediaAsset, MediaStatus, ResourceKind};

use super::{get_i32, get_str, get_ts};

/// Safety buffer: a URL expiring within the next minute is already dead by
/// the time the download would start.
const EXPIRY_BUFFER_SECS: i64 = 60;

/// File extension for a media content type. Unknown types fall back to a
/// generic binary extension rather than failing the upload.
fn extension_for(content_type: &str) -> &'static str {
    match content_type.split(';').next().unwrap_or("").trim() {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "application/pdf" => "pdf",
        "video/mp4" => "mp4",
        _ => "bin",
    }
}

/// Deterministic object-store key for a media asset:
/// `{resourceType}/{parentKey}/{mediaKey}.{ext}`.
pub fn media_object_key(
    resource: ResourceKind,
    parent_key: &str,
    media_key: &str,
    content_type: &str,
) -> String {
    format!(
        "{}/{}/{}.{}",
        resource.storage_prefix(),
        parent_key,
        media_key,
        extension_for(content_type)
    )
}

/// Extract the `expires=<unix-seconds>` query parameter from a signed URL.
pub fn signed_url_expires_at(url: &str) -> Option<i64> {
    let query = url.split_once('?')?.1;
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("expires="))
        .and_then(|v| v.parse::<i64>().ok())
}

/// True when the URL's signature is expired (or will be within the 60 s
/// buffer). URLs without an `expires=` parameter are assumed usable.
pub fn url_is_expired(url: &str, now: DateTime<Utc>) -> bool {
    match signed_url_expires_at(url) {
        Some(expires) => expires <= now.timestamp() + EXPIRY_BUFFER_SECS,
        None => false,
    }
}

/// Map the expanded `Media` array of a parent record into asset rows,
/// all starting at `pending_download`.
pub fn map_media(
    resource: ResourceKind,
    parent_key: &str,
    media: &[Value],
) -> Vec<MediaAsset> {
    media
        .iter()
        .enumerate()
        .filter_map(|(position, value)| {
            let doc = value.as_object()?;
            let media_key = get_str(doc, "MediaKey")?;
            Some(MediaAsset {
                media_key,
                resource_kind: resource,
                parent_key: parent_key.to_string(),
                source_url: get_str(doc, "MediaURL"),
                media_mod_ts: get_ts(doc, "MediaModificationTimestamp"),
                object_key: None,
                public_url: None,
                // Feed order wins; array position is the fallback.
                display_order: get_i32(doc, "Order").unwrap_or(position as i32),
                category: get_str(doc, "MediaCategory"),
                file_size_bytes: None,
                content_type: get_str(doc, "MimeType"),
                status: MediaStatus::PendingDownload,
                retry_count: 0,
                updated_at: Utc::now(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_object_key_shape() {
        assert_eq!(
            media_object_key(ResourceKind::Listing, "K1", "M1", "image/jpeg"),
            "property/K1/M1.jpg"
        );
        assert_eq!(
            media_object_key(ResourceKind::Member, "MK2", "M9", "image/png"),
            "member/MK2/M9.png"
        );
    }

    #[test]
    fn test_extension_fallback() {
        assert_eq!(
            media_object_key(ResourceKind::Listing, "K", "M", "application/x-thing"),
            "property/K/M.bin"
        );
        // Parameters after the media type are ignored.
        assert_eq!(
            media_object_key(ResourceKind::Listing, "K", "M", "image/jpeg; charset=binary"),
            "property/K/M.jpg"
        );
    }

    #[test]
    fn test_expires_extraction() {
        let url = "https://cdn.example.test/p/x.jpg?sig=abc&expires=1700000000";
        assert_eq!(signed_url_expires_at(url), Some(1_700_000_000));
        assert_eq!(signed_url_expires_at("https://cdn.example.test/x.jpg"), None);
        assert_eq!(
            signed_url_expires_at("https://cdn.example.test/x.jpg?expires=soon"),
            None
        );
    }

    #[test]
    fn test_url_expiry_buffer() {
        let now = Utc::now();
        let in_30s = format!(
            "https://cdn.example.test/x.jpg?expires={}",
            now.timestamp() + 30
        );
        let in_2h = format!(
            "https://cdn.example.test/x.jpg?expires={}",
            now.timestamp() + 7200
        );
        // 30 s out is inside the 60 s buffer: already expired.
        assert!(url_is_expired(&in_30s, now));
        assert!(!url_is_expired(&in_2h, now));
        assert!(!url_is_expired("https://cdn.example.test/x.jpg", now));
    }

    #[test]
    fn test_map_media_defaults_order_to_position() {
        let media = vec![
            json!({ "MediaKey": "M1", "MediaURL": "https://cdn/a.jpg", "Order": 5 }),
            json!({ "MediaKey": "M2", "MediaURL": "https://cdn/b.jpg" }),
        ];
        let assets = map_media(ResourceKind::Listing, "K1", &media);
        assert_eq!(assets.len(), 2);
        assert_eq!(assets[0].display_order, 5);
        assert_eq!(assets[1].display_order, 1);
        assert_eq!(assets[0].status, MediaStatus::PendingDownload);
        assert_eq!(assets[1].parent_key, "K1");
    }

    #[test]
    fn test_map_media_skips_keyless_documents() {
        let media = vec![json!({ "MediaURL": "https://cdn/a.jpg" })];
        assert!(map_media(ResourceKind::Listing, "K1", &media).is_empty());
    }
}
