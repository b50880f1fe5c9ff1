//! Inline media refresh: runs inside listing/member/office processing when
//! the photo-change timestamp moved.
//!
//! Signed URLs age out in hours, so a page that sat in a long cycle can
//! arrive with dead URLs. The pre-flight check refetches the parent record
//! once for the whole batch instead of burning a download attempt per
//! asset.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use futures::future::join_all;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::feed::FeedError;
use crate::mapper::{media_object_key, url_is_expired};
use crate::model::{MediaAsset, MediaDownloadAudit, MediaStatus, ResourceKind};
use crate::object_store::public_url;

use super::PipelineDeps;

/// Attempts per asset before giving up inline.
const INLINE_MAX_ATTEMPTS: u32 = 3;
/// Base pause after a CDN 429; scales with the attempt number.
const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(30);
/// Pause after a transient transport error.
const TRANSIENT_BACKOFF: Duration = Duration::from_millis(500);

/// What one refresh did, folded into the run counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaRefreshStats {
    /// Rows left for the background downloader (expired URLs).
    pub queued: u64,
    /// Assets downloaded and uploaded inline.
    pub downloaded: u64,
    /// Stored assets removed because the feed no longer lists them.
    pub deleted: u64,
    pub bytes: u64,
}

impl MediaRefreshStats {
    fn absorb(&mut self, other: MediaRefreshStats) {
        self.queued += other.queued;
        self.downloaded += other.downloaded;
        self.deleted += other.deleted;
        self.bytes += other.bytes;
    }
}

/// One refresh invocation.
pub struct MediaRefreshRequest<'a> {
    pub resource: ResourceKind,
    pub parent_key: &'a str,
    /// Identifier used to refetch the parent for fresh URLs: the listing id
    /// for listings, the record key for members and offices.
    pub refetch_id: &'a str,
    pub incoming: &'a [MediaAsset],
    pub run_id: i64,
}

#[derive(Debug, PartialEq, Eq)]
enum Action {
    /// Unchanged content: update metadata columns only.
    SkipMetadataOnly,
    /// Bytes already uploaded; restore `complete` without a download.
    RestoreComplete,
    Download,
}

fn classify(incoming: &MediaAsset, stored: Option<&MediaAsset>) -> Action {
    match stored {
        Some(s) if s.status == MediaStatus::Complete && s.media_mod_ts == incoming.media_mod_ts => {
            Action::SkipMetadataOnly
        }
        Some(s) if s.has_stored_object() => Action::RestoreComplete,
        _ => Action::Download,
    }
}

/// Incoming metadata merged over the stored row's object facts.
fn merged(incoming: &MediaAsset, stored: &MediaAsset, status: MediaStatus) -> MediaAsset {
    MediaAsset {
        object_key: stored.object_key.clone(),
        public_url: stored.public_url.clone(),
        file_size_bytes: stored.file_size_bytes,
        content_type: incoming.content_type.clone().or_else(|| stored.content_type.clone()),
        retry_count: stored.retry_count,
        status,
        ..incoming.clone()
    }
}

/// Extract (media key -> URL) from a refetched parent record.
fn fresh_urls_from(record: &Map<String, Value>) -> HashMap<String, String> {
    record
        .get("Media")
        .and_then(Value::as_array)
        .map(|media| {
            media
                .iter()
                .filter_map(|doc| {
                    let doc = doc.as_object()?;
                    let key = doc.get("MediaKey")?.as_str()?;
                    let url = doc.get("MediaURL")?.as_str()?;
                    Some((key.to_string(), url.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Reconcile stored media with the incoming list and download what needs
/// downloading, in bounded concurrent batches.
pub async fn refresh_media(
    deps: &PipelineDeps,
    req: MediaRefreshRequest<'_>,
) -> Result<MediaRefreshStats> {
    let mut stats = MediaRefreshStats::default();
    let stored = deps.store.media_for_parent(req.parent_key).await?;
    let stored_by_key: HashMap<&str, &MediaAsset> =
        stored.iter().map(|m| (m.media_key.as_str(), m)).collect();
    let incoming_keys: HashSet<&str> = req.incoming.iter().map(|m| m.media_key.as_str()).collect();

    // Stored media absent from the feed is gone for good: object first,
    // then the row.
    for gone in stored.iter().filter(|m| !incoming_keys.contains(m.media_key.as_str())) {
        if let Some(object_key) = gone.object_key.as_deref().filter(|k| !k.is_empty()) {
            if let Err(e) = deps.objects.delete(object_key).await {
                warn!("Failed to delete object '{object_key}': {e:#}");
            }
        }
        deps.store.delete_media(&gone.media_key).await?;
        stats.deleted += 1;
    }

    let mut to_download = Vec::new();
    for incoming in req.incoming {
        match classify(incoming, stored_by_key.get(incoming.media_key.as_str()).copied()) {
            Action::SkipMetadataOnly => {
                let s = stored_by_key[incoming.media_key.as_str()];
                deps.store.upsert_media(&merged(incoming, s, s.status)).await?;
            }
            Action::RestoreComplete => {
                let s = stored_by_key[incoming.media_key.as_str()];
                deps.store
                    .upsert_media(&merged(incoming, s, MediaStatus::Complete))
                    .await?;
            }
            Action::Download => to_download.push(incoming.clone()),
        }
    }

    if to_download.is_empty() {
        return Ok(stats);
    }

    // Pre-flight: if the batch's URLs have already aged out, one refetch of
    // the parent replaces them all.
    let now = Utc::now();
    let mut fresh_urls = HashMap::new();
    let first_url = req.incoming.iter().find_map(|m| m.source_url.as_deref());
    if let Some(url) = first_url {
        if url_is_expired(url, now) {
            debug!(
                "Media URLs for {} expired, refetching for fresh ones",
                req.parent_key
            );
            match deps
                .feed
                .fetch_single(req.resource, req.refetch_id, Some(req.run_id))
                .await
            {
                Ok(Some(record)) => fresh_urls = fresh_urls_from(&record),
                Ok(None) => warn!("Refetch for {} returned no record", req.refetch_id),
                Err(e) => warn!("Refetch for fresh media URLs failed: {e}"),
            }
        }
    }

    for batch in to_download.chunks(deps.media.inline_concurrency.max(1)) {
        let downloads = batch.iter().map(|asset| download_one(deps, asset, &fresh_urls));
        for result in join_all(downloads).await {
            stats.absorb(result?);
        }
    }

    Ok(stats)
}

/// Download, upload and commit one asset. All terminal states go through
/// the store so the background downloader can pick up the leftovers.
async fn download_one(
    deps: &PipelineDeps,
    asset: &MediaAsset,
    fresh_urls: &HashMap<String, String>,
) -> Result<MediaRefreshStats> {
    let mut stats = MediaRefreshStats::default();
    let mut row = asset.clone();

    let url = fresh_urls
        .get(&asset.media_key)
        .cloned()
        .or_else(|| asset.source_url.clone());
    let Some(url) = url else {
        row.status = MediaStatus::Failed;
        deps.store.upsert_media(&row).await?;
        return Ok(stats);
    };
    row.source_url = Some(url.clone());

    if url_is_expired(&url, Utc::now()) {
        // Defer to background recovery rather than burning a request.
        row.status = MediaStatus::Expired;
        deps.store.upsert_media(&row).await?;
        stats.queued += 1;
        return Ok(stats);
    }

    for attempt in 0..INLINE_MAX_ATTEMPTS {
        match deps.feed.download_media(&url).await {
            Ok(download) => {
                let content_type = download.content_type.clone();
                let object_key = media_object_key(
                    asset.resource_kind,
                    &asset.parent_key,
                    &asset.media_key,
                    &content_type,
                );
                deps.objects
                    .put(&object_key, download.body, &content_type)
                    .await?;

                row.object_key = Some(object_key.clone());
                row.public_url = Some(public_url(&deps.public_domain, &object_key));
                row.file_size_bytes = Some(download.size as i64);
                row.content_type = Some(content_type);
                row.status = MediaStatus::Complete;
                deps.store.upsert_media(&row).await?;
                deps.store
                    .append_media_audit(&MediaDownloadAudit {
                        media_key: asset.media_key.clone(),
                        parent_key: asset.parent_key.clone(),
                        bytes: download.size,
                        elapsed_ms: 0,
                        downloaded_at: Utc::now(),
                    })
                    .await?;

                stats.downloaded += 1;
                stats.bytes += download.size;
                return Ok(stats);
            }
            Err(FeedError::RateLimited) => {
                let pause = RATE_LIMIT_BACKOFF * (attempt + 1);
                warn!(
                    "CDN rate limited downloading {}, attempt {}/{}, pausing {:?}",
                    asset.media_key,
                    attempt + 1,
                    INLINE_MAX_ATTEMPTS,
                    pause
                );
                tokio::time::sleep(pause).await;
            }
            Err(FeedError::UrlExpired { .. }) => {
                if asset.has_stored_object() {
                    // Old bytes are still good; keep serving them.
                    row.status = MediaStatus::Complete;
                } else {
                    row.status = MediaStatus::Expired;
                    stats.queued += 1;
                }
                deps.store.upsert_media(&row).await?;
                return Ok(stats);
            }
            Err(e) => {
                debug!(
                    "Transient error downloading {} (attempt {}/{}): {e}",
                    asset.media_key,
                    attempt + 1,
                    INLINE_MAX_ATTEMPTS
                );
                tokio::time::sleep(TRANSIENT_BACKOFF).await;
            }
        }
    }

    row.status = MediaStatus::Failed;
    deps.store.upsert_media(&row).await?;
    Ok(stats)
}
