//! Expired-URL recovery sweep.
//!
//! Three escalation levels: rows whose bytes are already stored
//! flip straight to `complete`; rows with a still-valid source URL download
//! directly; everything else groups by parent and refetches the parent
//! record once per group for fresh URLs.

use std::collections::HashMap;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, warn};

use crate::mapper::url_is_expired;
use crate::model::{MediaAsset, MediaStatus, ResourceKind};

use super::{ItemOutcome, MediaDownloader};

/// Counters for one recovery sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Flipped to complete without any network traffic.
    pub restored: u64,
    /// Downloaded via a still-valid stored URL.
    pub direct_downloads: u64,
    /// Downloaded after refetching the parent for a fresh URL.
    pub refreshed_downloads: u64,
    /// Rows the sweep could not help this round.
    pub unrecovered: u64,
}

impl RecoveryStats {
    pub fn total(&self) -> u64 {
        self.restored + self.direct_downloads + self.refreshed_downloads + self.unrecovered
    }
}

impl MediaDownloader {
    /// One recovery sweep over every `failed`/`expired` row.
    pub async fn recover_once(&self) -> Result<RecoveryStats> {
        let mut stats = RecoveryStats::default();
        let rows = self.store.recoverable_media().await?;
        if rows.is_empty() {
            return Ok(stats);
        }
        debug!("Recovery sweep over {} media rows", rows.len());

        let now = Utc::now();
        let mut needs_refetch: HashMap<String, Vec<MediaAsset>> = HashMap::new();

        for row in rows {
            // Level 1: bytes already uploaded; the row just lost its way.
            if row.has_stored_object() {
                self.store
                    .set_media_status(&row.media_key, MediaStatus::Complete)
                    .await?;
                stats.restored += 1;
                continue;
            }

            // Level 2: the stored URL still has life in it.
            if let Some(url) = row.source_url.clone().filter(|u| !url_is_expired(u, now)) {
                match self.download_and_store(&row, &url).await? {
                    ItemOutcome::Completed { .. } => {
                        stats.direct_downloads += 1;
                        continue;
                    }
                    ItemOutcome::RateLimited => {
                        // Whole-downloader pause is on; stop the sweep early.
                        stats.unrecovered += 1;
                        continue;
                    }
                    _ => {} // fall through to refetch
                }
            }

            // Level 3: needs a fresh URL from the feed.
            needs_refetch.entry(row.parent_key.clone()).or_default().push(row);
        }

        for (parent_key, rows) in needs_refetch {
            let resource = rows[0].resource_kind;
            let refetch_id = match resource {
                ResourceKind::Listing => match self.store.get_listing_id(&parent_key).await? {
                    Some(id) => id,
                    None => {
                        // Parent purged; these rows are orphans.
                        stats.unrecovered += rows.len() as u64;
                        continue;
                    }
                },
                _ => parent_key.clone(),
            };

            let fresh = match self.feed.fetch_single(resource, &refetch_id, None).await {
                Ok(Some(record)) => record
                    .get("Media")
                    .and_then(serde_json::Value::as_array)
                    .map(|media| {
                        media
                            .iter()
                            .filter_map(|doc| {
                                let doc = doc.as_object()?;
                                Some((
                                    doc.get("MediaKey")?.as_str()?.to_string(),
                                    doc.get("MediaURL")?.as_str()?.to_string(),
                                ))
                            })
                            .collect::<HashMap<_, _>>()
                    })
                    .unwrap_or_default(),
                Ok(None) => {
                    warn!("Recovery refetch for {refetch_id} returned no record");
                    stats.unrecovered += rows.len() as u64;
                    continue;
                }
                Err(e) => {
                    warn!("Recovery refetch for {refetch_id} failed: {e}");
                    stats.unrecovered += rows.len() as u64;
                    continue;
                }
            };

            for row in rows {
                let Some(url) = fresh.get(&row.media_key) else {
                    // The feed no longer lists this asset.
                    stats.unrecovered += 1;
                    continue;
                };
                self.store
                    .update_media_source_url(&row.media_key, url)
                    .await?;
                match self.download_and_store(&row, url).await? {
                    ItemOutcome::Completed { .. } => stats.refreshed_downloads += 1,
                    _ => stats.unrecovered += 1,
                }
            }
        }

        Ok(stats)
    }
}
