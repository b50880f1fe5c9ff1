//! Process-wide scheduling: initial-import ordering, per-resource loops,
//! daily cleanup, and graceful shutdown.
//!
//! Every loop shares the rate limiter through the feed client, so pressure
//! on any one resource slows all of them together instead of starving the
//! remote.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{CadenceSettings, RetentionSettings};
use crate::limiter::RateLimiter;
use crate::media_worker::MediaDownloader;
use crate::model::ResourceKind;
use crate::object_store::ObjectStore;
use crate::replication::CycleDriver;
use crate::store::ReplicationStore;

/// Drain budget for in-flight cycles at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

pub struct Scheduler {
    store: Arc<dyn ReplicationStore>,
    objects: Arc<dyn ObjectStore>,
    driver: Arc<CycleDriver>,
    downloader: Arc<MediaDownloader>,
    limiter: Arc<RateLimiter>,
    cadence: CadenceSettings,
    retention: RetentionSettings,
    shutdown: CancellationToken,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn ReplicationStore>,
        objects: Arc<dyn ObjectStore>,
        driver: Arc<CycleDriver>,
        downloader: Arc<MediaDownloader>,
        limiter: Arc<RateLimiter>,
        cadence: CadenceSettings,
        retention: RetentionSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            objects,
            driver,
            downloader,
            limiter,
            cadence,
            retention,
            shutdown,
        }
    }

    /// Run the whole worker until the shutdown token fires, then drain.
    pub async fn run(&self) -> Result<()> {
        self.seed_limiter().await?;

        let stale = self.store.mark_stale_runs_failed().await?;
        if stale > 0 {
            info!("Marked {stale} stale runs as failed from a previous process");
        }

        let media_handle = tokio::spawn(
            Arc::clone(&self.downloader).run(self.shutdown.child_token()),
        );

        // First contact: listings are the FK parent and must land before
        // anything referencing them.
        if !self.store.any_completed_run().await? {
            self.run_initial_import().await;
        }

        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        for resource in ResourceKind::ALL {
            handles.push(self.spawn_resource_loop(resource));
        }

        self.shutdown.cancelled().await;
        info!("Shutdown requested, draining cycles (up to {SHUTDOWN_GRACE:?})");

        for handle in handles {
            if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
                warn!("A resource loop did not drain within the grace period");
            }
        }
        if tokio::time::timeout(SHUTDOWN_GRACE, media_handle)
            .await
            .is_err()
        {
            warn!("Media downloader did not drain within the grace period");
        }

        info!("Scheduler stopped");
        Ok(())
    }

    /// Seed both limiter dimensions from persisted history before the
    /// first admission.
    pub async fn seed_limiter(&self) -> Result<()> {
        let api_events = self
            .store
            .request_timestamps_since(Utc::now() - ChronoDuration::hours(24))
            .await?;
        let media_records = self
            .store
            .media_download_totals_since(Utc::now() - ChronoDuration::minutes(60))
            .await?;
        info!(
            "Seeding rate limiter: {} API events, {} media records",
            api_events.len(),
            media_records.len()
        );
        self.limiter.seed_api(api_events).await;
        self.limiter.seed_media(media_records).await;
        Ok(())
    }

    /// Dependency-ordered first import: Listing, then Member and Office
    /// concurrently, then OpenHouse. Lookup has no dependencies and is left
    /// to its regular loop.
    pub async fn run_initial_import(&self) {
        info!("No completed runs found; starting initial import");

        if self.cycle(ResourceKind::Listing).await.is_none() {
            return;
        }
        if self.shutdown.is_cancelled() {
            return;
        }

        tokio::join!(
            self.cycle(ResourceKind::Member),
            self.cycle(ResourceKind::Office),
        );
        if self.shutdown.is_cancelled() {
            return;
        }

        self.cycle(ResourceKind::OpenHouse).await;
        info!("Initial import sequence finished");
    }

    /// One cycle with error swallowing; the next tick retries.
    async fn cycle(&self, resource: ResourceKind) -> Option<()> {
        match self.driver.run_cycle(resource, &self.shutdown).await {
            Ok(summary) => {
                if summary.status.advances_hwm() {
                    Some(())
                } else {
                    None
                }
            }
            Err(e) => {
                error!("Cycle for {resource} errored: {e:#}");
                None
            }
        }
    }

    /// Spawn the steady-state loop for one resource. Each loop is
    /// non-overlapping by construction: cycle, sleep, repeat.
    fn spawn_resource_loop(&self, resource: ResourceKind) -> JoinHandle<()> {
        let driver = Arc::clone(&self.driver);
        let shutdown = self.shutdown.clone();
        let cadence = self.cadence.for_resource(resource);
        let maintenance = (resource == ResourceKind::Lookup).then(|| {
            (
                Arc::clone(&self.store),
                Arc::clone(&self.objects),
                self.retention.clone(),
            )
        });

        tokio::spawn(async move {
            info!("Starting {resource} loop (cadence {cadence:?})");
            loop {
                if shutdown.is_cancelled() {
                    break;
                }

                if let Err(e) = driver.run_cycle(resource, &shutdown).await {
                    error!("Cycle for {resource} errored: {e:#}");
                }

                // Cleanup rides the slowest cadence instead of a dedicated
                // timer.
                if let Some((store, objects, retention)) = &maintenance {
                    if let Err(e) =
                        run_cleanup(store.as_ref(), objects.as_ref(), retention).await
                    {
                        error!("Daily cleanup failed: {e:#}");
                    }
                }

                tokio::select! {
                    _ = tokio::time::sleep(cadence) => {}
                    _ = shutdown.cancelled() => break,
                }
            }
            info!("{resource} loop stopped");
        })
    }
}

/// Hard-delete listings soft-hidden past the retention window, cascading
/// to children, media rows, objects and history; then prune old request
/// log and media audit rows.
pub async fn run_cleanup(
    store: &dyn ReplicationStore,
    objects: &dyn ObjectStore,
    retention: &RetentionSettings,
) -> Result<()> {
    let purge_cutoff = Utc::now() - ChronoDuration::days(retention.hidden_purge_days as i64);
    let stale_keys = store.listings_hidden_before(purge_cutoff).await?;

    for listing_key in &stale_keys {
        let object_keys: Vec<String> = store
            .media_for_parent(listing_key)
            .await?
            .into_iter()
            .filter_map(|m| m.object_key)
            .filter(|k| !k.is_empty())
            .collect();
        if !object_keys.is_empty() {
            if let Err(e) = objects.delete_many(&object_keys).await {
                // Rows go regardless; orphaned objects are cheaper than
                // zombie rows.
                warn!("Object cleanup for {listing_key} incomplete: {e:#}");
            }
        }
        store.purge_listing(listing_key).await?;
    }
    if !stale_keys.is_empty() {
        info!("Purged {} listings hidden past retention", stale_keys.len());
    }

    let log_cutoff = Utc::now() - ChronoDuration::days(retention.request_log_days as i64);
    let pruned_requests = store.prune_request_log_before(log_cutoff).await?;
    let pruned_audit = store.prune_media_audit_before(log_cutoff).await?;
    if pruned_requests + pruned_audit > 0 {
        info!("Pruned {pruned_requests} request-log and {pruned_audit} media-audit rows");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MediaAsset, MediaStatus, RequestKind, RequestLogEntry};
    use crate::object_store::MemoryObjectStore;
    use crate::store::MemoryReplicationStore;
    use serde_json::json;

    async fn seed_hidden_listing(store: &MemoryReplicationStore, key: &str, hidden_days_ago: i64) {
        let record = json!({
            "ListingKey": key,
            "ListingId": format!("ABC{key}"),
            "ModificationTimestamp": "2024-05-01T00:00:00Z"
        });
        let mapped = crate::mapper::map_listing(record.as_object().unwrap()).unwrap();
        store
            .commit_listing(&mapped.listing, &[], &[], &json!({}))
            .await
            .unwrap();
        store
            .set_listing_hidden(key, Utc::now() - ChronoDuration::days(hidden_days_ago))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_purges_old_hidden_listings_with_objects() {
        let store = MemoryReplicationStore::new();
        let objects = MemoryObjectStore::new();

        seed_hidden_listing(&store, "OLD", 40).await;
        seed_hidden_listing(&store, "FRESH", 5).await;

        // The old listing owns one stored object.
        objects
            .put("property/OLD/M1.jpg", vec![1], "image/jpeg")
            .await
            .unwrap();
        store
            .upsert_media(&MediaAsset {
                media_key: "M1".into(),
                resource_kind: ResourceKind::Listing,
                parent_key: "OLD".into(),
                source_url: None,
                media_mod_ts: None,
                object_key: Some("property/OLD/M1.jpg".into()),
                public_url: Some("https://media.example.com/property/OLD/M1.jpg".into()),
                display_order: 0,
                category: None,
                file_size_bytes: Some(1),
                content_type: Some("image/jpeg".into()),
                status: MediaStatus::Complete,
                retry_count: 0,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        run_cleanup(&store, &objects, &RetentionSettings::default())
            .await
            .unwrap();

        // 40 days > 30-day retention: purged, including the object.
        assert!(store.get_listing("OLD").await.unwrap().is_none());
        assert!(store.media_for_parent("OLD").await.unwrap().is_empty());
        assert!(objects.is_empty());
        // 5 days: untouched.
        assert!(store.get_listing("FRESH").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cleanup_prunes_old_log_rows() {
        let store = MemoryReplicationStore::new();
        let objects = MemoryObjectStore::new();

        store
            .append_request_log(RequestLogEntry {
                run_id: None,
                kind: RequestKind::Api,
                url: "https://api.example.test/old".into(),
                status: Some(200),
                elapsed_ms: 5,
                bytes: 100,
                record_count: Some(1),
                error: None,
                requested_at: Utc::now() - ChronoDuration::days(100),
            })
            .await
            .unwrap();
        store
            .append_request_log(RequestLogEntry {
                run_id: None,
                kind: RequestKind::Api,
                url: "https://api.example.test/recent".into(),
                status: Some(200),
                elapsed_ms: 5,
                bytes: 100,
                record_count: Some(1),
                error: None,
                requested_at: Utc::now(),
            })
            .await
            .unwrap();

        run_cleanup(&store, &objects, &RetentionSettings::default())
            .await
            .unwrap();
        assert_eq!(store.request_log_len(), 1);
    }
}
