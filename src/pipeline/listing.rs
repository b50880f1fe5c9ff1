//! The listing processor: the full per-record protocol.

use anyhow::Result;
use chrono::Utc;
use serde_json::{Map, Value};
use tracing::debug;

use crate::mapper::{map_listing, strip_expanded};
use crate::model::{ResourceKind, RunMode, StatusChange};

use super::diff::record_diffs;
use super::media_refresh::{refresh_media, MediaRefreshRequest};
use super::{ListingChangeEvent, ListingChangeKind, PipelineDeps, ProcessFlags, RecordOutcome};

/// Status written to history when a listing is hidden by the feed.
const HIDDEN_STATUS: &str = "Deleted/Removed";

pub struct ListingProcessor {
    deps: PipelineDeps,
}

impl ListingProcessor {
    pub fn new(deps: PipelineDeps) -> Self {
        Self { deps }
    }

    /// Process one raw listing record.
    ///
    /// Steps: visibility gate, load, diff (replication update path only),
    /// children + listing + raw archive commit, media refresh when photos
    /// changed, alert hook. HWM accumulation happens in the cycle driver.
    pub async fn process(
        &self,
        record: &Map<String, Value>,
        flags: ProcessFlags,
    ) -> Result<RecordOutcome> {
        let mapped = map_listing(record)?;
        let listing = mapped.listing;
        let store = &self.deps.store;

        // Visibility gate: a hide is a soft transition that keeps media.
        if !listing.can_view {
            let Some(existing) = store.get_listing(&listing.listing_key).await? else {
                // Never seen and already hidden: nothing to do.
                return Ok(RecordOutcome::default());
            };

            store
                .set_listing_hidden(&listing.listing_key, Utc::now())
                .await?;

            if existing.can_view && flags.mode == RunMode::Replication {
                store
                    .append_status_change(&StatusChange {
                        listing_key: listing.listing_key.clone(),
                        old_status: existing.standard_status.clone(),
                        new_status: HIDDEN_STATUS.to_string(),
                        recorded_at: Utc::now(),
                    })
                    .await?;
                self.deps
                    .alert
                    .on_listing_change(ListingChangeEvent {
                        listing_key: listing.listing_key.clone(),
                        listing_id: listing.listing_id.clone(),
                        kind: ListingChangeKind::Hidden,
                        changed_fields: vec![],
                    })
                    .await;
            }

            debug!("Soft-hid listing {}", listing.listing_key);
            return Ok(RecordOutcome {
                deleted: 1,
                ..Default::default()
            });
        }

        let existing = store.get_listing(&listing.listing_key).await?;

        // Diff is an update-path concern; initial import and first contact
        // never emit history.
        let mut changed_fields = Vec::new();
        if flags.mode == RunMode::Replication {
            if let Some(old) = &existing {
                changed_fields = record_diffs(store.as_ref(), old, &listing).await?;
            }
        }

        let raw = strip_expanded(record);
        store
            .commit_listing(&listing, &mapped.rooms, &mapped.unit_types, &raw)
            .await?;

        let mut outcome = if existing.is_some() {
            RecordOutcome {
                updated: 1,
                ..Default::default()
            }
        } else {
            RecordOutcome {
                inserted: 1,
                ..Default::default()
            }
        };

        // Photos changed if the record is new or the photo timestamp moved.
        let photos_changed = match &existing {
            None => true,
            Some(old) => old.photos_change_ts != listing.photos_change_ts,
        };
        if photos_changed && !mapped.media.is_empty() {
            let stats = refresh_media(
                &self.deps,
                MediaRefreshRequest {
                    resource: ResourceKind::Listing,
                    parent_key: &listing.listing_key,
                    refetch_id: &listing.listing_id,
                    incoming: &mapped.media,
                    run_id: flags.run_id,
                },
            )
            .await?;
            outcome.media_queued += stats.queued;
            outcome.media_downloaded += stats.downloaded;
            outcome.media_deleted += stats.deleted;
            outcome.media_bytes += stats.bytes;
        }

        if flags.mode == RunMode::Replication {
            let kind = if existing.is_none() {
                ListingChangeKind::Created
            } else {
                ListingChangeKind::Updated
            };
            self.deps
                .alert
                .on_listing_change(ListingChangeEvent {
                    listing_key: listing.listing_key.clone(),
                    listing_id: listing.listing_id.clone(),
                    kind,
                    changed_fields,
                })
                .await;
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MediaSettings;
    use crate::feed::{FeedApi, FeedError, FeedPage, MediaDownload};
    use crate::model::MediaStatus;
    use crate::object_store::MemoryObjectStore;
    use crate::pipeline::alert::test_support::RecordingAlertHook;
    use crate::store::{MemoryReplicationStore, ReplicationStore};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    /// Feed double: serves any media URL, optionally failing specific ones.
    struct MockFeed {
        single: std::sync::Mutex<Option<Map<String, Value>>>,
    }

    impl MockFeed {
        fn new() -> Self {
            Self {
                single: std::sync::Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl FeedApi for MockFeed {
        async fn fetch_page(&self, _url: &str, _run_id: Option<i64>) -> Result<FeedPage, FeedError> {
            unimplemented!("processors never fetch pages")
        }

        async fn download_media(&self, url: &str) -> Result<MediaDownload, FeedError> {
            if url.contains("forbidden") {
                return Err(FeedError::UrlExpired { status: 403 });
            }
            Ok(MediaDownload {
                body: vec![0xAB; 64],
                content_type: "image/jpeg".into(),
                size: 64,
            })
        }

        async fn fetch_single(
            &self,
            _resource: ResourceKind,
            _id: &str,
            _run_id: Option<i64>,
        ) -> Result<Option<Map<String, Value>>, FeedError> {
            Ok(self.single.lock().unwrap().clone())
        }
    }

    struct Fixture {
        deps: PipelineDeps,
        store: Arc<MemoryReplicationStore>,
        objects: Arc<MemoryObjectStore>,
        alert: Arc<RecordingAlertHook>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryReplicationStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let alert = Arc::new(RecordingAlertHook::default());
        let deps = PipelineDeps {
            store: store.clone(),
            objects: objects.clone(),
            feed: Arc::new(MockFeed::new()),
            alert: alert.clone(),
            media: MediaSettings::default(),
            public_domain: "media.example.com".into(),
        };
        Fixture {
            deps,
            store,
            objects,
            alert,
        }
    }

    fn far_future() -> i64 {
        Utc::now().timestamp() + 86_400
    }

    fn record(key: &str, ts: &str, price: f64, media_keys: &[&str]) -> Map<String, Value> {
        let media: Vec<Value> = media_keys
            .iter()
            .enumerate()
            .map(|(i, k)| {
                json!({
                    "MediaKey": k,
                    "MediaURL": format!("https://cdn.example.test/{k}.jpg?expires={}", far_future()),
                    "Order": i,
                    "MediaModificationTimestamp": "2024-05-01T00:00:00Z"
                })
            })
            .collect();
        json!({
            "ListingKey": key,
            "ListingId": format!("ABC{key}"),
            "OriginatingSystemName": "abc",
            "ModificationTimestamp": ts,
            "PhotosChangeTimestamp": "2024-05-01T00:00:00Z",
            "ListPrice": price,
            "StandardStatus": "Active",
            "MlgCanView": true,
            "Media": media
        })
        .as_object()
        .unwrap()
        .clone()
    }

    fn initial_flags() -> ProcessFlags {
        ProcessFlags {
            mode: RunMode::Initial,
            run_id: 1,
        }
    }

    fn replication_flags() -> ProcessFlags {
        ProcessFlags {
            mode: RunMode::Replication,
            run_id: 2,
        }
    }

    #[tokio::test]
    async fn test_initial_import_with_photos() {
        let f = fixture();
        let proc = ListingProcessor::new(f.deps.clone());

        let outcome = proc
            .process(
                &record("K1", "2024-05-01T08:00:00Z", 500_000.0, &["M1", "M2", "M3"]),
                initial_flags(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.media_downloaded, 3);
        assert_eq!(f.objects.len(), 3);
        assert!(f.store.get_listing("K1").await.unwrap().is_some());
        assert!(f.store.get_raw_archive("K1").await.unwrap().is_some());
        // Initial import: no history, no alerts.
        assert!(f.store.price_changes_for("K1").await.unwrap().is_empty());
        assert!(f.store.status_changes_for("K1").await.unwrap().is_empty());
        assert!(f.alert.events.lock().unwrap().is_empty());

        let m1 = f.store.media_by_key("M1").unwrap();
        assert_eq!(m1.status, MediaStatus::Complete);
        assert!(m1.has_stored_object());
    }

    #[tokio::test]
    async fn test_reprocessing_same_record_is_idempotent() {
        let f = fixture();
        let proc = ListingProcessor::new(f.deps.clone());
        let rec = record("K1", "2024-05-01T08:00:00Z", 500_000.0, &["M1"]);

        proc.process(&rec, initial_flags()).await.unwrap();
        let second = proc.process(&rec, replication_flags()).await.unwrap();

        assert_eq!(second.updated, 1);
        assert_eq!(second.inserted, 0);
        // Unchanged photos timestamp: no second download.
        assert_eq!(second.media_downloaded, 0);
        // Identical watched fields: zero history rows.
        assert!(f.store.price_changes_for("K1").await.unwrap().is_empty());
        assert!(f.store.change_log_for("K1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_price_decrease_on_update() {
        let f = fixture();
        let proc = ListingProcessor::new(f.deps.clone());

        proc.process(
            &record("K1", "2024-05-01T08:00:00Z", 500_000.0, &["M1"]),
            initial_flags(),
        )
        .await
        .unwrap();
        let outcome = proc
            .process(
                &record("K1", "2024-05-02T08:00:00Z", 450_000.0, &["M1"]),
                replication_flags(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.updated, 1);
        let prices = f.store.price_changes_for("K1").await.unwrap();
        assert_eq!(prices.len(), 1);
        assert_eq!(prices[0].change_type, "Price Decrease");
        assert_eq!(prices[0].old_price.as_deref(), Some("500000"));
        assert_eq!(prices[0].new_price.as_deref(), Some("450000"));

        let log = f.store.change_log_for("K1").await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].field_name, "list_price");
        assert!(f.store.status_changes_for("K1").await.unwrap().is_empty());

        let events = f.alert.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ListingChangeKind::Updated);
        assert_eq!(events[0].changed_fields, vec!["list_price"]);
    }

    #[tokio::test]
    async fn test_soft_hide_retains_media() {
        let f = fixture();
        let proc = ListingProcessor::new(f.deps.clone());

        proc.process(
            &record("K1", "2024-05-01T08:00:00Z", 500_000.0, &["M1", "M2"]),
            initial_flags(),
        )
        .await
        .unwrap();
        assert_eq!(f.objects.len(), 2);

        let mut hide = record("K1", "2024-05-03T08:00:00Z", 500_000.0, &[]);
        hide.insert("MlgCanView".into(), json!(false));
        let outcome = proc.process(&hide, replication_flags()).await.unwrap();

        assert_eq!(outcome.deleted, 1);
        let listing = f.store.get_listing("K1").await.unwrap().unwrap();
        assert!(!listing.can_view);
        assert!(listing.hidden_at.is_some());

        // Media rows and objects are retained on hide.
        assert_eq!(f.store.media_for_parent("K1").await.unwrap().len(), 2);
        assert_eq!(f.objects.len(), 2);

        let statuses = f.store.status_changes_for("K1").await.unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].new_status, "Deleted/Removed");
        assert_eq!(statuses[0].old_status.as_deref(), Some("Active"));

        let events = f.alert.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ListingChangeKind::Hidden);
    }

    #[tokio::test]
    async fn test_hidden_on_first_observation_is_noop() {
        let f = fixture();
        let proc = ListingProcessor::new(f.deps.clone());

        let mut hide = record("K9", "2024-05-03T08:00:00Z", 500_000.0, &[]);
        hide.insert("MlgCanView".into(), json!(false));
        let outcome = proc.process(&hide, replication_flags()).await.unwrap();

        assert_eq!(outcome, RecordOutcome::default());
        assert!(f.store.get_listing("K9").await.unwrap().is_none());
        assert!(f.store.status_changes_for("K9").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_hide_does_not_duplicate_history() {
        let f = fixture();
        let proc = ListingProcessor::new(f.deps.clone());

        proc.process(
            &record("K1", "2024-05-01T08:00:00Z", 500_000.0, &[]),
            initial_flags(),
        )
        .await
        .unwrap();

        let mut hide = record("K1", "2024-05-03T08:00:00Z", 500_000.0, &[]);
        hide.insert("MlgCanView".into(), json!(false));
        proc.process(&hide, replication_flags()).await.unwrap();
        // The feed may repeat the hidden record; only the transition logs.
        let mut hide2 = record("K1", "2024-05-04T08:00:00Z", 500_000.0, &[]);
        hide2.insert("MlgCanView".into(), json!(false));
        proc.process(&hide2, replication_flags()).await.unwrap();

        assert_eq!(f.store.status_changes_for("K1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_removed_media_is_deleted_from_store() {
        let f = fixture();
        let proc = ListingProcessor::new(f.deps.clone());

        proc.process(
            &record("K1", "2024-05-01T08:00:00Z", 500_000.0, &["M1", "M2"]),
            initial_flags(),
        )
        .await
        .unwrap();

        // Photo set shrinks to M1; photos timestamp moves.
        let mut update = record("K1", "2024-05-02T08:00:00Z", 500_000.0, &["M1"]);
        update.insert("PhotosChangeTimestamp".into(), json!("2024-05-02T00:00:00Z"));
        let outcome = proc.process(&update, replication_flags()).await.unwrap();

        assert_eq!(outcome.media_deleted, 1);
        assert_eq!(f.store.media_for_parent("K1").await.unwrap().len(), 1);
        assert_eq!(f.objects.len(), 1);
    }
}
