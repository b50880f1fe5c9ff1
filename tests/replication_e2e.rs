//! End-to-end replication scenarios against the in-memory store, a
//! scripted feed, and the in-memory object store.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use gridmirror::config::{FeedSettings, MediaSettings};
use gridmirror::feed::{FeedApi, FeedError, FeedPage, MediaDownload};
use gridmirror::limiter::{ApiLimits, MediaLimits, RateLimiter};
use gridmirror::media_worker::MediaDownloader;
use gridmirror::model::{MediaStatus, ResourceKind, RunMode, RunStatus};
use gridmirror::object_store::MemoryObjectStore;
use gridmirror::pipeline::{NoOpAlertHook, PipelineDeps, Processors};
use gridmirror::replication::CycleDriver;
use gridmirror::store::{MemoryReplicationStore, ReplicationStore};

/// Scripted feed double: queued page responses, marker-driven media
/// behavior, and a configurable single-record refetch.
struct ScriptedFeed {
    pages: Mutex<VecDeque<Result<FeedPage, FeedError>>>,
    single: Mutex<Option<Map<String, Value>>>,
}

impl ScriptedFeed {
    fn new(pages: Vec<Result<FeedPage, FeedError>>) -> Self {
        Self {
            pages: Mutex::new(pages.into()),
            single: Mutex::new(None),
        }
    }

    fn queue_page(&self, page: Result<FeedPage, FeedError>) {
        self.pages.lock().unwrap().push_back(page);
    }

    fn set_single(&self, record: Map<String, Value>) {
        *self.single.lock().unwrap() = Some(record);
    }
}

#[async_trait]
impl FeedApi for ScriptedFeed {
    async fn fetch_page(&self, _url: &str, _run_id: Option<i64>) -> Result<FeedPage, FeedError> {
        self.pages
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(FeedError::Malformed("no scripted page left".into())))
    }

    async fn download_media(&self, url: &str) -> Result<MediaDownload, FeedError> {
        if url.contains("forbidden") {
            return Err(FeedError::UrlExpired { status: 403 });
        }
        Ok(MediaDownload {
            body: vec![0xEE; 512],
            content_type: "image/jpeg".into(),
            size: 512,
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

struct Harness {
    feed: Arc<ScriptedFeed>,
    store: Arc<MemoryReplicationStore>,
    objects: Arc<MemoryObjectStore>,
    driver: CycleDriver,
    downloader: Arc<MediaDownloader>,
    shutdown: CancellationToken,
}

fn harness(pages: Vec<Result<FeedPage, FeedError>>) -> Harness {
    let feed = Arc::new(ScriptedFeed::new(pages));
    let store = Arc::new(MemoryReplicationStore::new());
    let objects = Arc::new(MemoryObjectStore::new());
    let media = MediaSettings::default();

    let processors = Arc::new(Processors::new(PipelineDeps {
        store: store.clone(),
        objects: objects.clone(),
        feed: feed.clone(),
        alert: Arc::new(NoOpAlertHook),
        media: media.clone(),
        public_domain: "media.example.com".into(),
    }));
    let driver = CycleDriver::new(
        store.clone(),
        feed.clone(),
        processors,
        FeedSettings {
            base_url: "https://api.example.test/v2".into(),
            token: "tok".into(),
            originating_system: "abc".into(),
        },
    );
    let downloader = Arc::new(MediaDownloader::new(
        store.clone(),
        objects.clone(),
        feed.clone(),
        media,
        "media.example.com".into(),
    ));

    Harness {
        feed,
        store,
        objects,
        driver,
        downloader,
        shutdown: CancellationToken::new(),
    }
}

fn fresh_media(key: &str) -> Value {
    json!({
        "MediaKey": key,
        "MediaURL": format!(
            "https://cdn.example.test/{key}.jpg?expires={}",
            Utc::now().timestamp() + 86_400
        ),
        "MediaModificationTimestamp": "2024-05-01T00:00:00Z"
    })
}

fn listing_record(key: &str, ts: &str, price: f64, media: Vec<Value>) -> Map<String, Value> {
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

fn page(records: Vec<Map<String, Value>>, next: Option<&str>) -> Result<FeedPage, FeedError> {
    Ok(FeedPage {
        records,
        next_link: next.map(String::from),
        bytes: 2048,
        elapsed_ms: 12,
    })
}

// Scenario: initial import of one listing with three photos.
#[tokio::test]
async fn test_initial_import_of_listing_with_three_photos() {
    let h = harness(vec![page(
        vec![listing_record(
            "K1",
            "2024-05-01T08:00:00Z",
            500_000.0,
            vec![fresh_media("M1"), fresh_media("M2"), fresh_media("M3")],
        )],
        None,
    )]);

    let summary = h
        .driver
        .run_cycle(ResourceKind::Listing, &h.shutdown)
        .await
        .unwrap();

    assert_eq!(summary.mode, RunMode::Initial);
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.counters.records_inserted, 1);
    assert_eq!(
        summary.hwm_end.unwrap().to_rfc3339(),
        "2024-05-01T08:00:00+00:00"
    );

    // Three media rows complete, three objects stored.
    let media = h.store.media_for_parent("K1").await.unwrap();
    assert_eq!(media.len(), 3);
    assert!(media.iter().all(|m| m.status == MediaStatus::Complete));
    assert!(media.iter().all(|m| m.has_stored_object()));
    assert_eq!(h.objects.len(), 3);

    // No history on first contact.
    assert!(h.store.price_changes_for("K1").await.unwrap().is_empty());
    assert!(h.store.status_changes_for("K1").await.unwrap().is_empty());
    assert!(h.store.change_log_for("K1").await.unwrap().is_empty());
}

// Scenario: a price decrease on an update.
#[tokio::test]
async fn test_price_decrease_on_update() {
    let h = harness(vec![page(
        vec![listing_record(
            "K1",
            "2024-05-01T08:00:00Z",
            500_000.0,
            vec![fresh_media("M1")],
        )],
        None,
    )]);

    h.driver
        .run_cycle(ResourceKind::Listing, &h.shutdown)
        .await
        .unwrap();
    let objects_before = h.objects.len();

    // Same photos timestamp, lower price.
    h.feed.queue_page(page(
        vec![listing_record(
            "K1",
            "2024-05-02T08:00:00Z",
            450_000.0,
            vec![fresh_media("M1")],
        )],
        None,
    ));
    let summary = h
        .driver
        .run_cycle(ResourceKind::Listing, &h.shutdown)
        .await
        .unwrap();

    assert_eq!(summary.mode, RunMode::Replication);
    assert_eq!(summary.counters.records_updated, 1);

    let prices = h.store.price_changes_for("K1").await.unwrap();
    assert_eq!(prices.len(), 1);
    assert_eq!(prices[0].old_price.as_deref(), Some("500000"));
    assert_eq!(prices[0].new_price.as_deref(), Some("450000"));
    assert_eq!(prices[0].change_type, "Price Decrease");

    let log = h.store.change_log_for("K1").await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].field_name, "list_price");

    // Status untouched, media untouched.
    assert!(h.store.status_changes_for("K1").await.unwrap().is_empty());
    assert_eq!(h.objects.len(), objects_before);
    assert_eq!(summary.counters.media_downloaded, 0);
}

// Scenario: soft-hide retains media rows and objects.
#[tokio::test]
async fn test_soft_hide_retains_media() {
    let h = harness(vec![page(
        vec![listing_record(
            "K1",
            "2024-05-01T08:00:00Z",
            500_000.0,
            vec![fresh_media("M1"), fresh_media("M2")],
        )],
        None,
    )]);
    h.driver
        .run_cycle(ResourceKind::Listing, &h.shutdown)
        .await
        .unwrap();

    let mut hidden = listing_record("K1", "2024-05-03T08:00:00Z", 500_000.0, vec![]);
    hidden.insert("MlgCanView".into(), json!(false));
    h.feed.queue_page(page(vec![hidden], None));

    let summary = h
        .driver
        .run_cycle(ResourceKind::Listing, &h.shutdown)
        .await
        .unwrap();
    assert_eq!(summary.counters.records_deleted, 1);

    let listing = h.store.get_listing("K1").await.unwrap().unwrap();
    assert!(!listing.can_view);
    assert!(listing.hidden_at.is_some());

    let statuses = h.store.status_changes_for("K1").await.unwrap();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].new_status, "Deleted/Removed");

    // Media retained end to end.
    assert_eq!(h.store.media_for_parent("K1").await.unwrap().len(), 2);
    assert_eq!(h.objects.len(), 2);
}

// Scenario: crash mid-page, resume with `ge` + dedup set.
#[tokio::test]
async fn test_crash_resume_processes_shared_timestamp_sibling_exactly_once() {
    const T2: &str = "2024-05-01T08:00:00Z";

    // First cycle commits A (and crashes before B, which shares T2).
    let h = harness(vec![page(
        vec![listing_record("A", T2, 100.0, vec![])],
        None,
    )]);
    h.driver
        .run_cycle(ResourceKind::Listing, &h.shutdown)
        .await
        .unwrap();

    // Resume: the `ge` filter re-serves A and B at T2, then C beyond it.
    h.feed.queue_page(page(
        vec![
            listing_record("A", T2, 100.0, vec![]),
            listing_record("B", T2, 100.0, vec![]),
            listing_record("C", "2024-05-01T09:00:00Z", 100.0, vec![]),
        ],
        None,
    ));
    let summary = h
        .driver
        .run_cycle(ResourceKind::Listing, &h.shutdown)
        .await
        .unwrap();

    // A skipped once; B and C inserted; nothing double-counted.
    assert_eq!(summary.counters.records_received, 3);
    assert_eq!(summary.counters.records_inserted, 2);
    assert_eq!(summary.counters.records_updated, 0);
    assert!(h.store.get_listing("B").await.unwrap().is_some());
    assert!(h.store.get_listing("C").await.unwrap().is_some());
    assert_eq!(
        summary.hwm_end.unwrap().to_rfc3339(),
        "2024-05-01T09:00:00+00:00"
    );
}

// Scenario: media URL rejected at download time, recovered by the
// background sweep after a parent refetch.
#[tokio::test]
async fn test_expired_media_url_recovers_via_refetch() {
    let forbidden = json!({
        "MediaKey": "M1",
        "MediaURL": format!(
            "https://cdn.example.test/forbidden.jpg?expires={}",
            Utc::now().timestamp() + 86_400
        ),
        "MediaModificationTimestamp": "2024-05-01T00:00:00Z"
    });
    let h = harness(vec![page(
        vec![listing_record(
            "K1",
            "2024-05-01T08:00:00Z",
            500_000.0,
            vec![forbidden],
        )],
        None,
    )]);

    h.driver
        .run_cycle(ResourceKind::Listing, &h.shutdown)
        .await
        .unwrap();

    // Inline refresh hit the 403 and deferred to background recovery.
    let m1 = h.store.media_by_key("M1").unwrap();
    assert_eq!(m1.status, MediaStatus::Expired);
    assert!(h.objects.is_empty());

    // The refetched parent carries a working URL.
    h.feed.set_single(
        json!({
            "ListingKey": "K1",
            "ListingId": "ABCK1",
            "Media": [ fresh_media("M1") ]
        })
        .as_object()
        .unwrap()
        .clone(),
    );

    let stats = h.downloader.recover_once().await.unwrap();
    assert_eq!(stats.refreshed_downloads, 1);

    let m1 = h.store.media_by_key("M1").unwrap();
    assert_eq!(m1.status, MediaStatus::Complete);
    assert!(m1.has_stored_object());
    assert_eq!(h.objects.len(), 1);
}

// Scenario: API admissions under a burst hold the per-second cap.
#[tokio::test]
async fn test_api_admissions_hold_two_per_second() {
    let limiter = RateLimiter::new(ApiLimits::default(), MediaLimits::default());

    let started = Instant::now();
    for _ in 0..6 {
        limiter.admit_api().await;
    }
    let elapsed = started.elapsed();

    // Six admissions at two per second span at least two full seconds.
    assert!(
        elapsed.as_millis() >= 1800,
        "6 admissions took only {elapsed:?}"
    );
    let stats = limiter.stats().await;
    assert_eq!(stats.api_last_day, 6);
}
