//! In-memory store implementation.
//!
//! Backs unit and integration tests; keeps the same observable semantics as
//! the PostgreSQL implementation, including insert/update classification
//! and purge cascades.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::model::{
    ChangeLogEntry, Listing, LookupValue, MediaAsset, MediaDownloadAudit, MediaStatus, Member,
    Office, OpenHouse, PriceChange, ReplicationRun, RequestLogEntry, ResourceKind, Room,
    RunCounters, RunMode, RunStatus, StatusChange, UnitType,
};

use super::ReplicationStore;

#[derive(Default)]
struct Inner {
    listings: HashMap<String, Listing>,
    rooms: HashMap<String, Vec<Room>>,
    unit_types: HashMap<String, Vec<UnitType>>,
    raw_archive: HashMap<String, Value>,
    members: HashMap<String, Member>,
    offices: HashMap<String, Office>,
    open_houses: HashMap<String, OpenHouse>,
    lookups: HashMap<String, LookupValue>,
    media: HashMap<String, MediaAsset>,
    price_changes: Vec<PriceChange>,
    status_changes: Vec<StatusChange>,
    change_log: Vec<ChangeLogEntry>,
    runs: Vec<ReplicationRun>,
    next_run_id: i64,
    request_log: Vec<RequestLogEntry>,
    media_audit: Vec<MediaDownloadAudit>,
    search_view_refreshes: u64,
}

/// Store twin holding everything in process memory.
#[derive(Default)]
pub struct MemoryReplicationStore {
    inner: Mutex<Inner>,
}

impl MemoryReplicationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test observability: how often the search view was refreshed.
    pub fn search_view_refreshes(&self) -> u64 {
        self.inner.lock().unwrap().search_view_refreshes
    }

    /// Test observability: number of persisted request-log rows.
    pub fn request_log_len(&self) -> usize {
        self.inner.lock().unwrap().request_log.len()
    }

    /// Test observability: all media audit rows.
    pub fn media_audit_rows(&self) -> Vec<MediaDownloadAudit> {
        self.inner.lock().unwrap().media_audit.clone()
    }

    /// Test observability: every run, oldest first.
    pub fn runs(&self) -> Vec<ReplicationRun> {
        self.inner.lock().unwrap().runs.clone()
    }

    /// Test helper: media row by key.
    pub fn media_by_key(&self, media_key: &str) -> Option<MediaAsset> {
        self.inner.lock().unwrap().media.get(media_key).cloned()
    }
}

#[async_trait]
impl ReplicationStore for MemoryReplicationStore {
    async fn get_listing(&self, listing_key: &str) -> Result<Option<Listing>> {
        Ok(self.inner.lock().unwrap().listings.get(listing_key).cloned())
    }

    async fn get_listing_id(&self, listing_key: &str) -> Result<Option<String>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .listings
            .get(listing_key)
            .map(|l| l.listing_id.clone()))
    }

    async fn commit_listing(
        &self,
        listing: &Listing,
        rooms: &[Room],
        unit_types: &[UnitType],
        raw: &Value,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let key = listing.listing_key.clone();
        inner.listings.insert(key.clone(), listing.clone());
        inner.rooms.insert(key.clone(), rooms.to_vec());
        inner.unit_types.insert(key.clone(), unit_types.to_vec());
        inner.raw_archive.insert(key, raw.clone());
        Ok(())
    }

    async fn set_listing_hidden(&self, listing_key: &str, hidden_at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(listing) = inner.listings.get_mut(listing_key) {
            listing.can_view = false;
            listing.hidden_at = Some(hidden_at);
        }
        Ok(())
    }

    async fn listings_hidden_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .listings
            .values()
            .filter(|l| l.hidden_at.is_some_and(|h| h < cutoff))
            .map(|l| l.listing_key.clone())
            .collect())
    }

    async fn purge_listing(&self, listing_key: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.listings.remove(listing_key);
        inner.rooms.remove(listing_key);
        inner.unit_types.remove(listing_key);
        inner.raw_archive.remove(listing_key);
        inner.media.retain(|_, m| m.parent_key != listing_key);
        inner.price_changes.retain(|c| c.listing_key != listing_key);
        inner.status_changes.retain(|c| c.listing_key != listing_key);
        inner.change_log.retain(|c| c.listing_key != listing_key);
        Ok(())
    }

    async fn get_raw_archive(&self, listing_key: &str) -> Result<Option<Value>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .raw_archive
            .get(listing_key)
            .cloned())
    }

    async fn refresh_listing_search_view(&self) -> Result<()> {
        self.inner.lock().unwrap().search_view_refreshes += 1;
        Ok(())
    }

    async fn get_member(&self, member_key: &str) -> Result<Option<Member>> {
        Ok(self.inner.lock().unwrap().members.get(member_key).cloned())
    }

    async fn upsert_member(&self, member: &Member) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .members
            .insert(member.member_key.clone(), member.clone());
        Ok(())
    }

    async fn set_member_hidden(&self, member_key: &str, hidden_at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(member) = inner.members.get_mut(member_key) {
            member.can_view = false;
            member.hidden_at = Some(hidden_at);
        }
        Ok(())
    }

    async fn get_office(&self, office_key: &str) -> Result<Option<Office>> {
        Ok(self.inner.lock().unwrap().offices.get(office_key).cloned())
    }

    async fn upsert_office(&self, office: &Office) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .offices
            .insert(office.office_key.clone(), office.clone());
        Ok(())
    }

    async fn set_office_hidden(&self, office_key: &str, hidden_at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(office) = inner.offices.get_mut(office_key) {
            office.can_view = false;
            office.hidden_at = Some(hidden_at);
        }
        Ok(())
    }

    async fn upsert_open_house(&self, open_house: &OpenHouse) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let inserted = !inner.open_houses.contains_key(&open_house.open_house_key);
        inner
            .open_houses
            .insert(open_house.open_house_key.clone(), open_house.clone());
        Ok(inserted)
    }

    async fn delete_open_house(&self, open_house_key: &str) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .open_houses
            .remove(open_house_key)
            .is_some())
    }

    async fn upsert_lookup(&self, lookup: &LookupValue) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let inserted = !inner.lookups.contains_key(&lookup.lookup_key);
        inner
            .lookups
            .insert(lookup.lookup_key.clone(), lookup.clone());
        Ok(inserted)
    }

    async fn keys_at_modification_ts(
        &self,
        resource: ResourceKind,
        ts: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        let keys = match resource {
            ResourceKind::Listing => inner
                .listings
                .values()
                .filter(|l| l.modification_ts == ts)
                .map(|l| l.listing_key.clone())
                .collect(),
            ResourceKind::Member => inner
                .members
                .values()
                .filter(|m| m.modification_ts == ts)
                .map(|m| m.member_key.clone())
                .collect(),
            ResourceKind::Office => inner
                .offices
                .values()
                .filter(|o| o.modification_ts == ts)
                .map(|o| o.office_key.clone())
                .collect(),
            ResourceKind::OpenHouse => inner
                .open_houses
                .values()
                .filter(|o| o.modification_ts == ts)
                .map(|o| o.open_house_key.clone())
                .collect(),
            ResourceKind::Lookup => inner
                .lookups
                .values()
                .filter(|l| l.modification_ts == ts)
                .map(|l| l.lookup_key.clone())
                .collect(),
        };
        Ok(keys)
    }

    async fn media_for_parent(&self, parent_key: &str) -> Result<Vec<MediaAsset>> {
        let mut assets: Vec<MediaAsset> = self
            .inner
            .lock()
            .unwrap()
            .media
            .values()
            .filter(|m| m.parent_key == parent_key)
            .cloned()
            .collect();
        assets.sort_by_key(|m| m.display_order);
        Ok(assets)
    }

    async fn upsert_media(&self, asset: &MediaAsset) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .media
            .insert(asset.media_key.clone(), asset.clone());
        Ok(())
    }

    async fn delete_media(&self, media_key: &str) -> Result<()> {
        self.inner.lock().unwrap().media.remove(media_key);
        Ok(())
    }

    async fn set_media_status(&self, media_key: &str, status: MediaStatus) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(asset) = inner.media.get_mut(media_key) {
            asset.status = status;
            asset.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_media_complete(
        &self,
        media_key: &str,
        object_key: &str,
        public_url: &str,
        file_size_bytes: i64,
        content_type: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(asset) = inner.media.get_mut(media_key) {
            asset.status = MediaStatus::Complete;
            asset.object_key = Some(object_key.to_string());
            asset.public_url = Some(public_url.to_string());
            asset.file_size_bytes = Some(file_size_bytes);
            asset.content_type = Some(content_type.to_string());
            asset.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn bump_media_retry(&self, media_key: &str) -> Result<i32> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(asset) = inner.media.get_mut(media_key) {
            asset.retry_count += 1;
            Ok(asset.retry_count)
        } else {
            Ok(0)
        }
    }

    async fn update_media_source_url(&self, media_key: &str, url: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(asset) = inner.media.get_mut(media_key) {
            asset.source_url = Some(url.to_string());
        }
        Ok(())
    }

    async fn pending_media(&self, limit: usize) -> Result<Vec<MediaAsset>> {
        let inner = self.inner.lock().unwrap();
        let mut pending: Vec<MediaAsset> = inner
            .media
            .values()
            .filter(|m| m.status == MediaStatus::PendingDownload)
            .cloned()
            .collect();
        pending.sort_by_key(|m| m.updated_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn recoverable_media(&self) -> Result<Vec<MediaAsset>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .media
            .values()
            .filter(|m| m.status.needs_recovery())
            .cloned()
            .collect())
    }

    async fn append_media_audit(&self, audit: &MediaDownloadAudit) -> Result<()> {
        self.inner.lock().unwrap().media_audit.push(audit.clone());
        Ok(())
    }

    async fn media_download_totals_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<(DateTime<Utc>, u64)>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .media_audit
            .iter()
            .filter(|a| a.downloaded_at >= since)
            .map(|a| (a.downloaded_at, a.bytes))
            .collect())
    }

    async fn prune_media_audit_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.media_audit.len();
        inner.media_audit.retain(|a| a.downloaded_at >= cutoff);
        Ok((before - inner.media_audit.len()) as u64)
    }

    async fn append_price_change(&self, change: &PriceChange) -> Result<()> {
        self.inner.lock().unwrap().price_changes.push(change.clone());
        Ok(())
    }

    async fn append_status_change(&self, change: &StatusChange) -> Result<()> {
        self.inner.lock().unwrap().status_changes.push(change.clone());
        Ok(())
    }

    async fn append_change_log(&self, entry: &ChangeLogEntry) -> Result<()> {
        self.inner.lock().unwrap().change_log.push(entry.clone());
        Ok(())
    }

    async fn price_changes_for(&self, listing_key: &str) -> Result<Vec<PriceChange>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .price_changes
            .iter()
            .filter(|c| c.listing_key == listing_key)
            .cloned()
            .collect())
    }

    async fn status_changes_for(&self, listing_key: &str) -> Result<Vec<StatusChange>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .status_changes
            .iter()
            .filter(|c| c.listing_key == listing_key)
            .cloned()
            .collect())
    }

    async fn change_log_for(&self, listing_key: &str) -> Result<Vec<ChangeLogEntry>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .change_log
            .iter()
            .filter(|c| c.listing_key == listing_key)
            .cloned()
            .collect())
    }

    async fn create_run(
        &self,
        resource: ResourceKind,
        mode: RunMode,
        hwm_start: Option<DateTime<Utc>>,
    ) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_run_id += 1;
        let id = inner.next_run_id;
        inner.runs.push(ReplicationRun {
            id,
            resource,
            mode,
            status: RunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            hwm_start,
            hwm_end: None,
            error_message: None,
            counters: RunCounters::default(),
        });
        Ok(id)
    }

    async fn latest_finished_run(&self, resource: ResourceKind) -> Result<Option<ReplicationRun>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .runs
            .iter()
            .rev()
            .find(|r| r.resource == resource && r.status.advances_hwm())
            .cloned())
    }

    async fn finalize_run(
        &self,
        run_id: i64,
        status: RunStatus,
        error_message: Option<String>,
        hwm_end: Option<DateTime<Utc>>,
        counters: &RunCounters,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(run) = inner.runs.iter_mut().find(|r| r.id == run_id) {
            run.status = status;
            run.completed_at = Some(Utc::now());
            run.error_message = error_message;
            run.hwm_end = hwm_end;
            run.counters = counters.clone();
        }
        Ok(())
    }

    async fn mark_stale_runs_failed(&self) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let mut count = 0;
        for run in inner.runs.iter_mut() {
            if run.status == RunStatus::Running {
                run.status = RunStatus::Failed;
                run.completed_at = Some(Utc::now());
                run.error_message = Some("worker restarted while run was in progress".into());
                count += 1;
            }
        }
        Ok(count)
    }

    async fn any_completed_run(&self) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .runs
            .iter()
            .any(|r| r.status == RunStatus::Completed))
    }

    async fn append_request_log(&self, entry: RequestLogEntry) -> Result<()> {
        self.inner.lock().unwrap().request_log.push(entry);
        Ok(())
    }

    async fn request_timestamps_since(&self, since: DateTime<Utc>) -> Result<Vec<DateTime<Utc>>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .request_log
            .iter()
            .filter(|e| e.requested_at >= since)
            .map(|e| e.requested_at)
            .collect())
    }

    async fn prune_request_log_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.request_log.len();
        inner.request_log.retain(|e| e.requested_at >= cutoff);
        Ok((before - inner.request_log.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn listing(key: &str, ts: DateTime<Utc>) -> Listing {
        let record = json!({
            "ListingKey": key,
            "ListingId": format!("ABC{key}"),
            "ModificationTimestamp": ts.to_rfc3339(),
        });
        crate::mapper::map_listing(record.as_object().unwrap())
            .unwrap()
            .listing
    }

    #[tokio::test]
    async fn test_commit_and_get_listing() {
        let store = MemoryReplicationStore::new();
        let l = listing("K1", Utc::now());
        store
            .commit_listing(&l, &[], &[], &json!({"ListingKey": "K1"}))
            .await
            .unwrap();

        assert!(store.get_listing("K1").await.unwrap().is_some());
        assert!(store.get_raw_archive("K1").await.unwrap().is_some());
        assert_eq!(
            store.get_listing_id("K1").await.unwrap().as_deref(),
            Some("ABCK1")
        );
    }

    #[tokio::test]
    async fn test_hidden_listing_purge_flow() {
        let store = MemoryReplicationStore::new();
        let l = listing("K1", Utc::now());
        store
            .commit_listing(&l, &[], &[], &json!({}))
            .await
            .unwrap();

        let long_ago = Utc::now() - Duration::days(40);
        store.set_listing_hidden("K1", long_ago).await.unwrap();

        let stale = store
            .listings_hidden_before(Utc::now() - Duration::days(30))
            .await
            .unwrap();
        assert_eq!(stale, vec!["K1".to_string()]);

        store.purge_listing("K1").await.unwrap();
        assert!(store.get_listing("K1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_house_upsert_classification() {
        let store = MemoryReplicationStore::new();
        let oh = OpenHouse {
            open_house_key: "OH1".into(),
            listing_id: "ABC1".into(),
            start_ts: None,
            end_ts: None,
            remarks: None,
            status: None,
            modification_ts: Utc::now(),
        };
        assert!(store.upsert_open_house(&oh).await.unwrap());
        assert!(!store.upsert_open_house(&oh).await.unwrap());
        assert!(store.delete_open_house("OH1").await.unwrap());
        assert!(!store.delete_open_house("OH1").await.unwrap());
    }

    #[tokio::test]
    async fn test_keys_at_modification_ts() {
        let store = MemoryReplicationStore::new();
        let ts = Utc::now();
        store
            .commit_listing(&listing("K1", ts), &[], &[], &json!({}))
            .await
            .unwrap();
        store
            .commit_listing(&listing("K2", ts), &[], &[], &json!({}))
            .await
            .unwrap();
        store
            .commit_listing(&listing("K3", ts + Duration::seconds(1)), &[], &[], &json!({}))
            .await
            .unwrap();

        let mut keys = store
            .keys_at_modification_ts(ResourceKind::Listing, ts)
            .await
            .unwrap();
        keys.sort();
        assert_eq!(keys, vec!["K1".to_string(), "K2".to_string()]);
    }

    #[tokio::test]
    async fn test_run_lifecycle() {
        let store = MemoryReplicationStore::new();
        assert!(!store.any_completed_run().await.unwrap());
        assert!(store
            .latest_finished_run(ResourceKind::Listing)
            .await
            .unwrap()
            .is_none());

        let id = store
            .create_run(ResourceKind::Listing, RunMode::Initial, None)
            .await
            .unwrap();
        // Still running: not a finished run.
        assert!(store
            .latest_finished_run(ResourceKind::Listing)
            .await
            .unwrap()
            .is_none());

        let hwm = Utc::now();
        store
            .finalize_run(id, RunStatus::Completed, None, Some(hwm), &RunCounters::default())
            .await
            .unwrap();

        let latest = store
            .latest_finished_run(ResourceKind::Listing)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.hwm_end, Some(hwm));
        assert!(store.any_completed_run().await.unwrap());
    }

    #[tokio::test]
    async fn test_mark_stale_runs_failed() {
        let store = MemoryReplicationStore::new();
        store
            .create_run(ResourceKind::Listing, RunMode::Initial, None)
            .await
            .unwrap();
        assert_eq!(store.mark_stale_runs_failed().await.unwrap(), 1);
        assert_eq!(store.mark_stale_runs_failed().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_media_retry_and_status_transitions() {
        let store = MemoryReplicationStore::new();
        let asset = MediaAsset {
            media_key: "M1".into(),
            resource_kind: ResourceKind::Listing,
            parent_key: "K1".into(),
            source_url: Some("https://cdn/x.jpg".into()),
            media_mod_ts: None,
            object_key: None,
            public_url: None,
            display_order: 0,
            category: None,
            file_size_bytes: None,
            content_type: None,
            status: MediaStatus::PendingDownload,
            retry_count: 0,
            updated_at: Utc::now(),
        };
        store.upsert_media(&asset).await.unwrap();

        assert_eq!(store.bump_media_retry("M1").await.unwrap(), 1);
        assert_eq!(store.bump_media_retry("M1").await.unwrap(), 2);

        store
            .mark_media_complete("M1", "property/K1/M1.jpg", "https://pub/x.jpg", 100, "image/jpeg")
            .await
            .unwrap();
        let m = store.media_by_key("M1").unwrap();
        assert_eq!(m.status, MediaStatus::Complete);
        assert!(m.has_stored_object());

        assert!(store.pending_media(10).await.unwrap().is_empty());
    }
}
