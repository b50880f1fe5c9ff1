//! Relational persistence behind a single store trait.
//!
//! The pipeline, cycle driver, scheduler and media worker all depend on
//! `Arc<dyn ReplicationStore>`; the PostgreSQL implementation lives in
//! [`postgres`], and [`memory`] provides an in-memory twin for tests.

pub mod memory;
pub mod postgres;

pub use memory::MemoryReplicationStore;
pub use postgres::PgReplicationStore;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::model::{
    ChangeLogEntry, Listing, LookupValue, MediaAsset, MediaDownloadAudit, MediaStatus, Member,
    Office, OpenHouse, PriceChange, ReplicationRun, RequestLogEntry, ResourceKind, Room,
    RunCounters, RunMode, RunStatus, StatusChange, UnitType,
};

/// Storage operations used by the replication engine.
///
/// Write ownership is split: the pipeline writes listings, children, media
/// metadata, history, raw archive and run records; the media downloader owns
/// media status transitions and audit rows.
#[async_trait]
pub trait ReplicationStore: Send + Sync {
    // === Listings ===

    async fn get_listing(&self, listing_key: &str) -> Result<Option<Listing>>;

    /// Look up a listing id by key (media recovery needs it to refetch).
    async fn get_listing_id(&self, listing_key: &str) -> Result<Option<String>>;

    /// The per-record commit: replace both child sets, upsert the listing
    /// (preserving `created_at`) and the raw archive, in one transaction.
    async fn commit_listing(
        &self,
        listing: &Listing,
        rooms: &[Room],
        unit_types: &[UnitType],
        raw: &Value,
    ) -> Result<()>;

    /// Soft-hide: flip `can_view` off and stamp `hidden_at`. Media stays.
    async fn set_listing_hidden(&self, listing_key: &str, hidden_at: DateTime<Utc>) -> Result<()>;

    /// Listings soft-hidden before `cutoff`, for the daily purge.
    async fn listings_hidden_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>>;

    /// Hard-delete one listing, cascading to children, media rows, raw
    /// archive and history. Object-store cleanup is the caller's job.
    async fn purge_listing(&self, listing_key: &str) -> Result<()>;

    async fn get_raw_archive(&self, listing_key: &str) -> Result<Option<Value>>;

    /// Best-effort refresh of the listing search materialized view.
    async fn refresh_listing_search_view(&self) -> Result<()>;

    // === Members / offices ===

    async fn get_member(&self, member_key: &str) -> Result<Option<Member>>;
    async fn upsert_member(&self, member: &Member) -> Result<()>;
    async fn set_member_hidden(&self, member_key: &str, hidden_at: DateTime<Utc>) -> Result<()>;

    async fn get_office(&self, office_key: &str) -> Result<Option<Office>>;
    async fn upsert_office(&self, office: &Office) -> Result<()>;
    async fn set_office_hidden(&self, office_key: &str, hidden_at: DateTime<Utc>) -> Result<()>;

    // === Open houses / lookups ===

    /// Upsert; returns true when a new row was inserted.
    async fn upsert_open_house(&self, open_house: &OpenHouse) -> Result<bool>;
    async fn delete_open_house(&self, open_house_key: &str) -> Result<bool>;

    /// Upsert; returns true when a new row was inserted.
    async fn upsert_lookup(&self, lookup: &LookupValue) -> Result<bool>;

    // === Dedup-on-resume ===

    /// Primary keys of rows whose `modification_ts` equals `ts` exactly.
    async fn keys_at_modification_ts(
        &self,
        resource: ResourceKind,
        ts: DateTime<Utc>,
    ) -> Result<Vec<String>>;

    // === Media ===

    async fn media_for_parent(&self, parent_key: &str) -> Result<Vec<MediaAsset>>;
    async fn upsert_media(&self, asset: &MediaAsset) -> Result<()>;
    async fn delete_media(&self, media_key: &str) -> Result<()>;

    async fn set_media_status(&self, media_key: &str, status: MediaStatus) -> Result<()>;

    /// Transition to `complete` with the stored-object facts filled in.
    async fn mark_media_complete(
        &self,
        media_key: &str,
        object_key: &str,
        public_url: &str,
        file_size_bytes: i64,
        content_type: &str,
    ) -> Result<()>;

    /// Increment and return the new retry count.
    async fn bump_media_retry(&self, media_key: &str) -> Result<i32>;

    async fn update_media_source_url(&self, media_key: &str, url: &str) -> Result<()>;

    /// Oldest-first batch of rows awaiting download.
    async fn pending_media(&self, limit: usize) -> Result<Vec<MediaAsset>>;

    /// Rows in `failed` or `expired`, for the recovery sweep.
    async fn recoverable_media(&self) -> Result<Vec<MediaAsset>>;

    async fn append_media_audit(&self, audit: &MediaDownloadAudit) -> Result<()>;

    /// (timestamp, bytes) of completed downloads since `since`; seeds the
    /// media byte window after a restart.
    async fn media_download_totals_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<(DateTime<Utc>, u64)>>;

    async fn prune_media_audit_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    // === History ===

    async fn append_price_change(&self, change: &PriceChange) -> Result<()>;
    async fn append_status_change(&self, change: &StatusChange) -> Result<()>;
    async fn append_change_log(&self, entry: &ChangeLogEntry) -> Result<()>;

    async fn price_changes_for(&self, listing_key: &str) -> Result<Vec<PriceChange>>;
    async fn status_changes_for(&self, listing_key: &str) -> Result<Vec<StatusChange>>;
    async fn change_log_for(&self, listing_key: &str) -> Result<Vec<ChangeLogEntry>>;

    // === Run records ===

    async fn create_run(
        &self,
        resource: ResourceKind,
        mode: RunMode,
        hwm_start: Option<DateTime<Utc>>,
    ) -> Result<i64>;

    /// Latest run for `resource` with status completed or partial.
    async fn latest_finished_run(&self, resource: ResourceKind) -> Result<Option<ReplicationRun>>;

    async fn finalize_run(
        &self,
        run_id: i64,
        status: RunStatus,
        error_message: Option<String>,
        hwm_end: Option<DateTime<Utc>>,
        counters: &RunCounters,
    ) -> Result<()>;

    /// Mark any run still `running` as failed; startup crash hygiene.
    async fn mark_stale_runs_failed(&self) -> Result<u64>;

    /// True once any resource has a completed run (controls initial-import
    /// ordering).
    async fn any_completed_run(&self) -> Result<bool>;

    // === Request log ===

    async fn append_request_log(&self, entry: RequestLogEntry) -> Result<()>;

    /// API request timestamps since `since`; seeds the API series after a
    /// restart.
    async fn request_timestamps_since(&self, since: DateTime<Utc>) -> Result<Vec<DateTime<Utc>>>;

    async fn prune_request_log_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}
