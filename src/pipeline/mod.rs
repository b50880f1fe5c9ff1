//! Per-resource record processors.
//!
//! Each processor takes one raw feed record and carries it through the
//! per-record protocol: visibility gate, load, diff, commit, media refresh,
//! alert hook. Processors never see pages or runs; the cycle driver owns
//! those.

mod alert;
mod diff;
mod listing;
mod lookup;
mod media_refresh;
mod open_house;
mod parties;

pub use alert::{ChangeAlertHook, ListingChangeEvent, ListingChangeKind, NoOpAlertHook};
pub use diff::record_diffs;
pub use listing::ListingProcessor;
pub use lookup::LookupProcessor;
pub use media_refresh::{refresh_media, MediaRefreshStats};
pub use open_house::OpenHouseProcessor;
pub use parties::{MemberProcessor, OfficeProcessor};

use std::sync::Arc;

use anyhow::Result;
use serde_json::{Map, Value};

use crate::config::MediaSettings;
use crate::feed::FeedApi;
use crate::model::{ResourceKind, RunMode};
use crate::object_store::ObjectStore;
use crate::store::ReplicationStore;

/// Per-record statistics returned by every processor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordOutcome {
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    pub media_queued: u64,
    pub media_downloaded: u64,
    pub media_deleted: u64,
    pub media_bytes: u64,
}

/// Flags handed to a processor for one record.
#[derive(Debug, Clone, Copy)]
pub struct ProcessFlags {
    pub mode: RunMode,
    pub run_id: i64,
}

impl ProcessFlags {
    pub fn is_initial_import(&self) -> bool {
        self.mode == RunMode::Initial
    }
}

/// Shared collaborators for all processors.
#[derive(Clone)]
pub struct PipelineDeps {
    pub store: Arc<dyn ReplicationStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub feed: Arc<dyn FeedApi>,
    pub alert: Arc<dyn ChangeAlertHook>,
    pub media: MediaSettings,
    pub public_domain: String,
}

/// One processor per resource kind, routed by the cycle driver.
pub struct Processors {
    listing: ListingProcessor,
    member: MemberProcessor,
    office: OfficeProcessor,
    open_house: OpenHouseProcessor,
    lookup: LookupProcessor,
}

impl Processors {
    pub fn new(deps: PipelineDeps) -> Self {
        Self {
            listing: ListingProcessor::new(deps.clone()),
            member: MemberProcessor::new(deps.clone()),
            office: OfficeProcessor::new(deps.clone()),
            open_house: OpenHouseProcessor::new(deps.store.clone()),
            lookup: LookupProcessor::new(deps.store),
        }
    }

    /// Process one raw record for the given resource.
    pub async fn process(
        &self,
        resource: ResourceKind,
        record: &Map<String, Value>,
        flags: ProcessFlags,
    ) -> Result<RecordOutcome> {
        match resource {
            ResourceKind::Listing => self.listing.process(record, flags).await,
            ResourceKind::Member => self.member.process(record, flags).await,
            ResourceKind::Office => self.office.process(record, flags).await,
            ResourceKind::OpenHouse => self.open_house.process(record, flags).await,
            ResourceKind::Lookup => self.lookup.process(record, flags).await,
        }
    }
}
