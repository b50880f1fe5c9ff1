//! The replication cycle driver.
//!
//! One call = one cycle for one resource: pick the mode off the last
//! finished run, walk the page chain, route records to the processor, and
//! finalize the run record. Crash safety comes from the HWM plus the
//! dedup-on-resume set; nothing here holds state between cycles.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::FeedSettings;
use crate::feed::urls::{build_initial_url, build_replication_url, TsOp};
use crate::feed::{FeedApi, PageIterator};
use crate::model::{ResourceKind, RunCounters, RunMode, RunStatus};
use crate::pipeline::{ProcessFlags, Processors};
use crate::store::ReplicationStore;

/// What one cycle did.
#[derive(Debug, Clone)]
pub struct CycleSummary {
    pub run_id: i64,
    pub mode: RunMode,
    pub status: RunStatus,
    pub hwm_end: Option<DateTime<Utc>>,
    pub counters: RunCounters,
}

pub struct CycleDriver {
    store: Arc<dyn ReplicationStore>,
    feed: Arc<dyn FeedApi>,
    processors: Arc<Processors>,
    feed_settings: FeedSettings,
}

/// Key field per resource in the raw record.
fn key_field(resource: ResourceKind) -> &'static str {
    match resource {
        ResourceKind::Listing => "ListingKey",
        ResourceKind::Member => "MemberKey",
        ResourceKind::Office => "OfficeKey",
        ResourceKind::OpenHouse => "OpenHouseKey",
        ResourceKind::Lookup => "LookupKey",
    }
}

fn record_key<'a>(resource: ResourceKind, record: &'a Map<String, Value>) -> Option<&'a str> {
    record.get(key_field(resource)).and_then(Value::as_str)
}

fn record_mod_ts(record: &Map<String, Value>) -> Option<DateTime<Utc>> {
    record
        .get("ModificationTimestamp")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

impl CycleDriver {
    pub fn new(
        store: Arc<dyn ReplicationStore>,
        feed: Arc<dyn FeedApi>,
        processors: Arc<Processors>,
        feed_settings: FeedSettings,
    ) -> Self {
        Self {
            store,
            feed,
            processors,
            feed_settings,
        }
    }

    /// Run one cycle for `resource`. Always finalizes the run record, even
    /// on failure; only the scheduler decides whether to retry.
    pub async fn run_cycle(
        &self,
        resource: ResourceKind,
        shutdown: &CancellationToken,
    ) -> Result<CycleSummary> {
        // Mode selection: the last finished run's hwm_end decides.
        let hwm = self
            .store
            .latest_finished_run(resource)
            .await?
            .and_then(|run| run.hwm_end);
        let mode = match hwm {
            Some(_) => RunMode::Replication,
            None => RunMode::Initial,
        };

        let run_id = self.store.create_run(resource, mode, hwm).await?;
        info!("Starting {mode:?} cycle {run_id} for {resource} (hwm: {hwm:?})");

        // Dedup-on-resume: keys already committed at exactly the HWM. The
        // `ge` filter re-sees them; each is skipped once, then the set is
        // dropped because later pages are beyond the HWM.
        let mut dedup: Option<HashSet<String>> = match (mode, hwm) {
            (RunMode::Replication, Some(hwm)) => {
                let keys = self.store.keys_at_modification_ts(resource, hwm).await?;
                if keys.is_empty() {
                    None
                } else {
                    debug!("Dedup set for {resource}: {} keys at HWM", keys.len());
                    Some(keys.into_iter().collect())
                }
            }
            _ => None,
        };

        let initial_url = match (mode, hwm) {
            (RunMode::Replication, Some(hwm)) => build_replication_url(
                &self.feed_settings.base_url,
                resource,
                &self.feed_settings.originating_system,
                hwm,
                TsOp::Ge,
            ),
            _ => build_initial_url(
                &self.feed_settings.base_url,
                resource,
                &self.feed_settings.originating_system,
            ),
        };
        let mut pages = PageIterator::new(Arc::clone(&self.feed), initial_url, Some(run_id));

        let mut counters = RunCounters::default();
        let mut hwm_end = hwm;
        let mut interrupted = false;
        let mut page_error: Option<String> = None;
        let flags = ProcessFlags { mode, run_id };

        'pages: loop {
            if shutdown.is_cancelled() {
                interrupted = true;
                break;
            }

            let page = match pages.next_page().await {
                Ok(Some(page)) => page,
                Ok(None) => break,
                Err(e) => {
                    if let Some(status) = e.status() {
                        counters.record_http_error(status);
                    }
                    page_error = Some(e.to_string());
                    break;
                }
            };
            counters.record_request(page.bytes, page.elapsed_ms);

            for record in &page.records {
                if shutdown.is_cancelled() {
                    interrupted = true;
                    break 'pages;
                }
                counters.records_received += 1;

                let Some(key) = record_key(resource, record) else {
                    warn!("Record without {} skipped", key_field(resource));
                    continue;
                };
                let mod_ts = record_mod_ts(record);

                // HWM accumulates over every record seen, processed or not.
                if let Some(ts) = mod_ts {
                    hwm_end = Some(hwm_end.map_or(ts, |current| current.max(ts)));
                }

                // Dedup: skip the one already-committed sibling per key.
                if let (Some(ts), Some(start)) = (mod_ts, hwm) {
                    let mut skip = false;
                    let mut exhausted = false;
                    if let Some(set) = dedup.as_mut() {
                        if ts == start {
                            skip = set.remove(key);
                            exhausted = set.is_empty();
                        } else if ts > start {
                            // Past the HWM boundary; the set has done its job.
                            exhausted = true;
                        }
                    }
                    if exhausted {
                        dedup = None;
                    }
                    if skip {
                        debug!("Dedup skip for {key} at HWM");
                        continue;
                    }
                }

                match self.processors.process(resource, record, flags).await {
                    Ok(outcome) => {
                        counters.records_inserted += outcome.inserted;
                        counters.records_updated += outcome.updated;
                        counters.records_deleted += outcome.deleted;
                        counters.media_downloaded += outcome.media_downloaded;
                        counters.media_deleted += outcome.media_deleted;
                        counters.media_bytes += outcome.media_bytes;
                    }
                    Err(e) => {
                        // Per-record errors never kill the cycle.
                        error!("Failed to process {resource} record {key}: {e:#}");
                    }
                }
            }
        }

        let committed =
            counters.records_inserted + counters.records_updated + counters.records_deleted;
        let status = if page_error.is_none() && !interrupted {
            RunStatus::Completed
        } else if committed > 0 {
            RunStatus::Partial
        } else {
            RunStatus::Failed
        };
        if interrupted && page_error.is_none() {
            page_error = Some("interrupted by shutdown".into());
        }

        self.store
            .finalize_run(run_id, status, page_error.clone(), hwm_end, &counters)
            .await?;
        info!(
            "Cycle {run_id} for {resource} finished {status:?}: {} received, {} inserted, {} updated, {} deleted",
            counters.records_received,
            counters.records_inserted,
            counters.records_updated,
            counters.records_deleted
        );

        // Post-cycle hook: keep the search view warm, best effort.
        if resource == ResourceKind::Listing && status != RunStatus::Failed {
            if let Err(e) = self.store.refresh_listing_search_view().await {
                debug!("Listing search view refresh skipped: {e:#}");
            }
        }

        Ok(CycleSummary {
            run_id,
            mode,
            status,
            hwm_end,
            counters,
        })
    }
}
