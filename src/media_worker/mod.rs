//! Background media downloader.
//!
//! A single long-running task that drains `pending_download` rows in
//! staggered concurrent batches, backs off globally on CDN 429s, and
//! periodically sweeps `failed`/`expired` rows for recovery. Shares the
//! process-wide rate limiter through the feed client.

mod recovery;

pub use recovery::RecoveryStats;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MediaSettings;
use crate::feed::{FeedApi, FeedError};
use crate::mapper::{media_object_key, url_is_expired};
use crate::model::{MediaAsset, MediaDownloadAudit, MediaStatus};
use crate::object_store::{public_url, ObjectStore};
use crate::store::ReplicationStore;

/// Poll interval while the queue is empty or paused.
const POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Delay between dispatches inside one batch, against ignition bursts.
const DISPATCH_STAGGER: Duration = Duration::from_millis(200);
/// First pause after a 429; doubles per subsequent 429 up to the cap.
const INITIAL_RATE_LIMIT_PAUSE: Duration = Duration::from_secs(300);
const MAX_RATE_LIMIT_PAUSE: Duration = Duration::from_secs(900);
/// How often the recovery sweep and the stats line run.
const RECOVERY_INTERVAL: Duration = Duration::from_secs(900);
const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Result of processing one queued item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Completed { bytes: u64 },
    Expired,
    RateLimited,
    /// Transient failure, retry budget not exhausted; stays pending.
    WillRetry,
    Failed,
}

/// Accumulated counters for one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub completed: u64,
    pub bytes: u64,
    pub expired: u64,
    pub failed: u64,
    pub rate_limited: u64,
}

struct PauseState {
    until: Option<Instant>,
    current_pause: Duration,
}

pub struct MediaDownloader {
    store: Arc<dyn ReplicationStore>,
    objects: Arc<dyn ObjectStore>,
    feed: Arc<dyn FeedApi>,
    settings: MediaSettings,
    public_domain: String,
    pause: Mutex<PauseState>,
}

impl MediaDownloader {
    pub fn new(
        store: Arc<dyn ReplicationStore>,
        objects: Arc<dyn ObjectStore>,
        feed: Arc<dyn FeedApi>,
        settings: MediaSettings,
        public_domain: String,
    ) -> Self {
        Self {
            store,
            objects,
            feed,
            settings,
            public_domain,
            pause: Mutex::new(PauseState {
                until: None,
                current_pause: INITIAL_RATE_LIMIT_PAUSE,
            }),
        }
    }

    /// Main loop. Call from a spawned task; returns on cancellation.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            "Media downloader starting (concurrency={})",
            self.settings.concurrency
        );

        // Startup sweep: rows stranded by the previous process.
        match self.recover_once().await {
            Ok(stats) if stats.total() > 0 => info!("Startup media recovery: {stats:?}"),
            Ok(_) => {}
            Err(e) => error!("Startup media recovery failed: {e:#}"),
        }

        let mut totals = DrainStats::default();
        let mut last_recovery = Instant::now();
        let mut last_stats = Instant::now();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = shutdown.cancelled() => {
                    info!("Media downloader shutting down");
                    break;
                }
            }

            match self.drain_once().await {
                Ok(stats) => {
                    totals.completed += stats.completed;
                    totals.bytes += stats.bytes;
                    totals.expired += stats.expired;
                    totals.failed += stats.failed;
                    totals.rate_limited += stats.rate_limited;
                }
                Err(e) => error!("Media drain pass failed: {e:#}"),
            }

            if last_stats.elapsed() >= STATS_INTERVAL {
                info!(
                    "Media downloader: {} completed, {} bytes, {} expired, {} failed, {} rate-limit hits",
                    totals.completed, totals.bytes, totals.expired, totals.failed, totals.rate_limited
                );
                last_stats = Instant::now();
            }

            if last_recovery.elapsed() >= RECOVERY_INTERVAL {
                match self.recover_once().await {
                    Ok(stats) if stats.total() > 0 => info!("Media recovery sweep: {stats:?}"),
                    Ok(_) => {}
                    Err(e) => error!("Media recovery sweep failed: {e:#}"),
                }
                last_recovery = Instant::now();
            }
        }
    }

    fn is_paused(&self) -> bool {
        let pause = self.pause.lock().unwrap();
        pause.until.is_some_and(|until| until > Instant::now())
    }

    /// Record a 429: pause the whole downloader and escalate the next pause.
    fn enter_rate_limit_pause(&self) {
        let mut pause = self.pause.lock().unwrap();
        let duration = pause.current_pause;
        pause.until = Some(Instant::now() + duration);
        pause.current_pause = (pause.current_pause * 2).min(MAX_RATE_LIMIT_PAUSE);
        warn!("CDN rate limited; media downloads paused for {duration:?}");
    }

    /// A success resets the escalation ladder.
    fn reset_rate_limit_pause(&self) {
        let mut pause = self.pause.lock().unwrap();
        pause.until = None;
        pause.current_pause = INITIAL_RATE_LIMIT_PAUSE;
    }

    /// One batch: poll, dispatch with staggered starts, await all.
    pub async fn drain_once(&self) -> Result<DrainStats> {
        let mut stats = DrainStats::default();
        if self.is_paused() {
            return Ok(stats);
        }

        let batch = self.store.pending_media(self.settings.concurrency).await?;
        if batch.is_empty() {
            return Ok(stats);
        }
        debug!("Dispatching {} pending media downloads", batch.len());

        let downloads = batch.into_iter().enumerate().map(|(i, item)| async move {
            tokio::time::sleep(DISPATCH_STAGGER * i as u32).await;
            // A 429 observed earlier in the batch pauses the whole
            // downloader; undispatched rows stay pending.
            if self.is_paused() {
                return Ok(None);
            }
            self.process_item(item).await.map(Some)
        });

        for result in join_all(downloads).await {
            match result {
                Ok(Some(outcome)) => match outcome {
                    ItemOutcome::Completed { bytes } => {
                        stats.completed += 1;
                        stats.bytes += bytes;
                    }
                    ItemOutcome::Expired => stats.expired += 1,
                    ItemOutcome::RateLimited => stats.rate_limited += 1,
                    ItemOutcome::WillRetry => {}
                    ItemOutcome::Failed => stats.failed += 1,
                },
                Ok(None) => {}
                Err(e) => warn!("Media item processing failed: {e:#}"),
            }
        }

        Ok(stats)
    }

    /// Process one queued row end to end.
    async fn process_item(&self, item: MediaAsset) -> Result<ItemOutcome> {
        let Some(url) = item.source_url.clone().filter(|u| !u.is_empty()) else {
            // No URL at all; recovery will refetch the parent for one.
            self.store
                .set_media_status(&item.media_key, MediaStatus::Expired)
                .await?;
            return Ok(ItemOutcome::Expired);
        };

        if url_is_expired(&url, Utc::now()) {
            self.store
                .set_media_status(&item.media_key, MediaStatus::Expired)
                .await?;
            return Ok(ItemOutcome::Expired);
        }

        self.download_and_store(&item, &url).await
    }

    /// Download, upload, commit. Shared by the drain loop and recovery.
    pub(crate) async fn download_and_store(
        &self,
        item: &MediaAsset,
        url: &str,
    ) -> Result<ItemOutcome> {
        let started = Instant::now();
        match self.feed.download_media(url).await {
            Ok(download) => {
                let content_type = download.content_type.clone();
                let object_key = media_object_key(
                    item.resource_kind,
                    &item.parent_key,
                    &item.media_key,
                    &content_type,
                );
                self.objects
                    .put(&object_key, download.body, &content_type)
                    .await?;
                self.store
                    .mark_media_complete(
                        &item.media_key,
                        &object_key,
                        &public_url(&self.public_domain, &object_key),
                        download.size as i64,
                        &content_type,
                    )
                    .await?;
                self.store
                    .append_media_audit(&MediaDownloadAudit {
                        media_key: item.media_key.clone(),
                        parent_key: item.parent_key.clone(),
                        bytes: download.size,
                        elapsed_ms: started.elapsed().as_millis() as i64,
                        downloaded_at: Utc::now(),
                    })
                    .await?;
                self.reset_rate_limit_pause();
                debug!(
                    "Downloaded media {} ({} bytes)",
                    item.media_key, download.size
                );
                Ok(ItemOutcome::Completed {
                    bytes: download.size,
                })
            }
            Err(FeedError::UrlExpired { .. }) => {
                // No retry: the URL is dead until a refetch replaces it.
                self.store
                    .set_media_status(&item.media_key, MediaStatus::Expired)
                    .await?;
                Ok(ItemOutcome::Expired)
            }
            Err(FeedError::RateLimited) => {
                // Row stays pending; the downloader-wide pause takes over.
                self.enter_rate_limit_pause();
                Ok(ItemOutcome::RateLimited)
            }
            Err(e) => {
                let retries = self.store.bump_media_retry(&item.media_key).await?;
                if retries >= self.settings.max_retries {
                    warn!(
                        "Media {} failed after {} retries: {e}",
                        item.media_key, retries
                    );
                    self.store
                        .set_media_status(&item.media_key, MediaStatus::Failed)
                        .await?;
                    Ok(ItemOutcome::Failed)
                } else {
                    debug!(
                        "Media {} transient failure ({}/{}): {e}",
                        item.media_key, retries, self.settings.max_retries
                    );
                    Ok(ItemOutcome::WillRetry)
                }
            }
        }
    }
}
