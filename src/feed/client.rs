//! Authenticated HTTP client for the feed and its media CDN.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tracing::warn;

use crate::config::FeedSettings;
use crate::limiter::RateLimiter;
use crate::model::{RequestKind, RequestLogEntry, ResourceKind};
use crate::store::ReplicationStore;

use super::urls;
use super::{FeedApi, FeedError, FeedPage, MediaDownload};

/// How long to wait between probes after a 429 from the feed.
const RATE_LIMIT_PROBE_INTERVAL: Duration = Duration::from_secs(600);
/// Probe budget before surfacing [`FeedError::RateLimited`] (~100 min).
const RATE_LIMIT_MAX_PROBES: u32 = 10;

/// Client for the remote feed. One instance is shared by every loop.
///
/// Every request, successful or failed, appends one row to the per-run
/// request log; that log doubles as the seed source for the rate limiter
/// after a restart.
pub struct FeedClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    vendor: String,
    limiter: Arc<RateLimiter>,
    store: Arc<dyn ReplicationStore>,
    probe_interval: Duration,
}

impl FeedClient {
    pub fn new(
        settings: &FeedSettings,
        limiter: Arc<RateLimiter>,
        store: Arc<dyn ReplicationStore>,
    ) -> Result<Self, FeedError> {
        // No explicit timeout: 429 handling is the liveness mechanism and
        // large pages on slow links are legitimate.
        let http = reqwest::Client::builder().gzip(true).build()?;
        Ok(Self {
            http,
            base_url: settings.base_url.clone(),
            token: settings.token.clone(),
            vendor: settings.originating_system.clone(),
            limiter,
            store,
            probe_interval: RATE_LIMIT_PROBE_INTERVAL,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn log_request(
        &self,
        kind: RequestKind,
        run_id: Option<i64>,
        url: &str,
        status: Option<u16>,
        elapsed_ms: i64,
        bytes: u64,
        record_count: Option<u32>,
        error: Option<String>,
    ) {
        let entry = RequestLogEntry {
            run_id,
            kind,
            url: url.to_string(),
            status,
            elapsed_ms,
            bytes,
            record_count,
            error,
            requested_at: Utc::now(),
        };
        if let Err(e) = self.store.append_request_log(entry).await {
            warn!("Failed to persist request log row: {e:#}");
        }
    }
}

#[async_trait]
impl FeedApi for FeedClient {
    async fn fetch_page(&self, url: &str, run_id: Option<i64>) -> Result<FeedPage, FeedError> {
        for probe in 1..=RATE_LIMIT_MAX_PROBES {
            self.limiter.admit_api().await;

            let started = Instant::now();
            let response = match self.http.get(url).bearer_auth(&self.token).send().await {
                Ok(r) => r,
                Err(e) => {
                    let elapsed = started.elapsed().as_millis() as i64;
                    self.log_request(RequestKind::Api, run_id, url, None, elapsed, 0, None, Some(e.to_string()))
                        .await;
                    return Err(e.into());
                }
            };
            let status = response.status().as_u16();
            let elapsed_ms = started.elapsed().as_millis() as i64;

            if status == 429 {
                self.log_request(
                    RequestKind::Api,
                    run_id,
                    url,
                    Some(429),
                    elapsed_ms,
                    0,
                    None,
                    Some(format!("rate limited, probe {probe}/{RATE_LIMIT_MAX_PROBES}")),
                )
                .await;
                warn!(
                    "Feed returned 429, waiting {:?} before probe {}/{}",
                    self.probe_interval, probe, RATE_LIMIT_MAX_PROBES
                );
                tokio::time::sleep(self.probe_interval).await;
                continue;
            }

            if !(200..300).contains(&status) {
                let body = response.text().await.unwrap_or_default();
                self.log_request(
                    RequestKind::Api,
                    run_id,
                    url,
                    Some(status),
                    elapsed_ms,
                    0,
                    None,
                    Some(format!("HTTP {status}")),
                )
                .await;
                return Err(FeedError::Api { status, body });
            }

            let body = response.text().await?;
            let bytes = body.len() as u64;
            let parsed: Value = serde_json::from_str(&body)
                .map_err(|e| FeedError::Malformed(format!("invalid JSON: {e}")))?;
            let records: Vec<Map<String, Value>> = parsed
                .get("value")
                .and_then(Value::as_array)
                .ok_or_else(|| FeedError::Malformed("missing 'value' array".into()))?
                .iter()
                .filter_map(|v| v.as_object().cloned())
                .collect();
            let next_link = parsed
                .get("@odata.nextLink")
                .and_then(Value::as_str)
                .map(String::from);

            self.log_request(
                RequestKind::Api,
                run_id,
                url,
                Some(status),
                elapsed_ms,
                bytes,
                Some(records.len() as u32),
                None,
            )
            .await;

            return Ok(FeedPage {
                records,
                next_link,
                bytes,
                elapsed_ms,
            });
        }

        Err(FeedError::RateLimited)
    }

    async fn download_media(&self, url: &str) -> Result<MediaDownload, FeedError> {
        self.limiter.admit_media().await;

        let started = Instant::now();
        let response = match self.http.get(url).bearer_auth(&self.token).send().await {
            Ok(r) => r,
            Err(e) => {
                let elapsed = started.elapsed().as_millis() as i64;
                self.log_request(RequestKind::Media, None, url, None, elapsed, 0, None, Some(e.to_string()))
                    .await;
                return Err(e.into());
            }
        };
        let status = response.status().as_u16();

        match status {
            s if (200..300).contains(&s) => {
                let content_type = response
                    .headers()
                    .get("content-type")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let body = response.bytes().await?.to_vec();
                let size = body.len() as u64;
                let elapsed_ms = started.elapsed().as_millis() as i64;

                self.limiter.record_media_bytes(size).await;
                self.log_request(RequestKind::Media, None, url, Some(s), elapsed_ms, size, None, None)
                    .await;

                Ok(MediaDownload {
                    body,
                    content_type,
                    size,
                })
            }
            400 | 403 => {
                let elapsed_ms = started.elapsed().as_millis() as i64;
                self.log_request(
                    RequestKind::Media,
                    None,
                    url,
                    Some(status),
                    elapsed_ms,
                    0,
                    None,
                    Some("signed URL rejected".into()),
                )
                .await;
                Err(FeedError::UrlExpired { status })
            }
            429 => {
                let elapsed_ms = started.elapsed().as_millis() as i64;
                self.log_request(
                    RequestKind::Media,
                    None,
                    url,
                    Some(429),
                    elapsed_ms,
                    0,
                    None,
                    Some("rate limited".into()),
                )
                .await;
                Err(FeedError::RateLimited)
            }
            _ => {
                let body = response.text().await.unwrap_or_default();
                let elapsed_ms = started.elapsed().as_millis() as i64;
                self.log_request(
                    RequestKind::Media,
                    None,
                    url,
                    Some(status),
                    elapsed_ms,
                    0,
                    None,
                    Some(format!("HTTP {status}")),
                )
                .await;
                Err(FeedError::Api { status, body })
            }
        }
    }

    async fn fetch_single(
        &self,
        resource: ResourceKind,
        id: &str,
        run_id: Option<i64>,
    ) -> Result<Option<Map<String, Value>>, FeedError> {
        let url = urls::build_single_record_url(&self.base_url, resource, &self.vendor, id);
        let page = self.fetch_page(&url, run_id).await?;
        Ok(page.records.into_iter().next())
    }
}

/// Lazy page walker over a feed query and its `@odata.nextLink` chain.
pub struct PageIterator {
    feed: Arc<dyn FeedApi>,
    next_url: Option<String>,
    run_id: Option<i64>,
}

impl PageIterator {
    pub fn new(feed: Arc<dyn FeedApi>, initial_url: String, run_id: Option<i64>) -> Self {
        Self {
            feed,
            next_url: Some(initial_url),
            run_id,
        }
    }

    /// Fetch the next page, or `None` once the chain is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<FeedPage>, FeedError> {
        let Some(url) = self.next_url.take() else {
            return Ok(None);
        };
        let page = self.feed.fetch_page(&url, self.run_id).await?;
        self.next_url = page.next_link.clone();
        Ok(Some(page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticFeed {
        pages: std::sync::Mutex<Vec<FeedPage>>,
    }

    #[async_trait]
    impl FeedApi for StaticFeed {
        async fn fetch_page(&self, _url: &str, _run_id: Option<i64>) -> Result<FeedPage, FeedError> {
            let mut pages = self.pages.lock().unwrap();
            if pages.is_empty() {
                return Err(FeedError::Malformed("no more pages".into()));
            }
            Ok(pages.remove(0))
        }

        async fn download_media(&self, _url: &str) -> Result<MediaDownload, FeedError> {
            unimplemented!()
        }

        async fn fetch_single(
            &self,
            _resource: ResourceKind,
            _id: &str,
            _run_id: Option<i64>,
        ) -> Result<Option<Map<String, Value>>, FeedError> {
            unimplemented!()
        }
    }

    fn page(count: usize, next: Option<&str>) -> FeedPage {
        FeedPage {
            records: vec![Map::new(); count],
            next_link: next.map(String::from),
            bytes: 10,
            elapsed_ms: 1,
        }
    }

    #[tokio::test]
    async fn test_page_iterator_follows_next_link() {
        let feed = Arc::new(StaticFeed {
            pages: std::sync::Mutex::new(vec![page(2, Some("next")), page(1, None)]),
        });
        let mut iter = PageIterator::new(feed, "initial".into(), None);

        let first = iter.next_page().await.unwrap().unwrap();
        assert_eq!(first.records.len(), 2);
        let second = iter.next_page().await.unwrap().unwrap();
        assert_eq!(second.records.len(), 1);
        assert!(iter.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_page_iterator_stops_after_exhaustion() {
        let feed = Arc::new(StaticFeed {
            pages: std::sync::Mutex::new(vec![page(0, None)]),
        });
        let mut iter = PageIterator::new(feed, "initial".into(), None);
        assert!(iter.next_page().await.unwrap().is_some());
        // Chain exhausted; no further fetches are attempted.
        assert!(iter.next_page().await.unwrap().is_none());
        assert!(iter.next_page().await.unwrap().is_none());
    }
}
