//! HTTP access to the remote listing feed and its media CDN.
//!
//! Everything network-facing lives here: URL construction, authenticated
//! paging, signed-URL media downloads, and 429 recovery. All requests go
//! through the shared [`RateLimiter`](crate::limiter::RateLimiter) first.

mod client;
mod error;
mod models;
pub mod urls;

pub use client::{FeedClient, PageIterator};
pub use error::FeedError;
pub use models::{FeedPage, MediaDownload};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::model::ResourceKind;

/// The surface the pipeline and workers need from the feed.
///
/// Split out as a trait so processors and the media downloader can be
/// exercised against a mock feed in tests.
#[async_trait]
pub trait FeedApi: Send + Sync {
    /// Fetch one page of records from a fully-built feed URL.
    async fn fetch_page(&self, url: &str, run_id: Option<i64>) -> Result<FeedPage, FeedError>;

    /// Download one media asset from its signed CDN URL.
    async fn download_media(&self, url: &str) -> Result<MediaDownload, FeedError>;

    /// Refetch a single record (expanded) to obtain fresh media URLs.
    ///
    /// For listings `id` is the vendor listing id; for members and offices
    /// it is the record key.
    async fn fetch_single(
        &self,
        resource: ResourceKind,
        id: &str,
        run_id: Option<i64>,
    ) -> Result<Option<Map<String, Value>>, FeedError>;
}
