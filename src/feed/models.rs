//! Response shapes returned by the feed client.

use serde_json::{Map, Value};

/// One page of feed records plus transfer metrics.
#[derive(Debug, Clone)]
pub struct FeedPage {
    /// Raw records from the page's `value` array, in feed order
    /// (ascending `ModificationTimestamp`).
    pub records: Vec<Map<String, Value>>,
    /// `@odata.nextLink`, absent on the last page.
    pub next_link: Option<String>,
    pub bytes: u64,
    pub elapsed_ms: i64,
}

/// A downloaded media asset body.
#[derive(Debug, Clone)]
pub struct MediaDownload {
    pub body: Vec<u8>,
    pub content_type: String,
    pub size: u64,
}
