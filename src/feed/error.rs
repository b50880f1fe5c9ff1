//! Tagged error values surfaced by the feed client.
//!
//! The cycle driver matches on these variants to decide whether a run
//! finishes `partial` or `failed`, so they must stay distinguishable.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    /// HTTP 429 that survived the probe budget. Never terminates a cycle
    /// immediately; the driver treats it like any page error.
    #[error("rate limited by remote (HTTP 429)")]
    RateLimited,

    /// HTTP 400/403 on a signed media URL: the token has aged out.
    #[error("signed media URL rejected (HTTP {status})")]
    UrlExpired { status: u16 },

    /// Any other non-2xx from the feed.
    #[error("feed returned HTTP {status}: {body}")]
    Api { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// 2xx body that does not look like an OData page.
    #[error("malformed feed response: {0}")]
    Malformed(String),
}

impl FeedError {
    /// HTTP status for the request-log row, where one applies.
    pub fn status(&self) -> Option<u16> {
        match self {
            FeedError::RateLimited => Some(429),
            FeedError::UrlExpired { status } => Some(*status),
            FeedError::Api { status, .. } => Some(*status),
            FeedError::Transport(e) => e.status().map(|s| s.as_u16()),
            FeedError::Malformed(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_extraction() {
        assert_eq!(FeedError::RateLimited.status(), Some(429));
        assert_eq!(FeedError::UrlExpired { status: 403 }.status(), Some(403));
        assert_eq!(
            FeedError::Api {
                status: 500,
                body: String::new()
            }
            .status(),
            Some(500)
        );
        assert_eq!(FeedError::Malformed("x".into()).status(), None);
    }
}
