//! Replication run records and the per-run request log.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ResourceKind;

/// Which mode a cycle ran in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// First contact for a resource: filters out already-hidden records.
    Initial,
    /// Steady state: receives all changes including hides.
    Replication,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Initial => "initial",
            RunMode::Replication => "replication",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "initial" => Some(RunMode::Initial),
            "replication" => Some(RunMode::Replication),
            _ => None,
        }
    }
}

/// Outcome of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    /// The cycle raised after at least one record committed; the HWM plus
    /// the dedup protocol make the next cycle resume safely.
    Partial,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Partial => "partial",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            "partial" => Some(RunStatus::Partial),
            _ => None,
        }
    }

    /// Finished runs whose `hwm_end` may seed the next cycle.
    pub fn advances_hwm(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Partial)
    }
}

/// Counters accumulated over one cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunCounters {
    pub records_received: u64,
    pub records_inserted: u64,
    pub records_updated: u64,
    pub records_deleted: u64,
    pub media_downloaded: u64,
    pub media_deleted: u64,
    pub media_bytes: u64,
    pub requests: u64,
    pub request_bytes: u64,
    pub avg_latency_ms: i64,
    /// HTTP error histogram: status code -> occurrences.
    pub http_errors: BTreeMap<u16, u32>,
}

impl RunCounters {
    pub fn record_request(&mut self, bytes: u64, elapsed_ms: i64) {
        // Running average, cheap enough at page granularity.
        let total = self.avg_latency_ms * self.requests as i64 + elapsed_ms;
        self.requests += 1;
        self.request_bytes += bytes;
        self.avg_latency_ms = total / self.requests as i64;
    }

    pub fn record_http_error(&mut self, status: u16) {
        *self.http_errors.entry(status).or_insert(0) += 1;
    }
}

/// One row per replication cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationRun {
    pub id: i64,
    pub resource: ResourceKind,
    pub mode: RunMode,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub hwm_start: Option<DateTime<Utc>>,
    /// Greatest `modification_ts` the cycle saw; null until finalize.
    pub hwm_end: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub counters: RunCounters,
}

/// Which admission dimension a logged request consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// Feed API request: counts against the sliding request caps.
    Api,
    /// CDN media download: counts against the byte window only.
    Media,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Api => "api",
            RequestKind::Media => "media",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "api" => Some(RequestKind::Api),
            "media" => Some(RequestKind::Media),
            _ => None,
        }
    }
}

/// One row per feed/CDN request, successful or failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLogEntry {
    pub run_id: Option<i64>,
    pub kind: RequestKind,
    pub url: String,
    pub status: Option<u16>,
    pub elapsed_ms: i64,
    pub bytes: u64,
    pub record_count: Option<u32>,
    pub error: Option<String>,
    pub requested_at: DateTime<Utc>,
}
