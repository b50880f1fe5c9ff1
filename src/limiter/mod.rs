//! Two-dimension admission control shared by every loop in the worker.
//!
//! Dimension one is API request counts over sliding 1 s / 1 h / 24 h
//! windows; dimension two is media bytes over a rolling 60 minute window.
//! API admission serializes callers behind a mutex held across the
//! check-and-record, otherwise concurrent loops would burst past the
//! 2-per-second cap.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

const SECOND: Duration = Duration::from_secs(1);
const HOUR: Duration = Duration::from_secs(3600);
const DAY: Duration = Duration::from_secs(86_400);
const MEDIA_WINDOW: Duration = Duration::from_secs(3600);

/// Caps for the API request dimension.
#[derive(Debug, Clone)]
pub struct ApiLimits {
    pub per_second: usize,
    pub per_hour: usize,
    pub per_day: usize,
    /// Soft thresholds that trigger pre-emptive pacing delays.
    pub soft_per_second: f64,
    pub soft_per_hour: usize,
    pub soft_per_day: usize,
}

impl Default for ApiLimits {
    fn default() -> Self {
        Self {
            per_second: 2,
            per_hour: 7_200,
            per_day: 40_000,
            soft_per_second: 1.5,
            soft_per_hour: 6_000,
            soft_per_day: 35_000,
        }
    }
}

/// Caps for the media byte dimension (rolling 60 minutes).
#[derive(Debug, Clone)]
pub struct MediaLimits {
    pub hard_cap_bytes: u64,
    pub soft_cap_bytes: u64,
}

impl Default for MediaLimits {
    fn default() -> Self {
        Self {
            hard_cap_bytes: 4 * 1024 * 1024 * 1024,
            soft_cap_bytes: 3_758_096_384, // 3.5 GiB
        }
    }
}

/// Timestamped media download record.
#[derive(Debug, Clone, Copy)]
struct MediaRecord {
    at: DateTime<Utc>,
    bytes: u64,
}

/// Snapshot of both dimensions for the dashboard surface.
#[derive(Debug, Clone, Default)]
pub struct LimiterStats {
    pub api_last_second: usize,
    pub api_last_hour: usize,
    pub api_last_day: usize,
    pub api_hour_pct: f64,
    pub api_day_pct: f64,
    pub media_window_bytes: u64,
    pub media_pct: f64,
}

/// Process-wide rate limiter. Construct one and share it via `Arc`.
pub struct RateLimiter {
    api: Mutex<VecDeque<DateTime<Utc>>>,
    media: Mutex<VecDeque<MediaRecord>>,
    api_limits: ApiLimits,
    media_limits: MediaLimits,
}

impl RateLimiter {
    pub fn new(api_limits: ApiLimits, media_limits: MediaLimits) -> Self {
        Self {
            api: Mutex::new(VecDeque::new()),
            media: Mutex::new(VecDeque::new()),
            api_limits,
            media_limits,
        }
    }

    /// Seed the API series from persisted request history (last 24 h).
    /// Must run before the first admission after a restart.
    pub async fn seed_api(&self, timestamps: Vec<DateTime<Utc>>) {
        let cutoff = Utc::now() - DAY;
        let mut events = self.api.lock().await;
        let mut seeded: Vec<_> = timestamps.into_iter().filter(|t| *t >= cutoff).collect();
        seeded.sort();
        debug!("Seeded API series with {} events", seeded.len());
        *events = seeded.into();
    }

    /// Seed the media series from completed downloads (last 60 min).
    pub async fn seed_media(&self, records: Vec<(DateTime<Utc>, u64)>) {
        let cutoff = Utc::now() - MEDIA_WINDOW;
        let mut window = self.media.lock().await;
        let mut seeded: Vec<MediaRecord> = records
            .into_iter()
            .filter(|(t, _)| *t >= cutoff)
            .map(|(at, bytes)| MediaRecord { at, bytes })
            .collect();
        seeded.sort_by_key(|r| r.at);
        debug!("Seeded media series with {} records", seeded.len());
        *window = seeded.into();
    }

    /// Block until an API request slot is available, then claim it.
    ///
    /// The mutex stays held across the re-check and the record, so two
    /// concurrent callers can never both observe the same free slot.
    pub async fn admit_api(&self) {
        loop {
            let soft_delay = {
                let mut events = self.api.lock().await;
                let now = Utc::now();
                prune_before(&mut events, now - DAY);

                let wait = api_hard_wait(&events, now, &self.api_limits);
                if !wait.is_zero() {
                    drop(events);
                    debug!("API admission blocked for {:?}", wait);
                    tokio::time::sleep(wait).await;
                    continue;
                }

                events.push_back(now);
                api_soft_delay(&events, now, &self.api_limits)
            };

            if !soft_delay.is_zero() {
                tokio::time::sleep(soft_delay).await;
            }
            return;
        }
    }

    /// Block until the media byte window has room.
    ///
    /// This only reserves a slot; the caller records actual bytes with
    /// [`record_media_bytes`](Self::record_media_bytes) after the download
    /// completes, so the window can never overestimate.
    pub async fn admit_media(&self) {
        loop {
            let used = {
                let mut window = self.media.lock().await;
                let now = Utc::now();
                prune_media_before(&mut window, now - MEDIA_WINDOW);

                let used: u64 = window.iter().map(|r| r.bytes).sum();
                if used >= self.media_limits.hard_cap_bytes {
                    let wait = window
                        .front()
                        .map(|oldest| wait_until(oldest.at + MEDIA_WINDOW, now))
                        .unwrap_or(SECOND);
                    drop(window);
                    debug!("Media admission blocked for {:?}", wait);
                    tokio::time::sleep(wait.max(SECOND)).await;
                    continue;
                }
                used
            };

            if used >= self.media_limits.soft_cap_bytes {
                debug!("Media window over soft cap, pausing 10s");
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
            return;
        }
    }

    /// Record bytes against the media window after a completed download.
    pub async fn record_media_bytes(&self, bytes: u64) {
        let mut window = self.media.lock().await;
        let now = Utc::now();
        prune_media_before(&mut window, now - MEDIA_WINDOW);
        window.push_back(MediaRecord { at: now, bytes });
    }

    /// Current usage of both dimensions.
    pub async fn stats(&self) -> LimiterStats {
        let now = Utc::now();
        let events = self.api.lock().await;
        let media = self.media.lock().await;

        let api_last_second = count_since(&events, now - SECOND);
        let api_last_hour = count_since(&events, now - HOUR);
        let api_last_day = count_since(&events, now - DAY);
        let media_window_bytes: u64 = media
            .iter()
            .filter(|r| r.at >= now - MEDIA_WINDOW)
            .map(|r| r.bytes)
            .sum();

        LimiterStats {
            api_last_second,
            api_last_hour,
            api_last_day,
            api_hour_pct: pct(api_last_hour as f64, self.api_limits.per_hour as f64),
            api_day_pct: pct(api_last_day as f64, self.api_limits.per_day as f64),
            media_window_bytes,
            media_pct: pct(
                media_window_bytes as f64,
                self.media_limits.hard_cap_bytes as f64,
            ),
        }
    }
}

fn pct(used: f64, cap: f64) -> f64 {
    if cap <= 0.0 {
        0.0
    } else {
        (used / cap) * 100.0
    }
}

fn prune_before(events: &mut VecDeque<DateTime<Utc>>, cutoff: DateTime<Utc>) {
    while let Some(front) = events.front() {
        if *front < cutoff {
            events.pop_front();
        } else {
            break;
        }
    }
}

fn prune_media_before(window: &mut VecDeque<MediaRecord>, cutoff: DateTime<Utc>) {
    while let Some(front) = window.front() {
        if front.at < cutoff {
            window.pop_front();
        } else {
            break;
        }
    }
}

fn count_since(events: &VecDeque<DateTime<Utc>>, cutoff: DateTime<Utc>) -> usize {
    events.iter().filter(|t| **t >= cutoff).count()
}

fn wait_until(expires: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (expires - now).to_std().unwrap_or(Duration::ZERO)
}

/// Minimum wait until every hard cap admits one more event. Zero means
/// the caller may record immediately.
fn api_hard_wait(events: &VecDeque<DateTime<Utc>>, now: DateTime<Utc>, limits: &ApiLimits) -> Duration {
    let mut wait = Duration::ZERO;
    for (window, cap) in [
        (SECOND, limits.per_second),
        (HOUR, limits.per_hour),
        (DAY, limits.per_day),
    ] {
        let cutoff = now - window;
        let in_window: Vec<_> = events.iter().filter(|t| **t >= cutoff).collect();
        if in_window.len() >= cap {
            // The slot frees when the oldest in-window event ages out.
            let nth_oldest = in_window[in_window.len() - cap];
            let candidate = wait_until(*nth_oldest + window, now);
            wait = wait.max(candidate);
        }
    }
    wait
}

/// Escalating pre-emptive delay once usage crosses a soft threshold.
/// The largest applicable delay wins.
fn api_soft_delay(events: &VecDeque<DateTime<Utc>>, now: DateTime<Utc>, limits: &ApiLimits) -> Duration {
    let mut delay = Duration::ZERO;
    if count_since(events, now - SECOND) as f64 >= limits.soft_per_second {
        delay = delay.max(Duration::from_millis(200));
    }
    if count_since(events, now - HOUR) >= limits.soft_per_hour {
        delay = delay.max(Duration::from_secs(2));
    }
    if count_since(events, now - DAY) >= limits.soft_per_day {
        delay = delay.max(Duration::from_secs(5));
    }
    delay
}
