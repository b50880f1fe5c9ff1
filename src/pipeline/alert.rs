//! Change alert extension point.
//!
//! The worker guarantees the call, not the behavior: downstream consumers
//! (notification fan-out, cache busting) plug in here. The default hook
//! does nothing.

use async_trait::async_trait;

/// What happened to a listing during replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingChangeKind {
    Created,
    Updated,
    Hidden,
}

/// Event describing one listing change, emitted in replication mode only.
#[derive(Debug, Clone)]
pub struct ListingChangeEvent {
    pub listing_key: String,
    pub listing_id: String,
    pub kind: ListingChangeKind,
    /// Watched fields that changed, empty for `Created` and `Hidden`.
    pub changed_fields: Vec<String>,
}

#[async_trait]
pub trait ChangeAlertHook: Send + Sync {
    async fn on_listing_change(&self, event: ListingChangeEvent);
}

/// Default no-op hook.
pub struct NoOpAlertHook;

#[async_trait]
impl ChangeAlertHook for NoOpAlertHook {
    async fn on_listing_change(&self, _event: ListingChangeEvent) {}
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Records every event for assertions.
    #[derive(Default)]
    pub struct RecordingAlertHook {
        pub events: Mutex<Vec<ListingChangeEvent>>,
    }

    #[async_trait]
    impl ChangeAlertHook for RecordingAlertHook {
        async fn on_listing_change(&self, event: ListingChangeEvent) {
            self.events.lock().unwrap().push(event);
        }
    }
}
