//! Resource staleness derivation for an external dashboard.
//!
//! A resource is stale once twice its expected cadence has passed since
//! the last completed or partial run. The worker itself never acts on
//! this; it is the observability contract for whoever polls run records.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};

use crate::config::CadenceSettings;
use crate::model::ResourceKind;
use crate::store::ReplicationStore;

#[derive(Debug, Clone)]
pub struct ResourceHealth {
    pub resource: ResourceKind,
    /// Completion time of the newest completed/partial run.
    pub last_finished_at: Option<DateTime<Utc>>,
    pub stale: bool,
}

/// Staleness threshold: twice the configured cadence.
fn threshold(cadence: &CadenceSettings, resource: ResourceKind) -> Duration {
    Duration::from_std(cadence.for_resource(resource) * 2).unwrap_or_else(|_| Duration::days(2))
}

/// Derive health for every resource from the run records.
pub async fn resource_health(
    store: &dyn ReplicationStore,
    cadence: &CadenceSettings,
) -> Result<Vec<ResourceHealth>> {
    let now = Utc::now();
    let mut out = Vec::with_capacity(ResourceKind::ALL.len());

    for resource in ResourceKind::ALL {
        let last_finished_at = store
            .latest_finished_run(resource)
            .await?
            .and_then(|run| run.completed_at);
        let stale = match last_finished_at {
            Some(at) => now - at > threshold(cadence, resource),
            // Never finished a run: stale by definition.
            None => true,
        };
        out.push(ResourceHealth {
            resource,
            last_finished_at,
            stale,
        });
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RunCounters, RunMode, RunStatus};
    use crate::store::{MemoryReplicationStore, ReplicationStore as _};

    #[tokio::test]
    async fn test_never_run_resources_are_stale() {
        let store = MemoryReplicationStore::new();
        let health = resource_health(&store, &CadenceSettings::default())
            .await
            .unwrap();
        assert_eq!(health.len(), 5);
        assert!(health.iter().all(|h| h.stale));
    }

    #[tokio::test]
    async fn test_recent_run_is_fresh() {
        let store = MemoryReplicationStore::new();
        let id = store
            .create_run(ResourceKind::Listing, RunMode::Initial, None)
            .await
            .unwrap();
        store
            .finalize_run(
                id,
                RunStatus::Completed,
                None,
                Some(Utc::now()),
                &RunCounters::default(),
            )
            .await
            .unwrap();

        let health = resource_health(&store, &CadenceSettings::default())
            .await
            .unwrap();
        let listing = health
            .iter()
            .find(|h| h.resource == ResourceKind::Listing)
            .unwrap();
        assert!(!listing.stale);
        assert!(listing.last_finished_at.is_some());

        // The rest have no runs and stay stale.
        assert!(health
            .iter()
            .filter(|h| h.resource != ResourceKind::Listing)
            .all(|h| h.stale));
    }
}
