//! Open-house processor.
//!
//! Open houses are ephemeral events: a hide from the feed hard-deletes the
//! row instead of soft-hiding it. The parent listing may not exist yet (no
//! cross-resource ordering), so nothing here touches listings.

use std::sync::Arc;

use anyhow::Result;
use serde_json::{Map, Value};

use crate::mapper::map_open_house;
use crate::store::ReplicationStore;

use super::{ProcessFlags, RecordOutcome};

pub struct OpenHouseProcessor {
    store: Arc<dyn ReplicationStore>,
}

impl OpenHouseProcessor {
    pub fn new(store: Arc<dyn ReplicationStore>) -> Self {
        Self { store }
    }

    pub async fn process(
        &self,
        record: &Map<String, Value>,
        _flags: ProcessFlags,
    ) -> Result<RecordOutcome> {
        let can_view = record
            .get("MlgCanView")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        if !can_view {
            let key = record
                .get("OpenHouseKey")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let deleted = if key.is_empty() {
                false
            } else {
                self.store.delete_open_house(key).await?
            };
            return Ok(RecordOutcome {
                deleted: u64::from(deleted),
                ..Default::default()
            });
        }

        let open_house = map_open_house(record)?;
        let inserted = self.store.upsert_open_house(&open_house).await?;
        Ok(if inserted {
            RecordOutcome {
                inserted: 1,
                ..Default::default()
            }
        } else {
            RecordOutcome {
                updated: 1,
                ..Default::default()
            }
        })
    }
}
