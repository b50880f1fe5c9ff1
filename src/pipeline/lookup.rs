//! Lookup processor: a straight upsert of enumerated domain values.

use std::sync::Arc;

use anyhow::Result;
use serde_json::{Map, Value};

use crate::mapper::map_lookup;
use crate::store::ReplicationStore;

use super::{ProcessFlags, RecordOutcome};

pub struct LookupProcessor {
    store: Arc<dyn ReplicationStore>,
}

impl LookupProcessor {
    pub fn new(store: Arc<dyn ReplicationStore>) -> Self {
        Self { store }
    }

    pub async fn process(
        &self,
        record: &Map<String, Value>,
        _flags: ProcessFlags,
    ) -> Result<RecordOutcome> {
        let lookup = map_lookup(record)?;
        let inserted = self.store.upsert_lookup(&lookup).await?;
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
