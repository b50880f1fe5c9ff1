//! Watched-field diffing and history emission.
//!
//! Runs on the update path in replication mode only. Every delta on a
//! watched field appends a change-log row; price and status deltas
//! additionally append to their dedicated history tables.

use anyhow::Result;
use chrono::Utc;

use crate::model::{ChangeLogEntry, Listing, PriceChange, StatusChange};
use crate::store::ReplicationStore;

/// A watched field: name plus extractors for old/new values.
struct WatchedField {
    name: &'static str,
    get: fn(&Listing) -> Option<String>,
}

/// The diff watch list. Additions here start producing change-log rows for
/// every replicated update, so keep it deliberate.
const WATCH_LIST: [WatchedField; 5] = [
    WatchedField {
        name: "list_price",
        get: |l| l.list_price.clone(),
    },
    WatchedField {
        name: "standard_status",
        get: |l| l.standard_status.clone(),
    },
    WatchedField {
        name: "photos_count",
        get: |l| l.photos_count.map(|c| c.to_string()),
    },
    WatchedField {
        name: "public_remarks",
        get: |l| l.public_remarks.clone(),
    },
    WatchedField {
        name: "living_area",
        get: |l| l.living_area.clone(),
    },
];

/// Classify a price delta by sign, preferring the vendor's own
/// `MajorChangeType` when it was sent with the update.
fn price_change_type(old: &Option<String>, new: &Option<String>, vendor: &Option<String>) -> String {
    if let Some(vendor_type) = vendor {
        return vendor_type.clone();
    }
    let parsed = |v: &Option<String>| v.as_deref().and_then(|s| s.parse::<f64>().ok());
    match (parsed(old), parsed(new)) {
        (Some(o), Some(n)) if n > o => "Price Increase".to_string(),
        (Some(o), Some(n)) if n < o => "Price Decrease".to_string(),
        _ => "Price Change".to_string(),
    }
}

/// Compare `old` and `new` over the watch list, appending history rows for
/// every delta. Returns the names of changed fields.
pub async fn record_diffs(
    store: &dyn ReplicationStore,
    old: &Listing,
    new: &Listing,
) -> Result<Vec<String>> {
    let now = Utc::now();
    let mut changed = Vec::new();

    for field in WATCH_LIST {
        let old_value = (field.get)(old);
        let new_value = (field.get)(new);
        if old_value == new_value {
            continue;
        }

        store
            .append_change_log(&ChangeLogEntry {
                listing_key: new.listing_key.clone(),
                field_name: field.name.to_string(),
                old_value: old_value.clone(),
                new_value: new_value.clone(),
                recorded_at: now,
            })
            .await?;

        match field.name {
            "list_price" => {
                store
                    .append_price_change(&PriceChange {
                        listing_key: new.listing_key.clone(),
                        old_price: old_value,
                        new_price: new_value,
                        change_type: price_change_type(
                            &old.list_price,
                            &new.list_price,
                            &new.major_change_type,
                        ),
                        recorded_at: now,
                    })
                    .await?;
            }
            "standard_status" => {
                store
                    .append_status_change(&StatusChange {
                        listing_key: new.listing_key.clone(),
                        old_status: old_value,
                        new_status: new_value.unwrap_or_default(),
                        recorded_at: now,
                    })
                    .await?;
            }
            _ => {}
        }

        changed.push(field.name.to_string());
    }

    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryReplicationStore;
    use serde_json::json;

    fn listing(key: &str, price: Option<&str>, status: Option<&str>) -> Listing {
        let mut record = json!({
            "ListingKey": key,
            "ListingId": format!("ABC{key}"),
            "ModificationTimestamp": "2024-05-01T00:00:00Z",
        });
        let map = record.as_object_mut().unwrap();
        if let Some(p) = price {
            map.insert("ListPrice".into(), json!(p.parse::<f64>().unwrap()));
        }
        if let Some(s) = status {
            map.insert("StandardStatus".into(), json!(s));
        }
        crate::mapper::map_listing(map).unwrap().listing
    }

    #[test]
    fn test_price_change_type_by_sign() {
        assert_eq!(
            price_change_type(&Some("500000".into()), &Some("450000".into()), &None),
            "Price Decrease"
        );
        assert_eq!(
            price_change_type(&Some("500000".into()), &Some("525000".into()), &None),
            "Price Increase"
        );
        assert_eq!(
            price_change_type(&None, &Some("500000".into()), &None),
            "Price Change"
        );
    }

    #[test]
    fn test_price_change_type_prefers_vendor() {
        assert_eq!(
            price_change_type(
                &Some("500000".into()),
                &Some("450000".into()),
                &Some("Back On Market".into())
            ),
            "Back On Market"
        );
    }

    #[tokio::test]
    async fn test_price_decrease_emits_both_rows() {
        let store = MemoryReplicationStore::new();
        let old = listing("K1", Some("500000"), Some("Active"));
        let new = listing("K1", Some("450000"), Some("Active"));

        let changed = record_diffs(&store, &old, &new).await.unwrap();
        assert_eq!(changed, vec!["list_price"]);

        let prices = store.price_changes_for("K1").await.unwrap();
        assert_eq!(prices.len(), 1);
        assert_eq!(prices[0].old_price.as_deref(), Some("500000"));
        assert_eq!(prices[0].new_price.as_deref(), Some("450000"));
        assert_eq!(prices[0].change_type, "Price Decrease");

        assert_eq!(store.change_log_for("K1").await.unwrap().len(), 1);
        assert!(store.status_changes_for("K1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_status_change_emits_status_history() {
        let store = MemoryReplicationStore::new();
        let old = listing("K1", Some("500000"), Some("Active"));
        let new = listing("K1", Some("500000"), Some("Pending"));

        let changed = record_diffs(&store, &old, &new).await.unwrap();
        assert_eq!(changed, vec!["standard_status"]);

        let statuses = store.status_changes_for("K1").await.unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].old_status.as_deref(), Some("Active"));
        assert_eq!(statuses[0].new_status, "Pending");
        assert!(store.price_changes_for("K1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_identical_listings_emit_nothing() {
        let store = MemoryReplicationStore::new();
        let l = listing("K1", Some("500000"), Some("Active"));
        let changed = record_diffs(&store, &l, &l.clone()).await.unwrap();
        assert!(changed.is_empty());
        assert!(store.change_log_for("K1").await.unwrap().is_empty());
    }
}
