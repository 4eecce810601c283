//! Weight-enrichment pass over the persisted unified collection.
//!
//! Runs after an upload: re-reads (id, commodity, package) from the store,
//! resolves each pair against the reference table, and point-updates the
//! matched rows in small batches. Unresolved pairs never block the pass;
//! they are collected into an unmatched report for manual curation.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use scpd_storage::{Collection, PriceStore};
use scpd_weights::{MatchKind, WeightTable};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::{info, warn};

/// Point updates are batched to keep progress observable and retries cheap.
pub const ENRICH_BATCH_SIZE: usize = 100;

/// Upper bound on rows pulled back from the store in one pass.
pub const ENRICH_FETCH_LIMIT: usize = 50_000;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnmatchedPair {
    pub commodity: String,
    pub package: String,
}

#[derive(Debug, Serialize)]
pub struct EnrichSummary {
    pub rows_scanned: usize,
    pub rows_matched: usize,
    pub rows_updated: usize,
    pub unmatched: Vec<UnmatchedPair>,
}

pub async fn enrich_weights(
    store: &dyn PriceStore,
    table: &WeightTable,
) -> Result<EnrichSummary> {
    let rows = store
        .fetch_rows(Collection::Unified, "id,commodity,package", ENRICH_FETCH_LIMIT)
        .await
        .context("fetching unified rows for enrichment")?;
    info!(rows = rows.len(), mappings = table.len(), "starting weight enrichment");

    let mut updates: Vec<(i64, JsonValue)> = Vec::new();
    let mut unmatched: BTreeSet<UnmatchedPair> = BTreeSet::new();

    for row in &rows {
        let Some(id) = row.get("id").and_then(JsonValue::as_i64) else {
            continue;
        };
        let commodity = row.get("commodity").and_then(JsonValue::as_str).unwrap_or("");
        let package = row.get("package").and_then(JsonValue::as_str).unwrap_or("");

        let resolved = table.resolve(commodity, package);
        if resolved.matched == MatchKind::Unmatched {
            unmatched.insert(UnmatchedPair {
                commodity: commodity.to_string(),
                package: package.to_string(),
            });
            continue;
        }

        updates.push((
            id,
            json!({
                "weight_lbs": resolved.weight_lbs,
                "weight_kgs": resolved.weight_kg,
                "units": resolved.units,
            }),
        ));
    }

    let rows_matched = updates.len();
    let mut rows_updated = 0usize;
    for batch in updates.chunks(ENRICH_BATCH_SIZE) {
        for (id, patch) in batch {
            store
                .update_row(Collection::Unified, *id, patch.clone())
                .await
                .with_context(|| format!("updating unified row {id}"))?;
            rows_updated += 1;
        }
        info!(updated = rows_updated, total = rows_matched, "applied enrichment batch");
    }

    if !unmatched.is_empty() {
        warn!(pairs = unmatched.len(), "unmatched commodity/package pairs");
    }

    Ok(EnrichSummary {
        rows_scanned: rows.len(),
        rows_matched,
        rows_updated,
        unmatched: unmatched.into_iter().collect(),
    })
}

/// Persist the unmatched report next to the run snapshots for curation.
pub fn write_unmatched_report(dir: &Path, summary: &EnrichSummary) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join("unmatched_packages.json");
    let bytes =
        serde_json::to_vec_pretty(&summary.unmatched).context("serializing unmatched report")?;
    std::fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use scpd_core::PackageWeightEntry;
    use scpd_storage::MemoryStore;

    fn table() -> WeightTable {
        WeightTable::from_entries(vec![PackageWeightEntry {
            crop: "tomatoes".to_string(),
            package_size: "25 lb cartons".to_string(),
            weight_lbs: Some(25.0),
            weight_kg: Some(11.3),
            units: None,
            source: "USDA Handbook 697".to_string(),
        }])
    }

    #[tokio::test]
    async fn matched_rows_are_patched_and_unmatched_recorded() {
        let store = MemoryStore::new();
        store
            .insert_batch(
                Collection::Unified,
                vec![
                    json!({"commodity": "Tomatoes", "package": "25 Lb Cartons"}),
                    json!({"commodity": "Dragonfruit", "package": "Styrofoam Trays"}),
                ],
            )
            .await
            .unwrap();

        let summary = enrich_weights(&store, &table()).await.unwrap();
        assert_eq!(summary.rows_scanned, 2);
        assert_eq!(summary.rows_matched, 1);
        assert_eq!(summary.rows_updated, 1);
        assert_eq!(summary.unmatched.len(), 1);
        assert_eq!(summary.unmatched[0].commodity, "Dragonfruit");

        let rows = store.rows(Collection::Unified);
        assert_eq!(rows[0]["weight_lbs"], json!(25.0));
        assert_eq!(rows[0]["weight_kgs"], json!(11.3));
        assert!(rows[1].get("weight_lbs").is_none());
    }

    #[tokio::test]
    async fn unmatched_pairs_are_reported_once() {
        let store = MemoryStore::new();
        store
            .insert_batch(
                Collection::Unified,
                vec![
                    json!({"commodity": "Dragonfruit", "package": "Trays"}),
                    json!({"commodity": "Dragonfruit", "package": "Trays"}),
                ],
            )
            .await
            .unwrap();
        let summary = enrich_weights(&store, &table()).await.unwrap();
        assert_eq!(summary.unmatched.len(), 1);
    }
}
