//! Per-run snapshot export: JSON sidecars of both collections (consumed by
//! the dashboard layer as a store fallback), a parquet export of the unified
//! collection, and a manifest carrying content digests.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema};
use parquet::arrow::ArrowWriter;
use scpd_core::{CropPriceRecord, UnifiedPriceRecord};
use serde::Serialize;
use sha2::{Digest, Sha256};

pub const CROP_PRICES_JSON: &str = "crop_prices.json";
pub const UNIFIED_JSON: &str = "unified.json";
pub const UNIFIED_PARQUET: &str = "unified.parquet";
pub const MANIFEST_JSON: &str = "manifest.json";

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Write `reports/<run_id>/snapshots/` and return the manifest path.
pub fn write_snapshots(
    run_dir: &Path,
    crop_prices: &[CropPriceRecord],
    unified: &[UnifiedPriceRecord],
) -> Result<PathBuf> {
    let snapshot_dir = run_dir.join("snapshots");
    std::fs::create_dir_all(&snapshot_dir)
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let crop_prices_path = snapshot_dir.join(CROP_PRICES_JSON);
    let unified_path = snapshot_dir.join(UNIFIED_JSON);
    let parquet_path = snapshot_dir.join(UNIFIED_PARQUET);

    write_json(&crop_prices_path, crop_prices)?;
    write_json(&unified_path, unified)?;
    write_unified_parquet(&parquet_path, unified)?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("crop_prices", run_dir, &crop_prices_path)?,
            manifest_entry("unified", run_dir, &unified_path)?,
            manifest_entry("unified_parquet", run_dir, &parquet_path)?,
        ],
    };
    let manifest_path = snapshot_dir.join(MANIFEST_JSON);
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    std::fs::write(&manifest_path, bytes)
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_json<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(rows).context("serializing snapshot rows")?;
    std::fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))
}

fn write_unified_parquet(path: &Path, unified: &[UnifiedPriceRecord]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        Field::new("report_date", DataType::Utf8, false),
        Field::new("market_type", DataType::Utf8, true),
        Field::new("district", DataType::Utf8, true),
        Field::new("commodity", DataType::Utf8, false),
        Field::new("variety", DataType::Utf8, true),
        Field::new("package", DataType::Utf8, true),
        Field::new("origin", DataType::Utf8, true),
        Field::new("weight_lbs", DataType::Float64, true),
        Field::new("weight_kgs", DataType::Float64, true),
        Field::new("units", DataType::Int64, true),
        Field::new("price_avg", DataType::Int64, true),
    ]));

    let report_dates = StringArray::from(
        unified
            .iter()
            .map(|r| Some(r.report_date.to_string()))
            .collect::<Vec<_>>(),
    );
    let market_types = StringArray::from(
        unified
            .iter()
            .map(|r| r.market_type.as_deref())
            .collect::<Vec<_>>(),
    );
    let districts = StringArray::from(
        unified
            .iter()
            .map(|r| r.district.as_deref())
            .collect::<Vec<_>>(),
    );
    let commodities = StringArray::from(
        unified
            .iter()
            .map(|r| Some(r.commodity.as_str()))
            .collect::<Vec<_>>(),
    );
    let varieties = StringArray::from(
        unified
            .iter()
            .map(|r| r.variety.as_deref())
            .collect::<Vec<_>>(),
    );
    let packages = StringArray::from(
        unified
            .iter()
            .map(|r| r.package.as_deref())
            .collect::<Vec<_>>(),
    );
    let origins = StringArray::from(
        unified
            .iter()
            .map(|r| r.origin.as_deref())
            .collect::<Vec<_>>(),
    );
    let weight_lbs = Float64Array::from(unified.iter().map(|r| r.weight_lbs).collect::<Vec<_>>());
    let weight_kgs = Float64Array::from(unified.iter().map(|r| r.weight_kgs).collect::<Vec<_>>());
    let units = Int64Array::from(unified.iter().map(|r| r.units).collect::<Vec<_>>());
    let price_avgs = Int64Array::from(unified.iter().map(|r| r.price_avg).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(report_dates),
            Arc::new(market_types),
            Arc::new(districts),
            Arc::new(commodities),
            Arc::new(varieties),
            Arc::new(packages),
            Arc::new(origins),
            Arc::new(weight_lbs),
            Arc::new(weight_kgs),
            Arc::new(units),
            Arc::new(price_avgs),
        ],
    )
    .context("building unified record batch")?;

    let file =
        File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, schema, None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path) -> Result<SnapshotManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path.strip_prefix(run_dir).unwrap_or(path).display().to_string();
    Ok(SnapshotManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn unified(commodity: &str) -> UnifiedPriceRecord {
        UnifiedPriceRecord {
            report_date: NaiveDate::from_ymd_opt(2025, 4, 1).unwrap(),
            market_type: Some("Terminal".to_string()),
            district: None,
            commodity: commodity.to_string(),
            variety: None,
            package: Some("25 Lb Cartons".to_string()),
            origin: None,
            weight_lbs: None,
            weight_kgs: None,
            units: None,
            price_avg: Some(20),
            market_tone_comments: None,
            supply_tone_comments: None,
            demand_tone_comments: None,
        }
    }

    #[test]
    fn snapshots_and_manifest_land_in_the_run_directory() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = dir.path().join("run");
        let manifest_path =
            write_snapshots(&run_dir, &[], &[unified("Tomatoes"), unified("Kale")]).unwrap();
        assert!(manifest_path.exists());
        assert!(run_dir.join("snapshots").join(UNIFIED_JSON).exists());
        assert!(run_dir.join("snapshots").join(UNIFIED_PARQUET).exists());

        let manifest: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&manifest_path).unwrap()).unwrap();
        let files = manifest["files"].as_array().unwrap();
        assert_eq!(files.len(), 3);
        for file in files {
            assert_eq!(file["sha256"].as_str().unwrap().len(), 64);
        }
    }

    #[test]
    fn identical_inputs_produce_identical_json_snapshots() {
        let rows = vec![unified("Tomatoes"), unified("Kale")];
        let dir = tempfile::tempdir().unwrap();
        write_snapshots(&dir.path().join("a"), &[], &rows).unwrap();
        write_snapshots(&dir.path().join("b"), &[], &rows).unwrap();
        let a = std::fs::read(dir.path().join("a/snapshots").join(UNIFIED_JSON)).unwrap();
        let b = std::fs::read(dir.path().join("b/snapshots").join(UNIFIED_JSON)).unwrap();
        assert_eq!(a, b);
    }
}
