//! Batch aggregation and pipeline orchestration for the crop-price sync.
//!
//! One run discovers `<slug>_recent.csv` files, normalizes each into the two
//! target shapes, concatenates and deduplicates the results, snapshots them
//! under `reports/<run_id>/`, and overwrites the destination collections in
//! batches. The weight-enrichment pass (`enrich`) runs separately over the
//! already-persisted unified collection.

pub mod enrich;
pub mod fetch;
pub mod snapshot;

use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use scpd_core::{CropPriceRecord, UnifiedPriceRecord};
use scpd_storage::{BackoffPolicy, Collection, PriceStore, RestStore, RestStoreConfig};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "scpd-sync";

/// Destination uploads are chunked to bound request size and allow
/// retry-by-batch.
pub const UPLOAD_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub weight_table_path: PathBuf,
    pub slug_registry_path: PathBuf,
    pub store_url: Option<String>,
    pub store_key: Option<String>,
    pub usda_api_key: Option<String>,
    pub fetch_days: i64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub http_timeout_secs: u64,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("SCPD_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./crop_data")),
            reports_dir: std::env::var("SCPD_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            weight_table_path: std::env::var("SCPD_WEIGHT_TABLE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/package_units.json")),
            slug_registry_path: std::env::var("SCPD_SLUGS")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./slugs.yaml")),
            store_url: std::env::var("SCPD_STORE_URL").ok(),
            store_key: std::env::var("SCPD_STORE_KEY").ok(),
            usda_api_key: std::env::var("USDA_API_KEY").ok(),
            fetch_days: std::env::var("SCPD_FETCH_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            scheduler_enabled: std::env::var("SCPD_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("SCPD_SYNC_CRON")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            http_timeout_secs: std::env::var("SCPD_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
        }
    }

    /// Build the hosted store this config points at. Errors when the store
    /// is not configured; callers wanting a dry run pass their own store.
    pub fn build_store(&self) -> Result<RestStore> {
        let base_url = self
            .store_url
            .clone()
            .context("SCPD_STORE_URL is not set")?;
        let api_key = self
            .store_key
            .clone()
            .context("SCPD_STORE_KEY is not set")?;
        RestStore::new(RestStoreConfig {
            base_url,
            api_key,
            timeout: std::time::Duration::from_secs(self.http_timeout_secs),
            backoff: BackoffPolicy::default(),
        })
    }
}

/// Report-slug registry loaded from `slugs.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct SlugRegistry {
    pub slugs: Vec<SlugConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlugConfig {
    pub slug_id: String,
    pub display_name: String,
    pub enabled: bool,
}

pub fn load_slug_registry(path: impl AsRef<Path>) -> Result<SlugRegistry> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Structured per-step counts for one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub files_found: usize,
    pub files_skipped: usize,
    pub rows_read: usize,
    pub rows_dropped: usize,
    pub crop_price_rows: usize,
    pub unified_rows: usize,
    pub crop_price_duplicates_removed: usize,
    pub unified_duplicates_removed: usize,
    pub crop_price_rows_uploaded: usize,
    pub unified_rows_uploaded: usize,
    pub reports_dir: String,
}

/// Discover `<slug>_recent.csv` report files, sorted by file name so the
/// final output is deterministic regardless of directory order.
pub fn discover_report_files(data_dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(data_dir)
        .with_context(|| format!("reading data directory {}", data_dir.display()))?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with("_recent.csv"))
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Remove exact-duplicate rows (row-wise equality across all fields),
/// keeping first occurrences. Rows are keyed by the sha256 of their
/// serialized form, which is stable because struct fields serialize in
/// declaration order.
pub fn dedup_rows<T: Serialize>(rows: Vec<T>) -> (Vec<T>, usize) {
    let mut seen = HashSet::new();
    let before = rows.len();
    let kept: Vec<T> = rows
        .into_iter()
        .filter(|row| {
            let bytes = serde_json::to_vec(row).expect("records serialize to JSON");
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            seen.insert(hex::encode(hasher.finalize()))
        })
        .collect();
    let removed = before - kept.len();
    (kept, removed)
}

/// The full-run orchestrator. The store is injected by reference and lives
/// for the duration of one run.
pub struct SyncPipeline<'a> {
    config: PipelineConfig,
    store: &'a dyn PriceStore,
}

impl<'a> SyncPipeline<'a> {
    pub fn new(config: PipelineConfig, store: &'a dyn PriceStore) -> Self {
        Self { config, store }
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let files = discover_report_files(&self.config.data_dir)?;
        info!(files = files.len(), "discovered report files");

        let mut files_skipped = 0usize;
        let mut rows_read = 0usize;
        let mut rows_dropped = 0usize;
        let mut crop_prices: Vec<CropPriceRecord> = Vec::new();
        let mut unified: Vec<UnifiedPriceRecord> = Vec::new();

        for path in &files {
            match normalize_file(path) {
                Ok(report) => {
                    info!(
                        file = %path.display(),
                        rows = report.rows_read,
                        kept = report.crop_prices.len(),
                        "normalized report file"
                    );
                    rows_read += report.rows_read;
                    rows_dropped += report.rows_dropped;
                    crop_prices.extend(report.crop_prices);
                    unified.extend(report.unified);
                }
                Err(err) => {
                    warn!(file = %path.display(), error = %err, "skipping unreadable report file");
                    files_skipped += 1;
                }
            }
        }

        let (crop_prices, crop_price_duplicates_removed) = dedup_rows(crop_prices);
        let (unified, unified_duplicates_removed) = dedup_rows(unified);

        let run_dir = self.config.reports_dir.join(run_id.to_string());
        snapshot::write_snapshots(&run_dir, &crop_prices, &unified)?;

        let crop_price_rows_uploaded = self
            .upload(Collection::CropPrice, to_json_rows(&crop_prices)?)
            .await?;
        let unified_rows_uploaded = self
            .upload(Collection::Unified, to_json_rows(&unified)?)
            .await?;

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            files_found: files.len(),
            files_skipped,
            rows_read,
            rows_dropped,
            crop_price_rows: crop_prices.len(),
            unified_rows: unified.len(),
            crop_price_duplicates_removed,
            unified_duplicates_removed,
            crop_price_rows_uploaded,
            unified_rows_uploaded,
            reports_dir: run_dir.display().to_string(),
        };
        write_summary(&run_dir, &summary)?;
        Ok(summary)
    }

    /// Bulk-replace one destination collection: clear, then insert in
    /// batches. A mid-upload failure leaves the collection partially
    /// repopulated; that at-least-once-overwrite risk is accepted and the
    /// error is fatal for the run.
    async fn upload(
        &self,
        collection: Collection,
        rows: Vec<serde_json::Value>,
    ) -> Result<usize> {
        let table = collection.table_name();
        self.store
            .clear(collection)
            .await
            .with_context(|| format!("clearing {table}"))?;

        let total = rows.len();
        let mut uploaded = 0usize;
        for batch in rows.chunks(UPLOAD_BATCH_SIZE) {
            self.store
                .insert_batch(collection, batch.to_vec())
                .await
                .with_context(|| format!("uploading batch to {table} ({uploaded}/{total})"))?;
            uploaded += batch.len();
            info!(table, uploaded, total, "uploaded batch");
        }
        Ok(uploaded)
    }
}

fn normalize_file(path: &Path) -> Result<scpd_normalize::NormalizedReport> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    scpd_normalize::normalize_reader(file)
        .with_context(|| format!("parsing {}", path.display()))
}

fn to_json_rows<T: Serialize>(rows: &[T]) -> Result<Vec<serde_json::Value>> {
    rows.iter()
        .map(|row| serde_json::to_value(row).context("serializing record"))
        .collect()
}

fn write_summary(run_dir: &Path, summary: &RunSummary) -> Result<()> {
    std::fs::create_dir_all(run_dir)
        .with_context(|| format!("creating {}", run_dir.display()))?;
    let path = run_dir.join("summary.json");
    let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    std::fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Convenience entry point: config and hosted store from the environment.
pub async fn run_sync_once_from_env() -> Result<RunSummary> {
    let config = PipelineConfig::from_env();
    let store = config.build_store()?;
    SyncPipeline::new(config, &store).run_once().await
}

/// Optional cron-driven daily sync; disabled unless configured.
pub async fn maybe_build_scheduler(config: &PipelineConfig) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.clone();
    let job = Job::new_async(cron.as_str(), |_uuid, _lock| {
        Box::pin(async move {
            match run_sync_once_from_env().await {
                Ok(summary) => info!(run_id = %summary.run_id, "scheduled sync completed"),
                Err(err) => error!(error = %err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
