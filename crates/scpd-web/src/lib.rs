//! Axum JSON API for the dashboard front end.
//!
//! Thin parameter-to-filter translation over the two collections: rows come
//! from the configured REST store when one is reachable, falling back to the
//! latest run snapshot under the reports directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;
use scpd_core::{CropPriceRecord, PriceFields, UnifiedPriceRecord};
use scpd_normalize::aggregate_price_avg;
use scpd_storage::{Collection, PriceStore};
use scpd_sync::snapshot::{CROP_PRICES_JSON, UNIFIED_JSON};
use scpd_sync::SlugConfig;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::warn;

pub const CRATE_NAME: &str = "scpd-web";

/// Cap on rows pulled back from the store per request cycle.
const STORE_FETCH_LIMIT: usize = 50_000;

#[derive(Clone)]
pub struct AppState {
    pub reports_dir: PathBuf,
    pub slug_registry_path: PathBuf,
    pub store: Option<Arc<dyn PriceStore>>,
}

impl AppState {
    pub fn new(reports_dir: impl Into<PathBuf>, slug_registry_path: impl Into<PathBuf>) -> Self {
        Self {
            reports_dir: reports_dir.into(),
            slug_registry_path: slug_registry_path.into(),
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn PriceStore>) -> Self {
        self.store = Some(store);
        self
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/crops", get(crops_handler))
        .route("/api/unified", get(unified_handler))
        .route("/api/filters", get(filters_handler))
        .route("/api/summary", get(summary_handler))
        .route("/api/slugs", get(slugs_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("SCPD_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let config = scpd_sync::PipelineConfig::from_env();
    let mut state = AppState::new(config.reports_dir.clone(), config.slug_registry_path.clone());
    if config.store_url.is_some() {
        state = state.with_store(Arc::new(config.build_store()?));
    }
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[derive(Debug, Deserialize, Default)]
pub struct CropsQuery {
    pub commodity: Option<String>,
    pub variety: Option<String>,
    pub category: Option<String>,
    pub package: Option<String>,
    pub district: Option<String>,
    pub organic: Option<String>,
    pub date: Option<NaiveDate>,
    pub days: Option<i64>,
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

#[derive(Debug, Serialize)]
struct Page<T> {
    total: usize,
    page: usize,
    total_pages: usize,
    rows: Vec<T>,
}

#[derive(Debug, Serialize)]
struct FilterOptions {
    categories: Vec<String>,
    commodities: Vec<String>,
    varieties: Vec<String>,
    packages: Vec<String>,
    districts: Vec<String>,
    organics: Vec<String>,
}

#[derive(Debug, Serialize)]
struct PriceSummary {
    commodity: String,
    variety: Option<String>,
    avg_low_price: Option<f64>,
    avg_high_price: Option<f64>,
    count: usize,
    price_avg: Option<i64>,
}

async fn index_handler() -> Response {
    Json(json!({"message": "Specialty Crop Price Dashboard API"})).into_response()
}

async fn crops_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CropsQuery>,
) -> Response {
    match load_crop_prices(&state).await {
        Ok(rows) => {
            let latest = rows.iter().map(|r| r.report_date).max();
            let filtered: Vec<CropPriceRecord> = rows
                .into_iter()
                .filter(|r| crop_row_matches(r, &query, latest))
                .collect();
            Json(paginate(filtered, query.page, query.per_page)).into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn unified_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CropsQuery>,
) -> Response {
    match load_unified(&state).await {
        Ok(rows) => {
            let latest = rows.iter().map(|r| r.report_date).max();
            let filtered: Vec<UnifiedPriceRecord> = rows
                .into_iter()
                .filter(|r| unified_row_matches(r, &query, latest))
                .collect();
            Json(paginate(filtered, query.page, query.per_page)).into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn filters_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_crop_prices(&state).await {
        Ok(rows) => {
            let options = FilterOptions {
                categories: distinct(rows.iter().map(|r| Some(r.category.clone()))),
                commodities: distinct(rows.iter().map(|r| Some(r.commodity.clone()))),
                varieties: distinct(rows.iter().map(|r| r.variety.clone())),
                packages: distinct(rows.iter().map(|r| r.package.clone())),
                districts: distinct(rows.iter().map(|r| r.district.clone())),
                organics: distinct(rows.iter().map(|r| Some(r.organic.clone()))),
            };
            Json(options).into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn summary_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CropsQuery>,
) -> Response {
    match load_crop_prices(&state).await {
        Ok(rows) => {
            let latest = rows.iter().map(|r| r.report_date).max();
            let filtered: Vec<CropPriceRecord> = rows
                .into_iter()
                .filter(|r| crop_row_matches(r, &query, latest))
                .collect();
            Json(summarize(&filtered)).into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn slugs_handler(State(state): State<Arc<AppState>>) -> Response {
    match scpd_sync::load_slug_registry(&state.slug_registry_path) {
        Ok(registry) => Json::<Vec<SlugConfig>>(registry.slugs).into_response(),
        Err(err) => server_error(err),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": err.to_string()})),
    )
        .into_response()
}

fn eq_filter(filter: &Option<String>, value: Option<&str>) -> bool {
    match filter {
        None => true,
        Some(wanted) => value.is_some_and(|v| v.eq_ignore_ascii_case(wanted)),
    }
}

fn date_filter(
    query: &CropsQuery,
    report_date: NaiveDate,
    latest: Option<NaiveDate>,
) -> bool {
    if let Some(date) = query.date {
        return report_date == date;
    }
    match (query.days, latest) {
        (Some(days), Some(latest)) => report_date > latest - chrono::Duration::days(days),
        _ => true,
    }
}

fn crop_row_matches(
    row: &CropPriceRecord,
    query: &CropsQuery,
    latest: Option<NaiveDate>,
) -> bool {
    eq_filter(&query.commodity, Some(&row.commodity))
        && eq_filter(&query.variety, row.variety.as_deref())
        && eq_filter(&query.category, Some(&row.category))
        && eq_filter(&query.package, row.package.as_deref())
        && eq_filter(&query.district, row.district.as_deref())
        && eq_filter(&query.organic, Some(&row.organic))
        && date_filter(query, row.report_date, latest)
}

fn unified_row_matches(
    row: &UnifiedPriceRecord,
    query: &CropsQuery,
    latest: Option<NaiveDate>,
) -> bool {
    eq_filter(&query.commodity, Some(&row.commodity))
        && eq_filter(&query.variety, row.variety.as_deref())
        && eq_filter(&query.package, row.package.as_deref())
        && eq_filter(&query.district, row.district.as_deref())
        && date_filter(query, row.report_date, latest)
}

fn paginate<T>(rows: Vec<T>, page: Option<usize>, per_page: Option<usize>) -> Page<T> {
    let per_page = per_page.unwrap_or(50).max(1);
    let total = rows.len();
    let total_pages = total.max(1).div_ceil(per_page);
    let page = page.unwrap_or(1).clamp(1, total_pages);
    let start = (page - 1) * per_page;
    let rows = rows.into_iter().skip(start).take(per_page).collect();
    Page {
        total,
        page,
        total_pages,
        rows,
    }
}

fn distinct(values: impl Iterator<Item = Option<String>>) -> Vec<String> {
    let set: std::collections::BTreeSet<String> = values.flatten().collect();
    set.into_iter().collect()
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Group rows by (commodity, variety) and compute per-group price summaries.
/// The representative price averages each price field independently before
/// averaging the per-field means, then truncates to an integer.
fn summarize(rows: &[CropPriceRecord]) -> Vec<PriceSummary> {
    let mut groups: BTreeMap<(String, Option<String>), Vec<PriceFields>> = BTreeMap::new();
    for row in rows {
        groups
            .entry((row.commodity.clone(), row.variety.clone()))
            .or_default()
            .push(PriceFields {
                low_price: row.low_price,
                high_price: row.high_price,
                mostly_low_price: row.mostly_low_price,
                mostly_high_price: row.mostly_high_price,
            });
    }

    groups
        .into_iter()
        .map(|((commodity, variety), fields)| {
            let means = scpd_normalize::field_means(&fields);
            PriceSummary {
                commodity,
                variety,
                avg_low_price: means.low_price.map(round2),
                avg_high_price: means.high_price.map(round2),
                count: fields.len(),
                price_avg: aggregate_price_avg(&fields).map(|mean| mean as i64),
            }
        })
        .collect()
}

async fn load_crop_prices(state: &AppState) -> anyhow::Result<Vec<CropPriceRecord>> {
    load_rows(state, Collection::CropPrice, CROP_PRICES_JSON).await
}

async fn load_unified(state: &AppState) -> anyhow::Result<Vec<UnifiedPriceRecord>> {
    load_rows(state, Collection::Unified, UNIFIED_JSON).await
}

async fn load_rows<T: serde::de::DeserializeOwned>(
    state: &AppState,
    collection: Collection,
    snapshot_name: &str,
) -> anyhow::Result<Vec<T>> {
    if let Some(store) = &state.store {
        match store.fetch_rows(collection, "*", STORE_FETCH_LIMIT).await {
            Ok(rows) => {
                return Ok(rows
                    .into_iter()
                    .filter_map(|row| serde_json::from_value(row).ok())
                    .collect());
            }
            Err(err) => {
                warn!(error = %err, "store unreachable, falling back to latest snapshot");
            }
        }
    }
    load_snapshot_rows(&state.reports_dir, snapshot_name)
}

fn load_snapshot_rows<T: serde::de::DeserializeOwned>(
    reports_dir: &Path,
    snapshot_name: &str,
) -> anyhow::Result<Vec<T>> {
    let Some(run_dir) = latest_run_dir(reports_dir)? else {
        return Ok(Vec::new());
    };
    let path = run_dir.join("snapshots").join(snapshot_name);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = std::fs::read_to_string(&path)?;
    Ok(serde_json::from_str(&text)?)
}

fn latest_run_dir(reports_dir: &Path) -> anyhow::Result<Option<PathBuf>> {
    if !reports_dir.exists() {
        return Ok(None);
    }
    let mut dirs: Vec<std::fs::DirEntry> = std::fs::read_dir(reports_dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect();
    dirs.sort_by_key(|entry| entry.metadata().and_then(|m| m.modified()).ok());
    Ok(dirs.pop().map(|entry| entry.path()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn crop(commodity: &str, variety: Option<&str>, low: Option<f64>, high: Option<f64>) -> CropPriceRecord {
        CropPriceRecord {
            report_date: NaiveDate::from_ymd_opt(2025, 4, 1).unwrap(),
            market_type: Some("Terminal".to_string()),
            market_location_name: None,
            district: Some("Salinas District".to_string()),
            origin: None,
            category: "Vegetables".to_string(),
            commodity: commodity.to_string(),
            variety: variety.map(str::to_string),
            package: Some("25 Lb Cartons".to_string()),
            item_size: None,
            organic: "no".to_string(),
            low_price: low,
            high_price: high,
            mostly_low_price: None,
            mostly_high_price: None,
            wtd_avg_price: None,
            market_tone_comments: None,
            supply_tone_comments: None,
            demand_tone_comments: None,
        }
    }

    fn unified(commodity: &str) -> UnifiedPriceRecord {
        UnifiedPriceRecord {
            report_date: NaiveDate::from_ymd_opt(2025, 4, 1).unwrap(),
            market_type: Some("Terminal".to_string()),
            district: None,
            commodity: commodity.to_string(),
            variety: None,
            package: None,
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

    fn state_with_snapshot(
        dir: &Path,
        crops: &[CropPriceRecord],
        unified_rows: &[UnifiedPriceRecord],
    ) -> AppState {
        let reports_dir = dir.join("reports");
        let run_dir = reports_dir.join("run-1");
        scpd_sync::snapshot::write_snapshots(&run_dir, crops, unified_rows).unwrap();
        let slugs_path = dir.join("slugs.yaml");
        std::fs::write(
            &slugs_path,
            "slugs:\n  - slug_id: \"2306\"\n    display_name: Terminal Market Vegetables\n    enabled: true\n",
        )
        .unwrap();
        AppState::new(reports_dir, slugs_path)
    }

    async fn get_json(app: Router, uri: &str) -> serde_json::Value {
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn index_returns_the_service_banner() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(state_with_snapshot(dir.path(), &[], &[]));
        let body = get_json(app, "/").await;
        assert!(body["message"].as_str().unwrap().contains("Specialty Crop"));
    }

    #[tokio::test]
    async fn crops_filter_by_commodity_and_paginate() {
        let dir = tempfile::tempdir().unwrap();
        let crops = vec![
            crop("Tomatoes", Some("Vine Ripes"), Some(18.5), Some(24.5)),
            crop("Kale Greens", None, Some(14.0), Some(16.0)),
        ];
        let app = app(state_with_snapshot(dir.path(), &crops, &[]));
        let body = get_json(app, "/api/crops?commodity=tomatoes").await;
        assert_eq!(body["total"], json!(1));
        assert_eq!(body["rows"][0]["commodity"], json!("Tomatoes"));
    }

    #[tokio::test]
    async fn unified_endpoint_serves_the_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(state_with_snapshot(dir.path(), &[], &[unified("Tomatoes")]));
        let body = get_json(app, "/api/unified").await;
        assert_eq!(body["total"], json!(1));
        assert_eq!(body["rows"][0]["price_avg"], json!(20));
    }

    #[tokio::test]
    async fn filters_list_distinct_sorted_values() {
        let dir = tempfile::tempdir().unwrap();
        let crops = vec![
            crop("Tomatoes", Some("Vine Ripes"), None, None),
            crop("Kale Greens", None, None, None),
            crop("Tomatoes", Some("Vine Ripes"), None, None),
        ];
        let app = app(state_with_snapshot(dir.path(), &crops, &[]));
        let body = get_json(app, "/api/filters").await;
        assert_eq!(body["commodities"], json!(["Kale Greens", "Tomatoes"]));
        assert_eq!(body["varieties"], json!(["Vine Ripes"]));
        assert_eq!(body["organics"], json!(["no"]));
    }

    #[tokio::test]
    async fn summary_groups_and_truncates_the_representative_price() {
        let dir = tempfile::tempdir().unwrap();
        let crops = vec![
            crop("Tomatoes", Some("Vine Ripes"), Some(10.0), Some(40.0)),
            crop("Tomatoes", Some("Vine Ripes"), Some(20.0), None),
        ];
        let app = app(state_with_snapshot(dir.path(), &crops, &[]));
        let body = get_json(app, "/api/summary").await;
        // low mean 15, high mean 40 -> aggregate 27.5 -> truncated 27
        assert_eq!(body[0]["avg_low_price"], json!(15.0));
        assert_eq!(body[0]["avg_high_price"], json!(40.0));
        assert_eq!(body[0]["count"], json!(2));
        assert_eq!(body[0]["price_avg"], json!(27));
    }

    #[tokio::test]
    async fn slugs_endpoint_reads_the_registry() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(state_with_snapshot(dir.path(), &[], &[]));
        let body = get_json(app, "/api/slugs").await;
        assert_eq!(body[0]["slug_id"], json!("2306"));
    }

    #[tokio::test]
    async fn empty_reports_directory_serves_empty_pages() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::new(dir.path().join("reports"), dir.path().join("slugs.yaml"));
        let body = get_json(app(state), "/api/crops").await;
        assert_eq!(body["total"], json!(0));
        assert_eq!(body["rows"], json!([]));
    }
}
