//! USDA MARS report fetcher: pulls recent report data per slug and writes
//! the `<slug>_recent.csv` files the pipeline ingests.
//!
//! MARS responses nest result rows under arbitrarily deep `sections`; rows
//! are flattened with top-level report metadata propagated into each row,
//! and a report date recovered from any nested result when the report root
//! lacks one.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::{info, warn};

use crate::SlugConfig;

pub const MARS_BASE_URL: &str = "https://marsapi.ams.usda.gov/services/v1.2/reports";

/// Fixed inter-request delay the MARS API expects.
pub const REQUEST_DELAY: Duration = Duration::from_secs(1);

/// Report metadata propagated from the report root into each result row.
const TOP_LEVEL_KEYS: &[&str] = &[
    "report_date",
    "market_type",
    "slug_id",
    "slug_name",
    "report_title",
    "published_date",
    "report_begin_date",
    "report_end_date",
];

const DATE_KEYS: &[&str] = &[
    "report_date",
    "report_end_date",
    "report_begin_date",
    "published_date",
];

#[derive(Debug, Default)]
pub struct FetchSummary {
    pub slugs_requested: usize,
    pub slugs_fetched: usize,
    pub rows_total: usize,
    pub files: Vec<PathBuf>,
}

pub struct MarsClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl MarsClient {
    pub fn new(api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .timeout(timeout)
            .build()
            .context("building MARS http client")?;
        Ok(Self {
            client,
            base_url: MARS_BASE_URL.to_string(),
            api_key,
        })
    }

    /// Fetch a `published_date` window (now - days .. now) for every enabled
    /// slug and write one CSV per slug. A failing slug is skipped, never
    /// fatal for the rest of the pull.
    pub async fn fetch_recent(
        &self,
        slugs: &[SlugConfig],
        days: i64,
        out_dir: &Path,
    ) -> Result<FetchSummary> {
        std::fs::create_dir_all(out_dir)
            .with_context(|| format!("creating {}", out_dir.display()))?;

        let end = chrono::Utc::now().date_naive();
        let start = end - chrono::Duration::days(days);
        let window = format!(
            "published_date={}:{}",
            start.format("%m/%d/%Y"),
            end.format("%m/%d/%Y")
        );

        let mut summary = FetchSummary::default();
        for slug in slugs.iter().filter(|s| s.enabled) {
            summary.slugs_requested += 1;
            match self.fetch_slug(&slug.slug_id, &window).await {
                Ok(Some(rows)) if !rows.is_empty() => {
                    let path = out_dir.join(format!("{}_recent.csv", slug.slug_id));
                    let written = write_rows_csv(&path, &rows)?;
                    info!(slug = %slug.slug_id, rows = written, file = %path.display(), "fetched report");
                    summary.slugs_fetched += 1;
                    summary.rows_total += written;
                    summary.files.push(path);
                }
                Ok(_) => info!(slug = %slug.slug_id, "no data rows returned"),
                Err(err) => warn!(slug = %slug.slug_id, error = %err, "skipping slug"),
            }
            tokio::time::sleep(REQUEST_DELAY).await;
        }
        Ok(summary)
    }

    async fn fetch_slug(
        &self,
        slug_id: &str,
        window: &str,
    ) -> Result<Option<Vec<JsonMap<String, JsonValue>>>> {
        let url = format!("{}/{}", self.base_url, slug_id);
        let mut request = self
            .client
            .get(&url)
            .query(&[("q", window), ("allSections", "true")]);
        if let Some(key) = &self.api_key {
            request = request.basic_auth(key, Some(""));
        }

        let response = request.send().await.context("requesting report")?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("MARS returned status {status}");
        }

        let body: JsonValue = response.json().await.context("decoding report JSON")?;
        if let Some(text) = body.as_str() {
            if text.contains("Invalid slug") {
                return Ok(None);
            }
        }
        Ok(Some(flatten_sections(&body)))
    }
}

/// Flatten a MARS response into result rows, propagating report metadata
/// down and tagging each row with the section it came from.
pub fn flatten_sections(response: &JsonValue) -> Vec<JsonMap<String, JsonValue>> {
    let mut rows = Vec::new();
    match response {
        JsonValue::Array(items) => {
            for item in items {
                flatten_report(item, &mut rows);
            }
        }
        JsonValue::Object(_) => flatten_report(response, &mut rows),
        _ => {}
    }
    rows
}

fn flatten_report(report: &JsonValue, rows: &mut Vec<JsonMap<String, JsonValue>>) {
    let mut meta = report_meta(report);
    if !meta.contains_key("report_date") {
        if let Some(date) = find_date_in_any_result(report) {
            meta.insert("report_date".to_string(), date);
        }
    }
    flatten_node(report, &meta, rows);
}

fn flatten_node(
    node: &JsonValue,
    inherited: &JsonMap<String, JsonValue>,
    rows: &mut Vec<JsonMap<String, JsonValue>>,
) {
    let mut local = inherited.clone();
    for (key, value) in report_meta(node) {
        local.insert(key, value);
    }

    if let Some(results) = node.get("results").and_then(JsonValue::as_array) {
        let section = node
            .get("reportSection")
            .and_then(JsonValue::as_str)
            .unwrap_or("UNKNOWN");
        for result in results {
            let Some(result) = result.as_object() else {
                continue;
            };
            let mut row = result.clone();
            for (key, value) in &local {
                let missing = match row.get(key) {
                    None | Some(JsonValue::Null) => true,
                    Some(JsonValue::String(s)) => s.is_empty(),
                    Some(_) => false,
                };
                if missing {
                    row.insert(key.clone(), value.clone());
                }
            }
            row.insert("_section".to_string(), JsonValue::from(section));
            rows.push(row);
        }
    }

    if let Some(sections) = node.get("sections").and_then(JsonValue::as_array) {
        for sub in sections {
            flatten_node(sub, &local, rows);
        }
    }
}

fn report_meta(node: &JsonValue) -> JsonMap<String, JsonValue> {
    let mut meta = JsonMap::new();
    for key in TOP_LEVEL_KEYS {
        match node.get(*key) {
            None | Some(JsonValue::Null) => {}
            Some(JsonValue::String(s)) if s.is_empty() => {}
            Some(value) => {
                meta.insert((*key).to_string(), value.clone());
            }
        }
    }
    meta
}

fn find_date_in_any_result(node: &JsonValue) -> Option<JsonValue> {
    if let Some(results) = node.get("results").and_then(JsonValue::as_array) {
        for result in results {
            for key in DATE_KEYS {
                match result.get(*key) {
                    None | Some(JsonValue::Null) => {}
                    Some(value) => return Some(value.clone()),
                }
            }
        }
    }
    if let Some(sections) = node.get("sections").and_then(JsonValue::as_array) {
        for sub in sections {
            if let Some(date) = find_date_in_any_result(sub) {
                return Some(date);
            }
        }
    }
    None
}

/// Write flattened rows as CSV with a sorted union header, so output is
/// byte-stable for a given response.
pub fn write_rows_csv(path: &Path, rows: &[JsonMap<String, JsonValue>]) -> Result<usize> {
    let headers: Vec<String> = rows
        .iter()
        .flat_map(|row| row.keys().cloned())
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();

    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("creating {}", path.display()))?;
    writer.write_record(&headers).context("writing CSV header")?;
    for row in rows {
        let record: Vec<String> = headers
            .iter()
            .map(|header| row.get(header).map(cell_text).unwrap_or_default())
            .collect();
        writer.write_record(&record).context("writing CSV row")?;
    }
    writer.flush().context("flushing CSV writer")?;
    Ok(rows.len())
}

fn cell_text(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_report() -> JsonValue {
        json!({
            "report_date": "04/01/2025",
            "market_type": "Shipping Point",
            "slug_id": "2391",
            "sections": [
                {
                    "reportSection": "FOB",
                    "results": [
                        {"commodity": "TOMATOES", "var": "VINE RIPE", "low_price": "18.50"},
                        {"commodity": "PEPPERS", "report_date": "04/02/2025"}
                    ]
                }
            ]
        })
    }

    #[test]
    fn metadata_propagates_without_clobbering_row_values() {
        let rows = flatten_sections(&sample_report());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["report_date"], json!("04/01/2025"));
        assert_eq!(rows[0]["market_type"], json!("Shipping Point"));
        assert_eq!(rows[0]["_section"], json!("FOB"));
        // the row's own date wins over the propagated one
        assert_eq!(rows[1]["report_date"], json!("04/02/2025"));
    }

    #[test]
    fn missing_report_date_is_recovered_from_nested_results() {
        let report = json!({
            "market_type": "Terminal",
            "sections": [
                {"results": [{"commodity": "KALE", "report_end_date": "03/30/2025"}]}
            ]
        });
        let rows = flatten_sections(&report);
        assert_eq!(rows[0]["report_date"], json!("03/30/2025"));
    }

    #[test]
    fn csv_output_uses_a_sorted_union_header() {
        let rows = flatten_sections(&sample_report());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("2391_recent.csv");
        let written = write_rows_csv(&path, &rows).unwrap();
        assert_eq!(written, 2);

        let text = std::fs::read_to_string(&path).unwrap();
        let header = text.lines().next().unwrap();
        assert_eq!(
            header,
            "_section,commodity,low_price,market_type,report_date,slug_id,var"
        );
        assert!(text.contains("TOMATOES"));
    }
}
