//! Sink client for the two destination collections.
//!
//! The pipeline only ever sees the [`PriceStore`] trait (clear-all,
//! bulk-insert, point-update, plus the filtered reads the dashboard layer
//! uses); the hosted implementation speaks PostgREST conventions over
//! `reqwest`. The store is constructed explicitly and passed by reference
//! into the pipeline for the duration of one run.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "scpd-storage";

/// The two destination collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    CropPrice,
    Unified,
}

impl Collection {
    pub fn table_name(&self) -> &'static str {
        match self {
            Self::CropPrice => "CropPrice",
            Self::Unified => "UnifiedCropPrice",
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("store returned status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// The three sink operations the pipeline depends on, plus the filtered
/// reads used by the enrichment pass and the dashboard layer.
#[async_trait]
pub trait PriceStore: Send + Sync {
    async fn clear(&self, collection: Collection) -> Result<(), StoreError>;

    async fn insert_batch(
        &self,
        collection: Collection,
        rows: Vec<JsonValue>,
    ) -> Result<(), StoreError>;

    async fn update_row(
        &self,
        collection: Collection,
        id: i64,
        patch: JsonValue,
    ) -> Result<(), StoreError>;

    async fn fetch_rows(
        &self,
        collection: Collection,
        select: &str,
        limit: usize,
    ) -> Result<Vec<JsonValue>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct RestStoreConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

/// Hosted collection store speaking PostgREST conventions: delete with an
/// always-true id filter for clear-all, JSON-array POST for bulk insert,
/// `id=eq.N` PATCH for point updates.
#[derive(Debug)]
pub struct RestStore {
    client: reqwest::Client,
    config: RestStoreConfig,
}

impl RestStore {
    pub fn new(config: RestStoreConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .timeout(config.timeout)
            .build()
            .context("building store http client")?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, collection: Collection) -> String {
        format!(
            "{}/rest/v1/{}",
            self.config.base_url.trim_end_matches('/'),
            collection.table_name()
        )
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.config.api_key)
            .bearer_auth(&self.config.api_key)
    }

    /// Send with retry on transient failures; non-success terminal statuses
    /// surface as [`StoreError::HttpStatus`].
    async fn execute<F>(&self, build: F) -> Result<(), StoreError>
    where
        F: Fn() -> RequestBuilder,
    {
        self.execute_raw(build).await.map(|_| ())
    }

    async fn execute_raw<F>(&self, build: F) -> Result<reqwest::Response, StoreError>
    where
        F: Fn() -> RequestBuilder,
    {
        let backoff = self.config.backoff;
        let mut last_error: Option<reqwest::Error> = None;

        for attempt in 0..=backoff.max_retries {
            match self.authorize(build()).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }
                    let url = resp.url().to_string();
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < backoff.max_retries
                    {
                        warn!(%status, %url, attempt, "retrying store request");
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(StoreError::HttpStatus {
                        status: status.as_u16(),
                        url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < backoff.max_retries
                    {
                        last_error = Some(err);
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(StoreError::Request(err));
                }
            }
        }

        Err(StoreError::Request(
            last_error.expect("retry loop always records the last request error"),
        ))
    }
}

#[async_trait]
impl PriceStore for RestStore {
    async fn clear(&self, collection: Collection) -> Result<(), StoreError> {
        debug!(table = collection.table_name(), "clearing collection");
        let url = self.endpoint(collection);
        self.execute(|| self.client.delete(&url).query(&[("id", "gte.0")]))
            .await
    }

    async fn insert_batch(
        &self,
        collection: Collection,
        rows: Vec<JsonValue>,
    ) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let url = self.endpoint(collection);
        let body = JsonValue::Array(rows);
        self.execute(|| {
            self.client
                .post(&url)
                .header("Prefer", "return=minimal")
                .json(&body)
        })
        .await
    }

    async fn update_row(
        &self,
        collection: Collection,
        id: i64,
        patch: JsonValue,
    ) -> Result<(), StoreError> {
        let url = self.endpoint(collection);
        let id_filter = format!("eq.{id}");
        self.execute(|| {
            self.client
                .patch(&url)
                .query(&[("id", id_filter.as_str())])
                .json(&patch)
        })
        .await
    }

    async fn fetch_rows(
        &self,
        collection: Collection,
        select: &str,
        limit: usize,
    ) -> Result<Vec<JsonValue>, StoreError> {
        let url = self.endpoint(collection);
        let limit = limit.to_string();
        let resp = self
            .execute_raw(|| {
                self.client.get(&url).query(&[
                    ("select", select),
                    ("order", "id.asc"),
                    ("limit", limit.as_str()),
                ])
            })
            .await?;
        Ok(resp.json().await?)
    }
}

/// In-memory store for tests and dry runs. Assigns ids on insert the way
/// the hosted store does.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<Collection, Vec<JsonValue>>>,
    next_id: Mutex<i64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full contents of a collection, for assertions.
    pub fn rows(&self, collection: Collection) -> Vec<JsonValue> {
        self.collections
            .lock()
            .expect("memory store lock")
            .get(&collection)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl PriceStore for MemoryStore {
    async fn clear(&self, collection: Collection) -> Result<(), StoreError> {
        self.collections
            .lock()
            .expect("memory store lock")
            .remove(&collection);
        Ok(())
    }

    async fn insert_batch(
        &self,
        collection: Collection,
        rows: Vec<JsonValue>,
    ) -> Result<(), StoreError> {
        let mut collections = self.collections.lock().expect("memory store lock");
        let mut next_id = self.next_id.lock().expect("memory store lock");
        let target = collections.entry(collection).or_default();
        for mut row in rows {
            if let Some(object) = row.as_object_mut() {
                *next_id += 1;
                object.insert("id".to_string(), JsonValue::from(*next_id));
            }
            target.push(row);
        }
        Ok(())
    }

    async fn update_row(
        &self,
        collection: Collection,
        id: i64,
        patch: JsonValue,
    ) -> Result<(), StoreError> {
        let mut collections = self.collections.lock().expect("memory store lock");
        let Some(rows) = collections.get_mut(&collection) else {
            return Ok(());
        };
        for row in rows {
            if row.get("id").and_then(JsonValue::as_i64) == Some(id) {
                if let (Some(object), Some(fields)) = (row.as_object_mut(), patch.as_object()) {
                    for (key, value) in fields {
                        object.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        Ok(())
    }

    async fn fetch_rows(
        &self,
        collection: Collection,
        select: &str,
        limit: usize,
    ) -> Result<Vec<JsonValue>, StoreError> {
        let rows = self.rows(collection);
        if select.trim() == "*" {
            return Ok(rows.into_iter().take(limit).collect());
        }
        let wanted: Vec<&str> = select.split(',').map(str::trim).collect();
        Ok(rows
            .into_iter()
            .take(limit)
            .map(|row| {
                let Some(object) = row.as_object() else {
                    return row;
                };
                let projected = object
                    .iter()
                    .filter(|(key, _)| wanted.contains(&key.as_str()))
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect();
                JsonValue::Object(projected)
            })
            .collect())
    }
}
