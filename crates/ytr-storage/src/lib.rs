//! Storage collaborator seam: row-oriented CRUD traits, a PostgREST-style
//! HTTP client, and an in-memory store for tests and local runs.
//!
//! No multi-statement transactions are assumed anywhere; consistency is the
//! ledger protocol's job, not the store's.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;
use ytr_core::{Credential, IngestStatus, Job, JobStatus, LedgerEntry, MetricRow};

pub const CRATE_NAME: &str = "ytr-storage";

/// Content checksum over raw report bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("storage rejected request: http {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("row not found: {0}")]
    NotFound(String),
    #[error("decoding storage row: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Delegated-credential persistence exposed by the identity collaborator.
/// The token refresher is the only writer.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, user_id: &str) -> StorageResult<Option<Credential>>;
    async fn put(&self, credential: &Credential) -> StorageResult<()>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: &Job) -> StorageResult<()>;
    async fn find(&self, job_id: &str) -> StorageResult<Option<Job>>;
    async fn list_all(&self) -> StorageResult<Vec<Job>>;
    async fn list_refreshed_before(&self, cutoff: DateTime<Utc>) -> StorageResult<Vec<Job>>;
    async fn update_metadata(
        &self,
        job_id: &str,
        name: &str,
        report_type_id: &str,
        refreshed_at: DateTime<Utc>,
    ) -> StorageResult<()>;
    async fn mark_inactive(&self, job_id: &str) -> StorageResult<()>;
}

/// The idempotency ledger, keyed by `(user_id, job_id, report_id)`.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn find(
        &self,
        user_id: &str,
        job_id: &str,
        report_id: &str,
    ) -> StorageResult<Option<LedgerEntry>>;

    /// Atomic insert-or-update on the natural key: the "claim" step of the
    /// ingestion protocol. Two concurrent sweeps claiming the same report
    /// converge on one row. Returns the stored entry.
    async fn upsert_pending(&self, entry: &LedgerEntry) -> StorageResult<LedgerEntry>;

    async fn mark_parsed(&self, id: Uuid, processed_at: DateTime<Utc>) -> StorageResult<()>;
    async fn mark_error(&self, id: Uuid, message: &str, attempts: u32) -> StorageResult<()>;
}

#[async_trait]
pub trait MetricsStore: Send + Sync {
    async fn delete_for_entry(&self, ledger_entry_id: Uuid) -> StorageResult<()>;

    /// One storage request per call; batching is the writer's concern.
    async fn insert(&self, rows: &[MetricRow]) -> StorageResult<()>;
}

#[derive(Debug, Clone)]
pub struct DailyMetricsQuery {
    pub user_id: String,
    pub job_id: String,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub limit: usize,
}

impl DailyMetricsQuery {
    pub fn new(user_id: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            job_id: job_id.into(),
            start_date: None,
            end_date: None,
            limit: 100,
        }
    }
}

/// Read surface for interactive daily-metric lookups.
#[async_trait]
pub trait MetricsQuery: Send + Sync {
    async fn daily_metrics(&self, query: &DailyMetricsQuery) -> StorageResult<Vec<MetricRow>>;
}

const CREDENTIALS_TABLE: &str = "user_credentials";
const JOBS_TABLE: &str = "youtube_jobs";
const LEDGER_TABLE: &str = "youtube_report_files";
const METRICS_TABLE: &str = "youtube_daily_metrics";

const LEDGER_CONFLICT_KEY: &str = "user_id,job_id,report_id";
const UPSERT_PREFER: &str = "resolution=merge-duplicates,return=representation";

#[derive(Debug, Clone)]
pub struct RestConfig {
    pub base_url: String,
    pub service_key: String,
    pub timeout: Duration,
}

/// PostgREST row client. Filters are `eq.`/`gte.`/`lte.` query parameters,
/// upserts POST with an explicit `on_conflict` target and a
/// merge-duplicates `Prefer` header.
#[derive(Debug, Clone)]
pub struct RestStore {
    http: reqwest::Client,
    base_url: String,
}

impl RestStore {
    pub fn new(config: RestConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", config.service_key))
            .context("building storage authorization header")?;
        bearer.set_sensitive(true);
        headers.insert(AUTHORIZATION, bearer);
        let mut apikey = HeaderValue::from_str(&config.service_key)
            .context("building storage apikey header")?;
        apikey.set_sensitive(true);
        headers.insert("apikey", apikey);

        let http = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .context("building storage http client")?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{}", self.base_url, table)
    }

    async fn expect_ok(response: reqwest::Response) -> StorageResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(StorageError::Rejected {
            status: status.as_u16(),
            body,
        })
    }

    async fn select<T: serde::de::DeserializeOwned>(
        &self,
        table: &str,
        params: &[(String, String)],
    ) -> StorageResult<Vec<T>> {
        let response = self
            .http
            .get(self.table_url(table))
            .query(params)
            .send()
            .await?;
        let response = Self::expect_ok(response).await?;
        Ok(response.json().await?)
    }

    async fn insert_rows<T: serde::Serialize>(&self, table: &str, rows: &T) -> StorageResult<()> {
        let response = self.http.post(self.table_url(table)).json(rows).send().await?;
        Self::expect_ok(response).await?;
        Ok(())
    }

    async fn update_rows(
        &self,
        table: &str,
        params: &[(String, String)],
        patch: &serde_json::Value,
    ) -> StorageResult<()> {
        let response = self
            .http
            .patch(self.table_url(table))
            .query(params)
            .json(patch)
            .send()
            .await?;
        Self::expect_ok(response).await?;
        Ok(())
    }
}

fn eq(column: &str, value: &str) -> (String, String) {
    (column.to_string(), format!("eq.{value}"))
}

fn daily_metrics_params(query: &DailyMetricsQuery) -> Vec<(String, String)> {
    let mut params = vec![
        eq("user_id", &query.user_id),
        eq("job_id", &query.job_id),
        ("order".to_string(), "report_date.desc".to_string()),
        ("limit".to_string(), query.limit.to_string()),
    ];
    if let Some(start) = &query.start_date {
        params.push(("report_date".to_string(), format!("gte.{start}")));
    }
    if let Some(end) = &query.end_date {
        params.push(("report_date".to_string(), format!("lte.{end}")));
    }
    params
}

#[async_trait]
impl CredentialStore for RestStore {
    async fn get(&self, user_id: &str) -> StorageResult<Option<Credential>> {
        let params = vec![eq("user_id", user_id), ("limit".to_string(), "1".to_string())];
        let rows: Vec<Credential> = self.select(CREDENTIALS_TABLE, &params).await?;
        Ok(rows.into_iter().next())
    }

    async fn put(&self, credential: &Credential) -> StorageResult<()> {
        let response = self
            .http
            .post(self.table_url(CREDENTIALS_TABLE))
            .query(&[("on_conflict", "user_id")])
            .header("Prefer", "resolution=merge-duplicates")
            .json(&[credential])
            .send()
            .await?;
        Self::expect_ok(response).await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for RestStore {
    async fn insert(&self, job: &Job) -> StorageResult<()> {
        self.insert_rows(JOBS_TABLE, &[job]).await
    }

    async fn find(&self, job_id: &str) -> StorageResult<Option<Job>> {
        let params = vec![eq("job_id", job_id), ("limit".to_string(), "1".to_string())];
        let rows: Vec<Job> = self.select(JOBS_TABLE, &params).await?;
        Ok(rows.into_iter().next())
    }

    async fn list_all(&self) -> StorageResult<Vec<Job>> {
        let params = vec![("order".to_string(), "create_time.asc".to_string())];
        self.select(JOBS_TABLE, &params).await
    }

    async fn list_refreshed_before(&self, cutoff: DateTime<Utc>) -> StorageResult<Vec<Job>> {
        let params = vec![(
            "last_refreshed".to_string(),
            format!("lte.{}", cutoff.to_rfc3339()),
        )];
        self.select(JOBS_TABLE, &params).await
    }

    async fn update_metadata(
        &self,
        job_id: &str,
        name: &str,
        report_type_id: &str,
        refreshed_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        debug!(job_id, "updating job metadata");
        self.update_rows(
            JOBS_TABLE,
            &[eq("job_id", job_id)],
            &serde_json::json!({
                "name": name,
                "report_type_id": report_type_id,
                "last_refreshed": refreshed_at,
            }),
        )
        .await
    }

    async fn mark_inactive(&self, job_id: &str) -> StorageResult<()> {
        self.update_rows(
            JOBS_TABLE,
            &[eq("job_id", job_id)],
            &serde_json::json!({
                "status": "inactive",
                "last_refreshed": Utc::now(),
            }),
        )
        .await
    }
}

#[async_trait]
impl LedgerStore for RestStore {
    async fn find(
        &self,
        user_id: &str,
        job_id: &str,
        report_id: &str,
    ) -> StorageResult<Option<LedgerEntry>> {
        let params = vec![
            eq("user_id", user_id),
            eq("job_id", job_id),
            eq("report_id", report_id),
            ("limit".to_string(), "1".to_string()),
        ];
        let rows: Vec<LedgerEntry> = self.select(LEDGER_TABLE, &params).await?;
        Ok(rows.into_iter().next())
    }

    async fn upsert_pending(&self, entry: &LedgerEntry) -> StorageResult<LedgerEntry> {
        let response = self
            .http
            .post(self.table_url(LEDGER_TABLE))
            .query(&[("on_conflict", LEDGER_CONFLICT_KEY)])
            .header("Prefer", UPSERT_PREFER)
            .json(&[entry])
            .send()
            .await?;
        let response = Self::expect_ok(response).await?;
        let rows: Vec<LedgerEntry> = response.json().await?;
        rows.into_iter().next().ok_or_else(|| {
            StorageError::NotFound(format!(
                "ledger upsert returned no row for report {}",
                entry.report_id
            ))
        })
    }

    async fn mark_parsed(&self, id: Uuid, processed_at: DateTime<Utc>) -> StorageResult<()> {
        self.update_rows(
            LEDGER_TABLE,
            &[eq("id", &id.to_string())],
            &serde_json::json!({
                "status": "parsed",
                "processed_at": processed_at,
                "error_message": null,
            }),
        )
        .await
    }

    async fn mark_error(&self, id: Uuid, message: &str, attempts: u32) -> StorageResult<()> {
        self.update_rows(
            LEDGER_TABLE,
            &[eq("id", &id.to_string())],
            &serde_json::json!({
                "status": "error",
                "error_message": message,
                "attempts": attempts,
            }),
        )
        .await
    }
}

#[async_trait]
impl MetricsStore for RestStore {
    async fn delete_for_entry(&self, ledger_entry_id: Uuid) -> StorageResult<()> {
        let response = self
            .http
            .delete(self.table_url(METRICS_TABLE))
            .query(&[eq("ledger_entry_id", &ledger_entry_id.to_string())])
            .send()
            .await?;
        Self::expect_ok(response).await?;
        Ok(())
    }

    async fn insert(&self, rows: &[MetricRow]) -> StorageResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        self.insert_rows(METRICS_TABLE, &rows).await
    }
}

#[async_trait]
impl MetricsQuery for RestStore {
    async fn daily_metrics(&self, query: &DailyMetricsQuery) -> StorageResult<Vec<MetricRow>> {
        self.select(METRICS_TABLE, &daily_metrics_params(query)).await
    }
}

/// In-memory implementation of every storage trait. One mutex over all
/// tables gives the same claim semantics the REST upsert provides.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    credentials: HashMap<String, Credential>,
    jobs: Vec<Job>,
    ledger: HashMap<(String, String, String), LedgerEntry>,
    metrics: Vec<MetricRow>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn get(&self, user_id: &str) -> StorageResult<Option<Credential>> {
        Ok(self.inner.lock().await.credentials.get(user_id).cloned())
    }

    async fn put(&self, credential: &Credential) -> StorageResult<()> {
        self.inner
            .lock()
            .await
            .credentials
            .insert(credential.user_id.clone(), credential.clone());
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert(&self, job: &Job) -> StorageResult<()> {
        self.inner.lock().await.jobs.push(job.clone());
        Ok(())
    }

    async fn find(&self, job_id: &str) -> StorageResult<Option<Job>> {
        Ok(self
            .inner
            .lock()
            .await
            .jobs
            .iter()
            .find(|job| job.job_id == job_id)
            .cloned())
    }

    async fn list_all(&self) -> StorageResult<Vec<Job>> {
        Ok(self.inner.lock().await.jobs.clone())
    }

    async fn list_refreshed_before(&self, cutoff: DateTime<Utc>) -> StorageResult<Vec<Job>> {
        Ok(self
            .inner
            .lock()
            .await
            .jobs
            .iter()
            .filter(|job| job.last_refreshed.is_some_and(|at| at <= cutoff))
            .cloned()
            .collect())
    }

    async fn update_metadata(
        &self,
        job_id: &str,
        name: &str,
        report_type_id: &str,
        refreshed_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let mut inner = self.inner.lock().await;
        for job in inner.jobs.iter_mut().filter(|job| job.job_id == job_id) {
            job.name = name.to_string();
            job.report_type_id = report_type_id.to_string();
            job.last_refreshed = Some(refreshed_at);
        }
        Ok(())
    }

    async fn mark_inactive(&self, job_id: &str) -> StorageResult<()> {
        let mut inner = self.inner.lock().await;
        for job in inner.jobs.iter_mut().filter(|job| job.job_id == job_id) {
            job.status = JobStatus::Inactive;
            job.last_refreshed = Some(Utc::now());
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn find(
        &self,
        user_id: &str,
        job_id: &str,
        report_id: &str,
    ) -> StorageResult<Option<LedgerEntry>> {
        let key = (user_id.to_string(), job_id.to_string(), report_id.to_string());
        Ok(self.inner.lock().await.ledger.get(&key).cloned())
    }

    async fn upsert_pending(&self, entry: &LedgerEntry) -> StorageResult<LedgerEntry> {
        let key = (
            entry.user_id.clone(),
            entry.job_id.clone(),
            entry.report_id.clone(),
        );
        let mut inner = self.inner.lock().await;
        let stored = inner
            .ledger
            .entry(key)
            .and_modify(|existing| {
                // The natural key wins: a concurrent claim keeps the first
                // row's id so metric rows stay attached.
                existing.start_time = entry.start_time;
                existing.end_time = entry.end_time;
                existing.checksum = entry.checksum.clone();
                existing.status = IngestStatus::Pending;
                existing.attempts = entry.attempts;
                existing.processed_at = None;
                existing.error_message = None;
            })
            .or_insert_with(|| entry.clone());
        Ok(stored.clone())
    }

    async fn mark_parsed(&self, id: Uuid, processed_at: DateTime<Utc>) -> StorageResult<()> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .ledger
            .values_mut()
            .find(|entry| entry.id == id)
            .ok_or_else(|| StorageError::NotFound(format!("ledger entry {id}")))?;
        entry.status = IngestStatus::Parsed;
        entry.processed_at = Some(processed_at);
        entry.error_message = None;
        Ok(())
    }

    async fn mark_error(&self, id: Uuid, message: &str, attempts: u32) -> StorageResult<()> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .ledger
            .values_mut()
            .find(|entry| entry.id == id)
            .ok_or_else(|| StorageError::NotFound(format!("ledger entry {id}")))?;
        entry.status = IngestStatus::Error;
        entry.error_message = Some(message.to_string());
        entry.attempts = attempts;
        Ok(())
    }
}

#[async_trait]
impl MetricsStore for MemoryStore {
    async fn delete_for_entry(&self, ledger_entry_id: Uuid) -> StorageResult<()> {
        self.inner
            .lock()
            .await
            .metrics
            .retain(|row| row.ledger_entry_id != ledger_entry_id);
        Ok(())
    }

    async fn insert(&self, rows: &[MetricRow]) -> StorageResult<()> {
        self.inner.lock().await.metrics.extend_from_slice(rows);
        Ok(())
    }
}

#[async_trait]
impl MetricsQuery for MemoryStore {
    async fn daily_metrics(&self, query: &DailyMetricsQuery) -> StorageResult<Vec<MetricRow>> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<MetricRow> = inner
            .metrics
            .iter()
            .filter(|row| row.user_id == query.user_id && row.job_id == query.job_id)
            .filter(|row| {
                query
                    .start_date
                    .as_deref()
                    .map_or(true, |start| row.report_date.as_str() >= start)
            })
            .filter(|row| {
                query
                    .end_date
                    .as_deref()
                    .map_or(true, |end| row.report_date.as_str() <= end)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.report_date.cmp(&a.report_date));
        rows.truncate(query.limit);
        Ok(rows)
    }
}
