//! Ingestion pipeline: token refresh, report download, CSV normalization,
//! the idempotency ledger protocol, and the scheduled sweeps that drive it.
//!
//! The ledger is the only source of truth for what has been ingested; the
//! provider directory is treated as an unreliable listing that may repeat,
//! omit, or re-serve report files at any time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use ytr_core::{Credential, IngestStatus, Job, JobStatus, LedgerEntry, MetricRow, ReportFile};
use ytr_provider::{
    OAuthTokenClient, ProviderError, ReportDirectory, ReportingApiClient, TokenEndpoint,
    DEFAULT_REPORTING_BASE_URL, DEFAULT_TOKEN_URL,
};
use ytr_storage::{
    sha256_hex, CredentialStore, JobStore, LedgerStore, MetricsStore, RestConfig, RestStore,
    StorageResult,
};

pub const CRATE_NAME: &str = "ytr-ingest";

const DEFAULT_INGEST_CRON: &str = "0 15 * * * *";
const DEFAULT_METADATA_CRON: &str = "0 0 3 * * *";

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub reporting_base_url: String,
    pub token_url: String,
    pub oauth_client_id: String,
    pub oauth_client_secret: String,
    pub storage_base_url: String,
    pub storage_service_key: String,
    pub ingest_cron: String,
    pub metadata_cron: String,
    pub refresh_window_secs: i64,
    pub metadata_max_age_days: i64,
    pub metrics_batch_size: usize,
    pub max_ingest_attempts: u32,
    pub http_timeout_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            reporting_base_url: DEFAULT_REPORTING_BASE_URL.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            oauth_client_id: String::new(),
            oauth_client_secret: String::new(),
            storage_base_url: "http://localhost:54321/rest/v1".to_string(),
            storage_service_key: String::new(),
            ingest_cron: DEFAULT_INGEST_CRON.to_string(),
            metadata_cron: DEFAULT_METADATA_CRON.to_string(),
            refresh_window_secs: 300,
            metadata_max_age_days: 30,
            metrics_batch_size: 500,
            max_ingest_attempts: 24,
            http_timeout_secs: 20,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn env_parsed<T: std::str::FromStr>(name: &str, fallback: T) -> T {
    env_var(name)
        .and_then(|value| value.parse().ok())
        .unwrap_or(fallback)
}

impl IngestConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            reporting_base_url: env_var("YTR_REPORTING_BASE_URL")
                .unwrap_or(defaults.reporting_base_url),
            token_url: env_var("YTR_TOKEN_URL").unwrap_or(defaults.token_url),
            oauth_client_id: env_var("YTR_OAUTH_CLIENT_ID").unwrap_or(defaults.oauth_client_id),
            oauth_client_secret: env_var("YTR_OAUTH_CLIENT_SECRET")
                .unwrap_or(defaults.oauth_client_secret),
            storage_base_url: env_var("YTR_STORAGE_URL").unwrap_or(defaults.storage_base_url),
            storage_service_key: env_var("YTR_STORAGE_SERVICE_KEY")
                .unwrap_or(defaults.storage_service_key),
            ingest_cron: env_var("YTR_INGEST_CRON").unwrap_or(defaults.ingest_cron),
            metadata_cron: env_var("YTR_METADATA_CRON").unwrap_or(defaults.metadata_cron),
            refresh_window_secs: env_parsed("YTR_REFRESH_WINDOW_SECS", defaults.refresh_window_secs),
            metadata_max_age_days: env_parsed(
                "YTR_METADATA_MAX_AGE_DAYS",
                defaults.metadata_max_age_days,
            ),
            metrics_batch_size: env_parsed("YTR_METRICS_BATCH_SIZE", defaults.metrics_batch_size),
            max_ingest_attempts: env_parsed("YTR_MAX_INGEST_ATTEMPTS", defaults.max_ingest_attempts),
            http_timeout_secs: env_parsed("YTR_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
        }
    }
}

/// Serves access tokens, refreshing proactively when one is inside the
/// expiry window. Refreshes are single-flight per user, and a failed
/// refresh degrades to the stored token rather than failing the caller.
pub struct TokenRefresher {
    credentials: Arc<dyn CredentialStore>,
    token_endpoint: Arc<dyn TokenEndpoint>,
    refresh_window: chrono::Duration,
    in_flight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TokenRefresher {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        token_endpoint: Arc<dyn TokenEndpoint>,
        refresh_window: chrono::Duration,
    ) -> Self {
        Self {
            credentials,
            token_endpoint,
            refresh_window,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_valid_access_token(&self, user_id: &str) -> Result<String> {
        let credential = self
            .credentials
            .get(user_id)
            .await?
            .with_context(|| format!("no stored credential for user {user_id}"))?;
        if !credential.expires_within(self.refresh_window) {
            return Ok(credential.access_token);
        }

        let guard = {
            let mut in_flight = self.in_flight.lock().await;
            in_flight.entry(user_id.to_string()).or_default().clone()
        };
        let _held = guard.lock().await;

        // A concurrent caller may have refreshed while we waited on the guard.
        let credential = self
            .credentials
            .get(user_id)
            .await?
            .with_context(|| format!("no stored credential for user {user_id}"))?;
        if !credential.expires_within(self.refresh_window) {
            return Ok(credential.access_token);
        }

        match self.token_endpoint.refresh(&credential.refresh_token).await {
            Ok(tokens) => {
                let refreshed = Credential {
                    user_id: credential.user_id.clone(),
                    access_token: tokens.access_token,
                    refresh_token: tokens.refresh_token.unwrap_or(credential.refresh_token),
                    expires_at: Utc::now() + chrono::Duration::seconds(tokens.expires_in),
                    scopes: tokens.scope.unwrap_or(credential.scopes),
                };
                self.credentials.put(&refreshed).await?;
                info!(user_id, "refreshed access token");
                Ok(refreshed.access_token)
            }
            Err(err) => {
                warn!(user_id, error = %err, "token refresh failed, serving stored token");
                Ok(credential.access_token)
            }
        }
    }
}

/// One normalized row produced from a report file, before it is attached
/// to a ledger entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMetricRow {
    pub report_date: String,
    pub channel_id: String,
    pub video_id: Option<String>,
    pub views: i64,
    pub watch_time_minutes: f64,
    pub estimated_revenue: Option<f64>,
    pub subscribers_gained: i64,
    pub subscribers_lost: i64,
    pub raw_payload: serde_json::Value,
}

/// Minimal quoted-field tokenizer: `""` inside quotes is a literal quote,
/// commas inside quotes do not split.
fn split_csv_line(line: &str) -> Vec<String> {
    let mut cells = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => cells.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    cells.push(current);
    cells
}

/// Numeric coercion for report cells. Empty means zero; anything that does
/// not parse is NaN and handled by the caller.
fn cell_number(raw: &str) -> f64 {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    trimmed.parse().unwrap_or(f64::NAN)
}

fn to_counter(raw: Option<&str>) -> i64 {
    raw.map(cell_number)
        .filter(|value| value.is_finite())
        .map(|value| value as i64)
        .unwrap_or(0)
}

fn to_metric(raw: Option<&str>) -> f64 {
    raw.map(cell_number)
        .filter(|value| value.is_finite())
        .unwrap_or(0.0)
}

fn to_optional_metric(raw: Option<&str>) -> Option<f64> {
    raw.map(cell_number).filter(|value| value.is_finite())
}

fn field<'a>(
    payload: &'a serde_json::Map<String, serde_json::Value>,
    keys: &[&str],
) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| payload.get(*key).and_then(|value| value.as_str()))
}

fn normalize_row(
    payload: &serde_json::Map<String, serde_json::Value>,
    report: &ReportFile,
) -> Option<ParsedMetricRow> {
    // An empty date cell drops the row; an absent date column falls back to
    // the report window start. Dates longer than YYYY-MM-DD are truncated.
    let report_date = match field(payload, &["date", "day"]) {
        Some(raw) if raw.is_empty() => return None,
        Some(raw) => raw.chars().take(10).collect(),
        None => report.start_time.format("%Y-%m-%d").to_string(),
    };
    let channel_id = match field(payload, &["channel_id", "channelId"]) {
        Some(raw) if !raw.is_empty() => raw.to_string(),
        _ => return None,
    };
    let video_id = field(payload, &["video_id", "videoId"])
        .filter(|raw| !raw.is_empty())
        .map(str::to_string);

    Some(ParsedMetricRow {
        report_date,
        channel_id,
        video_id,
        views: to_counter(field(payload, &["views"])),
        watch_time_minutes: to_metric(field(
            payload,
            &[
                "watch_time_minutes",
                "watchTimeMinutes",
                "estimated_minutes_watched",
                "estimatedMinutesWatched",
            ],
        )),
        estimated_revenue: to_optional_metric(field(
            payload,
            &["estimated_revenue", "estimatedRevenue"],
        )),
        subscribers_gained: to_counter(field(payload, &["subscribers_gained", "subscribersGained"])),
        subscribers_lost: to_counter(field(payload, &["subscribers_lost", "subscribersLost"])),
        raw_payload: serde_json::Value::Object(payload.clone()),
    })
}

/// Parse a raw report body into normalized rows. The first non-empty line
/// is the header; rows whose cell count does not match it are dropped, as
/// are rows without a usable channel id or with an explicitly empty date.
pub fn parse_report_csv(csv: &str, report: &ReportFile) -> Vec<ParsedMetricRow> {
    let mut lines = csv.lines().filter(|line| !line.trim().is_empty());
    let header_line = match lines.next() {
        Some(line) => line,
        None => return Vec::new(),
    };
    let headers: Vec<String> = split_csv_line(header_line)
        .into_iter()
        .map(|cell| cell.trim().to_string())
        .collect();

    let mut rows = Vec::new();
    for line in lines {
        let cells = split_csv_line(line);
        if cells.len() != headers.len() {
            debug!(
                expected = headers.len(),
                got = cells.len(),
                "dropping report row with mismatched cell count"
            );
            continue;
        }
        let mut payload = serde_json::Map::new();
        for (header, cell) in headers.iter().zip(&cells) {
            payload.insert(
                header.clone(),
                serde_json::Value::String(cell.trim().to_string()),
            );
        }
        if let Some(row) = normalize_row(&payload, report) {
            rows.push(row);
        }
    }
    rows
}

/// Writes metric rows in fixed-size batches. The first failed batch aborts
/// the remainder; the ledger entry stays unparsed and the next sweep
/// re-ingests the whole file.
#[derive(Clone)]
pub struct MetricsWriter {
    store: Arc<dyn MetricsStore>,
    batch_size: usize,
}

impl MetricsWriter {
    pub fn new(store: Arc<dyn MetricsStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn insert_rows(&self, rows: &[MetricRow]) -> StorageResult<()> {
        for chunk in rows.chunks(self.batch_size) {
            self.store.insert(chunk).await?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    Ingested { rows: usize },
    AlreadyParsed,
    AttemptsExhausted,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JobIngestStats {
    pub ingested: usize,
    pub skipped: usize,
    pub failed: usize,
    pub rows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub jobs_total: usize,
    pub jobs_skipped: usize,
    pub reports_ingested: usize,
    pub reports_skipped: usize,
    pub reports_failed: usize,
    pub rows_written: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetadataRefreshSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub jobs_considered: usize,
    pub jobs_refreshed: usize,
    pub jobs_failed: usize,
}

pub struct IngestPipeline {
    refresher: TokenRefresher,
    directory: Arc<dyn ReportDirectory>,
    jobs: Arc<dyn JobStore>,
    ledger: Arc<dyn LedgerStore>,
    metrics: Arc<dyn MetricsStore>,
    writer: MetricsWriter,
    metadata_max_age: chrono::Duration,
    max_ingest_attempts: u32,
}

impl IngestPipeline {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        token_endpoint: Arc<dyn TokenEndpoint>,
        directory: Arc<dyn ReportDirectory>,
        jobs: Arc<dyn JobStore>,
        ledger: Arc<dyn LedgerStore>,
        metrics: Arc<dyn MetricsStore>,
        config: &IngestConfig,
    ) -> Self {
        Self {
            refresher: TokenRefresher::new(
                credentials,
                token_endpoint,
                chrono::Duration::seconds(config.refresh_window_secs),
            ),
            directory,
            jobs,
            ledger,
            writer: MetricsWriter::new(metrics.clone(), config.metrics_batch_size),
            metrics,
            metadata_max_age: chrono::Duration::days(config.metadata_max_age_days),
            max_ingest_attempts: config.max_ingest_attempts,
        }
    }

    pub fn from_config(config: &IngestConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.http_timeout_secs);
        let store = Arc::new(RestStore::new(RestConfig {
            base_url: config.storage_base_url.clone(),
            service_key: config.storage_service_key.clone(),
            timeout,
        })?);
        let directory = Arc::new(ReportingApiClient::new(&config.reporting_base_url, timeout)?);
        let token_endpoint = Arc::new(OAuthTokenClient::new(
            &config.token_url,
            &config.oauth_client_id,
            &config.oauth_client_secret,
            timeout,
        )?);
        Ok(Self::new(
            store.clone(),
            token_endpoint,
            directory,
            store.clone(),
            store.clone(),
            store,
            config,
        ))
    }

    /// Ingest one listed report file through the ledger protocol: skip if
    /// already parsed or out of attempts, otherwise download, claim the
    /// ledger row, replace the entry's metric rows, and mark the result.
    pub async fn ingest_report_file(
        &self,
        access_token: &str,
        job: &Job,
        report: &ReportFile,
    ) -> Result<ReportOutcome> {
        let existing = self
            .ledger
            .find(&job.user_id, &job.job_id, &report.id)
            .await?;
        if let Some(entry) = &existing {
            if entry.status == IngestStatus::Parsed {
                debug!(report_id = %report.id, "report already parsed, skipping");
                return Ok(ReportOutcome::AlreadyParsed);
            }
            if entry.attempts >= self.max_ingest_attempts {
                warn!(
                    report_id = %report.id,
                    attempts = entry.attempts,
                    "report is out of ingest attempts, skipping"
                );
                return Ok(ReportOutcome::AttemptsExhausted);
            }
        }

        let body = self
            .directory
            .fetch_report_body(access_token, &job.job_id, &report.id)
            .await
            .with_context(|| format!("downloading report {}", report.id))?;

        // A re-claim keeps the stored id so any metric rows from a previous
        // attempt stay attached to the same entry until replaced.
        let claim = LedgerEntry {
            id: existing
                .as_ref()
                .map(|entry| entry.id)
                .unwrap_or_else(Uuid::new_v4),
            user_id: job.user_id.clone(),
            job_id: job.job_id.clone(),
            report_id: report.id.clone(),
            start_time: report.start_time,
            end_time: report.end_time,
            checksum: sha256_hex(body.as_bytes()),
            status: IngestStatus::Pending,
            attempts: existing.as_ref().map(|entry| entry.attempts).unwrap_or(0),
            processed_at: None,
            error_message: None,
        };
        let entry = self.ledger.upsert_pending(&claim).await?;

        match self.parse_and_persist(&entry, job, &body).await {
            Ok(rows) => {
                self.ledger.mark_parsed(entry.id, Utc::now()).await?;
                info!(report_id = %report.id, rows, "ingested report");
                Ok(ReportOutcome::Ingested { rows })
            }
            Err(err) => {
                let message = format!("{err:#}");
                if let Err(ledger_err) = self
                    .ledger
                    .mark_error(entry.id, &message, entry.attempts + 1)
                    .await
                {
                    error!(
                        report_id = %report.id,
                        error = %ledger_err,
                        "failed to record ingest error"
                    );
                }
                Err(err)
            }
        }
    }

    async fn parse_and_persist(
        &self,
        entry: &LedgerEntry,
        job: &Job,
        body: &str,
    ) -> Result<usize> {
        let report = ReportFile {
            id: entry.report_id.clone(),
            job_id: entry.job_id.clone(),
            start_time: entry.start_time,
            end_time: entry.end_time,
            create_time: entry.start_time,
            download_url: None,
        };
        let rows: Vec<MetricRow> = parse_report_csv(body, &report)
            .into_iter()
            .map(|row| MetricRow {
                ledger_entry_id: entry.id,
                user_id: job.user_id.clone(),
                job_id: job.job_id.clone(),
                report_date: row.report_date,
                channel_id: row.channel_id,
                video_id: row.video_id,
                views: row.views,
                watch_time_minutes: row.watch_time_minutes,
                estimated_revenue: row.estimated_revenue,
                subscribers_gained: row.subscribers_gained,
                subscribers_lost: row.subscribers_lost,
                raw_payload: row.raw_payload,
            })
            .collect();

        self.metrics
            .delete_for_entry(entry.id)
            .await
            .context("clearing previous metric rows")?;
        self.writer
            .insert_rows(&rows)
            .await
            .context("writing metric rows")?;
        Ok(rows.len())
    }

    /// Ingest every report file the directory currently lists for a job.
    /// An empty listing is a normal answer; per-report failures are counted
    /// and do not stop the remaining files.
    pub async fn ingest_reports_for_job(
        &self,
        access_token: &str,
        job: &Job,
    ) -> Result<JobIngestStats> {
        let reports = self
            .directory
            .list_report_files(access_token, &job.job_id)
            .await
            .with_context(|| format!("listing reports for job {}", job.job_id))?;
        let mut stats = JobIngestStats::default();
        if reports.is_empty() {
            debug!(job_id = %job.job_id, "no report files listed");
            return Ok(stats);
        }
        for report in &reports {
            match self.ingest_report_file(access_token, job, report).await {
                Ok(ReportOutcome::Ingested { rows }) => {
                    stats.ingested += 1;
                    stats.rows += rows;
                }
                Ok(ReportOutcome::AlreadyParsed) | Ok(ReportOutcome::AttemptsExhausted) => {
                    stats.skipped += 1;
                }
                Err(err) => {
                    let message = format!("{err:#}");
                    warn!(
                        job_id = %job.job_id,
                        report_id = %report.id,
                        error = %message,
                        "report ingest failed"
                    );
                    stats.failed += 1;
                }
            }
        }
        Ok(stats)
    }

    /// The hourly sweep: walk every active job sequentially, obtain a usable
    /// access token, and ingest whatever the directory lists. A job whose
    /// credential is gone, or that the provider rejects outright, is
    /// deactivated rather than retried forever.
    pub async fn run_ingest_sweep(&self) -> Result<SweepSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, "starting ingest sweep");

        let jobs = self.jobs.list_all().await.context("listing jobs")?;
        let mut summary = SweepSummary {
            run_id,
            started_at,
            finished_at: started_at,
            jobs_total: jobs.len(),
            jobs_skipped: 0,
            reports_ingested: 0,
            reports_skipped: 0,
            reports_failed: 0,
            rows_written: 0,
        };

        for job in &jobs {
            if job.status == JobStatus::Inactive {
                summary.jobs_skipped += 1;
                continue;
            }
            let access_token = match self.refresher.get_valid_access_token(&job.user_id).await {
                Ok(token) => token,
                Err(err) => {
                    let message = format!("{err:#}");
                    warn!(
                        job_id = %job.job_id,
                        error = %message,
                        "no usable credential, deactivating job"
                    );
                    self.deactivate_job(&job.job_id).await;
                    summary.jobs_skipped += 1;
                    continue;
                }
            };
            match self.ingest_reports_for_job(&access_token, job).await {
                Ok(stats) => {
                    summary.reports_ingested += stats.ingested;
                    summary.reports_skipped += stats.skipped;
                    summary.reports_failed += stats.failed;
                    summary.rows_written += stats.rows;
                }
                Err(err) => {
                    let message = format!("{err:#}");
                    if matches!(
                        err.downcast_ref::<ProviderError>(),
                        Some(ProviderError::Auth { .. })
                    ) {
                        warn!(
                            job_id = %job.job_id,
                            error = %message,
                            "provider rejected credentials, deactivating job"
                        );
                        self.deactivate_job(&job.job_id).await;
                    } else {
                        warn!(job_id = %job.job_id, error = %message, "job sweep failed");
                    }
                    summary.jobs_skipped += 1;
                }
            }
        }

        summary.finished_at = Utc::now();
        info!(
            %run_id,
            reports_ingested = summary.reports_ingested,
            reports_skipped = summary.reports_skipped,
            reports_failed = summary.reports_failed,
            rows_written = summary.rows_written,
            "ingest sweep finished"
        );
        Ok(summary)
    }

    async fn deactivate_job(&self, job_id: &str) {
        if let Err(err) = self.jobs.mark_inactive(job_id).await {
            error!(job_id, error = %err, "failed to deactivate job");
        }
    }

    /// The daily sweep: re-fetch descriptors for jobs whose stored metadata
    /// is older than the configured age and record the new name, report
    /// type, and refresh timestamp.
    pub async fn run_metadata_refresh(&self) -> Result<MetadataRefreshSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let cutoff = started_at - self.metadata_max_age;
        let jobs = self
            .jobs
            .list_refreshed_before(cutoff)
            .await
            .context("listing stale jobs")?;
        info!(%run_id, stale = jobs.len(), "starting metadata refresh");

        let mut refreshed = 0usize;
        let mut failed = 0usize;
        for job in &jobs {
            match self.refresh_job_metadata(job).await {
                Ok(()) => refreshed += 1,
                Err(err) => {
                    let message = format!("{err:#}");
                    warn!(job_id = %job.job_id, error = %message, "metadata refresh failed");
                    failed += 1;
                }
            }
        }

        Ok(MetadataRefreshSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            jobs_considered: jobs.len(),
            jobs_refreshed: refreshed,
            jobs_failed: failed,
        })
    }

    async fn refresh_job_metadata(&self, job: &Job) -> Result<()> {
        let access_token = self.refresher.get_valid_access_token(&job.user_id).await?;
        let descriptor = self
            .directory
            .get_job(&access_token, &job.job_id)
            .await
            .with_context(|| format!("fetching job {}", job.job_id))?;
        self.jobs
            .update_metadata(
                &job.job_id,
                &descriptor.name,
                &descriptor.report_type_id,
                Utc::now(),
            )
            .await?;
        info!(job_id = %job.job_id, "refreshed job metadata");
        Ok(())
    }
}

/// Register both sweeps on a cron scheduler. The caller starts and stops it.
pub async fn build_scheduler(
    pipeline: Arc<IngestPipeline>,
    config: &IngestConfig,
) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await.context("creating scheduler")?;

    let ingest = pipeline.clone();
    let ingest_job = CronJob::new_async(config.ingest_cron.as_str(), move |_uuid, _lock| {
        let pipeline = ingest.clone();
        Box::pin(async move {
            match pipeline.run_ingest_sweep().await {
                Ok(summary) => info!(
                    reports_ingested = summary.reports_ingested,
                    rows_written = summary.rows_written,
                    "scheduled ingest sweep finished"
                ),
                Err(err) => {
                    let message = format!("{err:#}");
                    error!(error = %message, "scheduled ingest sweep failed");
                }
            }
        })
    })
    .with_context(|| format!("creating ingest sweep job for cron {}", config.ingest_cron))?;
    scheduler
        .add(ingest_job)
        .await
        .context("adding ingest sweep job")?;

    let metadata = pipeline;
    let metadata_job = CronJob::new_async(config.metadata_cron.as_str(), move |_uuid, _lock| {
        let pipeline = metadata.clone();
        Box::pin(async move {
            match pipeline.run_metadata_refresh().await {
                Ok(summary) => info!(
                    jobs_refreshed = summary.jobs_refreshed,
                    jobs_failed = summary.jobs_failed,
                    "scheduled metadata refresh finished"
                ),
                Err(err) => {
                    let message = format!("{err:#}");
                    error!(error = %message, "scheduled metadata refresh failed");
                }
            }
        })
    })
    .with_context(|| format!("creating metadata refresh job for cron {}", config.metadata_cron))?;
    scheduler
        .add(metadata_job)
        .await
        .context("adding metadata refresh job")?;

    Ok(scheduler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use ytr_core::{ReportType, TokenResponse};
    use ytr_provider::JobDescriptor;
    use ytr_storage::{DailyMetricsQuery, MemoryStore, MetricsQuery, StorageError};

    const SAMPLE_CSV: &str = "date,channel_id,video_id,views,watch_time_minutes,estimated_revenue,subscribers_gained,subscribers_lost\n2024-03-01,CHAN1,VID1,100,55.5,1.23,5,2\n2024-03-01,CHAN1,VID2,50,10,N/A,0,1\n";

    fn credential(user_id: &str, expires_in_minutes: i64) -> Credential {
        Credential {
            user_id: user_id.into(),
            access_token: "stale-access".into(),
            refresh_token: "stale-refresh".into(),
            expires_at: Utc::now() + chrono::Duration::minutes(expires_in_minutes),
            scopes: "yt-analytics.readonly".into(),
        }
    }

    fn active_job(job_id: &str, user_id: &str) -> Job {
        Job {
            job_id: job_id.into(),
            user_id: user_id.into(),
            report_type_id: "channel_basic_a2".into(),
            name: "daily channel report".into(),
            create_time: Utc::now(),
            last_refreshed: Some(Utc::now()),
            status: JobStatus::Active,
        }
    }

    fn report_file(id: &str, job_id: &str) -> ReportFile {
        ReportFile {
            id: id.into(),
            job_id: job_id.into(),
            start_time: "2024-03-01T00:00:00Z".parse().expect("timestamp"),
            end_time: "2024-03-02T00:00:00Z".parse().expect("timestamp"),
            create_time: "2024-03-02T06:00:00Z".parse().expect("timestamp"),
            download_url: Some(format!("https://example.test/media/{id}")),
        }
    }

    struct CountingTokenEndpoint {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingTokenEndpoint {
        fn working() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: true,
            })
        }
    }

    #[async_trait]
    impl TokenEndpoint for CountingTokenEndpoint {
        async fn refresh(&self, _refresh_token: &str) -> Result<TokenResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProviderError::Auth {
                    status: 400,
                    message: "invalid_grant".into(),
                });
            }
            Ok(TokenResponse {
                access_token: "fresh-token".into(),
                refresh_token: Some("fresh-refresh".into()),
                expires_in: 3600,
                scope: None,
            })
        }
    }

    struct ScriptedDirectory {
        reports: Vec<ReportFile>,
        bodies: HashMap<String, String>,
        downloads: AtomicUsize,
        job_name: String,
    }

    impl ScriptedDirectory {
        fn with_report(report: ReportFile, body: &str) -> Arc<Self> {
            let mut bodies = HashMap::new();
            bodies.insert(report.id.clone(), body.to_string());
            Arc::new(Self {
                reports: vec![report],
                bodies,
                downloads: AtomicUsize::new(0),
                job_name: "daily channel report".into(),
            })
        }

        fn empty() -> Arc<Self> {
            Arc::new(Self {
                reports: Vec::new(),
                bodies: HashMap::new(),
                downloads: AtomicUsize::new(0),
                job_name: "daily channel report".into(),
            })
        }
    }

    #[async_trait]
    impl ReportDirectory for ScriptedDirectory {
        async fn list_jobs(
            &self,
            _access_token: &str,
        ) -> Result<Vec<JobDescriptor>, ProviderError> {
            Ok(Vec::new())
        }

        async fn get_job(
            &self,
            _access_token: &str,
            job_id: &str,
        ) -> Result<JobDescriptor, ProviderError> {
            Ok(JobDescriptor {
                id: job_id.to_string(),
                report_type_id: "channel_basic_a2".into(),
                name: self.job_name.clone(),
                create_time: Utc::now(),
            })
        }

        async fn create_job(
            &self,
            _access_token: &str,
            _report_type_id: &str,
            _name: &str,
        ) -> Result<JobDescriptor, ProviderError> {
            unreachable!("job creation is not exercised here")
        }

        async fn list_report_types(
            &self,
            _access_token: &str,
        ) -> Result<Vec<ReportType>, ProviderError> {
            Ok(Vec::new())
        }

        async fn list_report_files(
            &self,
            _access_token: &str,
            job_id: &str,
        ) -> Result<Vec<ReportFile>, ProviderError> {
            Ok(self
                .reports
                .iter()
                .filter(|report| report.job_id == job_id)
                .cloned()
                .collect())
        }

        async fn fetch_report_body(
            &self,
            _access_token: &str,
            _job_id: &str,
            report_id: &str,
        ) -> Result<String, ProviderError> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            self.bodies.get(report_id).cloned().ok_or_else(|| {
                ProviderError::MissingDownloadUrl {
                    report_id: report_id.to_string(),
                }
            })
        }
    }

    fn pipeline_with(
        store: Arc<MemoryStore>,
        endpoint: Arc<CountingTokenEndpoint>,
        directory: Arc<ScriptedDirectory>,
        config: &IngestConfig,
    ) -> IngestPipeline {
        IngestPipeline::new(
            store.clone(),
            endpoint,
            directory,
            store.clone(),
            store.clone(),
            store,
            config,
        )
    }

    #[tokio::test]
    async fn expiring_token_is_refreshed_once_and_persisted() {
        let store = Arc::new(MemoryStore::new());
        store.put(&credential("user-1", 4)).await.expect("seed");
        let endpoint = CountingTokenEndpoint::working();
        let refresher = TokenRefresher::new(
            store.clone(),
            endpoint.clone(),
            chrono::Duration::minutes(5),
        );

        let token = refresher
            .get_valid_access_token("user-1")
            .await
            .expect("token");
        assert_eq!(token, "fresh-token");
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);

        let stored = store.get("user-1").await.expect("get").expect("credential");
        assert_eq!(stored.access_token, "fresh-token");
        assert_eq!(stored.refresh_token, "fresh-refresh");
        assert!(!stored.expires_within(chrono::Duration::minutes(5)));
    }

    #[tokio::test]
    async fn fresh_token_is_served_without_a_refresh() {
        let store = Arc::new(MemoryStore::new());
        store.put(&credential("user-1", 60)).await.expect("seed");
        let endpoint = CountingTokenEndpoint::working();
        let refresher = TokenRefresher::new(
            store.clone(),
            endpoint.clone(),
            chrono::Duration::minutes(5),
        );

        let token = refresher
            .get_valid_access_token("user-1")
            .await
            .expect("token");
        assert_eq!(token, "stale-access");
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn refresh_failure_degrades_to_the_stored_token() {
        let store = Arc::new(MemoryStore::new());
        store.put(&credential("user-1", 2)).await.expect("seed");
        let endpoint = CountingTokenEndpoint::failing();
        let refresher = TokenRefresher::new(
            store.clone(),
            endpoint.clone(),
            chrono::Duration::minutes(5),
        );

        let token = refresher
            .get_valid_access_token("user-1")
            .await
            .expect("token");
        assert_eq!(token, "stale-access");
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);

        let stored = store.get("user-1").await.expect("get").expect("credential");
        assert_eq!(stored.access_token, "stale-access");
    }

    #[tokio::test]
    async fn concurrent_callers_share_a_single_refresh() {
        let store = Arc::new(MemoryStore::new());
        store.put(&credential("user-1", 4)).await.expect("seed");
        let endpoint = CountingTokenEndpoint::working();
        let refresher = Arc::new(TokenRefresher::new(
            store,
            endpoint.clone(),
            chrono::Duration::minutes(5),
        ));

        let (first, second) = tokio::join!(
            refresher.get_valid_access_token("user-1"),
            refresher.get_valid_access_token("user-1"),
        );
        assert_eq!(first.expect("token"), "fresh-token");
        assert_eq!(second.expect("token"), "fresh-token");
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn quoted_commas_and_escaped_quotes_survive_parsing() {
        let csv = "date,channel_id,video_id,views\n2024-03-01,\"CH,AN\",\"say \"\"hi\"\"\",10\n";
        let rows = parse_report_csv(csv, &report_file("r-1", "job-1"));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].channel_id, "CH,AN");
        assert_eq!(rows[0].video_id.as_deref(), Some("say \"hi\""));
        assert_eq!(rows[0].views, 10);
    }

    #[test]
    fn rows_with_mismatched_cell_counts_are_dropped() {
        let csv = "date,channel_id,views\n2024-03-01,CHAN1\n2024-03-01,CHAN1,5,extra\n2024-03-02,CHAN1,7\n";
        let rows = parse_report_csv(csv, &report_file("r-1", "job-1"));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].report_date, "2024-03-02");
        assert_eq!(rows[0].views, 7);
    }

    #[test]
    fn numeric_coercion_is_best_effort() {
        let csv = "date,channel_id,views,watch_time_minutes,estimated_revenue,subscribers_gained,subscribers_lost\n2024-03-01,CHAN1,N/A,123.45,N/A,5,oops\n2024-03-01,CHAN1,,7,0.5,,\n";
        let rows = parse_report_csv(csv, &report_file("r-1", "job-1"));
        assert_eq!(rows.len(), 2);

        assert_eq!(rows[0].views, 0);
        assert_eq!(rows[0].watch_time_minutes, 123.45);
        assert_eq!(rows[0].estimated_revenue, None);
        assert_eq!(rows[0].subscribers_gained, 5);
        assert_eq!(rows[0].subscribers_lost, 0);

        // Empty cells coerce to zero; a missing revenue column stays None.
        assert_eq!(rows[1].views, 0);
        assert_eq!(rows[1].estimated_revenue, Some(0.5));

        let no_revenue = parse_report_csv(
            "date,channel_id,views\n2024-03-01,CHAN1,5\n",
            &report_file("r-1", "job-1"),
        );
        assert_eq!(no_revenue[0].estimated_revenue, None);
    }

    #[test]
    fn report_dates_fall_back_and_truncate() {
        let report = report_file("r-1", "job-1");

        let no_date_column = parse_report_csv("channel_id,views\nCHAN1,5\n", &report);
        assert_eq!(no_date_column.len(), 1);
        assert_eq!(no_date_column[0].report_date, "2024-03-01");

        let long_date =
            parse_report_csv("date,channel_id,views\n2024-03-05T00:00:00,CHAN1,5\n", &report);
        assert_eq!(long_date[0].report_date, "2024-03-05");

        let empty_date = parse_report_csv("date,channel_id,views\n,CHAN1,5\n", &report);
        assert!(empty_date.is_empty());
    }

    #[test]
    fn rows_without_a_channel_are_dropped() {
        let report = report_file("r-1", "job-1");
        let empty_channel = parse_report_csv("date,channel_id,views\n2024-03-01,,5\n", &report);
        assert!(empty_channel.is_empty());

        let no_channel_column = parse_report_csv("date,views\n2024-03-01,5\n", &report);
        assert!(no_channel_column.is_empty());
    }

    struct BatchRecorder {
        batches: std::sync::Mutex<Vec<usize>>,
        fail_on_call: Option<usize>,
    }

    #[async_trait]
    impl MetricsStore for BatchRecorder {
        async fn delete_for_entry(&self, _ledger_entry_id: Uuid) -> StorageResult<()> {
            Ok(())
        }

        async fn insert(&self, rows: &[MetricRow]) -> StorageResult<()> {
            let calls = {
                let mut batches = self.batches.lock().expect("lock");
                batches.push(rows.len());
                batches.len()
            };
            if self.fail_on_call == Some(calls) {
                return Err(StorageError::Rejected {
                    status: 503,
                    body: "insert unavailable".into(),
                });
            }
            Ok(())
        }
    }

    fn metric_rows(count: usize) -> Vec<MetricRow> {
        let entry_id = Uuid::new_v4();
        (0..count)
            .map(|_| MetricRow {
                ledger_entry_id: entry_id,
                user_id: "user-1".into(),
                job_id: "job-1".into(),
                report_date: "2024-03-01".into(),
                channel_id: "CHAN1".into(),
                video_id: None,
                views: 1,
                watch_time_minutes: 1.0,
                estimated_revenue: None,
                subscribers_gained: 0,
                subscribers_lost: 0,
                raw_payload: serde_json::json!({}),
            })
            .collect()
    }

    #[tokio::test]
    async fn metrics_writer_splits_rows_into_batches() {
        let recorder = Arc::new(BatchRecorder {
            batches: std::sync::Mutex::new(Vec::new()),
            fail_on_call: None,
        });
        let writer = MetricsWriter::new(recorder.clone(), 500);

        writer.insert_rows(&metric_rows(1201)).await.expect("insert");
        assert_eq!(*recorder.batches.lock().expect("lock"), vec![500, 500, 201]);
    }

    #[tokio::test]
    async fn metrics_writer_aborts_on_the_first_failed_batch() {
        let recorder = Arc::new(BatchRecorder {
            batches: std::sync::Mutex::new(Vec::new()),
            fail_on_call: Some(2),
        });
        let writer = MetricsWriter::new(recorder.clone(), 500);

        let result = writer.insert_rows(&metric_rows(1201)).await;
        assert!(result.is_err());
        assert_eq!(*recorder.batches.lock().expect("lock"), vec![500, 500]);
    }

    #[tokio::test]
    async fn sweep_is_idempotent_across_runs() {
        let store = Arc::new(MemoryStore::new());
        store.put(&credential("user-1", 60)).await.expect("seed");
        JobStore::insert(&*store, &active_job("job-1", "user-1"))
            .await
            .expect("seed job");
        let directory = ScriptedDirectory::with_report(report_file("r-1", "job-1"), SAMPLE_CSV);
        let pipeline = pipeline_with(
            store.clone(),
            CountingTokenEndpoint::working(),
            directory.clone(),
            &IngestConfig::default(),
        );

        let first = pipeline.run_ingest_sweep().await.expect("sweep");
        assert_eq!(first.reports_ingested, 1);
        assert_eq!(first.rows_written, 2);

        let second = pipeline.run_ingest_sweep().await.expect("sweep");
        assert_eq!(second.reports_ingested, 0);
        assert_eq!(second.reports_skipped, 1);
        assert_eq!(directory.downloads.load(Ordering::SeqCst), 1);

        let entry = LedgerStore::find(&*store, "user-1", "job-1", "r-1")
            .await
            .expect("find")
            .expect("entry");
        assert_eq!(entry.status, IngestStatus::Parsed);
        assert!(entry.processed_at.is_some());

        let rows = store
            .daily_metrics(&DailyMetricsQuery::new("user-1", "job-1"))
            .await
            .expect("query");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].ledger_entry_id, entry.id);
    }

    #[tokio::test]
    async fn failed_ingest_records_the_error_and_succeeds_on_retry() {
        struct FlakyMetricsStore {
            inner: Arc<MemoryStore>,
            failures_remaining: AtomicUsize,
        }

        #[async_trait]
        impl MetricsStore for FlakyMetricsStore {
            async fn delete_for_entry(&self, ledger_entry_id: Uuid) -> StorageResult<()> {
                self.inner.delete_for_entry(ledger_entry_id).await
            }

            async fn insert(&self, rows: &[MetricRow]) -> StorageResult<()> {
                if self.failures_remaining.load(Ordering::SeqCst) > 0 {
                    self.failures_remaining.fetch_sub(1, Ordering::SeqCst);
                    return Err(StorageError::Rejected {
                        status: 503,
                        body: "insert unavailable".into(),
                    });
                }
                MetricsStore::insert(&*self.inner, rows).await
            }
        }

        let store = Arc::new(MemoryStore::new());
        store.put(&credential("user-1", 60)).await.expect("seed");
        JobStore::insert(&*store, &active_job("job-1", "user-1"))
            .await
            .expect("seed job");
        let directory = ScriptedDirectory::with_report(report_file("r-1", "job-1"), SAMPLE_CSV);
        let flaky = Arc::new(FlakyMetricsStore {
            inner: store.clone(),
            failures_remaining: AtomicUsize::new(1),
        });
        let pipeline = IngestPipeline::new(
            store.clone(),
            CountingTokenEndpoint::working(),
            directory.clone(),
            store.clone(),
            store.clone(),
            flaky,
            &IngestConfig::default(),
        );

        let first = pipeline.run_ingest_sweep().await.expect("sweep");
        assert_eq!(first.reports_failed, 1);
        let entry = LedgerStore::find(&*store, "user-1", "job-1", "r-1")
            .await
            .expect("find")
            .expect("entry");
        assert_eq!(entry.status, IngestStatus::Error);
        assert_eq!(entry.attempts, 1);
        assert!(entry.error_message.is_some());

        let second = pipeline.run_ingest_sweep().await.expect("sweep");
        assert_eq!(second.reports_ingested, 1);
        assert_eq!(directory.downloads.load(Ordering::SeqCst), 2);

        let entry = LedgerStore::find(&*store, "user-1", "job-1", "r-1")
            .await
            .expect("find")
            .expect("entry");
        assert_eq!(entry.status, IngestStatus::Parsed);
        assert!(entry.error_message.is_none());

        let rows = store
            .daily_metrics(&DailyMetricsQuery::new("user-1", "job-1"))
            .await
            .expect("query");
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn parsed_reports_are_never_downloaded_again() {
        let store = Arc::new(MemoryStore::new());
        store.put(&credential("user-1", 60)).await.expect("seed");
        JobStore::insert(&*store, &active_job("job-1", "user-1"))
            .await
            .expect("seed job");

        // r-2 was ingested by an earlier sweep; only r-1 has a body scripted,
        // so any attempt to re-download r-2 would fail the sweep.
        let prior = report_file("r-2", "job-1");
        let seeded = store
            .upsert_pending(&LedgerEntry {
                id: Uuid::new_v4(),
                user_id: "user-1".into(),
                job_id: "job-1".into(),
                report_id: "r-2".into(),
                start_time: prior.start_time,
                end_time: prior.end_time,
                checksum: "prior".into(),
                status: IngestStatus::Pending,
                attempts: 0,
                processed_at: None,
                error_message: None,
            })
            .await
            .expect("seed ledger");
        store
            .mark_parsed(seeded.id, Utc::now())
            .await
            .expect("seed parsed");
        let mut prior_row = metric_rows(1).remove(0);
        prior_row.ledger_entry_id = seeded.id;
        MetricsStore::insert(&*store, &[prior_row])
            .await
            .expect("seed metrics");

        let directory = Arc::new(ScriptedDirectory {
            reports: vec![report_file("r-1", "job-1"), prior],
            bodies: HashMap::from([("r-1".to_string(), SAMPLE_CSV.to_string())]),
            downloads: AtomicUsize::new(0),
            job_name: "daily channel report".into(),
        });
        let pipeline = pipeline_with(
            store.clone(),
            CountingTokenEndpoint::working(),
            directory.clone(),
            &IngestConfig::default(),
        );

        let summary = pipeline.run_ingest_sweep().await.expect("sweep");
        assert_eq!(summary.reports_ingested, 1);
        assert_eq!(summary.reports_skipped, 1);
        assert_eq!(summary.reports_failed, 0);
        assert_eq!(directory.downloads.load(Ordering::SeqCst), 1);

        let rows = store
            .daily_metrics(&DailyMetricsQuery::new("user-1", "job-1"))
            .await
            .expect("query");
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().any(|row| row.ledger_entry_id == seeded.id));
    }

    #[tokio::test]
    async fn exhausted_reports_are_skipped_without_a_download() {
        let store = Arc::new(MemoryStore::new());
        store.put(&credential("user-1", 60)).await.expect("seed");
        JobStore::insert(&*store, &active_job("job-1", "user-1"))
            .await
            .expect("seed job");
        let report = report_file("r-1", "job-1");
        let seeded = store
            .upsert_pending(&LedgerEntry {
                id: Uuid::new_v4(),
                user_id: "user-1".into(),
                job_id: "job-1".into(),
                report_id: "r-1".into(),
                start_time: report.start_time,
                end_time: report.end_time,
                checksum: "prior".into(),
                status: IngestStatus::Pending,
                attempts: 0,
                processed_at: None,
                error_message: None,
            })
            .await
            .expect("seed ledger");
        store
            .mark_error(seeded.id, "persistent failure", 2)
            .await
            .expect("seed error");

        let directory = ScriptedDirectory::with_report(report, SAMPLE_CSV);
        let config = IngestConfig {
            max_ingest_attempts: 2,
            ..IngestConfig::default()
        };
        let pipeline = pipeline_with(
            store.clone(),
            CountingTokenEndpoint::working(),
            directory.clone(),
            &config,
        );

        let summary = pipeline.run_ingest_sweep().await.expect("sweep");
        assert_eq!(summary.reports_skipped, 1);
        assert_eq!(summary.reports_ingested, 0);
        assert_eq!(directory.downloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn jobs_without_credentials_are_deactivated() {
        let store = Arc::new(MemoryStore::new());
        JobStore::insert(&*store, &active_job("job-1", "user-1"))
            .await
            .expect("seed job");
        let pipeline = pipeline_with(
            store.clone(),
            CountingTokenEndpoint::working(),
            ScriptedDirectory::empty(),
            &IngestConfig::default(),
        );

        let summary = pipeline.run_ingest_sweep().await.expect("sweep");
        assert_eq!(summary.jobs_skipped, 1);
        assert_eq!(summary.reports_ingested, 0);

        let job = JobStore::find(&*store, "job-1")
            .await
            .expect("find")
            .expect("job");
        assert_eq!(job.status, JobStatus::Inactive);
    }

    #[tokio::test]
    async fn stale_job_metadata_is_refreshed() {
        let store = Arc::new(MemoryStore::new());
        store.put(&credential("user-1", 60)).await.expect("seed");
        let mut stale = active_job("job-1", "user-1");
        stale.last_refreshed = Some(Utc::now() - chrono::Duration::days(40));
        stale.name = "old name".into();
        JobStore::insert(&*store, &stale).await.expect("seed stale");
        JobStore::insert(&*store, &active_job("job-2", "user-1"))
            .await
            .expect("seed fresh");

        let pipeline = pipeline_with(
            store.clone(),
            CountingTokenEndpoint::working(),
            ScriptedDirectory::empty(),
            &IngestConfig::default(),
        );

        let summary = pipeline.run_metadata_refresh().await.expect("refresh");
        assert_eq!(summary.jobs_considered, 1);
        assert_eq!(summary.jobs_refreshed, 1);
        assert_eq!(summary.jobs_failed, 0);

        let refreshed = JobStore::find(&*store, "job-1")
            .await
            .expect("find")
            .expect("job");
        assert_eq!(refreshed.name, "daily channel report");
        let refreshed_at = refreshed.last_refreshed.expect("refreshed timestamp");
        assert!(Utc::now() - refreshed_at < chrono::Duration::minutes(1));

        let untouched = JobStore::find(&*store, "job-2")
            .await
            .expect("find")
            .expect("job");
        assert_eq!(untouched.name, "daily channel report");
    }
}
