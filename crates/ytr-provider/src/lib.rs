//! Reporting-provider clients: the report directory/fetcher and the OAuth
//! token endpoint, plus the provider error taxonomy.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;
use ytr_core::{ReportFile, ReportType, TokenResponse};

pub const CRATE_NAME: &str = "ytr-provider";

pub const DEFAULT_REPORTING_BASE_URL: &str = "https://youtubereporting.googleapis.com/v1";
pub const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Failure taxonomy for provider calls.
///
/// `Auth` is never retried locally; `Duplicate` is the provider's
/// already-exists signal on job creation; everything else HTTP-shaped is
/// `Upstream` with whatever the error body surfaced.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider authentication failed (http {status}): {message}")]
    Auth { status: u16, message: String },
    #[error("duplicate resource: {message}")]
    Duplicate { message: String },
    #[error("upstream api error (http {status}): {message}")]
    Upstream {
        status: u16,
        code: Option<i64>,
        reason: Option<String>,
        message: String,
    },
    #[error("report {report_id} has no download url")]
    MissingDownloadUrl { report_id: String },
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

/// Provider error body: `{ "error": { code?, message?, status?, details? } }`.
/// Every field may be absent, including the envelope itself.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub error: Option<ApiErrorDetail>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiErrorDetail {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}

/// Map a non-success directory/download response onto the taxonomy.
pub fn classify_error_response(status: StatusCode, body: &str) -> ProviderError {
    let detail = serde_json::from_str::<ApiErrorBody>(body)
        .ok()
        .and_then(|body| body.error)
        .unwrap_or_default();
    let message = detail
        .message
        .clone()
        .unwrap_or_else(|| format!("http {status}"));
    let reason = detail.status.clone();

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return ProviderError::Auth {
            status: status.as_u16(),
            message,
        };
    }
    if status == StatusCode::CONFLICT
        || reason.as_deref() == Some("ALREADY_EXISTS")
        || message.to_ascii_lowercase().contains("already exists")
    {
        return ProviderError::Duplicate { message };
    }
    ProviderError::Upstream {
        status: status.as_u16(),
        code: detail.code,
        reason,
        message,
    }
}

/// Job descriptor as the directory serves it (camelCase wire names).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDescriptor {
    pub id: String,
    pub report_type_id: String,
    pub name: String,
    pub create_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportDto {
    id: String,
    #[serde(default)]
    job_id: Option<String>,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    create_time: DateTime<Utc>,
    #[serde(default)]
    download_url: Option<String>,
}

impl ReportDto {
    fn into_report_file(self, fallback_job_id: &str) -> ReportFile {
        ReportFile {
            id: self.id,
            job_id: self.job_id.unwrap_or_else(|| fallback_job_id.to_string()),
            start_time: self.start_time,
            end_time: self.end_time,
            create_time: self.create_time,
            download_url: self.download_url,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ReportListResponse {
    #[serde(default)]
    reports: Vec<ReportDto>,
}

#[derive(Debug, Default, Deserialize)]
struct JobListResponse {
    #[serde(default)]
    jobs: Vec<JobDescriptor>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportTypeDto {
    id: String,
    name: String,
    #[serde(default)]
    system_managed: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportTypeListResponse {
    #[serde(default)]
    report_types: Vec<ReportTypeDto>,
}

/// Directory of reporting jobs and their downloadable report files.
#[async_trait]
pub trait ReportDirectory: Send + Sync {
    async fn list_jobs(&self, access_token: &str) -> Result<Vec<JobDescriptor>, ProviderError>;

    async fn get_job(
        &self,
        access_token: &str,
        job_id: &str,
    ) -> Result<JobDescriptor, ProviderError>;

    async fn create_job(
        &self,
        access_token: &str,
        report_type_id: &str,
        name: &str,
    ) -> Result<JobDescriptor, ProviderError>;

    async fn list_report_types(
        &self,
        access_token: &str,
    ) -> Result<Vec<ReportType>, ProviderError>;

    /// An empty list is a valid answer, not an error.
    async fn list_report_files(
        &self,
        access_token: &str,
        job_id: &str,
    ) -> Result<Vec<ReportFile>, ProviderError>;

    /// Two-step download: report metadata yields a signed url, fetched with
    /// the same bearer token.
    async fn fetch_report_body(
        &self,
        access_token: &str,
        job_id: &str,
        report_id: &str,
    ) -> Result<String, ProviderError>;
}

/// Exchange of a refresh token for a fresh access token.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct ReportingApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ReportingApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout)
            .build()
            .context("building reporting api client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ProviderError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_error_response(status, &body));
        }
        Ok(response.json().await?)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        access_token: &str,
        url: &str,
    ) -> Result<T, ProviderError> {
        let response = self.http.get(url).bearer_auth(access_token).send().await?;
        Self::decode(response).await
    }
}

#[async_trait]
impl ReportDirectory for ReportingApiClient {
    async fn list_jobs(&self, access_token: &str) -> Result<Vec<JobDescriptor>, ProviderError> {
        let url = format!("{}/jobs", self.base_url);
        let listing: JobListResponse = self.get_json(access_token, &url).await?;
        Ok(listing.jobs)
    }

    async fn get_job(
        &self,
        access_token: &str,
        job_id: &str,
    ) -> Result<JobDescriptor, ProviderError> {
        let url = format!("{}/jobs/{}", self.base_url, job_id);
        self.get_json(access_token, &url).await
    }

    async fn create_job(
        &self,
        access_token: &str,
        report_type_id: &str,
        name: &str,
    ) -> Result<JobDescriptor, ProviderError> {
        let url = format!("{}/jobs", self.base_url);
        debug!(report_type_id, "creating reporting job");
        let response = self
            .http
            .post(url)
            .bearer_auth(access_token)
            .json(&serde_json::json!({
                "reportTypeId": report_type_id,
                "name": name,
            }))
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn list_report_types(
        &self,
        access_token: &str,
    ) -> Result<Vec<ReportType>, ProviderError> {
        let url = format!("{}/reportTypes", self.base_url);
        let listing: ReportTypeListResponse = self.get_json(access_token, &url).await?;
        Ok(listing
            .report_types
            .into_iter()
            .map(|dto| ReportType {
                id: dto.id,
                name: dto.name,
                system_managed: dto.system_managed,
            })
            .collect())
    }

    async fn list_report_files(
        &self,
        access_token: &str,
        job_id: &str,
    ) -> Result<Vec<ReportFile>, ProviderError> {
        let url = format!("{}/jobs/{}/reports", self.base_url, job_id);
        let listing: ReportListResponse = self.get_json(access_token, &url).await?;
        debug!(job_id, count = listing.reports.len(), "listed report files");
        Ok(listing
            .reports
            .into_iter()
            .map(|dto| dto.into_report_file(job_id))
            .collect())
    }

    async fn fetch_report_body(
        &self,
        access_token: &str,
        job_id: &str,
        report_id: &str,
    ) -> Result<String, ProviderError> {
        let url = format!("{}/jobs/{}/reports/{}", self.base_url, job_id, report_id);
        let metadata: ReportDto = self.get_json(access_token, &url).await?;
        let download_url = metadata
            .download_url
            .ok_or_else(|| ProviderError::MissingDownloadUrl {
                report_id: report_id.to_string(),
            })?;

        debug!(report_id, "downloading report body");
        let response = self
            .http
            .get(download_url)
            .bearer_auth(access_token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_error_response(status, &body));
        }
        Ok(response.text().await?)
    }
}

#[derive(Debug, Default, Deserialize)]
struct OAuthErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// Token-endpoint failures surface as authentication failures regardless of
/// status: an unrefreshable credential degrades the caller, never the sweep.
fn oauth_refresh_error(status: StatusCode, body: &str) -> ProviderError {
    let parsed: OAuthErrorBody = serde_json::from_str(body).unwrap_or_default();
    let message = parsed
        .error_description
        .or(parsed.error)
        .unwrap_or_else(|| format!("token endpoint returned http {status}"));
    ProviderError::Auth {
        status: status.as_u16(),
        message,
    }
}

#[derive(Debug, Clone)]
pub struct OAuthTokenClient {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl OAuthTokenClient {
    pub fn new(
        token_url: &str,
        client_id: &str,
        client_secret: &str,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building oauth token client")?;
        Ok(Self {
            http,
            token_url: token_url.to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
        })
    }
}

#[async_trait]
impl TokenEndpoint for OAuthTokenClient {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, ProviderError> {
        let params = [
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("grant_type", "refresh_token"),
        ];
        let response = self.http.post(&self.token_url).form(&params).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(oauth_refresh_error(status, &body));
        }
        Ok(response.json().await?)
    }
}
