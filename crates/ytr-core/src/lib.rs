//! Core domain model for the YouTube Reporting ingestion pipeline.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ytr-core";

/// Delegated OAuth credential stored per user.
///
/// `expires_at` always reflects the lifetime declared by the token endpoint
/// at the moment of issuance; it is never extrapolated locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub user_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub scopes: String,
}

impl Credential {
    /// True when the access token expires within `window` from now.
    pub fn expires_within(&self, window: Duration) -> bool {
        self.expires_at - Utc::now() < window
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Active,
    Inactive,
}

/// A standing report subscription registered with the provider.
///
/// Immutable after creation except for `last_refreshed` and `status`, which
/// only the scheduled sweeps touch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub user_id: String,
    pub report_type_id: String,
    pub name: String,
    pub create_time: DateTime<Utc>,
    pub last_refreshed: Option<DateTime<Utc>>,
    pub status: JobStatus,
}

/// One time-windowed downloadable report artifact, as listed by the
/// provider's directory. Transient: only the ledger references it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportFile {
    pub id: String,
    pub job_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub create_time: DateTime<Utc>,
    pub download_url: Option<String>,
}

/// Catalogue entry for a report type the provider can generate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportType {
    pub id: String,
    pub name: String,
    pub system_managed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStatus {
    Pending,
    Parsed,
    Error,
}

/// Durable idempotency record for one report file, unique on
/// `(user_id, job_id, report_id)`.
///
/// `parsed` means the metric rows are durably stored and the file must never
/// be re-fetched. `pending`/`error` leave the file eligible for the next
/// sweep, up to the configured attempt cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub user_id: String,
    pub job_id: String,
    pub report_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub checksum: String,
    pub status: IngestStatus,
    pub attempts: u32,
    pub processed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// One normalized daily metric row owned by a single ledger entry.
///
/// All rows for an entry are deleted and reinserted together, so the rows
/// visible under a ledger entry always match a single checksum of the
/// source file. `raw_payload` keeps the full header/value map for forward
/// compatibility with provider schema changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRow {
    pub ledger_entry_id: Uuid,
    pub user_id: String,
    pub job_id: String,
    pub report_date: String,
    pub channel_id: String,
    pub video_id: Option<String>,
    pub views: i64,
    pub watch_time_minutes: f64,
    pub estimated_revenue: Option<f64>,
    pub subscribers_gained: i64,
    pub subscribers_lost: i64,
    pub raw_payload: JsonValue,
}

/// Token endpoint response for a refresh-token grant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: i64,
    pub scope: Option<String>,
}
