//! Core domain model for grant-opportunity ingestion.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "grantflow-core";

/// Fixed partition value every opportunity row is stored under.
pub const GRANT_PARTITION: &str = "Grant";

/// Identifier handed from discovery to detail fetch through the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpportunityRef {
    pub id: String,
    pub discovered_at: DateTime<Utc>,
}

impl OpportunityRef {
    pub fn new(id: impl Into<String>, discovered_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            discovered_at,
        }
    }
}

/// Canonical, normalized opportunity record persisted by the commit stage.
///
/// `close_date` is `None` exactly when the opportunity accepts applications on
/// a rolling basis; `deadline` is then the empty string.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpportunityDetail {
    pub id: String,
    pub number: String,
    pub title: String,
    pub agency: String,
    pub agency_code: String,
    pub open_date: Option<NaiveDate>,
    pub close_date: Option<NaiveDate>,
    pub is_rolling: bool,
    pub deadline: String,
    pub award_ceiling: f64,
    pub award_floor: f64,
    pub expected_awards: u32,
    pub estimated_total_funding: f64,
    pub description: String,
    pub eligibility: String,
    pub contact: String,
    pub cfda_numbers: Vec<String>,
    pub funding_category: String,
    pub funding_instrument: String,
    pub cost_sharing: bool,
    pub source_url: String,
    pub last_updated: Option<NaiveDate>,
    pub fetched_at: DateTime<Utc>,
}

impl OpportunityDetail {
    /// Formats a close date the way `deadline` stores it.
    pub fn deadline_for(close_date: Option<NaiveDate>) -> String {
        close_date
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default()
    }
}

/// Raw upstream response body, archived before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPayload {
    pub id: String,
    pub fetched_at: DateTime<Utc>,
    pub content_hash: String,
    pub bytes: Vec<u8>,
}

/// Outcome of one HTTP attempt as seen by the retry loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptStatus {
    Success { status: u16 },
    RateLimited { status: u16 },
    Transient { status: Option<u16>, reason: String },
    Permanent { status: Option<u16>, reason: String },
}

impl AttemptStatus {
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Success { status } | Self::RateLimited { status } => Some(*status),
            Self::Transient { status, .. } | Self::Permanent { status, .. } => *status,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// One entry of a fetch call's attempt history. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchAttempt {
    pub target: String,
    /// 1-based.
    pub attempt_number: u32,
    pub status: AttemptStatus,
    pub latency_ms: u64,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Backoff chosen before the next attempt; `None` when no retry followed.
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
}

/// Discovery progress cursor. Only the discovery stage advances it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub last_discovery_run_at: Option<DateTime<Utc>>,
    pub last_seen_close_date_cursor: Option<NaiveDate>,
}

impl Watermark {
    /// Next watermark after a complete run; the close-date cursor never moves backwards.
    pub fn advanced(&self, run_at: DateTime<Utc>, max_close_date: Option<NaiveDate>) -> Self {
        let cursor = match (self.last_seen_close_date_cursor, max_close_date) {
            (Some(prev), Some(seen)) => Some(prev.max(seen)),
            (prev, seen) => prev.or(seen),
        };
        Self {
            last_discovery_run_at: Some(run_at),
            last_seen_close_date_cursor: cursor,
        }
    }
}

/// Partial corrective update; only the listed fields are written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityPatch {
    pub id: String,
    pub fields: BTreeMap<String, JsonValue>,
}

impl OpportunityPatch {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterKind {
    /// Detail could not be fetched; replay re-enqueues the id.
    Fetch,
    /// Detail was obtained but not persisted; replay re-commits `detail`.
    Commit,
}

impl DeadLetterKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Commit => "commit",
        }
    }
}

impl std::fmt::Display for DeadLetterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeadLetterKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "fetch" => Ok(Self::Fetch),
            "commit" => Ok(Self::Commit),
            other => Err(format!("unknown dead letter kind `{other}`")),
        }
    }
}

/// A unit of work parked for manual or automated replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: String,
    pub kind: DeadLetterKind,
    pub reason: String,
    pub attempts: u32,
    pub last_error: String,
    pub recorded_at: DateTime<Utc>,
    pub detail: Option<OpportunityDetail>,
}
