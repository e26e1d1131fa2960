//! Core types for Syndicate

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SyndicateError;

pub const SECOND_MS: i64 = 1_000;
pub const MINUTE_MS: i64 = 60 * SECOND_MS;
pub const HOUR_MS: i64 = 60 * MINUTE_MS;
pub const DAY_MS: i64 = 24 * HOUR_MS;

/// Social platforms the scheduler publishes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Instagram,
    TikTok,
    X,
    Reddit,
}

impl Platform {
    pub const ALL: [Platform; 4] = [
        Platform::Instagram,
        Platform::TikTok,
        Platform::X,
        Platform::Reddit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Instagram => "instagram",
            Platform::TikTok => "tiktok",
            Platform::X => "x",
            Platform::Reddit => "reddit",
        }
    }

    /// Access token lifetime assumed when a token endpoint omits `expires_in`
    pub fn default_token_lifetime_ms(&self) -> i64 {
        match self {
            Platform::Instagram => 60 * DAY_MS,
            Platform::TikTok => DAY_MS,
            Platform::X => 2 * HOUR_MS,
            Platform::Reddit => HOUR_MS,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = SyndicateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "instagram" | "ig" => Ok(Platform::Instagram),
            "tiktok" => Ok(Platform::TikTok),
            "x" | "twitter" => Ok(Platform::X),
            "reddit" => Ok(Platform::Reddit),
            other => Err(SyndicateError::InvalidInput(format!(
                "Unknown platform '{}'. Valid options: instagram, tiktok, x, reddit",
                other
            ))),
        }
    }
}

/// Circuit breaker state persisted on each token record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CircuitState {
    type Err = SyndicateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "closed" => Ok(CircuitState::Closed),
            "open" => Ok(CircuitState::Open),
            "half_open" => Ok(CircuitState::HalfOpen),
            other => Err(SyndicateError::InvalidInput(format!(
                "Unknown circuit state '{}'",
                other
            ))),
        }
    }
}

/// Lifecycle of a publish job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = SyndicateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(SyndicateError::InvalidInput(format!(
                "Unknown job status '{}'",
                other
            ))),
        }
    }
}

/// Scheduling state for one connected account on one platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub token_id: String,
    pub platform: Platform,
    /// Lower is more urgent
    pub priority: i64,
    /// Relative posting frequency; wins ties after recency
    pub weight: i64,
    pub is_active: bool,
    pub last_scheduled_at: Option<i64>,
    pub cooldown_until: Option<i64>,
    pub circuit_breaker_state: CircuitState,
    pub circuit_breaker_failures: u32,
    pub circuit_opened_at: Option<i64>,
    pub trial_in_flight: bool,
    pub total_jobs_scheduled: i64,
    pub total_jobs_failed: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TokenRecord {
    pub fn new(token_id: impl Into<String>, platform: Platform, now: i64) -> Self {
        Self {
            token_id: token_id.into(),
            platform,
            priority: 100,
            weight: 1,
            is_active: true,
            last_scheduled_at: None,
            cooldown_until: None,
            circuit_breaker_state: CircuitState::Closed,
            circuit_breaker_failures: 0,
            circuit_opened_at: None,
            trial_in_flight: false,
            total_jobs_scheduled: 0,
            total_jobs_failed: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_weight(mut self, weight: i64) -> Self {
        self.weight = weight;
        self
    }
}

/// What gets published: caption, media reference and platform-specific fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub caption: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl JobPayload {
    pub fn text(caption: impl Into<String>) -> Self {
        Self {
            caption: caption.into(),
            media_url: None,
            fields: serde_json::Map::new(),
        }
    }

    pub fn with_media(mut self, url: impl Into<String>) -> Self {
        self.media_url = Some(url.into());
        self
    }
}

/// A single post to one account, tracked from submission to terminal state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishJob {
    pub job_id: String,
    pub token_id: String,
    pub platform: Platform,
    pub payload: JobPayload,
    pub scheduled_at: i64,
    pub status: JobStatus,
    pub attempts: u32,
    pub error_code: Option<String>,
    pub last_error: Option<String>,
    pub dedupe_key: String,
    pub external_id: Option<String>,
    pub external_url: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub claimed_at: Option<i64>,
    pub completed_at: Option<i64>,
}

/// Optional quota information a platform returns alongside a publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitHint {
    pub remaining: Option<u32>,
    pub reset_after_ms: Option<i64>,
}

/// Successful publish result from a platform adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub external_id: String,
    pub external_url: Option<String>,
    pub rate_limit_hint: Option<RateLimitHint>,
}

/// Sliding window granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    Burst,
    Minute,
    Hour,
    Day,
}

impl WindowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowKind::Burst => "burst",
            WindowKind::Minute => "minute",
            WindowKind::Hour => "hour",
            WindowKind::Day => "day",
        }
    }

    pub fn default_length_ms(&self) -> i64 {
        match self {
            WindowKind::Burst | WindowKind::Minute => MINUTE_MS,
            WindowKind::Hour => HOUR_MS,
            WindowKind::Day => DAY_MS,
        }
    }
}

/// One configured limit: at most `max_count` actions per `window_ms`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSpec {
    pub kind: WindowKind,
    pub window_ms: i64,
    pub max_count: u32,
}

impl WindowSpec {
    pub fn new(kind: WindowKind, window_ms: i64, max_count: u32) -> Self {
        Self {
            kind,
            window_ms,
            max_count,
        }
    }

    pub fn burst(max_count: u32) -> Self {
        Self::new(WindowKind::Burst, WindowKind::Burst.default_length_ms(), max_count)
    }

    pub fn per_minute(max_count: u32) -> Self {
        Self::new(WindowKind::Minute, MINUTE_MS, max_count)
    }

    pub fn per_hour(max_count: u32) -> Self {
        Self::new(WindowKind::Hour, HOUR_MS, max_count)
    }

    pub fn per_day(max_count: u32) -> Self {
        Self::new(WindowKind::Day, DAY_MS, max_count)
    }
}
