//! Point-in-time health report
//!
//! Breaker state and counters for every token, job totals per status,
//! currently starved tokens and the process metrics. Building a report is
//! read-only: it does not emit starvation events (the worker pool's
//! maintenance pass does that).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::db::Database;
use crate::error::Result;
use crate::scheduler::{find_starved, StarvedToken};
use crate::service::metrics::MetricsSnapshot;
use crate::types::{CircuitState, Platform, TokenRecord};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenHealth {
    pub token_id: String,
    pub platform: Platform,
    pub is_active: bool,
    pub circuit_state: CircuitState,
    pub consecutive_failures: u32,
    pub circuit_opened_at: Option<i64>,
    pub cooldown_until: Option<i64>,
    pub last_scheduled_at: Option<i64>,
    pub total_jobs_scheduled: i64,
    pub total_jobs_failed: i64,
}

impl From<&TokenRecord> for TokenHealth {
    fn from(record: &TokenRecord) -> Self {
        Self {
            token_id: record.token_id.clone(),
            platform: record.platform,
            is_active: record.is_active,
            circuit_state: record.circuit_breaker_state,
            consecutive_failures: record.circuit_breaker_failures,
            circuit_opened_at: record.circuit_opened_at,
            cooldown_until: record.cooldown_until,
            last_scheduled_at: record.last_scheduled_at,
            total_jobs_scheduled: record.total_jobs_scheduled,
            total_jobs_failed: record.total_jobs_failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub generated_at: i64,
    pub tokens: Vec<TokenHealth>,
    /// Keyed by status name
    pub jobs: BTreeMap<String, i64>,
    pub starved: Vec<StarvedToken>,
    pub metrics: MetricsSnapshot,
}

impl HealthReport {
    pub async fn collect(
        db: &Database,
        starvation_threshold_ms: i64,
        metrics: MetricsSnapshot,
        now: i64,
    ) -> Result<Self> {
        let records = db.list_token_records(None).await?;
        let jobs = db
            .count_jobs_by_status()
            .await?
            .into_iter()
            .map(|(status, count)| (status.as_str().to_string(), count))
            .collect();

        Ok(Self {
            generated_at: now,
            tokens: records.iter().map(TokenHealth::from).collect(),
            jobs,
            starved: find_starved(&records, starvation_threshold_ms, now),
            metrics,
        })
    }

    pub fn open_circuits(&self) -> impl Iterator<Item = &TokenHealth> {
        self.tokens
            .iter()
            .filter(|t| t.circuit_state == CircuitState::Open)
    }

    /// Nothing starved and no breaker open
    pub fn is_healthy(&self) -> bool {
        self.starved.is_empty() && self.open_circuits().next().is_none()
    }
}
