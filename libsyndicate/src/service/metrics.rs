//! Counters for the operational surface
//!
//! Counters are monotonic and cheap to bump from any worker task. A
//! [`MetricsSnapshot`] is what gets serialised for dashboards.
//!
//! Each process only sees its own counters. [`MetricsRecorder`] flushes the
//! growth since its last flush into the shared database, so `health` from
//! any process reports totals across every worker.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::db::Database;
use crate::error::Result;

#[derive(Debug, Default)]
pub struct Metrics {
    rate_limit_hits: AtomicU64,
    rate_limit_fail_opens: AtomicU64,
    rate_limit_penalties: AtomicU64,
    jobs_enqueued: AtomicU64,
    jobs_deduplicated: AtomicU64,
    jobs_claimed: AtomicU64,
    jobs_succeeded: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_retried: AtomicU64,
    jobs_rescheduled: AtomicU64,
    jobs_cancelled: AtomicU64,
    jobs_recovered: AtomicU64,
    token_refreshes: AtomicU64,
    token_refresh_failures: AtomicU64,
    circuit_opens: AtomicU64,
    starved_tokens: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub rate_limit_hits: u64,
    pub rate_limit_fail_opens: u64,
    pub rate_limit_penalties: u64,
    pub jobs_enqueued: u64,
    pub jobs_deduplicated: u64,
    pub jobs_claimed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_retried: u64,
    pub jobs_rescheduled: u64,
    pub jobs_cancelled: u64,
    pub jobs_recovered: u64,
    pub token_refreshes: u64,
    pub token_refresh_failures: u64,
    pub circuit_opens: u64,
    pub starved_tokens: u64,
}

impl MetricsSnapshot {
    /// Every counter by its persisted name
    pub fn counters(&self) -> [(&'static str, u64); 16] {
        [
            ("rate_limit_hits", self.rate_limit_hits),
            ("rate_limit_fail_opens", self.rate_limit_fail_opens),
            ("rate_limit_penalties", self.rate_limit_penalties),
            ("jobs_enqueued", self.jobs_enqueued),
            ("jobs_deduplicated", self.jobs_deduplicated),
            ("jobs_claimed", self.jobs_claimed),
            ("jobs_succeeded", self.jobs_succeeded),
            ("jobs_failed", self.jobs_failed),
            ("jobs_retried", self.jobs_retried),
            ("jobs_rescheduled", self.jobs_rescheduled),
            ("jobs_cancelled", self.jobs_cancelled),
            ("jobs_recovered", self.jobs_recovered),
            ("token_refreshes", self.token_refreshes),
            ("token_refresh_failures", self.token_refresh_failures),
            ("circuit_opens", self.circuit_opens),
            ("starved_tokens", self.starved_tokens),
        ]
    }

    fn counter_mut(&mut self, name: &str) -> Option<&mut u64> {
        let field = match name {
            "rate_limit_hits" => &mut self.rate_limit_hits,
            "rate_limit_fail_opens" => &mut self.rate_limit_fail_opens,
            "rate_limit_penalties" => &mut self.rate_limit_penalties,
            "jobs_enqueued" => &mut self.jobs_enqueued,
            "jobs_deduplicated" => &mut self.jobs_deduplicated,
            "jobs_claimed" => &mut self.jobs_claimed,
            "jobs_succeeded" => &mut self.jobs_succeeded,
            "jobs_failed" => &mut self.jobs_failed,
            "jobs_retried" => &mut self.jobs_retried,
            "jobs_rescheduled" => &mut self.jobs_rescheduled,
            "jobs_cancelled" => &mut self.jobs_cancelled,
            "jobs_recovered" => &mut self.jobs_recovered,
            "token_refreshes" => &mut self.token_refreshes,
            "token_refresh_failures" => &mut self.token_refresh_failures,
            "circuit_opens" => &mut self.circuit_opens,
            "starved_tokens" => &mut self.starved_tokens,
            _ => return None,
        };
        Some(field)
    }

    /// Counter-wise `self - earlier`
    pub fn delta_since(&self, earlier: &MetricsSnapshot) -> MetricsSnapshot {
        let mut delta = MetricsSnapshot::default();
        for ((name, now), (_, before)) in self.counters().into_iter().zip(earlier.counters()) {
            if let Some(field) = delta.counter_mut(name) {
                *field = now.saturating_sub(before);
            }
        }
        delta
    }

    /// Counter-wise sum
    pub fn merged(&self, other: &MetricsSnapshot) -> MetricsSnapshot {
        let mut sum = *self;
        for (name, value) in other.counters() {
            if let Some(field) = sum.counter_mut(name) {
                *field = field.saturating_add(value);
            }
        }
        sum
    }

    /// Unknown names are ignored
    pub fn from_totals<I, S>(totals: I) -> MetricsSnapshot
    where
        I: IntoIterator<Item = (S, u64)>,
        S: AsRef<str>,
    {
        let mut snapshot = MetricsSnapshot::default();
        for (name, value) in totals {
            if let Some(field) = snapshot.counter_mut(name.as_ref()) {
                *field = value;
            }
        }
        snapshot
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rate_limit_hit(&self) {
        bump(&self.rate_limit_hits);
    }

    pub fn rate_limit_fail_open(&self) {
        bump(&self.rate_limit_fail_opens);
    }

    pub fn rate_limit_penalty(&self) {
        bump(&self.rate_limit_penalties);
    }

    pub fn job_enqueued(&self) {
        bump(&self.jobs_enqueued);
    }

    pub fn job_deduplicated(&self) {
        bump(&self.jobs_deduplicated);
    }

    pub fn job_claimed(&self) {
        bump(&self.jobs_claimed);
    }

    pub fn job_succeeded(&self) {
        bump(&self.jobs_succeeded);
    }

    pub fn job_failed(&self) {
        bump(&self.jobs_failed);
    }

    pub fn job_retried(&self) {
        bump(&self.jobs_retried);
    }

    pub fn job_rescheduled(&self) {
        bump(&self.jobs_rescheduled);
    }

    pub fn job_cancelled(&self) {
        bump(&self.jobs_cancelled);
    }

    pub fn job_recovered(&self) {
        bump(&self.jobs_recovered);
    }

    pub fn token_refreshed(&self) {
        bump(&self.token_refreshes);
    }

    pub fn token_refresh_failed(&self) {
        bump(&self.token_refresh_failures);
    }

    pub fn circuit_opened(&self) {
        bump(&self.circuit_opens);
    }

    pub fn token_starved(&self) {
        bump(&self.starved_tokens);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let read = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            rate_limit_hits: read(&self.rate_limit_hits),
            rate_limit_fail_opens: read(&self.rate_limit_fail_opens),
            rate_limit_penalties: read(&self.rate_limit_penalties),
            jobs_enqueued: read(&self.jobs_enqueued),
            jobs_deduplicated: read(&self.jobs_deduplicated),
            jobs_claimed: read(&self.jobs_claimed),
            jobs_succeeded: read(&self.jobs_succeeded),
            jobs_failed: read(&self.jobs_failed),
            jobs_retried: read(&self.jobs_retried),
            jobs_rescheduled: read(&self.jobs_rescheduled),
            jobs_cancelled: read(&self.jobs_cancelled),
            jobs_recovered: read(&self.jobs_recovered),
            token_refreshes: read(&self.token_refreshes),
            token_refresh_failures: read(&self.token_refresh_failures),
            circuit_opens: read(&self.circuit_opens),
            starved_tokens: read(&self.starved_tokens),
        }
    }
}

/// Flushes one process's counters into the shared totals
#[derive(Clone)]
pub struct MetricsRecorder {
    db: Database,
    metrics: Arc<Metrics>,
    flushed: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsRecorder {
    pub fn new(db: Database, metrics: Arc<Metrics>) -> Self {
        Self {
            db,
            metrics,
            flushed: Arc::new(Mutex::new(MetricsSnapshot::default())),
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Persist growth since the previous flush. Returns this process's
    /// snapshot as of the flush.
    pub async fn flush(&self, now: i64) -> Result<MetricsSnapshot> {
        let mut flushed = self.flushed.lock().await;
        let current = self.metrics.snapshot();
        let delta = current.delta_since(&flushed);
        if delta != MetricsSnapshot::default() {
            self.db.add_metric_totals(&delta.counters(), now).await?;
            *flushed = current;
        }
        Ok(current)
    }

    /// Persisted totals plus whatever this process has not flushed yet
    pub async fn totals(&self) -> Result<MetricsSnapshot> {
        let flushed = self.flushed.lock().await;
        let persisted = MetricsSnapshot::from_totals(self.db.load_metric_totals().await?);
        Ok(persisted.merged(&self.metrics.snapshot().delta_since(&flushed)))
    }
}
