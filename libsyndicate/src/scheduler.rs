//! Fair-share token selection
//!
//! Candidates for a platform are the active tokens whose breaker is not open
//! and whose cooldown has passed. Among them the winner is chosen by, in
//! order: lowest priority value, never scheduled before scheduled, oldest
//! `last_scheduled_at`, highest weight, then a random pick among full ties.
//!
//! Starvation is reported, not corrected: [`FairShareScheduler::detect_starvation`]
//! flags tokens that have not been picked for too long and leaves the order
//! alone.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;

use crate::circuit_breaker::CircuitBreaker;
use crate::config::SchedulerConfig;
use crate::db::{token_record_from_row, Database};
use crate::error::{DbError, Result};
use crate::service::events::{Event, EventBus};
use crate::service::metrics::Metrics;
use crate::types::{CircuitState, Platform, TokenRecord, SECOND_MS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerPolicy {
    pub jitter_min_ms: i64,
    pub jitter_max_ms: i64,
    pub starvation_threshold_ms: i64,
}

impl Default for SchedulerPolicy {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for SchedulerPolicy {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            jitter_min_ms: config.jitter_min_ms as i64,
            jitter_max_ms: config.jitter_max_ms as i64,
            starvation_threshold_ms: config.starvation_threshold_seconds as i64 * SECOND_MS,
        }
    }
}

/// A token chosen for a new job together with its jittered run time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledSlot {
    pub token_id: String,
    pub run_at: i64,
    pub jitter_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StarvedToken {
    pub token_id: String,
    pub platform: Platform,
    pub last_scheduled_at: Option<i64>,
    pub starved_for_ms: i64,
}

/// Whether a token may be picked right now
pub fn is_eligible(record: &TokenRecord, now: i64) -> bool {
    record.is_active
        && record.circuit_breaker_state != CircuitState::Open
        && record.cooldown_until.map_or(true, |until| until <= now)
}

/// Selection order without the random tiebreak; `Less` wins
pub fn rank(a: &TokenRecord, b: &TokenRecord) -> Ordering {
    a.priority
        .cmp(&b.priority)
        .then_with(|| match (a.last_scheduled_at, b.last_scheduled_at) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(x), Some(y)) => x.cmp(&y),
        })
        .then_with(|| b.weight.cmp(&a.weight))
}

/// Best-ranked candidate, breaking full ties at random
pub fn pick_fair<'a, R: Rng + ?Sized>(
    candidates: &'a [TokenRecord],
    rng: &mut R,
) -> Option<&'a TokenRecord> {
    let best = candidates.iter().min_by(|a, b| rank(a, b))?;
    let tied: Vec<&TokenRecord> = candidates
        .iter()
        .filter(|c| rank(c, best) == Ordering::Equal)
        .collect();
    tied.choose(rng).copied()
}

/// Uniform human-like delay in `[jitter_min_ms, jitter_max_ms]`
pub fn jitter_ms<R: Rng + ?Sized>(policy: &SchedulerPolicy, rng: &mut R) -> i64 {
    if policy.jitter_max_ms <= policy.jitter_min_ms {
        return policy.jitter_min_ms.max(0);
    }
    rng.gen_range(policy.jitter_min_ms..=policy.jitter_max_ms)
}

/// Active tokens not picked within `threshold_ms`. Tokens never picked are
/// measured from their creation time.
pub fn find_starved(records: &[TokenRecord], threshold_ms: i64, now: i64) -> Vec<StarvedToken> {
    records
        .iter()
        .filter(|r| r.is_active)
        .filter_map(|r| {
            let since = r.last_scheduled_at.unwrap_or(r.created_at);
            let starved_for_ms = now - since;
            (starved_for_ms > threshold_ms).then(|| StarvedToken {
                token_id: r.token_id.clone(),
                platform: r.platform,
                last_scheduled_at: r.last_scheduled_at,
                starved_for_ms,
            })
        })
        .collect()
}

#[derive(Clone)]
pub struct FairShareScheduler {
    db: Database,
    breaker: CircuitBreaker,
    policy: SchedulerPolicy,
    events: EventBus,
    metrics: Arc<Metrics>,
}

impl FairShareScheduler {
    pub fn new(
        db: Database,
        breaker: CircuitBreaker,
        policy: SchedulerPolicy,
        events: EventBus,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            db,
            breaker,
            policy,
            events,
            metrics,
        }
    }

    pub fn policy(&self) -> &SchedulerPolicy {
        &self.policy
    }

    /// Next token for the platform, or `None` when nothing is eligible
    pub async fn select_next_token(&self, platform: Platform, now: i64) -> Result<Option<String>> {
        self.breaker.promote_expired(platform, now).await?;
        let candidates = self.load_candidates(platform, now, false).await?;
        Ok(pick_fair(&candidates, &mut rand::thread_rng()).map(|r| r.token_id.clone()))
    }

    /// Like [`select_next_token`](Self::select_next_token), restricted to
    /// tokens that have a pending job due at `now`
    pub async fn select_next_due_token(&self, platform: Platform, now: i64) -> Result<Option<String>> {
        self.breaker.promote_expired(platform, now).await?;
        let candidates = self.load_candidates(platform, now, true).await?;
        Ok(pick_fair(&candidates, &mut rand::thread_rng()).map(|r| r.token_id.clone()))
    }

    /// Select a token for a new job, apply jitter and record the selection
    pub async fn plan(&self, platform: Platform, now: i64) -> Result<Option<ScheduledSlot>> {
        let Some(token_id) = self.select_next_token(platform, now).await? else {
            tracing::debug!(platform = %platform, "No eligible token to plan");
            return Ok(None);
        };

        let jitter = jitter_ms(&self.policy, &mut rand::thread_rng());
        self.record_selection(&token_id, now).await?;

        tracing::debug!(
            platform = %platform,
            token_id = %token_id,
            jitter_ms = jitter,
            "Planned token"
        );

        Ok(Some(ScheduledSlot {
            token_id,
            run_at: now + jitter,
            jitter_ms: jitter,
        }))
    }

    /// Update recency and the scheduled counter for a picked token
    pub async fn record_selection(&self, token_id: &str, now: i64) -> Result<()> {
        self.db.touch_last_scheduled(token_id, now).await
    }

    /// Flag active tokens nobody has picked for longer than the threshold
    pub async fn detect_starvation(&self, now: i64) -> Result<Vec<StarvedToken>> {
        let records = self.db.list_token_records(None).await?;
        let starved = find_starved(&records, self.policy.starvation_threshold_ms, now);

        for token in &starved {
            self.metrics.token_starved();
            tracing::warn!(
                token_id = %token.token_id,
                platform = %token.platform,
                starved_for_ms = token.starved_for_ms,
                "Token starved"
            );
            self.events.emit(Event::TokenStarved {
                token_id: token.token_id.clone(),
                platform: token.platform,
                last_scheduled_at: token.last_scheduled_at,
                starved_for_ms: token.starved_for_ms,
            });
        }

        Ok(starved)
    }

    async fn load_candidates(
        &self,
        platform: Platform,
        now: i64,
        due_only: bool,
    ) -> Result<Vec<TokenRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM token_records t
            WHERE t.platform = ?
              AND (? = 0 OR EXISTS (
                    SELECT 1 FROM publish_jobs j
                    WHERE j.token_id = t.token_id
                      AND j.status = 'pending'
                      AND j.scheduled_at <= ?
              ))
            "#,
        )
        .bind(platform.as_str())
        .bind(due_only)
        .bind(now)
        .fetch_all(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            let record = token_record_from_row(row)?;
            if is_eligible(&record, now) {
                candidates.push(record);
            }
        }
        Ok(candidates)
    }
}
