//! Per-token circuit breaker
//!
//! State lives on the token record so every worker sees the same breaker.
//! Transitions are computed by the pure methods on [`BreakerSnapshot`] and
//! persisted inside an immediate transaction, which is what makes the
//! half-open "exactly one trial" rule hold across workers.
//!
//! ```text
//! closed --(failures >= threshold)--> open --(cooldown elapsed)--> half_open
//!   ^                                  ^                              |
//!   |                                  +-------(trial fails)----------+
//!   +-------------------(trial succeeds)------------------------------+
//! ```

use std::sync::Arc;

use crate::config::CircuitBreakerConfig;
use crate::db::{fetch_token_record, Database};
use crate::error::{DbError, Result, SyndicateError};
use crate::service::events::{Event, EventBus};
use crate::service::metrics::Metrics;
use crate::types::{CircuitState, Platform, TokenRecord, SECOND_MS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerPolicy {
    pub failure_threshold: u32,
    pub cooldown_ms: i64,
    /// Delay handed to jobs that arrive while a half-open trial is running
    pub trial_wait_ms: i64,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self::from(&CircuitBreakerConfig::default())
    }
}

impl From<&CircuitBreakerConfig> for BreakerPolicy {
    fn from(config: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            cooldown_ms: config.cooldown_seconds as i64 * SECOND_MS,
            trial_wait_ms: config.trial_wait_seconds as i64 * SECOND_MS,
        }
    }
}

/// Whether a job may call the platform for this token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    Closed,
    /// The single half-open trial; its outcome decides the next state
    Trial,
    Denied { retry_after_ms: i64 },
}

impl Permit {
    pub fn is_denied(&self) -> bool {
        matches!(self, Permit::Denied { .. })
    }
}

/// Breaker fields of a token record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failures: u32,
    pub opened_at: Option<i64>,
    pub trial_in_flight: bool,
}

impl Default for BreakerSnapshot {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            opened_at: None,
            trial_in_flight: false,
        }
    }
}

impl BreakerSnapshot {
    pub fn from_record(record: &TokenRecord) -> Self {
        Self {
            state: record.circuit_breaker_state,
            failures: record.circuit_breaker_failures,
            opened_at: record.circuit_opened_at,
            trial_in_flight: record.trial_in_flight,
        }
    }

    fn cooldown_remaining(&self, policy: &BreakerPolicy, now: i64) -> i64 {
        let opened_at = self.opened_at.unwrap_or(now);
        (opened_at + policy.cooldown_ms - now).max(0)
    }

    fn half_open(self) -> Self {
        Self {
            state: CircuitState::HalfOpen,
            trial_in_flight: false,
            ..self
        }
    }

    fn opened(self, now: i64) -> Self {
        Self {
            state: CircuitState::Open,
            opened_at: Some(now),
            trial_in_flight: false,
            ..self
        }
    }

    /// Open breakers past their cooldown become half-open
    pub fn promote(self, policy: &BreakerPolicy, now: i64) -> Self {
        if self.state == CircuitState::Open && self.cooldown_remaining(policy, now) == 0 {
            self.half_open()
        } else {
            self
        }
    }

    pub fn on_acquire(self, policy: &BreakerPolicy, now: i64) -> (Self, Permit) {
        let current = self.promote(policy, now);
        match current.state {
            CircuitState::Closed => (current, Permit::Closed),
            CircuitState::Open => (
                current,
                Permit::Denied {
                    retry_after_ms: current.cooldown_remaining(policy, now).max(1),
                },
            ),
            CircuitState::HalfOpen if current.trial_in_flight => (
                current,
                Permit::Denied {
                    retry_after_ms: policy.trial_wait_ms.max(1),
                },
            ),
            CircuitState::HalfOpen => (
                Self {
                    trial_in_flight: true,
                    ..current
                },
                Permit::Trial,
            ),
        }
    }

    /// Success closes the breaker and resets the count
    pub fn on_success(self) -> Self {
        Self::default()
    }

    pub fn on_failure(self, policy: &BreakerPolicy, now: i64) -> Self {
        let failures = self.failures.saturating_add(1);
        let counted = Self { failures, ..self };
        match self.state {
            CircuitState::Closed if failures >= policy.failure_threshold => counted.opened(now),
            CircuitState::Closed => counted,
            // A failed trial re-opens with a fresh cooldown
            CircuitState::HalfOpen => counted.opened(now),
            CircuitState::Open => counted,
        }
    }

    /// The trial ended without saying anything about account health
    pub fn on_release(self) -> Self {
        if self.state == CircuitState::HalfOpen {
            Self {
                trial_in_flight: false,
                ..self
            }
        } else {
            self
        }
    }
}

/// Persisted breaker over the token records table
#[derive(Clone)]
pub struct CircuitBreaker {
    db: Database,
    policy: BreakerPolicy,
    events: EventBus,
    metrics: Arc<Metrics>,
}

impl CircuitBreaker {
    pub fn new(db: Database, policy: BreakerPolicy, events: EventBus, metrics: Arc<Metrics>) -> Self {
        Self {
            db,
            policy,
            events,
            metrics,
        }
    }

    pub fn policy(&self) -> &BreakerPolicy {
        &self.policy
    }

    /// Ask to run a job for this token
    pub async fn acquire(&self, token_id: &str, now: i64) -> Result<Permit> {
        let mut permit = Permit::Closed;
        self.transition(token_id, now, false, |snapshot, policy| {
            let (next, p) = snapshot.on_acquire(policy, now);
            permit = p;
            next
        })
        .await?;
        Ok(permit)
    }

    pub async fn record_success(&self, token_id: &str, now: i64) -> Result<CircuitState> {
        self.transition(token_id, now, false, |snapshot, _| snapshot.on_success())
            .await
    }

    /// Count a failed attempt; may open the breaker
    pub async fn record_failure(&self, token_id: &str, now: i64) -> Result<CircuitState> {
        self.transition(token_id, now, true, |snapshot, policy| {
            snapshot.on_failure(policy, now)
        })
        .await
    }

    /// Give back a half-open trial whose outcome was neither success nor failure
    pub async fn release_trial(&self, token_id: &str, now: i64) -> Result<CircuitState> {
        self.transition(token_id, now, false, |snapshot, _| snapshot.on_release())
            .await
    }

    /// Move open breakers whose cooldown elapsed to half-open so the
    /// scheduler sees them again. Returns the promoted token ids.
    pub async fn promote_expired(&self, platform: Platform, now: i64) -> Result<Vec<String>> {
        let candidates = sqlx::query_as::<_, (String,)>(
            r#"
            SELECT token_id FROM token_records
            WHERE platform = ? AND circuit_breaker_state = 'open'
              AND COALESCE(circuit_opened_at, 0) + ? <= ?
            "#,
        )
        .bind(platform.as_str())
        .bind(self.policy.cooldown_ms)
        .bind(now)
        .fetch_all(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        let mut promoted = Vec::new();
        for (token_id,) in candidates {
            let state = self
                .transition(&token_id, now, false, |snapshot, policy| {
                    snapshot.promote(policy, now)
                })
                .await?;
            if state == CircuitState::HalfOpen {
                promoted.push(token_id);
            }
        }
        Ok(promoted)
    }

    async fn transition<F>(
        &self,
        token_id: &str,
        now: i64,
        count_failure: bool,
        apply: F,
    ) -> Result<CircuitState>
    where
        F: FnOnce(BreakerSnapshot, &BreakerPolicy) -> BreakerSnapshot,
    {
        let mut tx = self.db.begin_immediate().await?;

        let record = fetch_token_record(&mut tx, token_id)
            .await?
            .ok_or_else(|| SyndicateError::NotFound(format!("token {}", token_id)))?;

        let before = BreakerSnapshot::from_record(&record);
        let after = apply(before, &self.policy);

        if after != before || count_failure {
            sqlx::query(
                r#"
                UPDATE token_records SET
                    circuit_breaker_state = ?,
                    circuit_breaker_failures = ?,
                    circuit_opened_at = ?,
                    trial_in_flight = ?,
                    total_jobs_failed = total_jobs_failed + ?,
                    updated_at = ?
                WHERE token_id = ?
                "#,
            )
            .bind(after.state.as_str())
            .bind(after.failures as i64)
            .bind(after.opened_at)
            .bind(after.trial_in_flight)
            .bind(if count_failure { 1i64 } else { 0 })
            .bind(now)
            .bind(token_id)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;
        }

        tx.commit().await?;

        if after.state != before.state {
            self.announce(&record, before, after, now);
        }

        Ok(after.state)
    }

    fn announce(&self, record: &TokenRecord, before: BreakerSnapshot, after: BreakerSnapshot, now: i64) {
        if after.state == CircuitState::Open {
            self.metrics.circuit_opened();
            tracing::warn!(
                token_id = %record.token_id,
                platform = %record.platform,
                from = %before.state,
                to = %after.state,
                failures = after.failures,
                at = now,
                "Circuit breaker opened"
            );
        } else {
            tracing::info!(
                token_id = %record.token_id,
                platform = %record.platform,
                from = %before.state,
                to = %after.state,
                failures = after.failures,
                at = now,
                "Circuit breaker transition"
            );
        }

        self.events.emit(Event::CircuitTransition {
            token_id: record.token_id.clone(),
            platform: record.platform,
            from: before.state,
            to: after.state,
            failures: after.failures,
            at: now,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::setup_test_db;
    use crate::types::MINUTE_MS;

    fn policy() -> BreakerPolicy {
        BreakerPolicy {
            failure_threshold: 5,
            cooldown_ms: 5 * MINUTE_MS,
            trial_wait_ms: 30_000,
        }
    }

    #[test]
    fn test_opens_at_threshold() {
        let p = policy();
        let mut snapshot = BreakerSnapshot::default();
        for i in 1..5 {
            snapshot = snapshot.on_failure(&p, i);
            assert_eq!(snapshot.state, CircuitState::Closed);
        }
        snapshot = snapshot.on_failure(&p, 100);
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.failures, 5);
        assert_eq!(snapshot.opened_at, Some(100));
    }

    #[test]
    fn test_success_in_closed_resets_failures() {
        let p = policy();
        let snapshot = BreakerSnapshot::default()
            .on_failure(&p, 1)
            .on_failure(&p, 2)
            .on_success();
        assert_eq!(snapshot, BreakerSnapshot::default());
    }

    #[test]
    fn test_open_denies_until_cooldown() {
        let p = policy();
        let open = BreakerSnapshot {
            state: CircuitState::Open,
            failures: 5,
            opened_at: Some(0),
            trial_in_flight: false,
        };

        let (_, permit) = open.on_acquire(&p, MINUTE_MS);
        assert_eq!(
            permit,
            Permit::Denied {
                retry_after_ms: 4 * MINUTE_MS
            }
        );

        let (after, permit) = open.on_acquire(&p, 5 * MINUTE_MS);
        assert_eq!(permit, Permit::Trial);
        assert_eq!(after.state, CircuitState::HalfOpen);
        assert!(after.trial_in_flight);
    }

    #[test]
    fn test_half_open_allows_single_trial() {
        let p = policy();
        let half_open = BreakerSnapshot {
            state: CircuitState::HalfOpen,
            failures: 5,
            opened_at: Some(0),
            trial_in_flight: false,
        };

        let (with_trial, first) = half_open.on_acquire(&p, 1);
        let (_, second) = with_trial.on_acquire(&p, 2);
        assert_eq!(first, Permit::Trial);
        assert_eq!(second, Permit::Denied { retry_after_ms: 30_000 });
    }

    #[test]
    fn test_trial_failure_reopens_with_fresh_cooldown() {
        let p = policy();
        let trial = BreakerSnapshot {
            state: CircuitState::HalfOpen,
            failures: 5,
            opened_at: Some(0),
            trial_in_flight: true,
        };

        let reopened = trial.on_failure(&p, 10 * MINUTE_MS);
        assert_eq!(reopened.state, CircuitState::Open);
        assert_eq!(reopened.opened_at, Some(10 * MINUTE_MS));
        assert!(!reopened.trial_in_flight);
    }

    #[test]
    fn test_release_frees_trial() {
        let trial = BreakerSnapshot {
            state: CircuitState::HalfOpen,
            failures: 5,
            opened_at: Some(0),
            trial_in_flight: true,
        };
        let released = trial.on_release();
        assert_eq!(released.state, CircuitState::HalfOpen);
        assert!(!released.trial_in_flight);
    }

    async fn breaker_with_token(token_id: &str) -> (CircuitBreaker, Database, tempfile::TempDir) {
        let (db, dir) = setup_test_db().await;
        db.upsert_token_record(&TokenRecord::new(token_id, Platform::TikTok, 0))
            .await
            .unwrap();
        let breaker = CircuitBreaker::new(
            db.clone(),
            policy(),
            EventBus::new(32),
            Arc::new(Metrics::new()),
        );
        (breaker, db, dir)
    }

    #[tokio::test]
    async fn test_persisted_full_cycle() {
        let (breaker, db, _dir) = breaker_with_token("t1").await;
        let mut events = breaker.events.subscribe();

        for i in 0..5 {
            breaker.record_failure("t1", 1_000 + i).await.unwrap();
        }
        let record = db.get_token_record("t1").await.unwrap().unwrap();
        assert_eq!(record.circuit_breaker_state, CircuitState::Open);
        assert_eq!(record.total_jobs_failed, 5);

        match events.recv().await.unwrap() {
            Event::CircuitTransition { from, to, failures, .. } => {
                assert_eq!(from, CircuitState::Closed);
                assert_eq!(to, CircuitState::Open);
                assert_eq!(failures, 5);
            }
            other => panic!("unexpected event {:?}", other),
        }

        assert!(breaker.acquire("t1", 2_000).await.unwrap().is_denied());

        let after_cooldown = 1_004 + 5 * MINUTE_MS;
        assert_eq!(breaker.acquire("t1", after_cooldown).await.unwrap(), Permit::Trial);
        assert!(breaker.acquire("t1", after_cooldown).await.unwrap().is_denied());

        let state = breaker.record_success("t1", after_cooldown + 1).await.unwrap();
        assert_eq!(state, CircuitState::Closed);
        let record = db.get_token_record("t1").await.unwrap().unwrap();
        assert_eq!(record.circuit_breaker_failures, 0);
        assert!(!record.trial_in_flight);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_grants_one_trial() {
        let (breaker, db, _dir) = breaker_with_token("t1").await;
        for i in 0..5 {
            breaker.record_failure("t1", i).await.unwrap();
        }
        let now = 10 * MINUTE_MS;

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let breaker = breaker.clone();
                tokio::spawn(async move { breaker.acquire("t1", now).await.unwrap() })
            })
            .collect();

        let mut trials = 0;
        for h in handles {
            if h.await.unwrap() == Permit::Trial {
                trials += 1;
            }
        }
        assert_eq!(trials, 1);
        let record = db.get_token_record("t1").await.unwrap().unwrap();
        assert_eq!(record.circuit_breaker_state, CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_promote_expired_only_past_cooldown() {
        let (breaker, db, _dir) = breaker_with_token("t1").await;
        db.upsert_token_record(&TokenRecord::new("t2", Platform::TikTok, 0))
            .await
            .unwrap();

        for i in 0..5 {
            breaker.record_failure("t1", i).await.unwrap();
            breaker.record_failure("t2", 4 * MINUTE_MS + i).await.unwrap();
        }

        let promoted = breaker
            .promote_expired(Platform::TikTok, 5 * MINUTE_MS + 10)
            .await
            .unwrap();
        assert_eq!(promoted, vec!["t1".to_string()]);

        let t2 = db.get_token_record("t2").await.unwrap().unwrap();
        assert_eq!(t2.circuit_breaker_state, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_unknown_token_is_not_found() {
        let (breaker, _db, _dir) = breaker_with_token("t1").await;
        let result = breaker.acquire("ghost", 0).await;
        assert!(matches!(result, Err(SyndicateError::NotFound(_))));
    }
}
