//! Publish job execution
//!
//! [`JobExecutor::execute`] drives one job through a single attempt:
//!
//! 1. claim (`pending → running` once due, exactly one worker wins)
//! 2. rate limiter check; a denial puts the job back without an attempt
//! 3. circuit breaker permit; a denial is handled the same way
//! 4. credential resolution (refreshing if needed)
//! 5. the adapter call, bounded by a timeout
//! 6. bookkeeping: job row, breaker, token recency, limiter feedback
//!
//! Quota and eligibility conditions never surface as job failures. Everything
//! else either retries with exponential backoff or lands in `failed` with a
//! stable `error_code`.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

use crate::circuit_breaker::{CircuitBreaker, Permit};
use crate::config::{RetryConfig, WorkerConfig};
use crate::credentials::CredentialManager;
use crate::db::{AttemptUpdate, Database};
use crate::error::{AdapterError, Result, SyndicateError};
use crate::platforms::AdapterRegistry;
use crate::rate_limiter::{Decision, RateLimiter};
use crate::service::events::{Event, EventBus};
use crate::service::metrics::Metrics;
use crate::types::{PublishJob, PublishReceipt, SECOND_MS};

pub const ADAPTER_MISSING: &str = "adapter_missing";
pub const STALE_CLAIM: &str = "stale_claim";

/// Retry budget and backoff curve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retry_limit: u32,
    pub backoff_base_ms: i64,
    pub backoff_cap_ms: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            retry_limit: config.retry_limit,
            backoff_base_ms: config.backoff_base_ms as i64,
            backoff_cap_ms: config.backoff_cap_ms as i64,
        }
    }
}

impl RetryPolicy {
    /// `base × 2^attempts`, capped
    pub fn backoff_ms(&self, attempts: u32) -> i64 {
        let factor = 1_i64.checked_shl(attempts).unwrap_or(i64::MAX);
        self.backoff_base_ms
            .saturating_mul(factor)
            .min(self.backoff_cap_ms)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.retry_limit
    }
}

/// Knobs for a single attempt
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub retry: RetryPolicy,
    pub adapter_timeout: Duration,
    /// Rate-limit endpoint publish calls are counted under
    pub endpoint: String,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::new(&RetryConfig::default(), &WorkerConfig::default())
    }
}

impl ExecutorSettings {
    pub fn new(retry: &RetryConfig, worker: &WorkerConfig) -> Self {
        Self {
            retry: RetryPolicy::from(retry),
            adapter_timeout: Duration::from_secs(worker.adapter_timeout_seconds),
            endpoint: worker.endpoint.clone(),
        }
    }
}

/// What one call to [`JobExecutor::execute`] did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// Someone else owns the job, it is no longer pending, or not yet due
    NotClaimed,
    /// Put back without consuming an attempt
    Rescheduled { reason: String, run_at: i64 },
    Succeeded { external_id: String },
    RetryScheduled {
        attempts: u32,
        run_at: i64,
        error_code: String,
    },
    Failed { attempts: u32, error_code: String },
}

/// How a failed attempt is booked
struct FailedAttempt {
    error_code: String,
    message: String,
    /// Counts toward the breaker
    breaker_failure: bool,
    /// Never retried
    terminal: bool,
    /// Lower bound on the retry delay (429 hint)
    min_delay_ms: Option<i64>,
}

impl FailedAttempt {
    fn from_adapter(error: &AdapterError) -> Self {
        let (breaker_failure, terminal, min_delay_ms) = match error {
            AdapterError::RateLimited { retry_after_ms } => (false, false, *retry_after_ms),
            AdapterError::Transient { retry_after_ms, .. } => (true, false, *retry_after_ms),
            AdapterError::Timeout => (true, false, None),
            AdapterError::Permanent { .. } | AdapterError::Unauthorized(_) => (false, true, None),
        };

        Self {
            error_code: error.error_code(),
            message: error.to_string(),
            breaker_failure,
            terminal,
            min_delay_ms,
        }
    }
}

#[derive(Clone)]
pub struct JobExecutor {
    db: Database,
    limiter: Arc<RateLimiter>,
    breaker: CircuitBreaker,
    credentials: Arc<CredentialManager>,
    adapters: AdapterRegistry,
    settings: ExecutorSettings,
    events: EventBus,
    metrics: Arc<Metrics>,
}

impl JobExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        limiter: Arc<RateLimiter>,
        breaker: CircuitBreaker,
        credentials: Arc<CredentialManager>,
        adapters: AdapterRegistry,
        settings: ExecutorSettings,
        events: EventBus,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            db,
            limiter,
            breaker,
            credentials,
            adapters,
            settings,
            events,
            metrics,
        }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Run one attempt of `job_id`
    pub async fn execute(&self, job_id: &str, now: i64) -> Result<ExecutionOutcome> {
        let Some(job) = self.db.claim_job(job_id, now).await? else {
            if self.db.get_job(job_id).await?.is_none() {
                return Err(SyndicateError::NotFound(format!("job {}", job_id)));
            }
            tracing::debug!(job_id, "Job already claimed, not pending or not yet due");
            return Ok(ExecutionOutcome::NotClaimed);
        };

        self.metrics.job_claimed();
        self.events.emit(Event::JobClaimed {
            job_id: job.job_id.clone(),
            token_id: job.token_id.clone(),
        });

        let span = tracing::info_span!(
            "execute",
            job_id = %job.job_id,
            token_id = %job.token_id,
            platform = %job.platform,
            attempt = job.attempts + 1
        );

        match self.run_claimed(&job, now).instrument(span).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                // Store trouble mid-attempt: hand the job back untouched
                tracing::error!(job_id = %job.job_id, error = %e, "Execution aborted");
                self.db.release_job(&job.job_id, now, now).await?;
                Err(e)
            }
        }
    }

    async fn run_claimed(&self, job: &PublishJob, now: i64) -> Result<ExecutionOutcome> {
        if let Decision::Denied { retry_after_ms } = self
            .limiter
            .allow(job.platform, &job.token_id, &self.settings.endpoint, now)
            .await
        {
            return self.reschedule(job, "rate_limited", now + retry_after_ms, now).await;
        }

        let permit = self.breaker.acquire(&job.token_id, now).await?;
        if let Permit::Denied { retry_after_ms } = permit {
            return self.reschedule(job, "circuit_open", now + retry_after_ms, now).await;
        }
        let trial = permit == Permit::Trial;

        let result = self.attempt(job, trial, now).await;
        if result.is_err() && trial {
            if let Err(e) = self.breaker.release_trial(&job.token_id, now).await {
                tracing::warn!(error = %e, "Could not release half-open trial");
            }
        }
        result
    }

    async fn attempt(&self, job: &PublishJob, trial: bool, now: i64) -> Result<ExecutionOutcome> {
        let Some(adapter) = self.adapters.get(job.platform) else {
            let attempt = FailedAttempt {
                error_code: ADAPTER_MISSING.to_string(),
                message: format!("no adapter registered for {}", job.platform),
                breaker_failure: false,
                terminal: true,
                min_delay_ms: None,
            };
            return self.book_failure(job, attempt, trial, now).await;
        };

        let token = match self
            .credentials
            .get_valid_access_token(&job.token_id, now)
            .await
        {
            Ok(token) => token,
            Err(SyndicateError::Credential(e)) => {
                let attempt = FailedAttempt {
                    error_code: e.error_code().to_string(),
                    message: e.to_string(),
                    breaker_failure: e.is_transient(),
                    terminal: !e.is_transient(),
                    min_delay_ms: None,
                };
                return self.book_failure(job, attempt, trial, now).await;
            }
            Err(e) => return Err(e),
        };

        let result =
            match tokio::time::timeout(self.settings.adapter_timeout, adapter.publish(&token, &job.payload))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(AdapterError::Timeout),
            };
        drop(token);

        match result {
            Ok(receipt) => self.book_success(job, receipt, now).await,
            Err(error) => {
                if let AdapterError::RateLimited { retry_after_ms } = &error {
                    self.limiter
                        .record_platform_limit(
                            job.platform,
                            &job.token_id,
                            &self.settings.endpoint,
                            *retry_after_ms,
                            now,
                        )
                        .await?;
                }
                self.book_failure(job, FailedAttempt::from_adapter(&error), trial, now)
                    .await
            }
        }
    }

    async fn reschedule(
        &self,
        job: &PublishJob,
        reason: &str,
        run_at: i64,
        now: i64,
    ) -> Result<ExecutionOutcome> {
        self.db.release_job(&job.job_id, run_at, now).await?;
        self.metrics.job_rescheduled();
        tracing::debug!(reason, run_at, "Job deferred without an attempt");
        self.events.emit(Event::JobRescheduled {
            job_id: job.job_id.clone(),
            token_id: job.token_id.clone(),
            reason: reason.to_string(),
            run_at,
        });

        Ok(ExecutionOutcome::Rescheduled {
            reason: reason.to_string(),
            run_at,
        })
    }

    async fn book_success(
        &self,
        job: &PublishJob,
        receipt: PublishReceipt,
        now: i64,
    ) -> Result<ExecutionOutcome> {
        let attempts = job.attempts + 1;
        self.db
            .complete_job(
                &job.job_id,
                attempts,
                &receipt.external_id,
                receipt.external_url.as_deref(),
                now,
            )
            .await?;
        self.breaker.record_success(&job.token_id, now).await?;
        self.db.mark_token_published(&job.token_id, now).await?;

        // Platform says the quota is spent even though we think otherwise
        if let Some(hint) = receipt.rate_limit_hint {
            if hint.remaining == Some(0) {
                self.limiter
                    .record_platform_limit(
                        job.platform,
                        &job.token_id,
                        &self.settings.endpoint,
                        hint.reset_after_ms,
                        now,
                    )
                    .await?;
            }
        }

        self.metrics.job_succeeded();
        tracing::info!(external_id = %receipt.external_id, attempts, "Published");
        self.events.emit(Event::JobSucceeded {
            job_id: job.job_id.clone(),
            token_id: job.token_id.clone(),
            external_id: receipt.external_id.clone(),
        });

        Ok(ExecutionOutcome::Succeeded {
            external_id: receipt.external_id,
        })
    }

    async fn book_failure(
        &self,
        job: &PublishJob,
        attempt: FailedAttempt,
        trial: bool,
        now: i64,
    ) -> Result<ExecutionOutcome> {
        let attempts = job.attempts + 1;

        if attempt.breaker_failure {
            self.breaker.record_failure(&job.token_id, now).await?;
        } else if trial {
            self.breaker.release_trial(&job.token_id, now).await?;
        }

        let update = AttemptUpdate {
            attempts,
            error_code: &attempt.error_code,
            last_error: &attempt.message,
            now,
        };

        let terminal = attempt.terminal || self.settings.retry.exhausted(attempts);
        self.events.emit(Event::JobFailed {
            job_id: job.job_id.clone(),
            token_id: job.token_id.clone(),
            error_code: attempt.error_code.clone(),
            attempts,
            terminal,
        });

        if terminal {
            self.db.fail_job(&job.job_id, &update).await?;
            self.metrics.job_failed();
            tracing::warn!(
                error_code = %attempt.error_code,
                error = %attempt.message,
                attempts,
                "Job failed"
            );
            return Ok(ExecutionOutcome::Failed {
                attempts,
                error_code: attempt.error_code,
            });
        }

        let delay = self
            .settings
            .retry
            .backoff_ms(attempts)
            .max(attempt.min_delay_ms.unwrap_or(0));
        let run_at = now + delay;
        self.db.retry_job(&job.job_id, &update, run_at).await?;
        self.metrics.job_retried();
        tracing::info!(
            error_code = %attempt.error_code,
            error = %attempt.message,
            attempts,
            retry_in_s = delay / SECOND_MS,
            "Attempt failed, retry scheduled"
        );

        Ok(ExecutionOutcome::RetryScheduled {
            attempts,
            run_at,
            error_code: attempt.error_code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::BreakerPolicy;
    use crate::credentials::{ConnectRequest, OAuthGrant, TokenCipher};
    use crate::db::test_support::{job, setup_test_db};
    use crate::error::RefreshError;
    use crate::platforms::mock::MockAdapter;
    use crate::platforms::PlatformAdapter;
    use crate::rate_limiter::SqliteWindowStore;
    use crate::types::{
        CircuitState, JobStatus, Platform, RateLimitHint, WindowSpec, DAY_MS, MINUTE_MS,
    };
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    const NOW: i64 = 1_767_225_600_000;

    struct Harness {
        executor: JobExecutor,
        adapter: Arc<MockAdapter>,
        db: Database,
        metrics: Arc<Metrics>,
        _dir: TempDir,
    }

    async fn harness(windows: Vec<WindowSpec>, adapter: MockAdapter) -> Harness {
        harness_with_timeout(windows, adapter, Duration::from_secs(5)).await
    }

    async fn harness_with_timeout(
        windows: Vec<WindowSpec>,
        adapter: MockAdapter,
        adapter_timeout: Duration,
    ) -> Harness {
        let (db, dir) = setup_test_db().await;
        let events = EventBus::default();
        let metrics = Arc::new(Metrics::new());
        let adapter = Arc::new(adapter);
        let platform = adapter.platform();

        let mut adapters = AdapterRegistry::new();
        adapters.register(adapter.clone());

        let mut table = BTreeMap::new();
        table.insert(platform, windows);
        let limiter = Arc::new(RateLimiter::new(
            Arc::new(SqliteWindowStore::new(db.clone())),
            table,
            metrics.clone(),
        ));
        let breaker = CircuitBreaker::new(
            db.clone(),
            BreakerPolicy {
                failure_threshold: 2,
                cooldown_ms: 5 * MINUTE_MS,
                trial_wait_ms: 30_000,
            },
            events.clone(),
            metrics.clone(),
        );
        let credentials = Arc::new(CredentialManager::new(
            db.clone(),
            Arc::new(TokenCipher::generate()),
            adapters.clone(),
            events.clone(),
            metrics.clone(),
        )
        .with_refresh_timeout(adapter_timeout));
        credentials
            .connect_account(
                ConnectRequest {
                    account_id: "acct-1".to_string(),
                    user_id: None,
                    platform,
                    grant: OAuthGrant::new("access-0")
                        .with_refresh_token("refresh-0")
                        .expires_in(DAY_MS),
                },
                NOW,
            )
            .await
            .unwrap();

        let settings = ExecutorSettings {
            retry: RetryPolicy {
                retry_limit: 3,
                backoff_base_ms: 1_000,
                backoff_cap_ms: 60_000,
            },
            adapter_timeout,
            endpoint: "publish".to_string(),
        };

        let executor = JobExecutor::new(
            db.clone(),
            limiter,
            breaker,
            credentials,
            adapters,
            settings,
            events,
            metrics.clone(),
        );

        Harness {
            executor,
            adapter,
            db,
            metrics,
            _dir: dir,
        }
    }

    async fn enqueue(h: &Harness, job_id: &str) {
        let platform = h.adapter.platform();
        assert!(h.db.insert_job(&job(job_id, "acct-1", platform, NOW)).await.unwrap());
    }

    #[test]
    fn test_backoff_curve() {
        let policy = RetryPolicy {
            retry_limit: 3,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 10_000,
        };
        assert_eq!(policy.backoff_ms(0), 1_000);
        assert_eq!(policy.backoff_ms(1), 2_000);
        assert_eq!(policy.backoff_ms(3), 8_000);
        assert_eq!(policy.backoff_ms(4), 10_000);
        assert_eq!(policy.backoff_ms(80), 10_000);
    }

    #[tokio::test]
    async fn test_success_path() {
        let h = harness(vec![], MockAdapter::new(Platform::X)).await;
        enqueue(&h, "j1").await;

        let outcome = h.executor.execute("j1", NOW).await.unwrap();
        assert_eq!(
            outcome,
            ExecutionOutcome::Succeeded {
                external_id: "mock-x-1".to_string()
            }
        );

        let stored = h.db.get_job("j1").await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Succeeded);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.external_id.as_deref(), Some("mock-x-1"));
        assert_eq!(stored.completed_at, Some(NOW));

        let record = h.db.get_token_record("acct-1").await.unwrap().unwrap();
        assert_eq!(record.last_scheduled_at, Some(NOW));
        assert_eq!(h.adapter.published()[0].access_token, "access-0");

        // Second run finds nothing to claim
        assert_eq!(
            h.executor.execute("j1", NOW).await.unwrap(),
            ExecutionOutcome::NotClaimed
        );
    }

    #[tokio::test]
    async fn test_rate_limited_job_is_deferred_not_failed() {
        let h = harness(vec![WindowSpec::per_minute(1)], MockAdapter::new(Platform::TikTok)).await;
        enqueue(&h, "j1").await;
        enqueue(&h, "j2").await;

        assert!(matches!(
            h.executor.execute("j1", NOW).await.unwrap(),
            ExecutionOutcome::Succeeded { .. }
        ));

        let outcome = h.executor.execute("j2", NOW + 1).await.unwrap();
        assert_eq!(
            outcome,
            ExecutionOutcome::Rescheduled {
                reason: "rate_limited".to_string(),
                run_at: NOW + MINUTE_MS,
            }
        );

        let stored = h.db.get_job("j2").await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.attempts, 0);
        assert_eq!(stored.scheduled_at, NOW + MINUTE_MS);
        assert_eq!(h.adapter.publish_call_count(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_retry_then_fail() {
        let adapter = MockAdapter::new(Platform::X);
        adapter.fail_publish(
            AdapterError::Transient {
                code: "502".into(),
                message: "bad gateway".into(),
                retry_after_ms: None,
            },
            3,
        );
        let h = harness(vec![], adapter).await;
        enqueue(&h, "j1").await;

        let first = h.executor.execute("j1", NOW).await.unwrap();
        assert_eq!(
            first,
            ExecutionOutcome::RetryScheduled {
                attempts: 1,
                run_at: NOW + 2_000,
                error_code: "transient:502".to_string(),
            }
        );

        // Second failure opens the breaker (threshold 2)
        let second = h.executor.execute("j1", NOW + 2_000).await.unwrap();
        assert!(matches!(second, ExecutionOutcome::RetryScheduled { attempts: 2, .. }));
        let record = h.db.get_token_record("acct-1").await.unwrap().unwrap();
        assert_eq!(record.circuit_breaker_state, CircuitState::Open);

        // While open the job is deferred without an attempt
        let deferred = h.executor.execute("j1", NOW + 10_000).await.unwrap();
        assert!(matches!(
            deferred,
            ExecutionOutcome::Rescheduled { ref reason, .. } if reason == "circuit_open"
        ));

        // After cooldown the trial fails and retries are exhausted
        let later = NOW + 2_000 + 5 * MINUTE_MS;
        let last = h.executor.execute("j1", later).await.unwrap();
        assert_eq!(
            last,
            ExecutionOutcome::Failed {
                attempts: 3,
                error_code: "transient:502".to_string(),
            }
        );
        let stored = h.db.get_job("j1").await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error_code.as_deref(), Some("transient:502"));
        assert_eq!(h.metrics.snapshot().jobs_failed, 1);
    }

    #[tokio::test]
    async fn test_backoff_is_not_skipped_by_early_execute() {
        let adapter = MockAdapter::new(Platform::X);
        adapter.fail_publish(
            AdapterError::Transient {
                code: "503".into(),
                message: "unavailable".into(),
                retry_after_ms: None,
            },
            1,
        );
        let h = harness(vec![], adapter).await;
        enqueue(&h, "j1").await;

        assert!(matches!(
            h.executor.execute("j1", NOW).await.unwrap(),
            ExecutionOutcome::RetryScheduled { run_at, .. } if run_at == NOW + 2_000
        ));

        // A worker still holding the job id from before the failure
        assert_eq!(
            h.executor.execute("j1", NOW + 1).await.unwrap(),
            ExecutionOutcome::NotClaimed
        );
        assert_eq!(h.adapter.publish_call_count(), 1);
        let stored = h.db.get_job("j1").await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.attempts, 1);

        assert_eq!(
            h.executor.execute("j1", NOW + 2_000).await.unwrap(),
            ExecutionOutcome::Succeeded {
                external_id: "mock-x-2".to_string()
            }
        );
        assert_eq!(h.db.get_job("j1").await.unwrap().unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn test_permanent_rejection_skips_retries_and_breaker() {
        let adapter = MockAdapter::new(Platform::Instagram);
        adapter.fail_publish(
            AdapterError::Permanent {
                code: "policy".into(),
                message: "content policy".into(),
            },
            1,
        );
        let h = harness(vec![], adapter).await;
        enqueue(&h, "j1").await;

        let outcome = h.executor.execute("j1", NOW).await.unwrap();
        assert_eq!(
            outcome,
            ExecutionOutcome::Failed {
                attempts: 1,
                error_code: "content_rejected:policy".to_string(),
            }
        );
        let record = h.db.get_token_record("acct-1").await.unwrap().unwrap();
        assert_eq!(record.circuit_breaker_failures, 0);
    }

    #[tokio::test]
    async fn test_platform_429_penalises_limiter_without_breaker_failure() {
        let adapter = MockAdapter::new(Platform::Reddit);
        adapter.fail_publish(
            AdapterError::RateLimited {
                retry_after_ms: Some(90_000),
            },
            1,
        );
        let h = harness(vec![WindowSpec::per_minute(5)], adapter).await;
        enqueue(&h, "j1").await;

        let outcome = h.executor.execute("j1", NOW).await.unwrap();
        assert_eq!(
            outcome,
            ExecutionOutcome::RetryScheduled {
                attempts: 1,
                run_at: NOW + 90_000,
                error_code: "rate_limited".to_string(),
            }
        );

        let record = h.db.get_token_record("acct-1").await.unwrap().unwrap();
        assert_eq!(record.circuit_breaker_failures, 0);
        assert_eq!(h.metrics.snapshot().rate_limit_penalties, 1);

        // The penalty blocks the key until the hinted time
        assert!(!h
            .executor
            .limiter
            .allow(Platform::Reddit, "acct-1", "publish", NOW + 1_000)
            .await
            .is_allowed());
    }

    #[tokio::test]
    async fn test_exhausted_quota_hint_penalises_after_success() {
        let adapter = MockAdapter::new(Platform::X);
        adapter.push_publish(Ok(PublishReceipt {
            external_id: "tweet-1".into(),
            external_url: None,
            rate_limit_hint: Some(RateLimitHint {
                remaining: Some(0),
                reset_after_ms: Some(120_000),
            }),
        }));
        let h = harness(vec![WindowSpec::per_minute(10)], adapter).await;
        enqueue(&h, "j1").await;

        assert!(matches!(
            h.executor.execute("j1", NOW).await.unwrap(),
            ExecutionOutcome::Succeeded { .. }
        ));
        assert_eq!(h.metrics.snapshot().rate_limit_penalties, 1);
    }

    #[tokio::test]
    async fn test_revoked_credentials_fail_terminally() {
        let adapter = MockAdapter::new(Platform::Reddit);
        adapter.push_refresh(Err(RefreshError::Revoked("invalid_grant".into())));
        let h = harness(vec![], adapter).await;
        enqueue(&h, "j1").await;

        // A day later the access token has expired and must be refreshed
        let later = NOW + DAY_MS;
        let outcome = h.executor.execute("j1", later).await.unwrap();
        assert_eq!(
            outcome,
            ExecutionOutcome::Failed {
                attempts: 1,
                error_code: "reauth_required".to_string(),
            }
        );
        assert_eq!(h.adapter.publish_call_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_adapter() {
        let h = harness(vec![], MockAdapter::new(Platform::X)).await;
        h.db.upsert_token_record(&crate::types::TokenRecord::new("acct-2", Platform::TikTok, NOW))
            .await
            .unwrap();
        h.db.insert_job(&job("j9", "acct-2", Platform::TikTok, NOW))
            .await
            .unwrap();

        let outcome = h.executor.execute("j9", NOW).await.unwrap();
        assert_eq!(
            outcome,
            ExecutionOutcome::Failed {
                attempts: 1,
                error_code: ADAPTER_MISSING.to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let adapter = MockAdapter::new(Platform::X).with_delay(Duration::from_millis(200));
        let mut h = harness(vec![], adapter).await;
        h.executor.settings.adapter_timeout = Duration::from_millis(20);
        enqueue(&h, "j1").await;

        let outcome = h.executor.execute("j1", NOW).await.unwrap();
        assert!(matches!(
            outcome,
            ExecutionOutcome::RetryScheduled { ref error_code, .. } if error_code == "timeout"
        ));
        let record = h.db.get_token_record("acct-1").await.unwrap().unwrap();
        assert_eq!(record.circuit_breaker_failures, 1);
    }

    #[tokio::test]
    async fn test_refresh_is_bounded_by_adapter_timeout() {
        let adapter = MockAdapter::new(Platform::X).with_delay(Duration::from_millis(400));
        let h = harness_with_timeout(vec![], adapter, Duration::from_millis(20)).await;
        enqueue(&h, "j1").await;

        // Inside the refresh margin but not yet expired
        let late = NOW + DAY_MS - MINUTE_MS;
        let started = std::time::Instant::now();
        let outcome = h.executor.execute("j1", late).await.unwrap();

        assert!(started.elapsed() < Duration::from_millis(300));
        assert_eq!(h.adapter.refresh_call_count(), 1);
        assert_eq!(h.metrics.snapshot().token_refresh_failures, 1);
        assert!(matches!(
            outcome,
            ExecutionOutcome::RetryScheduled { ref error_code, .. } if error_code == "timeout"
        ));
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let h = harness(vec![], MockAdapter::new(Platform::X)).await;
        assert!(matches!(
            h.executor.execute("nope", NOW).await,
            Err(SyndicateError::NotFound(_))
        ));
    }
}
