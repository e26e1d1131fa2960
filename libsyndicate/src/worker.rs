//! Worker pool
//!
//! Each worker task repeatedly asks the fair-share scheduler for the next
//! token with a due job on every registered platform and runs that token's
//! earliest due job through the executor. Workers share nothing in memory;
//! claims and quota all go through the database, so pools on different hosts
//! can serve the same store.
//!
//! A separate maintenance task purges expired rate-limit entries, recovers
//! jobs orphaned in `running` by a crashed worker and reports starved tokens.
//! Each pass also flushes this process's counters into the shared totals and
//! logs them.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::Instrument;

use crate::circuit_breaker::CircuitBreaker;
use crate::clock::{Clock, SystemClock};
use crate::config::WorkerConfig;
use crate::db::{AttemptUpdate, Database};
use crate::error::Result;
use crate::executor::{ExecutionOutcome, JobExecutor, RetryPolicy, STALE_CLAIM};
use crate::rate_limiter::RateLimiter;
use crate::scheduler::{FairShareScheduler, StarvedToken};
use crate::service::metrics::{MetricsRecorder, MetricsSnapshot};
use crate::types::{CircuitState, Platform, SECOND_MS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub workers: usize,
    pub poll_interval: Duration,
    pub stale_after_ms: i64,
    pub maintenance_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for WorkerSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            workers: config.workers.max(1),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            stale_after_ms: config.stale_after_seconds as i64 * SECOND_MS,
            maintenance_interval: Duration::from_secs(config.maintenance_interval_seconds),
        }
    }
}

/// Result of one maintenance pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub purged_entries: u64,
    pub recovered_jobs: usize,
    pub failed_stale_jobs: usize,
    pub starved_tokens: Vec<StarvedToken>,
    /// This process's counters as flushed by the pass
    pub metrics: MetricsSnapshot,
}

#[derive(Clone)]
pub struct WorkerPool {
    db: Database,
    scheduler: FairShareScheduler,
    executor: JobExecutor,
    breaker: CircuitBreaker,
    limiter: Arc<RateLimiter>,
    platforms: Vec<Platform>,
    settings: WorkerSettings,
    clock: Arc<dyn Clock>,
    recorder: MetricsRecorder,
}

impl WorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        scheduler: FairShareScheduler,
        executor: JobExecutor,
        breaker: CircuitBreaker,
        limiter: Arc<RateLimiter>,
        platforms: Vec<Platform>,
        settings: WorkerSettings,
        recorder: MetricsRecorder,
    ) -> Self {
        Self {
            db,
            scheduler,
            executor,
            breaker,
            limiter,
            platforms,
            settings,
            clock: Arc::new(SystemClock),
            recorder,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// One scheduling round: at most one job per platform
    pub async fn dispatch_once(&self, now: i64) -> Result<Vec<ExecutionOutcome>> {
        let mut outcomes = Vec::new();

        for &platform in &self.platforms {
            let Some(token_id) = self.scheduler.select_next_due_token(platform, now).await? else {
                continue;
            };
            self.scheduler.record_selection(&token_id, now).await?;

            let Some(job) = self.db.next_due_job(&token_id, now).await? else {
                // Another worker took it between selection and lookup
                continue;
            };

            let outcome = self.executor.execute(&job.job_id, now).await?;
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }

    /// Dispatch until a round claims nothing. Returns the number of attempts
    /// that ran (including deferrals).
    pub async fn run_until_idle(&self, max_rounds: usize) -> Result<usize> {
        let mut executed = 0;
        for _ in 0..max_rounds {
            let outcomes = self.dispatch_once(self.clock.now_ms()).await?;
            let claimed = outcomes
                .iter()
                .filter(|o| !matches!(o, ExecutionOutcome::NotClaimed))
                .count();
            if claimed == 0 {
                break;
            }
            executed += claimed;
        }
        Ok(executed)
    }

    pub async fn run_maintenance(&self, now: i64) -> Result<MaintenanceReport> {
        let purged_entries = self.limiter.purge_expired(now).await?;
        let (recovered_jobs, failed_stale_jobs) = self.recover_stale_jobs(now).await?;
        let starved_tokens = self.scheduler.detect_starvation(now).await?;
        let metrics = self.recorder.flush(now).await?;

        tracing::debug!(
            purged_entries,
            recovered_jobs,
            failed_stale_jobs,
            starved = starved_tokens.len(),
            "Maintenance pass complete"
        );
        tracing::info!(
            rate_limit_hits = metrics.rate_limit_hits,
            rate_limit_penalties = metrics.rate_limit_penalties,
            jobs_claimed = metrics.jobs_claimed,
            jobs_succeeded = metrics.jobs_succeeded,
            jobs_failed = metrics.jobs_failed,
            jobs_retried = metrics.jobs_retried,
            jobs_rescheduled = metrics.jobs_rescheduled,
            jobs_recovered = metrics.jobs_recovered,
            token_refreshes = metrics.token_refreshes,
            token_refresh_failures = metrics.token_refresh_failures,
            circuit_opens = metrics.circuit_opens,
            starved_tokens = metrics.starved_tokens,
            "Worker metrics"
        );

        Ok(MaintenanceReport {
            purged_entries,
            recovered_jobs,
            failed_stale_jobs,
            starved_tokens,
            metrics,
        })
    }

    /// Jobs stuck in `running` past the stale threshold count as a failed
    /// attempt: back to pending with backoff, or `failed` with `stale_claim`.
    /// Returns (recovered, failed).
    pub async fn recover_stale_jobs(&self, now: i64) -> Result<(usize, usize)> {
        let retry: RetryPolicy = self.executor.settings().retry;
        let stale = self
            .db
            .list_stale_running(now - self.settings.stale_after_ms)
            .await?;

        let (mut recovered, mut failed) = (0, 0);
        for job in stale {
            let attempts = job.attempts + 1;
            let update = AttemptUpdate {
                attempts,
                error_code: STALE_CLAIM,
                last_error: "worker stopped responding while the job was running",
                now,
            };

            if retry.exhausted(attempts) {
                self.db.fail_job(&job.job_id, &update).await?;
                self.recorder.metrics().job_failed();
                failed += 1;
            } else {
                self.db
                    .retry_job(&job.job_id, &update, now + retry.backoff_ms(attempts))
                    .await?;
                self.recorder.metrics().job_recovered();
                recovered += 1;
            }

            // A crashed worker may have been holding the half-open trial
            if let Some(record) = self.db.get_token_record(&job.token_id).await? {
                if record.circuit_breaker_state == CircuitState::HalfOpen && record.trial_in_flight {
                    self.breaker.release_trial(&job.token_id, now).await?;
                }
            }

            tracing::warn!(
                job_id = %job.job_id,
                token_id = %job.token_id,
                claimed_at = job.claimed_at,
                attempts,
                "Recovered stale running job"
            );
        }

        Ok((recovered, failed))
    }

    /// Run workers and maintenance until `shutdown` is set. In-flight jobs
    /// finish before their task exits.
    pub async fn start(&self, shutdown: Arc<AtomicBool>) -> Result<()> {
        tracing::info!(
            workers = self.settings.workers,
            platforms = ?self.platforms,
            "Worker pool starting"
        );

        let mut handles = Vec::with_capacity(self.settings.workers + 1);
        for worker_id in 0..self.settings.workers {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            let span = tracing::info_span!("worker", worker_id);
            handles.push(tokio::spawn(
                async move { pool.worker_loop(shutdown).await }.instrument(span),
            ));
        }

        let pool = self.clone();
        let maintenance_shutdown = shutdown.clone();
        handles.push(tokio::spawn(
            async move { pool.maintenance_loop(maintenance_shutdown).await }
                .instrument(tracing::info_span!("maintenance")),
        ));

        for joined in join_all(handles).await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }

        // Counters gathered since the last maintenance pass
        if let Err(e) = self.recorder.flush(self.clock.now_ms()).await {
            tracing::warn!(error = %e, "Could not flush metrics on shutdown");
        }

        tracing::info!("Worker pool stopped");
        Ok(())
    }

    async fn worker_loop(&self, shutdown: Arc<AtomicBool>) {
        while !shutdown.load(Ordering::Relaxed) {
            match self.dispatch_once(self.clock.now_ms()).await {
                // Keep draining while there is work
                Ok(outcomes) if outcomes.iter().any(|o| !matches!(o, ExecutionOutcome::NotClaimed)) => {
                    continue
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Dispatch failed"),
            }
            pause(self.settings.poll_interval, &shutdown).await;
        }
    }

    async fn maintenance_loop(&self, shutdown: Arc<AtomicBool>) {
        while !shutdown.load(Ordering::Relaxed) {
            if let Err(e) = self.run_maintenance(self.clock.now_ms()).await {
                tracing::error!(error = %e, "Maintenance failed");
            }
            pause(self.settings.maintenance_interval, &shutdown).await;
        }
    }
}

/// Sleep in short slices so shutdown is noticed promptly
async fn pause(total: Duration, shutdown: &AtomicBool) {
    let slice = Duration::from_millis(250);
    let mut remaining = total;
    while !remaining.is_zero() && !shutdown.load(Ordering::Relaxed) {
        let step = remaining.min(slice);
        sleep(step).await;
        remaining -= step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::BreakerPolicy;
    use crate::clock::ManualClock;
    use crate::credentials::{ConnectRequest, CredentialManager, OAuthGrant, TokenCipher};
    use crate::db::test_support::{job, setup_test_db};
    use crate::executor::ExecutorSettings;
    use crate::platforms::mock::MockAdapter;
    use crate::platforms::AdapterRegistry;
    use crate::rate_limiter::SqliteWindowStore;
    use crate::scheduler::SchedulerPolicy;
    use crate::service::events::EventBus;
    use crate::service::metrics::Metrics;
    use crate::types::{JobStatus, WindowSpec, DAY_MS, HOUR_MS, MINUTE_MS};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    const NOW: i64 = 1_767_225_600_000;

    struct Harness {
        pool: WorkerPool,
        db: Database,
        clock: Arc<ManualClock>,
        adapter: Arc<MockAdapter>,
        _dir: TempDir,
    }

    async fn harness(accounts: &[&str], windows: Vec<WindowSpec>) -> Harness {
        let (db, dir) = setup_test_db().await;
        let events = EventBus::default();
        let metrics = Arc::new(Metrics::new());
        let adapter = Arc::new(MockAdapter::new(Platform::TikTok));
        let mut adapters = AdapterRegistry::new();
        adapters.register(adapter.clone());

        let mut table = BTreeMap::new();
        table.insert(Platform::TikTok, windows);
        let limiter = Arc::new(RateLimiter::new(
            Arc::new(SqliteWindowStore::new(db.clone())),
            table,
            metrics.clone(),
        ));
        let breaker = CircuitBreaker::new(
            db.clone(),
            BreakerPolicy::default(),
            events.clone(),
            metrics.clone(),
        );
        let scheduler = FairShareScheduler::new(
            db.clone(),
            breaker.clone(),
            SchedulerPolicy::default(),
            events.clone(),
            metrics.clone(),
        );
        let credentials = Arc::new(CredentialManager::new(
            db.clone(),
            Arc::new(TokenCipher::generate()),
            adapters.clone(),
            events.clone(),
            metrics.clone(),
        ));
        for account in accounts {
            credentials
                .connect_account(
                    ConnectRequest {
                        account_id: account.to_string(),
                        user_id: None,
                        platform: Platform::TikTok,
                        grant: OAuthGrant::new("access")
                            .with_refresh_token("refresh")
                            .expires_in(7 * DAY_MS),
                    },
                    NOW,
                )
                .await
                .unwrap();
        }

        let executor = JobExecutor::new(
            db.clone(),
            limiter.clone(),
            breaker.clone(),
            credentials,
            adapters.clone(),
            ExecutorSettings::default(),
            events,
            metrics.clone(),
        );

        let clock = Arc::new(ManualClock::new(NOW));
        let pool = WorkerPool::new(
            db.clone(),
            scheduler,
            executor,
            breaker,
            limiter,
            adapters.platforms(),
            WorkerSettings {
                workers: 2,
                poll_interval: Duration::from_millis(10),
                stale_after_ms: 30 * MINUTE_MS,
                maintenance_interval: Duration::from_millis(50),
            },
            MetricsRecorder::new(db.clone(), metrics),
        )
        .with_clock(clock.clone());

        Harness {
            pool,
            db,
            clock,
            adapter,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_dispatch_runs_due_jobs_only() {
        let h = harness(&["a"], vec![]).await;
        h.db.insert_job(&job("due", "a", Platform::TikTok, NOW)).await.unwrap();
        h.db.insert_job(&job("later", "a", Platform::TikTok, NOW + HOUR_MS))
            .await
            .unwrap();

        let ran = h.pool.run_until_idle(10).await.unwrap();
        assert_eq!(ran, 1);
        assert_eq!(h.db.get_job("due").await.unwrap().unwrap().status, JobStatus::Succeeded);
        assert_eq!(h.db.get_job("later").await.unwrap().unwrap().status, JobStatus::Pending);

        h.clock.advance(HOUR_MS);
        assert_eq!(h.pool.run_until_idle(10).await.unwrap(), 1);
        assert_eq!(h.adapter.publish_call_count(), 2);
    }

    #[tokio::test]
    async fn test_rate_limit_spreads_one_token_over_time() {
        let h = harness(&["a"], vec![WindowSpec::per_minute(1)]).await;
        for id in ["j1", "j2"] {
            h.db.insert_job(&job(id, "a", Platform::TikTok, NOW)).await.unwrap();
        }

        h.pool.run_until_idle(10).await.unwrap();
        assert_eq!(h.adapter.publish_call_count(), 1);

        // The deferred job is not due again until the window slides
        h.clock.advance(MINUTE_MS - 1);
        h.pool.run_until_idle(10).await.unwrap();
        assert_eq!(h.adapter.publish_call_count(), 1);

        h.clock.advance(1);
        h.pool.run_until_idle(10).await.unwrap();
        assert_eq!(h.adapter.publish_call_count(), 2);
    }

    #[tokio::test]
    async fn test_round_robin_across_tokens() {
        let h = harness(&["a", "b", "c"], vec![]).await;
        for (i, token) in ["a", "a", "a", "b", "c"].iter().enumerate() {
            let id = format!("j{}", i);
            h.db.insert_job(&job(&id, token, Platform::TikTok, NOW)).await.unwrap();
        }

        // Three rounds, one job per round: every token is served once before
        // any token gets a second turn
        for step in 0..3 {
            h.clock.set(NOW + step);
            h.pool.dispatch_once(NOW + step).await.unwrap();
        }
        let mut served: Vec<String> = h
            .db
            .list_jobs(&crate::db::JobFilter {
                status: Some(JobStatus::Succeeded),
                ..Default::default()
            })
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.token_id)
            .collect();
        served.sort();
        assert_eq!(served, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_stale_running_job_recovered() {
        let h = harness(&["a"], vec![]).await;
        h.db.insert_job(&job("j1", "a", Platform::TikTok, NOW)).await.unwrap();
        assert!(h.db.claim_job("j1", NOW).await.unwrap().is_some());

        let report = h.pool.run_maintenance(NOW + 10 * MINUTE_MS).await.unwrap();
        assert_eq!(report.recovered_jobs, 0);

        let report = h.pool.run_maintenance(NOW + 31 * MINUTE_MS).await.unwrap();
        assert_eq!(report.recovered_jobs, 1);
        assert_eq!(report.metrics.jobs_recovered, 1);

        let stored = h.db.get_job("j1").await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.error_code.as_deref(), Some(STALE_CLAIM));
    }

    #[tokio::test]
    async fn test_maintenance_persists_counters_for_other_processes() {
        let h = harness(&["a"], vec![]).await;
        h.db.insert_job(&job("j1", "a", Platform::TikTok, NOW)).await.unwrap();
        assert_eq!(h.pool.run_until_idle(10).await.unwrap(), 1);

        let report = h.pool.run_maintenance(NOW).await.unwrap();
        assert_eq!(report.metrics.jobs_succeeded, 1);

        let observer = MetricsRecorder::new(h.db.clone(), Arc::new(Metrics::new()));
        let totals = observer.totals().await.unwrap();
        assert_eq!(totals.jobs_claimed, 1);
        assert_eq!(totals.jobs_succeeded, 1);

        // A second pass with no new activity leaves the totals alone
        h.pool.run_maintenance(NOW + MINUTE_MS).await.unwrap();
        assert_eq!(observer.totals().await.unwrap().jobs_succeeded, 1);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let h = harness(&["a", "b"], vec![]).await;
        for (i, token) in ["a", "b", "a", "b"].iter().enumerate() {
            let id = format!("j{}", i);
            h.db.insert_job(&job(&id, token, Platform::TikTok, NOW)).await.unwrap();
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let pool = h.pool.clone();
        let running = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { pool.start(shutdown).await }
        });

        for _ in 0..100 {
            if h.adapter.publish_call_count() == 4 {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        shutdown.store(true, Ordering::Relaxed);
        running.await.unwrap().unwrap();

        assert_eq!(h.adapter.publish_call_count(), 4);
    }
}
