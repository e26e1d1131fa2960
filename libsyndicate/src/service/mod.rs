//! Service layer for Syndicate
//!
//! [`SyndicateService`] wires every component from one [`Config`]: the
//! shared database, rate limiter, circuit breaker, fair-share scheduler,
//! credential manager, executor, job queue, event bus and metrics. Binaries
//! and embedders go through it instead of assembling the pieces by hand.
//!
//! # Architecture
//!
//! - `JobQueue`: enqueue, status, cancel, list
//! - `CredentialManager`: connect, disconnect, live access tokens
//! - `FairShareScheduler` / `CircuitBreaker` / `RateLimiter`: eligibility
//! - `WorkerPool`: executes due jobs
//! - `EventBus` and `Metrics`: operational signals; counters are flushed
//!   into the shared database so `health` reports totals across processes
//!
//! The credential manager, executor and worker pool need the master key.
//! Without one the service still opens, so read-only commands keep working.
//!
//! # Example
//!
//! ```no_run
//! use libsyndicate::platforms::AdapterRegistry;
//! use libsyndicate::queue::EnqueueRequest;
//! use libsyndicate::service::SyndicateService;
//! use libsyndicate::types::{JobPayload, Platform};
//!
//! # async fn example() -> libsyndicate::Result<()> {
//! let service = SyndicateService::new(AdapterRegistry::new()).await?;
//! let now = chrono::Utc::now().timestamp_millis();
//!
//! let request = EnqueueRequest::new("acct-1", Platform::TikTok, JobPayload::text("hello"));
//! let outcome = service.queue().enqueue(request, now).await?;
//! println!("job {}", outcome.job_id());
//! # Ok(())
//! # }
//! ```

pub mod events;
pub mod health;
pub mod metrics;

use std::sync::Arc;
use std::time::Duration;

use self::events::{EventBus, EventReceiver};
use self::health::HealthReport;
use self::metrics::{Metrics, MetricsRecorder, MetricsSnapshot};
use crate::circuit_breaker::{BreakerPolicy, CircuitBreaker};
use crate::config::{resolve_db_path, Config};
use crate::credentials::{CredentialManager, TokenCipher};
use crate::db::Database;
use crate::error::{ConfigError, CredentialError, Result, SyndicateError};
use crate::executor::{ExecutorSettings, JobExecutor};
use crate::platforms::AdapterRegistry;
use crate::queue::JobQueue;
use crate::rate_limiter::{RateLimiter, SqliteWindowStore};
use crate::scheduler::{FairShareScheduler, SchedulerPolicy};
use crate::types::SECOND_MS;
use crate::worker::{WorkerPool, WorkerSettings};

/// Main service facade
pub struct SyndicateService {
    config: Arc<Config>,
    db: Database,
    adapters: AdapterRegistry,
    limiter: Arc<RateLimiter>,
    breaker: CircuitBreaker,
    scheduler: FairShareScheduler,
    queue: JobQueue,
    credentials: Option<Arc<CredentialManager>>,
    executor: Option<JobExecutor>,
    event_bus: EventBus,
    metrics: Arc<Metrics>,
    recorder: MetricsRecorder,
}

impl SyndicateService {
    /// Load configuration from the default location
    pub async fn new(adapters: AdapterRegistry) -> Result<Self> {
        let config = Config::load()?;
        Self::from_config(config, adapters).await
    }

    /// Open the database and wire components. The master key is read from
    /// the environment or the configured key file when present.
    pub async fn from_config(config: Config, adapters: AdapterRegistry) -> Result<Self> {
        let cipher = match TokenCipher::from_config(&config.credentials) {
            Ok(cipher) => Some(cipher),
            Err(SyndicateError::Credential(CredentialError::MasterKeyNotSet)) => {
                tracing::debug!("No master key configured; credential operations disabled");
                None
            }
            Err(e) => return Err(e),
        };
        Self::build(config, adapters, cipher).await
    }

    /// Same as [`from_config`](Self::from_config) with an explicit cipher
    pub async fn with_cipher(
        config: Config,
        adapters: AdapterRegistry,
        cipher: TokenCipher,
    ) -> Result<Self> {
        Self::build(config, adapters, Some(cipher)).await
    }

    async fn build(
        config: Config,
        adapters: AdapterRegistry,
        cipher: Option<TokenCipher>,
    ) -> Result<Self> {
        let db_path = resolve_db_path(Some(&config.database.path))?;
        let db_path_str = db_path.to_str().ok_or_else(|| {
            SyndicateError::Config(ConfigError::InvalidValue {
                field: "database.path".to_string(),
                reason: "path is not valid UTF-8".to_string(),
            })
        })?;
        let db = Database::new(db_path_str).await?;

        let event_bus = EventBus::default();
        let metrics = Arc::new(Metrics::new());

        let mut limiter = RateLimiter::new(
            Arc::new(SqliteWindowStore::new(db.clone())),
            config.window_specs(),
            metrics.clone(),
        );
        if !config.rate_limiter.fail_open {
            limiter = limiter.with_fail_closed(config.rate_limiter.fail_closed_retry_ms as i64);
        }
        let limiter = Arc::new(limiter);

        let breaker = CircuitBreaker::new(
            db.clone(),
            BreakerPolicy::from(&config.circuit_breaker),
            event_bus.clone(),
            metrics.clone(),
        );
        let scheduler = FairShareScheduler::new(
            db.clone(),
            breaker.clone(),
            SchedulerPolicy::from(&config.scheduler),
            event_bus.clone(),
            metrics.clone(),
        );
        let queue = JobQueue::new(
            db.clone(),
            scheduler.clone(),
            event_bus.clone(),
            metrics.clone(),
        );

        let credentials = cipher.map(|cipher| {
            Arc::new(
                CredentialManager::new(
                    db.clone(),
                    Arc::new(cipher),
                    adapters.clone(),
                    event_bus.clone(),
                    metrics.clone(),
                )
                .with_refresh_margin_ms(config.credentials.refresh_margin_seconds as i64 * SECOND_MS)
                .with_refresh_timeout(Duration::from_secs(config.worker.adapter_timeout_seconds)),
            )
        });

        let executor = credentials.as_ref().map(|credentials| {
            JobExecutor::new(
                db.clone(),
                limiter.clone(),
                breaker.clone(),
                credentials.clone(),
                adapters.clone(),
                ExecutorSettings::new(&config.retry, &config.worker),
                event_bus.clone(),
                metrics.clone(),
            )
        });

        let recorder = MetricsRecorder::new(db.clone(), metrics.clone());

        Ok(Self {
            config: Arc::new(config),
            db,
            adapters,
            limiter,
            breaker,
            scheduler,
            queue,
            credentials,
            executor,
            event_bus,
            metrics,
            recorder,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn scheduler(&self) -> &FairShareScheduler {
        &self.scheduler
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Fails with `MasterKeyNotSet` when no master key was available
    pub fn credentials(&self) -> Result<&CredentialManager> {
        self.credentials
            .as_deref()
            .ok_or_else(|| CredentialError::MasterKeyNotSet.into())
    }

    pub fn executor(&self) -> Result<&JobExecutor> {
        self.executor
            .as_ref()
            .ok_or_else(|| CredentialError::MasterKeyNotSet.into())
    }

    /// Worker pool over the registered adapters
    pub fn worker_pool(&self) -> Result<WorkerPool> {
        let executor = self.executor()?.clone();
        Ok(WorkerPool::new(
            self.db.clone(),
            self.scheduler.clone(),
            executor,
            self.breaker.clone(),
            self.limiter.clone(),
            self.adapters.platforms(),
            WorkerSettings::from(&self.config.worker),
            self.recorder.clone(),
        ))
    }

    pub async fn health(&self, now: i64) -> Result<HealthReport> {
        HealthReport::collect(
            &self.db,
            SchedulerPolicy::from(&self.config.scheduler).starvation_threshold_ms,
            self.recorder.totals().await?,
            now,
        )
        .await
    }

    /// Persist this process's counters into the shared totals
    pub async fn flush_metrics(&self, now: i64) -> Result<MetricsSnapshot> {
        self.recorder.flush(now).await
    }

    pub fn events(&self) -> &EventBus {
        &self.event_bus
    }

    /// Receiver for every event emitted from now on
    pub fn subscribe(&self) -> EventReceiver {
        self.event_bus.subscribe()
    }
}
