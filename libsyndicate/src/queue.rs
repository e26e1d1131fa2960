//! Job queue API
//!
//! The caller-facing surface: submit a publish job for a token (or let the
//! scheduler pick one), look up its state, cancel it while it is still
//! pending, list jobs. Submission is idempotent on the dedupe key.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::db::{Database, JobFilter};
use crate::error::{DbError, Result, SyndicateError};
use crate::scheduler::FairShareScheduler;
use crate::service::events::{Event, EventBus};
use crate::service::metrics::Metrics;
use crate::types::{JobPayload, JobStatus, Platform, PublishJob};

#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueRequest {
    pub token_id: String,
    pub platform: Platform,
    pub payload: JobPayload,
    /// `None` means as soon as possible
    pub scheduled_at: Option<i64>,
    /// Derived from token, platform, payload and the requested run time when
    /// absent. An ASAP request has no run time in its derived key, so the same
    /// content on the same token is accepted once; pass an explicit key to
    /// post it again.
    pub dedupe_key: Option<String>,
}

impl EnqueueRequest {
    pub fn new(token_id: impl Into<String>, platform: Platform, payload: JobPayload) -> Self {
        Self {
            token_id: token_id.into(),
            platform,
            payload,
            scheduled_at: None,
            dedupe_key: None,
        }
    }

    pub fn at(mut self, scheduled_at: i64) -> Self {
        self.scheduled_at = Some(scheduled_at);
        self
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", content = "job_id", rename_all = "snake_case")]
pub enum EnqueueOutcome {
    Created(String),
    /// The dedupe key already existed; this is the original job
    Duplicate(String),
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> &str {
        match self {
            EnqueueOutcome::Created(id) | EnqueueOutcome::Duplicate(id) => id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, EnqueueOutcome::Duplicate(_))
    }
}

/// Job as reported to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobState {
    pub job_id: String,
    pub token_id: String,
    pub platform: Platform,
    pub status: JobStatus,
    pub scheduled_at: i64,
    pub attempts: u32,
    pub error_code: Option<String>,
    pub last_error: Option<String>,
    pub external_id: Option<String>,
    pub external_url: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
}

impl From<PublishJob> for JobState {
    fn from(job: PublishJob) -> Self {
        Self {
            job_id: job.job_id,
            token_id: job.token_id,
            platform: job.platform,
            status: job.status,
            scheduled_at: job.scheduled_at,
            attempts: job.attempts,
            error_code: job.error_code,
            last_error: job.last_error,
            external_id: job.external_id,
            external_url: job.external_url,
            created_at: job.created_at,
            updated_at: job.updated_at,
            completed_at: job.completed_at,
        }
    }
}

/// SHA-256 over token, platform, the canonical payload JSON and the
/// requested run time if any
pub fn derive_dedupe_key(
    token_id: &str,
    platform: Platform,
    payload: &JobPayload,
    scheduled_at: Option<i64>,
) -> Result<String> {
    let canonical = serde_json::to_string(payload).map_err(|e| DbError::InvalidRow {
        table: "publish_jobs",
        reason: format!("payload not serialisable: {}", e),
    })?;

    let mut hasher = Sha256::new();
    hasher.update(token_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(platform.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical.as_bytes());
    if let Some(at) = scheduled_at {
        hasher.update(b"\n");
        hasher.update(at.to_string().as_bytes());
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[derive(Clone)]
pub struct JobQueue {
    db: Database,
    scheduler: FairShareScheduler,
    events: EventBus,
    metrics: Arc<Metrics>,
}

impl JobQueue {
    pub fn new(
        db: Database,
        scheduler: FairShareScheduler,
        events: EventBus,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            db,
            scheduler,
            events,
            metrics,
        }
    }

    /// Submit a job for a specific token
    pub async fn enqueue(&self, request: EnqueueRequest, now: i64) -> Result<EnqueueOutcome> {
        validate_payload(&request.payload)?;

        let record = self
            .db
            .get_token_record(&request.token_id)
            .await?
            .ok_or_else(|| SyndicateError::NotFound(format!("token {}", request.token_id)))?;
        if record.platform != request.platform {
            return Err(SyndicateError::InvalidInput(format!(
                "token {} belongs to {}, not {}",
                request.token_id, record.platform, request.platform
            )));
        }
        if !record.is_active {
            return Err(SyndicateError::InvalidInput(format!(
                "token {} is disconnected",
                request.token_id
            )));
        }

        let dedupe_key = match request.dedupe_key {
            Some(key) => key,
            None => derive_dedupe_key(
                &request.token_id,
                request.platform,
                &request.payload,
                request.scheduled_at,
            )?,
        };

        let job = PublishJob {
            job_id: uuid::Uuid::new_v4().to_string(),
            token_id: request.token_id,
            platform: request.platform,
            payload: request.payload,
            scheduled_at: request.scheduled_at.unwrap_or(now),
            status: JobStatus::Pending,
            attempts: 0,
            error_code: None,
            last_error: None,
            dedupe_key,
            external_id: None,
            external_url: None,
            created_at: now,
            updated_at: now,
            claimed_at: None,
            completed_at: None,
        };

        self.insert(job).await
    }

    /// Submit a job and let the scheduler choose the token and the (jittered)
    /// run time. Fails with `NotFound` when no token on the platform is
    /// eligible.
    pub async fn enqueue_auto(
        &self,
        platform: Platform,
        payload: JobPayload,
        dedupe_key: Option<String>,
        now: i64,
    ) -> Result<EnqueueOutcome> {
        validate_payload(&payload)?;

        let dedupe_key = match dedupe_key {
            Some(key) => key,
            None => derive_dedupe_key("auto", platform, &payload, None)?,
        };
        if let Some(existing) = self.db.find_job_by_dedupe_key(&dedupe_key).await? {
            return Ok(self.duplicate(existing.job_id));
        }

        let slot = self.scheduler.plan(platform, now).await?.ok_or_else(|| {
            SyndicateError::NotFound(format!("no eligible token for {}", platform))
        })?;

        let job = PublishJob {
            job_id: uuid::Uuid::new_v4().to_string(),
            token_id: slot.token_id,
            platform,
            payload,
            scheduled_at: slot.run_at,
            status: JobStatus::Pending,
            attempts: 0,
            error_code: None,
            last_error: None,
            dedupe_key,
            external_id: None,
            external_url: None,
            created_at: now,
            updated_at: now,
            claimed_at: None,
            completed_at: None,
        };

        self.insert(job).await
    }

    pub async fn get_status(&self, job_id: &str) -> Result<JobState> {
        self.db
            .get_job(job_id)
            .await?
            .map(JobState::from)
            .ok_or_else(|| SyndicateError::NotFound(format!("job {}", job_id)))
    }

    /// Cancel a pending job. Returns false when the job has already started
    /// or finished.
    pub async fn cancel(&self, job_id: &str, now: i64) -> Result<bool> {
        if self.db.get_job(job_id).await?.is_none() {
            return Err(SyndicateError::NotFound(format!("job {}", job_id)));
        }

        let cancelled = self.db.cancel_job(job_id, now).await?;
        if cancelled {
            self.metrics.job_cancelled();
            tracing::info!(job_id, "Job cancelled");
        }
        Ok(cancelled)
    }

    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<JobState>> {
        Ok(self
            .db
            .list_jobs(filter)
            .await?
            .into_iter()
            .map(JobState::from)
            .collect())
    }

    async fn insert(&self, job: PublishJob) -> Result<EnqueueOutcome> {
        if self.db.insert_job(&job).await? {
            self.metrics.job_enqueued();
            tracing::info!(
                job_id = %job.job_id,
                token_id = %job.token_id,
                platform = %job.platform,
                scheduled_at = job.scheduled_at,
                "Job enqueued"
            );
            self.events.emit(Event::JobEnqueued {
                job_id: job.job_id.clone(),
                token_id: job.token_id,
                platform: job.platform,
                scheduled_at: job.scheduled_at,
            });
            return Ok(EnqueueOutcome::Created(job.job_id));
        }

        let existing = self
            .db
            .find_job_by_dedupe_key(&job.dedupe_key)
            .await?
            .ok_or_else(|| SyndicateError::NotFound(format!("dedupe key {}", job.dedupe_key)))?;
        Ok(self.duplicate(existing.job_id))
    }

    fn duplicate(&self, job_id: String) -> EnqueueOutcome {
        self.metrics.job_deduplicated();
        tracing::debug!(job_id = %job_id, "Duplicate submission, returning existing job");
        EnqueueOutcome::Duplicate(job_id)
    }
}

fn validate_payload(payload: &JobPayload) -> Result<()> {
    if payload.caption.trim().is_empty() && payload.media_url.is_none() {
        return Err(SyndicateError::InvalidInput(
            "payload needs a caption or a media reference".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{BreakerPolicy, CircuitBreaker};
    use crate::db::test_support::setup_test_db;
    use crate::scheduler::SchedulerPolicy;
    use crate::types::{TokenRecord, DAY_MS};
    use tempfile::TempDir;

    const NOW: i64 = 1_767_225_600_000;

    async fn queue() -> (JobQueue, Database, Arc<Metrics>, TempDir) {
        let (db, dir) = setup_test_db().await;
        let events = EventBus::default();
        let metrics = Arc::new(Metrics::new());
        let breaker = CircuitBreaker::new(
            db.clone(),
            BreakerPolicy::default(),
            events.clone(),
            metrics.clone(),
        );
        let scheduler = FairShareScheduler::new(
            db.clone(),
            breaker,
            SchedulerPolicy {
                jitter_min_ms: 1_000,
                jitter_max_ms: 2_000,
                starvation_threshold_ms: 7_200_000,
            },
            events.clone(),
            metrics.clone(),
        );
        for id in ["tt-1", "tt-2"] {
            db.upsert_token_record(&TokenRecord::new(id, Platform::TikTok, NOW))
                .await
                .unwrap();
        }
        (
            JobQueue::new(db.clone(), scheduler, events, metrics.clone()),
            db,
            metrics,
            dir,
        )
    }

    #[tokio::test]
    async fn test_enqueue_and_status() {
        let (queue, _db, _, _dir) = queue().await;
        let outcome = queue
            .enqueue(
                EnqueueRequest::new("tt-1", Platform::TikTok, JobPayload::text("hello")),
                NOW,
            )
            .await
            .unwrap();
        assert!(!outcome.is_duplicate());

        let state = queue.get_status(outcome.job_id()).await.unwrap();
        assert_eq!(state.status, JobStatus::Pending);
        assert_eq!(state.scheduled_at, NOW);
        assert_eq!(state.attempts, 0);
    }

    #[tokio::test]
    async fn test_same_dedupe_key_returns_same_job() {
        let (queue, db, metrics, _dir) = queue().await;
        let request = EnqueueRequest::new("tt-1", Platform::TikTok, JobPayload::text("hello"))
            .with_dedupe_key("campaign-42");

        let first = queue.enqueue(request.clone(), NOW).await.unwrap();
        let second = queue.enqueue(request, NOW + 5).await.unwrap();

        assert_eq!(second, EnqueueOutcome::Duplicate(first.job_id().to_string()));
        assert_eq!(db.list_jobs(&JobFilter::default()).await.unwrap().len(), 1);
        assert_eq!(metrics.snapshot().jobs_deduplicated, 1);
    }

    #[tokio::test]
    async fn test_derived_dedupe_key_is_stable() {
        let (queue, _db, _, _dir) = queue().await;
        let payload = JobPayload::text("same").with_media("https://cdn.example/v.mp4");

        let first = queue
            .enqueue(EnqueueRequest::new("tt-1", Platform::TikTok, payload.clone()), NOW)
            .await
            .unwrap();
        let again = queue
            .enqueue(EnqueueRequest::new("tt-1", Platform::TikTok, payload.clone()), NOW)
            .await
            .unwrap();
        let other_token = queue
            .enqueue(EnqueueRequest::new("tt-2", Platform::TikTok, payload), NOW)
            .await
            .unwrap();

        assert!(again.is_duplicate());
        assert_eq!(again.job_id(), first.job_id());
        assert!(!other_token.is_duplicate());
    }

    #[tokio::test]
    async fn test_same_content_at_different_times_is_not_a_duplicate() {
        let (queue, _db, _, _dir) = queue().await;
        let payload = JobPayload::text("daily reminder");

        let monday = queue
            .enqueue(
                EnqueueRequest::new("tt-1", Platform::TikTok, payload.clone()).at(NOW + DAY_MS),
                NOW,
            )
            .await
            .unwrap();
        let tuesday = queue
            .enqueue(
                EnqueueRequest::new("tt-1", Platform::TikTok, payload.clone()).at(NOW + 2 * DAY_MS),
                NOW,
            )
            .await
            .unwrap();
        let monday_again = queue
            .enqueue(
                EnqueueRequest::new("tt-1", Platform::TikTok, payload).at(NOW + DAY_MS),
                NOW,
            )
            .await
            .unwrap();

        assert!(!tuesday.is_duplicate());
        assert_ne!(monday.job_id(), tuesday.job_id());
        assert!(monday_again.is_duplicate());
        assert_eq!(monday_again.job_id(), monday.job_id());
    }

    #[test]
    fn test_derive_dedupe_key_shape() {
        let key = derive_dedupe_key("a", Platform::X, &JobPayload::text("x"), None).unwrap();
        assert_eq!(key.len(), 64);
        assert_ne!(
            key,
            derive_dedupe_key("a", Platform::X, &JobPayload::text("y"), None).unwrap()
        );
        assert_ne!(
            key,
            derive_dedupe_key("a", Platform::X, &JobPayload::text("x"), Some(5)).unwrap()
        );
    }

    #[tokio::test]
    async fn test_enqueue_validation() {
        let (queue, db, _, _dir) = queue().await;

        let empty = queue
            .enqueue(EnqueueRequest::new("tt-1", Platform::TikTok, JobPayload::text("  ")), NOW)
            .await;
        assert!(matches!(empty, Err(SyndicateError::InvalidInput(_))));

        let unknown = queue
            .enqueue(EnqueueRequest::new("nope", Platform::TikTok, JobPayload::text("x")), NOW)
            .await;
        assert!(matches!(unknown, Err(SyndicateError::NotFound(_))));

        let wrong_platform = queue
            .enqueue(EnqueueRequest::new("tt-1", Platform::X, JobPayload::text("x")), NOW)
            .await;
        assert!(matches!(wrong_platform, Err(SyndicateError::InvalidInput(_))));

        db.set_token_active("tt-2", false, NOW).await.unwrap();
        let inactive = queue
            .enqueue(EnqueueRequest::new("tt-2", Platform::TikTok, JobPayload::text("x")), NOW)
            .await;
        assert!(matches!(inactive, Err(SyndicateError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_cancel_pending_only() {
        let (queue, db, _, _dir) = queue().await;
        let outcome = queue
            .enqueue(
                EnqueueRequest::new("tt-1", Platform::TikTok, JobPayload::text("x")).at(NOW + 1000),
                NOW,
            )
            .await
            .unwrap();
        let id = outcome.job_id().to_string();

        assert!(queue.cancel(&id, NOW).await.unwrap());
        assert_eq!(queue.get_status(&id).await.unwrap().status, JobStatus::Cancelled);
        assert!(!queue.cancel(&id, NOW).await.unwrap());

        let running = queue
            .enqueue(EnqueueRequest::new("tt-1", Platform::TikTok, JobPayload::text("y")), NOW)
            .await
            .unwrap();
        assert!(db.claim_job(running.job_id(), NOW).await.unwrap().is_some());
        assert!(!queue.cancel(running.job_id(), NOW).await.unwrap());

        assert!(matches!(
            queue.cancel("missing", NOW).await,
            Err(SyndicateError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_enqueue_auto_spreads_tokens_with_jitter() {
        let (queue, db, _, _dir) = queue().await;

        let first = queue
            .enqueue_auto(Platform::TikTok, JobPayload::text("one"), None, NOW)
            .await
            .unwrap();
        let second = queue
            .enqueue_auto(Platform::TikTok, JobPayload::text("two"), None, NOW + 1)
            .await
            .unwrap();

        let a = queue.get_status(first.job_id()).await.unwrap();
        let b = queue.get_status(second.job_id()).await.unwrap();
        assert_ne!(a.token_id, b.token_id, "never-scheduled token goes next");
        assert!(a.scheduled_at >= NOW + 1_000 && a.scheduled_at <= NOW + 2_000);

        let record = db.get_token_record(&a.token_id).await.unwrap().unwrap();
        assert_eq!(record.total_jobs_scheduled, 1);

        let repeat = queue
            .enqueue_auto(Platform::TikTok, JobPayload::text("one"), None, NOW + 2)
            .await
            .unwrap();
        assert_eq!(repeat, EnqueueOutcome::Duplicate(first.job_id().to_string()));

        assert!(matches!(
            queue
                .enqueue_auto(Platform::Reddit, JobPayload::text("x"), None, NOW)
                .await,
            Err(SyndicateError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_filters() {
        let (queue, _db, _, _dir) = queue().await;
        for (token, text) in [("tt-1", "a"), ("tt-1", "b"), ("tt-2", "c")] {
            queue
                .enqueue(EnqueueRequest::new(token, Platform::TikTok, JobPayload::text(text)), NOW)
                .await
                .unwrap();
        }

        let filter = JobFilter {
            token_id: Some("tt-1".to_string()),
            ..Default::default()
        };
        assert_eq!(queue.list(&filter).await.unwrap().len(), 2);
    }
}
