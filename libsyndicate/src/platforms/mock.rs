//! Mock platform adapter for testing
//!
//! A configurable adapter that can simulate successes, typed failures, slow
//! calls and token endpoint behaviour. Outcomes are scripted as a queue: each
//! call pops the next one, and an empty queue means success. It is used by the
//! integration tests and by embedders that want a dry run without network
//! access.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::sleep;

use crate::credentials::{AccessToken, OAuthGrant, RefreshRequest};
use crate::error::{AdapterError, RefreshError};
use crate::platforms::PlatformAdapter;
use crate::types::{JobPayload, Platform, PublishReceipt};

/// Grant handed out by a scripted refresh
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in_ms: Option<i64>,
}

impl MockGrant {
    pub fn new(access_token: &str, expires_in_ms: i64) -> Self {
        Self {
            access_token: access_token.to_string(),
            refresh_token: None,
            expires_in_ms: Some(expires_in_ms),
        }
    }

    pub fn rotating(mut self, refresh_token: &str) -> Self {
        self.refresh_token = Some(refresh_token.to_string());
        self
    }

    fn into_grant(self) -> OAuthGrant {
        let mut grant = OAuthGrant::new(&self.access_token);
        if let Some(refresh) = self.refresh_token.as_deref() {
            grant = grant.with_refresh_token(refresh);
        }
        grant.expires_in_ms = self.expires_in_ms;
        grant
    }
}

/// A publish call as the mock saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedCall {
    pub access_token: String,
    pub caption: String,
}

/// Mock adapter for testing
pub struct MockAdapter {
    platform: Platform,
    delay: Duration,
    publish_script: Mutex<VecDeque<Result<PublishReceipt, AdapterError>>>,
    refresh_script: Mutex<VecDeque<Result<MockGrant, RefreshError>>>,
    published: Mutex<Vec<PublishedCall>>,
    publish_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking test thread must not hide the recorded calls
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockAdapter {
    /// Adapter that always succeeds
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            delay: Duration::ZERO,
            publish_script: Mutex::new(VecDeque::new()),
            refresh_script: Mutex::new(VecDeque::new()),
            published: Mutex::new(Vec::new()),
            publish_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
        }
    }

    /// Simulate network latency on every call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Queue the outcome of the next unscripted publish call
    pub fn push_publish(&self, outcome: Result<PublishReceipt, AdapterError>) -> &Self {
        lock(&self.publish_script).push_back(outcome);
        self
    }

    /// Queue `count` identical publish failures
    pub fn fail_publish(&self, error: AdapterError, count: usize) -> &Self {
        let mut script = lock(&self.publish_script);
        for _ in 0..count {
            script.push_back(Err(error.clone()));
        }
        drop(script);
        self
    }

    /// Queue the outcome of the next refresh call
    pub fn push_refresh(&self, outcome: Result<MockGrant, RefreshError>) -> &Self {
        lock(&self.refresh_script).push_back(outcome);
        self
    }

    pub fn publish_call_count(&self) -> usize {
        self.publish_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_call_count(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    /// Successful publishes, in call order
    pub fn published(&self) -> Vec<PublishedCall> {
        lock(&self.published).clone()
    }
}

#[async_trait]
impl PlatformAdapter for MockAdapter {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn publish(
        &self,
        token: &AccessToken,
        payload: &JobPayload,
    ) -> Result<PublishReceipt, AdapterError> {
        let call = self.publish_calls.fetch_add(1, Ordering::SeqCst) + 1;

        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }

        let scripted = lock(&self.publish_script).pop_front();
        let outcome = scripted.unwrap_or_else(|| {
            Ok(PublishReceipt {
                external_id: format!("mock-{}-{}", self.platform, call),
                external_url: Some(format!(
                    "https://{}.example/posts/mock-{}",
                    self.platform, call
                )),
                rate_limit_hint: None,
            })
        });

        if outcome.is_ok() {
            lock(&self.published).push(PublishedCall {
                access_token: token.expose().to_string(),
                caption: payload.caption.clone(),
            });
        }
        outcome
    }

    async fn refresh_token(&self, request: &RefreshRequest) -> Result<OAuthGrant, RefreshError> {
        let call = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;

        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }

        let scripted = lock(&self.refresh_script).pop_front();
        let grant = match scripted {
            Some(outcome) => outcome?,
            None => MockGrant::new(
                &format!("{}-refreshed-{}", request.account_id, call),
                request.platform.default_token_lifetime_ms(),
            ),
        };
        Ok(grant.into_grant())
    }
}
