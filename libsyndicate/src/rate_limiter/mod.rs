//! Sliding window rate limiting shared across workers
//!
//! A window counts the actions recorded in the half-open interval
//! `(now - window_ms, now]`. A check against several windows (burst, minute,
//! hour, day) is allowed only if every window has room, and then records one
//! entry in each of them. Check and record happen in one atomic step inside
//! the store, so two workers can never both see the last free slot.
//!
//! When a platform answers with a 429 the limiter's picture of the real quota
//! is stale; [`RateLimiter::record_platform_limit`] stores a penalty that
//! blocks the key for a while and tightens every window until it expires.

mod memory;
mod store;

pub use memory::MemoryWindowStore;
pub use store::SqliteWindowStore;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::Result;
use crate::service::metrics::Metrics;
use crate::types::{Platform, WindowSpec};

/// Result of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied { retry_after_ms: i64 },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

/// Identifies one rate-limited counter set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LimitKey<'a> {
    pub platform: Platform,
    pub token_id: &'a str,
    pub endpoint: &'a str,
}

impl<'a> LimitKey<'a> {
    pub fn new(platform: Platform, token_id: &'a str, endpoint: &'a str) -> Self {
        Self {
            platform,
            token_id,
            endpoint,
        }
    }
}

/// Tightened limits after the platform itself rate limited us
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Penalty {
    pub blocked_until: i64,
    /// Subtracted from every window's max while active (floor 1)
    pub reduction: u32,
    pub expires_at: i64,
}

impl Penalty {
    pub fn is_active(&self, now: i64) -> bool {
        self.expires_at > now
    }

    /// Escalate an existing penalty, or start a new one
    pub fn escalate(
        previous: Option<Penalty>,
        windows: &[WindowSpec],
        retry_after_ms: Option<i64>,
        now: i64,
    ) -> Penalty {
        let shortest = windows.iter().map(|w| w.window_ms).min().unwrap_or(0);
        let longest = windows.iter().map(|w| w.window_ms).max().unwrap_or(0);
        let block_for = retry_after_ms.filter(|ms| *ms > 0).unwrap_or(shortest);

        let previous = previous.filter(|p| p.is_active(now));
        let blocked_until = previous
            .map(|p| p.blocked_until)
            .unwrap_or(now)
            .max(now + block_for);

        Penalty {
            blocked_until,
            reduction: previous.map(|p| p.reduction).unwrap_or(0) + 1,
            expires_at: (now + longest).max(blocked_until),
        }
    }
}

/// Decide a check given each window's recorded timestamps.
///
/// `timestamps[i]` holds the entries of `windows[i]`, already pruned to the
/// window and sorted ascending. Shared by every store implementation.
pub fn evaluate_windows(
    windows: &[WindowSpec],
    timestamps: &[Vec<i64>],
    penalty: Option<&Penalty>,
    now: i64,
) -> Decision {
    let penalty = penalty.filter(|p| p.is_active(now));
    let mut retry_after: Option<i64> = None;

    if let Some(p) = penalty {
        if p.blocked_until > now {
            retry_after = Some(p.blocked_until - now);
        }
    }

    let reduction = penalty.map(|p| p.reduction).unwrap_or(0);

    for (spec, entries) in windows.iter().zip(timestamps) {
        let max = spec.max_count.saturating_sub(reduction).max(1) as usize;
        if entries.len() >= max {
            // Enough of the oldest entries must leave for the count to drop below max
            let pivot = entries[entries.len() - max];
            let wait = (pivot + spec.window_ms - now).max(1);
            retry_after = Some(retry_after.map_or(wait, |r| r.max(wait)));
        }
    }

    match retry_after {
        Some(retry_after_ms) => Decision::Denied { retry_after_ms },
        None => Decision::Allowed,
    }
}

/// Shared atomic window storage
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Prune, check every window and, if all pass, record one entry in each.
    /// Must be atomic per key.
    async fn check_and_record(
        &self,
        key: &LimitKey<'_>,
        windows: &[WindowSpec],
        now: i64,
    ) -> Result<Decision>;

    /// Store or escalate a penalty for the key
    async fn penalize(
        &self,
        key: &LimitKey<'_>,
        windows: &[WindowSpec],
        retry_after_ms: Option<i64>,
        now: i64,
    ) -> Result<Penalty>;

    /// Drop entries and penalties past their TTL. Returns rows removed.
    async fn purge_expired(&self, now: i64) -> Result<u64>;
}

/// Per-platform limiter over a shared store
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    windows: BTreeMap<Platform, Vec<WindowSpec>>,
    fail_open: bool,
    fail_closed_retry_ms: i64,
    metrics: Arc<Metrics>,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn RateLimitStore>,
        windows: BTreeMap<Platform, Vec<WindowSpec>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            windows,
            fail_open: true,
            fail_closed_retry_ms: 60_000,
            metrics,
        }
    }

    /// Deny instead of allowing when the store is unreachable
    pub fn with_fail_closed(mut self, retry_ms: i64) -> Self {
        self.fail_open = false;
        self.fail_closed_retry_ms = retry_ms;
        self
    }

    pub fn windows_for(&self, platform: Platform) -> &[WindowSpec] {
        self.windows
            .get(&platform)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Check the platform's configured windows for this token and endpoint
    pub async fn allow(
        &self,
        platform: Platform,
        token_id: &str,
        endpoint: &str,
        now: i64,
    ) -> Decision {
        let key = LimitKey::new(platform, token_id, endpoint);
        self.allow_with(&key, self.windows_for(platform), now).await
    }

    /// Check explicit windows. Store failures never surface as errors.
    pub async fn allow_with(&self, key: &LimitKey<'_>, windows: &[WindowSpec], now: i64) -> Decision {
        if windows.is_empty() {
            return Decision::Allowed;
        }

        match self.store.check_and_record(key, windows, now).await {
            Ok(Decision::Denied { retry_after_ms }) => {
                self.metrics.rate_limit_hit();
                tracing::debug!(
                    platform = %key.platform,
                    token_id = key.token_id,
                    endpoint = key.endpoint,
                    retry_after_ms,
                    "Rate limit denied"
                );
                Decision::Denied { retry_after_ms }
            }
            Ok(Decision::Allowed) => Decision::Allowed,
            Err(e) if self.fail_open => {
                self.metrics.rate_limit_fail_open();
                tracing::warn!(
                    platform = %key.platform,
                    token_id = key.token_id,
                    error = %e,
                    "Rate limit store unavailable, failing open"
                );
                Decision::Allowed
            }
            Err(e) => {
                self.metrics.rate_limit_hit();
                tracing::warn!(
                    platform = %key.platform,
                    token_id = key.token_id,
                    error = %e,
                    "Rate limit store unavailable, denying"
                );
                Decision::Denied {
                    retry_after_ms: self.fail_closed_retry_ms,
                }
            }
        }
    }

    /// Feed back a platform-side 429 (or an exhausted quota hint)
    pub async fn record_platform_limit(
        &self,
        platform: Platform,
        token_id: &str,
        endpoint: &str,
        retry_after_ms: Option<i64>,
        now: i64,
    ) -> Result<Penalty> {
        let key = LimitKey::new(platform, token_id, endpoint);
        let penalty = self
            .store
            .penalize(&key, self.windows_for(platform), retry_after_ms, now)
            .await?;

        self.metrics.rate_limit_penalty();
        tracing::info!(
            platform = %platform,
            token_id,
            endpoint,
            blocked_until = penalty.blocked_until,
            reduction = penalty.reduction,
            "Tightened rate limit after platform throttling"
        );

        Ok(penalty)
    }

    pub async fn purge_expired(&self, now: i64) -> Result<u64> {
        self.store.purge_expired(now).await
    }
}
