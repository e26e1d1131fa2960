//! In-process window store for single-process embedders and tests

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{evaluate_windows, Decision, LimitKey, Penalty, RateLimitStore};
use crate::error::Result;
use crate::types::{Platform, WindowKind, WindowSpec};

type KeyParts = (Platform, String, String);

#[derive(Default)]
struct State {
    entries: HashMap<(KeyParts, WindowKind, i64), Vec<i64>>,
    penalties: HashMap<KeyParts, Penalty>,
}

/// Window store backed by a mutex-guarded map. Atomic within one process
/// only; workers on other hosts need [`super::SqliteWindowStore`].
#[derive(Default)]
pub struct MemoryWindowStore {
    state: Mutex<State>,
}

impl MemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn parts(key: &LimitKey<'_>) -> KeyParts {
    (key.platform, key.token_id.to_string(), key.endpoint.to_string())
}

#[async_trait]
impl RateLimitStore for MemoryWindowStore {
    async fn check_and_record(
        &self,
        key: &LimitKey<'_>,
        windows: &[WindowSpec],
        now: i64,
    ) -> Result<Decision> {
        let key_parts = parts(key);
        let mut state = self.lock();

        let mut timestamps = Vec::with_capacity(windows.len());
        for spec in windows {
            let bucket = state
                .entries
                .entry((key_parts.clone(), spec.kind, spec.window_ms))
                .or_default();
            bucket.retain(|ts| *ts > now - spec.window_ms);
            timestamps.push(bucket.clone());
        }

        let penalty = state.penalties.get(&key_parts).copied();
        let decision = evaluate_windows(windows, &timestamps, penalty.as_ref(), now);

        if decision.is_allowed() {
            for spec in windows {
                if let Some(bucket) = state
                    .entries
                    .get_mut(&(key_parts.clone(), spec.kind, spec.window_ms))
                {
                    bucket.push(now);
                }
            }
        }

        Ok(decision)
    }

    async fn penalize(
        &self,
        key: &LimitKey<'_>,
        windows: &[WindowSpec],
        retry_after_ms: Option<i64>,
        now: i64,
    ) -> Result<Penalty> {
        let key_parts = parts(key);
        let mut state = self.lock();

        let previous = state.penalties.get(&key_parts).copied();
        let penalty = Penalty::escalate(previous, windows, retry_after_ms, now);
        state.penalties.insert(key_parts, penalty);

        Ok(penalty)
    }

    async fn purge_expired(&self, now: i64) -> Result<u64> {
        let mut state = self.lock();
        let mut removed = 0u64;

        for ((_, _, window_ms), bucket) in state.entries.iter_mut() {
            let before = bucket.len();
            bucket.retain(|ts| ts + 2 * *window_ms > now);
            removed += (before - bucket.len()) as u64;
        }
        state.entries.retain(|_, bucket| !bucket.is_empty());

        let before = state.penalties.len();
        state.penalties.retain(|_, p| p.is_active(now));
        removed += (before - state.penalties.len()) as u64;

        Ok(removed)
    }
}
