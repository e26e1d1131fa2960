//! Scheduler event bus
//!
//! Components emit typed events as jobs move through their lifecycle and as
//! token health changes. Dashboards and alerting subscribe; nothing in the
//! scheduler depends on a subscriber being present.
//!
//! ```
//! use libsyndicate::service::events::{Event, EventBus};
//!
//! # async fn example() {
//! let bus = EventBus::new(100);
//! let mut receiver = bus.subscribe();
//!
//! bus.emit(Event::JobClaimed {
//!     job_id: "job-1".to_string(),
//!     token_id: "acct-1".to_string(),
//! });
//!
//! if let Ok(event) = receiver.recv().await {
//!     println!("{:?}", event);
//! }
//! # }
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{CircuitState, Platform};

pub type EventReceiver = broadcast::Receiver<Event>;

/// Broadcast channel wrapper. Emitting never blocks; lagging subscribers
/// lose the oldest events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// `capacity` is the per-subscriber buffer
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: Event) {
        // Err only means nobody is listening
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    JobEnqueued {
        job_id: String,
        token_id: String,
        platform: Platform,
        scheduled_at: i64,
    },

    JobClaimed {
        job_id: String,
        token_id: String,
    },

    /// Returned to pending without consuming an attempt (quota or breaker)
    JobRescheduled {
        job_id: String,
        token_id: String,
        reason: String,
        run_at: i64,
    },

    JobSucceeded {
        job_id: String,
        token_id: String,
        external_id: String,
    },

    /// An attempt failed; `terminal` is false when a retry was scheduled
    JobFailed {
        job_id: String,
        token_id: String,
        error_code: String,
        attempts: u32,
        terminal: bool,
    },

    CircuitTransition {
        token_id: String,
        platform: Platform,
        from: CircuitState,
        to: CircuitState,
        failures: u32,
        at: i64,
    },

    TokenStarved {
        token_id: String,
        platform: Platform,
        last_scheduled_at: Option<i64>,
        starved_for_ms: i64,
    },

    RefreshFailed {
        account_id: String,
        platform: Platform,
        reason: String,
        /// Whether the still-live token was handed out anyway
        fallback_used: bool,
    },
}
