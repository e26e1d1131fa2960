//! Syndicate - multi-account publishing scheduler
//!
//! This library schedules and executes social media publish jobs across
//! many connected accounts while respecting each platform's quota, isolating
//! unhealthy accounts and keeping OAuth credentials alive.
//!
//! Workers coordinate only through the shared SQLite store, so any number of
//! processes can serve the same queue.

pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod db;
pub mod error;
pub mod executor;
pub mod logging;
pub mod platforms;
pub mod queue;
pub mod rate_limiter;
pub mod scheduler;
pub mod scheduling;
pub mod service;
pub mod types;
pub mod worker;

// Re-export commonly used types
pub use config::Config;
pub use credentials::{AccessToken, CredentialManager, OAuthGrant, TokenCipher};
pub use db::Database;
pub use error::{Result, SyndicateError};
pub use executor::{ExecutionOutcome, JobExecutor};
pub use platforms::{AdapterRegistry, PlatformAdapter};
pub use queue::{EnqueueOutcome, EnqueueRequest, JobQueue, JobState};
pub use service::SyndicateService;
pub use types::{JobPayload, JobStatus, Platform, PublishJob, TokenRecord};
pub use worker::WorkerPool;
