//! Configuration management for Syndicate
//!
//! Configuration is a TOML file. Every section except `[database]` is optional
//! and falls back to the defaults below.
//!
//! ```toml
//! [database]
//! path = "~/.local/share/syndicate/scheduler.db"
//!
//! [credentials]
//! master_key_file = "~/.config/syndicate/master.key"
//! refresh_margin_seconds = 300
//!
//! [scheduler]
//! jitter_min_ms = 1800000
//! jitter_max_ms = 5400000
//! starvation_threshold_seconds = 7200
//!
//! [circuit_breaker]
//! failure_threshold = 5
//! cooldown_seconds = 300
//!
//! [retry]
//! retry_limit = 3
//! backoff_base_ms = 60000
//!
//! [rate_limiter]
//! fail_open = true
//!
//! [rate_limits.tiktok]
//! burst = { max = 1 }
//! minute = { max = 1 }
//! hour = { max = 6 }
//! day = { max = 20 }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, Result};
use crate::types::{Platform, WindowKind, WindowSpec};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,
    /// Platforms left out get the built-in table; an empty table means unlimited
    #[serde(default)]
    pub rate_limits: BTreeMap<Platform, PlatformLimits>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// File holding the age identity used to encrypt tokens at rest
    #[serde(default)]
    pub master_key_file: Option<String>,
    #[serde(default = "default_refresh_margin_seconds")]
    pub refresh_margin_seconds: u64,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            master_key_file: None,
            refresh_margin_seconds: default_refresh_margin_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_jitter_min_ms")]
    pub jitter_min_ms: u64,
    #[serde(default = "default_jitter_max_ms")]
    pub jitter_max_ms: u64,
    #[serde(default = "default_starvation_threshold_seconds")]
    pub starvation_threshold_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            jitter_min_ms: default_jitter_min_ms(),
            jitter_max_ms: default_jitter_max_ms(),
            starvation_threshold_seconds: default_starvation_threshold_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
    /// How long other jobs wait while a half-open trial is outstanding
    #[serde(default = "default_trial_wait_seconds")]
    pub trial_wait_seconds: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_seconds: default_cooldown_seconds(),
            trial_wait_seconds: default_trial_wait_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_limit: default_retry_limit(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_adapter_timeout_seconds")]
    pub adapter_timeout_seconds: u64,
    /// Running jobs claimed longer ago than this are assumed orphaned
    #[serde(default = "default_stale_after_seconds")]
    pub stale_after_seconds: u64,
    #[serde(default = "default_maintenance_interval_seconds")]
    pub maintenance_interval_seconds: u64,
    /// Rate-limit endpoint name publish calls are counted under
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            adapter_timeout_seconds: default_adapter_timeout_seconds(),
            stale_after_seconds: default_stale_after_seconds(),
            maintenance_interval_seconds: default_maintenance_interval_seconds(),
            endpoint: default_endpoint(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Allow publishing when the shared window store is unreachable
    #[serde(default = "default_fail_open")]
    pub fail_open: bool,
    /// Delay applied to denied jobs when the store is down and fail_open is off
    #[serde(default = "default_fail_closed_retry_ms")]
    pub fail_closed_retry_ms: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            fail_open: default_fail_open(),
            fail_closed_retry_ms: default_fail_closed_retry_ms(),
        }
    }
}

/// Window limits for one platform
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst: Option<WindowLimit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minute: Option<WindowLimit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hour: Option<WindowLimit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day: Option<WindowLimit>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowLimit {
    pub max: u32,
    /// Overrides the window's natural length
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_seconds: Option<u64>,
}

impl WindowLimit {
    fn max(max: u32) -> Option<Self> {
        Some(Self {
            max,
            window_seconds: None,
        })
    }
}

impl PlatformLimits {
    fn table(burst: u32, minute: u32, hour: u32, day: u32) -> Self {
        Self {
            burst: WindowLimit::max(burst),
            minute: WindowLimit::max(minute),
            hour: WindowLimit::max(hour),
            day: WindowLimit::max(day),
        }
    }

    /// Built-in limits; TikTok is the tightest and X the most permissive
    pub fn defaults_for(platform: Platform) -> Self {
        match platform {
            Platform::TikTok => Self::table(1, 1, 6, 20),
            Platform::Instagram => Self::table(2, 3, 25, 50),
            Platform::Reddit => Self::table(2, 5, 30, 200),
            Platform::X => Self::table(5, 10, 100, 2400),
        }
    }

    pub fn to_window_specs(&self) -> Vec<WindowSpec> {
        [
            (WindowKind::Burst, self.burst),
            (WindowKind::Minute, self.minute),
            (WindowKind::Hour, self.hour),
            (WindowKind::Day, self.day),
        ]
        .into_iter()
        .filter_map(|(kind, limit)| {
            limit.map(|l| {
                let window_ms = l
                    .window_seconds
                    .map(|s| s as i64 * 1000)
                    .unwrap_or_else(|| kind.default_length_ms());
                WindowSpec::new(kind, window_ms, l.max)
            })
        })
        .collect()
    }
}

fn default_refresh_margin_seconds() -> u64 {
    300
}
fn default_jitter_min_ms() -> u64 {
    30 * 60 * 1000
}
fn default_jitter_max_ms() -> u64 {
    90 * 60 * 1000
}
fn default_starvation_threshold_seconds() -> u64 {
    2 * 3600
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_cooldown_seconds() -> u64 {
    300
}
fn default_trial_wait_seconds() -> u64 {
    30
}
fn default_retry_limit() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    60 * 1000
}
fn default_backoff_cap_ms() -> u64 {
    3600 * 1000
}
fn default_workers() -> usize {
    4
}
fn default_poll_interval_ms() -> u64 {
    5000
}
fn default_adapter_timeout_seconds() -> u64 {
    120
}
fn default_stale_after_seconds() -> u64 {
    1800
}
fn default_maintenance_interval_seconds() -> u64 {
    60
}
fn default_endpoint() -> String {
    "publish".to_string()
}
fn default_fail_open() -> bool {
    true
}
fn default_fail_closed_retry_ms() -> u64 {
    60 * 1000
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        Self::from_toml_str(&content)
    }

    /// Parse, fill in default rate limits and validate
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content).map_err(ConfigError::ParseError)?;
        config.fill_default_limits();
        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        let mut config = Self {
            database: DatabaseConfig {
                path: "~/.local/share/syndicate/scheduler.db".to_string(),
            },
            credentials: CredentialsConfig {
                master_key_file: Some("~/.config/syndicate/master.key".to_string()),
                ..Default::default()
            },
            scheduler: SchedulerConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            worker: WorkerConfig::default(),
            rate_limiter: RateLimiterConfig::default(),
            rate_limits: BTreeMap::new(),
        };
        config.fill_default_limits();
        config
    }

    fn fill_default_limits(&mut self) {
        for platform in Platform::ALL {
            self.rate_limits
                .entry(platform)
                .or_insert_with(|| PlatformLimits::defaults_for(platform));
        }
    }

    /// Window specs per platform, ready for the limiter
    pub fn window_specs(&self) -> BTreeMap<Platform, Vec<WindowSpec>> {
        self.rate_limits
            .iter()
            .map(|(platform, limits)| (*platform, limits.to_window_specs()))
            .collect()
    }

    /// Reject settings the scheduler cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.jitter_min_ms > self.scheduler.jitter_max_ms {
            return Err(invalid(
                "scheduler.jitter_min_ms",
                "must not exceed scheduler.jitter_max_ms",
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(invalid("circuit_breaker.failure_threshold", "must be at least 1"));
        }
        if self.retry.retry_limit == 0 {
            return Err(invalid("retry.retry_limit", "must be at least 1"));
        }
        if self.retry.backoff_base_ms > self.retry.backoff_cap_ms {
            return Err(invalid(
                "retry.backoff_base_ms",
                "must not exceed retry.backoff_cap_ms",
            ));
        }
        if self.worker.workers == 0 {
            return Err(invalid("worker.workers", "must be at least 1"));
        }
        if self.worker.adapter_timeout_seconds == 0 {
            return Err(invalid("worker.adapter_timeout_seconds", "must be at least 1"));
        }
        // One attempt may refresh and then publish, each bounded by the timeout
        if self.worker.stale_after_seconds <= 2 * self.worker.adapter_timeout_seconds {
            return Err(invalid(
                "worker.stale_after_seconds",
                "must exceed twice worker.adapter_timeout_seconds",
            ));
        }
        for (platform, limits) in &self.rate_limits {
            for spec in limits.to_window_specs() {
                if spec.max_count == 0 || spec.window_ms <= 0 {
                    return Err(invalid(
                        &format!("rate_limits.{}.{}", platform, spec.kind.as_str()),
                        "max and window length must be positive",
                    ));
                }
            }
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> crate::error::SyndicateError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("SYNDICATE_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("syndicate").join("config.toml"))
}

/// Resolve the data directory path following XDG Base Directory spec
pub fn resolve_data_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
        .ok_or_else(|| ConfigError::MissingField("data directory".to_string()))?;

    Ok(data_dir.join("syndicate"))
}

/// Resolve the database path: `SYNDICATE_DB_PATH`, then the configured path,
/// then the data directory
pub fn resolve_db_path(configured: Option<&str>) -> Result<PathBuf> {
    if let Ok(path) = std::env::var("SYNDICATE_DB_PATH") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }
    if let Some(path) = configured {
        return Ok(PathBuf::from(shellexpand::tilde(path).to_string()));
    }
    Ok(resolve_data_path()?.join("scheduler.db"))
}
