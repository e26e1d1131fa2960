//! Parsing of caller-supplied run times
//!
//! Accepted forms:
//! - `now`
//! - Relative durations: `"90s"`, `"30m"`, `"2h 15m"`
//! - Natural language: `"tomorrow 3pm"`, `"next monday 10am"`
//! - RFC 3339 timestamps: `"2026-11-20T15:00:00Z"`
//! - Random offsets: `"random:30m-90m"` (uniform between the bounds)
//!
//! Results are epoch milliseconds.

use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;

use crate::error::{Result, SyndicateError};

const MIN_RANDOM_MS: i64 = 30 * 1000;
const MAX_RANDOM_MS: i64 = 30 * 24 * 3600 * 1000;

/// Parse a run time relative to `now_ms`
pub fn parse_run_at(input: &str, now_ms: i64) -> Result<i64> {
    parse_run_at_with(input, now_ms, &mut rand::thread_rng())
}

/// Same as [`parse_run_at`] with a caller-provided RNG for `random:` ranges
pub fn parse_run_at_with<R: Rng + ?Sized>(input: &str, now_ms: i64, rng: &mut R) -> Result<i64> {
    let input = input.trim();
    if input.is_empty() {
        return Err(SyndicateError::InvalidInput(
            "Schedule string cannot be empty".to_string(),
        ));
    }

    if input.eq_ignore_ascii_case("now") {
        return Ok(now_ms);
    }

    if let Some(range) = input.strip_prefix("random:") {
        let (min_ms, max_ms) = parse_random_range(range)?;
        return Ok(now_ms + rng.gen_range(min_ms..=max_ms));
    }

    if let Ok(offset) = parse_duration_ms(input) {
        return Ok(now_ms + offset);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.timestamp_millis());
    }

    let base = Utc
        .timestamp_millis_opt(now_ms)
        .single()
        .ok_or_else(|| SyndicateError::InvalidInput(format!("Invalid base time {}", now_ms)))?;

    chrono_english::parse_date_string(input, base, chrono_english::Dialect::Us)
        .map(|dt| dt.timestamp_millis())
        .map_err(|_| {
            SyndicateError::InvalidInput(format!("Could not parse schedule string: {}", input))
        })
}

/// `humantime` duration in milliseconds
pub fn parse_duration_ms(input: &str) -> Result<i64> {
    let duration = humantime::parse_duration(input.trim()).map_err(|e| {
        SyndicateError::InvalidInput(format!("Could not parse duration '{}': {}", input, e))
    })?;

    i64::try_from(duration.as_millis())
        .map_err(|_| SyndicateError::InvalidInput("Duration out of range".to_string()))
}

/// Split and validate `MIN-MAX`
fn parse_random_range(range: &str) -> Result<(i64, i64)> {
    let (min_str, max_str) = range.split_once('-').ok_or_else(|| {
        SyndicateError::InvalidInput("Random format must be random:MIN-MAX".to_string())
    })?;

    let min_ms = parse_duration_ms(min_str)?;
    let max_ms = parse_duration_ms(max_str)?;

    if min_ms < MIN_RANDOM_MS {
        return Err(SyndicateError::InvalidInput(format!(
            "Minimum random interval must be at least {} seconds",
            MIN_RANDOM_MS / 1000
        )));
    }
    if max_ms > MAX_RANDOM_MS {
        return Err(SyndicateError::InvalidInput(format!(
            "Maximum random interval must be at most {} days",
            MAX_RANDOM_MS / (24 * 3600 * 1000)
        )));
    }
    if min_ms >= max_ms {
        return Err(SyndicateError::InvalidInput(
            "Minimum must be less than maximum".to_string(),
        ));
    }

    Ok((min_ms, max_ms))
}

/// Render epoch milliseconds for humans
pub fn format_timestamp(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ms.to_string())
}
