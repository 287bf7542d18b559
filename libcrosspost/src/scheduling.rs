//! Schedule time parsing
//!
//! Turns what a person types into a UTC instant before it reaches the
//! scheduling service, which only ever sees absolute timestamps.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};

use crate::error::{CrosspostError, Result};

/// Parse a schedule string into a UTC instant
///
/// Supports, in order of precedence:
/// - RFC 3339 / ISO-8601: "2026-11-20T15:00:00Z", "2026-11-20T15:00:00+02:00"
/// - Plain date-time, read as UTC: "2026-11-20 15:00"
/// - Relative durations: "30m", "2h", "1 hour", "in 2 hours"
/// - Natural language: "tomorrow", "next monday 10am"
///
/// The result is not checked against the current time; the service rejects
/// anything that is not in the future.
pub fn parse_schedule(input: &str) -> Result<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CrosspostError::InvalidInput(
            "Schedule string cannot be empty".to_string(),
        ));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.with_timezone(&Utc));
    }

    if let Some(dt) = parse_naive(input) {
        return Ok(dt);
    }

    let relative = input.strip_prefix("in ").unwrap_or(input);
    if let Ok(duration) = parse_duration(relative) {
        return Ok(Utc::now() + duration);
    }

    if let Ok(dt) = parse_natural_language(input) {
        return Ok(dt);
    }

    Err(CrosspostError::InvalidInput(format!(
        "Could not parse schedule string: {}",
        input
    )))
}

fn parse_naive(input: &str) -> Option<DateTime<Utc>> {
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(input, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Parse a duration string into a chrono::Duration
fn parse_duration(input: &str) -> Result<Duration> {
    let std_duration = humantime::parse_duration(input)
        .map_err(|e| CrosspostError::InvalidInput(format!("Could not parse duration: {}", e)))?;
    let seconds = i64::try_from(std_duration.as_secs())
        .map_err(|_| CrosspostError::InvalidInput("Duration out of range".to_string()))?;
    Duration::try_seconds(seconds)
        .ok_or_else(|| CrosspostError::InvalidInput("Duration out of range".to_string()))
}

fn parse_natural_language(input: &str) -> Result<DateTime<Utc>> {
    chrono_english::parse_date_string(input, Utc::now(), chrono_english::Dialect::Us)
        .map_err(|e| CrosspostError::InvalidInput(format!("Could not parse time: {}", e)))
}

/// Unix seconds to an RFC 3339 string, for responses
pub fn to_rfc3339(timestamp: i64) -> Option<String> {
    DateTime::from_timestamp(timestamp, 0).map(|dt| dt.to_rfc3339())
}
