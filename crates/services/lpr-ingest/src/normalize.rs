//! Normalization rules for resolved field values

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Utc};

/// Canonical plates are this many characters long, inclusive
pub const PLATE_MIN_LEN: usize = 4;
pub const PLATE_MAX_LEN: usize = 10;

/// Integer literals with at most this many digits are epoch seconds
const EPOCH_SECONDS_MAX_DIGITS: usize = 12;

/// Integer literals with at most this many digits are epoch milliseconds;
/// anything longer is microseconds
const EPOCH_MILLIS_MAX_DIGITS: usize = 15;

/// Naive date-time layouts accepted after RFC 3339 / RFC 2822, read as UTC
const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S%.f",
    "%Y%m%dT%H%M%S",
];

/// Normalization errors
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum NormalizeError {
    #[error("Unrecognized timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Timestamp out of range: {0}")]
    TimestampOutOfRange(String),

    #[error("Unrecognized confidence: {0}")]
    InvalidConfidence(String),
}

/// Strip everything but letters and digits and uppercase the rest
///
/// Returns `None` when the result is not a plausible plate.
pub fn normalize_plate(raw: &str) -> Option<String> {
    let plate: String = raw
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_uppercase)
        .collect();

    let len = plate.chars().count();
    if (PLATE_MIN_LEN..=PLATE_MAX_LEN).contains(&len) {
        Some(plate)
    } else {
        None
    }
}

/// Parse a timestamp literal into a UTC instant
///
/// Accepts absolute date-times (offset-less values are UTC), integer epoch
/// values classified by digit count, and floating epoch values classified by
/// magnitude.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, NormalizeError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(NormalizeError::InvalidTimestamp(raw.to_string()));
    }

    if let Some(instant) = parse_datetime_literal(raw) {
        return in_range(instant, raw);
    }

    if let Ok(value) = raw.parse::<i64>() {
        let digits = raw.trim_start_matches(['+', '-']).len();
        let millis = if digits <= EPOCH_SECONDS_MAX_DIGITS {
            value.checked_mul(1000)
        } else if digits <= EPOCH_MILLIS_MAX_DIGITS {
            Some(value)
        } else {
            Some(value / 1000)
        };
        return millis
            .ok_or_else(|| NormalizeError::TimestampOutOfRange(raw.to_string()))
            .and_then(|ms| from_millis(ms, raw));
    }

    if let Ok(value) = raw.parse::<f64>() {
        if !value.is_finite() {
            return Err(NormalizeError::InvalidTimestamp(raw.to_string()));
        }
        // >= 1e12 is already milliseconds; epoch seconds and fractional
        // seconds both scale up
        let millis = if value >= 1e12 { value } else { value * 1000.0 };
        if millis < i64::MIN as f64 || millis > i64::MAX as f64 {
            return Err(NormalizeError::TimestampOutOfRange(raw.to_string()));
        }
        return from_millis(millis.round() as i64, raw);
    }

    Err(NormalizeError::InvalidTimestamp(raw.to_string()))
}

fn parse_datetime_literal(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn from_millis(millis: i64, raw: &str) -> Result<DateTime<Utc>, NormalizeError> {
    let instant = Utc
        .timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| NormalizeError::TimestampOutOfRange(raw.to_string()))?;
    in_range(instant, raw)
}

/// Only calendar years 0001 through 9999 are representable
fn in_range(instant: DateTime<Utc>, raw: &str) -> Result<DateTime<Utc>, NormalizeError> {
    if (1..=9999).contains(&instant.year()) {
        Ok(instant)
    } else {
        Err(NormalizeError::TimestampOutOfRange(raw.to_string()))
    }
}

/// Coerce a confidence literal into `[0, 1]`
///
/// Values above 1 are read as percentages; anything above 100 or below 0 is
/// clamped.
pub fn parse_confidence(raw: &str) -> Result<f64, NormalizeError> {
    let trimmed = raw.trim();
    let number = trimmed.strip_suffix('%').unwrap_or(trimmed).trim();
    let value: f64 = number
        .parse()
        .map_err(|_| NormalizeError::InvalidConfidence(raw.to_string()))?;
    if value.is_nan() {
        return Err(NormalizeError::InvalidConfidence(raw.to_string()));
    }

    Ok(if value > 100.0 {
        1.0
    } else if value > 1.0 {
        value / 100.0
    } else if value < 0.0 {
        0.0
    } else {
        value
    })
}

/// Trimmed value, or `None` when blank
pub fn trimmed(raw: &str) -> Option<String> {
    let value = raw.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
