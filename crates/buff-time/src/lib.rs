//! Timestamp parsing and the canonical UTC-Z rendition.
//!
//! Inputs accepted anywhere a timestamp crosses the boundary: integer epoch
//! milliseconds, digit strings of milliseconds, ISO-8601 with or without
//! `Z`, and RFC-3339 offsets. Everything normalizes to UTC and serializes
//! as `YYYY-MM-DDTHH:MM:SS.sssZ` (millisecond precision, `Z` suffix).

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeError {
    Empty,
    Unparseable(String),
    OutOfRange(i64),
}

impl std::fmt::Display for TimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeError::Empty => write!(f, "timestamp is empty"),
            TimeError::Unparseable(raw) => write!(f, "invalid timestamp: '{raw}'"),
            TimeError::OutOfRange(ms) => write!(f, "timestamp out of range: {ms} ms"),
        }
    }
}

impl std::error::Error for TimeError {}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse epoch milliseconds into a UTC datetime.
pub fn from_epoch_ms(ms: i64) -> Result<DateTime<Utc>, TimeError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or(TimeError::OutOfRange(ms))
}

/// Parse a textual timestamp: digit string of epoch ms, or ISO-8601 /
/// RFC-3339 (naive datetimes are taken as UTC).
pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>, TimeError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(TimeError::Empty);
    }

    if text.bytes().all(|b| b.is_ascii_digit())
        || (text.starts_with('-') && text.len() > 1 && text[1..].bytes().all(|b| b.is_ascii_digit()))
    {
        let ms: i64 = text
            .parse()
            .map_err(|_| TimeError::Unparseable(text.to_string()))?;
        return from_epoch_ms(ms);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.with_timezone(&Utc));
    }

    // Naive ISO-8601 (no offset), second or sub-second precision.
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, fmt) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
        if fmt == "%Y-%m-%d" {
            if let Ok(date) = chrono::NaiveDate::parse_from_str(text, fmt) {
                if let Some(naive) = date.and_hms_opt(0, 0, 0) {
                    return Ok(Utc.from_utc_datetime(&naive));
                }
            }
        }
    }

    Err(TimeError::Unparseable(text.to_string()))
}

// ---------------------------------------------------------------------------
// Formatting
// ---------------------------------------------------------------------------

/// Canonical rendition: `YYYY-MM-DDTHH:MM:SS.sssZ`.
pub fn format_ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse-then-format; the normalization applied to every externally supplied
/// timestamp before it is echoed back.
pub fn normalize_ts(raw: &str) -> Result<String, TimeError> {
    Ok(format_ts(parse_ts(raw)?))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
