//! OHLCV bar series: CSV loading, strict 1-minute validation, resampling.

mod loader;
mod resample;

pub use loader::{load_and_validate_1m, parse_csv_bars, DataMeta};
pub use resample::{resample, timeframe_minutes};

use chrono::{DateTime, Utc};

/// One validated OHLCV bar. `ts` is the bar's open timestamp (UTC).
#[derive(Debug, Clone, PartialEq)]
pub struct Bar {
    pub ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Data-layer failures; each maps to `DATA_INVALID` at the boundary with the
/// message carried here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataError {
    Io(String),
    NoRows,
    MissingTimestampColumn,
    MissingColumn(&'static str),
    TimestampParseFailed,
    NonNumericValue,
    NegativeVolume,
    EmptyWindow,
    NotStrictlyIncreasing,
    NotMinuteAligned,
    GapOrWrongCadence,
    ResampleEmpty,
    InvalidTimeframe(String),
}

impl std::fmt::Display for DataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataError::Io(msg) => write!(f, "Failed to read CSV: {msg}"),
            DataError::NoRows => write!(f, "CSV has no rows"),
            DataError::MissingTimestampColumn => write!(f, "timestamp column missing"),
            DataError::MissingColumn(name) => write!(f, "Missing required column: {name}"),
            DataError::TimestampParseFailed => write!(f, "timestamp parse failed"),
            DataError::NonNumericValue => write!(f, "price/volume must be numeric"),
            DataError::NegativeVolume => write!(f, "volume must be non-negative"),
            DataError::EmptyWindow => write!(f, "No data after applying time window"),
            DataError::NotStrictlyIncreasing => {
                write!(f, "timestamp must be strictly increasing")
            }
            DataError::NotMinuteAligned => write!(f, "timestamp must align to minute"),
            DataError::GapOrWrongCadence => write!(f, "input data must be 1m with no gaps"),
            DataError::ResampleEmpty => write!(f, "resample produced no rows"),
            DataError::InvalidTimeframe(tf) => write!(f, "invalid timeframe: {tf}"),
        }
    }
}

impl std::error::Error for DataError {}
