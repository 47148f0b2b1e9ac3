//! CSV loader and 1-minute invariant validator.
//!
//! Column contract (case-insensitive, order-independent):
//!
//! | Column            | Type / example            |
//! |-------------------|---------------------------|
//! | `timestamp` / `ts`| epoch ms or ISO-8601      |
//! | `open`..`close`   | finite float              |
//! | `volume`          | finite float, >= 0        |
//!
//! After parsing and the optional window, the series must be strictly
//! increasing, minute-aligned (seconds and sub-seconds zero), and gap-free:
//! every consecutive diff exactly 60 s.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Timelike, Utc};

use crate::{Bar, DataError};

/// Provenance of a validated series, recorded into the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMeta {
    /// Repo-relative path the series was loaded from.
    pub source_path: String,
    pub data_start_ts: String,
    pub data_end_ts: String,
}

/// Load, window, and validate a 1-minute series from a CSV file.
pub fn load_and_validate_1m(
    path: &Path,
    source_path: &str,
    start_ts: Option<DateTime<Utc>>,
    end_ts: Option<DateTime<Utc>>,
) -> Result<(Vec<Bar>, DataMeta), DataError> {
    let text = fs::read_to_string(path).map_err(|e| DataError::Io(e.to_string()))?;
    let bars = parse_csv_bars(&text)?;

    let bars: Vec<Bar> = bars
        .into_iter()
        .filter(|bar| {
            start_ts.map(|s| bar.ts >= s).unwrap_or(true)
                && end_ts.map(|e| bar.ts <= e).unwrap_or(true)
        })
        .collect();
    if bars.is_empty() {
        return Err(DataError::EmptyWindow);
    }

    validate_one_minute(&bars)?;

    let meta = DataMeta {
        source_path: source_path.to_string(),
        data_start_ts: buff_time::format_ts(bars[0].ts),
        data_end_ts: buff_time::format_ts(bars[bars.len() - 1].ts),
    };
    Ok((bars, meta))
}

/// Parse bars from CSV content (pure; no invariant checks beyond per-cell
/// parsing).
pub fn parse_csv_bars(csv: &str) -> Result<Vec<Bar>, DataError> {
    let mut lines = csv.lines();

    let header_line = match lines.next() {
        Some(l) => l.trim().trim_start_matches('\u{feff}'),
        None => return Err(DataError::NoRows),
    };
    if header_line.is_empty() {
        return Err(DataError::NoRows);
    }

    // Case-insensitive header index (deterministic).
    let mut idx: BTreeMap<String, usize> = BTreeMap::new();
    for (i, col) in header_line.split(',').enumerate() {
        idx.insert(col.trim().to_ascii_lowercase(), i);
    }

    let col_ts = idx
        .get("timestamp")
        .or_else(|| idx.get("ts"))
        .copied()
        .ok_or(DataError::MissingTimestampColumn)?;
    let col_open = find_required(&idx, "open")?;
    let col_high = find_required(&idx, "high")?;
    let col_low = find_required(&idx, "low")?;
    let col_close = find_required(&idx, "close")?;
    let col_volume = find_required(&idx, "volume")?;

    let mut out: Vec<Bar> = Vec::new();
    for raw in lines {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }

        let fields: Vec<&str> = raw.split(',').map(str::trim).collect();
        let get = |col: usize| -> Result<&str, DataError> {
            fields.get(col).copied().ok_or(DataError::TimestampParseFailed)
        };

        let ts = parse_bar_ts(get(col_ts)?)?;
        let open = parse_price(fields.get(col_open).copied())?;
        let high = parse_price(fields.get(col_high).copied())?;
        let low = parse_price(fields.get(col_low).copied())?;
        let close = parse_price(fields.get(col_close).copied())?;
        let volume = parse_price(fields.get(col_volume).copied())?;
        if volume < 0.0 {
            return Err(DataError::NegativeVolume);
        }

        out.push(Bar {
            ts,
            open,
            high,
            low,
            close,
            volume,
        });
    }

    if out.is_empty() {
        return Err(DataError::NoRows);
    }
    Ok(out)
}

/// Strictly increasing, minute-aligned, gap-free (exact 60 s cadence).
fn validate_one_minute(bars: &[Bar]) -> Result<(), DataError> {
    for bar in bars {
        if bar.ts.second() != 0 || bar.ts.nanosecond() != 0 {
            return Err(DataError::NotMinuteAligned);
        }
    }
    for pair in bars.windows(2) {
        let diff_ms = pair[1].ts.timestamp_millis() - pair[0].ts.timestamp_millis();
        if diff_ms <= 0 {
            return Err(DataError::NotStrictlyIncreasing);
        }
        if diff_ms != 60_000 {
            return Err(DataError::GapOrWrongCadence);
        }
    }
    Ok(())
}

fn find_required(
    idx: &BTreeMap<String, usize>,
    name: &'static str,
) -> Result<usize, DataError> {
    idx.get(name).copied().ok_or(DataError::MissingColumn(name))
}

/// Timestamps: epoch ms (integer or digit string) or ISO-8601.
fn parse_bar_ts(raw: &str) -> Result<DateTime<Utc>, DataError> {
    buff_time::parse_ts(raw).map_err(|_| DataError::TimestampParseFailed)
}

/// Prices and volumes must parse as finite floats; `NaN`/`inf` strings are
/// data corruption, not numbers.
fn parse_price(raw: Option<&str>) -> Result<f64, DataError> {
    let text = raw.ok_or(DataError::NonNumericValue)?;
    let value: f64 = text.parse().map_err(|_| DataError::NonNumericValue)?;
    if !value.is_finite() {
        return Err(DataError::NonNumericValue);
    }
    Ok(value)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "timestamp,open,high,low,close,volume";

    fn minute_csv(count: usize) -> String {
        let mut csv = String::from(HEADER);
        for i in 0..count {
            let ts = 1_700_000_040_000_i64 + (i as i64) * 60_000;
            csv.push_str(&format!("\n{ts},100,101,99,100.5,10"));
        }
        csv
    }

    #[test]
    fn parses_epoch_ms_rows() {
        let bars = parse_csv_bars(&minute_csv(3)).unwrap();
        assert_eq!(bars.len(), 3);
        assert_eq!(bars[0].close, 100.5);
    }

    #[test]
    fn ts_column_alias_accepted() {
        let csv = "ts,open,high,low,close,volume\n1700000040000,1,2,0.5,1.5,3";
        let bars = parse_csv_bars(csv).unwrap();
        assert_eq!(bars.len(), 1);
    }

    #[test]
    fn iso_timestamps_accepted() {
        let csv = format!("{HEADER}\n2024-01-02T03:04:00Z,1,2,0.5,1.5,3");
        let bars = parse_csv_bars(&csv).unwrap();
        assert_eq!(buff_time::format_ts(bars[0].ts), "2024-01-02T03:04:00.000Z");
    }

    #[test]
    fn missing_column_fails() {
        let csv = "timestamp,open,high,low,close\n1700000040000,1,2,0.5,1.5";
        assert_eq!(
            parse_csv_bars(csv).unwrap_err(),
            DataError::MissingColumn("volume")
        );
    }

    #[test]
    fn missing_timestamp_column_fails() {
        let csv = "open,high,low,close,volume\n1,2,0.5,1.5,3";
        assert_eq!(
            parse_csv_bars(csv).unwrap_err(),
            DataError::MissingTimestampColumn
        );
    }

    #[test]
    fn unparseable_timestamp_fails() {
        let csv = format!("{HEADER}\nnot-a-ts,1,2,0.5,1.5,3");
        assert_eq!(
            parse_csv_bars(&csv).unwrap_err(),
            DataError::TimestampParseFailed
        );
    }

    #[test]
    fn non_numeric_price_fails() {
        let csv = format!("{HEADER}\n1700000040000,one,2,0.5,1.5,3");
        assert_eq!(parse_csv_bars(&csv).unwrap_err(), DataError::NonNumericValue);
    }

    #[test]
    fn non_finite_price_fails() {
        let csv = format!("{HEADER}\n1700000040000,inf,2,0.5,1.5,3");
        assert_eq!(parse_csv_bars(&csv).unwrap_err(), DataError::NonNumericValue);
    }

    #[test]
    fn negative_volume_fails() {
        let csv = format!("{HEADER}\n1700000040000,1,2,0.5,1.5,-3");
        assert_eq!(parse_csv_bars(&csv).unwrap_err(), DataError::NegativeVolume);
    }

    #[test]
    fn validate_rejects_duplicates_and_gaps() {
        let mut dup = minute_csv(2);
        dup.push_str("\n1700000100000,100,101,99,100.5,10"); // duplicate minute
        assert!(matches!(
            super::validate_one_minute(&parse_csv_bars(&dup).unwrap()),
            Err(DataError::NotStrictlyIncreasing)
        ));

        let gap = format!(
            "{HEADER}\n1700000040000,1,2,0.5,1.5,3\n1700000220000,1,2,0.5,1.5,3"
        );
        assert!(matches!(
            super::validate_one_minute(&parse_csv_bars(&gap).unwrap()),
            Err(DataError::GapOrWrongCadence)
        ));
    }

    #[test]
    fn validate_rejects_unaligned_seconds() {
        let csv = format!("{HEADER}\n1700000040500,1,2,0.5,1.5,3");
        assert!(matches!(
            super::validate_one_minute(&parse_csv_bars(&csv).unwrap()),
            Err(DataError::NotMinuteAligned)
        ));
    }

    #[test]
    fn window_filter_and_meta() {
        let dir = std::env::temp_dir().join(format!("buff_data_loader_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bars.csv");
        std::fs::write(&path, minute_csv(5)).unwrap();

        let start = buff_time::from_epoch_ms(1_700_000_100_000).unwrap();
        let (bars, meta) =
            load_and_validate_1m(&path, "fixtures/bars.csv", Some(start), None).unwrap();
        assert_eq!(bars.len(), 4);
        assert_eq!(meta.source_path, "fixtures/bars.csv");
        assert_eq!(meta.data_start_ts, buff_time::format_ts(bars[0].ts));

        let far = buff_time::from_epoch_ms(2_000_000_000_000).unwrap();
        let err = load_and_validate_1m(&path, "fixtures/bars.csv", Some(far), None).unwrap_err();
        assert_eq!(err, DataError::EmptyWindow);

        std::fs::remove_dir_all(&dir).ok();
    }
}
