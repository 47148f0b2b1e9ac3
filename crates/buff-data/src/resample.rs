//! Left-labelled, left-closed resampling of a validated 1-minute series.
//!
//! A bucket starting at `T` covers `[T, T + tf)`. open = first, high = max,
//! low = min, close = last, volume = sum. Buckets with fewer than `tf / 1m`
//! bars are dropped; with gap-free input only the leading and trailing
//! partial buckets can be affected.

use crate::{Bar, DataError};

const MS_PER_MINUTE: i64 = 60_000;

/// Whole minutes for a supported timeframe label (`"1m"`, `"5m"`, ...).
pub fn timeframe_minutes(timeframe: &str) -> Result<u32, DataError> {
    let tf = timeframe.trim();
    let digits = tf.strip_suffix('m');
    match digits.and_then(|d| d.parse::<u32>().ok()) {
        Some(minutes) if minutes >= 1 => Ok(minutes),
        _ => Err(DataError::InvalidTimeframe(timeframe.to_string())),
    }
}

/// Resample a 1-minute series to `minutes`-sized bars.
pub fn resample(bars: &[Bar], minutes: u32) -> Result<Vec<Bar>, DataError> {
    if minutes == 1 {
        return Ok(bars.to_vec());
    }
    let bucket_ms = i64::from(minutes) * MS_PER_MINUTE;

    let mut out: Vec<Bar> = Vec::new();
    let mut current: Option<(i64, Bar, usize)> = None;

    for bar in bars {
        let ms = bar.ts.timestamp_millis();
        let bucket_start = ms - ms.rem_euclid(bucket_ms);

        match current.as_mut() {
            Some((start, agg, count)) if *start == bucket_start => {
                agg.high = agg.high.max(bar.high);
                agg.low = agg.low.min(bar.low);
                agg.close = bar.close;
                agg.volume += bar.volume;
                *count += 1;
            }
            _ => {
                if let Some((_, agg, count)) = current.take() {
                    if count == minutes as usize {
                        out.push(agg);
                    }
                }
                let label = buff_time::from_epoch_ms(bucket_start)
                    .map_err(|_| DataError::TimestampParseFailed)?;
                current = Some((
                    bucket_start,
                    Bar {
                        ts: label,
                        open: bar.open,
                        high: bar.high,
                        low: bar.low,
                        close: bar.close,
                        volume: bar.volume,
                    },
                    1,
                ));
            }
        }
    }

    if let Some((_, agg, count)) = current.take() {
        if count == minutes as usize {
            out.push(agg);
        }
    }

    if out.is_empty() {
        return Err(DataError::ResampleEmpty);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
