//! Canonical JSON codec and atomic artifact writes.
//!
//! Every artifact byte this system emits goes through this crate so that a
//! given payload always serializes to the same bytes, on every host:
//!
//! - object keys sorted ascending (lexicographic, by Unicode scalar value);
//! - separators `","` / `":"`, no whitespace, UTF-8 without BOM;
//! - floats quantized to 8 fractional digits with HALF_UP rounding and
//!   rendered in fixed-point form (never exponent notation);
//! - integers and booleans preserved; `NaN`/`Infinity` rejected;
//! - JSONL = one canonical object per line, `\n` terminated (an empty file
//!   is a valid zero-row JSONL).
//!
//! File writes are `fsync`'d; `atomic_write_*` goes through a sibling
//! `<name>.tmp` and a rename so a half-written file is never visible.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Number of fractional digits every float is quantized to.
pub const FLOAT_FRACTION_DIGITS: usize = 8;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum CanonError {
    /// A float was NaN or infinite; such values must never reach an artifact.
    NonFiniteNumber,
    /// The payload could not be converted into a JSON tree.
    Serialize(String),
    /// Filesystem failure while writing an artifact.
    Io { path: PathBuf, message: String },
}

impl std::fmt::Display for CanonError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CanonError::NonFiniteNumber => write!(f, "non-finite number"),
            CanonError::Serialize(msg) => write!(f, "serialize failed: {msg}"),
            CanonError::Io { path, message } => {
                write!(f, "io error at {}: {message}", path.display())
            }
        }
    }
}

impl std::error::Error for CanonError {}

fn io_err(path: &Path, err: std::io::Error) -> CanonError {
    CanonError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Numeric policy
// ---------------------------------------------------------------------------

/// Quantize a float to the canonical decimal rendition.
///
/// The shortest decimal representation of the value is rounded HALF_UP at
/// [`FLOAT_FRACTION_DIGITS`], trailing fractional zeros are trimmed, and at
/// least one fractional digit is kept so floats stay distinguishable from
/// integers (`10000.0`, `0.1`, `0.00000013`).
pub fn quantize_f64(value: f64) -> Result<String, CanonError> {
    if !value.is_finite() {
        return Err(CanonError::NonFiniteNumber);
    }

    // Rust's `Display` for f64 is the shortest round-trip decimal form and
    // never uses exponent notation.
    let repr = format!("{value}");
    let (negative, digits) = match repr.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, repr.as_str()),
    };
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i.to_string(), f.to_string()),
        None => (digits.to_string(), String::new()),
    };

    let (int_part, frac_part) = round_half_up(int_part, frac_part, FLOAT_FRACTION_DIGITS);

    let frac_trimmed = frac_part.trim_end_matches('0');
    let frac_out = if frac_trimmed.is_empty() {
        "0"
    } else {
        frac_trimmed
    };

    // Negative zero collapses to plain zero.
    if int_part.bytes().all(|b| b == b'0') && frac_out == "0" {
        return Ok("0.0".to_string());
    }

    let sign = if negative { "-" } else { "" };
    Ok(format!("{sign}{int_part}.{frac_out}"))
}

/// Round a decimal digit string at `digits` fractional places, HALF_UP.
///
/// Returns the possibly-carried integer part and the fractional part padded
/// or truncated to exactly `digits` characters.
fn round_half_up(int_part: String, frac_part: String, digits: usize) -> (String, String) {
    if frac_part.len() <= digits {
        let mut frac = frac_part;
        while frac.len() < digits {
            frac.push('0');
        }
        return (int_part, frac);
    }

    let kept: Vec<u8> = frac_part.as_bytes()[..digits].to_vec();
    let next = frac_part.as_bytes()[digits] - b'0';
    if next < 5 {
        return (int_part, String::from_utf8(kept).unwrap_or_default());
    }

    // Propagate the carry through the kept fraction, then the integer part.
    let mut frac: Vec<u8> = kept;
    let mut carry = true;
    for slot in frac.iter_mut().rev() {
        if !carry {
            break;
        }
        if *slot == b'9' {
            *slot = b'0';
        } else {
            *slot += 1;
            carry = false;
        }
    }

    let mut int_digits: Vec<u8> = int_part.into_bytes();
    if carry {
        for slot in int_digits.iter_mut().rev() {
            if !carry {
                break;
            }
            if *slot == b'9' {
                *slot = b'0';
            } else {
                *slot += 1;
                carry = false;
            }
        }
        if carry {
            int_digits.insert(0, b'1');
        }
    }

    (
        String::from_utf8(int_digits).unwrap_or_default(),
        String::from_utf8(frac).unwrap_or_default(),
    )
}

// ---------------------------------------------------------------------------
// Canonical serialization
// ---------------------------------------------------------------------------

/// Serialize a payload to its canonical JSON text (no trailing newline).
pub fn to_canonical_string<T: Serialize>(payload: &T) -> Result<String, CanonError> {
    let value =
        serde_json::to_value(payload).map_err(|e| CanonError::Serialize(e.to_string()))?;
    let mut out = String::new();
    write_value(&mut out, &value)?;
    Ok(out)
}

/// Canonical JSON bytes of a payload (no trailing newline).
pub fn to_canonical_bytes<T: Serialize>(payload: &T) -> Result<Vec<u8>, CanonError> {
    Ok(to_canonical_string(payload)?.into_bytes())
}

fn write_value(out: &mut String, value: &Value) -> Result<(), CanonError> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                out.push_str(&n.to_string());
            } else {
                let f = n.as_f64().ok_or(CanonError::NonFiniteNumber)?;
                out.push_str(&quantize_f64(f)?);
            }
        }
        Value::String(s) => write_escaped_str(out, s),
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_value(out, item)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            // serde_json's map is already key-ordered, but sorting here keeps
            // the invariant independent of the map backing.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_escaped_str(out, key);
                out.push(':');
                write_value(out, &map[key.as_str()])?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn write_escaped_str(out: &mut String, s: &str) {
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{08}' => out.push_str("\\b"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\u{0c}' => out.push_str("\\f"),
            '\r' => out.push_str("\\r"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

/// Lowercase hex SHA-256 of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex_lower(&hasher.finalize())
}

fn hex_lower(bytes: &[u8]) -> String {
    const TABLE: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(TABLE[(b >> 4) as usize] as char);
        out.push(TABLE[(b & 0x0f) as usize] as char);
    }
    out
}

// ---------------------------------------------------------------------------
// File writes
// ---------------------------------------------------------------------------

/// Write a canonical JSON document (payload + trailing `\n`) with fsync.
///
/// Not atomic on its own; callers writing into a live directory should use
/// [`atomic_write_canonical_json`] or stage a temp directory and rename it.
pub fn write_canonical_json<T: Serialize>(path: &Path, payload: &T) -> Result<(), CanonError> {
    let mut bytes = to_canonical_bytes(payload)?;
    bytes.push(b'\n');
    write_bytes_synced(path, &bytes)
}

/// Write canonical JSONL rows (one object per line, `\n` terminated) with
/// fsync. Zero rows produce an empty file.
pub fn write_canonical_jsonl<T: Serialize>(path: &Path, rows: &[T]) -> Result<(), CanonError> {
    let mut bytes = Vec::new();
    for row in rows {
        bytes.extend_from_slice(&to_canonical_bytes(row)?);
        bytes.push(b'\n');
    }
    write_bytes_synced(path, &bytes)
}

/// Atomically replace `path` with the canonical JSON document: write a
/// sibling `<name>.tmp`, fsync it, rename over the destination, fsync the
/// containing directory.
pub fn atomic_write_canonical_json<T: Serialize>(
    path: &Path,
    payload: &T,
) -> Result<(), CanonError> {
    let mut bytes = to_canonical_bytes(payload)?;
    bytes.push(b'\n');
    atomic_write_bytes(path, &bytes)
}

/// Atomic byte-level replace via sibling temp file + rename.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<(), CanonError> {
    let tmp = temp_sibling(path);
    if let Err(err) = write_bytes_synced(&tmp, bytes) {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(io_err(path, err));
    }
    if let Some(parent) = path.parent() {
        fsync_dir(parent);
    }
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    path.with_file_name(format!("{name}.tmp"))
}

fn write_bytes_synced(path: &Path, bytes: &[u8]) -> Result<(), CanonError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    let mut file = fs::File::create(path).map_err(|e| io_err(path, e))?;
    file.write_all(bytes).map_err(|e| io_err(path, e))?;
    file.sync_all().map_err(|e| io_err(path, e))?;
    Ok(())
}

/// Best-effort directory fsync; ignored on platforms that refuse it.
pub fn fsync_dir(path: &Path) {
    if let Ok(dir) = fs::File::open(path) {
        let _ = dir.sync_all();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // --- quantize_f64 ---

    #[test]
    fn quantize_keeps_short_fractions() {
        assert_eq!(quantize_f64(0.1).unwrap(), "0.1");
        assert_eq!(quantize_f64(101.25).unwrap(), "101.25");
        assert_eq!(quantize_f64(-3.5).unwrap(), "-3.5");
    }

    #[test]
    fn quantize_marks_whole_floats() {
        assert_eq!(quantize_f64(10000.0).unwrap(), "10000.0");
        assert_eq!(quantize_f64(0.0).unwrap(), "0.0");
        assert_eq!(quantize_f64(-0.0).unwrap(), "0.0");
    }

    #[test]
    fn quantize_rounds_half_up_at_eight_digits() {
        assert_eq!(quantize_f64(0.000000125).unwrap(), "0.00000013");
        assert_eq!(quantize_f64(0.123456789).unwrap(), "0.12345679");
        assert_eq!(quantize_f64(0.123456781).unwrap(), "0.12345678");
    }

    #[test]
    fn quantize_carries_into_integer_part() {
        assert_eq!(quantize_f64(0.999999999).unwrap(), "1.0");
        assert_eq!(quantize_f64(9.999999995).unwrap(), "10.0");
    }

    #[test]
    fn quantize_never_uses_exponent_notation() {
        let tiny = quantize_f64(1.3e-7).unwrap();
        assert_eq!(tiny, "0.00000013");
        assert!(!tiny.contains('e') && !tiny.contains('E'));
    }

    #[test]
    fn quantize_rejects_non_finite() {
        assert!(quantize_f64(f64::NAN).is_err());
        assert!(quantize_f64(f64::INFINITY).is_err());
        assert!(quantize_f64(f64::NEG_INFINITY).is_err());
    }

    // --- canonical serialization ---

    #[test]
    fn keys_sorted_and_separators_minimal() {
        let text = to_canonical_string(&json!({"b": 1, "a": {"z": true, "y": null}})).unwrap();
        assert_eq!(text, r#"{"a":{"y":null,"z":true},"b":1}"#);
    }

    #[test]
    fn integers_preserved_floats_quantized() {
        let text = to_canonical_string(&json!({"i": 42, "f": 0.30000000000000004})).unwrap();
        assert_eq!(text, r#"{"f":0.3,"i":42}"#);
    }

    #[test]
    fn strings_escaped_minimally() {
        let text = to_canonical_string(&json!({"s": "a\"b\\c\n\u{01}"})).unwrap();
        assert_eq!(text, "{\"s\":\"a\\\"b\\\\c\\n\\u0001\"}");
    }

    #[test]
    fn same_payload_same_bytes() {
        let payload = json!({"m": {"k": 1.5, "j": [1, 2.25, "x"]}, "n": -7});
        let a = to_canonical_bytes(&payload).unwrap();
        let b = to_canonical_bytes(&payload).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn quantized_text_reparses_to_same_bytes() {
        // Reading an artifact back and re-serializing it must be a no-op.
        let first = to_canonical_string(&json!({"v": 1234.56780001, "w": 3.0})).unwrap();
        let reparsed: serde_json::Value = serde_json::from_str(&first).unwrap();
        let second = to_canonical_string(&reparsed).unwrap();
        assert_eq!(first, second);
    }

    // --- hashing ---

    #[test]
    fn sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    // --- file writes ---

    #[test]
    fn json_file_ends_with_single_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        write_canonical_json(&path, &json!({"a": 1})).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes, b"{\"a\":1}\n");
    }

    #[test]
    fn jsonl_zero_rows_is_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.jsonl");
        let rows: Vec<serde_json::Value> = Vec::new();
        write_canonical_jsonl(&path, &rows).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"");
    }

    #[test]
    fn jsonl_rows_newline_terminated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.jsonl");
        write_canonical_jsonl(&path, &[json!({"seq": 0}), json!({"seq": 1})]).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "{\"seq\":0}\n{\"seq\":1}\n"
        );
    }

    #[test]
    fn atomic_write_replaces_and_removes_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        atomic_write_canonical_json(&path, &json!({"v": 1})).unwrap();
        atomic_write_canonical_json(&path, &json!({"v": 2})).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"v\":2}\n");
        assert!(!dir.path().join("index.json.tmp").exists());
    }
}
