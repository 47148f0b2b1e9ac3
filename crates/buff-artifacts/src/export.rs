//! Streaming exports: `json`, `ndjson`, and hardened `csv`.
//!
//! Exports are iterator-producing so the HTTP layer can stream chunks
//! without buffering the whole dataset. CSV cells whose first character is
//! one of `= + - @` get a leading single quote so a spreadsheet never
//! interprets them as formulas.

use serde_json::Value;

use crate::ResolveError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Ndjson,
    Csv,
}

impl ExportFormat {
    pub fn parse(raw: &str) -> Result<Self, ResolveError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "ndjson" => Ok(ExportFormat::Ndjson),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(ResolveError::new(
                400,
                "invalid_export_format",
                format!("unsupported export format: {other}"),
            )),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Ndjson => "ndjson",
            ExportFormat::Csv => "csv",
        }
    }
}

pub fn export_media_type(format: ExportFormat) -> &'static str {
    match format {
        ExportFormat::Json => "application/json; charset=utf-8",
        ExportFormat::Ndjson => "application/x-ndjson; charset=utf-8",
        ExportFormat::Csv => "text/csv; charset=utf-8",
    }
}

/// Turn a record list into a chunk stream for the requested format.
pub fn stream_export(
    records: Vec<Value>,
    format: ExportFormat,
) -> Box<dyn Iterator<Item = Vec<u8>> + Send> {
    match format {
        ExportFormat::Json => Box::new(json_chunks(records)),
        ExportFormat::Ndjson => Box::new(ndjson_chunks(records)),
        ExportFormat::Csv => Box::new(csv_chunks(records)),
    }
}

fn json_chunks(records: Vec<Value>) -> impl Iterator<Item = Vec<u8>> + Send {
    let body = records.into_iter().enumerate().map(|(idx, record)| {
        let mut chunk = Vec::new();
        if idx > 0 {
            chunk.push(b',');
        }
        chunk.extend_from_slice(record.to_string().as_bytes());
        chunk
    });
    std::iter::once(b"[".to_vec())
        .chain(body)
        .chain(std::iter::once(b"]".to_vec()))
}

fn ndjson_chunks(records: Vec<Value>) -> impl Iterator<Item = Vec<u8>> + Send {
    records.into_iter().map(|record| {
        let mut chunk = record.to_string().into_bytes();
        chunk.push(b'\n');
        chunk
    })
}

fn csv_chunks(records: Vec<Value>) -> impl Iterator<Item = Vec<u8>> + Send {
    let headers = collect_headers(&records);
    let header_line = {
        let mut line = headers
            .iter()
            .map(|h| csv_cell(h))
            .collect::<Vec<_>>()
            .join(",");
        line.push('\n');
        line.into_bytes()
    };

    let rows = records.into_iter().map(move |record| {
        let mut cells = Vec::with_capacity(headers.len());
        for header in &headers {
            let cell = match record.get(header.as_str()) {
                None | Some(Value::Null) => String::new(),
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
            };
            cells.push(csv_cell(&cell));
        }
        let mut line = cells.join(",");
        line.push('\n');
        line.into_bytes()
    });

    std::iter::once(header_line).chain(rows)
}

/// Union of keys across all records, in first-seen order.
fn collect_headers(records: &[Value]) -> Vec<String> {
    let mut headers: Vec<String> = Vec::new();
    for record in records {
        if let Some(map) = record.as_object() {
            for key in map.keys() {
                if !headers.iter().any(|h| h == key) {
                    headers.push(key.clone());
                }
            }
        }
    }
    headers
}

/// Quote + spreadsheet-injection hardening for a single CSV cell.
fn csv_cell(raw: &str) -> String {
    let guarded = if matches!(raw.chars().next(), Some('=' | '+' | '-' | '@')) {
        format!("'{raw}")
    } else {
        raw.to_string()
    };
    if guarded.contains(',') || guarded.contains('"') || guarded.contains('\n') {
        format!("\"{}\"", guarded.replace('"', "\"\""))
    } else {
        guarded
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn collect(format: ExportFormat, records: Vec<Value>) -> String {
        let bytes: Vec<u8> = stream_export(records, format).flatten().collect();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn format_parsing() {
        assert_eq!(ExportFormat::parse("CSV").unwrap(), ExportFormat::Csv);
        assert_eq!(ExportFormat::parse("ndjson").unwrap(), ExportFormat::Ndjson);
        let err = ExportFormat::parse("parquet").unwrap_err();
        assert_eq!(err.code, "invalid_export_format");
    }

    #[test]
    fn json_export_is_an_array() {
        let out = collect(
            ExportFormat::Json,
            vec![json!({"a": 1}), json!({"a": 2})],
        );
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 2);
    }

    #[test]
    fn empty_json_export_is_empty_array() {
        assert_eq!(collect(ExportFormat::Json, vec![]), "[]");
    }

    #[test]
    fn ndjson_one_record_per_line() {
        let out = collect(
            ExportFormat::Ndjson,
            vec![json!({"a": 1}), json!({"b": 2})],
        );
        assert_eq!(out.lines().count(), 2);
    }

    #[test]
    fn csv_headers_are_first_seen_union() {
        let out = collect(
            ExportFormat::Csv,
            vec![json!({"a": 1, "b": "x"}), json!({"a": 2, "c": true})],
        );
        let mut lines = out.lines();
        assert_eq!(lines.next().unwrap(), "a,b,c");
        assert_eq!(lines.next().unwrap(), "1,x,");
        assert_eq!(lines.next().unwrap(), "2,,true");
    }

    #[test]
    fn csv_neutralizes_formula_cells() {
        let out = collect(
            ExportFormat::Csv,
            vec![json!({"v": "=SUM(A1:A9)", "w": "+1", "x": "-2", "y": "@cmd", "z": "safe"})],
        );
        let data_line = out.lines().nth(1).unwrap();
        assert!(data_line.contains("'=SUM(A1:A9)"));
        assert!(data_line.contains("'+1"));
        assert!(data_line.contains("'-2"));
        assert!(data_line.contains("'@cmd"));
        assert!(data_line.contains("safe"));
    }

    #[test]
    fn csv_quotes_embedded_delimiters() {
        let out = collect(ExportFormat::Csv, vec![json!({"v": "a,b \"c\""})]);
        assert_eq!(out.lines().nth(1).unwrap(), "\"a,b \"\"c\"\"\"");
    }
}
