use std::collections::HashSet;
use std::io::Cursor;
use std::path::Path;

use bytes::Bytes;
use calamine::{open_workbook_auto_from_rs, Data, Reader};
use serde_json::{Map, Value};

use crate::error::AppError;
use crate::models::{CellValue, RecordSet};

/// Row/byte ceilings applied before and during parsing.
#[derive(Debug, Clone, Copy)]
pub struct IngestLimits {
    pub max_bytes: usize,
    pub max_rows: usize,
}

/// Reads the file once and dispatches on the extension.
pub async fn ingest_path(path: &Path, limits: IngestLimits) -> Result<RecordSet, AppError> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    let data = Bytes::from(tokio::fs::read(path).await?);

    match extension.as_str() {
        "csv" => ingest_csv(&data, limits),
        "xls" | "xlsx" => ingest_workbook(data, limits),
        other => Err(AppError::InvalidInput(format!(
            "Unsupported file type '{}'. Only CSV and Excel files are allowed.",
            other
        ))),
    }
}

/// Delimited text: first row is the header, numeric-looking fields coerce to
/// numbers, empty fields become null.
pub fn ingest_csv(data: &[u8], limits: IngestLimits) -> Result<RecordSet, AppError> {
    check_byte_ceiling(data.len(), limits)?;

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(data);

    let columns: Vec<String> = reader
        .headers()
        .map_err(|e| AppError::MalformedInput(format!("Failed to read CSV header: {}", e)))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    validate_header(&columns)?;

    let mut rows = Vec::new();
    for (idx, result) in reader.records().enumerate() {
        let record = result
            .map_err(|e| AppError::MalformedInput(format!("Failed to read row {}: {}", idx + 1, e)))?;
        if record.len() != columns.len() {
            return Err(AppError::MalformedInput(format!(
                "row {} has {} fields, expected {}",
                idx + 1,
                record.len(),
                columns.len()
            )));
        }
        rows.push(record.iter().map(coerce_field).collect());
        check_row_ceiling(rows.len(), limits)?;
    }

    Ok(RecordSet { columns, rows })
}

/// Workbook: first sheet only, cell values carry their own type, string
/// cells get the same numeric coercion as CSV fields.
pub fn ingest_workbook(data: Bytes, limits: IngestLimits) -> Result<RecordSet, AppError> {
    check_byte_ceiling(data.len(), limits)?;

    let cursor = Cursor::new(data);
    let mut workbook = open_workbook_auto_from_rs(cursor)
        .map_err(|e| AppError::MalformedInput(format!("Failed to open workbook: {}", e)))?;

    let sheet_name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| AppError::MalformedInput("No sheets found in workbook".to_string()))?;

    let range = workbook
        .worksheet_range(&sheet_name)
        .map_err(|e| AppError::MalformedInput(format!("Failed to read worksheet: {}", e)))?;

    let mut row_iter = range.rows();
    let columns: Vec<String> = row_iter
        .next()
        .map(|row| row.iter().map(|cell| cell.to_string().trim().to_string()).collect())
        .unwrap_or_default();
    validate_header(&columns)?;

    let mut rows = Vec::new();
    for (idx, row) in row_iter.enumerate() {
        // Calamine pads the range to its widest row. Extra cells past the
        // header are only a fault when they hold data.
        if row.len() > columns.len() && row[columns.len()..].iter().any(|c| !matches!(c, Data::Empty))
        {
            return Err(AppError::MalformedInput(format!(
                "row {} has more fields than the header ({})",
                idx + 1,
                columns.len()
            )));
        }
        let mut cells: Vec<CellValue> = row
            .iter()
            .take(columns.len())
            .map(workbook_cell)
            .collect();
        cells.resize(columns.len(), CellValue::Null);
        rows.push(cells);
        check_row_ceiling(rows.len(), limits)?;
    }

    Ok(RecordSet { columns, rows })
}

/// Pre-structured input: the column set is the union of keys over the first
/// sampled records, in first-seen order. Records missing a key get null.
pub fn ingest_records(
    records: &[Map<String, Value>],
    schema_sample_rows: usize,
    limits: IngestLimits,
) -> Result<RecordSet, AppError> {
    if records.is_empty() {
        return Err(AppError::InvalidInput(
            "Invalid data format. Expected array of objects.".to_string(),
        ));
    }
    check_row_ceiling(records.len(), limits)?;

    let mut columns: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for record in records.iter().take(schema_sample_rows.max(1)) {
        for key in record.keys() {
            if seen.insert(key.clone()) {
                columns.push(key.clone());
            }
        }
    }
    if columns.is_empty() {
        return Err(AppError::EmptyDataset(
            "records contain no columns".to_string(),
        ));
    }

    let rows = records
        .iter()
        .map(|record| {
            columns
                .iter()
                .map(|col| record.get(col).map_or(CellValue::Null, json_cell))
                .collect()
        })
        .collect();

    Ok(RecordSet { columns, rows })
}

fn validate_header(columns: &[String]) -> Result<(), AppError> {
    if columns.is_empty() {
        return Err(AppError::MalformedInput("header row is empty".to_string()));
    }
    let mut seen = HashSet::new();
    for name in columns {
        if name.is_empty() {
            return Err(AppError::MalformedInput(
                "header contains an empty column name".to_string(),
            ));
        }
        if !seen.insert(name.as_str()) {
            return Err(AppError::MalformedInput(format!(
                "header contains duplicate column name '{}'",
                name
            )));
        }
    }
    Ok(())
}

/// CSV field coercion: empty -> null, numeric-looking -> number, else text.
fn coerce_field(raw: &str) -> CellValue {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return CellValue::Null;
    }
    match trimmed.parse::<f64>() {
        Ok(n) if n.is_finite() => CellValue::Number(n),
        _ => CellValue::Text(trimmed.to_string()),
    }
}

fn workbook_cell(cell: &Data) -> CellValue {
    match cell {
        Data::Empty => CellValue::Null,
        Data::Int(i) => CellValue::Number(*i as f64),
        Data::Float(f) => CellValue::Number(*f),
        Data::Bool(b) => CellValue::Bool(*b),
        Data::String(s) => coerce_field(s),
        Data::DateTime(dt) => CellValue::Text(excel_datetime_text(dt.as_f64())),
        Data::DateTimeIso(s) | Data::DurationIso(s) => CellValue::Text(s.clone()),
        Data::Error(_) => CellValue::Null,
    }
}

/// Excel serial date (days since 1899-12-30) to an ISO-like timestamp.
fn excel_datetime_text(serial: f64) -> String {
    let seconds = ((serial - 25569.0) * 86400.0).round() as i64;
    match chrono::DateTime::from_timestamp(seconds, 0) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => serial.to_string(),
    }
}

fn json_cell(value: &Value) -> CellValue {
    match value {
        Value::Null => CellValue::Null,
        Value::Bool(b) => CellValue::Bool(*b),
        Value::Number(n) => n
            .as_f64()
            .map_or(CellValue::Null, CellValue::Number),
        Value::String(s) => CellValue::Text(s.clone()),
        // Nested structures are carried as their JSON text.
        other => CellValue::Text(other.to_string()),
    }
}

fn check_byte_ceiling(len: usize, limits: IngestLimits) -> Result<(), AppError> {
    if len > limits.max_bytes {
        return Err(AppError::InputTooLarge(format!(
            "input is {} bytes, ceiling is {}",
            len, limits.max_bytes
        )));
    }
    Ok(())
}

fn check_row_ceiling(rows: usize, limits: IngestLimits) -> Result<(), AppError> {
    if rows > limits.max_rows {
        return Err(AppError::InputTooLarge(format!(
            "input exceeds the {} row ceiling",
            limits.max_rows
        )));
    }
    Ok(())
}
