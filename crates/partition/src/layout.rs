//! Physical layout of partitioned table output.
//!
//! ```text
//! <base>/<col1>=<v1>/<col2>=<v2>/part-<task:05>-<seq:05>.parquet
//! ```
//!
//! Partition values are rendered canonically so that every task formats an equal key to the
//! same directory name, independent of locale or float printing quirks.

use std::path::{Path, PathBuf};

use arrow::temporal_conversions::date32_to_datetime;
use arrow_schema::DataType;
use chrono::NaiveDate;
use ctas_common::{CtasError, Result};

use crate::value::ScalarValue;

pub const DATA_FILE_PREFIX: &str = "part-";
pub const DATA_FILE_SUFFIX: &str = ".parquet";

/// Deterministic data-file name; a retried attempt rewrites the same names.
pub fn data_file_name(task_id: u64, seq: u64) -> String {
    format!("{DATA_FILE_PREFIX}{task_id:05}-{seq:05}{DATA_FILE_SUFFIX}")
}

/// Common prefix of every data file written by `task_id`.
pub fn task_file_prefix(task_id: u64) -> String {
    format!("{DATA_FILE_PREFIX}{task_id:05}-")
}

pub fn is_data_file(name: &str) -> bool {
    name.starts_with(DATA_FILE_PREFIX) && name.ends_with(DATA_FILE_SUFFIX)
}

/// Render one partition value in canonical form.
pub fn format_partition_value(column: &str, value: &ScalarValue) -> Result<String> {
    let raw = match value {
        ScalarValue::Null => return Err(invalid(column, "NULL is not a valid partition value")),
        ScalarValue::Int32(v) => v.to_string(),
        ScalarValue::Int64(v) => v.to_string(),
        ScalarValue::Float32(v) => format_float32(column, *v)?,
        ScalarValue::Float64(v) => format_float(column, *v)?,
        ScalarValue::Boolean(v) => v.to_string(),
        ScalarValue::Date32(days) => format_date32(*days)
            .ok_or_else(|| invalid(column, &format!("date32 {days} is out of range")))?,
        ScalarValue::Utf8(s) => {
            if s.is_empty() {
                return Err(invalid(column, "empty string cannot name a partition"));
            }
            escape_path_name(s)
        }
    };
    Ok(raw)
}

fn format_float(column: &str, v: f64) -> Result<String> {
    if !v.is_finite() {
        return Err(invalid(column, &format!("non-finite value {v}")));
    }
    let v = if v == 0.0 { 0.0 } else { v };
    // Debug is the shortest round-trip form and keeps ".0" on whole values below 1e16.
    Ok(format!("{v:?}"))
}

// Formatted at f32 precision so `0.1f32` stays `0.1`.
fn format_float32(column: &str, v: f32) -> Result<String> {
    if !v.is_finite() {
        return Err(invalid(column, &format!("non-finite value {v}")));
    }
    let v = if v == 0.0 { 0.0 } else { v };
    Ok(format!("{v:?}"))
}

fn invalid(column: &str, reason: &str) -> CtasError {
    CtasError::InvalidPartitionValue {
        column: column.to_string(),
        reason: reason.to_string(),
    }
}

/// Parse a canonical directory value back into a typed scalar.
pub fn parse_partition_value(column: &str, raw: &str, data_type: &DataType) -> Result<ScalarValue> {
    let bad = |what: &str| invalid(column, &format!("cannot parse '{raw}' as {what}"));
    match data_type {
        DataType::Int32 => raw.parse().map(ScalarValue::Int32).map_err(|_| bad("Int32")),
        DataType::Int64 => raw.parse().map(ScalarValue::Int64).map_err(|_| bad("Int64")),
        DataType::Float32 => raw
            .parse()
            .map(ScalarValue::Float32)
            .map_err(|_| bad("Float32")),
        DataType::Float64 => raw
            .parse()
            .map(ScalarValue::Float64)
            .map_err(|_| bad("Float64")),
        DataType::Boolean => raw
            .parse()
            .map(ScalarValue::Boolean)
            .map_err(|_| bad("Boolean")),
        DataType::Date32 => parse_date32(raw).map(ScalarValue::Date32).ok_or_else(|| bad("Date32")),
        DataType::Utf8 => Ok(ScalarValue::Utf8(unescape_path_name(raw)?)),
        other => Err(invalid(column, &format!("type {other:?} cannot name a partition"))),
    }
}

/// Whether values of `data_type` can be rendered as a directory name.
pub fn is_partitionable_type(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::Int32
            | DataType::Int64
            | DataType::Float32
            | DataType::Float64
            | DataType::Boolean
            | DataType::Date32
            | DataType::Utf8
    )
}

fn needs_escape(c: char) -> bool {
    c.is_ascii_control()
        || matches!(
            c,
            '"' | '#' | '%' | '\'' | '*' | '/' | ':' | '=' | '?' | '\\' | '{' | '[' | ']' | '^'
        )
}

/// Percent-escape characters that would break a `column=value` path segment.
pub fn escape_path_name(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if needs_escape(c) {
            // every escaped char is ASCII, so one byte each
            out.push_str(&format!("%{:02X}", c as u32));
        } else {
            out.push(c);
        }
    }
    out
}

pub fn unescape_path_name(s: &str) -> Result<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = s
                .get(i + 1..i + 3)
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| CtasError::Execution(format!("bad escape in path name '{s}'")))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out)
        .map_err(|e| CtasError::Execution(format!("path name '{s}' is not utf-8: {e}")))
}

/// `column=value` for one already-formatted value.
pub fn partition_segment(column: &str, formatted_value: &str) -> String {
    format!("{}={formatted_value}", escape_path_name(column))
}

/// Split a `column=value` segment. The value stays in its escaped canonical form.
pub fn parse_partition_segment(segment: &str) -> Result<(String, String)> {
    let (col, value) = segment.split_once('=').ok_or_else(|| {
        CtasError::Execution(format!("'{segment}' is not a column=value segment"))
    })?;
    if col.is_empty() || value.is_empty() {
        return Err(CtasError::Execution(format!(
            "'{segment}' has an empty column or value"
        )));
    }
    Ok((unescape_path_name(col)?, value.to_string()))
}

/// Join segments under `base` in declared column order.
pub fn partition_location(base: &Path, segments: &[String]) -> PathBuf {
    let mut path = base.to_path_buf();
    for s in segments {
        path.push(s);
    }
    path
}

fn format_date32(days: i32) -> Option<String> {
    date32_to_datetime(days).map(|dt| dt.date().format("%Y-%m-%d").to_string())
}

fn parse_date32(raw: &str) -> Option<i32> {
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()?;
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1)?;
    i32::try_from(date.signed_duration_since(epoch).num_days()).ok()
}
