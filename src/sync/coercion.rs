//! Normalization of cell values into their canonical comparable form
//!
//! Existing rows read from the store and target rows supplied by callers go
//! through the same functions before they are compared, inserted or updated.

use chrono::{NaiveDate, NaiveDateTime};

use crate::models::value::DATE_FORMAT;
use crate::models::{RowSet, Value, ValueKind};

const DATETIME_INPUT_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Canonical form of a single value
///
/// NaN is the missing-value marker and becomes null; negative zero becomes
/// zero so it compares and hashes like zero.
pub fn coerce_value(value: Value) -> Value {
    match value {
        Value::Float(f) if f.is_nan() => Value::Null,
        Value::Float(f) if f == 0.0 => Value::Float(0.0),
        other => other,
    }
}

/// Single-precision float by its shortest decimal form
///
/// Widening with `as` would turn a stored `0.1` into `0.10000000149011612`,
/// which never equals the `0.1` a caller supplied.
pub fn coerce_f32(f: f32) -> Value {
    let widened = f.to_string().parse::<f64>().unwrap_or(f as f64);
    coerce_value(Value::Float(widened))
}

/// Wide or unsigned integers, falling back to float when out of `i64` range
pub fn coerce_i128(n: i128) -> Value {
    match i64::try_from(n) {
        Ok(n) => Value::Int(n),
        Err(_) => Value::Float(n as f64),
    }
}

pub fn coerce_u64(n: u64) -> Value {
    coerce_i128(n as i128)
}

/// Decimal rendered as text by the driver
pub fn coerce_decimal_text(text: &str) -> Value {
    text.parse::<i64>()
        .map(Value::Int)
        .or_else(|_| text.parse::<f64>().map(|f| coerce_value(Value::Float(f))))
        .unwrap_or_else(|_| Value::Text(text.to_string()))
}

/// List-valued cell as a hashable string
///
/// The string is the JSON array of the coerced elements. Elements that are
/// lists themselves are expected to arrive already collapsed to strings.
pub fn canonical_list(items: Vec<Value>) -> Value {
    let elements: Vec<serde_json::Value> = items
        .into_iter()
        .map(|v| coerce_value(v).to_json())
        .collect();
    Value::Text(serde_json::Value::Array(elements).to_string())
}

/// Value from caller-supplied JSON
pub fn coerce_json(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if let Some(u) = n.as_u64() {
                coerce_u64(u)
            } else {
                coerce_value(Value::Float(n.as_f64().unwrap_or(f64::NAN)))
            }
        }
        serde_json::Value::String(s) => Value::Text(s.clone()),
        serde_json::Value::Array(items) => canonical_list(items.iter().map(coerce_json).collect()),
        serde_json::Value::Object(_) => Value::Text(value.to_string()),
    }
}

pub fn coerce_row(row: Vec<Value>) -> Vec<Value> {
    row.into_iter().map(coerce_value).collect()
}

/// Coerce every cell of a row set
pub fn coerce_rows(rows: RowSet) -> RowSet {
    RowSet {
        columns: rows.columns,
        rows: rows.rows.into_iter().map(coerce_row).collect(),
    }
}

fn parse_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text.trim(), DATE_FORMAT).ok()
}

fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    DATETIME_INPUT_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .or_else(|| {
            chrono::DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|dt| dt.naive_utc())
        })
        .or_else(|| parse_date(text).and_then(|d| d.and_hms_opt(0, 0, 0)))
}

/// Parse text cells of `target` in columns that hold dates in `existing`
///
/// JSON has no temporal type, so dates arrive as ISO strings. A column is
/// aligned only when all of its existing non-null values share one temporal
/// kind. Text that does not parse is left alone and surfaces later as a
/// type mismatch.
pub fn align_temporal(target: &mut RowSet, existing: &RowSet) {
    let existing_kinds = existing.column_kinds();
    let plan: Vec<(usize, ValueKind)> = target
        .columns
        .iter()
        .enumerate()
        .filter_map(|(i, column)| {
            let kinds = existing_kinds.get(column.as_str())?;
            match kinds.iter().collect::<Vec<_>>().as_slice() {
                [ValueKind::Date] => Some((i, ValueKind::Date)),
                [ValueKind::DateTime] => Some((i, ValueKind::DateTime)),
                _ => None,
            }
        })
        .collect();

    if plan.is_empty() {
        return;
    }

    for row in &mut target.rows {
        for &(i, kind) in &plan {
            let parsed = match (&row[i], kind) {
                (Value::Text(s), ValueKind::Date) => parse_date(s).map(Value::Date),
                (Value::Text(s), ValueKind::DateTime) => parse_datetime(s).map(Value::DateTime),
                _ => None,
            };
            if let Some(value) = parsed {
                row[i] = value;
            }
        }
    }
}

/// Match integer and float cells of `target` to the numeric kind of `existing`
///
/// A DOUBLE column reads back as floats even when integers were written, and
/// JSON renders `3.0` as a float. Integers become floats in columns whose
/// existing values are all floats; integral floats become integers in columns
/// whose existing values are all integers.
pub fn align_numeric(target: &mut RowSet, existing: &RowSet) {
    let existing_kinds = existing.column_kinds();
    let plan: Vec<(usize, ValueKind)> = target
        .columns
        .iter()
        .enumerate()
        .filter_map(|(i, column)| {
            let kinds = existing_kinds.get(column.as_str())?;
            match kinds.iter().collect::<Vec<_>>().as_slice() {
                [ValueKind::Float] => Some((i, ValueKind::Float)),
                [ValueKind::Int] => Some((i, ValueKind::Int)),
                _ => None,
            }
        })
        .collect();

    for row in &mut target.rows {
        for &(i, kind) in &plan {
            let aligned = match (&row[i], kind) {
                (Value::Int(n), ValueKind::Float) => Some(Value::Float(*n as f64)),
                (Value::Float(f), ValueKind::Int)
                    if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64 =>
                {
                    Some(Value::Int(*f as i64))
                }
                _ => None,
            };
            if let Some(value) = aligned {
                row[i] = value;
            }
        }
    }
}
