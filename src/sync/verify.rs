//! Post-write sanity checks
//!
//! After a sync commits, the table is read back and compared with the rows
//! the caller asked for. Target rows without a primary key were given one by
//! the store on insert, so they are matched on their remaining columns.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::models::{RowSet, Value};

use super::coercion::{align_numeric, align_temporal, coerce_rows};

/// First difference found between the table and the target
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VerifyError {
    /// Table lacks columns the target carries
    #[error("table cannot be compared with target: {0}")]
    Incomparable(String),

    #[error("target has no column {0}")]
    MissingKeyColumn(String),

    #[error("table has {actual} rows, expected {expected}")]
    RowCount { actual: usize, expected: usize },

    #[error("row with {column} = {value} is missing")]
    MissingRow { column: String, value: Value },

    #[error("row with {column} = {value} differs from target")]
    DiffersFromTarget { column: String, value: Value },

    /// Target row without a key has no counterpart among generated keys
    #[error("an inserted row without a key is missing")]
    MissingKeylessRow,

    #[error("row with {0} is not present as supplied")]
    NotPresent(String),
}

type Multiset = HashMap<Vec<Value>, usize>;

fn prepare(actual: &RowSet, target: &RowSet) -> Result<(RowSet, RowSet), VerifyError> {
    let actual = coerce_rows(actual.clone());
    let mut target = coerce_rows(target.clone());
    align_temporal(&mut target, &actual);
    align_numeric(&mut target, &actual);
    let actual = actual
        .project(&target.columns)
        .map_err(|e| VerifyError::Incomparable(e.to_string()))?;
    Ok((actual, target))
}

fn without(row: &[Value], idx: usize) -> Vec<Value> {
    row.iter()
        .enumerate()
        .filter(|(i, _)| *i != idx)
        .map(|(_, v)| v.clone())
        .collect()
}

fn take(set: &mut Multiset, key: &[Value]) -> bool {
    match set.get_mut(key) {
        Some(count) if *count > 0 => {
            *count -= 1;
            true
        }
        _ => false,
    }
}

/// Table restricted to the target's columns must equal the target
pub fn verify_exact(pk_column: &str, actual: &RowSet, target: &RowSet) -> Result<(), VerifyError> {
    let (actual, target) = prepare(actual, target)?;
    if actual.len() != target.len() {
        return Err(VerifyError::RowCount {
            actual: actual.len(),
            expected: target.len(),
        });
    }
    let pk_idx = target
        .column_index(pk_column)
        .ok_or_else(|| VerifyError::MissingKeyColumn(pk_column.to_string()))?;

    let target_keys: HashSet<&Value> = target
        .rows
        .iter()
        .map(|r| &r[pk_idx])
        .filter(|pk| !pk.is_null())
        .collect();
    let actual_by_pk: HashMap<&Value, &Vec<Value>> =
        actual.rows.iter().map(|r| (&r[pk_idx], r)).collect();

    let mut generated: Multiset = HashMap::new();
    for row in actual.rows.iter().filter(|r| !target_keys.contains(&r[pk_idx])) {
        *generated.entry(without(row, pk_idx)).or_default() += 1;
    }

    for row in &target.rows {
        let pk = &row[pk_idx];
        if pk.is_null() {
            if !take(&mut generated, &without(row, pk_idx)) {
                return Err(VerifyError::MissingKeylessRow);
            }
            continue;
        }
        match actual_by_pk.get(pk) {
            None => {
                return Err(VerifyError::MissingRow {
                    column: pk_column.to_string(),
                    value: pk.clone(),
                });
            }
            Some(current) if *current != row => {
                return Err(VerifyError::DiffersFromTarget {
                    column: pk_column.to_string(),
                    value: pk.clone(),
                });
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Every target row must appear verbatim in the table
pub fn verify_contains(
    pk_column: &str,
    actual: &RowSet,
    target: &RowSet,
) -> Result<(), VerifyError> {
    let (actual, target) = prepare(actual, target)?;
    let pk_idx = target.column_index(pk_column);

    let mut full: Multiset = HashMap::new();
    let mut keyless: Multiset = HashMap::new();
    for row in &actual.rows {
        *full.entry(row.clone()).or_default() += 1;
        if let Some(idx) = pk_idx {
            *keyless.entry(without(row, idx)).or_default() += 1;
        }
    }

    for row in &target.rows {
        let found = match pk_idx {
            Some(idx) if row[idx].is_null() => take(&mut keyless, &without(row, idx)),
            Some(idx) => {
                take(&mut full, row) && take(&mut keyless, &without(row, idx))
            }
            None => take(&mut full, row),
        };
        if !found {
            let key = pk_idx
                .map(|idx| format!("{pk_column} = {}", row[idx]))
                .unwrap_or_else(|| "a target row".to_string());
            return Err(VerifyError::NotPresent(key));
        }
    }
    Ok(())
}
