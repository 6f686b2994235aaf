//! Diff of existing rows against a target row set, keyed by primary key

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::error::{SyncError, SyncResult};
use crate::models::{RowSet, Value};

use super::coercion::{align_numeric, align_temporal, coerce_rows};

/// Operations that bring a table to the target rows
///
/// `new_rows` and `updated_rows` carry the target's columns in target order.
/// `removed_pks` lists existing keys absent from the target, in the order the
/// existing rows were read.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reconciliation {
    pub new_rows: RowSet,
    pub updated_rows: RowSet,
    pub removed_pks: Vec<Value>,
}

impl Reconciliation {
    /// True when the table already matches the target
    pub fn is_empty(&self) -> bool {
        self.new_rows.is_empty() && self.updated_rows.is_empty() && self.removed_pks.is_empty()
    }
}

/// Check that `target` can be written into a table shaped like `existing`
///
/// Checked in order: unknown columns, presence of the primary key, and
/// kind compatibility of every column that is non-null on both sides. Both
/// row sets must already be coerced.
pub fn check_preconditions(pk_column: &str, existing: &RowSet, target: &RowSet) -> SyncResult<()> {
    let mut unknown: Vec<String> = target
        .columns
        .iter()
        .filter(|c| existing.column_index(c).is_none())
        .cloned()
        .collect();
    if !unknown.is_empty() {
        unknown.sort();
        return Err(SyncError::UnknownColumns(unknown));
    }

    if target.column_index(pk_column).is_none() {
        return Err(SyncError::MissingPrimaryKey(pk_column.to_string()));
    }

    let existing_kinds = existing.column_kinds();
    let target_kinds = target.column_kinds();
    for column in &target.columns {
        let (Some(existing_kind), Some(target_kind)) = (
            existing_kinds.get(column.as_str()),
            target_kinds.get(column.as_str()),
        ) else {
            continue;
        };
        if !existing_kind.is_empty() && !target_kind.is_empty() && existing_kind != target_kind {
            return Err(SyncError::TypeMismatch {
                column: column.clone(),
                existing: existing_kind.iter().copied().collect(),
                target: target_kind.iter().copied().collect(),
            });
        }
    }

    Ok(())
}

/// Reject target rows that share a non-null primary key value
pub fn check_unique_keys(pk_column: &str, target: &RowSet) -> SyncResult<()> {
    let Some(pk_idx) = target.column_index(pk_column) else {
        return Err(SyncError::MissingPrimaryKey(pk_column.to_string()));
    };
    let mut seen = HashSet::new();
    for row in &target.rows {
        let pk = &row[pk_idx];
        if !pk.is_null() && !seen.insert(pk) {
            return Err(SyncError::DuplicatePrimaryKey(pk.clone()));
        }
    }
    Ok(())
}

/// Compute inserts, updates and deletes that turn `existing` into `target`
///
/// Only the target's columns are compared, so a target that omits columns
/// leaves them untouched. A target row with a null key is always new.
pub fn reconcile(pk_column: &str, existing: &RowSet, target: &RowSet) -> SyncResult<Reconciliation> {
    let existing = coerce_rows(existing.clone());
    let mut target = coerce_rows(target.clone());
    align_temporal(&mut target, &existing);
    align_numeric(&mut target, &existing);

    check_preconditions(pk_column, &existing, &target)?;
    check_unique_keys(pk_column, &target)?;

    let existing = existing.project(&target.columns)?;
    let pk_idx = target
        .column_index(pk_column)
        .ok_or_else(|| SyncError::MissingPrimaryKey(pk_column.to_string()))?;

    let existing_by_pk: HashMap<&Value, &Vec<Value>> = existing
        .rows
        .iter()
        .filter(|row| !row[pk_idx].is_null())
        .map(|row| (&row[pk_idx], row))
        .collect();

    let mut new_rows = Vec::new();
    let mut updated_rows = Vec::new();
    let mut present: HashSet<&Value> = HashSet::new();

    for row in &target.rows {
        let pk = &row[pk_idx];
        match existing_by_pk.get(pk) {
            Some(current) if !pk.is_null() => {
                present.insert(pk);
                if *current != row {
                    updated_rows.push(row.clone());
                }
            }
            _ => new_rows.push(row.clone()),
        }
    }

    let removed_pks = existing
        .rows
        .iter()
        .map(|row| &row[pk_idx])
        .filter(|pk| !pk.is_null() && !present.contains(pk))
        .cloned()
        .collect();

    Ok(Reconciliation {
        new_rows: RowSet {
            columns: target.columns.clone(),
            rows: new_rows,
        },
        updated_rows: RowSet {
            columns: target.columns.clone(),
            rows: updated_rows,
        },
        removed_pks,
    })
}
