//! Columnar row sets exchanged with the store and callers

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use crate::error::{SyncError, SyncResult};
use crate::sync::coercion::coerce_json;

use super::value::{Value, ValueKind};

/// Ordered column names plus rows of values
///
/// Every row has exactly as many cells as there are columns.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl RowSet {
    /// Build a row set, rejecting ragged rows and repeated column names
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> SyncResult<Self> {
        let mut seen = BTreeSet::new();
        for column in &columns {
            if !seen.insert(column.as_str()) {
                return Err(SyncError::InvalidRows(format!(
                    "column '{column}' appears more than once"
                )));
            }
        }
        for (i, row) in rows.iter().enumerate() {
            if row.len() != columns.len() {
                return Err(SyncError::InvalidRows(format!(
                    "row {i} has {} values, expected {}",
                    row.len(),
                    columns.len()
                )));
            }
        }
        Ok(Self { columns, rows })
    }

    /// Empty row set with the given columns
    pub fn empty(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Values of one column, in row order
    pub fn column_values(&self, name: &str) -> Option<Vec<&Value>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(|row| &row[idx]).collect())
    }

    /// Kinds of the non-null values per column
    pub fn column_kinds(&self) -> HashMap<&str, BTreeSet<ValueKind>> {
        let mut kinds: HashMap<&str, BTreeSet<ValueKind>> = HashMap::new();
        for (i, column) in self.columns.iter().enumerate() {
            let entry = kinds.entry(column.as_str()).or_default();
            for row in &self.rows {
                if let Some(kind) = row[i].kind() {
                    entry.insert(kind);
                }
            }
        }
        kinds
    }

    /// Restrict to `columns`, in that order
    pub fn project(&self, columns: &[String]) -> SyncResult<RowSet> {
        let indices = columns
            .iter()
            .map(|c| {
                self.column_index(c)
                    .ok_or_else(|| SyncError::UnknownColumns(vec![c.clone()]))
            })
            .collect::<SyncResult<Vec<_>>>()?;
        let rows = self
            .rows
            .iter()
            .map(|row| indices.iter().map(|&i| row[i].clone()).collect())
            .collect();
        Ok(RowSet {
            columns: columns.to_vec(),
            rows,
        })
    }

    /// Rows as JSON records keyed by column name
    pub fn to_records(&self) -> Vec<serde_json::Value> {
        self.rows
            .iter()
            .map(|row| {
                let obj = self
                    .columns
                    .iter()
                    .zip(row)
                    .map(|(c, v)| (c.clone(), v.to_json()))
                    .collect::<serde_json::Map<_, _>>();
                serde_json::Value::Object(obj)
            })
            .collect()
    }

    /// Parse caller-supplied rows
    ///
    /// Accepts either the packed shape `{"columns": [...], "rows": [[...]]}`
    /// or an array of records. For records, columns are taken in first-seen
    /// order and a record that lacks a column contributes null.
    pub fn from_json(value: &serde_json::Value) -> SyncResult<RowSet> {
        match value {
            serde_json::Value::Object(obj) => {
                let columns = obj
                    .get("columns")
                    .and_then(|c| c.as_array())
                    .ok_or_else(|| SyncError::InvalidRows("missing 'columns' array".into()))?
                    .iter()
                    .map(|c| {
                        c.as_str()
                            .map(str::to_string)
                            .ok_or_else(|| SyncError::InvalidRows("column names must be strings".into()))
                    })
                    .collect::<SyncResult<Vec<_>>>()?;
                let rows = obj
                    .get("rows")
                    .and_then(|r| r.as_array())
                    .ok_or_else(|| SyncError::InvalidRows("missing 'rows' array".into()))?
                    .iter()
                    .map(|row| {
                        row.as_array()
                            .map(|cells| cells.iter().map(coerce_json).collect())
                            .ok_or_else(|| SyncError::InvalidRows("each row must be an array".into()))
                    })
                    .collect::<SyncResult<Vec<_>>>()?;
                RowSet::new(columns, rows)
            }
            serde_json::Value::Array(records) => {
                let mut columns: Vec<String> = Vec::new();
                for record in records {
                    let obj = record
                        .as_object()
                        .ok_or_else(|| SyncError::InvalidRows("each record must be an object".into()))?;
                    for key in obj.keys() {
                        if !columns.contains(key) {
                            columns.push(key.clone());
                        }
                    }
                }
                let rows = records
                    .iter()
                    .filter_map(|r| r.as_object())
                    .map(|obj| {
                        columns
                            .iter()
                            .map(|c| obj.get(c).map(coerce_json).unwrap_or(Value::Null))
                            .collect()
                    })
                    .collect();
                RowSet::new(columns, rows)
            }
            _ => Err(SyncError::InvalidRows(
                "expected an array of records or a {columns, rows} object".into(),
            )),
        }
    }
}
