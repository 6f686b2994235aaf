//! SQL statement templates for sync operations
//!
//! Identifiers are validated before they get here and are always emitted
//! double-quoted. Values are never interpolated; every statement uses
//! numbered `$n` placeholders, which both backends accept.

use crate::error::SyncResult;
use crate::models::Value;
use crate::validation::{validate_identifier, validate_identifiers};

/// Quote an identifier for SQL
///
/// Uses standard SQL double quotes; internal quotes are escaped by doubling.
///
/// # Example
///
/// ```
/// use table_sync::sync::statements::quote_identifier;
///
/// assert_eq!(quote_identifier("order"), "\"order\"");
/// ```
pub fn quote_identifier(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn quoted_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_identifier(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Multi-row insert for `row_count` rows
pub fn insert_rows(table: &str, columns: &[String], row_count: usize) -> SyncResult<String> {
    validate_identifier(table)?;
    validate_identifiers(columns)?;
    let width = columns.len();
    let values = (0..row_count)
        .map(|r| {
            let placeholders = (1..=width)
                .map(|c| format!("${}", r * width + c))
                .collect::<Vec<_>>()
                .join(", ");
            format!("({placeholders})")
        })
        .collect::<Vec<_>>()
        .join(", ");
    Ok(format!(
        "INSERT INTO {} ({}) VALUES {}",
        quote_identifier(table),
        quoted_list(columns),
        values
    ))
}

/// Parameterized single-row update by primary key
///
/// Non-key columns are set in sorted order; `params` builds the parameter
/// list for one row laid out like `columns`.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStatement {
    pub sql: String,
    order: Vec<usize>,
}

impl UpdateStatement {
    /// `None` when there is nothing but the key to set
    pub fn new(table: &str, pk_column: &str, columns: &[String]) -> SyncResult<Option<Self>> {
        validate_identifier(table)?;
        validate_identifier(pk_column)?;
        validate_identifiers(columns)?;

        let mut set_columns: Vec<(usize, &String)> = columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.as_str() != pk_column)
            .collect();
        if set_columns.is_empty() {
            return Ok(None);
        }
        set_columns.sort_by(|a, b| a.1.cmp(b.1));

        let Some(pk_idx) = columns.iter().position(|c| c == pk_column) else {
            return Err(crate::error::SyncError::MissingPrimaryKey(pk_column.to_string()));
        };

        let assignments = set_columns
            .iter()
            .enumerate()
            .map(|(i, (_, c))| format!("{} = ${}", quote_identifier(c), i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ${}",
            quote_identifier(table),
            assignments,
            quote_identifier(pk_column),
            set_columns.len() + 1
        );

        let mut order: Vec<usize> = set_columns.iter().map(|(i, _)| *i).collect();
        order.push(pk_idx);
        Ok(Some(Self { sql, order }))
    }

    pub fn params(&self, row: &[Value]) -> Vec<Value> {
        self.order.iter().map(|&i| row[i].clone()).collect()
    }
}

/// Single-row delete by primary key
pub fn delete_row(table: &str, pk_column: &str) -> SyncResult<String> {
    validate_identifier(table)?;
    validate_identifier(pk_column)?;
    Ok(format!(
        "DELETE FROM {} WHERE {} = $1",
        quote_identifier(table),
        quote_identifier(pk_column)
    ))
}

/// Single-column read, used to list existing keys
pub fn select_column(table: &str, column: &str) -> SyncResult<String> {
    validate_identifier(table)?;
    validate_identifier(column)?;
    Ok(format!(
        "SELECT {} FROM {}",
        quote_identifier(column),
        quote_identifier(table)
    ))
}

/// Whole-table read, ordered by the key when there is one
pub fn select_all(table: &str, order_by: Option<&str>) -> SyncResult<String> {
    validate_identifier(table)?;
    let mut sql = format!("SELECT * FROM {}", quote_identifier(table));
    if let Some(column) = order_by {
        validate_identifier(column)?;
        sql.push_str(&format!(" ORDER BY {}", quote_identifier(column)));
    }
    Ok(sql)
}
