//! Embedded DuckDB store

use std::cell::Cell;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use duckdb::ToSql;
use duckdb::types::{TimeUnit, ToSqlOutput};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::SyncResult;
use crate::models::{RowSet, Value};
use crate::sync::coercion::{
    canonical_list, coerce_decimal_text, coerce_f32, coerce_i128, coerce_u64, coerce_value,
};
use crate::sync::statements::insert_rows;

use super::{Catalog, ForeignKeyRecord, RetryPolicy, Session, Store, StoreError, connect_with_retry};

/// Days between 0001-01-01 and 1970-01-01
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// DuckDB-backed store
///
/// DuckDB connections are not shared between concurrent users, so sessions
/// take turns on the single connection.
pub struct DuckDbStore {
    conn: Mutex<duckdb::Connection>,
    path: Option<PathBuf>,
    schema: String,
}

impl DuckDbStore {
    /// Open or create a database file, retrying per `retry`
    pub async fn open(path: &Path, retry: &RetryPolicy) -> SyncResult<Self> {
        let conn = connect_with_retry(retry, &path.display().to_string(), || async move {
            duckdb::Connection::open(path).map_err(|e| StoreError::Connection(e.to_string()))
        })
        .await?;
        info!(path = %path.display(), "Opened DuckDB database");
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
            schema: "main".to_string(),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn memory() -> SyncResult<Self> {
        let conn = duckdb::Connection::open_in_memory()
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
            schema: "main".to_string(),
        })
    }

    /// Get the database path (if not in-memory)
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run one or more statements outside of any session
    pub async fn execute_batch(&self, sql: &str) -> SyncResult<()> {
        let conn = self.conn.lock().await;
        conn.execute_batch(sql).map_err(map_error)?;
        Ok(())
    }
}

#[async_trait(?Send)]
impl Store for DuckDbStore {
    async fn open_session<'a>(
        &'a self,
        username: &str,
    ) -> Result<Box<dyn Session + 'a>, StoreError> {
        let conn = self.conn.lock().await;
        debug!(username = %username, "Opened DuckDB session");
        Ok(Box::new(DuckDbSession {
            conn,
            schema: &self.schema,
            username: username.to_string(),
            in_transaction: Cell::new(false),
        }))
    }

    fn schema_name(&self) -> &str {
        &self.schema
    }
}

/// Session holding the connection for its lifetime
pub struct DuckDbSession<'a> {
    conn: MutexGuard<'a, duckdb::Connection>,
    schema: &'a str,
    username: String,
    in_transaction: Cell<bool>,
}

impl DuckDbSession<'_> {
    fn query_rows(&self, sql: &str, params: &[Value]) -> Result<RowSet, StoreError> {
        let mut stmt = self.conn.prepare(sql).map_err(map_error)?;
        let mut rows = stmt
            .query(duckdb::params_from_iter(params.iter()))
            .map_err(map_error)?;

        // Get column names after query execution
        let column_count = rows.as_ref().map(|r| r.column_count()).unwrap_or(0);
        let column_names: Vec<String> = (0..column_count)
            .map(|i| {
                rows.as_ref()
                    .and_then(|r| r.column_name(i).ok())
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| format!("col{}", i))
            })
            .collect();

        let mut results = Vec::new();
        while let Some(row) = rows.next().map_err(map_error)? {
            let mut values = Vec::with_capacity(column_count);
            for (i, name) in column_names.iter().enumerate() {
                let value: duckdb::types::Value = row.get(i).map_err(map_error)?;
                values.push(from_duckdb(name, value)?);
            }
            results.push(values);
        }

        RowSet::new(column_names, results).map_err(|e| StoreError::Query(e.to_string()))
    }

    fn text_column(&self, sql: &str, params: &[Value]) -> Result<Vec<String>, StoreError> {
        let rows = self.query_rows(sql, params)?;
        Ok(rows
            .rows
            .into_iter()
            .filter_map(|row| row.into_iter().next())
            .map(|v| v.to_string())
            .collect())
    }
}

#[async_trait(?Send)]
impl Catalog for DuckDbSession<'_> {
    async fn table_names(&self) -> Result<Vec<String>, StoreError> {
        self.text_column(
            "SELECT table_name FROM information_schema.tables
             WHERE table_schema = $1
             ORDER BY table_name",
            &[Value::from(self.schema)],
        )
    }

    async fn primary_key_columns(&self, table: &str) -> Result<Vec<String>, StoreError> {
        self.text_column(
            "SELECT UNNEST(constraint_column_names) AS column_name
             FROM duckdb_constraints()
             WHERE schema_name = $1 AND table_name = $2 AND constraint_type = 'PRIMARY KEY'",
            &[Value::from(self.schema), Value::from(table)],
        )
    }

    async fn foreign_keys(&self) -> Result<Vec<ForeignKeyRecord>, StoreError> {
        let rows = self.query_rows(
            "SELECT schema_name,
                    COALESCE(constraint_name, table_name || '_fk_' || CAST(constraint_index AS VARCHAR)) AS constraint_name,
                    table_name,
                    UNNEST(constraint_column_names) AS column_name,
                    referenced_table,
                    UNNEST(referenced_column_names) AS referenced_column
             FROM duckdb_constraints()
             WHERE schema_name = $1 AND constraint_type = 'FOREIGN KEY'",
            &[Value::from(self.schema)],
        )?;
        Ok(rows
            .rows
            .into_iter()
            .filter_map(|row| match row.as_slice() {
                [schema, constraint, table, column, referenced_table, referenced_column] => {
                    Some(ForeignKeyRecord {
                        table_schema: schema.to_string(),
                        constraint_name: constraint.to_string(),
                        table_name: table.to_string(),
                        column_name: column.to_string(),
                        referenced_table: referenced_table.to_string(),
                        referenced_column: referenced_column.to_string(),
                    })
                }
                _ => None,
            })
            .collect())
    }
}

#[async_trait(?Send)]
impl Session for DuckDbSession<'_> {
    fn username(&self) -> &str {
        &self.username
    }

    fn as_catalog(&self) -> &dyn Catalog {
        self
    }

    async fn execute_select(&self, sql: &str, params: &[Value]) -> Result<RowSet, StoreError> {
        self.query_rows(sql, params)
    }

    async fn execute_batch_dml(
        &self,
        sql: &str,
        param_rows: &[Vec<Value>],
    ) -> Result<u64, StoreError> {
        if param_rows.is_empty() {
            return Ok(0);
        }
        let mut stmt = self.conn.prepare(sql).map_err(map_error)?;
        let mut affected = 0u64;
        for params in param_rows {
            affected += stmt
                .execute(duckdb::params_from_iter(params.iter()))
                .map_err(map_error)? as u64;
        }
        Ok(affected)
    }

    async fn execute_multi_row_insert(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Vec<Value>],
    ) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let sql = insert_rows(table, columns, rows.len())
            .map_err(|e| StoreError::Query(e.to_string()))?;
        let params: Vec<Value> = rows.iter().flatten().cloned().collect();
        self.execute_batch_dml(&sql, &[params]).await
    }

    async fn execute_ddl(&self, sql: &str) -> Result<(), StoreError> {
        self.conn.execute_batch(sql).map_err(map_error)
    }

    async fn begin(&self) -> Result<(), StoreError> {
        self.conn
            .execute_batch("BEGIN TRANSACTION")
            .map_err(map_error)?;
        self.in_transaction.set(true);
        Ok(())
    }

    async fn commit(&self) -> Result<(), StoreError> {
        let result = self.conn.execute_batch("COMMIT").map_err(map_error);
        // a failed commit leaves DuckDB in an aborted transaction
        if result.is_ok() {
            self.in_transaction.set(false);
        }
        result
    }

    async fn rollback(&self) -> Result<(), StoreError> {
        self.in_transaction.set(false);
        self.conn.execute_batch("ROLLBACK").map_err(map_error)
    }

    async fn release(&mut self) -> Result<(), StoreError> {
        let result = if self.in_transaction.get() {
            self.rollback().await
        } else {
            Ok(())
        };
        debug!(username = %self.username, "Released DuckDB session");
        self.username.clear();
        result
    }
}

impl Drop for DuckDbSession<'_> {
    fn drop(&mut self) {
        if self.in_transaction.get() {
            warn!("DuckDB session dropped with an open transaction, rolling back");
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!(error = %e, "Rollback on drop failed");
            }
        }
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> duckdb::Result<ToSqlOutput<'_>> {
        let value = match self {
            Value::Null => duckdb::types::Value::Null,
            Value::Int(n) => duckdb::types::Value::BigInt(*n),
            Value::Float(f) => duckdb::types::Value::Double(*f),
            Value::Text(s) => duckdb::types::Value::Text(s.clone()),
            Value::Bool(b) => duckdb::types::Value::Boolean(*b),
            Value::Date(d) => duckdb::types::Value::Date32(days_since_epoch(d)),
            Value::DateTime(dt) => duckdb::types::Value::Timestamp(
                TimeUnit::Microsecond,
                dt.and_utc().timestamp_micros(),
            ),
        };
        Ok(ToSqlOutput::Owned(value))
    }
}

fn days_since_epoch(date: &NaiveDate) -> i32 {
    use chrono::Datelike;
    date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE
}

fn timestamp_micros(unit: TimeUnit, value: i64) -> i64 {
    match unit {
        TimeUnit::Second => value.saturating_mul(1_000_000),
        TimeUnit::Millisecond => value.saturating_mul(1_000),
        TimeUnit::Microsecond => value,
        TimeUnit::Nanosecond => value / 1_000,
    }
}

/// Convert a DuckDB cell into its canonical value
fn from_duckdb(column: &str, value: duckdb::types::Value) -> Result<Value, StoreError> {
    use duckdb::types::Value as Duck;

    let unsupported = |value: &Duck| StoreError::UnsupportedType {
        column: column.to_string(),
        type_name: format!("{:?}", value.data_type()),
    };

    let converted = match value {
        Duck::Null => Value::Null,
        Duck::Boolean(b) => Value::Bool(b),
        Duck::TinyInt(n) => Value::Int(n.into()),
        Duck::SmallInt(n) => Value::Int(n.into()),
        Duck::Int(n) => Value::Int(n.into()),
        Duck::BigInt(n) => Value::Int(n),
        Duck::HugeInt(n) => coerce_i128(n),
        Duck::UTinyInt(n) => Value::Int(n.into()),
        Duck::USmallInt(n) => Value::Int(n.into()),
        Duck::UInt(n) => Value::Int(n.into()),
        Duck::UBigInt(n) => coerce_u64(n),
        Duck::Float(f) => coerce_f32(f),
        Duck::Double(f) => coerce_value(Value::Float(f)),
        Duck::Decimal(d) => coerce_decimal_text(&d.to_string()),
        Duck::Text(s) => Value::Text(s),
        Duck::Enum(s) => Value::Text(s),
        Duck::Date32(days) => NaiveDate::from_num_days_from_ce_opt(days + UNIX_EPOCH_DAYS_FROM_CE)
            .map(Value::Date)
            .unwrap_or(Value::Null),
        Duck::Timestamp(unit, v) => DateTime::from_timestamp_micros(timestamp_micros(unit, v))
            .map(|dt| Value::DateTime(dt.naive_utc()))
            .unwrap_or(Value::Null),
        Duck::List(items) | Duck::Array(items) => {
            let items = items
                .into_iter()
                .map(|item| from_duckdb(column, item))
                .collect::<Result<Vec<_>, _>>()?;
            canonical_list(items)
        }
        other => return Err(unsupported(&other)),
    };
    Ok(converted)
}

fn map_error(err: duckdb::Error) -> StoreError {
    let message = err.to_string();
    if message.contains("Duplicate key")
        || message.contains("violates primary key constraint")
        || message.contains("violates unique constraint")
    {
        StoreError::UniqueViolation(message)
    } else if message.contains("INTERRUPT") || message.contains("Interrupted") {
        StoreError::Timeout(message)
    } else {
        StoreError::Query(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_date_epoch_offset() {
        let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap();
        assert_eq!(days_since_epoch(&epoch), 0);
        let value = from_duckdb("d", duckdb::types::Value::Date32(1)).unwrap();
        assert_eq!(value, Value::Date(NaiveDate::from_ymd_opt(1970, 1, 2).unwrap()));
    }

    #[test]
    fn test_lists_become_canonical_strings() {
        let list = duckdb::types::Value::List(vec![
            duckdb::types::Value::Int(1),
            duckdb::types::Value::Null,
        ]);
        assert_eq!(from_duckdb("tags", list).unwrap(), Value::Text("[1,null]".into()));
    }

    #[test]
    fn test_unique_violation_detected() {
        let store = DuckDbStore::memory().unwrap();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            store
                .execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY); INSERT INTO t VALUES (1);")
                .await
                .unwrap();
            let session = store.open_session("tester").await.unwrap();
            let err = session
                .execute_batch_dml("INSERT INTO t VALUES ($1)", &[vec![Value::Int(1)]])
                .await
                .unwrap_err();
            assert!(matches!(err, StoreError::UniqueViolation(_)), "{err:?}");
        });
    }
}
