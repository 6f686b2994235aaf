//! Audit trail of bulk writes
//!
//! Every mutating call appends one row to the audit table inside the same
//! transaction as its writes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::error::SyncResult;
use crate::models::Value;
use crate::store::Session;
use crate::validation::validate_identifier;

use super::SyncCounts;
use super::statements::{insert_rows, quote_identifier};

/// Default audit table name
pub const DEFAULT_AUDIT_TABLE: &str = "bulk_update_log";

/// One audited call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    pub username: String,
    pub timestamp: DateTime<Utc>,
    pub table_name: String,
    pub rows_inserted: u64,
    pub rows_updated: u64,
    pub rows_deleted: u64,
    pub reason: Option<String>,
}

impl AuditRecord {
    pub fn new(username: &str, table_name: &str, counts: SyncCounts, reason: Option<&str>) -> Self {
        Self {
            username: username.to_string(),
            timestamp: Utc::now(),
            table_name: table_name.to_string(),
            rows_inserted: counts.inserted,
            rows_updated: counts.updated,
            rows_deleted: counts.deleted,
            reason: reason.map(str::to_string),
        }
    }

    fn params(&self) -> Vec<Value> {
        vec![
            Value::from(self.username.as_str()),
            Value::DateTime(self.timestamp.naive_utc()),
            Value::from(self.table_name.as_str()),
            Value::Int(self.rows_inserted as i64),
            Value::Int(self.rows_updated as i64),
            Value::Int(self.rows_deleted as i64),
            Value::from(self.reason.clone()),
        ]
    }
}

/// Audit table accessor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditLog {
    table: String,
}

impl AuditLog {
    pub const COLUMNS: [&'static str; 7] = [
        "username",
        "timestamp",
        "table_name",
        "rows_inserted",
        "rows_updated",
        "rows_deleted",
        "reason",
    ];

    pub fn new(table: &str) -> SyncResult<Self> {
        validate_identifier(table)?;
        Ok(Self {
            table: table.to_string(),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// DDL accepted by both DuckDB and PostgreSQL
    pub fn create_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
    \"username\" TEXT NOT NULL,
    \"timestamp\" TIMESTAMP NOT NULL,
    \"table_name\" TEXT NOT NULL,
    \"rows_inserted\" BIGINT NOT NULL,
    \"rows_updated\" BIGINT NOT NULL,
    \"rows_deleted\" BIGINT NOT NULL,
    \"reason\" TEXT
)",
            quote_identifier(&self.table)
        )
    }

    /// Create the audit table if it does not exist
    pub async fn ensure_table(&self, session: &dyn Session) -> SyncResult<()> {
        session.execute_ddl(&self.create_table_sql()).await?;
        Ok(())
    }

    /// Append one record through the session's open transaction
    pub async fn write(&self, session: &dyn Session, record: &AuditRecord) -> SyncResult<()> {
        let columns: Vec<String> = Self::COLUMNS.iter().map(|c| c.to_string()).collect();
        let sql = insert_rows(&self.table, &columns, 1)?;
        session.execute_batch_dml(&sql, &[record.params()]).await?;
        debug!(
            audit_table = %self.table,
            table = %record.table_name,
            username = %record.username,
            "Wrote audit record"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_params_follow_columns() {
        let counts = SyncCounts {
            inserted: 2,
            updated: 1,
            deleted: 0,
        };
        let record = AuditRecord::new("alice", "sample", counts, None);
        let params = record.params();
        assert_eq!(params.len(), AuditLog::COLUMNS.len());
        assert_eq!(params[0], Value::from("alice"));
        assert_eq!(params[3], Value::Int(2));
        assert_eq!(params[6], Value::Null);
    }

    #[test]
    fn test_ddl_quotes_table() {
        let log = AuditLog::new("bulk_update_log").unwrap();
        assert!(log.create_table_sql().starts_with("CREATE TABLE IF NOT EXISTS \"bulk_update_log\""));
        assert!(AuditLog::new("bad table").is_err());
    }
}
