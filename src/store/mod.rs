//! Store abstraction
//!
//! Defines the traits the executor talks to and the backends implementing them:
//! - DuckDbStore: embedded DuckDB database (default)
//! - PostgresStore: PostgreSQL server

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::warn;

use crate::config::DatabaseConfig;
use crate::error::{SyncError, SyncResult};
use crate::models::{RowSet, Value};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),
    #[error("Statement timed out: {0}")]
    Timeout(String),
    #[error("Unsupported type {type_name} in column {column}")]
    UnsupportedType { column: String, type_name: String },
    #[error("Query error: {0}")]
    Query(String),
}

/// One foreign key column as reported by the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignKeyRecord {
    pub table_schema: String,
    pub constraint_name: String,
    pub table_name: String,
    pub column_name: String,
    pub referenced_table: String,
    pub referenced_column: String,
}

/// Catalog introspection
#[async_trait(?Send)]
pub trait Catalog {
    /// Tables and views of the configured schema
    async fn table_names(&self) -> Result<Vec<String>, StoreError>;

    /// Primary key columns of a table, empty when it has none
    async fn primary_key_columns(&self, table: &str) -> Result<Vec<String>, StoreError>;

    /// Every foreign key column of the configured schema
    async fn foreign_keys(&self) -> Result<Vec<ForeignKeyRecord>, StoreError>;
}

/// A scoped unit of work on behalf of one user
///
/// A session must be released on every path. Dropping an unreleased session
/// rolls back any open transaction.
#[async_trait(?Send)]
pub trait Session: Catalog {
    /// User the session acts for
    fn username(&self) -> &str;

    fn as_catalog(&self) -> &dyn Catalog;

    /// Run a query with bound parameters and collect the result
    async fn execute_select(&self, sql: &str, params: &[Value]) -> Result<RowSet, StoreError>;

    /// Run one statement per parameter row, returning the affected row total
    async fn execute_batch_dml(
        &self,
        sql: &str,
        param_rows: &[Vec<Value>],
    ) -> Result<u64, StoreError>;

    /// Insert all rows, returning how many were inserted
    async fn execute_multi_row_insert(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Vec<Value>],
    ) -> Result<u64, StoreError>;

    /// Run a parameterless statement such as DDL
    async fn execute_ddl(&self, sql: &str) -> Result<(), StoreError>;

    async fn begin(&self) -> Result<(), StoreError>;
    async fn commit(&self) -> Result<(), StoreError>;
    async fn rollback(&self) -> Result<(), StoreError>;

    /// Clear the user and roll back anything left open
    async fn release(&mut self) -> Result<(), StoreError>;
}

/// Source of sessions
#[async_trait(?Send)]
pub trait Store {
    async fn open_session<'a>(&'a self, username: &str)
        -> Result<Box<dyn Session + 'a>, StoreError>;

    /// Catalog schema tables are resolved in
    fn schema_name(&self) -> &str;
}

#[async_trait(?Send)]
impl<T: Store + ?Sized> Store for Box<T> {
    async fn open_session<'a>(
        &'a self,
        username: &str,
    ) -> Result<Box<dyn Session + 'a>, StoreError> {
        (**self).open_session(username).await
    }

    fn schema_name(&self) -> &str {
        (**self).schema_name()
    }
}

/// Open the store described by `config`
pub async fn open_store(config: &DatabaseConfig, retry: &RetryPolicy) -> SyncResult<Box<dyn Store>> {
    match config {
        #[cfg(feature = "duckdb-backend")]
        DatabaseConfig::Duckdb { path: Some(path) } => {
            Ok(Box::new(DuckDbStore::open(path, retry).await?))
        }
        #[cfg(feature = "duckdb-backend")]
        DatabaseConfig::Duckdb { path: None } => Ok(Box::new(DuckDbStore::memory()?)),
        #[cfg(feature = "postgres-backend")]
        DatabaseConfig::Postgres {
            url,
            schema,
            statement_timeout_ms,
        } => Ok(Box::new(
            PostgresStore::connect(url, schema, *statement_timeout_ms, retry).await?,
        )),
        #[allow(unreachable_patterns)]
        other => Err(SyncError::Config(format!(
            "{} support not enabled. Build with the matching backend feature",
            other.display()
        ))),
    }
}

/// Bounded retry with a fixed backoff for connection establishment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            attempts: 1,
            backoff: Duration::ZERO,
        }
    }
}

/// Run `connect` until it succeeds or the policy is exhausted
pub async fn connect_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    target: &str,
    mut connect: F,
) -> SyncResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let attempts = policy.attempts.max(1);
    let mut last_error = String::new();
    for attempt in 1..=attempts {
        match connect().await {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                last_error = e.to_string();
                if attempt < attempts {
                    warn!(
                        target_db = %target,
                        attempt,
                        attempts,
                        error = %last_error,
                        "Connection failed, retrying"
                    );
                    tokio::time::sleep(policy.backoff).await;
                }
            }
        }
    }
    Err(SyncError::StoreUnavailable {
        attempts,
        message: last_error,
    })
}

#[cfg(feature = "duckdb-backend")]
pub mod duckdb_impl;

#[cfg(feature = "postgres-backend")]
pub mod postgres_impl;

#[cfg(feature = "duckdb-backend")]
pub use duckdb_impl::DuckDbStore;

#[cfg(feature = "postgres-backend")]
pub use postgres_impl::PostgresStore;

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn test_retry_gives_up() {
        let calls = Cell::new(0);
        let policy = RetryPolicy {
            attempts: 3,
            backoff: Duration::from_millis(1),
        };
        let result: SyncResult<()> = runtime().block_on(connect_with_retry(&policy, "db", || {
            calls.set(calls.get() + 1);
            async { Err(StoreError::Connection("refused".into())) }
        }));
        assert_eq!(calls.get(), 3);
        match result {
            Err(SyncError::StoreUnavailable { attempts, message }) => {
                assert_eq!(attempts, 3);
                assert!(message.contains("refused"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_retry_recovers() {
        let calls = Cell::new(0);
        let policy = RetryPolicy {
            attempts: 3,
            backoff: Duration::from_millis(1),
        };
        let result = runtime().block_on(connect_with_retry(&policy, "db", || {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move {
                if n < 2 {
                    Err(StoreError::Connection("refused".into()))
                } else {
                    Ok(n)
                }
            }
        }));
        assert_eq!(result.unwrap(), 2);
    }
}
