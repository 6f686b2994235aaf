//! Table Sync - schema-aware table synchronization for relational stores
//!
//! Provides:
//! - A schema model of tables, primary keys and foreign keys loaded from the catalog
//! - A compiler turning dotted foreign-key paths into SELECT statements with joins
//! - Reconciliation of caller-supplied rows against a table's current rows
//! - Audited, transactional writes with a post-commit sanity check
//! - Store backends for DuckDB and PostgreSQL

pub mod config;
pub mod error;
pub mod models;
pub mod query;
pub mod schema;
pub mod store;
pub mod sync;
pub mod validation;

pub use config::{ConnectConfig, DatabaseConfig, SyncConfig, SyncOptions};
pub use error::{SyncError, SyncResult};
pub use models::{RowSet, Value, ValueKind};
pub use query::{Path, Query, compile, compile_query};
pub use schema::{ForeignKey, SchemaModel, TableSchema};
pub use store::{Catalog, RetryPolicy, Session, Store, StoreError, open_store};
pub use sync::{
    AuditLog, AuditRecord, Reconciliation, SyncCounts, SyncExecutor, SyncMode, SyncReport,
    SyncStage, reconcile,
};

#[cfg(feature = "duckdb-backend")]
pub use store::DuckDbStore;
#[cfg(feature = "postgres-backend")]
pub use store::PostgresStore;
