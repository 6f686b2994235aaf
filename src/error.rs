//! Error types for schema, query and sync operations

use thiserror::Error;

use crate::models::{Value, ValueKind};
use crate::store::StoreError;
use crate::sync::SyncCounts;
use crate::sync::verify::VerifyError;

/// Result alias used across the library
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while compiling queries or synchronizing tables
#[derive(Error, Debug)]
pub enum SyncError {
    /// Table is not part of the loaded schema
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    /// No foreign key is registered for the column
    #[error("Unknown foreign key: {table}.{column}")]
    UnknownForeignKey { table: String, column: String },

    /// Table has no primary key (views, heap tables)
    #[error("Table {0} has no primary key")]
    NoPrimaryKey(String),

    /// Table has a composite primary key
    #[error("Table {table} has more than one primary key column: {}", .columns.join(", "))]
    AmbiguousPrimaryKey { table: String, columns: Vec<String> },

    /// Target rows carry columns that do not exist in the table
    #[error("Unknown columns: {}", .0.join(", "))]
    UnknownColumns(Vec<String>),

    /// Target rows do not carry the primary key column
    #[error("Target rows are missing primary key column {0}")]
    MissingPrimaryKey(String),

    /// A column holds values of a different kind on each side
    #[error("Type mismatch in column {column}: existing {existing:?}, target {target:?}")]
    TypeMismatch {
        column: String,
        existing: Vec<ValueKind>,
        target: Vec<ValueKind>,
    },

    /// Two target rows share a primary key value
    #[error("Duplicate primary key value in target rows: {0}")]
    DuplicatePrimaryKey(Value),

    /// Two schema entries describe the same table
    #[error("Duplicate table in schema: {0}")]
    DuplicateTable(String),

    /// Two foreign keys registered on the same column
    #[error("Duplicate foreign key: {table}.{column}")]
    DuplicateForeignKey { table: String, column: String },

    /// Identifier does not match the accepted grammar
    #[error("Invalid identifier '{identifier}': {reason}")]
    InvalidIdentifier { identifier: String, reason: String },

    /// Username cannot be attributed to a person
    #[error("Invalid username '{username}': {reason}")]
    InvalidUsername { username: String, reason: String },

    /// Row set is malformed (ragged rows, unparseable input)
    #[error("Invalid rows: {0}")]
    InvalidRows(String),

    /// Insert collided with an existing row
    #[error("Conflicting row in {table}: {detail}")]
    ConflictingRow { table: String, detail: String },

    /// Update targeted primary keys that do not exist
    #[error("Rows missing from {table}: {}", display_values(.pks))]
    MissingRows { table: String, pks: Vec<Value> },

    /// Re-read of the table after commit did not match the target
    #[error("Sanity check failed for {table} after {counts}: {detail}")]
    SanityCheckFailed {
        table: String,
        counts: SyncCounts,
        #[source]
        detail: VerifyError,
    },

    /// Connection could not be established after retries
    #[error("Store unavailable after {attempts} attempt(s): {message}")]
    StoreUnavailable { attempts: u32, message: String },

    /// Statement exceeded its time limit
    #[error("Store timeout: {0}")]
    Timeout(String),

    /// Any other store failure
    #[error("Store error: {0}")]
    Store(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}

fn display_values(values: &[Value]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Timeout(msg) => SyncError::Timeout(msg),
            StoreError::Connection(msg) => SyncError::StoreUnavailable {
                attempts: 1,
                message: msg,
            },
            other => SyncError::Store(other.to_string()),
        }
    }
}

impl SyncError {
    /// HTTP status a REST layer should answer with
    pub fn status_code(&self) -> u16 {
        match self {
            SyncError::UnknownTable(_) => 404,
            SyncError::ConflictingRow { .. } => 409,
            SyncError::UnknownForeignKey { .. }
            | SyncError::NoPrimaryKey(_)
            | SyncError::AmbiguousPrimaryKey { .. }
            | SyncError::UnknownColumns(_)
            | SyncError::MissingPrimaryKey(_)
            | SyncError::TypeMismatch { .. }
            | SyncError::DuplicatePrimaryKey(_)
            | SyncError::InvalidIdentifier { .. }
            | SyncError::InvalidUsername { .. }
            | SyncError::InvalidRows(_)
            | SyncError::MissingRows { .. } => 400,
            SyncError::StoreUnavailable { .. } => 503,
            SyncError::Timeout(_) => 504,
            SyncError::DuplicateTable(_)
            | SyncError::DuplicateForeignKey { .. }
            | SyncError::SanityCheckFailed { .. }
            | SyncError::Store(_)
            | SyncError::Config(_) => 500,
        }
    }

    /// True when the failure happened before anything was written
    pub fn is_precondition(&self) -> bool {
        self.status_code() == 400 || self.status_code() == 404
    }

    /// Get a user-friendly error message for CLI output
    pub fn user_message(&self) -> String {
        match self {
            SyncError::UnknownTable(table) => format!(
                "Table '{table}' was not found.\n\nHint: Run 'table-sync tables' to list known tables, \
                or reload the schema if it was created recently."
            ),
            SyncError::NoPrimaryKey(table) => format!(
                "Table '{table}' has no primary key.\n\nHint: Only tables with a single-column \
                primary key can be synchronized."
            ),
            SyncError::SanityCheckFailed { table, counts, .. } => format!(
                "{self}\n\nHint: The writes to '{table}' ({counts}) were committed. \
                Inspect the table before retrying."
            ),
            SyncError::StoreUnavailable { .. } => format!(
                "{self}\n\nHint: Check the database URL and that the server is reachable."
            ),
            SyncError::Config(msg) => {
                format!("Invalid configuration: {msg}\n\nHint: Check your table-sync.toml.")
            }
            SyncError::InvalidUsername { .. } => format!(
                "{self}\n\nHint: Pass --username with the name of the person making the change."
            ),
            _ => self.to_string(),
        }
    }
}
