//! Sync executor: runs one mutating call from key resolution to verification
//!
//! Every call opens one scoped session for the calling user. Inserts,
//! updates, deletes and the audit record share one transaction; the sanity
//! check re-reads the table after commit. The session is released on every
//! path, and a failure before commit rolls the transaction back.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use serde::Serialize;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::SyncOptions;
use crate::error::{SyncError, SyncResult};
use crate::models::{RowSet, Value};
use crate::query;
use crate::schema::SchemaModel;
use crate::store::{Session, Store, StoreError};
use crate::validation::{validate_identifier, validate_identifiers, validate_username};

use super::SyncCounts;
use super::audit::{AuditLog, AuditRecord};
use super::coercion::coerce_rows;
use super::reconcile::reconcile;
use super::statements::{UpdateStatement, delete_row, select_all, select_column};
use super::verify::{verify_contains, verify_exact};

/// Bind parameters a single PostgreSQL statement accepts
const MAX_BIND_PARAMETERS: usize = 65_535;

/// States a sync call moves through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStage {
    Start,
    PkResolved,
    Reconciled,
    Inserted,
    Updated,
    Deleted,
    Verified,
    Done,
    Failed,
}

impl SyncStage {
    pub fn name(&self) -> &'static str {
        match self {
            SyncStage::Start => "start",
            SyncStage::PkResolved => "pk_resolved",
            SyncStage::Reconciled => "reconciled",
            SyncStage::Inserted => "inserted",
            SyncStage::Updated => "updated",
            SyncStage::Deleted => "deleted",
            SyncStage::Verified => "verified",
            SyncStage::Done => "done",
            SyncStage::Failed => "failed",
        }
    }
}

/// Write policy of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Reconcile, then insert, update and optionally delete
    Full,
    InsertOnly,
    UpdateOnly,
}

impl SyncMode {
    pub fn name(&self) -> &'static str {
        match self {
            SyncMode::Full => "full",
            SyncMode::InsertOnly => "insert_only",
            SyncMode::UpdateOnly => "update_only",
        }
    }
}

/// Result of a successful call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub table: String,
    pub mode: SyncMode,
    pub counts: SyncCounts,
    /// Stages traversed, in order
    pub stages: Vec<SyncStage>,
    pub duration_ms: u64,
}

struct Run {
    run_id: Uuid,
    table: String,
    mode: SyncMode,
    stages: Vec<SyncStage>,
    start: Instant,
}

impl Run {
    fn new(table: &str, mode: SyncMode) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            table: table.to_string(),
            mode,
            stages: vec![SyncStage::Start],
            start: Instant::now(),
        }
    }

    fn advance(&mut self, stage: SyncStage) {
        debug!(stage = stage.name(), "Sync stage reached");
        self.stages.push(stage);
    }

    fn conclude(mut self, result: SyncResult<SyncCounts>) -> SyncResult<SyncReport> {
        let duration_ms = self.start.elapsed().as_millis() as u64;
        match result {
            Ok(counts) => {
                self.advance(SyncStage::Done);
                info!(
                    inserted = counts.inserted,
                    updated = counts.updated,
                    deleted = counts.deleted,
                    duration_ms,
                    "Sync completed"
                );
                Ok(SyncReport {
                    run_id: self.run_id,
                    table: self.table,
                    mode: self.mode,
                    counts,
                    stages: self.stages,
                    duration_ms,
                })
            }
            Err(e) => {
                let last = self.stages.last().copied().unwrap_or(SyncStage::Start);
                self.advance(SyncStage::Failed);
                error!(after = last.name(), error = %e, "Sync failed");
                Err(e)
            }
        }
    }
}

/// Release the session, keeping the first error
async fn finish<T>(mut session: Box<dyn Session + '_>, outcome: SyncResult<T>) -> SyncResult<T> {
    let released = session.release().await;
    match (outcome, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e.into()),
        (Err(e), Err(release_error)) => {
            warn!(error = %release_error, "Session release failed after error");
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
    }
}

fn conflict(table: &str, err: StoreError) -> SyncError {
    match err {
        StoreError::UniqueViolation(detail) => SyncError::ConflictingRow {
            table: table.to_string(),
            detail,
        },
        other => other.into(),
    }
}

/// Rows per multi-row INSERT, keeping each statement under the bind limit
fn rows_per_insert(batch_size: usize, width: usize) -> usize {
    batch_size.min(MAX_BIND_PARAMETERS / width.max(1)).max(1)
}

/// Split rows into those carrying a key and those that need one generated
///
/// Keyless rows come back without the key column.
fn split_keyless(pk: Option<&str>, rows: &RowSet) -> (RowSet, RowSet) {
    let Some(idx) = pk.and_then(|pk| rows.column_index(pk)) else {
        return (rows.clone(), RowSet::empty(Vec::new()));
    };
    let (keyless, keyed): (Vec<_>, Vec<_>) =
        rows.rows.iter().cloned().partition(|row| row[idx].is_null());
    let drop_key = |row: Vec<Value>| -> Vec<Value> {
        row.into_iter()
            .enumerate()
            .filter(|(i, _)| *i != idx)
            .map(|(_, v)| v)
            .collect()
    };
    let keyless_columns = rows
        .columns
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != idx)
        .map(|(_, c)| c.clone())
        .collect();
    (
        RowSet {
            columns: rows.columns.clone(),
            rows: keyed,
        },
        RowSet {
            columns: keyless_columns,
            rows: keyless.into_iter().map(drop_key).collect(),
        },
    )
}

async fn load_schema<S: Store>(store: &S, username: &str) -> SyncResult<SchemaModel> {
    let session = store.open_session(username).await?;
    let outcome = SchemaModel::load(session.as_catalog()).await;
    finish(session, outcome).await
}

/// Executes reads and syncs against one store
///
/// Holds the process-wide schema snapshot; it only changes on
/// [`SyncExecutor::reload_schema`].
pub struct SyncExecutor<S: Store> {
    store: S,
    schema: RwLock<Arc<SchemaModel>>,
    options: SyncOptions,
    audit: AuditLog,
}

impl<S: Store> SyncExecutor<S> {
    /// Create an executor, loading the schema from the store's catalog
    pub async fn connect(store: S, options: SyncOptions) -> SyncResult<Self> {
        options.validate()?;
        let schema = load_schema(&store, &options.service_user).await?;
        Self::with_schema(store, schema, options)
    }

    /// Create an executor over a known schema
    pub fn with_schema(store: S, schema: SchemaModel, options: SyncOptions) -> SyncResult<Self> {
        options.validate()?;
        let audit = AuditLog::new(&options.audit_table)?;
        Ok(Self {
            store,
            schema: RwLock::new(Arc::new(schema)),
            options,
            audit,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Current schema snapshot
    pub fn schema(&self) -> Arc<SchemaModel> {
        self.schema
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Re-read the catalog and replace the snapshot
    pub async fn reload_schema(&self) -> SyncResult<Arc<SchemaModel>> {
        let schema = Arc::new(load_schema(&self.store, &self.options.service_user).await?);
        *self
            .schema
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = schema.clone();
        info!(tables = schema.table_names().len(), "Reloaded schema");
        Ok(schema)
    }

    /// Tables and views known to the snapshot
    pub fn list_tables(&self) -> Vec<String> {
        self.schema().table_names()
    }

    /// Compile dotted field paths against `table`
    pub fn compile_query(&self, table: &str, fields: &str) -> SyncResult<String> {
        query::compile_query(table, fields, &self.schema())
    }

    /// Compile and run a field-path query
    pub async fn query(&self, table: &str, fields: &str) -> SyncResult<RowSet> {
        let sql = self.compile_query(table, fields)?;
        self.read(&sql).await
    }

    /// Current rows of a table or view, ordered by primary key when it has one
    pub async fn get_table(&self, table: &str) -> SyncResult<RowSet> {
        validate_identifier(table)?;
        let schema = self.schema();
        let order_by = match schema.get_primary_key(table) {
            Ok(pk) => Some(pk.to_string()),
            Err(SyncError::NoPrimaryKey(_)) | Err(SyncError::AmbiguousPrimaryKey { .. }) => None,
            Err(e) => return Err(e),
        };
        self.read(&select_all(table, order_by.as_deref())?).await
    }

    async fn read(&self, sql: &str) -> SyncResult<RowSet> {
        let session = self.store.open_session(&self.options.service_user).await?;
        let outcome = session.execute_select(sql, &[]).await.map_err(SyncError::from);
        finish(session, outcome).await
    }

    /// Create the audit table if it does not exist and refresh the schema
    pub async fn init_audit_table(&self) -> SyncResult<()> {
        let session = self.store.open_session(&self.options.service_user).await?;
        let outcome = self.audit.ensure_table(session.as_ref()).await;
        finish(session, outcome).await?;
        info!(audit_table = %self.audit.table(), "Audit table ready");
        self.reload_schema().await?;
        Ok(())
    }

    /// Bring `table` to `target`
    ///
    /// Rows are matched by primary key. Existing rows absent from the target
    /// are deleted only when `delete_missing_rows` is set.
    pub async fn sync_table(
        &self,
        table: &str,
        target: &RowSet,
        delete_missing_rows: bool,
        username: &str,
        reason: Option<&str>,
    ) -> SyncResult<SyncReport> {
        let mut run = Run::new(table, SyncMode::Full);
        let span = info_span!(
            "sync_table",
            run_id = %run.run_id,
            table = %table,
            delete_missing_rows
        );
        async move {
            info!(rows = target.len(), username = %username, "Starting sync");
            let result = self
                .run_full(&mut run, target, delete_missing_rows, username, reason)
                .await;
            run.conclude(result)
        }
        .instrument(span)
        .await
    }

    /// Insert rows without reconciling; an existing key fails the whole call
    pub async fn insert_only(
        &self,
        table: &str,
        rows: &RowSet,
        username: &str,
        reason: Option<&str>,
    ) -> SyncResult<SyncCounts> {
        let mut run = Run::new(table, SyncMode::InsertOnly);
        let span = info_span!("insert_only", run_id = %run.run_id, table = %table);
        async move {
            info!(rows = rows.len(), username = %username, "Starting insert");
            let result = self.run_insert_only(&mut run, rows, username, reason).await;
            run.conclude(result).map(|report| report.counts)
        }
        .instrument(span)
        .await
    }

    /// Update rows by primary key without reconciling
    ///
    /// Keys that do not exist are skipped, or rejected before any write when
    /// `strict_update_only` is set.
    pub async fn update_only(
        &self,
        table: &str,
        rows: &RowSet,
        username: &str,
        reason: Option<&str>,
    ) -> SyncResult<SyncCounts> {
        let mut run = Run::new(table, SyncMode::UpdateOnly);
        let span = info_span!("update_only", run_id = %run.run_id, table = %table);
        async move {
            info!(rows = rows.len(), username = %username, "Starting update");
            let result = self.run_update_only(&mut run, rows, username, reason).await;
            run.conclude(result).map(|report| report.counts)
        }
        .instrument(span)
        .await
    }

    fn check_request(&self, table: &str, rows: &RowSet, username: &str) -> SyncResult<Arc<SchemaModel>> {
        validate_username(username)?;
        validate_identifier(table)?;
        validate_identifiers(&rows.columns)?;
        let schema = self.schema();
        if !schema.contains_table(table) {
            return Err(SyncError::UnknownTable(table.to_string()));
        }
        Ok(schema)
    }

    async fn run_full(
        &self,
        run: &mut Run,
        target: &RowSet,
        delete_missing_rows: bool,
        username: &str,
        reason: Option<&str>,
    ) -> SyncResult<SyncCounts> {
        let schema = self.check_request(&run.table, target, username)?;
        let pk = schema.get_primary_key(&run.table)?.to_string();
        run.advance(SyncStage::PkResolved);

        let session = self.store.open_session(username).await?;
        let outcome = self
            .write_full(session.as_ref(), run, &pk, target, delete_missing_rows, reason)
            .await;
        finish(session, outcome).await
    }

    async fn write_full(
        &self,
        session: &dyn Session,
        run: &mut Run,
        pk: &str,
        target: &RowSet,
        delete_missing_rows: bool,
        reason: Option<&str>,
    ) -> SyncResult<SyncCounts> {
        let table = run.table.clone();
        session.begin().await?;

        let existing = session.execute_select(&select_all(&table, None)?, &[]).await?;
        let diff = reconcile(pk, &existing, target)?;
        run.advance(SyncStage::Reconciled);
        debug!(
            new_rows = diff.new_rows.len(),
            updated_rows = diff.updated_rows.len(),
            removed = diff.removed_pks.len(),
            "Reconciled target with existing rows"
        );

        let mut counts = SyncCounts {
            inserted: self.insert_new_rows(session, &table, Some(pk), &diff.new_rows).await?,
            ..SyncCounts::default()
        };
        run.advance(SyncStage::Inserted);

        counts.updated = self.update_rows(session, &table, pk, &diff.updated_rows).await?;
        run.advance(SyncStage::Updated);

        if delete_missing_rows {
            counts.deleted = self.delete_rows(session, &table, pk, &diff.removed_pks).await?;
            run.advance(SyncStage::Deleted);
        }

        self.commit_with_audit(session, &table, counts, reason).await?;

        if self.options.sanity_check {
            let actual = session
                .execute_select(&select_all(&table, Some(pk))?, &[])
                .await?;
            let check = if delete_missing_rows {
                verify_exact(pk, &actual, target)
            } else {
                verify_contains(pk, &actual, target)
            };
            check.map_err(|detail| SyncError::SanityCheckFailed {
                table: table.clone(),
                counts,
                detail,
            })?;
            run.advance(SyncStage::Verified);
        }

        Ok(counts)
    }

    async fn run_insert_only(
        &self,
        run: &mut Run,
        rows: &RowSet,
        username: &str,
        reason: Option<&str>,
    ) -> SyncResult<SyncCounts> {
        let schema = self.check_request(&run.table, rows, username)?;
        let pk = schema.get_primary_key(&run.table).ok().map(str::to_string);
        let rows = coerce_rows(rows.clone());
        let table = run.table.clone();

        let session = self.store.open_session(username).await?;
        let outcome = async {
            let session = session.as_ref();
            session.begin().await?;
            let counts = SyncCounts {
                inserted: self
                    .insert_new_rows(session, &table, pk.as_deref(), &rows)
                    .await?,
                ..SyncCounts::default()
            };
            run.advance(SyncStage::Inserted);
            self.commit_with_audit(session, &table, counts, reason).await?;

            if self.options.sanity_check {
                let actual = session
                    .execute_select(&select_all(&table, pk.as_deref())?, &[])
                    .await?;
                verify_contains(pk.as_deref().unwrap_or_default(), &actual, &rows).map_err(
                    |detail| SyncError::SanityCheckFailed {
                        table: table.clone(),
                        counts,
                        detail,
                    },
                )?;
                run.advance(SyncStage::Verified);
            }
            Ok::<_, SyncError>(counts)
        }
        .await;
        finish(session, outcome).await
    }

    async fn run_update_only(
        &self,
        run: &mut Run,
        rows: &RowSet,
        username: &str,
        reason: Option<&str>,
    ) -> SyncResult<SyncCounts> {
        let schema = self.check_request(&run.table, rows, username)?;
        let pk = schema.get_primary_key(&run.table)?.to_string();
        let pk_idx = rows
            .column_index(&pk)
            .ok_or_else(|| SyncError::MissingPrimaryKey(pk.clone()))?;
        run.advance(SyncStage::PkResolved);
        let rows = coerce_rows(rows.clone());
        let table = run.table.clone();

        let session = self.store.open_session(username).await?;
        let outcome = async {
            let session = session.as_ref();
            session.begin().await?;

            if self.options.strict_update_only {
                let existing = session
                    .execute_select(&select_column(&table, &pk)?, &[])
                    .await?;
                let known: HashSet<&Value> = existing.rows.iter().filter_map(|r| r.first()).collect();
                let missing: Vec<Value> = rows
                    .rows
                    .iter()
                    .map(|r| &r[pk_idx])
                    .filter(|v| v.is_null() || !known.contains(v))
                    .cloned()
                    .collect();
                if !missing.is_empty() {
                    return Err(SyncError::MissingRows {
                        table: table.clone(),
                        pks: missing,
                    });
                }
            }

            let counts = SyncCounts {
                updated: self.update_rows(session, &table, &pk, &rows).await?,
                ..SyncCounts::default()
            };
            run.advance(SyncStage::Updated);
            if counts.updated < rows.len() as u64 {
                debug!(
                    requested = rows.len(),
                    updated = counts.updated,
                    "Some keys did not match existing rows"
                );
            }
            self.commit_with_audit(session, &table, counts, reason).await?;

            if self.options.sanity_check {
                let actual = session
                    .execute_select(&select_all(&table, Some(&pk))?, &[])
                    .await?;
                let keys: HashSet<&Value> = actual
                    .column_values(&pk)
                    .map(|values| values.into_iter().collect())
                    .unwrap_or_default();
                let expected = RowSet {
                    columns: rows.columns.clone(),
                    rows: rows
                        .rows
                        .iter()
                        .filter(|r| keys.contains(&r[pk_idx]))
                        .cloned()
                        .collect(),
                };
                verify_contains(&pk, &actual, &expected).map_err(|detail| {
                    SyncError::SanityCheckFailed {
                        table: table.clone(),
                        counts,
                        detail,
                    }
                })?;
                run.advance(SyncStage::Verified);
            }
            Ok::<_, SyncError>(counts)
        }
        .await;
        finish(session, outcome).await
    }

    /// Insert rows, leaving the key column out of rows whose key is null
    async fn insert_new_rows(
        &self,
        session: &dyn Session,
        table: &str,
        pk: Option<&str>,
        rows: &RowSet,
    ) -> SyncResult<u64> {
        let (keyed, keyless) = split_keyless(pk, rows);
        Ok(self.insert_batches(session, table, &keyed).await?
            + self.insert_batches(session, table, &keyless).await?)
    }

    async fn insert_batches(
        &self,
        session: &dyn Session,
        table: &str,
        rows: &RowSet,
    ) -> SyncResult<u64> {
        let mut inserted = 0;
        let per_chunk = rows_per_insert(self.options.insert_batch_size, rows.columns.len());
        for chunk in rows.rows.chunks(per_chunk) {
            inserted += session
                .execute_multi_row_insert(table, &rows.columns, chunk)
                .await
                .map_err(|e| conflict(table, e))?;
        }
        Ok(inserted)
    }

    async fn update_rows(
        &self,
        session: &dyn Session,
        table: &str,
        pk: &str,
        rows: &RowSet,
    ) -> SyncResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let Some(stmt) = UpdateStatement::new(table, pk, &rows.columns)? else {
            return Ok(0);
        };
        let params: Vec<Vec<Value>> = rows.rows.iter().map(|row| stmt.params(row)).collect();
        session
            .execute_batch_dml(&stmt.sql, &params)
            .await
            .map_err(|e| conflict(table, e))
    }

    async fn delete_rows(
        &self,
        session: &dyn Session,
        table: &str,
        pk: &str,
        pks: &[Value],
    ) -> SyncResult<u64> {
        if pks.is_empty() {
            return Ok(0);
        }
        let params: Vec<Vec<Value>> = pks.iter().map(|pk| vec![pk.clone()]).collect();
        Ok(session.execute_batch_dml(&delete_row(table, pk)?, &params).await?)
    }

    async fn commit_with_audit(
        &self,
        session: &dyn Session,
        table: &str,
        counts: SyncCounts,
        reason: Option<&str>,
    ) -> SyncResult<()> {
        let record = AuditRecord::new(session.username(), table, counts, reason);
        self.audit.write(session, &record).await?;
        session.commit().await?;
        debug!(%counts, "Committed");
        Ok(())
    }
}
