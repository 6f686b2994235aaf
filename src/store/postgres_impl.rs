//! PostgreSQL store

use std::cell::Cell;
use std::error::Error;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::{Mutex, MutexGuard};
use tokio_postgres::error::SqlState;
use tokio_postgres::types::{FromSql, IsNull, Kind, ToSql, Type, to_sql_checked};
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SyncResult;
use crate::models::{RowSet, Value};
use crate::sync::coercion::{
    canonical_list, coerce_decimal_text, coerce_f32, coerce_json, coerce_value,
};
use crate::sync::statements::insert_rows;

use super::{Catalog, ForeignKeyRecord, RetryPolicy, Session, Store, StoreError, connect_with_retry};

/// Value written to `my.username` when a session is released
const RELEASED_USERNAME: &str = "invalid";

/// PostgreSQL-backed store
///
/// Holds a single client; sessions are serialized on it.
pub struct PostgresStore {
    client: Mutex<Client>,
    schema: String,
    statement_timeout_ms: Option<u64>,
    /// Set when a session was dropped inside a transaction
    needs_rollback: AtomicBool,
}

impl PostgresStore {
    /// Connect to a PostgreSQL database, retrying per `retry`
    pub async fn connect(
        connection_string: &str,
        schema: &str,
        statement_timeout_ms: Option<u64>,
        retry: &RetryPolicy,
    ) -> SyncResult<Self> {
        let client = connect_with_retry(retry, "postgres", || async move {
            let (client, connection) = tokio_postgres::connect(connection_string, NoTls)
                .await
                .map_err(|e| StoreError::Connection(e.to_string()))?;

            // Spawn connection handler
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    warn!(error = %e, "PostgreSQL connection error");
                }
            });
            Ok(client)
        })
        .await?;

        info!(schema = %schema, "Connected to PostgreSQL");
        Ok(Self {
            client: Mutex::new(client),
            schema: schema.to_string(),
            statement_timeout_ms,
            needs_rollback: AtomicBool::new(false),
        })
    }
}

#[async_trait(?Send)]
impl Store for PostgresStore {
    async fn open_session<'a>(
        &'a self,
        username: &str,
    ) -> Result<Box<dyn Session + 'a>, StoreError> {
        let client = self.client.lock().await;
        if self.needs_rollback.swap(false, Ordering::SeqCst) {
            client.batch_execute("ROLLBACK").await.map_err(map_error)?;
        }
        client
            .execute("SELECT set_config('my.username', $1, false)", &[&username])
            .await
            .map_err(map_error)?;
        if let Some(ms) = self.statement_timeout_ms {
            client
                .batch_execute(&format!("SET statement_timeout = {ms}"))
                .await
                .map_err(map_error)?;
        }
        debug!(username = %username, "Opened PostgreSQL session");
        Ok(Box::new(PostgresSession {
            client,
            schema: &self.schema,
            username: username.to_string(),
            in_transaction: Cell::new(false),
            needs_rollback: &self.needs_rollback,
        }))
    }

    fn schema_name(&self) -> &str {
        &self.schema
    }
}

/// Session holding the client for its lifetime
pub struct PostgresSession<'a> {
    client: MutexGuard<'a, Client>,
    schema: &'a str,
    username: String,
    in_transaction: Cell<bool>,
    needs_rollback: &'a AtomicBool,
}

fn param_refs(params: &[Value]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

impl PostgresSession<'_> {
    async fn query_rows(&self, sql: &str, params: &[Value]) -> Result<RowSet, StoreError> {
        let stmt = self.client.prepare(sql).await.map_err(map_error)?;
        let rows = self
            .client
            .query(&stmt, &param_refs(params))
            .await
            .map_err(map_error)?;

        let columns: Vec<String> = stmt.columns().iter().map(|c| c.name().to_string()).collect();
        let results = rows
            .iter()
            .map(read_row)
            .collect::<Result<Vec<_>, _>>()?;
        RowSet::new(columns, results).map_err(|e| StoreError::Query(e.to_string()))
    }

    async fn text_column(&self, sql: &str, params: &[Value]) -> Result<Vec<String>, StoreError> {
        let rows = self.query_rows(sql, params).await?;
        Ok(rows
            .rows
            .into_iter()
            .filter_map(|row| row.into_iter().next())
            .map(|v| v.to_string())
            .collect())
    }
}

#[async_trait(?Send)]
impl Catalog for PostgresSession<'_> {
    async fn table_names(&self) -> Result<Vec<String>, StoreError> {
        self.text_column(
            "SELECT table_name::text FROM information_schema.tables
             WHERE table_schema = $1::text
             ORDER BY table_name",
            &[Value::from(self.schema)],
        )
        .await
    }

    async fn primary_key_columns(&self, table: &str) -> Result<Vec<String>, StoreError> {
        self.text_column(
            "SELECT a.attname::text
             FROM pg_index i
             JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
             WHERE i.indrelid = (quote_ident($1::text) || '.' || quote_ident($2::text))::regclass
               AND i.indisprimary
             ORDER BY a.attnum",
            &[Value::from(self.schema), Value::from(table)],
        )
        .await
    }

    async fn foreign_keys(&self) -> Result<Vec<ForeignKeyRecord>, StoreError> {
        let rows = self
            .query_rows(
                "SELECT tc.table_schema::text,
                        tc.constraint_name::text,
                        tc.table_name::text,
                        kcu.column_name::text,
                        ccu.table_name::text AS foreign_table_name,
                        ccu.column_name::text AS foreign_column_name
                 FROM information_schema.table_constraints AS tc
                 JOIN information_schema.key_column_usage AS kcu
                   ON tc.constraint_name = kcu.constraint_name
                  AND tc.table_schema = kcu.table_schema
                 JOIN information_schema.constraint_column_usage AS ccu
                   ON ccu.constraint_name = tc.constraint_name
                  AND ccu.table_schema = tc.table_schema
                 WHERE tc.constraint_type = 'FOREIGN KEY' AND tc.table_schema = $1::text",
                &[Value::from(self.schema)],
            )
            .await?;
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
impl Session for PostgresSession<'_> {
    fn username(&self) -> &str {
        &self.username
    }

    fn as_catalog(&self) -> &dyn Catalog {
        self
    }

    async fn execute_select(&self, sql: &str, params: &[Value]) -> Result<RowSet, StoreError> {
        self.query_rows(sql, params).await
    }

    async fn execute_batch_dml(
        &self,
        sql: &str,
        param_rows: &[Vec<Value>],
    ) -> Result<u64, StoreError> {
        if param_rows.is_empty() {
            return Ok(0);
        }
        let stmt = self.client.prepare(sql).await.map_err(map_error)?;
        let mut affected = 0u64;
        for params in param_rows {
            affected += self
                .client
                .execute(&stmt, &param_refs(params))
                .await
                .map_err(map_error)?;
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
        self.client.batch_execute(sql).await.map_err(map_error)
    }

    async fn begin(&self) -> Result<(), StoreError> {
        self.client.batch_execute("BEGIN").await.map_err(map_error)?;
        self.in_transaction.set(true);
        Ok(())
    }

    async fn commit(&self) -> Result<(), StoreError> {
        // PostgreSQL ends the transaction even when COMMIT fails
        self.in_transaction.set(false);
        self.client.batch_execute("COMMIT").await.map_err(map_error)
    }

    async fn rollback(&self) -> Result<(), StoreError> {
        self.in_transaction.set(false);
        self.client.batch_execute("ROLLBACK").await.map_err(map_error)
    }

    async fn release(&mut self) -> Result<(), StoreError> {
        if self.in_transaction.get() {
            self.rollback().await?;
        }
        self.client
            .execute(
                "SELECT set_config('my.username', $1, false)",
                &[&RELEASED_USERNAME],
            )
            .await
            .map_err(map_error)?;
        debug!(username = %self.username, "Released PostgreSQL session");
        self.username.clear();
        Ok(())
    }
}

impl Drop for PostgresSession<'_> {
    fn drop(&mut self) {
        if self.in_transaction.get() {
            // Drop cannot await; the next session rolls back before its first statement
            warn!("PostgreSQL session dropped with an open transaction, rolling back");
            self.needs_rollback.store(true, Ordering::SeqCst);
        }
    }
}

impl ToSql for Value {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Int(n) => match *ty {
                Type::INT2 => i16::try_from(*n)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*n)?.to_sql(ty, out),
                Type::FLOAT4 => (*n as f32).to_sql(ty, out),
                Type::FLOAT8 => (*n as f64).to_sql(ty, out),
                Type::NUMERIC => Decimal::from(*n).to_sql(ty, out),
                Type::TEXT | Type::VARCHAR | Type::BPCHAR => n.to_string().to_sql(ty, out),
                _ => n.to_sql(ty, out),
            },
            Value::Float(f) => match *ty {
                Type::FLOAT4 => (*f as f32).to_sql(ty, out),
                Type::NUMERIC => Decimal::try_from(*f)?.to_sql(ty, out),
                Type::TEXT | Type::VARCHAR | Type::BPCHAR => f.to_string().to_sql(ty, out),
                _ => f.to_sql(ty, out),
            },
            Value::Text(s) => match *ty {
                Type::DATE => NaiveDate::parse_from_str(s, "%Y-%m-%d")?.to_sql(ty, out),
                Type::TIMESTAMP => s.parse::<NaiveDateTime>()?.to_sql(ty, out),
                Type::TIMESTAMPTZ => s.parse::<DateTime<Utc>>()?.to_sql(ty, out),
                Type::TIME => s.parse::<NaiveTime>()?.to_sql(ty, out),
                Type::UUID => Uuid::parse_str(s)?.to_sql(ty, out),
                Type::NUMERIC => Decimal::from_str(s)?.to_sql(ty, out),
                Type::JSON | Type::JSONB => {
                    serde_json::from_str::<serde_json::Value>(s)?.to_sql(ty, out)
                }
                _ => s.as_str().to_sql(ty, out),
            },
            Value::Bool(b) => b.to_sql(ty, out),
            Value::Date(d) => d.to_sql(ty, out),
            Value::DateTime(dt) => match *ty {
                Type::TIMESTAMPTZ => dt.and_utc().to_sql(ty, out),
                _ => dt.to_sql(ty, out),
            },
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Cell of a type whose binary wire format is its text (enums, citext, xml)
struct WireText(String);

impl<'a> FromSql<'a> for WireText {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn Error + Sync + Send>> {
        Ok(WireText(std::str::from_utf8(raw)?.to_string()))
    }

    fn accepts(ty: &Type) -> bool {
        matches!(ty.kind(), Kind::Enum(_)) || matches!(ty.name(), "citext" | "xml")
    }
}

fn numeric_value(d: Decimal) -> Value {
    coerce_decimal_text(&d.to_string())
}

fn time_value(t: NaiveTime) -> Value {
    Value::Text(t.format("%H:%M:%S%.f").to_string())
}

fn uuid_value(u: Uuid) -> Value {
    Value::Text(u.to_string())
}

fn list<T, F>(row: &Row, idx: usize, map: F) -> Result<Value, tokio_postgres::Error>
where
    T: for<'a> tokio_postgres::types::FromSql<'a>,
    F: Fn(T) -> Value,
{
    Ok(row
        .try_get::<_, Option<Vec<Option<T>>>>(idx)?
        .map(|items| {
            canonical_list(
                items
                    .into_iter()
                    .map(|item| item.map(&map).unwrap_or(Value::Null))
                    .collect(),
            )
        })
        .unwrap_or(Value::Null))
}

/// Convert one result row into canonical values
fn read_row(row: &Row) -> Result<Vec<Value>, StoreError> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, column)| {
            let ty = column.type_();
            let value = match *ty {
                Type::BOOL => row.try_get::<_, Option<bool>>(idx).map(Value::from),
                Type::INT2 => row
                    .try_get::<_, Option<i16>>(idx)
                    .map(|v| v.map(|n| Value::Int(n.into())).unwrap_or(Value::Null)),
                Type::INT4 => row.try_get::<_, Option<i32>>(idx).map(Value::from),
                Type::INT8 => row.try_get::<_, Option<i64>>(idx).map(Value::from),
                Type::OID => row
                    .try_get::<_, Option<u32>>(idx)
                    .map(|v| v.map(|n| Value::Int(n.into())).unwrap_or(Value::Null)),
                Type::FLOAT4 => row
                    .try_get::<_, Option<f32>>(idx)
                    .map(|v| v.map(coerce_f32).unwrap_or(Value::Null)),
                Type::NUMERIC => row
                    .try_get::<_, Option<Decimal>>(idx)
                    .map(|v| v.map(numeric_value).unwrap_or(Value::Null)),
                Type::UUID => row
                    .try_get::<_, Option<Uuid>>(idx)
                    .map(|v| v.map(uuid_value).unwrap_or(Value::Null)),
                Type::TIME => row
                    .try_get::<_, Option<NaiveTime>>(idx)
                    .map(|v| v.map(time_value).unwrap_or(Value::Null)),
                Type::FLOAT8 => row
                    .try_get::<_, Option<f64>>(idx)
                    .map(|v| coerce_value(Value::from(v))),
                Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
                    row.try_get::<_, Option<String>>(idx).map(Value::from)
                }
                Type::DATE => row.try_get::<_, Option<NaiveDate>>(idx).map(Value::from),
                Type::TIMESTAMP => row.try_get::<_, Option<NaiveDateTime>>(idx).map(Value::from),
                Type::TIMESTAMPTZ => row
                    .try_get::<_, Option<DateTime<Utc>>>(idx)
                    .map(|v| Value::from(v.map(|dt| dt.naive_utc()))),
                Type::JSON | Type::JSONB => row
                    .try_get::<_, Option<serde_json::Value>>(idx)
                    .map(|v| v.map(|j| coerce_json(&j)).unwrap_or(Value::Null)),
                Type::INT2_ARRAY => list::<i16, _>(row, idx, |n| Value::Int(n.into())),
                Type::INT4_ARRAY => list::<i32, _>(row, idx, Value::from),
                Type::INT8_ARRAY => list::<i64, _>(row, idx, Value::from),
                Type::FLOAT4_ARRAY => list::<f32, _>(row, idx, coerce_f32),
                Type::FLOAT8_ARRAY => list::<f64, _>(row, idx, Value::from),
                Type::NUMERIC_ARRAY => list::<Decimal, _>(row, idx, numeric_value),
                Type::UUID_ARRAY => list::<Uuid, _>(row, idx, uuid_value),
                Type::BOOL_ARRAY => list::<bool, _>(row, idx, Value::from),
                Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => list::<String, _>(row, idx, Value::from),
                _ if WireText::accepts(ty) => row
                    .try_get::<_, Option<WireText>>(idx)
                    .map(|v| v.map(|t| Value::Text(t.0)).unwrap_or(Value::Null)),
                _ => {
                    return Err(StoreError::UnsupportedType {
                        column: column.name().to_string(),
                        type_name: ty.name().to_string(),
                    });
                }
            };
            value.map_err(map_error)
        })
        .collect()
}

fn map_error(err: tokio_postgres::Error) -> StoreError {
    match err.code() {
        Some(code) if *code == SqlState::UNIQUE_VIOLATION => StoreError::UniqueViolation(err.to_string()),
        Some(code) if *code == SqlState::QUERY_CANCELED => StoreError::Timeout(err.to_string()),
        _ if err.is_closed() => StoreError::Connection(err.to_string()),
        _ => StoreError::Query(err.to_string()),
    }
}
