//! Schema model: tables, primary keys and foreign keys
//!
//! A [`SchemaModel`] is an immutable snapshot. It is either built from table
//! definitions (tests, schema files) or introspected from a live catalog with
//! [`SchemaModel::load`]. The path compiler and the sync executor only ever
//! read from it.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::store::{Catalog, ForeignKeyRecord};
use crate::validation::validate_identifier;

/// Foreign key from a column to another table's primary key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    /// Column on the owning table
    pub column_name: String,
    /// Table whose primary key the column references
    pub referenced_table: String,
}

impl ForeignKey {
    pub fn new(column_name: impl Into<String>, referenced_table: impl Into<String>) -> Self {
        Self {
            column_name: column_name.into(),
            referenced_table: referenced_table.into(),
        }
    }
}

/// One table of the schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    /// Primary key columns as reported by the catalog
    ///
    /// Empty for views. More than one entry is a composite key, which the
    /// sync operations refuse.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub primary_key: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn with_primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key.push(column.into());
        self
    }

    pub fn with_foreign_key(
        mut self,
        column: impl Into<String>,
        referenced_table: impl Into<String>,
    ) -> Self {
        self.foreign_keys.push(ForeignKey::new(column, referenced_table));
        self
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SchemaFile {
    tables: Vec<TableSchema>,
}

/// Immutable schema snapshot
#[derive(Debug, Clone, Default)]
pub struct SchemaModel {
    tables: BTreeMap<String, TableSchema>,
    referenced_tables_by_fk: HashMap<(String, String), String>,
}

impl SchemaModel {
    /// Build a schema from table definitions
    ///
    /// Fails on invalid identifiers, on a table defined twice, and on two
    /// foreign keys registered for the same column.
    pub fn new(tables: impl IntoIterator<Item = TableSchema>) -> SyncResult<Self> {
        let mut model = SchemaModel::default();
        for table in tables {
            validate_identifier(&table.name)?;
            for column in &table.primary_key {
                validate_identifier(column)?;
            }
            for fk in &table.foreign_keys {
                validate_identifier(&fk.column_name)?;
                validate_identifier(&fk.referenced_table)?;
                let key = (table.name.clone(), fk.column_name.clone());
                if model.referenced_tables_by_fk.contains_key(&key) {
                    return Err(SyncError::DuplicateForeignKey {
                        table: key.0,
                        column: key.1,
                    });
                }
                model
                    .referenced_tables_by_fk
                    .insert(key, fk.referenced_table.clone());
            }
            if model.tables.contains_key(&table.name) {
                return Err(SyncError::DuplicateTable(table.name));
            }
            model.tables.insert(table.name.clone(), table);
        }
        Ok(model)
    }

    /// Introspect tables, views, primary keys and foreign keys from a catalog
    ///
    /// Tables and foreign keys whose names fall outside the identifier
    /// grammar are skipped with a warning; they cannot be queried or synced.
    pub async fn load(catalog: &dyn Catalog) -> SyncResult<Self> {
        let names = catalog.table_names().await?;
        let mut foreign_keys = catalog.foreign_keys().await?;
        foreign_keys.sort_by(|a, b| {
            (&a.table_name, &a.column_name, &a.constraint_name)
                .cmp(&(&b.table_name, &b.column_name, &b.constraint_name))
        });
        // information_schema joins can report one constraint column twice
        foreign_keys.dedup();

        let mut by_table: HashMap<String, Vec<ForeignKey>> = HashMap::new();
        for record in &foreign_keys {
            let parts = [
                &record.table_name,
                &record.column_name,
                &record.referenced_table,
            ];
            if let Some(err) = parts.iter().find_map(|n| validate_identifier(n).err()) {
                warn!(
                    table = %record.table_name,
                    column = %record.column_name,
                    error = %err,
                    "Skipping foreign key with unsupported name"
                );
                continue;
            }
            debug!(
                schema = %record.table_schema,
                constraint = %record.constraint_name,
                table = %record.table_name,
                column = %record.column_name,
                referenced_table = %record.referenced_table,
                referenced_column = %record.referenced_column,
                "Found foreign key"
            );
            by_table
                .entry(record.table_name.clone())
                .or_default()
                .push(record.into());
        }

        let mut tables = Vec::with_capacity(names.len());
        for name in names {
            if let Err(err) = validate_identifier(&name) {
                warn!(table = %name, error = %err, "Skipping table with unsupported name");
                by_table.remove(&name);
                continue;
            }
            let primary_key = catalog.primary_key_columns(&name).await?;
            if let Some(err) = primary_key.iter().find_map(|c| validate_identifier(c).err()) {
                warn!(table = %name, error = %err, "Skipping table with unsupported key column");
                by_table.remove(&name);
                continue;
            }
            tables.push(TableSchema {
                foreign_keys: by_table.remove(&name).unwrap_or_default(),
                primary_key,
                name,
            });
        }
        // Foreign keys on tables outside the listed set are still resolvable
        for (name, fks) in by_table {
            tables.push(TableSchema {
                name,
                primary_key: Vec::new(),
                foreign_keys: fks,
            });
        }

        let model = SchemaModel::new(tables)?;
        info!(
            tables = model.tables.len(),
            foreign_keys = model.referenced_tables_by_fk.len(),
            "Loaded schema from catalog"
        );
        Ok(model)
    }

    /// Table referenced by the foreign key on `table.column`
    pub fn get_referenced_table(&self, table: &str, column: &str) -> SyncResult<&str> {
        self.referenced_tables_by_fk
            .get(&(table.to_string(), column.to_string()))
            .map(String::as_str)
            .ok_or_else(|| SyncError::UnknownForeignKey {
                table: table.to_string(),
                column: column.to_string(),
            })
    }

    /// The single primary key column of `table`
    pub fn get_primary_key(&self, table: &str) -> SyncResult<&str> {
        let schema = self
            .tables
            .get(table)
            .ok_or_else(|| SyncError::UnknownTable(table.to_string()))?;
        match schema.primary_key.as_slice() {
            [] => Err(SyncError::NoPrimaryKey(table.to_string())),
            [column] => Ok(column.as_str()),
            columns => Err(SyncError::AmbiguousPrimaryKey {
                table: table.to_string(),
                columns: columns.to_vec(),
            }),
        }
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }

    pub fn contains_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Tables in name order
    pub fn tables(&self) -> impl Iterator<Item = &TableSchema> {
        self.tables.values()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    pub fn foreign_key_count(&self) -> usize {
        self.referenced_tables_by_fk.len()
    }

    /// Parse a schema snapshot written by [`SchemaModel::to_yaml`]
    pub fn from_yaml(yaml: &str) -> SyncResult<Self> {
        let file: SchemaFile = serde_yaml::from_str(yaml)
            .map_err(|e| SyncError::Config(format!("invalid schema file: {e}")))?;
        SchemaModel::new(file.tables)
    }

    pub fn from_json(json: &str) -> SyncResult<Self> {
        let file: SchemaFile = serde_json::from_str(json)
            .map_err(|e| SyncError::Config(format!("invalid schema file: {e}")))?;
        SchemaModel::new(file.tables)
    }

    pub fn to_yaml(&self) -> SyncResult<String> {
        serde_yaml::to_string(&self.to_file())
            .map_err(|e| SyncError::Config(format!("failed to serialize schema: {e}")))
    }

    pub fn to_json(&self) -> SyncResult<String> {
        serde_json::to_string_pretty(&self.to_file())
            .map_err(|e| SyncError::Config(format!("failed to serialize schema: {e}")))
    }

    fn to_file(&self) -> SchemaFile {
        SchemaFile {
            tables: self.tables.values().cloned().collect(),
        }
    }
}

impl From<&ForeignKeyRecord> for ForeignKey {
    fn from(record: &ForeignKeyRecord) -> Self {
        ForeignKey::new(&record.column_name, &record.referenced_table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shop() -> SchemaModel {
        SchemaModel::new(vec![
            TableSchema::new("customer").with_primary_key("customer_id"),
            TableSchema::new("order")
                .with_primary_key("order_id")
                .with_foreign_key("customer_id", "customer"),
            TableSchema::new("item")
                .with_primary_key("item_id")
                .with_foreign_key("order_id", "order"),
            TableSchema::new("order_summary"),
        ])
        .unwrap()
    }

    #[test]
    fn test_lookups() {
        let schema = shop();
        assert_eq!(schema.get_referenced_table("item", "order_id").unwrap(), "order");
        assert_eq!(schema.get_primary_key("order").unwrap(), "order_id");
        assert!(matches!(
            schema.get_referenced_table("item", "quantity"),
            Err(SyncError::UnknownForeignKey { .. })
        ));
        assert!(matches!(
            schema.get_primary_key("order_summary"),
            Err(SyncError::NoPrimaryKey(_))
        ));
        assert!(matches!(
            schema.get_primary_key("missing"),
            Err(SyncError::UnknownTable(_))
        ));
    }

    #[test]
    fn test_composite_key_is_ambiguous() {
        let schema = SchemaModel::new(vec![
            TableSchema::new("pair").with_primary_key("a").with_primary_key("b"),
        ])
        .unwrap();
        match schema.get_primary_key("pair") {
            Err(SyncError::AmbiguousPrimaryKey { columns, .. }) => {
                assert_eq!(columns, vec!["a", "b"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_duplicates_rejected() {
        let err = SchemaModel::new(vec![
            TableSchema::new("item")
                .with_foreign_key("order_id", "order")
                .with_foreign_key("order_id", "customer"),
        ])
        .unwrap_err();
        assert!(matches!(err, SyncError::DuplicateForeignKey { .. }));

        let err = SchemaModel::new(vec![TableSchema::new("a"), TableSchema::new("a")]).unwrap_err();
        assert!(matches!(err, SyncError::DuplicateTable(_)));
    }

    #[test]
    fn test_invalid_names_rejected() {
        let err = SchemaModel::new(vec![TableSchema::new("bad name")]).unwrap_err();
        assert!(matches!(err, SyncError::InvalidIdentifier { .. }));
    }

    #[test]
    fn test_yaml_snapshot() {
        let schema = shop();
        let yaml = schema.to_yaml().unwrap();
        let reloaded = SchemaModel::from_yaml(&yaml).unwrap();
        assert_eq!(reloaded.table_names(), schema.table_names());
        assert_eq!(reloaded.get_referenced_table("order", "customer_id").unwrap(), "customer");
        assert!(reloaded.table("order_summary").unwrap().primary_key.is_empty());
    }
}
