//! Schema model tests: catalog introspection and snapshots

use table_sync::{SchemaModel, SyncError, TableSchema};

#[cfg(feature = "duckdb-backend")]
mod catalog_tests {
    use super::*;
    use table_sync::{DuckDbStore, Store};

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    async fn load(ddl: &str) -> SchemaModel {
        let store = DuckDbStore::memory().unwrap();
        store.execute_batch(ddl).await.unwrap();
        let mut session = store.open_session("schema_tests").await.unwrap();
        let schema = SchemaModel::load(session.as_catalog()).await.unwrap();
        session.release().await.unwrap();
        schema
    }

    #[test]
    fn test_load_tables_keys_and_views() {
        runtime().block_on(async {
            let schema = load(
                "CREATE TABLE customer (customer_id INTEGER PRIMARY KEY, name VARCHAR);
                 CREATE TABLE orders (
                     order_id INTEGER PRIMARY KEY,
                     customer_id INTEGER REFERENCES customer (customer_id)
                 );
                 CREATE TABLE pair (a INTEGER, b INTEGER, PRIMARY KEY (a, b));
                 CREATE VIEW big_customers AS SELECT * FROM customer;",
            )
            .await;

            assert_eq!(
                schema.table_names(),
                vec!["big_customers", "customer", "orders", "pair"]
            );
            assert_eq!(schema.get_primary_key("orders").unwrap(), "order_id");
            assert_eq!(
                schema.get_referenced_table("orders", "customer_id").unwrap(),
                "customer"
            );
            assert_eq!(schema.foreign_key_count(), 1);
            assert!(matches!(
                schema.get_primary_key("big_customers"),
                Err(SyncError::NoPrimaryKey(_))
            ));
            assert!(matches!(
                schema.get_primary_key("pair"),
                Err(SyncError::AmbiguousPrimaryKey { .. })
            ));
        });
    }

    #[test]
    fn test_load_skips_unsupported_names() {
        runtime().block_on(async {
            let schema = load(
                r#"CREATE TABLE customer (customer_id INTEGER PRIMARY KEY, name VARCHAR);
                 CREATE TABLE "legacy-import" (x INTEGER PRIMARY KEY);
                 CREATE TABLE orders (
                     order_id INTEGER PRIMARY KEY,
                     customer_id INTEGER REFERENCES customer (customer_id),
                     "legacy ref" INTEGER REFERENCES "legacy-import" (x)
                 );"#,
            )
            .await;

            assert_eq!(schema.table_names(), vec!["customer", "orders"]);
            assert_eq!(schema.foreign_key_count(), 1);
            assert_eq!(
                schema.get_referenced_table("orders", "customer_id").unwrap(),
                "customer"
            );
        });
    }

    #[test]
    fn test_load_empty_database() {
        runtime().block_on(async {
            let schema = load("SELECT 1;").await;
            assert!(schema.table_names().is_empty());
            assert_eq!(schema.foreign_key_count(), 0);
        });
    }
}

mod snapshot_tests {
    use super::*;

    #[test]
    fn test_json_snapshot() {
        let schema = SchemaModel::new(vec![
            TableSchema::new("customer").with_primary_key("customer_id"),
            TableSchema::new("orders")
                .with_primary_key("order_id")
                .with_foreign_key("customer_id", "customer"),
        ])
        .unwrap();
        let json = schema.to_json().unwrap();
        let reloaded = SchemaModel::from_json(&json).unwrap();
        assert_eq!(
            reloaded.get_referenced_table("orders", "customer_id").unwrap(),
            "customer"
        );
        assert_eq!(reloaded.get_primary_key("customer").unwrap(), "customer_id");
    }

    #[test]
    fn test_hand_written_yaml() {
        let schema = SchemaModel::from_yaml(
            r#"
tables:
  - name: customer
    primary_key: [customer_id]
  - name: item
    primary_key: [item_id]
    foreign_keys:
      - column_name: customer_id
        referenced_table: customer
"#,
        )
        .unwrap();
        assert_eq!(schema.get_referenced_table("item", "customer_id").unwrap(), "customer");
    }

    #[test]
    fn test_malformed_yaml_is_config_error() {
        let err = SchemaModel::from_yaml("tables: 12").unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }
}
