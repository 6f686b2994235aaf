//! End-to-end sync tests against an embedded DuckDB store

#![cfg(feature = "duckdb-backend")]

use chrono::NaiveDate;
use serde_json::json;
use table_sync::store::RetryPolicy;
use table_sync::{
    DuckDbStore, RowSet, SyncCounts, SyncError, SyncExecutor, SyncOptions, Value,
};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

const SAMPLE_DDL: &str = "
    CREATE TABLE sample (
        id INTEGER PRIMARY KEY,
        label VARCHAR,
        score DOUBLE,
        active BOOLEAN,
        created DATE
    );
    INSERT INTO sample VALUES
        (1, 'one', 1.5, true, DATE '2024-01-01'),
        (2, 'two', NULL, false, DATE '2024-01-02'),
        (3, 'three', 3.25, NULL, NULL);
    CREATE VIEW sample_view AS SELECT id, label FROM sample;
";

async fn executor_with(options: SyncOptions) -> SyncExecutor<DuckDbStore> {
    let store = DuckDbStore::memory().unwrap();
    store.execute_batch(SAMPLE_DDL).await.unwrap();
    let executor = SyncExecutor::connect(store, options).await.unwrap();
    executor.init_audit_table().await.unwrap();
    executor
}

async fn executor() -> SyncExecutor<DuckDbStore> {
    executor_with(SyncOptions::default()).await
}

fn rows(value: serde_json::Value) -> RowSet {
    RowSet::from_json(&value).unwrap()
}

fn labels(table: &RowSet) -> Vec<(Value, Value)> {
    let id = table.column_index("id").unwrap();
    let label = table.column_index("label").unwrap();
    table
        .rows
        .iter()
        .map(|r| (r[id].clone(), r[label].clone()))
        .collect()
}

mod full_sync_tests {
    use super::*;

    #[test]
    fn test_sync_without_delete_keeps_unlisted_rows() {
        runtime().block_on(async {
            let executor = executor().await;
            let target = rows(json!([
                {"id": 2, "label": "deux"},
                {"id": 4, "label": "four"}
            ]));
            let report = executor
                .sync_table("sample", &target, false, "alice", None)
                .await
                .unwrap();
            assert_eq!(
                report.counts,
                SyncCounts {
                    inserted: 1,
                    updated: 1,
                    deleted: 0
                }
            );

            let table = executor.get_table("sample").await.unwrap();
            assert_eq!(
                labels(&table),
                vec![
                    (Value::Int(1), Value::from("one")),
                    (Value::Int(2), Value::from("deux")),
                    (Value::Int(3), Value::from("three")),
                    (Value::Int(4), Value::from("four")),
                ]
            );
        });
    }

    #[test]
    fn test_sync_with_delete_matches_target() {
        runtime().block_on(async {
            let executor = executor().await;
            let target = rows(json!([
                {"id": 1, "label": "one", "score": 1.5, "active": true, "created": "2024-01-01"},
                {"id": 5, "label": "five", "score": 5.0, "active": false, "created": "2024-05-05"}
            ]));
            let report = executor
                .sync_table("sample", &target, true, "alice", Some("cleanup"))
                .await
                .unwrap();
            assert_eq!(
                report.counts,
                SyncCounts {
                    inserted: 1,
                    updated: 0,
                    deleted: 2
                }
            );

            let table = executor.get_table("sample").await.unwrap();
            assert_eq!(table.len(), 2);
            let created = table.column_index("created").unwrap();
            assert_eq!(
                table.rows[1][created],
                Value::Date(NaiveDate::from_ymd_opt(2024, 5, 5).unwrap())
            );
        });
    }

    #[test]
    fn test_sync_is_idempotent() {
        runtime().block_on(async {
            let executor = executor().await;
            let target = rows(json!([
                {"id": 1, "label": "uno", "score": null},
                {"id": 2, "label": "two", "score": 2.5}
            ]));
            executor
                .sync_table("sample", &target, true, "alice", None)
                .await
                .unwrap();
            let before = executor.get_table("sample").await.unwrap();

            let report = executor
                .sync_table("sample", &target, true, "alice", None)
                .await
                .unwrap();
            assert_eq!(report.counts, SyncCounts::default());
            assert_eq!(executor.get_table("sample").await.unwrap(), before);
        });
    }

    #[test]
    fn test_sync_with_empty_target_deletes_everything() {
        runtime().block_on(async {
            let executor = executor().await;
            let target = RowSet::empty(vec!["id".into()]);
            let report = executor
                .sync_table("sample", &target, true, "alice", None)
                .await
                .unwrap();
            assert_eq!(report.counts.deleted, 3);
            assert!(executor.get_table("sample").await.unwrap().is_empty());
        });
    }

    #[test]
    fn test_type_mismatch_leaves_table_unchanged() {
        runtime().block_on(async {
            let executor = executor().await;
            let before = executor.get_table("sample").await.unwrap();
            let target = rows(json!([{"id": 1, "label": 42}]));
            let err = executor
                .sync_table("sample", &target, true, "alice", None)
                .await
                .unwrap_err();
            assert!(matches!(err, SyncError::TypeMismatch { ref column, .. } if column == "label"));
            assert_eq!(executor.get_table("sample").await.unwrap(), before);
        });
    }

    #[test]
    fn test_missing_primary_key_column() {
        runtime().block_on(async {
            let executor = executor().await;
            let target = rows(json!([{"label": "orphan"}]));
            let err = executor
                .sync_table("sample", &target, false, "alice", None)
                .await
                .unwrap_err();
            assert!(matches!(err, SyncError::MissingPrimaryKey(ref c) if c == "id"));
        });
    }

    #[test]
    fn test_view_cannot_be_synced() {
        runtime().block_on(async {
            let executor = executor().await;
            let target = rows(json!([{"id": 1, "label": "one"}]));
            let err = executor
                .sync_table("sample_view", &target, false, "alice", None)
                .await
                .unwrap_err();
            assert!(matches!(err, SyncError::NoPrimaryKey(_)));
        });
    }

    #[test]
    fn test_unknown_table() {
        runtime().block_on(async {
            let executor = executor().await;
            let target = rows(json!([{"id": 1}]));
            let err = executor
                .sync_table("missing", &target, false, "alice", None)
                .await
                .unwrap_err();
            assert_eq!(err.status_code(), 404);
        });
    }
}

mod insert_update_tests {
    use super::*;

    #[test]
    fn test_insert_only_adds_rows() {
        runtime().block_on(async {
            let executor = executor().await;
            let new_rows = rows(json!([
                {"id": 10, "label": "ten"},
                {"id": 11, "label": "eleven"}
            ]));
            let counts = executor
                .insert_only("sample", &new_rows, "alice", None)
                .await
                .unwrap();
            assert_eq!(counts.inserted, 2);
            assert_eq!(executor.get_table("sample").await.unwrap().len(), 5);
        });
    }

    #[test]
    fn test_insert_conflict_rolls_back_whole_call() {
        runtime().block_on(async {
            let executor = executor().await;
            let before = executor.get_table("sample").await.unwrap();
            let new_rows = rows(json!([
                {"id": 12, "label": "twelve"},
                {"id": 1, "label": "duplicate"}
            ]));
            let err = executor
                .insert_only("sample", &new_rows, "alice", None)
                .await
                .unwrap_err();
            assert!(matches!(err, SyncError::ConflictingRow { .. }));
            assert_eq!(err.status_code(), 409);
            assert_eq!(executor.get_table("sample").await.unwrap(), before);

            // the session was released; later calls still work
            let counts = executor
                .insert_only("sample", &rows(json!([{"id": 12, "label": "twelve"}])), "alice", None)
                .await
                .unwrap();
            assert_eq!(counts.inserted, 1);
        });
    }

    #[test]
    fn test_update_only_changes_listed_columns() {
        runtime().block_on(async {
            let executor = executor().await;
            let changes = rows(json!([{"id": 2, "score": 9.5}]));
            let counts = executor
                .update_only("sample", &changes, "alice", None)
                .await
                .unwrap();
            assert_eq!(counts.updated, 1);

            let table = executor.get_table("sample").await.unwrap();
            let score = table.column_index("score").unwrap();
            assert_eq!(table.rows[1][score], Value::Float(9.5));
            assert_eq!(labels(&table)[1].1, Value::from("two"));
        });
    }

    #[test]
    fn test_update_only_skips_unknown_keys() {
        runtime().block_on(async {
            let executor = executor().await;
            let changes = rows(json!([
                {"id": 1, "label": "first"},
                {"id": 99, "label": "ghost"}
            ]));
            let counts = executor
                .update_only("sample", &changes, "alice", None)
                .await
                .unwrap();
            assert_eq!(counts.updated, 1);
            assert_eq!(executor.get_table("sample").await.unwrap().len(), 3);
        });
    }

    #[test]
    fn test_strict_update_only_rejects_unknown_keys() {
        runtime().block_on(async {
            let executor =
                executor_with(SyncOptions::default().with_strict_update_only(true)).await;
            let changes = rows(json!([
                {"id": 1, "label": "first"},
                {"id": 99, "label": "ghost"}
            ]));
            let err = executor
                .update_only("sample", &changes, "alice", None)
                .await
                .unwrap_err();
            match err {
                SyncError::MissingRows { table, pks } => {
                    assert_eq!(table, "sample");
                    assert_eq!(pks, vec![Value::Int(99)]);
                }
                other => panic!("unexpected {other:?}"),
            }
            let table = executor.get_table("sample").await.unwrap();
            assert_eq!(labels(&table)[0].1, Value::from("one"));
        });
    }

    #[test]
    fn test_update_without_key_column() {
        runtime().block_on(async {
            let executor = executor().await;
            let err = executor
                .update_only("sample", &rows(json!([{"label": "x"}])), "alice", None)
                .await
                .unwrap_err();
            assert!(matches!(err, SyncError::MissingPrimaryKey(_)));
        });
    }
}

mod audit_tests {
    use super::*;

    #[test]
    fn test_every_write_is_audited() {
        runtime().block_on(async {
            let executor = executor().await;
            executor
                .sync_table(
                    "sample",
                    &rows(json!([{"id": 1, "label": "uno"}])),
                    false,
                    "alice",
                    Some("rename"),
                )
                .await
                .unwrap();
            executor
                .insert_only("sample", &rows(json!([{"id": 7, "label": "seven"}])), "bob", None)
                .await
                .unwrap();

            let log = executor.get_table("bulk_update_log").await.unwrap();
            assert_eq!(log.len(), 2);
            let user = log.column_index("username").unwrap();
            let updated = log.column_index("rows_updated").unwrap();
            let inserted = log.column_index("rows_inserted").unwrap();
            let reason = log.column_index("reason").unwrap();
            let table_name = log.column_index("table_name").unwrap();

            let alice = log
                .rows
                .iter()
                .find(|r| r[user] == Value::from("alice"))
                .unwrap();
            assert_eq!(alice[updated], Value::Int(1));
            assert_eq!(alice[reason], Value::from("rename"));
            assert_eq!(alice[table_name], Value::from("sample"));

            let bob = log
                .rows
                .iter()
                .find(|r| r[user] == Value::from("bob"))
                .unwrap();
            assert_eq!(bob[inserted], Value::Int(1));
            assert_eq!(bob[reason], Value::Null);
        });
    }

    #[test]
    fn test_failed_write_is_not_audited() {
        runtime().block_on(async {
            let executor = executor().await;
            let _ = executor
                .insert_only("sample", &rows(json!([{"id": 1, "label": "dup"}])), "alice", None)
                .await
                .unwrap_err();
            assert!(executor.get_table("bulk_update_log").await.unwrap().is_empty());
        });
    }

    #[test]
    fn test_missing_audit_table_fails_write() {
        runtime().block_on(async {
            let store = DuckDbStore::memory().unwrap();
            store.execute_batch(SAMPLE_DDL).await.unwrap();
            let executor = SyncExecutor::connect(store, SyncOptions::default())
                .await
                .unwrap();
            let before = executor.get_table("sample").await.unwrap();
            let result = executor
                .insert_only("sample", &rows(json!([{"id": 8, "label": "eight"}])), "alice", None)
                .await;
            assert!(result.is_err());
            assert_eq!(executor.get_table("sample").await.unwrap(), before);
        });
    }
}

mod read_tests {
    use super::*;

    #[test]
    fn test_get_table_orders_by_primary_key() {
        runtime().block_on(async {
            let executor = executor().await;
            executor
                .insert_only("sample", &rows(json!([{"id": 0, "label": "zero"}])), "alice", None)
                .await
                .unwrap();
            let table = executor.get_table("sample").await.unwrap();
            let ids: Vec<Value> = labels(&table).into_iter().map(|(id, _)| id).collect();
            assert_eq!(ids, vec![Value::Int(0), Value::Int(1), Value::Int(2), Value::Int(3)]);
        });
    }

    #[test]
    fn test_get_view() {
        runtime().block_on(async {
            let executor = executor().await;
            let view = executor.get_table("sample_view").await.unwrap();
            assert_eq!(view.columns, vec!["id".to_string(), "label".to_string()]);
            assert_eq!(view.len(), 3);
        });
    }

    #[test]
    fn test_query_follows_foreign_keys() {
        runtime().block_on(async {
            let store = DuckDbStore::memory().unwrap();
            store
                .execute_batch(
                    "CREATE TABLE customer (customer_id INTEGER PRIMARY KEY, name VARCHAR);
                     CREATE TABLE orders (
                         order_id INTEGER PRIMARY KEY,
                         customer_id INTEGER REFERENCES customer (customer_id),
                         placed_on DATE
                     );
                     CREATE TABLE item (
                         item_id INTEGER PRIMARY KEY,
                         order_id INTEGER REFERENCES orders (order_id),
                         quantity INTEGER
                     );
                     INSERT INTO customer VALUES (1, 'Ada'), (2, 'Grace');
                     INSERT INTO orders VALUES (10, 1, DATE '2024-03-01'), (11, NULL, DATE '2024-03-02');
                     INSERT INTO item VALUES (100, 10, 2), (101, 10, 1), (102, 11, 5), (103, NULL, 7);",
                )
                .await
                .unwrap();
            let executor = SyncExecutor::connect(store, SyncOptions::default())
                .await
                .unwrap();

            let schema = executor.schema();
            assert_eq!(schema.get_referenced_table("item", "order_id").unwrap(), "orders");
            assert_eq!(schema.get_primary_key("customer").unwrap(), "customer_id");

            let result = executor
                .query("item", "item_id, order_id.customer_id.name, quantity")
                .await
                .unwrap();
            assert_eq!(result.columns, vec!["item_id", "name", "quantity"]);
            // left outer joins keep every base row
            assert_eq!(result.len(), 4);

            let mut named: Vec<(Value, Value)> = result
                .rows
                .iter()
                .map(|r| (r[0].clone(), r[1].clone()))
                .collect();
            named.sort_by_key(|(id, _)| id.to_string());
            assert_eq!(
                named,
                vec![
                    (Value::Int(100), Value::from("Ada")),
                    (Value::Int(101), Value::from("Ada")),
                    (Value::Int(102), Value::Null),
                    (Value::Int(103), Value::Null),
                ]
            );
        });
    }

    #[test]
    fn test_file_store_persists_between_opens() {
        runtime().block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("shop.duckdb");
            {
                let store = DuckDbStore::open(&path, &RetryPolicy::none()).await.unwrap();
                store.execute_batch(SAMPLE_DDL).await.unwrap();
                let executor = SyncExecutor::connect(store, SyncOptions::default())
                    .await
                    .unwrap();
                executor.init_audit_table().await.unwrap();
                executor
                    .sync_table("sample", &rows(json!([{"id": 1, "label": "kept"}])), true, "alice", None)
                    .await
                    .unwrap();
            }
            let store = DuckDbStore::open(&path, &RetryPolicy::none()).await.unwrap();
            let executor = SyncExecutor::connect(store, SyncOptions::default())
                .await
                .unwrap();
            let table = executor.get_table("sample").await.unwrap();
            assert_eq!(labels(&table), vec![(Value::Int(1), Value::from("kept"))]);
        });
    }
}

mod verification_tests {
    use super::*;
    use table_sync::sync::verify::VerifyError;

    async fn executor_for(ddl: &str) -> SyncExecutor<DuckDbStore> {
        let store = DuckDbStore::memory().unwrap();
        store.execute_batch(ddl).await.unwrap();
        let executor = SyncExecutor::connect(store, SyncOptions::default())
            .await
            .unwrap();
        executor.init_audit_table().await.unwrap();
        executor
    }

    #[test]
    fn test_integers_into_double_column() {
        runtime().block_on(async {
            let executor =
                executor_for("CREATE TABLE measure (id INTEGER PRIMARY KEY, score DOUBLE);").await;
            let target = rows(json!([{"id": 1, "score": 3}]));
            let report = executor
                .sync_table("measure", &target, true, "alice", None)
                .await
                .unwrap();
            assert_eq!(report.counts.inserted, 1);

            let table = executor.get_table("measure").await.unwrap();
            assert_eq!(table.rows, vec![vec![Value::Int(1), Value::Float(3.0)]]);

            let again = executor
                .sync_table("measure", &target, true, "alice", None)
                .await
                .unwrap();
            assert_eq!(again.counts, SyncCounts::default());
        });
    }

    #[test]
    fn test_real_column_round_trips() {
        runtime().block_on(async {
            let executor = executor_for(
                "CREATE TABLE weights (id INTEGER PRIMARY KEY, w REAL);
                 INSERT INTO weights VALUES (1, 0.5);",
            )
            .await;
            let target = rows(json!([{"id": 1, "w": 0.1}]));
            let report = executor
                .sync_table("weights", &target, true, "alice", None)
                .await
                .unwrap();
            assert_eq!(report.counts.updated, 1);

            let table = executor.get_table("weights").await.unwrap();
            assert_eq!(table.rows, vec![vec![Value::Int(1), Value::Float(0.1)]]);

            let again = executor
                .sync_table("weights", &target, true, "alice", None)
                .await
                .unwrap();
            assert_eq!(again.counts, SyncCounts::default());
        });
    }

    #[test]
    fn test_lossy_write_reports_committed_counts() {
        runtime().block_on(async {
            let executor = executor_for(
                "CREATE TABLE weights (id INTEGER PRIMARY KEY, w REAL);
                 INSERT INTO weights VALUES (1, 0.5);",
            )
            .await;
            // REAL keeps about seven significant digits
            let target = rows(json!([{"id": 1, "w": 0.123456789}]));
            let err = executor
                .sync_table("weights", &target, true, "alice", None)
                .await
                .unwrap_err();
            match err {
                SyncError::SanityCheckFailed {
                    table,
                    counts,
                    detail,
                } => {
                    assert_eq!(table, "weights");
                    assert_eq!(
                        counts,
                        SyncCounts {
                            inserted: 0,
                            updated: 1,
                            deleted: 0
                        }
                    );
                    assert_eq!(
                        detail,
                        VerifyError::DiffersFromTarget {
                            column: "id".into(),
                            value: Value::Int(1),
                        }
                    );
                }
                other => panic!("unexpected {other:?}"),
            }

            let table = executor.get_table("weights").await.unwrap();
            assert_eq!(table.rows, vec![vec![Value::Int(1), Value::Float(0.123_456_79)]]);
            assert_eq!(executor.get_table("bulk_update_log").await.unwrap().len(), 1);
        });
    }

    #[test]
    fn test_update_only_ignores_changes_outside_target() {
        runtime().block_on(async {
            let executor = executor().await;
            executor
                .store()
                .execute_batch(
                    "UPDATE sample SET score = 99.0 WHERE id = 1;
                     UPDATE sample SET label = 'zwei' WHERE id = 2;",
                )
                .await
                .unwrap();

            let counts = executor
                .update_only("sample", &rows(json!([{"id": 1, "label": "uno"}])), "alice", None)
                .await
                .unwrap();
            assert_eq!(counts.updated, 1);

            let table = executor.get_table("sample").await.unwrap();
            let score = table.column_index("score").unwrap();
            assert_eq!(table.rows[0][score], Value::Float(99.0));
            assert_eq!(labels(&table)[1].1, Value::from("zwei"));
        });
    }

    #[test]
    fn test_unsupported_table_names_do_not_block_connect() {
        runtime().block_on(async {
            let executor = executor_for(
                r#"CREATE TABLE sample (id INTEGER PRIMARY KEY, label VARCHAR);
                   CREATE TABLE "legacy-import" (x INTEGER);"#,
            )
            .await;
            let tables = executor.list_tables();
            assert!(tables.iter().any(|t| t == "sample"));
            assert!(!tables.iter().any(|t| t == "legacy-import"));
        });
    }
}
