//! PgWarehouse against a real PostgreSQL.
//!
//! Run with:
//!   docker run -d -p 15434:5432 -e POSTGRES_PASSWORD=postgres postgres:16
//!   cargo test -p tagsync_test_utils --features docker-tests

#![cfg(feature = "docker-tests")]

use sqlx::Row;
use tagsync_db::{
    ColumnExpr, DerivedProjection, Ident, MergePlan, PgWarehouse, SqlType, TableRef,
    WarehouseStore,
};
use tagsync_test_utils::{PgSchemaGuard, TestPgPool};

fn ident(name: &str) -> Ident {
    Ident::parse(name).unwrap()
}

fn cell(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

async fn stage(
    warehouse: &PgWarehouse,
    schema: &Ident,
    columns: &[Ident],
    rows: &[&[&str]],
) -> TableRef {
    let raw = TableRef::new(schema.clone(), ident("sales"));
    let dedup = TableRef::new(schema.clone(), ident("sales_dedup"));
    let rows: Vec<Vec<Option<String>>> = rows
        .iter()
        .map(|row| row.iter().map(|v| cell(v)).collect())
        .collect();

    warehouse.recreate_staging_table(&raw, columns).await.unwrap();
    warehouse.bulk_load(&raw, columns, &rows).await.unwrap();
    warehouse
        .build_dedup_table(&raw, &dedup, columns, &[ident("id")])
        .await
        .unwrap();
    dedup
}

#[tokio::test]
async fn test_dedup_keeps_first_row_per_key() {
    let pool = TestPgPool::connect().await.unwrap();
    let guard = PgSchemaGuard::new(pool.pool.clone()).await.unwrap();
    let warehouse = PgWarehouse::new(pool.pool.clone());
    let columns = [ident("id"), ident("amt")];

    stage(
        &warehouse,
        guard.schema(),
        &columns,
        &[&["1", "10"], &["1", "11"], &["", "99"], &["2", "5"]],
    )
    .await;

    let rows = guard
        .fetch_all("SELECT id, amt FROM sales_dedup ORDER BY id")
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get::<String, _>("amt"), "10");
    assert_eq!(rows[1].get::<String, _>("id"), "2");
}

#[tokio::test]
async fn test_restaging_replaces_previous_rows() {
    let pool = TestPgPool::connect().await.unwrap();
    let guard = PgSchemaGuard::new(pool.pool.clone()).await.unwrap();
    let warehouse = PgWarehouse::new(pool.pool.clone());
    let columns = [ident("id"), ident("amt")];

    stage(&warehouse, guard.schema(), &columns, &[&["1", "10"], &["2", "5"]]).await;
    stage(&warehouse, guard.schema(), &columns, &[&["3", "7"]]).await;

    let rows = guard.fetch_all("SELECT id FROM sales_dedup").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get::<String, _>("id"), "3");
}

#[tokio::test]
async fn test_merge_updates_only_tag_column() {
    let pool = TestPgPool::connect().await.unwrap();
    let guard = PgSchemaGuard::new(pool.pool.clone()).await.unwrap();
    let warehouse = PgWarehouse::new(pool.pool.clone());
    let columns = [ident("id"), ident("amt")];

    guard
        .execute("CREATE TABLE wide (id text PRIMARY KEY, amt numeric, qty numeric)")
        .await
        .unwrap();
    guard
        .execute("INSERT INTO wide VALUES ('1', 1, 7), ('9', 9, 9)")
        .await
        .unwrap();
    let dedup = stage(&warehouse, guard.schema(), &columns, &[&["1", "10"], &["2", "5"]]).await;

    let plan = MergePlan {
        source: dedup.clone(),
        target: TableRef::new(guard.schema().clone(), ident("wide")),
        keys: vec![ColumnExpr::Column(ident("id"))],
        value: ColumnExpr::Cast {
            column: ident("amt"),
            sql_type: SqlType::Numeric,
        },
        reset_column_first: false,
    };
    assert_eq!(warehouse.merge_column(&plan).await.unwrap(), 2);

    let rows = guard
        .fetch_all("SELECT id, amt::text AS amt, qty::text AS qty FROM wide ORDER BY id")
        .await
        .unwrap();
    let view: Vec<(String, Option<String>, Option<String>)> = rows
        .iter()
        .map(|r| (r.get("id"), r.get("amt"), r.get("qty")))
        .collect();
    assert_eq!(
        view,
        vec![
            ("1".into(), Some("10".into()), Some("7".into())),
            ("2".into(), Some("5".into()), None),
            ("9".into(), Some("9".into()), Some("9".into())),
        ]
    );

    // full upload clears keys the file no longer carries
    let full = MergePlan {
        reset_column_first: true,
        ..plan
    };
    warehouse.merge_column(&full).await.unwrap();
    let rows = guard
        .fetch_all("SELECT amt::text AS amt FROM wide WHERE id = '9'")
        .await
        .unwrap();
    assert_eq!(rows[0].get::<Option<String>, _>("amt"), None);
}

#[tokio::test]
async fn test_failed_merge_rolls_back_reset() {
    let pool = TestPgPool::connect().await.unwrap();
    let guard = PgSchemaGuard::new(pool.pool.clone()).await.unwrap();
    let warehouse = PgWarehouse::new(pool.pool.clone());
    let columns = [ident("id"), ident("amt")];

    guard
        .execute("CREATE TABLE wide (id text PRIMARY KEY, amt numeric)")
        .await
        .unwrap();
    guard.execute("INSERT INTO wide VALUES ('1', 1)").await.unwrap();
    let dedup = stage(&warehouse, guard.schema(), &columns, &[&["1", "abc"]]).await;

    let plan = MergePlan {
        source: dedup,
        target: TableRef::new(guard.schema().clone(), ident("wide")),
        keys: vec![ColumnExpr::Column(ident("id"))],
        value: ColumnExpr::Cast {
            column: ident("amt"),
            sql_type: SqlType::Numeric,
        },
        reset_column_first: true,
    };
    assert!(warehouse.merge_column(&plan).await.is_err());

    let rows = guard
        .fetch_all("SELECT amt::text AS amt FROM wide")
        .await
        .unwrap();
    assert_eq!(rows[0].get::<Option<String>, _>("amt").as_deref(), Some("1"));
}

#[tokio::test]
async fn test_derived_table_tags_matching_rows() {
    let pool = TestPgPool::connect().await.unwrap();
    let guard = PgSchemaGuard::new(pool.pool.clone()).await.unwrap();
    let warehouse = PgWarehouse::new(pool.pool.clone());
    let columns = [ident("id"), ident("kind")];

    let dedup = stage(
        &warehouse,
        guard.schema(),
        &columns,
        &[&["1", "web"], &["2", "store"], &["3", "phone"]],
    )
    .await;
    let derived = TableRef::new(guard.schema().clone(), ident("sales_derived"));
    let rows = warehouse
        .build_derived_table(
            &dedup,
            &derived,
            &columns,
            &ident("channel"),
            &[
                DerivedProjection {
                    source_column: ident("kind"),
                    derived_value: "web".into(),
                    tag_name: "online".into(),
                },
                DerivedProjection {
                    source_column: ident("kind"),
                    derived_value: "store".into(),
                    tag_name: "offline".into(),
                },
            ],
        )
        .await
        .unwrap();
    assert_eq!(rows, 2);

    let rows = guard
        .fetch_all("SELECT id, channel FROM sales_derived ORDER BY id")
        .await
        .unwrap();
    assert_eq!(rows[0].get::<String, _>("channel"), "online");
    assert_eq!(rows[1].get::<String, _>("channel"), "offline");
}
