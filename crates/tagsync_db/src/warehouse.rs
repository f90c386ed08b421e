//! Staging and target tables in the PostgreSQL warehouse.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::time::Instant;
use tracing::{debug, debug_span, Instrument};

use crate::error::{DbError, Result};
use crate::sql::{self, DerivedProjection, Ident, MergePlan, TableRef};

/// PostgreSQL rejects statements with more bind parameters than this.
const MAX_BIND_PARAMS: usize = 65_535;

/// Widest header a staging table can hold: PostgreSQL allows 1600 columns
/// and one of them is the line ordinal.
pub const MAX_STAGING_COLUMNS: usize = 1_599;

/// Warehouse operations used by staging, expansion and merge.
#[async_trait]
pub trait WarehouseStore: Send + Sync {
    /// Drop and create an all-text staging table with the given columns.
    async fn recreate_staging_table(&self, table: &TableRef, columns: &[Ident]) -> Result<()>;

    /// Insert rows in order; `None` is stored as NULL. Returns rows written.
    async fn bulk_load(
        &self,
        table: &TableRef,
        columns: &[Ident],
        rows: &[Vec<Option<String>>],
    ) -> Result<u64>;

    /// Rebuild `target` with one row per non-null primary key, first-seen wins.
    async fn build_dedup_table(
        &self,
        source: &TableRef,
        target: &TableRef,
        columns: &[Ident],
        primary_key: &[Ident],
    ) -> Result<u64>;

    /// Rebuild `target` as the union of the projections over `source`.
    async fn build_derived_table(
        &self,
        source: &TableRef,
        target: &TableRef,
        columns: &[Ident],
        derived_field: &Ident,
        projections: &[DerivedProjection],
    ) -> Result<u64>;

    /// Upsert one tag column. Returns rows inserted or updated.
    async fn merge_column(&self, plan: &MergePlan) -> Result<u64>;

    async fn table_exists(&self, table: &TableRef) -> Result<bool>;
}

/// [`WarehouseStore`] over a PostgreSQL pool.
#[derive(Debug, Clone)]
pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Drop and rebuild a table inside one transaction.
    async fn replace_table(&self, op: &'static str, target: &TableRef, create: String) -> Result<u64> {
        let span = debug_span!("warehouse.exec", op, table = %target, duration_ms = tracing::field::Empty);
        async {
            let started = Instant::now();
            let mut tx = self.pool.begin().await?;
            sqlx::query(&sql::drop_table(target))
                .execute(&mut *tx)
                .await?;
            let rows = sqlx::query(&create).execute(&mut *tx).await?.rows_affected();
            tx.commit().await?;
            tracing::Span::current().record("duration_ms", started.elapsed().as_millis() as u64);
            debug!(rows, "table rebuilt");
            Ok::<_, DbError>(rows)
        }
        .instrument(span)
        .await
    }
}

/// Reject headers a staging table cannot hold.
pub fn check_staging_width(table: &TableRef, columns: &[Ident]) -> Result<()> {
    if columns.is_empty() {
        return Err(DbError::invalid_state(format!(
            "staging table {} needs at least one column",
            table
        )));
    }
    if columns.len() > MAX_STAGING_COLUMNS {
        return Err(DbError::invalid_state(format!(
            "staging table {} would have {} columns, at most {} are allowed",
            table,
            columns.len(),
            MAX_STAGING_COLUMNS
        )));
    }
    Ok(())
}

fn rows_per_chunk(columns: usize) -> usize {
    MAX_BIND_PARAMS / (columns + 1)
}

#[async_trait]
impl WarehouseStore for PgWarehouse {
    async fn recreate_staging_table(&self, table: &TableRef, columns: &[Ident]) -> Result<()> {
        check_staging_width(table, columns)?;
        let span = debug_span!("warehouse.exec", op = "create_staging", table = %table);
        async {
            let mut tx = self.pool.begin().await?;
            sqlx::query(&sql::drop_table(table))
                .execute(&mut *tx)
                .await?;
            sqlx::query(&sql::create_staging_table(table, columns))
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok::<_, DbError>(())
        }
        .instrument(span)
        .await
    }

    async fn bulk_load(
        &self,
        table: &TableRef,
        columns: &[Ident],
        rows: &[Vec<Option<String>>],
    ) -> Result<u64> {
        if let Some(bad) = rows.iter().position(|row| row.len() != columns.len()) {
            return Err(DbError::invalid_state(format!(
                "row {} has {} values, {} expects {}",
                bad + 1,
                rows[bad].len(),
                table,
                columns.len()
            )));
        }
        if rows.is_empty() {
            return Ok(0);
        }

        let span = debug_span!(
            "warehouse.exec",
            op = "bulk_load",
            table = %table,
            rows = rows.len(),
            duration_ms = tracing::field::Empty
        );
        async {
            let started = Instant::now();
            let prefix = sql::insert_staging_prefix(table, columns);
            let chunk_size = rows_per_chunk(columns.len());
            let mut written = 0u64;
            let mut tx = self.pool.begin().await?;

            for (chunk_idx, chunk) in rows.chunks(chunk_size).enumerate() {
                let first_line = (chunk_idx * chunk_size) as i64 + 1;
                let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(&prefix);
                builder.push_values(chunk.iter().enumerate(), |mut values, (offset, row)| {
                    values.push_bind(first_line + offset as i64);
                    for value in row {
                        values.push_bind(value.clone());
                    }
                });
                written += builder.build().execute(&mut *tx).await?.rows_affected();
            }

            tx.commit().await?;
            tracing::Span::current().record("duration_ms", started.elapsed().as_millis() as u64);
            Ok::<_, DbError>(written)
        }
        .instrument(span)
        .await
    }

    async fn build_dedup_table(
        &self,
        source: &TableRef,
        target: &TableRef,
        columns: &[Ident],
        primary_key: &[Ident],
    ) -> Result<u64> {
        if primary_key.is_empty() {
            return Err(DbError::invalid_state(format!(
                "dedup of {} needs a primary key",
                source
            )));
        }
        let create = sql::create_dedup_table(source, target, columns, primary_key);
        self.replace_table("dedup", target, create).await
    }

    async fn build_derived_table(
        &self,
        source: &TableRef,
        target: &TableRef,
        columns: &[Ident],
        derived_field: &Ident,
        projections: &[DerivedProjection],
    ) -> Result<u64> {
        if projections.is_empty() {
            return Err(DbError::invalid_state(format!(
                "derived table {} needs at least one projection",
                target
            )));
        }
        let create = sql::create_derived_table(source, target, columns, derived_field, projections);
        self.replace_table("derive", target, create).await
    }

    async fn merge_column(&self, plan: &MergePlan) -> Result<u64> {
        let span = debug_span!(
            "warehouse.exec",
            op = "merge",
            table = %plan.target,
            column = %plan.tag_column(),
            duration_ms = tracing::field::Empty
        );
        async {
            let started = Instant::now();
            let mut tx = self.pool.begin().await?;
            if plan.reset_column_first {
                let cleared = sqlx::query(&sql::reset_column(&plan.target, plan.tag_column()))
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
                debug!(cleared, "tag column reset");
            }
            let merged = sqlx::query(&sql::upsert_column(plan))
                .execute(&mut *tx)
                .await?
                .rows_affected();
            tx.commit().await?;
            tracing::Span::current().record("duration_ms", started.elapsed().as_millis() as u64);
            Ok::<_, DbError>(merged)
        }
        .instrument(span)
        .await
    }

    async fn table_exists(&self, table: &TableRef) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>("SELECT to_regclass($1) IS NOT NULL")
            .bind(table.quoted())
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }
}
