//! Per-test schema isolation.

use anyhow::Result;
use sqlx::PgPool;
use tagsync_db::Ident;
use tracing::{debug, warn};
use uuid::Uuid;

/// RAII guard owning a uniquely named schema, dropped with CASCADE on Drop.
///
/// Warehouse statements are always schema-qualified, so tests point both the
/// staging schema and target tables at [`PgSchemaGuard::schema`].
pub struct PgSchemaGuard {
    pool: PgPool,
    schema: Ident,
}

impl PgSchemaGuard {
    pub async fn new(pool: PgPool) -> Result<Self> {
        let schema = Ident::parse(&format!("test_{}", Uuid::new_v4().simple()))?;
        debug!("Creating test schema: {}", schema);

        sqlx::query(&format!("CREATE SCHEMA {}", schema.quoted()))
            .execute(&pool)
            .await?;

        Ok(Self { pool, schema })
    }

    pub fn schema(&self) -> &Ident {
        &self.schema
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Execute a statement; unqualified names resolve in the test schema.
    pub async fn execute(&self, query: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("SET LOCAL search_path TO {}", self.schema.quoted()))
            .execute(&mut *tx)
            .await?;
        sqlx::query(query).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn fetch_all(&self, query: &str) -> Result<Vec<sqlx::postgres::PgRow>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("SET LOCAL search_path TO {}", self.schema.quoted()))
            .execute(&mut *tx)
            .await?;
        let rows = sqlx::query(query).fetch_all(&mut *tx).await?;
        tx.commit().await?;
        Ok(rows)
    }
}

impl Drop for PgSchemaGuard {
    fn drop(&mut self) {
        let pool = self.pool.clone();
        let schema = self.schema.clone();

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let drop_sql = format!("DROP SCHEMA IF EXISTS {} CASCADE", schema.quoted());
                if let Err(e) = sqlx::query(&drop_sql).execute(&pool).await {
                    warn!("Failed to drop test schema {}: {}", schema, e);
                } else {
                    debug!("Dropped test schema: {}", schema);
                }
            });
        } else {
            warn!("Not in async context, cannot cleanup schema: {}", self.schema);
        }
    }
}
