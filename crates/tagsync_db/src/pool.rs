//! Connection pools for the log store and the warehouse.
//!
//! The log/config store backend is chosen at compile time:
//!
//! - `sqlite` feature (default): `SqlitePool`
//! - `postgres` feature without `sqlite`: `PgPool`
//!
//! The warehouse is always PostgreSQL.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::error::Result;

/// Pool type backing [`crate::SqlLogStore`] and [`crate::SqlTaskCatalog`].
#[cfg(feature = "sqlite")]
pub type LogPool = sqlx::SqlitePool;

#[cfg(all(feature = "postgres", not(feature = "sqlite")))]
pub type LogPool = sqlx::PgPool;

/// Row type returned by [`LogPool`] queries.
#[cfg(feature = "sqlite")]
pub type LogRow = sqlx::sqlite::SqliteRow;

#[cfg(all(feature = "postgres", not(feature = "sqlite")))]
pub type LogRow = sqlx::postgres::PgRow;

/// Column type used for timestamps in the log store DDL.
#[cfg(feature = "sqlite")]
pub(crate) const TIMESTAMP_TYPE: &str = "TEXT";

#[cfg(all(feature = "postgres", not(feature = "sqlite")))]
pub(crate) const TIMESTAMP_TYPE: &str = "TIMESTAMP";

/// Open the log/config store pool.
///
/// `sqlite::memory:` databases are per connection, so callers should pass
/// `max_connections = 1` for them.
#[cfg(feature = "sqlite")]
pub async fn connect_log_pool(url: &str, max_connections: u32) -> Result<LogPool> {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect(url)
        .await?;

    // WAL lets concurrent invocations read the log while one writes
    sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;
    sqlx::query("PRAGMA synchronous=NORMAL")
        .execute(&pool)
        .await?;

    info!("Connected to sqlite log store");
    Ok(pool)
}

#[cfg(all(feature = "postgres", not(feature = "sqlite")))]
pub async fn connect_log_pool(url: &str, max_connections: u32) -> Result<LogPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect(url)
        .await?;

    info!("Connected to postgres log store");
    Ok(pool)
}

/// Open the warehouse pool.
pub async fn connect_warehouse(url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect(url)
        .await?;

    info!("Connected to warehouse");
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[cfg(feature = "sqlite")]
    async fn test_sqlite_log_pool() {
        let pool = connect_log_pool("sqlite::memory:", 1).await;
        assert!(pool.is_ok());
    }
}
