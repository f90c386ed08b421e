//! Store layer for TagSync.
//!
//! Two backends sit behind traits so the ingestion core can run against
//! in-memory fakes:
//!
//! - [`LogStore`] and [`TaskCatalog`]: the log/config database (SQLite by
//!   default, PostgreSQL with the `postgres` feature)
//! - [`WarehouseStore`]: staging and target tables in PostgreSQL
//!
//! # Feature Flags
//!
//! - `sqlite` (default): SQLite log/config store
//! - `postgres`: PostgreSQL log/config store (when `sqlite` is off)

#[cfg(not(any(feature = "sqlite", feature = "postgres")))]
compile_error!("tagsync_db needs either the `sqlite` or the `postgres` feature");

pub mod catalog;
pub mod error;
pub mod log_store;
pub mod pool;
pub mod sql;
pub mod types;
pub mod warehouse;

pub use catalog::{SqlTaskCatalog, TaskCatalog};
pub use error::{DbError, Result};
pub use log_store::{LogStore, SqlLogStore, StoreTables};
pub use pool::{connect_log_pool, connect_warehouse, LogPool};
pub use sql::{ColumnExpr, DerivedProjection, Ident, MergePlan, SqlType, TableRef};
pub use types::{
    epoch, DerivedFieldRule, DerivedMapping, FileLoadRecord, LoadClaim, LoadOutcome, LoadStatus,
    PrimaryKeyRule, TagDataType, TagLogRecord, TagStorageType, TagSyncTask, UploadMethod,
    TIMESTAMP_FORMAT,
};
pub use warehouse::{check_staging_width, PgWarehouse, WarehouseStore, MAX_STAGING_COLUMNS};
