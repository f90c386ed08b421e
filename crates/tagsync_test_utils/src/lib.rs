//! TagSync Test Utilities
//!
//! In-memory implementations of the store traits for fast orchestration
//! tests, plus PostgreSQL helpers for warehouse tests.
//!
//! # Features
//!
//! - `docker-tests`: Enable tests that need a running PostgreSQL
//!
//! # Usage
//!
//! ```rust,ignore
//! use tagsync_test_utils::{MemoryCatalog, MemoryLogStore, MemoryWarehouse};
//!
//! let log = MemoryLogStore::new();
//! let warehouse = MemoryWarehouse::new();
//! warehouse.create_target(&target, &["id"], &["amt"]);
//! ```

pub mod cleanup;
pub mod memory;
pub mod pools;

pub use cleanup::PgSchemaGuard;
pub use memory::{MemoryCatalog, MemoryLogStore, MemoryWarehouse};
pub use pools::TestPgPool;
