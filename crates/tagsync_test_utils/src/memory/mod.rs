//! In-memory store fakes.
//!
//! - **Single-process only**: state lives behind `std::sync::Mutex`
//! - **No persistence**: everything is lost on drop

mod catalog;
mod log_store;
mod warehouse;

pub use catalog::MemoryCatalog;
pub use log_store::MemoryLogStore;
pub use warehouse::MemoryWarehouse;

use std::sync::PoisonError;
use tagsync_db::DbError;

/// Converts a lock poison error to a store error.
fn poison_err<T>(_: PoisonError<T>) -> DbError {
    DbError::invalid_state("lock poisoned")
}
