//! TagSync: per-tag CSV ingestion from HDFS into wide warehouse tables.
//!
//! A run resolves one tag sync task, brings the staged copy of its source
//! file up to date, and upserts the task's single column into the target
//! table:
//!
//! - [`ingest`]: log-as-lock state machine (wait, skip, or load)
//! - [`staging`]: CSV into an all-text staging table and a dedup table
//! - [`derive`]: optional derived-field expansion
//! - [`merge`]: typed single-column upsert
//! - [`runner`]: task resolution and the per-invocation audit row
//!
//! Stores and external processes sit behind traits (`LogStore`,
//! `TaskCatalog`, `WarehouseStore`, [`transfer::FileTransfer`],
//! [`hashing::DetailHasher`]).

pub mod config;
pub mod derive;
pub mod error;
pub mod hashing;
pub mod ingest;
pub mod merge;
pub mod runner;
pub mod staging;
pub mod transfer;

pub use config::TagSyncConfig;
pub use error::{ConfigError, MergeError, StagingError, SyncError, TransferError};
pub use ingest::{IngestAction, IngestOutcome, IngestRequest, Ingestor, LoadReason, WaitPolicy};
pub use runner::{Services, SyncReport, TagSyncRunner, TaskInvocation};
