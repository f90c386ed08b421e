//! Test harness for TagSync integration tests.
//!
//! Wires a [`TagSyncRunner`] or [`Ingestor`] to the in-memory stores plus a
//! fake HDFS and a fake hashing script, all rooted in a temp directory.
//!
//! # Example
//!
//! ```ignore
//! let harness = TestHarness::new();
//! harness.transfer.put("/hdfs/sales.csv", "2024-03-01 08:00:00", "id,amt\n1,10\n");
//! let runner = harness.runner(catalog);
//! let report = runner.run(&invocation("t1", "amt")).await?;
//! ```

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tagsync::hashing::{detail_path, DetailHasher};
use tagsync::transfer::FileTransfer;
use tagsync::{Ingestor, Services, TagSyncConfig, TagSyncRunner, TaskInvocation, TransferError};
use tagsync_db::{
    FileLoadRecord, LoadStatus, TableRef, TagStorageType, TagSyncTask, UploadMethod,
    TIMESTAMP_FORMAT,
};
use tagsync_test_utils::{MemoryCatalog, MemoryLogStore, MemoryWarehouse};
use tempfile::TempDir;

pub fn at(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).unwrap()
}

pub fn wall_clock() -> NaiveDateTime {
    Local::now().naive_local()
}

struct RemoteFile {
    modified: NaiveDateTime,
    content: String,
}

/// In-memory HDFS. `fetch` writes the file under its base name.
#[derive(Default)]
pub struct FakeTransfer {
    files: Mutex<HashMap<String, RemoteFile>>,
    fail_fetch: AtomicBool,
    fetches: AtomicUsize,
}

impl FakeTransfer {
    pub fn put(&self, remote_path: &str, modified: &str, content: &str) {
        self.files.lock().unwrap().insert(
            remote_path.to_string(),
            RemoteFile {
                modified: at(modified),
                content: content.to_string(),
            },
        );
    }

    pub fn fail_fetches(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FileTransfer for FakeTransfer {
    async fn remote_modified(&self, remote_path: &str) -> Result<NaiveDateTime, TransferError> {
        self.files
            .lock()
            .unwrap()
            .get(remote_path)
            .map(|f| f.modified)
            .ok_or_else(|| TransferError::Exit {
                command: format!("hadoop fs -stat %y {}", remote_path),
                code: Some(1),
                stderr: format!("stat: `{}': No such file or directory", remote_path),
            })
    }

    async fn fetch(&self, remote_path: &str, local_dir: &Path) -> Result<(), TransferError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let command = format!("hadoop fs -get {} {}", remote_path, local_dir.display());
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(TransferError::Exit {
                command,
                code: Some(255),
                stderr: "get: Connection refused".into(),
            });
        }
        let content = self
            .files
            .lock()
            .unwrap()
            .get(remote_path)
            .map(|f| f.content.clone())
            .ok_or_else(|| TransferError::Exit {
                command: command.clone(),
                code: Some(1),
                stderr: "No such file or directory".into(),
            })?;
        let name = Path::new(remote_path).file_name().unwrap();
        std::fs::write(local_dir.join(name), content).unwrap();
        Ok(())
    }
}

/// Writes `<csv>.detail` with a `row_hash` column, unless told to fail.
#[derive(Default)]
pub struct FakeHasher {
    fail: AtomicBool,
}

impl FakeHasher {
    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DetailHasher for FakeHasher {
    async fn hash(&self, csv_path: &Path) -> PathBuf {
        let target = detail_path(csv_path);
        if self.fail.load(Ordering::SeqCst) {
            return target;
        }
        let text = std::fs::read_to_string(csv_path).unwrap();
        let detail: Vec<String> = text
            .lines()
            .enumerate()
            .map(|(i, line)| {
                if i == 0 {
                    format!("{},row_hash", line)
                } else {
                    format!("{},h{}", line, i)
                }
            })
            .collect();
        std::fs::write(&target, detail.join("\n") + "\n").unwrap();
        target
    }
}

pub struct TestHarness {
    pub dir: TempDir,
    pub config: Arc<TagSyncConfig>,
    pub log: Arc<MemoryLogStore>,
    pub warehouse: Arc<MemoryWarehouse>,
    pub transfer: Arc<FakeTransfer>,
    pub hasher: Arc<FakeHasher>,
}

impl TestHarness {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = TagSyncConfig::default();
        config.warehouse.url = "postgres://tagsync@localhost/unused".into();
        config.transfer.local_dir = dir.path().join("csv");
        config.validate().unwrap();

        Self {
            dir,
            config: Arc::new(config),
            log: Arc::new(MemoryLogStore::new()),
            warehouse: Arc::new(MemoryWarehouse::new()),
            transfer: Arc::new(FakeTransfer::default()),
            hasher: Arc::new(FakeHasher::default()),
        }
    }

    pub fn services(&self, catalog: MemoryCatalog) -> Services {
        Services {
            log: self.log.clone(),
            catalog: Arc::new(catalog),
            warehouse: self.warehouse.clone(),
            transfer: self.transfer.clone(),
            hasher: self.hasher.clone(),
        }
    }

    pub fn runner(&self, catalog: MemoryCatalog) -> TagSyncRunner {
        TagSyncRunner::new(self.config.clone(), self.services(catalog))
    }

    pub fn ingestor(&self) -> Ingestor {
        Ingestor::new(
            &self.config,
            self.log.clone(),
            self.warehouse.clone(),
            self.transfer.clone(),
            self.hasher.clone(),
        )
    }

    pub fn local_copy(&self, file_name: &str) -> PathBuf {
        self.config.transfer.local_dir.join(file_name)
    }

    /// Newest file log row.
    pub fn latest(&self, file_name: &str) -> FileLoadRecord {
        self.log
            .history(file_name)
            .into_iter()
            .next()
            .unwrap_or_else(|| FileLoadRecord::seed(file_name))
    }
}

/// A processing row for `file_name` holding a lease until `lease_expires_at`.
pub fn processing_row(
    file_name: &str,
    remote: &str,
    lease_expires_at: NaiveDateTime,
) -> FileLoadRecord {
    FileLoadRecord {
        file_name: file_name.to_string(),
        file_path: format!("/hdfs/{}", file_name),
        remote_timestamp: at(remote),
        start_time: wall_clock(),
        end_time: None,
        status: LoadStatus::Processing,
        staging_schema: Some("tmp".into()),
        staging_table: None,
        error_msg: None,
        lease_expires_at: Some(lease_expires_at),
    }
}

pub fn task(task_id: &str, tag_name: &str, file_name: &str, tag_data_type: &str) -> TagSyncTask {
    TagSyncTask {
        task_id: task_id.to_string(),
        tag_name: tag_name.to_string(),
        file_name: file_name.to_string(),
        file_path: format!("/hdfs/{}", file_name),
        target_schema: "dw".into(),
        target_table: "wide".into(),
        tag_data_type: tag_data_type.to_string(),
        tag_storage_type: TagStorageType::Tag,
        upload_method: UploadMethod::Incremental,
    }
}

pub fn invocation(task_id: &str, tag_name: &str) -> TaskInvocation {
    TaskInvocation {
        task_id: task_id.to_string(),
        tag_name: tag_name.to_string(),
        request_id: Some(format!("req-{}", task_id)),
    }
}

pub fn wide() -> TableRef {
    TableRef::parse("dw", "wide").unwrap()
}
