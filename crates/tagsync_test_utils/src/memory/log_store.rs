use async_trait::async_trait;
use std::sync::Mutex;
use tagsync_db::{
    DbError, FileLoadRecord, LoadClaim, LoadOutcome, LoadStatus, LogStore, Result, TagLogRecord,
};

use super::poison_err;

/// [`LogStore`] backed by vectors, with the SQL store's keying rules.
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    records: Mutex<Vec<FileLoadRecord>>,
    tag_logs: Mutex<Vec<TagLogRecord>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every row for a file, newest first.
    pub fn history(&self, file_name: &str) -> Vec<FileLoadRecord> {
        let mut rows: Vec<FileLoadRecord> = self
            .records
            .lock()
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.file_name == file_name)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by(|a, b| {
            (b.remote_timestamp, b.start_time).cmp(&(a.remote_timestamp, a.start_time))
        });
        rows
    }

    pub fn tag_logs(&self) -> Vec<TagLogRecord> {
        self.tag_logs
            .lock()
            .map(|logs| logs.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn append(&self, record: &FileLoadRecord) -> Result<()> {
        let mut records = self.records.lock().map_err(poison_err)?;
        if records.iter().any(|r| {
            r.file_name == record.file_name && r.remote_timestamp == record.remote_timestamp
        }) {
            return Err(DbError::duplicate(format!(
                "load row for {} @ {} already exists",
                record.file_name, record.remote_timestamp
            )));
        }
        records.push(record.clone());
        Ok(())
    }

    async fn start_or_update(&self, claim: &LoadClaim) -> Result<()> {
        let mut records = self.records.lock().map_err(poison_err)?;
        let existing = records.iter_mut().find(|r| {
            r.file_name == claim.file_name && r.remote_timestamp == claim.remote_timestamp
        });
        match existing {
            Some(row) => {
                row.start_time = claim.start_time;
                row.status = LoadStatus::Processing;
                row.end_time = None;
                row.error_msg = None;
                row.staging_schema = Some(claim.staging_schema.clone());
                row.staging_table = Some(claim.staging_table.clone());
                row.lease_expires_at = Some(claim.lease_expires_at);
            }
            None => records.push(claim.to_record()),
        }
        Ok(())
    }

    async fn finish(&self, outcome: &LoadOutcome) -> Result<()> {
        if outcome.status == LoadStatus::Processing {
            return Err(DbError::invalid_state(format!(
                "finish for {} requires a terminal status",
                outcome.file_name
            )));
        }
        let mut records = self.records.lock().map_err(poison_err)?;
        let existing = records.iter_mut().find(|r| {
            r.file_name == outcome.file_name && r.remote_timestamp == outcome.remote_timestamp
        });
        match existing {
            Some(row) => {
                row.end_time = Some(outcome.end_time);
                row.status = outcome.status;
                row.error_msg = outcome.error_msg.clone();
                row.lease_expires_at = None;
            }
            None => records.push(FileLoadRecord {
                file_name: outcome.file_name.clone(),
                file_path: outcome.file_path.clone(),
                remote_timestamp: outcome.remote_timestamp,
                start_time: outcome.start_time,
                end_time: Some(outcome.end_time),
                status: outcome.status,
                staging_schema: None,
                staging_table: None,
                error_msg: outcome.error_msg.clone(),
                lease_expires_at: None,
            }),
        }
        Ok(())
    }

    async fn latest(&self, file_name: &str) -> Result<FileLoadRecord> {
        let records = self.records.lock().map_err(poison_err)?;
        Ok(records
            .iter()
            .filter(|r| r.file_name == file_name)
            .max_by_key(|r| (r.remote_timestamp, r.start_time))
            .cloned()
            .unwrap_or_else(|| FileLoadRecord::seed(file_name)))
    }

    async fn append_tag_log(&self, record: &TagLogRecord) -> Result<()> {
        self.tag_logs
            .lock()
            .map_err(poison_err)?
            .push(record.clone());
        Ok(())
    }
}
