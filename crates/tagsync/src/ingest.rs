//! Per-file ingestion state machine.
//!
//! The newest file log row is the lock. A run reads it, then waits, skips, or
//! claims the file and loads it:
//!
//! ```text
//! latest row                          remote vs. row       action
//! processing, lease live              -                    wait, re-read
//! processing, lease expired           -                    load (stale lease)
//! success                             remote <= row        skip, or load
//!                                                          (missing stage) if
//!                                                          the staged table is gone
//! success                             remote >  row        load (newer remote)
//! fail / no history                   -                    load (previous failure)
//! ```

use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tagsync_db::{
    DerivedFieldRule, FileLoadRecord, Ident, LoadClaim, LoadOutcome, LoadStatus, LogStore,
    TableRef, TagStorageType, WarehouseStore,
};
use tracing::{debug, info, warn};

use crate::config::TagSyncConfig;
use crate::derive::{derived_table_name, DerivedFieldExpander};
use crate::error::{ConfigError, SyncError, TransferError};
use crate::hashing::{detail_path, DetailHasher};
use crate::staging::{staging_table_name, StagingLoader};
use crate::transfer::FileTransfer;

/// Error message written when the wait budget runs out.
pub const TIMEOUT_MESSAGE: &str = "processing timeout";

/// Why a file is being (re)loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadReason {
    /// Last attempt failed, or the file was never loaded
    PreviousFailure,
    NewerRemote,
    /// Another run's processing row outlived its lease
    StaleLease,
    /// Last load succeeded but the table the merge reads is gone
    MissingStage,
}

impl LoadReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadReason::PreviousFailure => "previous_failure",
            LoadReason::NewerRemote => "newer_remote",
            LoadReason::StaleLease => "stale_lease",
            LoadReason::MissingStage => "missing_stage",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Wait,
    Skip { last: NaiveDateTime },
    Load { reason: LoadReason },
}

/// Decide what to do given the newest log row.
pub fn transition(latest: &FileLoadRecord, remote: NaiveDateTime, now: NaiveDateTime) -> Transition {
    match latest.status {
        LoadStatus::Processing if latest.holds_lease(now) => Transition::Wait,
        LoadStatus::Processing => Transition::Load {
            reason: LoadReason::StaleLease,
        },
        LoadStatus::Success if remote <= latest.remote_timestamp => Transition::Skip {
            last: latest.remote_timestamp,
        },
        LoadStatus::Success => Transition::Load {
            reason: LoadReason::NewerRemote,
        },
        LoadStatus::Fail => Transition::Load {
            reason: LoadReason::PreviousFailure,
        },
    }
}

/// Wait-for-lock budget and lease length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub initial_backoff: Duration,
    pub max_wait: Duration,
    pub lease: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(30),
            max_wait: Duration::from_secs(600),
            lease: Duration::from_secs(3600),
        }
    }
}

impl WaitPolicy {
    pub fn backoff(&self) -> Backoff {
        Backoff {
            next: self.initial_backoff,
            remaining: self.max_wait,
        }
    }
}

/// Doubling delays, the last one trimmed so the total equals the budget.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    remaining: Duration,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining.is_zero() || self.next.is_zero() {
            return None;
        }
        let delay = self.next.min(self.remaining);
        self.remaining -= delay;
        self.next = self.next.saturating_mul(2);
        Some(delay)
    }
}

/// One file to bring up to date.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub file_name: String,
    pub file_path: String,
    pub primary_key: Vec<Ident>,
    pub storage_type: TagStorageType,
    pub derived_rule: Option<DerivedFieldRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum IngestAction {
    Skipped,
    Loaded {
        reason: LoadReason,
        rows_loaded: u64,
        dedup_rows: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    /// Remote modification time the staged tables reflect.
    pub remote_timestamp: NaiveDateTime,
    pub action: IngestAction,
    /// Table the merge reads: the derived table when a rule applies,
    /// otherwise the dedup table.
    pub merge_source: TableRef,
}

/// Resolved transition once the lock is free.
enum Turn {
    Skip { last: NaiveDateTime },
    Load { reason: LoadReason },
}

/// Tables built by a successful load.
struct Loaded {
    merge_source: TableRef,
    rows_loaded: u64,
    dedup_rows: u64,
}

pub struct Ingestor {
    log: Arc<dyn LogStore>,
    warehouse: Arc<dyn WarehouseStore>,
    transfer: Arc<dyn FileTransfer>,
    staging: StagingLoader,
    expander: DerivedFieldExpander,
    local_dir: PathBuf,
    policy: WaitPolicy,
}

impl Ingestor {
    pub fn new(
        config: &TagSyncConfig,
        log: Arc<dyn LogStore>,
        warehouse: Arc<dyn WarehouseStore>,
        transfer: Arc<dyn FileTransfer>,
        hasher: Arc<dyn DetailHasher>,
    ) -> Self {
        Self {
            log,
            transfer,
            staging: StagingLoader::new(
                warehouse.clone(),
                hasher,
                config.warehouse.staging_schema.clone(),
            ),
            expander: DerivedFieldExpander::new(warehouse.clone()),
            warehouse,
            local_dir: config.transfer.local_dir.clone(),
            policy: config.wait_policy(),
        }
    }

    /// Bring the staged copy of one remote file up to date.
    ///
    /// Skips the load when the last successful load already covers the
    /// remote version and its staged table is still there. A claim lost to a
    /// concurrent run falls back to waiting, within the same budget.
    pub async fn ingest(&self, request: &IngestRequest) -> Result<IngestOutcome, SyncError> {
        let table = staging_table_name(&request.file_name)?;
        let remote = self.transfer.remote_modified(&request.file_path).await?;
        // One wait budget covers the initial wait and any lost claim races.
        let mut backoff = self.policy.backoff();
        let (reason, start_time) = loop {
            let reason = match self.await_turn(request, remote, &mut backoff).await? {
                Turn::Skip { last } => {
                    let merge_source =
                        self.merge_source(&table, request.derived_rule.is_some())?;
                    if self.warehouse.table_exists(&merge_source).await? {
                        info!(
                            file = %request.file_name,
                            remote = %remote,
                            last = %last,
                            "Remote file unchanged since last load, skipping"
                        );
                        return Ok(IngestOutcome {
                            remote_timestamp: last,
                            action: IngestAction::Skipped,
                            merge_source,
                        });
                    }
                    info!(
                        file = %request.file_name,
                        table = %merge_source,
                        "Staged table missing, reloading unchanged file"
                    );
                    LoadReason::MissingStage
                }
                Turn::Load { reason } => reason,
            };
            match self.claim(request, &table, remote, reason).await {
                Ok(start_time) => break (reason, start_time),
                Err(SyncError::Store(err)) if err.is_duplicate() => {
                    info!(
                        file = %request.file_name,
                        remote = %remote,
                        "Another run claimed this version first"
                    );
                }
                Err(err) => return Err(err),
            }
        };
        let started = Instant::now();

        match self.load(request, &table).await {
            Ok(loaded) => {
                self.finish(request, remote, start_time, LoadStatus::Success, None)
                    .await?;
                info!(
                    file = %request.file_name,
                    reason = reason.as_str(),
                    rows = loaded.rows_loaded,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "File load succeeded"
                );
                Ok(IngestOutcome {
                    remote_timestamp: remote,
                    action: IngestAction::Loaded {
                        reason,
                        rows_loaded: loaded.rows_loaded,
                        dedup_rows: loaded.dedup_rows,
                    },
                    merge_source: loaded.merge_source,
                })
            }
            Err(err) => {
                let message = match &err {
                    SyncError::Transfer(e) => format!("transfer failed: {}", e),
                    other => other.to_string(),
                };
                warn!(file = %request.file_name, error = %message, "File load failed");
                if let Err(log_err) = self
                    .finish(request, remote, start_time, LoadStatus::Fail, Some(message))
                    .await
                {
                    warn!(file = %request.file_name, error = %log_err, "Could not record load failure");
                }
                Err(err)
            }
        }
    }

    /// Mark a loaded version failed after a later step (the merge) failed,
    /// so the next run reloads it. Write errors are logged, not returned.
    pub async fn record_failure(
        &self,
        request: &IngestRequest,
        remote: NaiveDateTime,
        error_msg: String,
    ) {
        let start_time = now();
        if let Err(err) = self
            .finish(request, remote, start_time, LoadStatus::Fail, Some(error_msg))
            .await
        {
            warn!(file = %request.file_name, error = %err, "Could not record load failure");
        }
    }

    /// Poll the log until the file is no longer locked or the budget runs out.
    async fn await_turn(
        &self,
        request: &IngestRequest,
        remote: NaiveDateTime,
        backoff: &mut Backoff,
    ) -> Result<Turn, SyncError> {
        let mut latest = self.log.latest(&request.file_name).await?;
        loop {
            match transition(&latest, remote, now()) {
                Transition::Skip { last } => return Ok(Turn::Skip { last }),
                Transition::Load { reason } => return Ok(Turn::Load { reason }),
                Transition::Wait => {}
            }
            let Some(delay) = backoff.next() else {
                warn!(
                    file = %request.file_name,
                    waited_secs = self.policy.max_wait.as_secs(),
                    "File still processing after wait budget"
                );
                let start_time = now();
                self.finish(
                    request,
                    remote,
                    start_time,
                    LoadStatus::Fail,
                    Some(TIMEOUT_MESSAGE.to_string()),
                )
                .await?;
                return Err(SyncError::Timeout {
                    file_name: request.file_name.clone(),
                    waited: self.policy.max_wait,
                });
            };
            info!(
                file = %request.file_name,
                delay_secs = delay.as_secs(),
                "File is processing elsewhere, waiting"
            );
            tokio::time::sleep(delay).await;
            latest = self.log.latest(&request.file_name).await?;
        }
    }

    async fn claim(
        &self,
        request: &IngestRequest,
        table: &Ident,
        remote: NaiveDateTime,
        reason: LoadReason,
    ) -> Result<NaiveDateTime, SyncError> {
        let start_time = now();
        let lease = chrono::Duration::from_std(self.policy.lease)
            .map_err(|_| ConfigError::Invalid("wait.lease_secs is out of range".into()))?;
        let claim = LoadClaim {
            file_name: request.file_name.clone(),
            file_path: request.file_path.clone(),
            remote_timestamp: remote,
            start_time,
            lease_expires_at: start_time + lease,
            staging_schema: self.staging.schema().to_string(),
            staging_table: table.to_string(),
        };
        match reason {
            // A fresh remote version gets its own history row; a concurrent
            // claimer of the same version fails on the key.
            LoadReason::NewerRemote => self.log.append(&claim.to_record()).await?,
            LoadReason::PreviousFailure | LoadReason::StaleLease | LoadReason::MissingStage => {
                self.log.start_or_update(&claim).await?
            }
        }
        debug!(file = %request.file_name, reason = reason.as_str(), "Claimed file");
        Ok(start_time)
    }

    async fn load(&self, request: &IngestRequest, table: &Ident) -> Result<Loaded, SyncError> {
        let local = self.local_dir.join(&request.file_name);
        tokio::fs::create_dir_all(&self.local_dir)
            .await
            .map_err(|source| TransferError::LocalCleanup {
                path: self.local_dir.clone(),
                source,
            })?;
        // A detail file left by an earlier version must not stand in for
        // this version's when hashing fails.
        for stale in [local.clone(), detail_path(&local)] {
            match tokio::fs::remove_file(&stale).await {
                Ok(()) => debug!(path = %stale.display(), "Removed stale local copy"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(TransferError::LocalCleanup {
                        path: stale,
                        source,
                    }
                    .into())
                }
            }
        }

        self.transfer
            .fetch(&request.file_path, &self.local_dir)
            .await?;

        let report = self
            .staging
            .load(table, &local, &request.primary_key, request.storage_type)
            .await?;

        let merge_source = match &request.derived_rule {
            Some(rule) => {
                self.expander
                    .expand(&report.dedup, &report.columns, rule)
                    .await?
            }
            None => report.dedup.clone(),
        };

        Ok(Loaded {
            merge_source,
            rows_loaded: report.rows_loaded,
            dedup_rows: report.dedup_rows,
        })
    }

    async fn finish(
        &self,
        request: &IngestRequest,
        remote: NaiveDateTime,
        start_time: NaiveDateTime,
        status: LoadStatus,
        error_msg: Option<String>,
    ) -> Result<(), SyncError> {
        self.log
            .finish(&LoadOutcome {
                file_name: request.file_name.clone(),
                file_path: request.file_path.clone(),
                remote_timestamp: remote,
                start_time,
                end_time: now(),
                status,
                error_msg,
            })
            .await?;
        Ok(())
    }

    fn merge_source(&self, table: &Ident, derived: bool) -> Result<TableRef, SyncError> {
        let name = if derived {
            derived_table_name(table)?
        } else {
            table.with_suffix("_dedup")?
        };
        Ok(TableRef::new(self.staging.schema().clone(), name))
    }
}

pub(crate) fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as TimeDelta;

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, tagsync_db::TIMESTAMP_FORMAT).unwrap()
    }

    fn record(status: LoadStatus, remote: &str) -> FileLoadRecord {
        FileLoadRecord {
            file_name: "sales.csv".into(),
            file_path: "/data/sales.csv".into(),
            remote_timestamp: at(remote),
            start_time: at(remote),
            end_time: None,
            status,
            staging_schema: None,
            staging_table: None,
            error_msg: None,
            lease_expires_at: None,
        }
    }

    #[test]
    fn test_transition_table() {
        let now = at("2024-03-01 12:00:00");
        let remote = at("2024-03-01 08:00:00");

        let seed = FileLoadRecord::seed("sales.csv");
        assert_eq!(
            transition(&seed, remote, now),
            Transition::Load { reason: LoadReason::PreviousFailure }
        );

        let done = record(LoadStatus::Success, "2024-03-01 08:00:00");
        assert_eq!(transition(&done, remote, now), Transition::Skip { last: remote });

        let newer = at("2024-03-01 09:00:00");
        assert_eq!(
            transition(&done, newer, now),
            Transition::Load { reason: LoadReason::NewerRemote }
        );

        let failed = record(LoadStatus::Fail, "2024-03-01 08:00:00");
        assert_eq!(
            transition(&failed, remote, now),
            Transition::Load { reason: LoadReason::PreviousFailure }
        );
    }

    #[test]
    fn test_transition_respects_lease() {
        let now = at("2024-03-01 12:00:00");
        let remote = at("2024-03-01 08:00:00");
        let mut busy = record(LoadStatus::Processing, "2024-03-01 08:00:00");

        busy.lease_expires_at = Some(now + TimeDelta::minutes(5));
        assert_eq!(transition(&busy, remote, now), Transition::Wait);

        busy.lease_expires_at = Some(now - TimeDelta::minutes(5));
        assert_eq!(
            transition(&busy, remote, now),
            Transition::Load { reason: LoadReason::StaleLease }
        );
    }

    #[test]
    fn test_backoff_sums_to_budget() {
        let delays: Vec<u64> = WaitPolicy::default().backoff().map(|d| d.as_secs()).collect();
        assert_eq!(delays, vec![30, 60, 120, 240, 150]);
        assert_eq!(delays.iter().sum::<u64>(), 600);
    }

    #[test]
    fn test_backoff_zero_budget() {
        let policy = WaitPolicy {
            max_wait: Duration::ZERO,
            ..WaitPolicy::default()
        };
        assert_eq!(policy.backoff().count(), 0);
    }

    #[test]
    fn test_ingest_action_serializes() {
        let action = IngestAction::Loaded {
            reason: LoadReason::NewerRemote,
            rows_loaded: 3,
            dedup_rows: 2,
        };
        let json = serde_json::to_value(action).unwrap();
        assert_eq!(json["action"], "loaded");
        assert_eq!(json["reason"], "newer_remote");
        assert_eq!(serde_json::to_value(IngestAction::Skipped).unwrap()["action"], "skipped");
    }
}
