//! One tag sync task: resolve its configuration, ingest its file, merge its
//! column, and leave one audit row behind.

use chrono::NaiveDateTime;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tagsync_db::{
    connect_log_pool, connect_warehouse, DerivedFieldRule, Ident, LoadStatus, LogStore,
    PgWarehouse, SqlLogStore, SqlTaskCatalog, TableRef, TagLogRecord, TagSyncTask, TaskCatalog,
    WarehouseStore, TIMESTAMP_FORMAT,
};
use tracing::{error, info, warn};

use crate::config::TagSyncConfig;
use crate::error::{ConfigError, SyncError};
use crate::hashing::{DetailHasher, ScriptHasher};
use crate::ingest::{now, IngestAction, IngestRequest, Ingestor};
use crate::merge::{MergeEngine, MergeRequest};
use crate::transfer::{FileTransfer, HadoopTransfer};

/// Collaborators a runner works against.
#[derive(Clone)]
pub struct Services {
    pub log: Arc<dyn LogStore>,
    pub catalog: Arc<dyn TaskCatalog>,
    pub warehouse: Arc<dyn WarehouseStore>,
    pub transfer: Arc<dyn FileTransfer>,
    pub hasher: Arc<dyn DetailHasher>,
}

impl Services {
    /// Production wiring: SQL stores, PostgreSQL warehouse, Hadoop CLI.
    pub async fn connect(config: &TagSyncConfig, init_schema: bool) -> Result<Self, SyncError> {
        let tables = config.store_tables();
        let log_pool =
            connect_log_pool(&config.log_store.url, config.log_store.max_connections).await?;
        let log = SqlLogStore::new(log_pool.clone(), tables.clone());
        let catalog = SqlTaskCatalog::new(log_pool, tables);
        if init_schema {
            log.ensure_schema().await?;
            catalog.ensure_schema().await?;
            info!("Log and config tables ready");
        }

        let warehouse_pool =
            connect_warehouse(&config.warehouse.url, config.warehouse.max_connections).await?;

        Ok(Self {
            log: Arc::new(log),
            catalog: Arc::new(catalog),
            warehouse: Arc::new(PgWarehouse::new(warehouse_pool)),
            transfer: Arc::new(HadoopTransfer::new(config.transfer.hadoop_cmd.clone())),
            hasher: Arc::new(ScriptHasher::new(config.hashing.detail_script.clone())),
        })
    }
}

/// Which task to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInvocation {
    pub task_id: String,
    pub tag_name: String,
    /// Caller-supplied id linking the audit row to the caller's own log.
    pub request_id: Option<String>,
}

/// Summary of a successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub task_id: String,
    pub tag_name: String,
    pub request_id: Option<String>,
    pub file_name: String,
    pub remote_timestamp: String,
    #[serde(flatten)]
    pub action: IngestAction,
    pub merge_source: String,
    pub target: String,
    pub merged_rows: u64,
    pub elapsed_ms: u64,
}

/// What the run learned before it finished or failed.
#[derive(Debug, Default)]
struct Progress {
    file_name: Option<String>,
    remote_timestamp: Option<NaiveDateTime>,
}

/// A task's resolved configuration.
struct ResolvedTask {
    task: TagSyncTask,
    target: TableRef,
    tag: Ident,
    primary_key: Vec<Ident>,
    derived_rule: Option<DerivedFieldRule>,
}

pub struct TagSyncRunner {
    log: Arc<dyn LogStore>,
    catalog: Arc<dyn TaskCatalog>,
    ingestor: Ingestor,
    merge: MergeEngine,
}

impl TagSyncRunner {
    pub fn new(config: Arc<TagSyncConfig>, services: Services) -> Self {
        Self {
            ingestor: Ingestor::new(
                &config,
                services.log.clone(),
                services.warehouse.clone(),
                services.transfer,
                services.hasher,
            ),
            merge: MergeEngine::new(services.warehouse),
            log: services.log,
            catalog: services.catalog,
        }
    }

    /// Run one task and append exactly one audit row for it.
    pub async fn run(&self, invocation: &TaskInvocation) -> Result<SyncReport, SyncError> {
        let start_time = now();
        let started = Instant::now();
        let mut progress = Progress::default();

        info!(
            task_id = %invocation.task_id,
            tag = %invocation.tag_name,
            request_id = invocation.request_id.as_deref().unwrap_or("-"),
            "Starting tag sync"
        );

        match self.execute(invocation, &mut progress, started).await {
            Ok(report) => {
                self.log
                    .append_tag_log(&self.tag_log(
                        invocation,
                        &progress,
                        progress.remote_timestamp,
                        start_time,
                        LoadStatus::Success,
                        None,
                    ))
                    .await?;
                info!(
                    task_id = %invocation.task_id,
                    tag = %invocation.tag_name,
                    status = "success",
                    elapsed_ms = report.elapsed_ms,
                    "Tag sync finished"
                );
                Ok(report)
            }
            Err(err) => {
                error!(
                    task_id = %invocation.task_id,
                    tag = %invocation.tag_name,
                    kind = err.kind(),
                    error = %err,
                    "Tag sync failed"
                );
                let record = self.tag_log(
                    invocation,
                    &progress,
                    None,
                    start_time,
                    LoadStatus::Fail,
                    Some(err.to_string()),
                );
                if let Err(log_err) = self.log.append_tag_log(&record).await {
                    warn!(task_id = %invocation.task_id, error = %log_err, "Could not write tag log");
                }
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        invocation: &TaskInvocation,
        progress: &mut Progress,
        started: Instant,
    ) -> Result<SyncReport, SyncError> {
        let resolved = self.resolve(invocation, progress).await?;
        let task = &resolved.task;

        let request = IngestRequest {
            file_name: task.file_name.clone(),
            file_path: task.file_path.clone(),
            primary_key: resolved.primary_key.clone(),
            storage_type: task.tag_storage_type,
            derived_rule: resolved.derived_rule.clone(),
        };
        let outcome = self.ingestor.ingest(&request).await?;
        progress.remote_timestamp = Some(outcome.remote_timestamp);

        // A skipped file still merges: sibling tasks reading the same file
        // fill their own columns from the already staged table.
        let merged = self
            .merge
            .merge(&MergeRequest {
                source: outcome.merge_source.clone(),
                target: resolved.target.clone(),
                primary_key: resolved.primary_key,
                tag_name: resolved.tag,
                tag_data_type: task.tag_data_type.clone(),
                upload_method: task.upload_method,
            })
            .await;
        let merged_rows = match merged {
            Ok(rows) => rows,
            Err(err) => {
                self.ingestor
                    .record_failure(&request, outcome.remote_timestamp, err.to_string())
                    .await;
                return Err(err.into());
            }
        };

        Ok(SyncReport {
            task_id: invocation.task_id.clone(),
            tag_name: invocation.tag_name.clone(),
            request_id: invocation.request_id.clone(),
            file_name: task.file_name.clone(),
            remote_timestamp: outcome.remote_timestamp.format(TIMESTAMP_FORMAT).to_string(),
            action: outcome.action,
            merge_source: outcome.merge_source.to_string(),
            target: resolved.target.to_string(),
            merged_rows,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn resolve(
        &self,
        invocation: &TaskInvocation,
        progress: &mut Progress,
    ) -> Result<ResolvedTask, SyncError> {
        let task = self
            .catalog
            .task(&invocation.task_id, &invocation.tag_name)
            .await?
            .ok_or_else(|| ConfigError::MissingTask {
                task_id: invocation.task_id.clone(),
                tag_name: invocation.tag_name.clone(),
            })?;
        progress.file_name = Some(task.file_name.clone());

        let rule = self
            .catalog
            .primary_key(&task.target_table)
            .await?
            .filter(|rule| !rule.primary_key.is_empty())
            .ok_or_else(|| ConfigError::MissingPrimaryKey {
                table: task.target_table.clone(),
            })?;
        let primary_key = rule
            .primary_key
            .iter()
            .map(|column| Ident::parse(column))
            .collect::<Result<Vec<_>, _>>()
            .map_err(ConfigError::Identifier)?;

        let mut rules = self
            .catalog
            .derived_rules(&task.target_schema, &task.target_table, &task.file_name)
            .await?;
        if rules.len() > 1 {
            return Err(ConfigError::DuplicateDerivedRule {
                schema: task.target_schema.clone(),
                table: task.target_table.clone(),
                file_name: task.file_name.clone(),
                count: rules.len(),
            }
            .into());
        }
        let derived_rule = rules.pop();

        let target = TableRef::parse(&task.target_schema, &task.target_table)
            .map_err(ConfigError::Identifier)?;
        let tag = Ident::parse(&task.tag_name).map_err(ConfigError::Identifier)?;

        Ok(ResolvedTask {
            task,
            target,
            tag,
            primary_key,
            derived_rule,
        })
    }

    fn tag_log(
        &self,
        invocation: &TaskInvocation,
        progress: &Progress,
        remote_timestamp: Option<NaiveDateTime>,
        start_time: NaiveDateTime,
        status: LoadStatus,
        error_msg: Option<String>,
    ) -> TagLogRecord {
        TagLogRecord {
            request_id: invocation.request_id.clone(),
            task_id: invocation.task_id.clone(),
            tag_name: invocation.tag_name.clone(),
            file_name: progress.file_name.clone(),
            remote_timestamp,
            start_time,
            end_time: now(),
            status,
            error_msg,
        }
    }
}
