//! Error taxonomy for a tag sync run.

use std::path::PathBuf;
use std::time::Duration;
use tagsync_db::DbError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

/// Any terminal failure of a tag sync invocation.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error("processing timeout: {file_name} still locked after {}s", .waited.as_secs())]
    Timeout { file_name: String, waited: Duration },

    #[error("log store error: {0}")]
    Store(#[from] DbError),
}

impl SyncError {
    /// Stable short label for logs and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Config(_) => "config",
            SyncError::Transfer(_) => "transfer",
            SyncError::Staging(_) => "staging",
            SyncError::Merge(_) => "merge",
            SyncError::Timeout { .. } => "timeout",
            SyncError::Store(_) => "store",
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("no sync task {task_id} for tag {tag_name}")]
    MissingTask { task_id: String, tag_name: String },

    #[error("{table} Primary key cannot be fetched.")]
    MissingPrimaryKey { table: String },

    #[error("{count} derived-field rules configured for {schema}.{table} from {file_name}; expected at most one")]
    DuplicateDerivedRule {
        schema: String,
        table: String,
        file_name: String,
        count: usize,
    },

    #[error("derived-field rule {0} has no mappings")]
    EmptyDerivedRule(String),

    #[error("invalid name: {0}")]
    Identifier(#[source] DbError),
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {}: {stderr}", .code.map_or("a signal".to_string(), |c| format!("code {}", c)))]
    Exit {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("unparseable remote modification time {raw:?}: {source}")]
    Timestamp {
        raw: String,
        #[source]
        source: chrono::ParseError,
    },

    #[error("failed to prepare local copy {}: {source}", .path.display())]
    LocalCleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error in {}: {source}", .path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("{} has no header row", .path.display())]
    MissingHeader { path: PathBuf },

    #[error("bad header column {column:?}: {source}")]
    InvalidColumn {
        column: String,
        #[source]
        source: DbError,
    },

    #[error("duplicate header column {0}")]
    DuplicateColumn(String),

    #[error("primary key column {0} missing from header")]
    MissingPrimaryKeyColumn(String),

    #[error("detail file {} not produced by hashing", .path.display())]
    DetailFileMissing { path: PathBuf },

    #[error("staging table name from {file_name}: {source}")]
    TableName {
        file_name: String,
        #[source]
        source: DbError,
    },

    #[error("CSV parse task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("warehouse error: {0}")]
    Warehouse(#[from] DbError),
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("unsupported tag data type {0:?}")]
    UnknownDataType(String),

    #[error("merge failed: {0}")]
    Warehouse(#[from] DbError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_labels() {
        let timeout = SyncError::Timeout {
            file_name: "a.csv".into(),
            waited: Duration::from_secs(600),
        };
        assert_eq!(timeout.kind(), "timeout");
        assert_eq!(timeout.to_string(), "processing timeout: a.csv still locked after 600s");

        let err: SyncError = MergeError::UnknownDataType("date".into()).into();
        assert_eq!(err.kind(), "merge");
    }

    #[test]
    fn test_exit_message() {
        let err = TransferError::Exit {
            command: "hadoop fs -get /a.csv /tmp".into(),
            code: Some(1),
            stderr: "No such file".into(),
        };
        assert_eq!(
            err.to_string(),
            "`hadoop fs -get /a.csv /tmp` exited with code 1: No such file"
        );
    }
}
