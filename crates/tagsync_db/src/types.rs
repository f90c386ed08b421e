//! Record and configuration types shared by the stores.

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Format used for remote modification times and log timestamps.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Timestamp assigned to a file that has never been loaded.
pub fn epoch() -> NaiveDateTime {
    DateTime::from_timestamp(0, 0)
        .map(|dt| dt.naive_utc())
        .unwrap_or(NaiveDateTime::MIN)
}

/// Status of one file load attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadStatus {
    /// Load in flight; doubles as the per-file lock
    Processing,
    Success,
    Fail,
}

impl LoadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadStatus::Processing => "processing",
            LoadStatus::Success => "success",
            LoadStatus::Fail => "fail",
        }
    }
}

impl fmt::Display for LoadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for LoadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "processing" => Ok(LoadStatus::Processing),
            "success" => Ok(LoadStatus::Success),
            "fail" | "failed" => Ok(LoadStatus::Fail),
            _ => Err(format!("Invalid load status: '{}'", s)),
        }
    }
}

/// One row of the file load log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLoadRecord {
    pub file_name: String,
    pub file_path: String,
    /// Modification time of the remote file this attempt loaded.
    pub remote_timestamp: NaiveDateTime,
    pub start_time: NaiveDateTime,
    pub end_time: Option<NaiveDateTime>,
    pub status: LoadStatus,
    pub staging_schema: Option<String>,
    pub staging_table: Option<String>,
    pub error_msg: Option<String>,
    /// Processing rows past this instant are treated as abandoned.
    pub lease_expires_at: Option<NaiveDateTime>,
}

impl FileLoadRecord {
    /// Synthetic record returned for files with no history.
    pub fn seed(file_name: &str) -> Self {
        Self {
            file_name: file_name.to_string(),
            file_path: String::new(),
            remote_timestamp: epoch(),
            start_time: epoch(),
            end_time: None,
            status: LoadStatus::Fail,
            staging_schema: None,
            staging_table: None,
            error_msg: None,
            lease_expires_at: None,
        }
    }

    pub fn is_seed(&self) -> bool {
        self.file_path.is_empty() && self.remote_timestamp == epoch()
    }

    /// True while the row is processing and its lease has not run out.
    pub fn holds_lease(&self, now: NaiveDateTime) -> bool {
        self.status == LoadStatus::Processing
            && self.lease_expires_at.map_or(true, |expires| expires > now)
    }
}

/// Payload written when an invocation takes the processing lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadClaim {
    pub file_name: String,
    pub file_path: String,
    pub remote_timestamp: NaiveDateTime,
    pub start_time: NaiveDateTime,
    pub lease_expires_at: NaiveDateTime,
    pub staging_schema: String,
    pub staging_table: String,
}

impl LoadClaim {
    /// The processing row this claim produces.
    pub fn to_record(&self) -> FileLoadRecord {
        FileLoadRecord {
            file_name: self.file_name.clone(),
            file_path: self.file_path.clone(),
            remote_timestamp: self.remote_timestamp,
            start_time: self.start_time,
            end_time: None,
            status: LoadStatus::Processing,
            staging_schema: Some(self.staging_schema.clone()),
            staging_table: Some(self.staging_table.clone()),
            error_msg: None,
            lease_expires_at: Some(self.lease_expires_at),
        }
    }
}

/// Terminal write for a load attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOutcome {
    pub file_name: String,
    pub file_path: String,
    pub remote_timestamp: NaiveDateTime,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub status: LoadStatus,
    pub error_msg: Option<String>,
}

/// Audit row written once per task invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagLogRecord {
    pub request_id: Option<String>,
    pub task_id: String,
    pub tag_name: String,
    pub file_name: Option<String>,
    pub remote_timestamp: Option<NaiveDateTime>,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub status: LoadStatus,
    pub error_msg: Option<String>,
}

/// Declared type of a tag column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagDataType {
    String,
    Numeric,
    Bool,
    Enum,
}

impl TagDataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TagDataType::String => "string",
            TagDataType::Numeric => "numeric",
            TagDataType::Bool => "bool",
            TagDataType::Enum => "enum",
        }
    }
}

impl fmt::Display for TagDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TagDataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "string" => Ok(TagDataType::String),
            "numeric" => Ok(TagDataType::Numeric),
            "bool" => Ok(TagDataType::Bool),
            "enum" => Ok(TagDataType::Enum),
            _ => Err(format!(
                "Invalid tag data type: '{}'. Expected: string, numeric, bool, or enum",
                s
            )),
        }
    }
}

/// How the extract is stored before staging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagStorageType {
    /// Staged from the hashed `.detail` companion file
    Detail,
    Tag,
}

impl TagStorageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TagStorageType::Detail => "detail",
            TagStorageType::Tag => "tag",
        }
    }
}

impl fmt::Display for TagStorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TagStorageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "detail" => Ok(TagStorageType::Detail),
            "tag" => Ok(TagStorageType::Tag),
            _ => Err(format!("Invalid tag storage type: '{}'. Expected: detail or tag", s)),
        }
    }
}

/// Whether a merge keeps values for keys missing from the new extract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadMethod {
    Incremental,
    /// Null the tag column for every row before merging
    Full,
}

impl UploadMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadMethod::Incremental => "incremental",
            UploadMethod::Full => "full",
        }
    }
}

impl fmt::Display for UploadMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for UploadMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "incremental" | "increment" => Ok(UploadMethod::Incremental),
            "full" => Ok(UploadMethod::Full),
            _ => Err(format!(
                "Invalid upload method: '{}'. Expected: incremental or full",
                s
            )),
        }
    }
}

/// One configured tag sync task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagSyncTask {
    pub task_id: String,
    pub tag_name: String,
    pub file_name: String,
    pub file_path: String,
    pub target_schema: String,
    pub target_table: String,
    /// Kept verbatim; an unsupported value fails the merge, not the lookup.
    pub tag_data_type: String,
    pub tag_storage_type: TagStorageType,
    pub upload_method: UploadMethod,
}

/// Primary key columns of a target table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryKeyRule {
    pub table_name: String,
    pub primary_key: Vec<String>,
}

impl PrimaryKeyRule {
    /// Build from the comma separated form stored in the catalog.
    pub fn from_list(table_name: impl Into<String>, list: &str) -> Self {
        Self {
            table_name: table_name.into(),
            primary_key: list
                .split(',')
                .map(str::trim)
                .filter(|col| !col.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }
}

/// One source value to tag mapping of a derived-field rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedMapping {
    pub source_column: String,
    pub derived_value: String,
    pub tag_name: String,
}

/// Expands one staged row into tagged rows keyed on column values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedFieldRule {
    pub rule_id: String,
    pub derived_field: String,
    pub mappings: Vec<DerivedMapping>,
}
