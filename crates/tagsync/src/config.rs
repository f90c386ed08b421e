//! Runtime configuration, loaded once per process and shared by reference.

use crate::error::ConfigError;
use crate::ingest::WaitPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tagsync_db::{Ident, StoreTables};

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TagSyncConfig {
    #[serde(default)]
    pub log_store: LogStoreConfig,

    #[serde(default)]
    pub warehouse: WarehouseConfig,

    #[serde(default)]
    pub transfer: TransferConfig,

    #[serde(default)]
    pub hashing: HashingConfig,

    #[serde(default)]
    pub wait: WaitConfig,
}

/// Log/config database holding load logs and sync rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogStoreConfig {
    #[serde(default = "default_log_store_url")]
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_file_log_table")]
    pub file_log_table: Ident,

    #[serde(default = "default_tag_log_table")]
    pub tag_log_table: Ident,

    #[serde(default = "default_sync_rule_table")]
    pub sync_rule_table: Ident,

    #[serde(default = "default_primary_key_table")]
    pub primary_key_table: Ident,

    #[serde(default = "default_derived_rule_table")]
    pub derived_rule_table: Ident,
}

/// PostgreSQL warehouse with the staging schema and target tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseConfig {
    #[serde(default)]
    pub url: String,

    #[serde(default = "default_staging_schema")]
    pub staging_schema: Ident,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Hadoop client executable.
    #[serde(default = "default_hadoop_cmd")]
    pub hadoop_cmd: String,

    /// Directory remote files are copied into.
    #[serde(default = "default_local_dir")]
    pub local_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashingConfig {
    /// Script producing `<file>.detail` for detail-storage tasks.
    #[serde(default = "default_detail_script")]
    pub detail_script: String,
}

/// Wait-for-lock and lease tuning, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitConfig {
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_secs: u64,

    #[serde(default = "default_max_wait")]
    pub max_wait_secs: u64,

    #[serde(default = "default_lease")]
    pub lease_secs: u64,
}

fn default_log_store_url() -> String {
    let path = tagsync_logging::tagsync_home().join("tagsync.sqlite3");
    format!("sqlite:{}?mode=rwc", path.to_string_lossy())
}

fn default_max_connections() -> u32 {
    5
}

fn default_file_log_table() -> Ident {
    StoreTables::default().file_log
}

fn default_tag_log_table() -> Ident {
    StoreTables::default().tag_log
}

fn default_sync_rule_table() -> Ident {
    StoreTables::default().sync_rule
}

fn default_primary_key_table() -> Ident {
    StoreTables::default().primary_key
}

fn default_derived_rule_table() -> Ident {
    StoreTables::default().derived_rule
}

fn default_staging_schema() -> Ident {
    Ident::from_static("tmp")
}

fn default_hadoop_cmd() -> String {
    "hadoop".to_string()
}

fn default_local_dir() -> PathBuf {
    std::env::temp_dir().join("tagsync")
}

fn default_detail_script() -> String {
    "md5_detail.sh".to_string()
}

fn default_initial_backoff() -> u64 {
    30
}

fn default_max_wait() -> u64 {
    600
}

fn default_lease() -> u64 {
    3600
}

impl Default for LogStoreConfig {
    fn default() -> Self {
        Self {
            url: default_log_store_url(),
            max_connections: default_max_connections(),
            file_log_table: default_file_log_table(),
            tag_log_table: default_tag_log_table(),
            sync_rule_table: default_sync_rule_table(),
            primary_key_table: default_primary_key_table(),
            derived_rule_table: default_derived_rule_table(),
        }
    }
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            staging_schema: default_staging_schema(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            hadoop_cmd: default_hadoop_cmd(),
            local_dir: default_local_dir(),
        }
    }
}

impl Default for HashingConfig {
    fn default() -> Self {
        Self {
            detail_script: default_detail_script(),
        }
    }
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            initial_backoff_secs: default_initial_backoff(),
            max_wait_secs: default_max_wait(),
            lease_secs: default_lease(),
        }
    }
}

impl TagSyncConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: TagSyncConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Default location: `<home>/config.toml`.
    pub fn default_path() -> PathBuf {
        tagsync_logging::tagsync_home().join("config.toml")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.warehouse.url.trim().is_empty() {
            return Err(ConfigError::Invalid("warehouse.url is required".into()));
        }
        if self.log_store.url.trim().is_empty() {
            return Err(ConfigError::Invalid("log_store.url is required".into()));
        }
        if self.transfer.hadoop_cmd.trim().is_empty() {
            return Err(ConfigError::Invalid("transfer.hadoop_cmd is required".into()));
        }
        if self.wait.initial_backoff_secs == 0 {
            return Err(ConfigError::Invalid(
                "wait.initial_backoff_secs must be positive".into(),
            ));
        }
        if self.wait.lease_secs < self.wait.max_wait_secs {
            return Err(ConfigError::Invalid(format!(
                "wait.lease_secs ({}) must cover wait.max_wait_secs ({})",
                self.wait.lease_secs, self.wait.max_wait_secs
            )));
        }
        Ok(())
    }

    pub fn store_tables(&self) -> StoreTables {
        StoreTables {
            file_log: self.log_store.file_log_table.clone(),
            tag_log: self.log_store.tag_log_table.clone(),
            sync_rule: self.log_store.sync_rule_table.clone(),
            primary_key: self.log_store.primary_key_table.clone(),
            derived_rule: self.log_store.derived_rule_table.clone(),
        }
    }

    pub fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy {
            initial_backoff: Duration::from_secs(self.wait.initial_backoff_secs),
            max_wait: Duration::from_secs(self.wait.max_wait_secs),
            lease: Duration::from_secs(self.wait.lease_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = TagSyncConfig::default();
        assert_eq!(config.wait.initial_backoff_secs, 30);
        assert_eq!(config.wait.max_wait_secs, 600);
        assert_eq!(config.transfer.hadoop_cmd, "hadoop");
        assert_eq!(config.log_store.file_log_table.as_str(), "log_file");
        assert_eq!(config.store_tables(), StoreTables::default());
        // no warehouse url
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [warehouse]
            url = "postgres://etl@warehouse/dw"
            staging_schema = "TMP_stage"

            [transfer]
            local_dir = "/var/lib/tagsync/csv"

            [wait]
            initial_backoff_secs = 5
            "#
        )
        .unwrap();

        let config = TagSyncConfig::load(file.path()).unwrap();
        assert_eq!(config.warehouse.staging_schema.as_str(), "tmp_stage");
        assert_eq!(config.transfer.local_dir, PathBuf::from("/var/lib/tagsync/csv"));
        let policy = config.wait_policy();
        assert_eq!(policy.initial_backoff, Duration::from_secs(5));
        assert_eq!(policy.max_wait, Duration::from_secs(600));
    }

    #[test]
    fn test_rejects_bad_table_name() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [warehouse]
            url = "postgres://etl@warehouse/dw"

            [log_store]
            file_log_table = "log;drop table x"
            "#
        )
        .unwrap();

        assert!(matches!(
            TagSyncConfig::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_rejects_short_lease() {
        let mut config = TagSyncConfig::default();
        config.warehouse.url = "postgres://localhost/dw".into();
        config.wait.lease_secs = 60;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_missing_file() {
        let result = TagSyncConfig::load(Path::new("/nonexistent/tagsync.toml"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
