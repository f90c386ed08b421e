//! Remote file access through the Hadoop CLI.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::path::Path;
use std::process::Stdio;
use tagsync_db::TIMESTAMP_FORMAT;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::TransferError;

/// Access to the remote file system holding task extracts.
#[async_trait]
pub trait FileTransfer: Send + Sync {
    /// Modification time of the remote file.
    async fn remote_modified(&self, remote_path: &str) -> Result<NaiveDateTime, TransferError>;

    /// Copy the remote file into `local_dir`, keeping its file name.
    async fn fetch(&self, remote_path: &str, local_dir: &Path) -> Result<(), TransferError>;
}

/// [`FileTransfer`] that shells out to `hadoop fs`.
#[derive(Debug, Clone)]
pub struct HadoopTransfer {
    program: String,
}

impl HadoopTransfer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, TransferError> {
        let command = format!("{} {}", self.program, args.join(" "));
        debug!(command = %command, "Running hadoop command");

        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| TransferError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(TransferError::Exit {
                command,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl FileTransfer for HadoopTransfer {
    async fn remote_modified(&self, remote_path: &str) -> Result<NaiveDateTime, TransferError> {
        let stdout = self.run(&["fs", "-stat", "%y", remote_path]).await?;
        let modified = parse_remote_timestamp(&stdout)?;
        info!(path = remote_path, modified = %modified, "Remote file modification time");
        Ok(modified)
    }

    async fn fetch(&self, remote_path: &str, local_dir: &Path) -> Result<(), TransferError> {
        let local = local_dir.to_string_lossy();
        self.run(&["fs", "-get", remote_path, &local]).await?;
        info!(path = remote_path, local_dir = %local, "Fetched remote file");
        Ok(())
    }
}

/// Parse the first line of `fs -stat %y` output.
pub fn parse_remote_timestamp(stdout: &str) -> Result<NaiveDateTime, TransferError> {
    let raw = stdout.lines().next().unwrap_or("").trim();
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT).map_err(|source| {
        TransferError::Timestamp {
            raw: raw.to_string(),
            source,
        }
    })
}
