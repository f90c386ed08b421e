//! Detail-file hashing for detail-storage tasks.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, warn};

/// Produces the `.detail` companion of a fetched extract.
#[async_trait]
pub trait DetailHasher: Send + Sync {
    /// Run hashing for `csv_path` and return where the detail file should be.
    ///
    /// Failures are logged, not returned; staging reports a missing file.
    async fn hash(&self, csv_path: &Path) -> PathBuf;
}

/// `<csv>.detail`
pub fn detail_path(csv_path: &Path) -> PathBuf {
    let mut name = csv_path.as_os_str().to_os_string();
    name.push(".detail");
    PathBuf::from(name)
}

/// [`DetailHasher`] running an external script in the extract's directory.
#[derive(Debug, Clone)]
pub struct ScriptHasher {
    script: String,
}

impl ScriptHasher {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
        }
    }
}

#[async_trait]
impl DetailHasher for ScriptHasher {
    async fn hash(&self, csv_path: &Path) -> PathBuf {
        let target = detail_path(csv_path);
        let Some(file_name) = csv_path.file_name() else {
            warn!(path = %csv_path.display(), "Hashing skipped: path has no file name");
            return target;
        };

        let mut cmd = Command::new(&self.script);
        cmd.arg(file_name)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        if let Some(dir) = csv_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            cmd.current_dir(dir);
        }

        match cmd.output().await {
            Ok(output) if output.status.success() => {
                info!(detail = %target.display(), "Detail file hashed");
            }
            Ok(output) => {
                warn!(
                    script = %self.script,
                    code = ?output.status.code(),
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "Hashing script failed"
                );
            }
            Err(e) => {
                warn!(script = %self.script, error = %e, "Hashing script could not be started");
            }
        }
        target
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detail_path() {
        assert_eq!(
            detail_path(Path::new("/data/csv/sales.csv")),
            PathBuf::from("/data/csv/sales.csv.detail")
        );
    }

    #[tokio::test]
    async fn test_failed_script_still_returns_detail_path() {
        let dir = tempfile::tempdir().unwrap();
        let csv = dir.path().join("sales.csv");
        std::fs::write(&csv, "id,amt\n1,2\n").unwrap();

        let hasher = ScriptHasher::new("/nonexistent/md5_detail.sh");
        let detail = hasher.hash(&csv).await;
        assert_eq!(detail, dir.path().join("sales.csv.detail"));
        assert!(!detail.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_script_runs_in_extract_directory() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("hash.sh");
        std::fs::write(&script, "#!/bin/sh\ncp \"$1\" \"$1.detail\"\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        let csv = dir.path().join("sales.csv");
        std::fs::write(&csv, "id,amt\n1,2\n").unwrap();

        let hasher = ScriptHasher::new(script.to_string_lossy());
        let detail = hasher.hash(&csv).await;
        assert_eq!(std::fs::read_to_string(detail).unwrap(), "id,amt\n1,2\n");
    }
}
