//! Shared logging setup for TagSync binaries.
//!
//! Every run writes to a size-capped log file under the TagSync home
//! directory and mirrors to stderr.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "tagsync=info,tagsync_db=info";
const VERBOSE_LOG_FILTER: &str = "tagsync=debug,tagsync_db=debug";
const KEEP_FILES: usize = 5;
const MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;

/// Logging options for one binary.
pub struct LogConfig<'a> {
    /// Base name of the log file.
    pub app_name: &'a str,
    /// Debug output on stderr regardless of `RUST_LOG`.
    pub verbose: bool,
}

/// Install the global subscriber: rotating file plus stderr.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let dir = ensure_logs_dir()?;
    let writer = RotatingWriter::open(&dir, config.app_name, KEEP_FILES, MAX_FILE_BYTES)
        .with_context(|| format!("Failed to open log file for {}", config.app_name))?;

    let file_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let stderr_filter = if config.verbose {
        EnvFilter::new(VERBOSE_LOG_FILTER)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_filter(stderr_filter),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(())
}

/// TagSync home: `$TAGSYNC_HOME` or `~/.tagsync`.
pub fn tagsync_home() -> PathBuf {
    if let Ok(path) = std::env::var("TAGSYNC_HOME") {
        return PathBuf::from(path);
    }
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".tagsync")
}

/// `<home>/logs`
pub fn logs_dir() -> PathBuf {
    tagsync_home().join("logs")
}

pub fn ensure_logs_dir() -> Result<PathBuf> {
    let dir = logs_dir();
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create logs directory: {}", dir.display()))?;
    Ok(dir)
}

/// Size-rotated log file: `<name>.log`, `<name>.log.1`, ... `<name>.log.<keep-1>`.
struct RotatingFile {
    base: PathBuf,
    keep: usize,
    max_bytes: u64,
    file: File,
    written: u64,
}

impl RotatingFile {
    fn open(dir: &Path, name: &str, keep: usize, max_bytes: u64) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let base = dir.join(format!("{}.log", file_stem(name)));
        let file = OpenOptions::new().create(true).append(true).open(&base)?;
        let written = file.metadata()?.len();
        let mut rotating = Self {
            base,
            keep: keep.max(1),
            max_bytes,
            file,
            written,
        };
        if rotating.written > rotating.max_bytes {
            rotating.rotate()?;
        }
        Ok(rotating)
    }

    fn numbered(&self, n: usize) -> PathBuf {
        let mut name = self.base.clone().into_os_string();
        name.push(format!(".{}", n));
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        if self.keep > 1 {
            let oldest = self.numbered(self.keep - 1);
            if oldest.exists() {
                fs::remove_file(&oldest)?;
            }
            for n in (1..self.keep - 1).rev() {
                let from = self.numbered(n);
                if from.exists() {
                    fs::rename(&from, self.numbered(n + 1))?;
                }
            }
            fs::rename(&self.base, self.numbered(1))?;
        }
        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(self.keep == 1)
            .append(self.keep > 1)
            .open(&self.base)?;
        self.written = 0;
        Ok(())
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_bytes {
            self.rotate()?;
        }
        self.file.write_all(buf)?;
        self.written += buf.len() as u64;
        Ok(())
    }
}

/// Cloneable handle handed to `fmt::layer().with_writer`.
#[derive(Clone)]
struct RotatingWriter(Arc<Mutex<RotatingFile>>);

impl RotatingWriter {
    fn open(dir: &Path, name: &str, keep: usize, max_bytes: u64) -> io::Result<Self> {
        Ok(Self(Arc::new(Mutex::new(RotatingFile::open(
            dir, name, keep, max_bytes,
        )?))))
    }

    fn lock(&self) -> io::Result<MutexGuard<'_, RotatingFile>> {
        self.0
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))
    }
}

impl Write for RotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock()?.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock()?.file.flush()
    }
}

impl<'a> MakeWriter<'a> for RotatingWriter {
    type Writer = RotatingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn file_stem(name: &str) -> String {
    name.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_stem_replaces_separators() {
        assert_eq!(file_stem("tag sync/../x"), "tag_sync____x");
    }

    #[test]
    fn test_rotation_keeps_bounded_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = RotatingWriter::open(dir.path(), "tagsync", 3, 16).unwrap();
        for _ in 0..10 {
            writer.write_all(b"0123456789abcdef").unwrap();
        }
        writer.flush().unwrap();

        assert!(dir.path().join("tagsync.log").exists());
        assert!(dir.path().join("tagsync.log.1").exists());
        assert!(dir.path().join("tagsync.log.2").exists());
        assert!(!dir.path().join("tagsync.log.3").exists());
        let current = fs::read(dir.path().join("tagsync.log")).unwrap();
        assert_eq!(current.len(), 16);
    }
}
