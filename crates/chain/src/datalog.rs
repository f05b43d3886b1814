//! Measurement log files.
//!
//! Space-separated records appended under the configured log directory,
//! each with a trailing unix timestamp. Writing is best-effort: a missing
//! or unwritable directory is reported once per append and never fails the
//! caller.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::error;

/// Current unix time in seconds.
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Appender for the per-shard measurement files.
#[derive(Debug, Clone, Default)]
pub struct DataLog {
    dir: Option<PathBuf>,
}

impl DataLog {
    /// Log into a directory. Records are appended to `<dir>/<name>`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
        }
    }

    /// Discard all records.
    pub fn disabled() -> Self {
        Self { dir: None }
    }

    /// Append one record; the caller supplies the columns, the trailing
    /// timestamp column is added here.
    pub fn append(&self, name: &str, columns: std::fmt::Arguments<'_>) {
        let Some(dir) = &self.dir else {
            return;
        };
        let path = dir.join(name);
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(mut file) => {
                if let Err(err) = writeln!(file, "{} {}", columns, now_unix()) {
                    error!(file = name, %err, "failed to append measurement record");
                }
            }
            Err(err) => {
                error!(file = name, %err, "can't open measurement file");
            }
        }
    }
}
