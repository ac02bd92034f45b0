//! Append-only JSONL audit logs: route misses from the Event Router and
//! per-commit records from the Branch Worker.
//!
//! Adapted from a publish-operation event log that recorded one concrete
//! record type: this version is generic over the record so the Router's
//! dead-letter log and the Branch Worker's commit log share the same
//! append/read plumbing instead of each hand-rolling JSONL I/O.
//!
//! # Example
//!
//! ```
//! use reverser_events::{JsonlLog, RouteMissRecord};
//! use chrono::Utc;
//!
//! let mut log: JsonlLog<RouteMissRecord> = JsonlLog::new();
//! log.record(RouteMissRecord {
//!     timestamp: Utc::now(),
//!     namespace: Some("team-a".to_string()),
//!     name: "cm-a".to_string(),
//!     reason: "no WatchRule matched".to_string(),
//! });
//! assert_eq!(log.len(), 1);
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

pub const DEAD_LETTER_FILE: &str = "dead-letter.jsonl";
pub const COMMIT_LOG_FILE: &str = "commits.jsonl";

pub fn dead_letter_path(state_dir: &Path) -> PathBuf {
    state_dir.join(DEAD_LETTER_FILE)
}

pub fn commit_log_path(state_dir: &Path) -> PathBuf {
    state_dir.join(COMMIT_LOG_FILE)
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent)
            .with_context(|| format!("creating parent directory {} for {}", parent.display(), path.display())),
        _ => Ok(()),
    }
}

/// Append-only, in-memory-buffered JSONL log of records of type `T`.
#[derive(Debug)]
pub struct JsonlLog<T> {
    records: Vec<T>,
}

impl<T> Default for JsonlLog<T> {
    fn default() -> Self {
        Self { records: Vec::new() }
    }
}

impl<T: Serialize + DeserializeOwned> JsonlLog<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, record: T) {
        self.records.push(record);
    }

    /// Append every buffered record to `path` as one JSON object per
    /// line, without disturbing whatever is already there. The whole
    /// batch is rendered into a single buffer before the file is touched,
    /// so a serialization failure partway through never leaves a
    /// half-written line on disk.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        ensure_parent_dir(path)?;

        let mut buffer = String::new();
        for (index, record) in self.records.iter().enumerate() {
            let line = serde_json::to_string(record).with_context(|| format!("record {index} is not representable as JSON"))?;
            buffer.push_str(&line);
            buffer.push('\n');
        }

        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| f.write_all(buffer.as_bytes()))
            .with_context(|| format!("appending {} buffered record(s) to {}", self.records.len(), path.display()))
    }

    /// Load every record from `path`. A path that doesn't exist yet is
    /// treated as an empty log rather than an error — nothing has ever
    /// been appended to it.
    pub fn read_from_file(path: &Path) -> Result<Self> {
        let Ok(file) = File::open(path) else {
            return Ok(Self::new());
        };

        let mut records = Vec::new();
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("{}: line {}", path.display(), line_no + 1))?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let record = serde_json::from_str(trimmed)
                .with_context(|| format!("{}: line {} is not a valid record: {trimmed}", path.display(), line_no + 1))?;
            records.push(record);
        }
        Ok(Self { records })
    }

    pub fn all_records(&self) -> &[T] {
        &self.records
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Recorded whenever an admitted event matches no `WatchRule`: route misses
/// are logged, not silently dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteMissRecord {
    pub timestamp: DateTime<Utc>,
    pub namespace: Option<String>,
    pub name: String,
    pub reason: String,
}

/// Recorded for every commit a Branch Worker makes, so worker history can
/// be reconstructed independent of `git log` access.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub timestamp: DateTime<Utc>,
    pub target_id: String,
    pub branch: String,
    pub commit_hash: String,
    pub file_path: String,
    pub message: String,
}

pub type RouteMissLog = JsonlLog<RouteMissRecord>;
pub type CommitLog = JsonlLog<CommitRecord>;
