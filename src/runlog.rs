//! Append-only JSONL log of what a run did, one line per event.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::legacy::SourceTable;
use crate::time::{file_stamp, now_rfc3339};
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    Migrated,
    SkippedDuplicate,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunLogEntry {
    Record {
        table: SourceTable,
        source_id: i64,
        #[serde(default)]
        code: Option<String>,
        outcome: RecordOutcome,
        #[serde(default)]
        personnel_id: Option<i64>,
        #[serde(default)]
        reason: Option<String>,
    },
    Reconciliation {
        table: SourceTable,
        source_id: i64,
        personnel_id: i64,
        reason: String,
    },
    Summary {
        summary: serde_json::Value,
    },
    Verification {
        report: serde_json::Value,
    },
    Rollback {
        report: serde_json::Value,
    },
    /// The operation stopped with an error before it could report.
    Failure {
        error: AppError,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLogLine {
    pub at: String,
    pub run_id: String,
    #[serde(flatten)]
    pub entry: RunLogEntry,
}

pub struct RunLog {
    path: PathBuf,
    run_id: String,
    file: File,
}

pub fn run_log_file_name(prefix: &str, run_id: &str) -> String {
    format!("{prefix}-{}-{run_id}.jsonl", file_stamp(Utc::now()))
}

const MAX_NAME_ATTEMPTS: u32 = 100;

impl RunLog {
    /// Create a fresh log under `dir`. `prefix` is `run`, `dry-run` or `rollback`.
    ///
    /// An existing log is never reopened: a name already taken within the
    /// same second gets a `-<n>` suffix.
    pub fn create(dir: &Path, prefix: &str, run_id: &str) -> AppResult<Self> {
        fs::create_dir_all(dir).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "create_log_dir")
                .with_context("path", dir.display().to_string())
        })?;
        let base = run_log_file_name(prefix, run_id);
        let stem = base.trim_end_matches(".jsonl");
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let path = if attempt == 0 {
                dir.join(&base)
            } else {
                dir.join(format!("{stem}-{attempt}.jsonl"))
            };
            match OpenOptions::new().create_new(true).append(true).open(&path) {
                Ok(file) => {
                    return Ok(Self {
                        path,
                        run_id: run_id.to_string(),
                        file,
                    })
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(AppError::from(err)
                        .with_context("operation", "create_run_log")
                        .with_context("path", path.display().to_string()))
                }
            }
        }
        Err(AppError::new(
            "RUNLOG/NAME_TAKEN",
            "Could not find a free run log file name",
        )
        .with_context("path", dir.join(base).display().to_string()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, entry: RunLogEntry) -> AppResult<()> {
        let line = RunLogLine {
            at: now_rfc3339(),
            run_id: self.run_id.clone(),
            entry,
        };
        let mut bytes = serde_json::to_vec(&line)?;
        bytes.push(b'\n');
        self.file
            .write_all(&bytes)
            .and_then(|_| self.file.sync_data())
            .map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "append_run_log")
                    .with_context("path", self.path.display().to_string())
            })
    }
}

pub fn read(path: &Path) -> AppResult<Vec<RunLogLine>> {
    let file = File::open(path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "open_run_log")
            .with_context("path", path.display().to_string())
    })?;
    let mut lines = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        lines.push(serde_json::from_str(&line)?);
    }
    Ok(lines)
}
