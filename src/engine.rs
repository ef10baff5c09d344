//! One migration pass over the three legacy tables.
//!
//! Records are handled strictly one at a time: guard, map, commit, repoint.
//! A source row the guard skips is still repointed to the personnel row it
//! resolves to, so a re-run finishes references an earlier run left behind.
//! A dry run performs the same pass inside an outer transaction that is
//! rolled back at the end, so per-record units become savepoints and the
//! store is left exactly as it was.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use sqlx::{Connection, Row, SqliteConnection, SqlitePool};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::MigrationConfig;
use crate::coordinator;
use crate::guard::{self, GuardDecision};
use crate::legacy::{SourceRecord, SourceTable};
use crate::mapper;
use crate::reader::SourceReader;
use crate::repoint::{self, RepointSummary};
use crate::runlog::{RecordOutcome, RunLog, RunLogEntry};
use crate::schema_plan;
use crate::snapshot::{self, TOUCHED_TABLES};
use crate::time::now_ms;
use crate::verify::{self, VerificationReport};
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationMode {
    #[default]
    DryRun,
    Apply,
}

impl MigrationMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            MigrationMode::DryRun => "dry_run",
            MigrationMode::Apply => "apply",
        }
    }
}

impl fmt::Display for MigrationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Stopped,
    Failed,
    RolledBack,
    /// Some records could not be undone and are still in place.
    RollbackPartial,
}

impl RunStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Stopped => "stopped",
            RunStatus::Failed => "failed",
            RunStatus::RolledBack => "rolled_back",
            RunStatus::RollbackPartial => "rollback_partial",
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "stopped" => Ok(RunStatus::Stopped),
            "failed" => Ok(RunStatus::Failed),
            "rolled_back" => Ok(RunStatus::RolledBack),
            "rollback_partial" => Ok(RunStatus::RollbackPartial),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub mode: MigrationMode,
    pub page_size: u32,
    pub snapshot_dir: PathBuf,
    pub log_dir: PathBuf,
    pub min_free_bytes: u64,
}

impl RunOptions {
    pub fn from_config(config: &MigrationConfig, db_path: &Path, mode: MigrationMode) -> Self {
        Self {
            mode,
            page_size: config.page_size,
            snapshot_dir: config.snapshot_dir_for(db_path),
            log_dir: config.log_dir_for(db_path),
            min_free_bytes: config.min_free_bytes,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableOutcome {
    pub table: Option<SourceTable>,
    pub processed: u64,
    pub migrated: u64,
    pub skipped_duplicate: u64,
    /// Skipped rows linked to a personnel row they share a code with.
    pub aliased: u64,
    pub failed: u64,
    pub references_repointed: u64,
    pub repoint_failures: u64,
    pub skills_collapsed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub mode: MigrationMode,
    pub status: RunStatus,
    pub started_at: i64,
    pub finished_at: i64,
    pub snapshot_path: Option<PathBuf>,
    pub log_path: PathBuf,
    pub tables: Vec<TableOutcome>,
    pub repointed: RepointSummary,
    pub verification: Option<VerificationReport>,
}

impl RunSummary {
    pub fn table(&self, table: SourceTable) -> Option<&TableOutcome> {
        self.tables.iter().find(|t| t.table == Some(table))
    }

    pub fn migrated(&self) -> u64 {
        self.tables.iter().map(|t| t.migrated).sum()
    }

    pub fn skipped_duplicate(&self) -> u64 {
        self.tables.iter().map(|t| t.skipped_duplicate).sum()
    }

    pub fn failed(&self) -> u64 {
        self.tables.iter().map(|t| t.failed).sum()
    }
}

/// Row of `migration_run`, as listed by `migrate runs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub mode: String,
    pub status: String,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub snapshot_path: Option<String>,
    pub log_path: Option<String>,
    pub records: i64,
}

pub fn new_run_id() -> String {
    Uuid::now_v7().to_string()
}

struct Pass<'a> {
    run_id: &'a str,
    page_size: u32,
    stop: &'a AtomicBool,
    log: &'a mut RunLog,
    tables: Vec<TableOutcome>,
    repointed: RepointSummary,
    stopped: bool,
}

impl Pass<'_> {
    async fn run(&mut self, conn: &mut SqliteConnection) -> AppResult<()> {
        for table in SourceTable::ALL {
            let mut outcome = TableOutcome {
                table: Some(table),
                ..TableOutcome::default()
            };
            let mut reader = SourceReader::new(table, self.page_size);
            'pages: loop {
                let page = reader.next_page(conn).await?;
                if page.is_empty() {
                    break;
                }
                for record in page {
                    if self.stop.load(Ordering::SeqCst) {
                        self.stopped = true;
                        break 'pages;
                    }
                    self.record(conn, &record, &mut outcome).await?;
                }
            }
            info!(
                target: "personnel_migrate",
                event = "table_done",
                run_id = self.run_id,
                table = %table,
                processed = outcome.processed,
                migrated = outcome.migrated,
                skipped_duplicate = outcome.skipped_duplicate,
                aliased = outcome.aliased,
                failed = outcome.failed,
                repoint_failures = outcome.repoint_failures
            );
            self.tables.push(outcome);
            if self.stopped {
                warn!(target: "personnel_migrate", event = "run_stop_requested", run_id = self.run_id);
                break;
            }
        }
        Ok(())
    }

    async fn record(
        &mut self,
        conn: &mut SqliteConnection,
        record: &SourceRecord,
        outcome: &mut TableOutcome,
    ) -> AppResult<()> {
        outcome.processed += 1;
        let code = record.code().map(str::to_string);

        let decision = guard::check(conn, record).await?;
        if let Some(personnel_id) = decision.personnel_id() {
            outcome.skipped_duplicate += 1;
            info!(
                target: "personnel_migrate",
                event = "record_skipped_duplicate",
                table = %record.table,
                source_id = record.id,
                personnel_id
            );
            self.log.append(RunLogEntry::Record {
                table: record.table,
                source_id: record.id,
                code,
                outcome: RecordOutcome::SkippedDuplicate,
                personnel_id: Some(personnel_id),
                reason: decision.reason().map(str::to_string),
            })?;
            if let GuardDecision::ExistingPersonnel { .. } = decision {
                coordinator::link_alias(conn, self.run_id, record, personnel_id).await?;
                outcome.aliased += 1;
            }
            return self.repoint(conn, record, personnel_id, outcome).await;
        }

        let mapped = match mapper::map(record) {
            Ok(mapped) => mapped,
            Err(err) => {
                let err = AppError::from(err);
                return self.fail(conn, record, code, "map", &err, outcome).await;
            }
        };

        let personnel_id = match coordinator::commit(conn, self.run_id, record, &mapped).await {
            Ok(id) => id,
            Err(err) => return self.fail(conn, record, code, "commit", &err, outcome).await,
        };
        outcome.migrated += 1;
        outcome.skills_collapsed += mapped.collapsed_skills as u64;
        self.log.append(RunLogEntry::Record {
            table: record.table,
            source_id: record.id,
            code,
            outcome: RecordOutcome::Migrated,
            personnel_id: Some(personnel_id),
            reason: None,
        })?;
        self.repoint(conn, record, personnel_id, outcome).await
    }

    async fn repoint(
        &mut self,
        conn: &mut SqliteConnection,
        record: &SourceRecord,
        personnel_id: i64,
        outcome: &mut TableOutcome,
    ) -> AppResult<()> {
        match repoint::repoint(conn, self.run_id, record.table, record.id, personnel_id).await {
            Ok(summary) => {
                outcome.references_repointed += summary.rows;
                self.repointed.absorb(&summary);
                repoint::resolve_reconciliation(conn, record.table, record.id).await?;
            }
            Err(err) => {
                outcome.repoint_failures += 1;
                let reason = err.to_string();
                repoint::record_reconciliation(
                    conn,
                    self.run_id,
                    record.table,
                    record.id,
                    personnel_id,
                    &reason,
                )
                .await?;
                self.log.append(RunLogEntry::Reconciliation {
                    table: record.table,
                    source_id: record.id,
                    personnel_id,
                    reason,
                })?;
            }
        }
        Ok(())
    }

    async fn fail(
        &mut self,
        conn: &mut SqliteConnection,
        record: &SourceRecord,
        code: Option<String>,
        stage: &str,
        err: &AppError,
        outcome: &mut TableOutcome,
    ) -> AppResult<()> {
        outcome.failed += 1;
        let reason = format!("{}: {}", err.code(), err.message());
        warn!(
            target: "personnel_migrate",
            event = "record_failed",
            table = %record.table,
            source_id = record.id,
            stage,
            error = %err
        );
        sqlx::query(
            "INSERT INTO migration_failure (run_id, source_table, source_id, code, stage, reason, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(self.run_id)
        .bind(record.table.table())
        .bind(record.id)
        .bind(code.as_deref())
        .bind(stage)
        .bind(&reason)
        .bind(now_ms())
        .execute(&mut *conn)
        .await
        .map_err(|e| AppError::from(e).with_context("operation", "record_failure"))?;
        self.log.append(RunLogEntry::Record {
            table: record.table,
            source_id: record.id,
            code,
            outcome: RecordOutcome::Failed,
            personnel_id: None,
            reason: Some(reason),
        })
    }
}

async fn insert_run(
    conn: &mut SqliteConnection,
    run_id: &str,
    mode: MigrationMode,
    started_at: i64,
    snapshot_path: Option<&Path>,
    log_path: &Path,
) -> AppResult<()> {
    sqlx::query(
        "INSERT INTO migration_run (run_id, mode, status, started_at, snapshot_path, log_path)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(run_id)
    .bind(mode.as_str())
    .bind(RunStatus::Running.as_str())
    .bind(started_at)
    .bind(snapshot_path.map(|p| p.display().to_string()))
    .bind(log_path.display().to_string())
    .execute(&mut *conn)
    .await
    .map_err(|err| AppError::from(err).with_context("operation", "insert_run"))?;
    Ok(())
}

async fn finish_run(
    conn: &mut SqliteConnection,
    run_id: &str,
    status: RunStatus,
    finished_at: i64,
) -> AppResult<()> {
    sqlx::query("UPDATE migration_run SET status = ?, finished_at = ? WHERE run_id = ?")
        .bind(status.as_str())
        .bind(finished_at)
        .bind(run_id)
        .execute(&mut *conn)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "finish_run"))?;
    Ok(())
}

struct PassResult {
    status: RunStatus,
    finished_at: i64,
    tables: Vec<TableOutcome>,
    repointed: RepointSummary,
    verification: VerificationReport,
}

async fn pass(
    conn: &mut SqliteConnection,
    run_id: &str,
    opts: &RunOptions,
    stop: &AtomicBool,
    log: &mut RunLog,
) -> AppResult<PassResult> {
    let mut state = Pass {
        run_id,
        page_size: opts.page_size,
        stop,
        log,
        tables: Vec::new(),
        repointed: RepointSummary::default(),
        stopped: false,
    };
    if let Err(err) = state.run(conn).await {
        error!(target: "personnel_migrate", event = "run_failed", run_id, error = %err);
        if let Err(log_err) = state.log.append(RunLogEntry::Failure { error: err.clone() }) {
            error!(target: "personnel_migrate", event = "run_log_failure_error", run_id, error = %log_err);
        }
        if let Err(mark) = finish_run(conn, run_id, RunStatus::Failed, now_ms()).await {
            error!(target: "personnel_migrate", event = "run_mark_failed_error", run_id, error = %mark);
        }
        return Err(err.with_context("run_id", run_id));
    }

    let status = if state.stopped {
        RunStatus::Stopped
    } else {
        RunStatus::Completed
    };
    let finished_at = now_ms();
    finish_run(conn, run_id, status, finished_at).await?;
    let verification = verify::verify(conn, run_id).await?;
    Ok(PassResult {
        status,
        finished_at,
        tables: state.tables,
        repointed: state.repointed,
        verification,
    })
}

/// Run one migration pass.
///
/// In apply mode the snapshot is on disk before the schema plan or any row
/// is written; a failed capture leaves the store untouched. In dry run mode
/// no snapshot is taken and every write is discarded.
pub async fn run(pool: &SqlitePool, opts: &RunOptions, stop: &AtomicBool) -> AppResult<RunSummary> {
    let mut conn = pool.acquire().await?;
    let run_id = new_run_id();
    let started_at = now_ms();
    info!(
        target: "personnel_migrate",
        event = "run_start",
        run_id = %run_id,
        mode = %opts.mode,
        page_size = opts.page_size
    );

    let (snapshot_path, log_path, result) = match opts.mode {
        MigrationMode::Apply => {
            let handle = snapshot::capture(
                &mut conn,
                &opts.snapshot_dir,
                &run_id,
                TOUCHED_TABLES,
                opts.min_free_bytes,
            )
            .await
            .map_err(|err| err.with_context("run_id", run_id.clone()))?;
            schema_plan::apply(&mut conn).await?;
            let mut log = RunLog::create(&opts.log_dir, "run", &run_id)?;
            insert_run(
                &mut conn,
                &run_id,
                opts.mode,
                started_at,
                Some(&handle.path),
                log.path(),
            )
            .await?;
            let result = pass(&mut conn, &run_id, opts, stop, &mut log).await?;
            write_tail(&mut log, &run_id, opts.mode, started_at, Some(&handle.path), &result)?;
            (Some(handle.path), log.path().to_path_buf(), result)
        }
        MigrationMode::DryRun => {
            let mut log = RunLog::create(&opts.log_dir, "dry-run", &run_id)?;
            let mut tx = conn.begin().await?;
            schema_plan::apply(&mut tx).await?;
            insert_run(&mut tx, &run_id, opts.mode, started_at, None, log.path()).await?;
            let result = pass(&mut tx, &run_id, opts, stop, &mut log).await;
            tx.rollback().await?;
            info!(target: "personnel_migrate", event = "dry_run_discarded", run_id = %run_id);
            let result = result?;
            write_tail(&mut log, &run_id, opts.mode, started_at, None, &result)?;
            (None, log.path().to_path_buf(), result)
        }
    };

    let summary = RunSummary {
        run_id: run_id.clone(),
        mode: opts.mode,
        status: result.status,
        started_at,
        finished_at: result.finished_at,
        snapshot_path,
        log_path,
        tables: result.tables,
        repointed: result.repointed,
        verification: Some(result.verification),
    };
    info!(
        target: "personnel_migrate",
        event = "run_done",
        run_id = %run_id,
        mode = %opts.mode,
        status = summary.status.as_str(),
        migrated = summary.migrated(),
        skipped_duplicate = summary.skipped_duplicate(),
        failed = summary.failed()
    );
    Ok(summary)
}

fn write_tail(
    log: &mut RunLog,
    run_id: &str,
    mode: MigrationMode,
    started_at: i64,
    snapshot_path: Option<&Path>,
    result: &PassResult,
) -> AppResult<()> {
    let summary = serde_json::json!({
        "run_id": run_id,
        "mode": mode,
        "status": result.status,
        "started_at": started_at,
        "finished_at": result.finished_at,
        "snapshot_path": snapshot_path,
        "tables": result.tables,
        "repointed": result.repointed,
    });
    log.append(RunLogEntry::Summary { summary })?;
    log.append(RunLogEntry::Verification {
        report: serde_json::to_value(&result.verification)?,
    })
}

pub async fn list_runs(conn: &mut SqliteConnection) -> AppResult<Vec<RunRecord>> {
    let rows = sqlx::query(
        "SELECT r.run_id, r.mode, r.status, r.started_at, r.finished_at, r.snapshot_path, r.log_path,
                (SELECT COUNT(*) FROM migration_record m WHERE m.run_id = r.run_id) AS records
         FROM migration_run r
         ORDER BY r.started_at, r.run_id",
    )
    .fetch_all(&mut *conn)
    .await?;
    let mut runs = Vec::with_capacity(rows.len());
    for row in rows {
        runs.push(RunRecord {
            run_id: row.try_get("run_id")?,
            mode: row.try_get("mode")?,
            status: row.try_get("status")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            snapshot_path: row.try_get("snapshot_path")?,
            log_path: row.try_get("log_path")?,
            records: row.try_get("records")?,
        });
    }
    Ok(runs)
}

pub async fn find_run(conn: &mut SqliteConnection, run_id: &str) -> AppResult<Option<RunRecord>> {
    Ok(list_runs(conn)
        .await?
        .into_iter()
        .find(|run| run.run_id == run_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dry_run_is_the_default_mode() {
        assert_eq!(MigrationMode::default(), MigrationMode::DryRun);
        assert_eq!(MigrationMode::Apply.to_string(), "apply");
    }

    #[test]
    fn run_status_round_trips_through_text() {
        for status in [
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Stopped,
            RunStatus::Failed,
            RunStatus::RolledBack,
            RunStatus::RollbackPartial,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("paused".parse::<RunStatus>().is_err());
    }

    #[test]
    fn run_ids_sort_by_creation() {
        let first = new_run_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = new_run_id();
        assert!(first < second);
    }

    #[test]
    fn options_follow_config_directories() {
        let config = MigrationConfig::default();
        let db = Path::new("/tmp/data/personnel.sqlite3");
        let opts = RunOptions::from_config(&config, db, MigrationMode::Apply);
        assert_eq!(opts.snapshot_dir, config.snapshot_dir_for(db));
        assert_eq!(opts.log_dir, config.log_dir_for(db));
        assert_eq!(opts.page_size, config.page_size);
    }
}
