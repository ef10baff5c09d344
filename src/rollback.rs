//! Compensation for an applied run.
//!
//! Every migration record tagged with the run is undone as its own atomic
//! unit: dependent rows go back to the value recorded before the repoint,
//! the personnel row is deleted (detail and skill rows cascade) and the
//! bookkeeping rows are removed. An alias record only gives back its
//! repoints; the personnel row it points at belongs to another record.
//! Legacy tables are never written.

use serde::{Deserialize, Serialize};
use sqlx::{Connection, Row, SqliteConnection};
use tracing::{info, warn};

use crate::coordinator::RecordKind;
use crate::engine::RunStatus;
use crate::legacy::DEPENDENT_TABLES;
use crate::time::now_ms;
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReport {
    pub run_id: String,
    pub records: u64,
    pub personnel_deleted: u64,
    pub aliases_removed: u64,
    pub references_restored: u64,
    pub missing_personnel: Vec<RollbackSkip>,
    pub failed: Vec<RollbackSkip>,
}

impl RollbackReport {
    /// `rollback_partial` while any record is still in place.
    pub fn status(&self) -> RunStatus {
        if self.failed.is_empty() {
            RunStatus::RolledBack
        } else {
            RunStatus::RollbackPartial
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackSkip {
    pub source_table: String,
    pub source_id: i64,
    pub personnel_id: i64,
    pub reason: String,
}

struct RecordRow {
    id: i64,
    source_table: String,
    source_id: i64,
    personnel_id: i64,
    kind: RecordKind,
}

enum Undone {
    Deleted { restored: u64 },
    Unaliased { restored: u64 },
    PersonnelMissing,
}

pub async fn run_exists(conn: &mut SqliteConnection, run_id: &str) -> AppResult<bool> {
    let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM migration_run WHERE run_id = ?")
        .bind(run_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(found.is_some())
}

async fn records_for(conn: &mut SqliteConnection, run_id: &str) -> AppResult<Vec<RecordRow>> {
    let rows = sqlx::query(
        "SELECT id, source_table, source_id, personnel_id, kind FROM migration_record
         WHERE run_id = ? ORDER BY id DESC",
    )
    .bind(run_id)
    .fetch_all(&mut *conn)
    .await?;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let kind: String = row.try_get("kind")?;
        out.push(RecordRow {
            id: row.try_get("id")?,
            source_table: row.try_get("source_table")?,
            source_id: row.try_get("source_id")?,
            personnel_id: row.try_get("personnel_id")?,
            kind: kind.parse()?,
        });
    }
    Ok(out)
}

/// Put each repointed dependent row back to its recorded previous value.
/// Rows changed since the repoint are left alone.
async fn restore_repoints(
    conn: &mut SqliteConnection,
    repoints: &[sqlx::sqlite::SqliteRow],
    personnel_id: i64,
) -> AppResult<u64> {
    let mut restored = 0u64;
    for row in repoints {
        let dependent: String = row.try_get("dependent_table")?;
        let dependent_id: i64 = row.try_get("dependent_id")?;
        let previous: Option<i64> = row.try_get("previous_personnel_id")?;
        if !DEPENDENT_TABLES.contains(&dependent.as_str()) {
            return Err(AppError::new(
                "ROLLBACK/UNKNOWN_DEPENDENT",
                "Repoint bookkeeping names a table outside the dependent set",
            )
            .with_context("dependent_table", dependent));
        }
        let sql =
            format!("UPDATE {dependent} SET personnel_id = ? WHERE id = ? AND personnel_id = ?");
        let done = sqlx::query(&sql)
            .bind(previous)
            .bind(dependent_id)
            .bind(personnel_id)
            .execute(&mut *conn)
            .await
            .map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "restore_reference")
                    .with_context("dependent_table", dependent.clone())
                    .with_context("dependent_id", dependent_id.to_string())
            })?;
        restored += done.rows_affected();
    }
    Ok(restored)
}

async fn undo_record(conn: &mut SqliteConnection, record: &RecordRow) -> AppResult<Undone> {
    let mut tx = conn.begin().await?;

    let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM ses_personnel WHERE id = ?")
        .bind(record.personnel_id)
        .fetch_optional(&mut *tx)
        .await?;

    let undone = match record.kind {
        RecordKind::Alias => {
            let repoints = sqlx::query(
                "SELECT dependent_table, dependent_id, previous_personnel_id FROM migration_repoint
                 WHERE source_table = ? AND source_id = ? AND personnel_id = ?
                 ORDER BY id DESC",
            )
            .bind(&record.source_table)
            .bind(record.source_id)
            .bind(record.personnel_id)
            .fetch_all(&mut *tx)
            .await?;
            let restored = restore_repoints(&mut *tx, &repoints, record.personnel_id).await?;
            sqlx::query(
                "DELETE FROM migration_repoint WHERE source_table = ? AND source_id = ? AND personnel_id = ?",
            )
            .bind(&record.source_table)
            .bind(record.source_id)
            .bind(record.personnel_id)
            .execute(&mut *tx)
            .await?;
            Undone::Unaliased { restored }
        }
        RecordKind::Migrated => {
            // Aliases of this personnel row, from any run, lose their target too.
            let repoints = sqlx::query(
                "SELECT dependent_table, dependent_id, previous_personnel_id FROM migration_repoint
                 WHERE personnel_id = ? ORDER BY id DESC",
            )
            .bind(record.personnel_id)
            .fetch_all(&mut *tx)
            .await?;
            let restored = match exists {
                Some(_) => restore_repoints(&mut *tx, &repoints, record.personnel_id).await?,
                None => 0,
            };
            if exists.is_some() {
                sqlx::query("DELETE FROM ses_personnel WHERE id = ?")
                    .bind(record.personnel_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|err| {
                        AppError::from(err).with_context("operation", "delete_personnel")
                    })?;
            }
            sqlx::query("DELETE FROM migration_repoint WHERE personnel_id = ?")
                .bind(record.personnel_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM migration_record WHERE personnel_id = ? AND kind = 'alias'")
                .bind(record.personnel_id)
                .execute(&mut *tx)
                .await?;
            match exists {
                Some(_) => Undone::Deleted { restored },
                None => Undone::PersonnelMissing,
            }
        }
    };

    sqlx::query("DELETE FROM migration_reconciliation WHERE source_table = ? AND source_id = ?")
        .bind(&record.source_table)
        .bind(record.source_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM migration_record WHERE id = ?")
        .bind(record.id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(undone)
}

/// Undo everything `run_id` committed. Records that cannot be undone are
/// reported and left in place with their bookkeeping, the rest of the run
/// still rolls back and the run is marked `rollback_partial`. Rolling back
/// again retries what is left.
pub async fn rollback(conn: &mut SqliteConnection, run_id: &str) -> AppResult<RollbackReport> {
    if !run_exists(conn, run_id).await? {
        return Err(AppError::new("ROLLBACK/UNKNOWN_RUN", "No migration run with this id")
            .with_context("run_id", run_id));
    }
    info!(target: "personnel_migrate", event = "rollback_start", run_id);

    let mut report = RollbackReport {
        run_id: run_id.to_string(),
        ..RollbackReport::default()
    };
    for record in records_for(conn, run_id).await? {
        // Removed along with the personnel row of an earlier record.
        let still_there: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM migration_record WHERE id = ?")
                .bind(record.id)
                .fetch_optional(&mut *conn)
                .await?;
        if still_there.is_none() {
            continue;
        }
        report.records += 1;
        match undo_record(conn, &record).await {
            Ok(Undone::Deleted { restored }) => {
                report.personnel_deleted += 1;
                report.references_restored += restored;
            }
            Ok(Undone::Unaliased { restored }) => {
                report.aliases_removed += 1;
                report.references_restored += restored;
            }
            Ok(Undone::PersonnelMissing) => {
                warn!(
                    target: "personnel_migrate",
                    event = "rollback_personnel_missing",
                    run_id,
                    source_table = %record.source_table,
                    source_id = record.source_id,
                    personnel_id = record.personnel_id
                );
                report.missing_personnel.push(RollbackSkip {
                    source_table: record.source_table,
                    source_id: record.source_id,
                    personnel_id: record.personnel_id,
                    reason: "personnel_missing".into(),
                });
            }
            Err(err) => {
                warn!(
                    target: "personnel_migrate",
                    event = "rollback_record_failed",
                    run_id,
                    source_table = %record.source_table,
                    source_id = record.source_id,
                    error = %err
                );
                report.failed.push(RollbackSkip {
                    source_table: record.source_table,
                    source_id: record.source_id,
                    personnel_id: record.personnel_id,
                    reason: err.to_string(),
                });
            }
        }
    }

    let status = report.status();
    let mut tx = conn.begin().await?;
    if status == RunStatus::RolledBack {
        sqlx::query("DELETE FROM migration_failure WHERE run_id = ?")
            .bind(run_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM migration_reconciliation WHERE run_id = ?")
            .bind(run_id)
            .execute(&mut *tx)
            .await?;
    }
    sqlx::query("UPDATE migration_run SET status = ?, finished_at = ? WHERE run_id = ?")
        .bind(status.as_str())
        .bind(now_ms())
        .bind(run_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    info!(
        target: "personnel_migrate",
        event = "rollback_done",
        run_id,
        status = status.as_str(),
        records = report.records,
        personnel_deleted = report.personnel_deleted,
        aliases_removed = report.aliases_removed,
        references_restored = report.references_restored,
        missing = report.missing_personnel.len(),
        failed = report.failed.len()
    );
    Ok(report)
}
