//! Pre-run export of every table the engine touches.
//!
//! A snapshot is a single JSON document written to a `.partial` file,
//! fsynced, renamed into place and made read-only. Each table carries a
//! `{count, sha256}` digest computed the same way as the live check, so a
//! snapshot can later prove which tables still match it, and its rows can be
//! written back with [`restore`].

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use fs2::available_space;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use sqlx::{Connection, SqliteConnection};
use tracing::{info, warn};

use crate::db::{schema_hash, table_exists};
use crate::repo::{bind_value, row_to_value};
use crate::time::{file_stamp, now_rfc3339};
use crate::{AppError, AppResult};

const PARTIAL_SUFFIX: &str = ".partial";
const REQUIRED_FREE_MULTIPLIER: f64 = 1.2;

/// Legacy content the engine must never change.
pub const LEGACY_TABLES: &[&str] = &[
    "ses_employee",
    "ses_freelancer",
    "ses_bp_employee",
    "ses_employee_skill",
    "ses_freelancer_skill",
    "ses_bp_employee_skill",
];

/// Everything a run reads or writes.
pub const TOUCHED_TABLES: &[&str] = &[
    "ses_employee",
    "ses_freelancer",
    "ses_bp_employee",
    "ses_employee_skill",
    "ses_freelancer_skill",
    "ses_bp_employee_skill",
    "ses_person_evaluation",
    "ses_contract",
    "ses_case_candidate",
    "ses_personnel",
    "ses_employee_detail",
    "ses_freelancer_detail",
    "ses_bp_employee_detail",
    "ses_personnel_skill",
    "migration_record",
    "migration_repoint",
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub count: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDump {
    #[serde(flatten)]
    pub info: TableInfo,
    pub rows: Vec<Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub run_id: String,
    pub created_at: String,
    pub schema_hash: String,
    pub tables: BTreeMap<String, TableDump>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotHandle {
    pub path: PathBuf,
    pub run_id: String,
    pub bytes: u64,
    pub tables: BTreeMap<String, TableInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoredTable {
    pub written: u64,
    pub removed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreReport {
    pub run_id: String,
    pub tables: BTreeMap<String, RestoredTable>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDivergence {
    pub table: String,
    pub snapshot: Option<TableInfo>,
    pub live: TableInfo,
}

/// Digest accumulator shared by capture and the live check.
struct Digest256 {
    hasher: Sha256,
    count: u64,
}

impl Digest256 {
    fn new() -> Self {
        Self {
            hasher: Sha256::new(),
            count: 0,
        }
    }

    fn push(&mut self, row: &Map<String, Value>) -> AppResult<()> {
        let line = serde_json::to_string(row)?;
        self.hasher.update(line.as_bytes());
        self.hasher.update(b"\n");
        self.count += 1;
        Ok(())
    }

    fn finish(self) -> TableInfo {
        TableInfo {
            count: self.count,
            sha256: format!("{:x}", self.hasher.finalize()),
        }
    }
}

fn ensure_known(table: &str) -> AppResult<()> {
    if TOUCHED_TABLES.contains(&table) {
        Ok(())
    } else {
        Err(AppError::new("SNAPSHOT/UNKNOWN_TABLE", "Table is not part of the snapshot set")
            .with_context("table", table))
    }
}

async fn dump_table(
    conn: &mut SqliteConnection,
    table: &str,
    keep_rows: bool,
) -> AppResult<TableDump> {
    ensure_known(table)?;
    let mut digest = Digest256::new();
    let mut rows = Vec::new();
    if !table_exists(conn, table).await? {
        return Ok(TableDump {
            info: digest.finish(),
            rows,
        });
    }

    let sql = format!("SELECT * FROM {table} ORDER BY id");
    let mut stream = sqlx::query(&sql).fetch(&mut *conn);
    while let Some(row) = stream.try_next().await.map_err(|err| {
        AppError::from(err)
            .with_context("operation", "snapshot_read")
            .with_context("table", table)
    })? {
        let map = row_to_value(&row);
        digest.push(&map)?;
        if keep_rows {
            rows.push(map);
        }
    }
    Ok(TableDump {
        info: digest.finish(),
        rows,
    })
}

pub async fn table_digest(conn: &mut SqliteConnection, table: &str) -> AppResult<TableInfo> {
    Ok(dump_table(conn, table, false).await?.info)
}

pub fn snapshot_file_name(run_id: &str) -> String {
    format!("snapshot-{}-{run_id}.json", file_stamp(Utc::now()))
}

fn free_disk_space(dir: &Path) -> AppResult<u64> {
    available_space(dir).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "available_space")
            .with_context("path", dir.display().to_string())
    })
}

/// Export `tables` and flush the snapshot durably before returning.
///
/// Any failure here is fatal for the run: no mutation may start without a
/// snapshot on disk.
pub async fn capture(
    conn: &mut SqliteConnection,
    dir: &Path,
    run_id: &str,
    tables: &[&str],
    min_free_bytes: u64,
) -> AppResult<SnapshotHandle> {
    fs::create_dir_all(dir).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "create_snapshot_dir")
            .with_context("path", dir.display().to_string())
    })?;

    let mut dumps = BTreeMap::new();
    for table in tables {
        dumps.insert(table.to_string(), dump_table(conn, table, true).await?);
    }
    let snapshot = Snapshot {
        run_id: run_id.to_string(),
        created_at: now_rfc3339(),
        schema_hash: schema_hash(conn).await?,
        tables: dumps,
    };
    let body = serde_json::to_vec_pretty(&snapshot)?;

    let required = ((body.len() as f64) * REQUIRED_FREE_MULTIPLIER).ceil() as u64 + min_free_bytes;
    let available = free_disk_space(dir)?;
    if available < required {
        return Err(
            AppError::new("SNAPSHOT/INSUFFICIENT_SPACE", "Not enough free disk space for the snapshot")
                .with_context("available_bytes", available.to_string())
                .with_context("required_bytes", required.to_string())
                .with_context("path", dir.display().to_string()),
        );
    }

    let final_path = dir.join(snapshot_file_name(run_id));
    let partial_path = {
        let mut name = final_path.as_os_str().to_owned();
        name.push(PARTIAL_SUFFIX);
        PathBuf::from(name)
    };

    let write = || -> std::io::Result<()> {
        let mut file = File::create(&partial_path)?;
        file.write_all(&body)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&partial_path, &final_path)?;
        let mut perms = fs::metadata(&final_path)?.permissions();
        perms.set_readonly(true);
        fs::set_permissions(&final_path, perms)?;
        Ok(())
    };
    if let Err(err) = write() {
        let _ = fs::remove_file(&partial_path);
        return Err(AppError::from(err)
            .with_context("operation", "write_snapshot")
            .with_context("path", final_path.display().to_string()));
    }
    sync_dir(dir);

    let tables = snapshot
        .tables
        .iter()
        .map(|(name, dump)| (name.clone(), dump.info.clone()))
        .collect();
    info!(
        target: "personnel_migrate",
        event = "snapshot_written",
        run_id,
        path = %final_path.display(),
        bytes = body.len()
    );
    Ok(SnapshotHandle {
        path: final_path,
        run_id: run_id.to_string(),
        bytes: body.len() as u64,
        tables,
    })
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(err) = File::open(dir).and_then(|d| d.sync_all()) {
        warn!(target: "personnel_migrate", event = "snapshot_dir_sync_failed", error = %err);
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

pub fn load(path: &Path) -> AppResult<Snapshot> {
    let file = File::open(path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "open_snapshot")
            .with_context("path", path.display().to_string())
    })?;
    let snapshot: Snapshot = serde_json::from_reader(std::io::BufReader::new(file))
        .map_err(|err| AppError::from(err).with_context("path", path.display().to_string()))?;
    Ok(snapshot)
}

/// Tables whose live content no longer matches the snapshot.
pub async fn compare_live(
    conn: &mut SqliteConnection,
    snapshot: &Snapshot,
    tables: &[&str],
) -> AppResult<Vec<TableDivergence>> {
    let mut diverged = Vec::new();
    for table in tables {
        let live = table_digest(conn, table).await?;
        let recorded = snapshot.tables.get(*table).map(|dump| dump.info.clone());
        if recorded.as_ref() != Some(&live) {
            diverged.push(TableDivergence {
                table: table.to_string(),
                snapshot: recorded,
                live,
            });
        }
    }
    Ok(diverged)
}

async fn live_columns(conn: &mut SqliteConnection, table: &str) -> AppResult<Vec<String>> {
    let columns: Vec<String> =
        sqlx::query_scalar("SELECT name FROM pragma_table_info(?) ORDER BY cid")
            .bind(table)
            .fetch_all(&mut *conn)
            .await?;
    Ok(columns)
}

/// Upsert every captured row by id. Live columns the snapshot does not
/// carry were added after capture and go back to NULL.
async fn write_rows(
    conn: &mut SqliteConnection,
    table: &str,
    rows: &[Map<String, Value>],
) -> AppResult<u64> {
    if rows.is_empty() {
        return Ok(0);
    }
    if !table_exists(conn, table).await? {
        return Err(
            AppError::new("SNAPSHOT/TABLE_MISSING", "Captured table no longer exists")
                .with_context("table", table),
        );
    }
    let columns = live_columns(conn, table).await?;
    let updates: Vec<String> = columns
        .iter()
        .filter(|c| c.as_str() != "id")
        .map(|c| format!("{c} = excluded.{c}"))
        .collect();
    let conflict = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };
    let sql = format!(
        "INSERT INTO {table} ({}) VALUES ({}) ON CONFLICT(id) {conflict}",
        columns.join(", "),
        vec!["?"; columns.len()].join(", ")
    );

    for row in rows {
        if !row.contains_key("id") {
            return Err(AppError::new("SNAPSHOT/ROW_WITHOUT_ID", "Captured row has no id")
                .with_context("table", table));
        }
        if let Some(unknown) = row.keys().find(|key| !columns.contains(key)) {
            return Err(AppError::new(
                "SNAPSHOT/UNKNOWN_COLUMN",
                "Captured column is not in the live table",
            )
            .with_context("table", table)
            .with_context("column", unknown.clone()));
        }
        let mut query = sqlx::query(&sql);
        for column in &columns {
            query = bind_value(query, row.get(column).unwrap_or(&Value::Null));
        }
        query.execute(&mut *conn).await.map_err(|err| {
            AppError::from(err)
                .with_context("operation", "restore_row")
                .with_context("table", table)
        })?;
    }
    Ok(rows.len() as u64)
}

/// Delete live rows the snapshot does not have.
async fn remove_extra_rows(
    conn: &mut SqliteConnection,
    table: &str,
    rows: &[Map<String, Value>],
) -> AppResult<u64> {
    if !table_exists(conn, table).await? {
        return Ok(0);
    }
    let ids: Vec<i64> = rows
        .iter()
        .filter_map(|row| row.get("id").and_then(Value::as_i64))
        .collect();
    let sql = format!("DELETE FROM {table} WHERE id NOT IN (SELECT value FROM json_each(?))");
    let done = sqlx::query(&sql)
        .bind(serde_json::to_string(&ids)?)
        .execute(&mut *conn)
        .await
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "restore_remove")
                .with_context("table", table)
        })?;
    Ok(done.rows_affected())
}

/// Rewrite `tables` to their captured content in one transaction.
///
/// Foreign keys are checked at commit, so tables can be written in any
/// order. Either every table is restored or none is.
pub async fn restore(
    conn: &mut SqliteConnection,
    snapshot: &Snapshot,
    tables: &[&str],
) -> AppResult<RestoreReport> {
    let mut dumps = Vec::with_capacity(tables.len());
    for table in tables {
        ensure_known(table)?;
        let dump = snapshot.tables.get(*table).ok_or_else(|| {
            AppError::new("SNAPSHOT/TABLE_NOT_CAPTURED", "Snapshot does not contain this table")
                .with_context("table", *table)
                .with_context("run_id", snapshot.run_id.clone())
        })?;
        dumps.push((*table, dump));
    }
    info!(
        target: "personnel_migrate",
        event = "snapshot_restore_start",
        run_id = %snapshot.run_id,
        tables = tables.len()
    );

    let mut report = RestoreReport {
        run_id: snapshot.run_id.clone(),
        ..RestoreReport::default()
    };
    let mut tx = conn.begin().await?;
    sqlx::query("PRAGMA defer_foreign_keys = ON")
        .execute(&mut *tx)
        .await?;
    for (table, dump) in &dumps {
        let written = write_rows(&mut *tx, table, &dump.rows).await?;
        report.tables.entry(table.to_string()).or_default().written = written;
    }
    for (table, dump) in dumps.iter().rev() {
        let removed = remove_extra_rows(&mut *tx, table, &dump.rows).await?;
        report.tables.entry(table.to_string()).or_default().removed = removed;
    }
    tx.commit().await.map_err(|err| {
        AppError::from(err)
            .with_context("operation", "restore_commit")
            .with_context("run_id", snapshot.run_id.clone())
    })?;

    info!(
        target: "personnel_migrate",
        event = "snapshot_restored",
        run_id = %snapshot.run_id,
        tables = report.tables.len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn digest_depends_on_row_content_and_order() {
        let a = json!({"id": 1, "name": "Taro"}).as_object().cloned().unwrap();
        let b = json!({"id": 2, "name": "Hanako"}).as_object().cloned().unwrap();

        let mut first = Digest256::new();
        first.push(&a).unwrap();
        first.push(&b).unwrap();
        let mut second = Digest256::new();
        second.push(&b).unwrap();
        second.push(&a).unwrap();
        let (first, second) = (first.finish(), second.finish());
        assert_eq!(first.count, 2);
        assert_ne!(first.sha256, second.sha256);

        let mut again = Digest256::new();
        again.push(&a).unwrap();
        again.push(&b).unwrap();
        assert_eq!(again.finish(), first);
    }

    #[test]
    fn file_name_carries_run_id() {
        let name = snapshot_file_name("0190-abc");
        assert!(name.starts_with("snapshot-"));
        assert!(name.ends_with("-0190-abc.json"));
    }

    #[test]
    fn unknown_tables_are_refused() {
        assert!(ensure_known("ses_personnel").is_ok());
        assert_eq!(
            ensure_known("schema_migrations").unwrap_err().code(),
            "SNAPSHOT/UNKNOWN_TABLE"
        );
    }
}
