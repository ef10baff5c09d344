use std::fs;
use std::path::Path;

use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{ConnectOptions, Row, SqliteConnection, SqlitePool};
use std::time::Duration;
use tracing::{info, warn};

use crate::{AppError, AppResult};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open the store with WAL, full sync and foreign keys enforced.
///
/// When `create` is false a missing database file is an error rather than
/// an empty store.
pub async fn open_pool(db_path: &Path, create: bool) -> AppResult<SqlitePool> {
    if create {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "create_db_dir")
                    .with_context("path", parent.display().to_string())
            })?;
        }
    } else if !db_path.exists() {
        return Err(AppError::new("DB/NOT_FOUND", "Database file does not exist")
            .with_context("path", db_path.display().to_string()));
    }

    info!(target: "personnel_migrate", event = "db_path", path = %db_path.display());

    let opts = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(create)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT)
        .log_statements(log::LevelFilter::Off);

    // The engine works on a single connection; a second one serves the
    // read-only CLI listings.
    let pool = SqlitePoolOptions::new()
        .max_connections(2)
        .connect_with(opts)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "open_pool"))?;

    log_effective_pragmas(&pool).await;

    Ok(pool)
}

async fn log_effective_pragmas(pool: &SqlitePool) {
    let (sqlite_ver,): (String,) = sqlx::query_as("select sqlite_version()")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));

    let jm: (String,) = sqlx::query_as("PRAGMA journal_mode;")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));

    let fks: (i64,) = sqlx::query_as("PRAGMA foreign_keys;")
        .fetch_one(pool)
        .await
        .unwrap_or((i64::MIN,));

    info!(
        target: "personnel_migrate",
        event = "db_open",
        sqlite_version = %sqlite_ver,
        journal_mode = %jm.0,
        foreign_keys = %fks.0
    );

    if !jm.0.eq_ignore_ascii_case("wal") {
        warn!(
            target: "personnel_migrate",
            event = "db_open_warning",
            msg = "journal_mode != WAL; running with reduced crash safety"
        );
    }
    if fks.0 != 1 {
        warn!(
            target: "personnel_migrate",
            event = "db_open_warning",
            msg = "foreign keys are not enforced; detail and skill cascades will not fire"
        );
    }
}

/// Stable hash of the schema objects, recorded in snapshots.
pub async fn schema_hash(conn: &mut SqliteConnection) -> AppResult<String> {
    let rows = sqlx::query(
        "SELECT type, name, tbl_name, sql FROM sqlite_master
         WHERE type IN ('table','index','trigger','view')
         ORDER BY type, name",
    )
    .fetch_all(&mut *conn)
    .await
    .map_err(|err| AppError::from(err).with_context("operation", "schema_hash"))?;

    let mut hasher = Sha256::new();
    for row in rows {
        let ty: String = row.try_get("type")?;
        let name: String = row.try_get("name")?;
        let tbl: String = row.try_get("tbl_name")?;
        let sql: Option<String> = row.try_get("sql").ok();

        hasher.update(ty.as_bytes());
        hasher.update([0]);
        hasher.update(name.as_bytes());
        hasher.update([0]);
        hasher.update(tbl.as_bytes());
        hasher.update([0]);
        if let Some(sql) = sql {
            hasher.update(sql.as_bytes());
        }
        hasher.update([0]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

pub async fn table_exists(conn: &mut SqliteConnection, table: &str) -> AppResult<bool> {
    let exists: Option<i64> =
        sqlx::query_scalar("SELECT 1 FROM sqlite_master WHERE type='table' AND name = ?")
            .bind(table)
            .fetch_optional(&mut *conn)
            .await?;
    Ok(exists.is_some())
}
