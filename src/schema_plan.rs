//! Explicit, checksummed DDL plan.
//!
//! Every schema change the engine needs is listed here and embedded at
//! compile time. Files are applied in order, one transaction each, and
//! recorded in `schema_migrations` with the sha256 of their cleaned SQL.
//! A file whose checksum changed after it was applied aborts the plan.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{Connection, Row, SqliteConnection};
use tracing::{error, info};

use crate::time::now_ms;
use crate::{AppError, AppResult};

pub static SCHEMA_PLAN: &[(&str, &str)] = &[
    (
        "0001_legacy_baseline.sql",
        include_str!("../migrations/0001_legacy_baseline.sql"),
    ),
    (
        "0002_personnel_unified.sql",
        include_str!("../migrations/0002_personnel_unified.sql"),
    ),
    (
        "0003_dependent_personnel_refs.sql",
        include_str!("../migrations/0003_dependent_personnel_refs.sql"),
    ),
    (
        "0004_migration_bookkeeping.sql",
        include_str!("../migrations/0004_migration_bookkeeping.sql"),
    ),
];

static ADD_COLUMN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^ALTER\s+TABLE\s+(\w+)\s+ADD\s+COLUMN\s+(\w+)")
        .unwrap_or_else(|err| panic!("invalid add-column pattern: {err}"))
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    Applied,
    AlreadyApplied,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanFileStatus {
    pub file: String,
    pub checksum: String,
    pub state: FileState,
    pub statements_skipped: usize,
}

fn preview(sql: &str) -> String {
    let one_line = sql.replace(['\n', '\t'], " ");
    let trimmed = one_line.trim();
    match trimmed.char_indices().nth(160) {
        Some((idx, _)) => format!("{}…", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

fn clean(raw_sql: &str) -> String {
    raw_sql
        .lines()
        .filter(|line| {
            let t = line.trim_start();
            !(t.is_empty() || t.starts_with("--"))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn checksum(raw_sql: &str) -> String {
    format!("{:x}", Sha256::digest(clean(raw_sql).as_bytes()))
}

async fn applied_checksums(conn: &mut SqliteConnection) -> AppResult<HashMap<String, String>> {
    let rows = sqlx::query("SELECT version, checksum FROM schema_migrations")
        .fetch_all(&mut *conn)
        .await?;
    let mut applied = HashMap::new();
    for r in rows {
        if let (Ok(v), Ok(c)) = (
            r.try_get::<String, _>("version"),
            r.try_get::<String, _>("checksum"),
        ) {
            applied.insert(v, c);
        }
    }
    Ok(applied)
}

async fn column_exists(conn: &mut SqliteConnection, table: &str, column: &str) -> AppResult<bool> {
    let exists: Option<i64> =
        sqlx::query_scalar("SELECT 1 FROM pragma_table_info(?) WHERE name = ?")
            .bind(table)
            .bind(column)
            .fetch_optional(&mut *conn)
            .await?;
    Ok(exists.is_some())
}

/// Apply every pending file of the plan.
///
/// Runs inside whatever transaction the caller holds, so a dry run can
/// apply the plan and discard it with everything else.
pub async fn apply(conn: &mut SqliteConnection) -> AppResult<Vec<PlanFileStatus>> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (\
           version   TEXT PRIMARY KEY,\
           applied_at INTEGER NOT NULL,\
           checksum TEXT NOT NULL\
         )",
    )
    .execute(&mut *conn)
    .await
    .map_err(|err| AppError::from(err).with_context("operation", "schema_migrations_table"))?;

    let applied = applied_checksums(conn).await?;
    let mut statuses = Vec::with_capacity(SCHEMA_PLAN.len());

    for (filename, raw_sql) in SCHEMA_PLAN {
        let cleaned = clean(raw_sql);
        let checksum = format!("{:x}", Sha256::digest(cleaned.as_bytes()));

        if let Some(stored) = applied.get(*filename) {
            if stored != &checksum {
                return Err(AppError::new(
                    "SCHEMA/CHECKSUM_MISMATCH",
                    "Schema file was edited after it was applied",
                )
                .with_context("file", *filename)
                .with_context("stored", stored.clone())
                .with_context("embedded", checksum));
            }
            info!(target: "personnel_migrate", event = "schema_skip_file", file = %filename);
            statuses.push(PlanFileStatus {
                file: filename.to_string(),
                checksum,
                state: FileState::AlreadyApplied,
                statements_skipped: 0,
            });
            continue;
        }

        let mut tx = conn.begin().await?;
        let mut skipped = 0usize;
        for stmt in cleaned.split(';') {
            let s = stmt.trim();
            if s.is_empty() {
                continue;
            }
            let upper = s.to_ascii_uppercase();
            if upper == "BEGIN" || upper == "COMMIT" {
                continue;
            }
            if let Some(caps) = ADD_COLUMN_RE.captures(s) {
                let table = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
                let col = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
                if column_exists(&mut *tx, table, col).await? {
                    info!(target: "personnel_migrate", event = "schema_stmt_skip", file = %filename, sql = %preview(s));
                    skipped += 1;
                    continue;
                }
            }
            info!(target: "personnel_migrate", event = "schema_stmt", file = %filename, sql = %preview(s));
            if let Err(e) = sqlx::query(s).execute(&mut *tx).await {
                error!(target: "personnel_migrate", event = "schema_stmt_error", file = %filename, sql = %preview(s), error = %e);
                return Err(AppError::from(e)
                    .with_context("operation", "schema_plan")
                    .with_context("file", *filename));
            }
        }

        sqlx::query(
            "INSERT INTO schema_migrations (version, applied_at, checksum) VALUES (?, ?, ?)",
        )
        .bind(*filename)
        .bind(now_ms())
        .bind(&checksum)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(target: "personnel_migrate", event = "schema_file_applied", file = %filename);
        statuses.push(PlanFileStatus {
            file: filename.to_string(),
            checksum,
            state: FileState::Applied,
            statements_skipped: skipped,
        });
    }

    Ok(statuses)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_ignores_comments_and_blank_lines() {
        let a = "-- heading\nCREATE TABLE t (id INTEGER);\n\n";
        let b = "CREATE TABLE t (id INTEGER);";
        assert_eq!(checksum(a), checksum(b));
        assert_ne!(checksum(b), checksum("CREATE TABLE u (id INTEGER);"));
    }

    #[test]
    fn plan_files_are_ordered_and_unique() {
        let names: Vec<&str> = SCHEMA_PLAN.iter().map(|(name, _)| *name).collect();
        let mut sorted = names.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(names, sorted);
    }

    #[test]
    fn add_column_pattern_captures_table_and_column() {
        let caps = ADD_COLUMN_RE
            .captures("ALTER TABLE ses_contract ADD COLUMN personnel_id INTEGER")
            .expect("matches");
        assert_eq!(&caps[1], "ses_contract");
        assert_eq!(&caps[2], "personnel_id");
    }

    #[test]
    fn preview_truncates_on_char_boundary() {
        let long = "稼".repeat(300);
        let p = preview(&long);
        assert!(p.ends_with('…'));
        assert_eq!(p.chars().count(), 161);
    }
}
