use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sqlx::{Connection, Row, SqliteConnection};
use tracing::{info, warn};

use crate::legacy::{SourceTable, DEPENDENT_TABLES};
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepointSummary {
    pub rows: u64,
    #[serde(default)]
    pub per_table: BTreeMap<String, u64>,
}

impl RepointSummary {
    pub fn absorb(&mut self, other: &RepointSummary) {
        self.rows += other.rows;
        for (table, count) in &other.per_table {
            *self.per_table.entry(table.clone()).or_insert(0) += count;
        }
    }
}

/// Point every dependent row whose legacy column equals `source_id` at
/// `personnel_id`, recording the previous value for rollback.
///
/// Runs as its own atomic unit after the commit; a failure leaves the
/// committed personnel row in place.
pub async fn repoint(
    conn: &mut SqliteConnection,
    run_id: &str,
    table: SourceTable,
    source_id: i64,
    personnel_id: i64,
) -> AppResult<RepointSummary> {
    let mut tx = conn.begin().await?;
    let mut summary = RepointSummary::default();
    let owner = table.owner_column();

    for dependent in DEPENDENT_TABLES {
        let select = format!(
            "SELECT id, personnel_id FROM {dependent}
             WHERE {owner} = ? AND (personnel_id IS NULL OR personnel_id != ?)
             ORDER BY id"
        );
        let rows = sqlx::query(&select)
            .bind(source_id)
            .bind(personnel_id)
            .fetch_all(&mut *tx)
            .await
            .map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "repoint_select")
                    .with_context("dependent_table", *dependent)
            })?;
        if rows.is_empty() {
            continue;
        }

        let update = format!("UPDATE {dependent} SET personnel_id = ? WHERE id = ?");
        for row in &rows {
            let dependent_id: i64 = row.try_get("id")?;
            let previous: Option<i64> = row.try_get("personnel_id")?;
            sqlx::query(
                "INSERT INTO migration_repoint
                   (run_id, source_table, source_id, personnel_id, dependent_table, dependent_id, previous_personnel_id)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(run_id)
            .bind(table.table())
            .bind(source_id)
            .bind(personnel_id)
            .bind(*dependent)
            .bind(dependent_id)
            .bind(previous)
            .execute(&mut *tx)
            .await?;
            sqlx::query(&update)
                .bind(personnel_id)
                .bind(dependent_id)
                .execute(&mut *tx)
                .await
                .map_err(|err| {
                    AppError::from(err)
                        .with_context("operation", "repoint_update")
                        .with_context("dependent_table", *dependent)
                        .with_context("dependent_id", dependent_id.to_string())
                })?;
        }
        let count = rows.len() as u64;
        summary.rows += count;
        *summary.per_table.entry(dependent.to_string()).or_insert(0) += count;
    }

    tx.commit().await?;
    if summary.rows > 0 {
        info!(
            target: "personnel_migrate",
            event = "references_repointed",
            table = %table,
            source_id,
            personnel_id,
            rows = summary.rows
        );
    }
    Ok(summary)
}

/// Log a repoint failure as an open reconciliation item.
pub async fn record_reconciliation(
    conn: &mut SqliteConnection,
    run_id: &str,
    table: SourceTable,
    source_id: i64,
    personnel_id: i64,
    reason: &str,
) -> AppResult<()> {
    warn!(
        target: "personnel_migrate",
        event = "reconciliation_item",
        table = %table,
        source_id,
        personnel_id,
        reason
    );
    sqlx::query(
        "INSERT INTO migration_reconciliation (run_id, source_table, source_id, personnel_id, reason, created_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(run_id)
    .bind(table.table())
    .bind(source_id)
    .bind(personnel_id)
    .bind(reason)
    .bind(crate::time::now_ms())
    .execute(&mut *conn)
    .await
    .map_err(|err| AppError::from(err).with_context("operation", "record_reconciliation"))?;
    Ok(())
}

/// Close the open reconciliation items of a source row once its
/// dependents have been repointed.
pub async fn resolve_reconciliation(
    conn: &mut SqliteConnection,
    table: SourceTable,
    source_id: i64,
) -> AppResult<u64> {
    let done = sqlx::query(
        "DELETE FROM migration_reconciliation WHERE source_table = ? AND source_id = ?",
    )
    .bind(table.table())
    .bind(source_id)
    .execute(&mut *conn)
    .await
    .map_err(|err| AppError::from(err).with_context("operation", "resolve_reconciliation"))?;
    if done.rows_affected() > 0 {
        info!(
            target: "personnel_migrate",
            event = "reconciliation_resolved",
            table = %table,
            source_id,
            items = done.rows_affected()
        );
    }
    Ok(done.rows_affected())
}
