use serde::{Deserialize, Serialize};
use sqlx::{Connection, SqliteConnection};
use tracing::{error, info, warn};

use crate::legacy::SourceRecord;
use crate::mapper::MappedRecord;
use crate::repo::insert_unified;
use crate::time::now_ms;
use crate::{AppError, AppResult};

/// How a migration record relates a source row to its personnel row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// The run created the personnel row from this source row.
    Migrated,
    /// The personnel row already existed under the same type and code.
    Alias,
}

impl RecordKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            RecordKind::Migrated => "migrated",
            RecordKind::Alias => "alias",
        }
    }
}

impl std::str::FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "migrated" => Ok(RecordKind::Migrated),
            "alias" => Ok(RecordKind::Alias),
            other => Err(format!("unknown migration record kind: {other}")),
        }
    }
}

/// Write one mapped record as a single atomic unit: personnel, detail,
/// skills and the migration record. Returns the new personnel id.
///
/// Nothing is left behind on failure. Inside an outer transaction the unit
/// becomes a savepoint.
pub async fn commit(
    conn: &mut SqliteConnection,
    run_id: &str,
    source: &SourceRecord,
    mapped: &MappedRecord,
) -> AppResult<i64> {
    let mut tx = conn.begin().await?;
    info!(
        target: "personnel_migrate",
        event = "db_tx_begin",
        unit = "commit",
        table = %source.table,
        source_id = source.id
    );

    let result = async {
        let personnel_id =
            insert_unified(&mut *tx, &mapped.personnel, &mapped.detail, &mapped.skills).await?;
        record_migration(&mut *tx, run_id, source, personnel_id, RecordKind::Migrated).await?;
        Ok::<_, AppError>(personnel_id)
    }
    .await;

    match result {
        Ok(personnel_id) => {
            tx.commit().await?;
            info!(
                target: "personnel_migrate",
                event = "db_tx_commit",
                unit = "commit",
                table = %source.table,
                source_id = source.id,
                personnel_id
            );
            Ok(personnel_id)
        }
        Err(err) => {
            if let Err(rb) = tx.rollback().await {
                error!(
                    target: "personnel_migrate",
                    event = "db_tx_rollback_failed",
                    unit = "commit",
                    error = %rb
                );
            } else {
                warn!(
                    target: "personnel_migrate",
                    event = "db_tx_rollback",
                    unit = "commit",
                    table = %source.table,
                    source_id = source.id,
                    error = %err
                );
            }
            Err(err
                .with_context("table", source.table.table())
                .with_context("source_id", source.id.to_string()))
        }
    }
}

/// Link a source row to a personnel row it did not create, so its
/// dependents can be repointed and later restored.
pub async fn link_alias(
    conn: &mut SqliteConnection,
    run_id: &str,
    source: &SourceRecord,
    personnel_id: i64,
) -> AppResult<()> {
    record_migration(conn, run_id, source, personnel_id, RecordKind::Alias).await?;
    info!(
        target: "personnel_migrate",
        event = "record_aliased",
        table = %source.table,
        source_id = source.id,
        personnel_id
    );
    Ok(())
}

async fn record_migration(
    conn: &mut SqliteConnection,
    run_id: &str,
    source: &SourceRecord,
    personnel_id: i64,
    kind: RecordKind,
) -> AppResult<()> {
    sqlx::query(
        "INSERT INTO migration_record (run_id, source_table, source_id, personnel_id, kind, created_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(run_id)
    .bind(source.table.table())
    .bind(source.id)
    .bind(personnel_id)
    .bind(kind.as_str())
    .bind(now_ms())
    .execute(&mut *conn)
    .await
    .map_err(|err| AppError::from(err).with_context("operation", "record_migration"))?;
    Ok(())
}
