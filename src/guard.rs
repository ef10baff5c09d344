use serde::Serialize;
use sqlx::SqliteConnection;

use crate::legacy::{SourceRecord, SourceTable};
use crate::repo::find_personnel_id;
use crate::AppResult;

/// Whether a source record still needs migrating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GuardDecision {
    Migrate,
    /// A migration record already links this source row.
    AlreadyRecorded { personnel_id: i64 },
    /// A personnel row with the same type and code exists.
    ExistingPersonnel { personnel_id: i64 },
}

impl GuardDecision {
    pub const fn should_migrate(self) -> bool {
        matches!(self, GuardDecision::Migrate)
    }

    /// The personnel row a skipped record resolves to.
    pub const fn personnel_id(self) -> Option<i64> {
        match self {
            GuardDecision::Migrate => None,
            GuardDecision::AlreadyRecorded { personnel_id }
            | GuardDecision::ExistingPersonnel { personnel_id } => Some(personnel_id),
        }
    }

    pub const fn reason(self) -> Option<&'static str> {
        match self {
            GuardDecision::Migrate => None,
            GuardDecision::AlreadyRecorded { .. } => Some("migration_record_exists"),
            GuardDecision::ExistingPersonnel { .. } => Some("personnel_code_exists"),
        }
    }
}

pub async fn recorded_personnel(
    conn: &mut SqliteConnection,
    table: SourceTable,
    source_id: i64,
) -> AppResult<Option<i64>> {
    let id: Option<i64> = sqlx::query_scalar(
        "SELECT personnel_id FROM migration_record WHERE source_table = ? AND source_id = ?",
    )
    .bind(table.table())
    .bind(source_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(id)
}

pub async fn check(conn: &mut SqliteConnection, record: &SourceRecord) -> AppResult<GuardDecision> {
    if let Some(personnel_id) = recorded_personnel(conn, record.table, record.id).await? {
        return Ok(GuardDecision::AlreadyRecorded { personnel_id });
    }
    if let Some(code) = record.code() {
        if let Some(personnel_id) =
            find_personnel_id(conn, record.table.person_type(), code).await?
        {
            return Ok(GuardDecision::ExistingPersonnel { personnel_id });
        }
    }
    Ok(GuardDecision::Migrate)
}

pub async fn should_migrate(conn: &mut SqliteConnection, record: &SourceRecord) -> AppResult<bool> {
    Ok(check(conn, record).await?.should_migrate())
}
