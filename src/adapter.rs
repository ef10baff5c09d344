//! Legacy-shaped contracts over unified storage.
//!
//! The projections are stateless and keyed by person type: a unified row
//! becomes exactly the record the old table would have held, and a legacy
//! shaped input becomes the drafts the engine would have produced for it.
//! The store helpers below build on them for request-time reads and
//! writes, the dual-write window and drift repair.

use serde::Serialize;
use serde_json::Value;
use sqlx::{Connection, SqliteConnection};
use thiserror::Error;
use tracing::info;

use crate::legacy::{LegacyRecord, SourceTable};
use crate::mapper::{self, MapError};
use crate::model::{Detail, Personnel, PersonnelDraft};
use crate::repo::{
    fetch_legacy_row, find_personnel_id, insert_map, insert_unified, load_unified, update_map,
    update_unified,
};
use crate::time::now_ms;
use crate::{AppError, AppResult};

/// Run id carried by migration records created through dual-write.
pub const DUAL_WRITE_RUN_ID: &str = "dual-write";

/// The one field legacy consumers tolerate on top of the old shape.
pub const PERSON_TYPE_FIELD: &str = "person_type";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Map(#[from] MapError),
    #[error("legacy shape could not be built: {0}")]
    Shape(String),
}

fn shape(err: serde_json::Error) -> AdapterError {
    AdapterError::Shape(err.to_string())
}

/// Project a unified personnel and its detail onto the legacy shape.
///
/// The legacy record exposes the personnel id as its `id`.
pub fn to_legacy_view(personnel: &Personnel, detail: &Detail) -> Result<LegacyRecord, AdapterError> {
    let mut map = mapper::project_legacy(&personnel.draft, detail)?;
    map.insert("id".into(), Value::from(personnel.id));
    let table = SourceTable::for_person_type(personnel.draft.person_type);
    LegacyRecord::from_map(table, map).map_err(shape)
}

pub fn from_legacy_input(input: &LegacyRecord) -> Result<(PersonnelDraft, Detail), AdapterError> {
    let map = input.to_map().map_err(shape)?;
    Ok(mapper::map_row(input.source_table(), &map)?)
}

/// Legacy JSON payload plus the additive `person_type` field.
pub fn legacy_payload(record: &LegacyRecord) -> Result<Value, AdapterError> {
    let mut map = record.to_map().map_err(shape)?;
    map.insert(
        PERSON_TYPE_FIELD.into(),
        Value::from(record.person_type().as_str()),
    );
    Ok(Value::Object(map))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SaveOutcome {
    pub personnel_id: i64,
    pub created: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DualWriteOutcome {
    pub legacy_id: i64,
    pub personnel_id: i64,
    pub created: bool,
}

pub async fn load_legacy_view(
    conn: &mut SqliteConnection,
    personnel_id: i64,
) -> AppResult<Option<LegacyRecord>> {
    let Some((personnel, detail)) = load_unified(conn, personnel_id).await? else {
        return Ok(None);
    };
    Ok(Some(to_legacy_view(&personnel, &detail)?))
}

async fn upsert_unified(conn: &mut SqliteConnection, input: &LegacyRecord) -> AppResult<SaveOutcome> {
    let (draft, detail) = from_legacy_input(input)?;
    match find_personnel_id(conn, draft.person_type, &draft.code).await? {
        Some(personnel_id) => {
            update_unified(conn, personnel_id, &draft, &detail).await?;
            Ok(SaveOutcome {
                personnel_id,
                created: false,
            })
        }
        None => {
            let personnel_id = insert_unified(conn, &draft, &detail, &[]).await?;
            Ok(SaveOutcome {
                personnel_id,
                created: true,
            })
        }
    }
}

/// Write a legacy-shaped input into unified storage, matched by type and
/// code.
pub async fn save_legacy_input(
    conn: &mut SqliteConnection,
    input: &LegacyRecord,
) -> AppResult<SaveOutcome> {
    let mut tx = conn.begin().await?;
    let outcome = upsert_unified(&mut *tx, input).await?;
    tx.commit().await?;
    Ok(outcome)
}

async fn write_legacy_row(
    conn: &mut SqliteConnection,
    table: SourceTable,
    legacy_id: i64,
    record: &LegacyRecord,
) -> AppResult<()> {
    let mut data = record.to_map()?;
    data.remove("id");
    let updated = update_map(conn, table.table(), "id", legacy_id, &data).await?;
    if updated == 0 {
        data.insert("id".into(), Value::from(legacy_id));
        insert_map(conn, table.table(), &data).await?;
    }
    Ok(())
}

/// Insert a new legacy row, keeping `preferred_id` only while it is free.
async fn insert_legacy_row(
    conn: &mut SqliteConnection,
    table: SourceTable,
    preferred_id: i64,
    record: &LegacyRecord,
) -> AppResult<i64> {
    let mut data = record.to_map()?;
    data.remove("id");
    if preferred_id > 0 && fetch_legacy_row(conn, table, preferred_id).await?.is_none() {
        data.insert("id".into(), Value::from(preferred_id));
    }
    insert_map(conn, table.table(), &data).await
}

/// The legacy row an input stands for.
///
/// A record read through the legacy view carries the personnel id as `id`,
/// so the row is found through its migration record, then by code. `None`
/// when the record has no legacy row yet.
async fn resolve_legacy_id(
    conn: &mut SqliteConnection,
    table: SourceTable,
    code: &str,
) -> AppResult<Option<i64>> {
    let linked: Option<i64> = sqlx::query_scalar(
        "SELECT r.source_id FROM migration_record r
         JOIN ses_personnel p ON p.id = r.personnel_id
         WHERE r.source_table = ? AND p.person_type = ? AND p.code = ?
         ORDER BY r.kind = 'migrated' DESC, r.id
         LIMIT 1",
    )
    .bind(table.table())
    .bind(table.person_type().as_str())
    .bind(code)
    .fetch_optional(&mut *conn)
    .await?;
    if linked.is_some() {
        return Ok(linked);
    }
    let sql = format!("SELECT id FROM {} WHERE code = ? ORDER BY id LIMIT 1", table.table());
    let by_code: Option<i64> = sqlx::query_scalar(&sql)
        .bind(code)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(by_code)
}

/// Write the legacy row and the unified row as one unit and link them.
///
/// Either both writes land or neither does. The legacy row is resolved by
/// migration record or code, never by the input's `id`, which a view read
/// sets to the personnel id.
pub async fn dual_write(
    conn: &mut SqliteConnection,
    input: &LegacyRecord,
) -> AppResult<DualWriteOutcome> {
    let table = input.source_table();
    let (draft, _) = from_legacy_input(input)?;

    let mut tx = conn.begin().await?;
    let legacy_id = match resolve_legacy_id(&mut *tx, table, &draft.code).await? {
        Some(legacy_id) => {
            write_legacy_row(&mut *tx, table, legacy_id, input).await?;
            legacy_id
        }
        None => insert_legacy_row(&mut *tx, table, input.id(), input).await?,
    };
    let saved = upsert_unified(&mut *tx, input).await?;
    sqlx::query(
        "INSERT INTO migration_record (run_id, source_table, source_id, personnel_id, created_at)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT(source_table, source_id) DO UPDATE SET personnel_id = excluded.personnel_id",
    )
    .bind(DUAL_WRITE_RUN_ID)
    .bind(table.table())
    .bind(legacy_id)
    .bind(saved.personnel_id)
    .bind(now_ms())
    .execute(&mut *tx)
    .await
    .map_err(|err| AppError::from(err).with_context("operation", "dual_write_link"))?;
    tx.commit().await?;

    info!(
        target: "personnel_migrate",
        event = "dual_write",
        table = %table,
        legacy_id,
        personnel_id = saved.personnel_id,
        created = saved.created
    );
    Ok(DualWriteOutcome {
        legacy_id,
        personnel_id: saved.personnel_id,
        created: saved.created,
    })
}

/// Overwrite the linked legacy row with the unified row's legacy view.
/// Returns the legacy id that was rewritten.
pub async fn resync_legacy(conn: &mut SqliteConnection, personnel_id: i64) -> AppResult<i64> {
    let link: Option<(String, i64)> = sqlx::query_as(
        "SELECT source_table, source_id FROM migration_record WHERE personnel_id = ?
         ORDER BY kind = 'migrated' DESC, id LIMIT 1",
    )
    .bind(personnel_id)
    .fetch_optional(&mut *conn)
    .await?;
    let Some((table_name, legacy_id)) = link else {
        return Err(AppError::new("ADAPTER/NOT_LINKED", "Personnel has no linked legacy row")
            .with_context("personnel_id", personnel_id.to_string()));
    };
    let table: SourceTable = table_name.parse().map_err(|msg: String| {
        AppError::new("ADAPTER/UNKNOWN_TABLE", msg).with_context("table", table_name.clone())
    })?;

    let Some(view) = load_legacy_view(conn, personnel_id).await? else {
        return Err(AppError::new("ADAPTER/PERSONNEL_MISSING", "Personnel row does not exist")
            .with_context("personnel_id", personnel_id.to_string()));
    };

    let mut tx = conn.begin().await?;
    write_legacy_row(&mut *tx, table, legacy_id, &view).await?;
    tx.commit().await?;

    info!(
        target: "personnel_migrate",
        event = "legacy_resynced",
        table = %table,
        legacy_id,
        personnel_id
    );
    Ok(legacy_id)
}

/// Compare a legacy row with its unified counterpart through the same
/// legacy projection, listing the field names that disagree.
pub async fn legacy_drift(
    conn: &mut SqliteConnection,
    table: SourceTable,
    legacy_id: i64,
    personnel_id: i64,
) -> AppResult<DriftCheck> {
    let Some(row) = fetch_legacy_row(conn, table, legacy_id).await? else {
        return Ok(DriftCheck::LegacyMissing);
    };
    let Some((personnel, detail)) = load_unified(conn, personnel_id).await? else {
        return Ok(DriftCheck::PersonnelMissing);
    };
    let (draft, legacy_detail) = match mapper::map_row(table, &row) {
        Ok(mapped) => mapped,
        Err(err) => return Ok(DriftCheck::Unmappable(err.to_string())),
    };
    let from_legacy = to_legacy_view(
        &Personnel {
            id: personnel_id,
            draft,
        },
        &legacy_detail,
    )?
    .to_map()?;
    let from_unified = to_legacy_view(&personnel, &detail)?.to_map()?;

    let mut fields: Vec<String> = from_legacy
        .iter()
        .filter(|(key, value)| from_unified.get(key.as_str()) != Some(*value))
        .map(|(key, _)| key.clone())
        .collect();
    fields.sort();
    if fields.is_empty() {
        Ok(DriftCheck::InSync)
    } else {
        Ok(DriftCheck::Drifted(fields))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriftCheck {
    InSync,
    Drifted(Vec<String>),
    LegacyMissing,
    PersonnelMissing,
    Unmappable(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::legacy::{LegacyBpEmployee, LegacyCommon};
    use crate::model::{BpEmployeeDetail, EmploymentStatus, PersonType};

    fn common(code: &str) -> LegacyCommon {
        LegacyCommon {
            code: Some(code.to_string()),
            name: "Ken".into(),
            free_kana_name: None,
            age: Some(41),
            sex: None,
            birthday: None,
            station: None,
            marriage_status: None,
            phone: None,
            email: None,
            emergency_contact_name: None,
            emergency_contact_phone: None,
            emergency_contact_relation: None,
            zip_code: None,
            address: None,
            nationality: None,
            visa_status: None,
            visa_expire_date: None,
            japanese_level: None,
            total_experience_years: Some(12.5),
            it_experience_years: None,
            education_level: None,
            major: None,
            certifications: None,
            standard_unit_price: None,
            employment_status: Some(EmploymentStatus::Working),
            is_active: Some(true),
            available_start_date: None,
            current_project_end_date: None,
            preferred_location: None,
            photo_url: None,
            resume_url: None,
            portfolio_url: None,
            remark: None,
            created_at: 100,
            updated_at: 200,
        }
    }

    #[test]
    fn payload_adds_only_person_type() {
        let record = LegacyRecord::BpEmployee(LegacyBpEmployee {
            id: 9,
            common: common("B9"),
            bp_company_id: Some(3),
            min_unit_price: None,
            max_unit_price: None,
            remote_work_available: Some(false),
            overtime_available: Some(true),
            interview_available: Some(false),
        });
        let payload = legacy_payload(&record).unwrap();
        let legacy = record.to_map().unwrap();
        let object = payload.as_object().unwrap();
        assert_eq!(object.len(), legacy.len() + 1);
        assert_eq!(object["person_type"], Value::from("bp_employee"));
        assert_eq!(object["code"], Value::from("B9"));
    }

    #[test]
    fn view_rejects_mismatched_detail() {
        let record = LegacyRecord::BpEmployee(LegacyBpEmployee {
            id: 1,
            common: common("B1"),
            bp_company_id: Some(3),
            min_unit_price: None,
            max_unit_price: None,
            remote_work_available: None,
            overtime_available: None,
            interview_available: None,
        });
        let (mut draft, _) = from_legacy_input(&record).unwrap();
        draft.person_type = PersonType::Employee;
        let err = to_legacy_view(
            &Personnel { id: 1, draft },
            &Detail::BpEmployee(BpEmployeeDetail {
                bp_company_id: 3,
                interview_available: false,
            }),
        )
        .unwrap_err();
        assert!(matches!(err, AdapterError::Map(MapError::TypeMismatch { .. })));
    }

    #[test]
    fn defaults_are_filled_on_input() {
        let record = LegacyRecord::BpEmployee(LegacyBpEmployee {
            id: 1,
            common: LegacyCommon {
                employment_status: None,
                is_active: None,
                ..common("B2")
            },
            bp_company_id: Some(3),
            min_unit_price: None,
            max_unit_price: None,
            remote_work_available: None,
            overtime_available: None,
            interview_available: None,
        });
        let (draft, detail) = from_legacy_input(&record).unwrap();
        assert_eq!(draft.employment_status, EmploymentStatus::Available);
        assert!(draft.is_active);
        assert_eq!(
            detail,
            Detail::BpEmployee(BpEmployeeDetail {
                bp_company_id: 3,
                interview_available: false,
            })
        );
    }
}
