#![allow(clippy::unwrap_used, clippy::expect_used)]

mod util;

use std::sync::atomic::AtomicBool;

use personnel_migrate::adapter::{self, DriftCheck, DUAL_WRITE_RUN_ID, PERSON_TYPE_FIELD};
use personnel_migrate::engine::{self, MigrationMode};
use personnel_migrate::legacy::{LegacyRecord, SourceTable};
use serde_json::{json, Value};
use tempfile::tempdir;
use util::*;

fn legacy(table: SourceTable, value: Value) -> LegacyRecord {
    LegacyRecord::from_map(table, value.as_object().cloned().unwrap()).unwrap()
}

fn employee(id: i64, code: &str, name: &str) -> LegacyRecord {
    legacy(
        SourceTable::Employee,
        json!({
            "id": id, "code": code, "name": name, "age": 29,
            "employment_status": "稼働中", "is_active": true,
            "remote_work_available": true, "overtime_available": false,
            "position": "SE", "employment_type": "正社員",
            "salary_payment_type": "年俸制", "salary": 6000000,
            "created_at": 1000, "updated_at": 2000
        }),
    )
}

#[tokio::test]
async fn save_legacy_input_upserts_by_type_and_code() {
    let pool = prepared_pool().await;
    let mut conn = pool.acquire().await.unwrap();

    let created = adapter::save_legacy_input(&mut conn, &employee(0, "E1", "Taro"))
        .await
        .unwrap();
    assert!(created.created);
    let updated = adapter::save_legacy_input(&mut conn, &employee(0, "E1", "Taro Yamada"))
        .await
        .unwrap();
    assert!(!updated.created);
    assert_eq!(updated.personnel_id, created.personnel_id);

    let view = adapter::load_legacy_view(&mut conn, created.personnel_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(view.id(), created.personnel_id);
    assert_eq!(view.common().name, "Taro Yamada");

    let payload = adapter::legacy_payload(&view).unwrap();
    assert_eq!(payload[PERSON_TYPE_FIELD], "employee");
    assert_eq!(payload["employment_type"], "正社員");
    drop(conn);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM ses_personnel").await, 1);
}

#[tokio::test]
async fn load_legacy_view_of_missing_personnel_is_none() {
    let pool = prepared_pool().await;
    let mut conn = pool.acquire().await.unwrap();
    assert!(adapter::load_legacy_view(&mut conn, 404).await.unwrap().is_none());
}

#[tokio::test]
async fn dual_write_links_both_sides_and_stays_in_sync() {
    let pool = prepared_pool().await;
    let mut conn = pool.acquire().await.unwrap();
    let input = legacy(
        SourceTable::BpEmployee,
        json!({
            "id": 40, "code": "B40", "name": "Ken", "bp_company_id": 1,
            "interview_available": true, "created_at": 1000, "updated_at": 2000
        }),
    );

    let outcome = adapter::dual_write(&mut conn, &input).await.unwrap();
    assert!(outcome.created);
    assert_eq!(outcome.legacy_id, 40);

    let check = adapter::legacy_drift(&mut conn, SourceTable::BpEmployee, 40, outcome.personnel_id)
        .await
        .unwrap();
    assert_eq!(check, DriftCheck::InSync);
    drop(conn);

    let run: String = sqlx::query_scalar(
        "SELECT run_id FROM migration_record WHERE source_table = 'ses_bp_employee' AND source_id = 40",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(run, DUAL_WRITE_RUN_ID);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM ses_bp_employee").await, 1);
}

#[tokio::test]
async fn dual_write_failure_writes_neither_side() {
    let pool = prepared_pool().await;
    let mut conn = pool.acquire().await.unwrap();
    let input = legacy(
        SourceTable::BpEmployee,
        json!({
            "id": 41, "code": "B41", "name": "Ghost", "bp_company_id": 99,
            "created_at": 1000, "updated_at": 2000
        }),
    );
    assert!(adapter::dual_write(&mut conn, &input).await.is_err());
    drop(conn);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM ses_bp_employee").await, 0);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM ses_personnel").await, 0);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM migration_record").await, 0);
}

#[tokio::test]
async fn drift_is_detected_and_resynced_from_unified() {
    let pool = prepared_pool().await;
    let mut conn = pool.acquire().await.unwrap();
    let outcome = adapter::dual_write(&mut conn, &employee(12, "E12", "Saburo"))
        .await
        .unwrap();
    drop(conn);

    sqlx::query("UPDATE ses_personnel SET name = 'Saburo Sato', age = 30 WHERE id = ?")
        .bind(outcome.personnel_id)
        .execute(&pool)
        .await
        .unwrap();

    let mut conn = pool.acquire().await.unwrap();
    let check = adapter::legacy_drift(&mut conn, SourceTable::Employee, 12, outcome.personnel_id)
        .await
        .unwrap();
    assert_eq!(check, DriftCheck::Drifted(vec!["age".into(), "name".into()]));

    let legacy_id = adapter::resync_legacy(&mut conn, outcome.personnel_id).await.unwrap();
    assert_eq!(legacy_id, 12);
    let check = adapter::legacy_drift(&mut conn, SourceTable::Employee, 12, outcome.personnel_id)
        .await
        .unwrap();
    assert_eq!(check, DriftCheck::InSync);
    drop(conn);

    let name: String = sqlx::query_scalar("SELECT name FROM ses_employee WHERE id = 12")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(name, "Saburo Sato");
}

#[tokio::test]
async fn resync_without_link_is_an_error() {
    let pool = prepared_pool().await;
    let mut conn = pool.acquire().await.unwrap();
    let saved = adapter::save_legacy_input(&mut conn, &employee(0, "E5", "Goro"))
        .await
        .unwrap();
    let err = adapter::resync_legacy(&mut conn, saved.personnel_id)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "ADAPTER/NOT_LINKED");
}

#[tokio::test]
async fn missing_legacy_row_is_reported() {
    let pool = prepared_pool().await;
    let mut conn = pool.acquire().await.unwrap();
    let saved = adapter::save_legacy_input(&mut conn, &employee(0, "E6", "Rokuro"))
        .await
        .unwrap();
    let check = adapter::legacy_drift(&mut conn, SourceTable::Employee, 6, saved.personnel_id)
        .await
        .unwrap();
    assert_eq!(check, DriftCheck::LegacyMissing);
}

async fn legacy_name(pool: &sqlx::SqlitePool, id: i64) -> String {
    sqlx::query_scalar("SELECT name FROM ses_employee WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn edited_view_writes_back_to_its_own_legacy_row() {
    let pool = prepared_pool().await;
    insert_employee(&pool, 1, Some("E1"), "Taro").await;
    insert_employee(&pool, 3, Some("E3"), "Saburo").await;
    insert_employee(&pool, 5, Some("E5"), "Goro").await;
    let dir = tempdir().unwrap();
    engine::run(
        &pool,
        &options(dir.path(), MigrationMode::Apply),
        &AtomicBool::new(false),
    )
    .await
    .unwrap();

    // The view of E5 carries an id that is E3's legacy id.
    let goro = personnel_id(&pool, "employee", "E5").await.unwrap();
    assert_eq!(goro, 3);

    let mut conn = pool.acquire().await.unwrap();
    let view = adapter::load_legacy_view(&mut conn, goro).await.unwrap().unwrap();
    assert_eq!(view.id(), goro);
    let mut edited = view.to_map().unwrap();
    edited.insert("name".into(), json!("Goro Ito"));
    let edited = LegacyRecord::from_map(SourceTable::Employee, edited).unwrap();

    let outcome = adapter::dual_write(&mut conn, &edited).await.unwrap();
    assert_eq!(outcome.legacy_id, 5);
    assert_eq!(outcome.personnel_id, goro);
    assert!(!outcome.created);
    let check = adapter::legacy_drift(&mut conn, SourceTable::Employee, 5, goro)
        .await
        .unwrap();
    assert_eq!(check, DriftCheck::InSync);
    drop(conn);

    assert_eq!(legacy_name(&pool, 5).await, "Goro Ito");
    assert_eq!(legacy_name(&pool, 3).await, "Saburo");
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM ses_employee").await, 3);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM migration_record").await, 3);
}

#[tokio::test]
async fn new_record_never_takes_over_an_occupied_legacy_id() {
    let pool = prepared_pool().await;
    insert_employee(&pool, 1, Some("E1"), "Taro").await;
    let mut conn = pool.acquire().await.unwrap();

    let outcome = adapter::dual_write(&mut conn, &employee(1, "E77", "Nana"))
        .await
        .unwrap();
    assert!(outcome.created);
    assert_ne!(outcome.legacy_id, 1);
    drop(conn);

    assert_eq!(legacy_name(&pool, 1).await, "Taro");
    assert_eq!(legacy_name(&pool, outcome.legacy_id).await, "Nana");
}
