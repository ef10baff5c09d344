#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::path::Path;

use personnel_migrate::engine::{MigrationMode, RunOptions};
use personnel_migrate::schema_plan;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

pub async fn temp_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("connect sqlite::memory:");
    sqlx::query("PRAGMA foreign_keys=ON;")
        .execute(&pool)
        .await
        .unwrap();
    pool
}

/// In-memory store with the full schema plan and reference rows.
pub async fn prepared_pool() -> SqlitePool {
    let pool = temp_pool().await;
    {
        let mut conn = pool.acquire().await.unwrap();
        schema_plan::apply(&mut conn).await.unwrap();
    }
    seed_reference(&pool).await;
    pool
}

pub async fn seed_reference(pool: &SqlitePool) {
    sqlx::query("INSERT INTO ses_bp_company (id, name) VALUES (1, 'Partner KK')")
        .execute(pool)
        .await
        .unwrap();
    for (id, name) in [(1, "Rust"), (2, "Java"), (3, "SQL")] {
        sqlx::query("INSERT INTO ses_skill (id, name) VALUES (?, ?)")
            .bind(id)
            .bind(name)
            .execute(pool)
            .await
            .unwrap();
    }
}

pub fn options(dir: &Path, mode: MigrationMode) -> RunOptions {
    RunOptions {
        mode,
        page_size: 2,
        snapshot_dir: dir.join("snapshots"),
        log_dir: dir.join("logs"),
        min_free_bytes: 0,
    }
}

pub async fn insert_employee(pool: &SqlitePool, id: i64, code: Option<&str>, name: &str) {
    sqlx::query(
        "INSERT INTO ses_employee (id, code, name, age, birthday, total_experience_years, created_at, updated_at)
         VALUES (?, ?, ?, 30, '1994-04-01', 8.5, 1000, 2000)",
    )
    .bind(id)
    .bind(code)
    .bind(name)
    .execute(pool)
    .await
    .unwrap();
}

pub async fn insert_freelancer(pool: &SqlitePool, id: i64, code: &str, name: &str) {
    sqlx::query(
        "INSERT INTO ses_freelancer (id, code, name, hourly_rate, is_active, interview_available, created_at, updated_at)
         VALUES (?, ?, ?, 5500.0, 1, 1, 1000, 2000)",
    )
    .bind(id)
    .bind(code)
    .bind(name)
    .execute(pool)
    .await
    .unwrap();
}

pub async fn insert_bp_employee(
    pool: &SqlitePool,
    id: i64,
    code: &str,
    name: &str,
    bp_company_id: i64,
) {
    sqlx::query(
        "INSERT INTO ses_bp_employee (id, code, name, bp_company_id, created_at, updated_at)
         VALUES (?, ?, ?, ?, 1000, 2000)",
    )
    .bind(id)
    .bind(code)
    .bind(name)
    .bind(bp_company_id)
    .execute(pool)
    .await
    .unwrap();
}

pub async fn insert_skill(pool: &SqlitePool, table: &str, owner: &str, id: i64, owner_id: i64, skill_id: i64) {
    let sql = format!(
        "INSERT INTO {table} (id, {owner}, skill_id, proficiency, is_primary_skill) VALUES (?, ?, ?, 3, 0)"
    );
    sqlx::query(&sql)
        .bind(id)
        .bind(owner_id)
        .bind(skill_id)
        .execute(pool)
        .await
        .unwrap();
}

pub async fn insert_evaluation(pool: &SqlitePool, id: i64, owner: &str, owner_id: i64) {
    let sql = format!(
        "INSERT INTO ses_person_evaluation (id, {owner}, overall_rating, created_at) VALUES (?, ?, 4, 1000)"
    );
    sqlx::query(&sql)
        .bind(id)
        .bind(owner_id)
        .execute(pool)
        .await
        .unwrap();
}

pub async fn count(pool: &SqlitePool, sql: &str) -> i64 {
    sqlx::query_scalar(sql).fetch_one(pool).await.unwrap()
}

pub async fn personnel_id(pool: &SqlitePool, person_type: &str, code: &str) -> Option<i64> {
    sqlx::query_scalar("SELECT id FROM ses_personnel WHERE person_type = ? AND code = ?")
        .bind(person_type)
        .bind(code)
        .fetch_optional(pool)
        .await
        .unwrap()
}

/// A small mixed population: two employees (one with a duplicated skill),
/// a freelancer and a partner employee, plus one evaluation per type.
pub async fn seed_population(pool: &SqlitePool) {
    insert_employee(pool, 1, Some("E1"), "Taro").await;
    insert_employee(pool, 7, Some("E7"), "Jiro").await;
    insert_freelancer(pool, 3, "F3", "Hanako").await;
    insert_bp_employee(pool, 5, "B5", "Ken", 1).await;

    insert_skill(pool, "ses_employee_skill", "employee_id", 1, 1, 1).await;
    insert_skill(pool, "ses_employee_skill", "employee_id", 2, 1, 2).await;
    insert_skill(pool, "ses_employee_skill", "employee_id", 3, 7, 1).await;
    insert_skill(pool, "ses_employee_skill", "employee_id", 4, 7, 1).await;
    insert_skill(pool, "ses_freelancer_skill", "freelancer_id", 1, 3, 3).await;
    insert_skill(pool, "ses_bp_employee_skill", "bp_employee_id", 1, 5, 2).await;

    insert_evaluation(pool, 1, "employee_id", 7).await;
    insert_evaluation(pool, 2, "freelancer_id", 3).await;
    insert_evaluation(pool, 3, "bp_employee_id", 5).await;
}
