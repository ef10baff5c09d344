//! Map-driven row access shared by the engine and the adapter.
//!
//! Rows travel as `serde_json` maps between SQLite and the typed drafts.
//! Table names are checked against an allowlist and column names against
//! an identifier pattern before they are spliced into SQL.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Column, Row, Sqlite, SqliteConnection, TypeInfo, ValueRef};

use crate::legacy::SourceTable;
use crate::model::{Detail, PersonType, Personnel, PersonnelDraft, SkillRef};
use crate::{AppError, AppResult};

const WRITABLE_TABLES: &[&str] = &[
    "ses_personnel",
    "ses_employee_detail",
    "ses_freelancer_detail",
    "ses_bp_employee_detail",
    "ses_personnel_skill",
    "ses_employee",
    "ses_freelancer",
    "ses_bp_employee",
];

static IDENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z_][a-z0-9_]*$").unwrap_or_else(|err| panic!("invalid ident pattern: {err}"))
});

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

pub fn row_to_value(row: &SqliteRow) -> Map<String, Value> {
    let mut map = Map::new();
    for col in row.columns() {
        let idx = col.ordinal();
        let v = row.try_get_raw(idx).ok();
        let val = match v {
            Some(raw) => {
                if raw.is_null() {
                    Value::Null
                } else {
                    match raw.type_info().name() {
                        "INTEGER" => row
                            .try_get::<i64, _>(idx)
                            .map(Value::from)
                            .unwrap_or(Value::Null),
                        "REAL" => row
                            .try_get::<f64, _>(idx)
                            .map(Value::from)
                            .unwrap_or(Value::Null),
                        _ => row
                            .try_get::<String, _>(idx)
                            .map(Value::from)
                            .unwrap_or(Value::Null),
                    }
                }
            }
            None => Value::Null,
        };
        map.insert(col.name().to_string(), val);
    }
    map
}

pub fn bind_value<'q>(q: SqliteQuery<'q>, v: &Value) -> SqliteQuery<'q> {
    match v {
        Value::Null => q.bind(Option::<i64>::None),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                q.bind(i)
            } else if let Some(f) = n.as_f64() {
                q.bind(f)
            } else {
                q.bind(Option::<i64>::None)
            }
        }
        Value::Bool(b) => q.bind(*b as i64),
        Value::String(s) => q.bind(s.clone()),
        _ => q.bind(v.to_string()),
    }
}

fn ensure_table(table: &str) -> AppResult<()> {
    if WRITABLE_TABLES.contains(&table) {
        Ok(())
    } else {
        Err(AppError::new("REPO/TABLE_NOT_ALLOWED", "Table is not writable here")
            .with_context("table", table))
    }
}

fn ensure_columns<'a>(table: &str, columns: impl Iterator<Item = &'a String>) -> AppResult<()> {
    for column in columns {
        if !IDENT_RE.is_match(column) {
            return Err(AppError::new("REPO/BAD_COLUMN", "Column name is not an identifier")
                .with_context("table", table)
                .with_context("column", column.clone()));
        }
    }
    Ok(())
}

/// Insert `data` as one row and return its rowid.
pub async fn insert_map(
    conn: &mut SqliteConnection,
    table: &str,
    data: &Map<String, Value>,
) -> AppResult<i64> {
    ensure_table(table)?;
    ensure_columns(table, data.keys())?;
    if data.is_empty() {
        return Err(AppError::new("REPO/EMPTY_ROW", "Nothing to insert").with_context("table", table));
    }
    let cols: Vec<&str> = data.keys().map(String::as_str).collect();
    let placeholders = vec!["?"; cols.len()].join(",");
    let sql = format!(
        "INSERT INTO {table} ({}) VALUES ({placeholders})",
        cols.join(",")
    );
    let mut query = sqlx::query(&sql);
    for value in data.values() {
        query = bind_value(query, value);
    }
    let result = query.execute(&mut *conn).await.map_err(|err| {
        AppError::from(err)
            .with_context("operation", "insert")
            .with_context("table", table)
    })?;
    Ok(result.last_insert_rowid())
}

/// Update the columns in `data` for the row matching `key_column = key`.
pub async fn update_map(
    conn: &mut SqliteConnection,
    table: &str,
    key_column: &str,
    key: i64,
    data: &Map<String, Value>,
) -> AppResult<u64> {
    ensure_table(table)?;
    ensure_columns(table, data.keys().chain(std::iter::once(&key_column.to_string())))?;
    if data.is_empty() {
        return Ok(0);
    }
    let sets: Vec<String> = data.keys().map(|c| format!("{c} = ?")).collect();
    let sql = format!(
        "UPDATE {table} SET {} WHERE {key_column} = ?",
        sets.join(", ")
    );
    let mut query = sqlx::query(&sql);
    for value in data.values() {
        query = bind_value(query, value);
    }
    let result = query.bind(key).execute(&mut *conn).await.map_err(|err| {
        AppError::from(err)
            .with_context("operation", "update")
            .with_context("table", table)
    })?;
    Ok(result.rows_affected())
}

/// Fetch one row of a known table by an integer key column.
pub async fn fetch_map(
    conn: &mut SqliteConnection,
    table: &str,
    key_column: &str,
    key: i64,
) -> AppResult<Option<Map<String, Value>>> {
    ensure_table(table)?;
    ensure_columns(table, std::iter::once(&key_column.to_string()))?;
    let sql = format!("SELECT * FROM {table} WHERE {key_column} = ?");
    let row = sqlx::query(&sql)
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.as_ref().map(row_to_value))
}

fn to_map<T: serde::Serialize>(value: &T) -> AppResult<Map<String, Value>> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        _ => Err(AppError::new("REPO/NOT_AN_OBJECT", "Row did not serialize to an object")),
    }
}

fn detail_map(detail: &Detail) -> AppResult<Map<String, Value>> {
    match detail.to_value()? {
        Value::Object(map) => Ok(map),
        _ => Err(AppError::new("REPO/NOT_AN_OBJECT", "Detail did not serialize to an object")),
    }
}

pub async fn find_personnel_id(
    conn: &mut SqliteConnection,
    person_type: PersonType,
    code: &str,
) -> AppResult<Option<i64>> {
    let id: Option<i64> =
        sqlx::query_scalar("SELECT id FROM ses_personnel WHERE person_type = ? AND code = ?")
            .bind(person_type.as_str())
            .bind(code)
            .fetch_optional(&mut *conn)
            .await?;
    Ok(id)
}

/// Insert a personnel row with its detail and skills. The caller owns the
/// transaction.
pub async fn insert_unified(
    conn: &mut SqliteConnection,
    personnel: &PersonnelDraft,
    detail: &Detail,
    skills: &[SkillRef],
) -> AppResult<i64> {
    if personnel.person_type != detail.person_type() {
        return Err(AppError::new(
            "REPO/TYPE_MISMATCH",
            "Detail variant does not match the person type",
        )
        .with_context("person_type", personnel.person_type.as_str())
        .with_context("detail", detail.person_type().as_str()));
    }
    let personnel_id = insert_map(conn, "ses_personnel", &to_map(personnel)?).await?;

    let mut detail_row = detail_map(detail)?;
    detail_row.insert("personnel_id".into(), Value::from(personnel_id));
    insert_map(conn, detail.table(), &detail_row).await?;

    for skill in skills {
        let mut skill_row = to_map(skill)?;
        skill_row.insert("personnel_id".into(), Value::from(personnel_id));
        insert_map(conn, "ses_personnel_skill", &skill_row).await?;
    }
    Ok(personnel_id)
}

/// Overwrite the shared fields and the detail row of an existing personnel.
pub async fn update_unified(
    conn: &mut SqliteConnection,
    personnel_id: i64,
    personnel: &PersonnelDraft,
    detail: &Detail,
) -> AppResult<()> {
    let mut data = to_map(personnel)?;
    // Identity and creation time stay with the stored row.
    data.remove("person_type");
    data.remove("created_at");
    let updated = update_map(conn, "ses_personnel", "id", personnel_id, &data).await?;
    if updated == 0 {
        return Err(AppError::new("REPO/PERSONNEL_NOT_FOUND", "Personnel row does not exist")
            .with_context("personnel_id", personnel_id.to_string()));
    }

    let detail_row = detail_map(detail)?;
    let updated = update_map(conn, detail.table(), "personnel_id", personnel_id, &detail_row).await?;
    if updated == 0 {
        let mut row = detail_row;
        row.insert("personnel_id".into(), Value::from(personnel_id));
        insert_map(conn, detail.table(), &row).await?;
    }
    Ok(())
}

/// Load a personnel row together with its detail.
pub async fn load_unified(
    conn: &mut SqliteConnection,
    personnel_id: i64,
) -> AppResult<Option<(Personnel, Detail)>> {
    let Some(mut row) = fetch_map(conn, "ses_personnel", "id", personnel_id).await? else {
        return Ok(None);
    };
    row.remove("id");
    let draft: PersonnelDraft = serde_json::from_value(Value::Object(row)).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "decode_personnel")
            .with_context("personnel_id", personnel_id.to_string())
    })?;

    let table = Detail::table_for(draft.person_type);
    let Some(mut detail_row) = fetch_map(conn, table, "personnel_id", personnel_id).await? else {
        return Err(AppError::new("REPO/DETAIL_MISSING", "Personnel has no detail row")
            .with_context("personnel_id", personnel_id.to_string())
            .with_context("table", table));
    };
    detail_row.remove("id");
    detail_row.remove("personnel_id");
    let detail = Detail::from_value(draft.person_type, Value::Object(detail_row)).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "decode_detail")
            .with_context("personnel_id", personnel_id.to_string())
    })?;

    Ok(Some((
        Personnel {
            id: personnel_id,
            draft,
        },
        detail,
    )))
}

/// Raw legacy row by id, as the mapper consumes it.
pub async fn fetch_legacy_row(
    conn: &mut SqliteConnection,
    table: SourceTable,
    id: i64,
) -> AppResult<Option<Map<String, Value>>> {
    fetch_map(conn, table.table(), "id", id).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_tables_and_odd_columns() {
        assert!(ensure_table("ses_personnel").is_ok());
        let err = ensure_table("sqlite_master").unwrap_err();
        assert_eq!(err.code(), "REPO/TABLE_NOT_ALLOWED");

        let good = ["name".to_string(), "bp_company_id".to_string()];
        assert!(ensure_columns("ses_personnel", good.iter()).is_ok());
        let bad = ["name; DROP TABLE x".to_string()];
        assert!(ensure_columns("ses_personnel", bad.iter()).is_err());
    }
}
