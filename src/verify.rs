//! Post-run verification. Read-only and advisory.

use serde::{Deserialize, Serialize};
use sqlx::{Row, SqliteConnection};
use tracing::info;

use crate::adapter::{legacy_drift, DriftCheck};
use crate::legacy::{SourceTable, DEPENDENT_TABLES};
use crate::time::now_rfc3339;
use crate::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureItem {
    pub source_id: i64,
    pub code: Option<String>,
    pub stage: String,
    pub reason: String,
}

/// (a) personnel rows matched by type and code against source rows.
///
/// Source rows sharing a code collapse into one personnel row, so
/// `eligible` and `matched` count distinct codes. Rows without a code count
/// once each in `eligible` and never match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeCount {
    pub source_table: SourceTable,
    pub source_rows: i64,
    pub eligible: i64,
    pub matched: i64,
    /// Coded source rows with no migration record, migrated or alias.
    pub unlinked: i64,
    pub failures: Vec<FailureItem>,
}

impl TypeCount {
    pub fn unmatched(&self) -> i64 {
        self.eligible - self.matched
    }
}

/// (b) skill associations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillCount {
    pub source_table: SourceTable,
    pub legacy_rows: i64,
    /// Distinct (owner, skill) pairs, leaving out owners that are aliases.
    pub distinct_pairs: i64,
    pub migrated: i64,
}

/// (c) dependent rows per legacy column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceCheck {
    pub dependent_table: String,
    pub source_table: SourceTable,
    pub fully_migrated: bool,
    pub legacy_only: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DanglingCheck {
    pub dependent_table: String,
    pub dangling: i64,
}

/// (d) repointer failures waiting for an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationItem {
    pub source_table: String,
    pub source_id: i64,
    pub personnel_id: i64,
    pub reason: String,
}

/// (e) a migrated pair whose legacy and unified views disagree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftItem {
    pub source_table: String,
    pub source_id: i64,
    pub personnel_id: i64,
    pub fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub run_id: String,
    pub generated_at: String,
    pub types: Vec<TypeCount>,
    pub skills: Vec<SkillCount>,
    pub references: Vec<ReferenceCheck>,
    pub dangling: Vec<DanglingCheck>,
    pub reconciliation: Vec<ReconciliationItem>,
    pub drift: Vec<DriftItem>,
}

impl VerificationReport {
    pub fn is_clean(&self) -> bool {
        self.types
            .iter()
            .all(|t| t.unmatched() == 0 && t.unlinked == 0 && t.failures.is_empty())
            && self.skills.iter().all(|s| s.migrated == s.distinct_pairs)
            && self
                .references
                .iter()
                .all(|r| !r.fully_migrated || r.legacy_only == 0)
            && self.dangling.iter().all(|d| d.dangling == 0)
            && self.reconciliation.is_empty()
            && self.drift.is_empty()
    }

    pub fn type_count(&self, table: SourceTable) -> Option<&TypeCount> {
        self.types.iter().find(|t| t.source_table == table)
    }

    pub fn skill_count(&self, table: SourceTable) -> Option<&SkillCount> {
        self.skills.iter().find(|s| s.source_table == table)
    }
}

async fn count(conn: &mut SqliteConnection, sql: &str, binds: &[&str]) -> AppResult<i64> {
    let mut query = sqlx::query_scalar::<_, i64>(sql);
    for value in binds {
        query = query.bind(*value);
    }
    query.fetch_one(&mut *conn).await.map_err(|err| {
        AppError::from(err)
            .with_context("operation", "verify_count")
            .with_context("sql", sql.to_string())
    })
}

async fn type_count(
    conn: &mut SqliteConnection,
    run_id: &str,
    table: SourceTable,
) -> AppResult<TypeCount> {
    let legacy = table.table();
    let source_rows = count(conn, &format!("SELECT COUNT(*) FROM {legacy}"), &[]).await?;
    let eligible = count(
        conn,
        &format!(
            "SELECT (SELECT COUNT(DISTINCT code) FROM {legacy} WHERE TRIM(COALESCE(code, '')) != '')
                  + (SELECT COUNT(*) FROM {legacy} WHERE TRIM(COALESCE(code, '')) = '')"
        ),
        &[],
    )
    .await?;
    let matched = count(
        conn,
        &format!(
            "SELECT COUNT(DISTINCT l.code) FROM {legacy} l
             WHERE EXISTS (SELECT 1 FROM ses_personnel p WHERE p.person_type = ? AND p.code = l.code)"
        ),
        &[table.person_type().as_str()],
    )
    .await?;
    let unlinked = count(
        conn,
        &format!(
            "SELECT COUNT(*) FROM {legacy} l
             WHERE TRIM(COALESCE(l.code, '')) != ''
               AND NOT EXISTS (SELECT 1 FROM migration_record r
                               WHERE r.source_table = ? AND r.source_id = l.id)"
        ),
        &[legacy],
    )
    .await?;

    let rows = sqlx::query(
        "SELECT source_id, code, stage, reason FROM migration_failure
         WHERE run_id = ? AND source_table = ? ORDER BY id",
    )
    .bind(run_id)
    .bind(legacy)
    .fetch_all(&mut *conn)
    .await?;
    let mut failures = Vec::with_capacity(rows.len());
    for row in rows {
        failures.push(FailureItem {
            source_id: row.try_get("source_id")?,
            code: row.try_get("code")?,
            stage: row.try_get("stage")?,
            reason: row.try_get("reason")?,
        });
    }

    Ok(TypeCount {
        source_table: table,
        source_rows,
        eligible,
        matched,
        unlinked,
        failures,
    })
}

async fn skill_count(conn: &mut SqliteConnection, table: SourceTable) -> AppResult<SkillCount> {
    let skills = table.skill_table();
    let owner = table.owner_column();
    let legacy_rows = count(conn, &format!("SELECT COUNT(*) FROM {skills}"), &[]).await?;
    let distinct_pairs = count(
        conn,
        &format!(
            "SELECT COUNT(*) FROM (
               SELECT DISTINCT s.{owner}, s.skill_id FROM {skills} s
               WHERE NOT EXISTS (SELECT 1 FROM migration_record r
                                 WHERE r.source_table = ? AND r.source_id = s.{owner} AND r.kind = 'alias'))"
        ),
        &[table.table()],
    )
    .await?;
    let migrated = count(
        conn,
        "SELECT COUNT(*) FROM ses_personnel_skill s
         JOIN migration_record r ON r.personnel_id = s.personnel_id
         WHERE r.source_table = ? AND r.kind = 'migrated'",
        &[table.table()],
    )
    .await?;
    Ok(SkillCount {
        source_table: table,
        legacy_rows,
        distinct_pairs,
        migrated,
    })
}

async fn reference_checks(
    conn: &mut SqliteConnection,
    types: &[TypeCount],
) -> AppResult<(Vec<ReferenceCheck>, Vec<DanglingCheck>)> {
    let mut references = Vec::new();
    let mut dangling = Vec::new();
    for dependent in DEPENDENT_TABLES {
        for table in SourceTable::ALL {
            let owner = table.owner_column();
            let fully_migrated = types
                .iter()
                .find(|t| t.source_table == table)
                .is_some_and(|t| t.unmatched() == 0);
            let legacy_only = count(
                conn,
                &format!(
                    "SELECT COUNT(*) FROM {dependent} WHERE {owner} IS NOT NULL AND personnel_id IS NULL"
                ),
                &[],
            )
            .await?;
            references.push(ReferenceCheck {
                dependent_table: dependent.to_string(),
                source_table: table,
                fully_migrated,
                legacy_only,
            });
        }
        let count_dangling = count(
            conn,
            &format!(
                "SELECT COUNT(*) FROM {dependent} d
                 WHERE d.personnel_id IS NOT NULL
                   AND NOT EXISTS (SELECT 1 FROM ses_personnel p WHERE p.id = d.personnel_id)"
            ),
            &[],
        )
        .await?;
        dangling.push(DanglingCheck {
            dependent_table: dependent.to_string(),
            dangling: count_dangling,
        });
    }
    Ok((references, dangling))
}

async fn reconciliation_items(
    conn: &mut SqliteConnection,
    run_id: &str,
) -> AppResult<Vec<ReconciliationItem>> {
    let rows = sqlx::query(
        "SELECT source_table, source_id, personnel_id, reason FROM migration_reconciliation
         WHERE run_id = ? ORDER BY id",
    )
    .bind(run_id)
    .fetch_all(&mut *conn)
    .await?;
    let mut items = Vec::with_capacity(rows.len());
    for row in rows {
        items.push(ReconciliationItem {
            source_table: row.try_get("source_table")?,
            source_id: row.try_get("source_id")?,
            personnel_id: row.try_get("personnel_id")?,
            reason: row.try_get("reason")?,
        });
    }
    Ok(items)
}

async fn drift_items(conn: &mut SqliteConnection) -> AppResult<Vec<DriftItem>> {
    let pairs: Vec<(String, i64, i64)> = sqlx::query_as(
        "SELECT source_table, source_id, personnel_id FROM migration_record
         WHERE kind = 'migrated' ORDER BY id",
    )
    .fetch_all(&mut *conn)
    .await?;

    let mut items = Vec::new();
    for (table_name, source_id, personnel_id) in pairs {
        let Ok(table) = table_name.parse::<SourceTable>() else {
            items.push(DriftItem {
                source_table: table_name,
                source_id,
                personnel_id,
                fields: Vec::new(),
                problem: Some("unknown_source_table".into()),
            });
            continue;
        };
        let (fields, problem) = match legacy_drift(conn, table, source_id, personnel_id).await? {
            DriftCheck::InSync => continue,
            DriftCheck::Drifted(fields) => (fields, None),
            DriftCheck::LegacyMissing => (Vec::new(), Some("legacy_row_missing".to_string())),
            DriftCheck::PersonnelMissing => (Vec::new(), Some("personnel_missing".to_string())),
            DriftCheck::Unmappable(reason) => (Vec::new(), Some(format!("legacy_unmappable: {reason}"))),
        };
        items.push(DriftItem {
            source_table: table_name,
            source_id,
            personnel_id,
            fields,
            problem,
        });
    }
    Ok(items)
}

/// Build the verification report for `run_id`. Never writes.
pub async fn verify(conn: &mut SqliteConnection, run_id: &str) -> AppResult<VerificationReport> {
    let mut types = Vec::new();
    let mut skills = Vec::new();
    for table in SourceTable::ALL {
        types.push(type_count(conn, run_id, table).await?);
        skills.push(skill_count(conn, table).await?);
    }
    let (references, dangling) = reference_checks(conn, &types).await?;
    let reconciliation = reconciliation_items(conn, run_id).await?;
    let drift = drift_items(conn).await?;

    let report = VerificationReport {
        run_id: run_id.to_string(),
        generated_at: now_rfc3339(),
        types,
        skills,
        references,
        dangling,
        reconciliation,
        drift,
    };
    info!(
        target: "personnel_migrate",
        event = "verification",
        run_id,
        clean = report.is_clean(),
        drift = report.drift.len(),
        reconciliation = report.reconciliation.len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clean_report() -> VerificationReport {
        VerificationReport {
            run_id: "r".into(),
            generated_at: now_rfc3339(),
            types: vec![TypeCount {
                source_table: SourceTable::Employee,
                source_rows: 3,
                eligible: 2,
                matched: 2,
                unlinked: 0,
                failures: Vec::new(),
            }],
            skills: vec![SkillCount {
                source_table: SourceTable::Employee,
                legacy_rows: 3,
                distinct_pairs: 2,
                migrated: 2,
            }],
            references: vec![ReferenceCheck {
                dependent_table: "ses_contract".into(),
                source_table: SourceTable::Employee,
                fully_migrated: false,
                legacy_only: 4,
            }],
            dangling: Vec::new(),
            reconciliation: Vec::new(),
            drift: Vec::new(),
        }
    }

    #[test]
    fn legacy_only_rows_matter_once_the_table_is_fully_migrated() {
        let mut report = clean_report();
        assert!(report.is_clean());
        report.references[0].fully_migrated = true;
        assert!(!report.is_clean());
    }

    #[test]
    fn unmatched_rows_and_drift_are_not_clean() {
        let mut report = clean_report();
        report.types[0].matched = 1;
        assert_eq!(report.types[0].unmatched(), 1);
        assert!(!report.is_clean());

        let mut report = clean_report();
        report.types[0].unlinked = 1;
        assert!(!report.is_clean());

        let mut report = clean_report();
        report.drift.push(DriftItem {
            source_table: "ses_employee".into(),
            source_id: 1,
            personnel_id: 1,
            fields: vec!["name".into()],
            problem: None,
        });
        assert!(!report.is_clean());
    }
}
