use std::collections::BTreeMap;

use serde_json::{Map, Value};
use sqlx::SqliteConnection;
use tracing::debug;

use crate::legacy::{SourceRecord, SourceTable};
use crate::repo::row_to_value;
use crate::{AppError, AppResult};

/// Keyset cursor over one legacy table, ordered by primary key.
///
/// Each page composes entity rows with their skill rows. The cursor only
/// moves forward; `start_after` resumes a pass that stopped part way.
#[derive(Debug, Clone)]
pub struct SourceReader {
    table: SourceTable,
    page_size: u32,
    cursor: Option<i64>,
    exhausted: bool,
}

impl SourceReader {
    pub fn new(table: SourceTable, page_size: u32) -> Self {
        Self {
            table,
            page_size: page_size.max(1),
            cursor: None,
            exhausted: false,
        }
    }

    pub fn start_after(mut self, id: i64) -> Self {
        self.cursor = Some(id);
        self
    }

    pub fn table(&self) -> SourceTable {
        self.table
    }

    /// Last id handed out, if any.
    pub fn cursor(&self) -> Option<i64> {
        self.cursor
    }

    /// Next page of records; empty once the table is exhausted.
    pub async fn next_page(&mut self, conn: &mut SqliteConnection) -> AppResult<Vec<SourceRecord>> {
        if self.exhausted {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT * FROM {} WHERE id > ? ORDER BY id LIMIT ?",
            self.table.table()
        );
        let rows = sqlx::query(&sql)
            .bind(self.cursor.unwrap_or(i64::MIN))
            .bind(i64::from(self.page_size))
            .fetch_all(&mut *conn)
            .await
            .map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "read_source_page")
                    .with_context("table", self.table.table())
            })?;

        if rows.len() < self.page_size as usize {
            self.exhausted = true;
        }

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let map = row_to_value(row);
            let id = map.get("id").and_then(Value::as_i64).ok_or_else(|| {
                AppError::new("READER/NO_ID", "Legacy row has no integer id")
                    .with_context("table", self.table.table())
            })?;
            records.push(SourceRecord {
                table: self.table,
                id,
                row: map,
                skills: Vec::new(),
            });
        }

        if let Some(last) = records.last() {
            self.cursor = Some(last.id);
        }

        let ids: Vec<i64> = records.iter().map(|r| r.id).collect();
        let mut skills = self.skills_for(conn, &ids).await?;
        for record in &mut records {
            record.skills = skills.remove(&record.id).unwrap_or_default();
        }

        debug!(
            target: "personnel_migrate",
            event = "source_page",
            table = %self.table,
            rows = records.len(),
            cursor = ?self.cursor
        );
        Ok(records)
    }

    async fn skills_for(
        &self,
        conn: &mut SqliteConnection,
        owner_ids: &[i64],
    ) -> AppResult<BTreeMap<i64, Vec<Map<String, Value>>>> {
        let mut grouped: BTreeMap<i64, Vec<Map<String, Value>>> = BTreeMap::new();
        if owner_ids.is_empty() {
            return Ok(grouped);
        }
        let owner = self.table.owner_column();
        let placeholders = vec!["?"; owner_ids.len()].join(",");
        let sql = format!(
            "SELECT * FROM {} WHERE {owner} IN ({placeholders}) ORDER BY id",
            self.table.skill_table()
        );
        let mut query = sqlx::query(&sql);
        for id in owner_ids {
            query = query.bind(*id);
        }
        let rows = query.fetch_all(&mut *conn).await.map_err(|err| {
            AppError::from(err)
                .with_context("operation", "read_source_skills")
                .with_context("table", self.table.skill_table())
        })?;
        for row in &rows {
            let map = row_to_value(row);
            if let Some(owner_id) = map.get(owner).and_then(Value::as_i64) {
                grouped.entry(owner_id).or_default().push(map);
            }
        }
        Ok(grouped)
    }
}
