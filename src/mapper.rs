//! Legacy row to unified drafts.
//!
//! The transformation is driven by fixed per-type field tables. Each rule
//! names the legacy column, the unified column, which unified row it lands
//! in and what to fill when the legacy value is NULL. The same tables run
//! backwards to project unified rows onto legacy shapes.

use std::collections::HashSet;

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::legacy::{SourceRecord, SourceTable};
use crate::model::{Detail, PersonnelDraft, SkillRef};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MapError {
    #[error("legacy row has no code")]
    MissingCode,
    #[error("legacy row has a blank name")]
    BlankName,
    #[error("required field `{field}` is missing")]
    MissingField { field: &'static str },
    #[error("legacy value could not be decoded: {message}")]
    Decode { message: String },
    #[error("detail belongs to {detail} but personnel is {personnel}")]
    TypeMismatch {
        personnel: &'static str,
        detail: &'static str,
    },
}

impl MapError {
    pub fn code(&self) -> &'static str {
        match self {
            MapError::MissingCode => "MAP/MISSING_CODE",
            MapError::BlankName => "MAP/BLANK_NAME",
            MapError::MissingField { .. } => "MAP/MISSING_FIELD",
            MapError::Decode { .. } => "MAP/DECODE",
            MapError::TypeMismatch { .. } => "MAP/TYPE_MISMATCH",
        }
    }

    pub fn field(&self) -> Option<&'static str> {
        match self {
            MapError::MissingField { field } => Some(*field),
            _ => None,
        }
    }
}

fn decode(err: serde_json::Error) -> MapError {
    MapError::Decode {
        message: err.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    Personnel,
    Detail,
    Skill,
}

/// What a NULL legacy value becomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Fill {
    Keep,
    Text(&'static str),
    Flag(bool),
    Int(i64),
}

impl Fill {
    fn value(self) -> Value {
        match self {
            Fill::Keep => Value::Null,
            Fill::Text(text) => Value::from(text),
            Fill::Flag(flag) => Value::Bool(flag),
            Fill::Int(int) => Value::from(int),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FieldRule {
    pub source: &'static str,
    pub target: &'static str,
    pub slot: Slot,
    pub fill: Fill,
}

const fn shared(name: &'static str) -> FieldRule {
    FieldRule {
        source: name,
        target: name,
        slot: Slot::Personnel,
        fill: Fill::Keep,
    }
}

const fn detail(name: &'static str) -> FieldRule {
    FieldRule {
        source: name,
        target: name,
        slot: Slot::Detail,
        fill: Fill::Keep,
    }
}

const fn skill(name: &'static str) -> FieldRule {
    FieldRule {
        source: name,
        target: name,
        slot: Slot::Skill,
        fill: Fill::Keep,
    }
}

impl FieldRule {
    const fn or(self, fill: Fill) -> Self {
        FieldRule { fill, ..self }
    }
}

pub const DEFAULT_EMPLOYMENT_STATUS: &str = "稼働可能";
pub const DEFAULT_EMPLOYMENT_TYPE: &str = "契約社員";
pub const DEFAULT_SALARY_PAYMENT_TYPE: &str = "月給制";

pub static SHARED_RULES: &[FieldRule] = &[
    shared("code"),
    shared("name"),
    shared("free_kana_name"),
    shared("age"),
    shared("sex"),
    shared("birthday"),
    shared("station"),
    shared("marriage_status"),
    shared("phone"),
    shared("email"),
    shared("emergency_contact_name"),
    shared("emergency_contact_phone"),
    shared("emergency_contact_relation"),
    shared("zip_code"),
    shared("address"),
    shared("nationality"),
    shared("visa_status"),
    shared("visa_expire_date"),
    shared("japanese_level"),
    shared("total_experience_years"),
    shared("it_experience_years"),
    shared("education_level"),
    shared("major"),
    shared("certifications"),
    shared("standard_unit_price"),
    shared("employment_status").or(Fill::Text(DEFAULT_EMPLOYMENT_STATUS)),
    shared("is_active").or(Fill::Flag(true)),
    shared("available_start_date"),
    shared("current_project_end_date"),
    shared("preferred_location"),
    shared("photo_url"),
    shared("resume_url"),
    shared("portfolio_url"),
    shared("remark"),
    shared("created_at"),
    shared("updated_at"),
];

pub static EMPLOYEE_RULES: &[FieldRule] = &[
    shared("user_id"),
    shared("remote_work_available").or(Fill::Flag(false)),
    shared("overtime_available").or(Fill::Flag(false)),
    detail("joining_time"),
    detail("position"),
    detail("employment_type").or(Fill::Text(DEFAULT_EMPLOYMENT_TYPE)),
    detail("business_content"),
    detail("salary_payment_type").or(Fill::Text(DEFAULT_SALARY_PAYMENT_TYPE)),
    detail("salary").or(Fill::Int(0)),
    detail("process_instance_id"),
];

pub static FREELANCER_RULES: &[FieldRule] = &[
    shared("work_address"),
    shared("min_unit_price"),
    shared("max_unit_price"),
    shared("hourly_rate"),
    shared("website_url"),
    detail("business_name"),
    detail("tax_number"),
    detail("business_start_date"),
    detail("freelance_experience_years"),
    detail("preferred_project_type"),
    detail("preferred_work_style"),
    detail("ng_client_companies"),
    detail("interview_available").or(Fill::Flag(false)),
];

pub static BP_EMPLOYEE_RULES: &[FieldRule] = &[
    shared("min_unit_price"),
    shared("max_unit_price"),
    shared("remote_work_available").or(Fill::Flag(false)),
    shared("overtime_available").or(Fill::Flag(false)),
    detail("bp_company_id"),
    detail("interview_available").or(Fill::Flag(false)),
];

pub static SKILL_RULES: &[FieldRule] = &[
    skill("skill_id"),
    skill("proficiency").or(Fill::Int(1)),
    skill("years_of_experience"),
    skill("last_used_date"),
    skill("is_primary_skill").or(Fill::Flag(false)),
    skill("remark"),
];

fn type_rules(table: SourceTable) -> &'static [FieldRule] {
    match table {
        SourceTable::Employee => EMPLOYEE_RULES,
        SourceTable::Freelancer => FREELANCER_RULES,
        SourceTable::BpEmployee => BP_EMPLOYEE_RULES,
    }
}

/// Every rule that applies to an entity row of `table`.
pub fn rules_for(table: SourceTable) -> impl Iterator<Item = &'static FieldRule> {
    SHARED_RULES.iter().chain(type_rules(table).iter())
}

/// Columns that must be non-NULL after default fill.
const REQUIRED: &[(SourceTable, &str)] = &[
    (SourceTable::Employee, "created_at"),
    (SourceTable::Employee, "updated_at"),
    (SourceTable::Freelancer, "created_at"),
    (SourceTable::Freelancer, "updated_at"),
    (SourceTable::BpEmployee, "created_at"),
    (SourceTable::BpEmployee, "updated_at"),
    (SourceTable::BpEmployee, "bp_company_id"),
];

#[derive(Debug, Clone, PartialEq)]
pub struct MappedRecord {
    pub personnel: PersonnelDraft,
    pub detail: Detail,
    pub skills: Vec<SkillRef>,
    /// Skill rows dropped because an earlier row had the same skill id.
    pub collapsed_skills: usize,
}

pub fn map(record: &SourceRecord) -> Result<MappedRecord, MapError> {
    let (personnel, detail) = map_row(record.table, &record.row)?;
    let (skills, collapsed_skills) = map_skills(&record.skills)?;
    Ok(MappedRecord {
        personnel,
        detail,
        skills,
        collapsed_skills,
    })
}

/// Transform one legacy entity row into its personnel and detail drafts.
pub fn map_row(
    table: SourceTable,
    row: &Map<String, Value>,
) -> Result<(PersonnelDraft, Detail), MapError> {
    match row.get("code") {
        Some(Value::String(code)) if !code.trim().is_empty() => {}
        _ => return Err(MapError::MissingCode),
    }
    match row.get("name") {
        Some(Value::String(name)) if !name.trim().is_empty() => {}
        _ => return Err(MapError::BlankName),
    }

    let mut personnel = Map::new();
    let mut detail = Map::new();
    personnel.insert(
        "person_type".into(),
        Value::from(table.person_type().as_str()),
    );

    for rule in rules_for(table) {
        let value = match row.get(rule.source) {
            Some(v) if !v.is_null() => v.clone(),
            _ => rule.fill.value(),
        };
        match rule.slot {
            Slot::Personnel => {
                personnel.insert(rule.target.into(), value);
            }
            Slot::Detail => {
                detail.insert(rule.target.into(), value);
            }
            Slot::Skill => {}
        }
    }

    for &(_, field) in REQUIRED.iter().filter(|(t, _)| *t == table) {
        let present = personnel
            .get(field)
            .or_else(|| detail.get(field))
            .is_some_and(|v| !v.is_null());
        if !present {
            return Err(MapError::MissingField { field });
        }
    }

    let personnel: PersonnelDraft =
        serde_json::from_value(Value::Object(personnel)).map_err(decode)?;
    let detail = Detail::from_value(table.person_type(), Value::Object(detail)).map_err(decode)?;
    Ok((personnel, detail))
}

/// Apply skill defaults and collapse duplicate skill ids, keeping the row
/// with the lowest legacy id.
pub fn map_skills(rows: &[Map<String, Value>]) -> Result<(Vec<SkillRef>, usize), MapError> {
    let mut ordered: Vec<&Map<String, Value>> = rows.iter().collect();
    ordered.sort_by_key(|row| row.get("id").and_then(Value::as_i64).unwrap_or(i64::MAX));

    let mut seen = HashSet::new();
    let mut skills = Vec::with_capacity(ordered.len());
    let mut collapsed = 0usize;
    for row in ordered {
        let skill_id = row
            .get("skill_id")
            .and_then(Value::as_i64)
            .ok_or(MapError::MissingField { field: "skill_id" })?;
        if !seen.insert(skill_id) {
            collapsed += 1;
            continue;
        }
        let mut mapped = Map::new();
        for rule in SKILL_RULES {
            let value = match row.get(rule.source) {
                Some(v) if !v.is_null() => v.clone(),
                _ => rule.fill.value(),
            };
            mapped.insert(rule.target.into(), value);
        }
        skills.push(serde_json::from_value(Value::Object(mapped)).map_err(decode)?);
    }
    Ok((skills, collapsed))
}

/// Run the field tables backwards: unified drafts to a legacy-shaped row.
///
/// The result carries every legacy column the tables know about, but no
/// `id`; callers decide which identity the legacy shape exposes.
pub fn project_legacy(
    personnel: &PersonnelDraft,
    detail: &Detail,
) -> Result<Map<String, Value>, MapError> {
    if personnel.person_type != detail.person_type() {
        return Err(MapError::TypeMismatch {
            personnel: personnel.person_type.as_str(),
            detail: detail.person_type().as_str(),
        });
    }
    let table = SourceTable::for_person_type(personnel.person_type);
    let personnel = match serde_json::to_value(personnel).map_err(decode)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    let detail = match detail.to_value().map_err(decode)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };

    let mut legacy = Map::new();
    for rule in rules_for(table) {
        let source = match rule.slot {
            Slot::Personnel => &personnel,
            Slot::Detail => &detail,
            Slot::Skill => continue,
        };
        let value = source.get(rule.target).cloned().unwrap_or(Value::Null);
        legacy.insert(rule.source.into(), value);
    }
    Ok(legacy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EmploymentStatus, PersonType, SalaryPaymentType};
    use chrono::NaiveDate;
    use serde_json::json;

    fn record(table: SourceTable, row: Value, skills: Vec<Value>) -> SourceRecord {
        SourceRecord {
            table,
            id: row["id"].as_i64().unwrap_or(1),
            row: row.as_object().cloned().unwrap(),
            skills: skills
                .into_iter()
                .map(|s| s.as_object().cloned().unwrap())
                .collect(),
        }
    }

    #[test]
    fn employee_defaults_fill_null_columns() {
        let rec = record(
            SourceTable::Employee,
            json!({"id": 1, "code": "E1", "name": "Taro", "created_at": 10, "updated_at": 11}),
            vec![],
        );
        let mapped = map(&rec).unwrap();
        assert_eq!(mapped.personnel.person_type, PersonType::Employee);
        assert_eq!(mapped.personnel.code, "E1");
        assert_eq!(
            mapped.personnel.employment_status,
            EmploymentStatus::Available
        );
        assert!(mapped.personnel.is_active);
        assert!(!mapped.personnel.remote_work_available);
        let Detail::Employee(detail) = mapped.detail else {
            panic!("expected employee detail");
        };
        assert_eq!(detail.employment_type, "契約社員");
        assert_eq!(detail.salary_payment_type, SalaryPaymentType::Monthly);
        assert_eq!(detail.salary, 0);
    }

    #[test]
    fn present_values_win_over_defaults() {
        let rec = record(
            SourceTable::Freelancer,
            json!({
                "id": 3, "code": "F9", "name": "Hanako", "is_active": 0,
                "employment_status": "退職", "interview_available": 1,
                "hourly_rate": 4500, "created_at": 1, "updated_at": 1
            }),
            vec![],
        );
        let mapped = map(&rec).unwrap();
        assert!(!mapped.personnel.is_active);
        assert_eq!(mapped.personnel.employment_status, EmploymentStatus::Retired);
        assert_eq!(mapped.personnel.hourly_rate, Some(4500.0));
        let Detail::Freelancer(detail) = mapped.detail else {
            panic!("expected freelancer detail");
        };
        assert!(detail.interview_available);
    }

    #[test]
    fn profile_and_contact_columns_are_carried_over() {
        let rec = record(
            SourceTable::Freelancer,
            json!({
                "id": 8, "code": "F8", "name": "Yuki", "marriage_status": "未婚",
                "emergency_contact_name": "Aki", "emergency_contact_phone": "090-0000-0000",
                "emergency_contact_relation": "姉", "education_level": "大学卒", "major": "情報工学",
                "current_project_end_date": "2025-03-31", "preferred_location": "東京",
                "photo_url": "https://cdn.example/p.png", "resume_url": "https://cdn.example/r.pdf",
                "portfolio_url": "https://yuki.example", "preferred_project_type": "受託開発",
                "created_at": 1, "updated_at": 2
            }),
            vec![],
        );
        let mapped = map(&rec).unwrap();
        let p = &mapped.personnel;
        assert_eq!(p.marriage_status.as_deref(), Some("未婚"));
        assert_eq!(p.emergency_contact_name.as_deref(), Some("Aki"));
        assert_eq!(p.emergency_contact_phone.as_deref(), Some("090-0000-0000"));
        assert_eq!(p.emergency_contact_relation.as_deref(), Some("姉"));
        assert_eq!(p.education_level.as_deref(), Some("大学卒"));
        assert_eq!(p.major.as_deref(), Some("情報工学"));
        assert_eq!(p.current_project_end_date, NaiveDate::from_ymd_opt(2025, 3, 31));
        assert_eq!(p.preferred_location.as_deref(), Some("東京"));
        assert_eq!(p.photo_url.as_deref(), Some("https://cdn.example/p.png"));
        assert_eq!(p.resume_url.as_deref(), Some("https://cdn.example/r.pdf"));
        assert_eq!(p.portfolio_url.as_deref(), Some("https://yuki.example"));
        let Detail::Freelancer(detail) = &mapped.detail else {
            panic!("expected freelancer detail");
        };
        assert_eq!(detail.preferred_project_type.as_deref(), Some("受託開発"));

        let legacy = project_legacy(&mapped.personnel, &mapped.detail).unwrap();
        assert_eq!(legacy["preferred_project_type"], json!("受託開発"));
        assert_eq!(legacy["current_project_end_date"], json!("2025-03-31"));
        assert_eq!(legacy["emergency_contact_relation"], json!("姉"));
    }

    #[test]
    fn missing_code_and_blank_name_are_rejected() {
        let no_code = record(
            SourceTable::Employee,
            json!({"id": 1, "code": null, "name": "A", "created_at": 1, "updated_at": 1}),
            vec![],
        );
        assert_eq!(map(&no_code), Err(MapError::MissingCode));

        let blank = record(
            SourceTable::Employee,
            json!({"id": 1, "code": "E2", "name": "   ", "created_at": 1, "updated_at": 1}),
            vec![],
        );
        assert_eq!(map(&blank), Err(MapError::BlankName));
    }

    #[test]
    fn bp_employee_requires_company() {
        let rec = record(
            SourceTable::BpEmployee,
            json!({"id": 5, "code": "B1", "name": "Ken", "created_at": 1, "updated_at": 1}),
            vec![],
        );
        assert_eq!(
            map(&rec),
            Err(MapError::MissingField {
                field: "bp_company_id"
            })
        );
    }

    #[test]
    fn unknown_enum_label_is_a_decode_error() {
        let rec = record(
            SourceTable::Employee,
            json!({
                "id": 1, "code": "E1", "name": "Taro", "salary_payment_type": "週給制",
                "created_at": 1, "updated_at": 1
            }),
            vec![],
        );
        assert!(matches!(map(&rec), Err(MapError::Decode { .. })));
    }

    #[test]
    fn duplicate_skills_collapse_to_lowest_row_id() {
        let rec = record(
            SourceTable::Employee,
            json!({"id": 1, "code": "E1", "name": "Taro", "created_at": 1, "updated_at": 1}),
            vec![
                json!({"id": 12, "skill_id": 3, "proficiency": 5}),
                json!({"id": 10, "skill_id": 3, "proficiency": 2}),
                json!({"id": 11, "skill_id": 4, "is_primary_skill": 1}),
            ],
        );
        let mapped = map(&rec).unwrap();
        assert_eq!(mapped.collapsed_skills, 1);
        assert_eq!(mapped.skills.len(), 2);
        assert_eq!(mapped.skills[0].skill_id, 3);
        assert_eq!(mapped.skills[0].proficiency, 2);
        assert_eq!(mapped.skills[1].skill_id, 4);
        assert_eq!(mapped.skills[1].proficiency, 1);
        assert!(mapped.skills[1].is_primary_skill);
    }

    #[test]
    fn mapping_is_deterministic() {
        let rec = record(
            SourceTable::BpEmployee,
            json!({
                "id": 2, "code": "B2", "name": "Jiro", "bp_company_id": 9,
                "created_at": 1, "updated_at": 2
            }),
            vec![json!({"id": 1, "skill_id": 8})],
        );
        assert_eq!(map(&rec).unwrap(), map(&rec).unwrap());
    }

    #[test]
    fn projection_restores_legacy_columns() {
        let row = json!({
            "id": 4, "code": "E4", "name": "Saburo", "salary": 300000,
            "created_at": 1, "updated_at": 2
        });
        let rec = record(SourceTable::Employee, row, vec![]);
        let mapped = map(&rec).unwrap();
        let legacy = project_legacy(&mapped.personnel, &mapped.detail).unwrap();
        assert_eq!(legacy["code"], json!("E4"));
        assert_eq!(legacy["salary"], json!(300000));
        assert_eq!(legacy["employment_type"], json!("契約社員"));
        assert!(!legacy.contains_key("id"));
        assert!(!legacy.contains_key("work_address"));
    }

    #[test]
    fn every_type_table_has_unique_targets() {
        for table in SourceTable::ALL {
            let mut seen = HashSet::new();
            for rule in rules_for(table) {
                assert!(seen.insert(rule.target), "{table}: duplicate {}", rule.target);
            }
        }
    }
}
