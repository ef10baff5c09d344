//! Shapes of the three legacy entity tables and their skill satellites.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::{EmploymentStatus, PersonType, SalaryPaymentType};

/// Dependent tables that carry legacy `employee_id`/`freelancer_id`/
/// `bp_employee_id` columns and a unified `personnel_id`.
pub const DEPENDENT_TABLES: &[&str] = &[
    "ses_person_evaluation",
    "ses_contract",
    "ses_case_candidate",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SourceTable {
    #[serde(rename = "ses_employee")]
    Employee,
    #[serde(rename = "ses_freelancer")]
    Freelancer,
    #[serde(rename = "ses_bp_employee")]
    BpEmployee,
}

impl SourceTable {
    /// Migration order. Employees first, partner staff last.
    pub const ALL: [SourceTable; 3] = [
        SourceTable::Employee,
        SourceTable::Freelancer,
        SourceTable::BpEmployee,
    ];

    pub const fn table(self) -> &'static str {
        match self {
            SourceTable::Employee => "ses_employee",
            SourceTable::Freelancer => "ses_freelancer",
            SourceTable::BpEmployee => "ses_bp_employee",
        }
    }

    pub const fn skill_table(self) -> &'static str {
        match self {
            SourceTable::Employee => "ses_employee_skill",
            SourceTable::Freelancer => "ses_freelancer_skill",
            SourceTable::BpEmployee => "ses_bp_employee_skill",
        }
    }

    /// Legacy foreign key column, shared by the skill table and every
    /// dependent table.
    pub const fn owner_column(self) -> &'static str {
        match self {
            SourceTable::Employee => "employee_id",
            SourceTable::Freelancer => "freelancer_id",
            SourceTable::BpEmployee => "bp_employee_id",
        }
    }

    pub const fn person_type(self) -> PersonType {
        match self {
            SourceTable::Employee => PersonType::Employee,
            SourceTable::Freelancer => PersonType::Freelancer,
            SourceTable::BpEmployee => PersonType::BpEmployee,
        }
    }

    pub const fn for_person_type(person_type: PersonType) -> Self {
        match person_type {
            PersonType::Employee => SourceTable::Employee,
            PersonType::Freelancer => SourceTable::Freelancer,
            PersonType::BpEmployee => SourceTable::BpEmployee,
        }
    }
}

impl fmt::Display for SourceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

impl FromStr for SourceTable {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SourceTable::ALL
            .into_iter()
            .find(|table| table.table() == s)
            .ok_or_else(|| format!("unknown source table: {s}"))
    }
}

/// An entity row together with its skill rows, as composed by the reader.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub table: SourceTable,
    pub id: i64,
    pub row: Map<String, Value>,
    pub skills: Vec<Map<String, Value>>,
}

impl SourceRecord {
    pub fn code(&self) -> Option<&str> {
        self.row
            .get("code")
            .and_then(Value::as_str)
            .filter(|code| !code.trim().is_empty())
    }
}

/// Columns every legacy entity table has in common.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyCommon {
    pub code: Option<String>,
    pub name: String,
    pub free_kana_name: Option<String>,
    pub age: Option<i64>,
    pub sex: Option<i64>,
    pub birthday: Option<NaiveDate>,
    pub station: Option<String>,
    pub marriage_status: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub emergency_contact_name: Option<String>,
    pub emergency_contact_phone: Option<String>,
    pub emergency_contact_relation: Option<String>,
    pub zip_code: Option<String>,
    pub address: Option<String>,
    pub nationality: Option<String>,
    pub visa_status: Option<String>,
    pub visa_expire_date: Option<NaiveDate>,
    pub japanese_level: Option<String>,
    pub total_experience_years: Option<f64>,
    pub it_experience_years: Option<f64>,
    pub education_level: Option<String>,
    pub major: Option<String>,
    pub certifications: Option<String>,
    pub standard_unit_price: Option<f64>,
    pub employment_status: Option<EmploymentStatus>,
    #[serde(default, with = "crate::model::sqlite_bool::option")]
    pub is_active: Option<bool>,
    pub available_start_date: Option<NaiveDate>,
    pub current_project_end_date: Option<NaiveDate>,
    pub preferred_location: Option<String>,
    pub photo_url: Option<String>,
    pub resume_url: Option<String>,
    pub portfolio_url: Option<String>,
    pub remark: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyEmployee {
    pub id: i64,
    #[serde(flatten)]
    pub common: LegacyCommon,
    pub user_id: Option<i64>,
    #[serde(default, with = "crate::model::sqlite_bool::option")]
    pub remote_work_available: Option<bool>,
    #[serde(default, with = "crate::model::sqlite_bool::option")]
    pub overtime_available: Option<bool>,
    pub joining_time: Option<NaiveDate>,
    pub position: Option<String>,
    pub employment_type: Option<String>,
    pub business_content: Option<String>,
    pub salary_payment_type: Option<SalaryPaymentType>,
    pub salary: Option<i64>,
    pub process_instance_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyFreelancer {
    pub id: i64,
    #[serde(flatten)]
    pub common: LegacyCommon,
    pub work_address: Option<String>,
    pub min_unit_price: Option<f64>,
    pub max_unit_price: Option<f64>,
    pub hourly_rate: Option<f64>,
    pub website_url: Option<String>,
    pub business_name: Option<String>,
    pub tax_number: Option<String>,
    pub business_start_date: Option<NaiveDate>,
    pub freelance_experience_years: Option<f64>,
    pub preferred_project_type: Option<String>,
    pub preferred_work_style: Option<String>,
    pub ng_client_companies: Option<String>,
    #[serde(default, with = "crate::model::sqlite_bool::option")]
    pub interview_available: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyBpEmployee {
    pub id: i64,
    #[serde(flatten)]
    pub common: LegacyCommon,
    pub bp_company_id: Option<i64>,
    pub min_unit_price: Option<f64>,
    pub max_unit_price: Option<f64>,
    #[serde(default, with = "crate::model::sqlite_bool::option")]
    pub remote_work_available: Option<bool>,
    #[serde(default, with = "crate::model::sqlite_bool::option")]
    pub overtime_available: Option<bool>,
    #[serde(default, with = "crate::model::sqlite_bool::option")]
    pub interview_available: Option<bool>,
}

/// A legacy-shaped record as read from or written to a legacy table.
#[derive(Debug, Clone, PartialEq)]
pub enum LegacyRecord {
    Employee(LegacyEmployee),
    Freelancer(LegacyFreelancer),
    BpEmployee(LegacyBpEmployee),
}

impl LegacyRecord {
    pub const fn source_table(&self) -> SourceTable {
        match self {
            LegacyRecord::Employee(_) => SourceTable::Employee,
            LegacyRecord::Freelancer(_) => SourceTable::Freelancer,
            LegacyRecord::BpEmployee(_) => SourceTable::BpEmployee,
        }
    }

    pub const fn person_type(&self) -> PersonType {
        self.source_table().person_type()
    }

    pub fn id(&self) -> i64 {
        match self {
            LegacyRecord::Employee(r) => r.id,
            LegacyRecord::Freelancer(r) => r.id,
            LegacyRecord::BpEmployee(r) => r.id,
        }
    }

    pub fn common(&self) -> &LegacyCommon {
        match self {
            LegacyRecord::Employee(r) => &r.common,
            LegacyRecord::Freelancer(r) => &r.common,
            LegacyRecord::BpEmployee(r) => &r.common,
        }
    }

    pub fn to_map(&self) -> serde_json::Result<Map<String, Value>> {
        let value = match self {
            LegacyRecord::Employee(r) => serde_json::to_value(r)?,
            LegacyRecord::Freelancer(r) => serde_json::to_value(r)?,
            LegacyRecord::BpEmployee(r) => serde_json::to_value(r)?,
        };
        match value {
            Value::Object(map) => Ok(map),
            _ => Ok(Map::new()),
        }
    }

    pub fn from_map(table: SourceTable, map: Map<String, Value>) -> serde_json::Result<Self> {
        let value = Value::Object(map);
        Ok(match table {
            SourceTable::Employee => LegacyRecord::Employee(serde_json::from_value(value)?),
            SourceTable::Freelancer => LegacyRecord::Freelancer(serde_json::from_value(value)?),
            SourceTable::BpEmployee => LegacyRecord::BpEmployee(serde_json::from_value(value)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn table_names_round_trip() {
        for table in SourceTable::ALL {
            assert_eq!(table.table().parse::<SourceTable>().unwrap(), table);
            assert_eq!(SourceTable::for_person_type(table.person_type()), table);
        }
        assert!("ses_partner".parse::<SourceTable>().is_err());
    }

    #[test]
    fn decodes_sqlite_shaped_row() {
        let row = json!({
            "id": 7,
            "code": "E1",
            "name": "Taro",
            "is_active": 1,
            "remote_work_available": 0,
            "employment_status": "稼働中",
            "birthday": "1990-02-03",
            "created_at": 1,
            "updated_at": 2,
            "unknown_column": "ignored"
        });
        let map = row.as_object().cloned().unwrap();
        let record = LegacyRecord::from_map(SourceTable::Employee, map).unwrap();
        let LegacyRecord::Employee(employee) = &record else {
            panic!("expected employee");
        };
        assert_eq!(employee.id, 7);
        assert_eq!(employee.common.code.as_deref(), Some("E1"));
        assert_eq!(employee.common.is_active, Some(true));
        assert_eq!(employee.remote_work_available, Some(false));
        assert_eq!(employee.overtime_available, None);
        assert_eq!(
            employee.common.employment_status,
            Some(EmploymentStatus::Working)
        );
        assert_eq!(record.common().name, "Taro");
        assert_eq!(record.person_type(), PersonType::Employee);
    }
}
