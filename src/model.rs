use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Discriminator stored in `ses_personnel.person_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonType {
    Employee,
    Freelancer,
    BpEmployee,
}

impl PersonType {
    pub const ALL: [PersonType; 3] = [
        PersonType::Employee,
        PersonType::Freelancer,
        PersonType::BpEmployee,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            PersonType::Employee => "employee",
            PersonType::Freelancer => "freelancer",
            PersonType::BpEmployee => "bp_employee",
        }
    }
}

impl fmt::Display for PersonType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PersonType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "employee" => Ok(PersonType::Employee),
            "freelancer" => Ok(PersonType::Freelancer),
            "bp_employee" => Ok(PersonType::BpEmployee),
            other => Err(format!("unknown person type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum EmploymentStatus {
    #[default]
    #[serde(rename = "稼働可能")]
    Available,
    #[serde(rename = "稼働中")]
    Working,
    #[serde(rename = "休暇中")]
    OnLeave,
    #[serde(rename = "稼働不可")]
    Unavailable,
    #[serde(rename = "退職")]
    Retired,
}

impl EmploymentStatus {
    pub const ALL: [EmploymentStatus; 5] = [
        EmploymentStatus::Available,
        EmploymentStatus::Working,
        EmploymentStatus::OnLeave,
        EmploymentStatus::Unavailable,
        EmploymentStatus::Retired,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SalaryPaymentType {
    #[default]
    #[serde(rename = "月給制")]
    Monthly,
    #[serde(rename = "時給制")]
    Hourly,
    #[serde(rename = "日給制")]
    Daily,
    #[serde(rename = "年俸制")]
    Annual,
    #[serde(rename = "歩合制")]
    Commission,
    #[serde(rename = "その他")]
    Other,
}

impl SalaryPaymentType {
    pub const ALL: [SalaryPaymentType; 6] = [
        SalaryPaymentType::Monthly,
        SalaryPaymentType::Hourly,
        SalaryPaymentType::Daily,
        SalaryPaymentType::Annual,
        SalaryPaymentType::Commission,
        SalaryPaymentType::Other,
    ];
}

/// Shared personnel fields, ready to insert into `ses_personnel`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonnelDraft {
    pub person_type: PersonType,
    pub code: String,
    pub user_id: Option<i64>,
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
    pub work_address: Option<String>,
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
    pub min_unit_price: Option<f64>,
    pub max_unit_price: Option<f64>,
    pub hourly_rate: Option<f64>,
    pub employment_status: EmploymentStatus,
    #[serde(with = "sqlite_bool")]
    pub is_active: bool,
    pub available_start_date: Option<NaiveDate>,
    pub current_project_end_date: Option<NaiveDate>,
    pub preferred_location: Option<String>,
    pub photo_url: Option<String>,
    pub resume_url: Option<String>,
    pub portfolio_url: Option<String>,
    #[serde(default, with = "sqlite_bool")]
    pub remote_work_available: bool,
    #[serde(default, with = "sqlite_bool")]
    pub overtime_available: bool,
    pub website_url: Option<String>,
    pub remark: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A stored `ses_personnel` row.
#[derive(Debug, Clone, PartialEq)]
pub struct Personnel {
    pub id: i64,
    pub draft: PersonnelDraft,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmployeeDetail {
    pub joining_time: Option<NaiveDate>,
    pub position: Option<String>,
    pub employment_type: String,
    pub business_content: Option<String>,
    pub salary_payment_type: SalaryPaymentType,
    pub salary: i64,
    pub process_instance_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreelancerDetail {
    pub business_name: Option<String>,
    pub tax_number: Option<String>,
    pub business_start_date: Option<NaiveDate>,
    pub freelance_experience_years: Option<f64>,
    pub preferred_project_type: Option<String>,
    pub preferred_work_style: Option<String>,
    pub ng_client_companies: Option<String>,
    #[serde(with = "sqlite_bool")]
    pub interview_available: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BpEmployeeDetail {
    pub bp_company_id: i64,
    #[serde(with = "sqlite_bool")]
    pub interview_available: bool,
}

/// Type-specific attributes, one variant per person type.
#[derive(Debug, Clone, PartialEq)]
pub enum Detail {
    Employee(EmployeeDetail),
    Freelancer(FreelancerDetail),
    BpEmployee(BpEmployeeDetail),
}

impl Detail {
    pub const fn person_type(&self) -> PersonType {
        match self {
            Detail::Employee(_) => PersonType::Employee,
            Detail::Freelancer(_) => PersonType::Freelancer,
            Detail::BpEmployee(_) => PersonType::BpEmployee,
        }
    }

    pub const fn table_for(person_type: PersonType) -> &'static str {
        match person_type {
            PersonType::Employee => "ses_employee_detail",
            PersonType::Freelancer => "ses_freelancer_detail",
            PersonType::BpEmployee => "ses_bp_employee_detail",
        }
    }

    pub const fn table(&self) -> &'static str {
        Self::table_for(self.person_type())
    }

    pub fn to_value(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            Detail::Employee(d) => serde_json::to_value(d),
            Detail::Freelancer(d) => serde_json::to_value(d),
            Detail::BpEmployee(d) => serde_json::to_value(d),
        }
    }

    pub fn from_value(
        person_type: PersonType,
        value: serde_json::Value,
    ) -> serde_json::Result<Self> {
        Ok(match person_type {
            PersonType::Employee => Detail::Employee(serde_json::from_value(value)?),
            PersonType::Freelancer => Detail::Freelancer(serde_json::from_value(value)?),
            PersonType::BpEmployee => Detail::BpEmployee(serde_json::from_value(value)?),
        })
    }
}

/// One skill association for a personnel row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillRef {
    pub skill_id: i64,
    pub proficiency: i64,
    pub years_of_experience: Option<f64>,
    pub last_used_date: Option<NaiveDate>,
    #[serde(with = "sqlite_bool")]
    pub is_primary_skill: bool,
    pub remark: Option<String>,
}

/// SQLite has no boolean type; flags come back as `0`/`1` integers.
pub(crate) mod sqlite_bool {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bool(*value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        let value = Value::deserialize(deserializer)?;
        from_value(&value).ok_or_else(|| D::Error::custom(format!("expected a flag, got {value}")))
    }

    pub(crate) fn from_value(value: &Value) -> Option<bool> {
        match value {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => n
                .as_i64()
                .map(|v| v != 0)
                .or_else(|| n.as_f64().map(|v| v != 0.0)),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "1" | "true" => Some(true),
                "0" | "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub mod option {
        use serde::de::Error as _;
        use serde::{Deserialize, Deserializer, Serializer};
        use serde_json::Value;

        pub fn serialize<S: Serializer>(
            value: &Option<bool>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(b) => serializer.serialize_some(b),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<bool>, D::Error> {
            let value = Value::deserialize(deserializer)?;
            if value.is_null() {
                return Ok(None);
            }
            super::from_value(&value)
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("expected a flag, got {value}")))
        }
    }
}
