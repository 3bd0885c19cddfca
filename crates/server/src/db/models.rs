//! Table rows and their conversion to domain records.
//!
//! Dates are stored as `YYYY-MM-DD` text and nested lists as JSON text.

use std::str::FromStr;

use canteiro_core::allocation::AllocationField;
use canteiro_core::models::{
    DailyLog, LicenseStatus, PlanId, Project, ProjectStatus, Resource, ResourceKind, Role, Task,
    TaskProgress, Tenant, TenantLimits, User,
};
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{AppError, Result};

const DATE_FORMAT: &str = "%Y-%m-%d";

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

fn parse_date(column: &str, raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT)
        .map_err(|e| AppError::Internal(format!("Invalid date in {column}: {e}")))
}

fn parse_enum<T: FromStr<Err = String>>(raw: &str) -> Result<T> {
    raw.parse().map_err(AppError::Internal)
}

fn parse_json<T: DeserializeOwned + Default>(raw: &str) -> T {
    serde_json::from_str(raw).unwrap_or_default()
}

pub fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| AppError::Internal(format!("Failed to encode column: {e}")))
}

/// Stored allocation column: the raw value the client sent, or NULL.
pub fn allocations_column(field: &AllocationField) -> Result<Option<String>> {
    if field.is_absent() {
        return Ok(None);
    }
    to_json(&field.to_raw()).map(Some)
}

fn parse_allocations(raw: Option<&str>) -> AllocationField {
    match raw {
        Some(raw) => {
            let value = serde_json::from_str::<Value>(raw).unwrap_or(Value::Null);
            AllocationField::parse(&value)
        }
        None => AllocationField::default(),
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TenantRow {
    pub id: String,
    pub name: String,
    pub tax_id: Option<String>,
    pub logo_url: Option<String>,
    pub plan_id: String,
    pub license_ends_on: Option<String>,
    pub status: String,
    pub users_limit: i64,
    pub projects_limit: i64,
    pub labor_limit: i64,
    pub equipment_limit: i64,
    pub roles_limit: i64,
}

pub const TENANT_COLUMNS: &str = "id, name, tax_id, logo_url, plan_id, license_ends_on, status, \
     users_limit, projects_limit, labor_limit, equipment_limit, roles_limit";

impl TryFrom<TenantRow> for Tenant {
    type Error = AppError;

    fn try_from(row: TenantRow) -> Result<Self> {
        let limit = |v: i64| u32::try_from(v.max(0)).unwrap_or(u32::MAX);
        Ok(Tenant {
            plan_id: parse_enum::<PlanId>(&row.plan_id)?,
            license_ends_on: row
                .license_ends_on
                .as_deref()
                .map(|d| parse_date("license_ends_on", d))
                .transpose()?,
            status: parse_enum::<LicenseStatus>(&row.status)?,
            limits: TenantLimits {
                users: limit(row.users_limit),
                projects: limit(row.projects_limit),
                labor: limit(row.labor_limit),
                equipment: limit(row.equipment_limit),
                roles: limit(row.roles_limit),
            },
            id: row.id,
            name: row.name,
            tax_id: row.tax_id,
            logo_url: row.logo_url,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRow {
    pub id: String,
    pub tenant_id: String,
    pub email: String,
    pub name: String,
    pub password_hash: String,
    pub role: String,
    pub active: bool,
    pub job_title: Option<String>,
}

pub const USER_COLUMNS: &str = "id, tenant_id, email, name, password_hash, role, active, job_title";

impl TryFrom<UserRow> for User {
    type Error = AppError;

    fn try_from(row: UserRow) -> Result<Self> {
        Ok(User {
            role: parse_enum::<Role>(&row.role)?,
            id: row.id,
            name: row.name,
            email: row.email,
            tenant_id: row.tenant_id,
            active: row.active,
            job_title: row.job_title,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProjectRow {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub description: Option<String>,
    pub client_name: Option<String>,
    pub location: String,
    pub status: String,
    pub start_date: String,
    pub end_date: String,
    pub budget: f64,
    pub logo_url: Option<String>,
    pub baseline_set: bool,
}

pub const PROJECT_COLUMNS: &str = "id, tenant_id, name, description, client_name, location, \
     status, start_date, end_date, budget, logo_url, baseline_set";

impl TryFrom<ProjectRow> for Project {
    type Error = AppError;

    fn try_from(row: ProjectRow) -> Result<Self> {
        Ok(Project {
            status: parse_enum::<ProjectStatus>(&row.status)?,
            start_date: parse_date("start_date", &row.start_date)?,
            end_date: parse_date("end_date", &row.end_date)?,
            id: row.id,
            tenant_id: row.tenant_id,
            name: row.name,
            description: row.description,
            client_name: row.client_name,
            location: row.location,
            budget: row.budget,
            logo_url: row.logo_url,
            baseline_set: row.baseline_set,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaskRow {
    pub id: String,
    pub tenant_id: String,
    pub project_id: String,
    pub name: String,
    pub wbs: String,
    pub planned_start: String,
    pub planned_end: String,
    pub dependencies: String,
    pub planned_quantity: f64,
    pub done_quantity: f64,
    pub weight: f64,
    pub planned_cost: f64,
    pub allocations: Option<String>,
}

pub const TASK_COLUMNS: &str = "id, tenant_id, project_id, name, wbs, planned_start, planned_end, \
     dependencies, planned_quantity, done_quantity, weight, planned_cost, allocations";

impl TryFrom<TaskRow> for Task {
    type Error = AppError;

    fn try_from(row: TaskRow) -> Result<Self> {
        Ok(Task {
            planned_start: parse_date("planned_start", &row.planned_start)?,
            planned_end: parse_date("planned_end", &row.planned_end)?,
            dependencies: parse_json(&row.dependencies),
            allocations: parse_allocations(row.allocations.as_deref()),
            id: row.id,
            tenant_id: row.tenant_id,
            project_id: row.project_id,
            name: row.name,
            wbs: row.wbs,
            planned_quantity: row.planned_quantity,
            done_quantity: row.done_quantity,
            weight: row.weight,
            planned_cost: row.planned_cost,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ResourceRow {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub kind: String,
    pub hourly_cost: Option<f64>,
    pub active: bool,
}

pub const RESOURCE_COLUMNS: &str = "id, tenant_id, name, kind, hourly_cost, active";

impl TryFrom<ResourceRow> for Resource {
    type Error = AppError;

    fn try_from(row: ResourceRow) -> Result<Self> {
        Ok(Resource {
            kind: parse_enum::<ResourceKind>(&row.kind)?,
            id: row.id,
            tenant_id: row.tenant_id,
            name: row.name,
            hourly_cost: row.hourly_cost,
            active: row.active,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DailyLogRow {
    pub id: String,
    pub tenant_id: String,
    pub project_id: String,
    pub date: String,
    pub author_id: String,
    pub notes: String,
    pub progress: String,
    pub photos: String,
}

pub const DAILY_LOG_COLUMNS: &str =
    "id, tenant_id, project_id, date, author_id, notes, progress, photos";

impl TryFrom<DailyLogRow> for DailyLog {
    type Error = AppError;

    fn try_from(row: DailyLogRow) -> Result<Self> {
        Ok(DailyLog {
            date: parse_date("date", &row.date)?,
            progress: parse_json::<Vec<TaskProgress>>(&row.progress),
            photos: parse_json(&row.photos),
            id: row.id,
            tenant_id: row.tenant_id,
            project_id: row.project_id,
            author_id: row.author_id,
            notes: row.notes,
        })
    }
}

/// Converts fetched rows, failing on the first undecodable one.
pub fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = AppError>,
{
    rows.into_iter().map(T::try_from).collect()
}
