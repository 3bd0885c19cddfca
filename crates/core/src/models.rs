//! Tenant-scoped domain records shared by the core and the backend.
//!
//! Every business record carries the id of the tenant that owns it. The
//! JSON shape is camelCase; the Portuguese field names used by older cached
//! payloads are accepted as aliases on read.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::allocation::AllocationField;

/// A record that lives in a tenant-partitioned collection.
pub trait Entity: Clone {
    const KIND: CollectionKind;

    fn id(&self) -> &str;
    fn set_id(&mut self, id: String);
    fn tenant_id(&self) -> &str;
    fn set_tenant_id(&mut self, tenant_id: String);
}

/// The synchronized collections. The serialized name is the backend table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionKind {
    Projects,
    Tasks,
    Resources,
    DailyLogs,
}

impl CollectionKind {
    pub const ALL: [CollectionKind; 4] = [
        CollectionKind::Projects,
        CollectionKind::Tasks,
        CollectionKind::Resources,
        CollectionKind::DailyLogs,
    ];

    pub fn table(self) -> &'static str {
        match self {
            CollectionKind::Projects => "projects",
            CollectionKind::Tasks => "tasks",
            CollectionKind::Resources => "resources",
            CollectionKind::DailyLogs => "daily_logs",
        }
    }

    /// Prefixes of locally generated ids. The first one is used for new ids.
    pub fn temporary_prefixes(self) -> &'static [&'static str] {
        match self {
            CollectionKind::Projects => &["p-"],
            CollectionKind::Tasks => &["task-"],
            CollectionKind::Resources => &["r-", "res-"],
            CollectionKind::DailyLogs => &["log-"],
        }
    }

    pub fn cache_key(self) -> &'static str {
        match self {
            CollectionKind::Projects => "ep_projects",
            CollectionKind::Tasks => "ep_tasks",
            CollectionKind::Resources => "ep_resources",
            CollectionKind::DailyLogs => "ep_dailyLogs",
        }
    }
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

impl FromStr for CollectionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "projects" => Ok(CollectionKind::Projects),
            "tasks" => Ok(CollectionKind::Tasks),
            "resources" => Ok(CollectionKind::Resources),
            "daily_logs" | "daily-logs" => Ok(CollectionKind::DailyLogs),
            other => Err(format!("unknown table: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Tenant
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LicenseStatus {
    #[serde(alias = "ATIVA")]
    Active,
    #[serde(alias = "SUSPENSA")]
    Suspended,
    #[serde(alias = "EXPIRADA")]
    Expired,
}

impl LicenseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LicenseStatus::Active => "ACTIVE",
            LicenseStatus::Suspended => "SUSPENDED",
            LicenseStatus::Expired => "EXPIRED",
        }
    }
}

impl FromStr for LicenseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" | "ATIVA" => Ok(LicenseStatus::Active),
            "SUSPENDED" | "SUSPENSA" => Ok(LicenseStatus::Suspended),
            "EXPIRED" | "EXPIRADA" => Ok(LicenseStatus::Expired),
            other => Err(format!("unknown license status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanId {
    Basic,
    Pro,
    Enterprise,
}

impl PlanId {
    pub fn as_str(self) -> &'static str {
        match self {
            PlanId::Basic => "BASIC",
            PlanId::Pro => "PRO",
            PlanId::Enterprise => "ENTERPRISE",
        }
    }

    /// Limits granted by the plan when a tenant is created.
    pub fn default_limits(self) -> TenantLimits {
        match self {
            PlanId::Basic => TenantLimits {
                users: 5,
                projects: 2,
                labor: 50,
                equipment: 15,
                roles: 10,
            },
            PlanId::Pro => TenantLimits {
                users: 20,
                projects: 10,
                labor: 150,
                equipment: 50,
                roles: 30,
            },
            PlanId::Enterprise => TenantLimits {
                users: 100,
                projects: 50,
                labor: 500,
                equipment: 200,
                roles: 100,
            },
        }
    }
}

impl FromStr for PlanId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BASIC" => Ok(PlanId::Basic),
            "PRO" => Ok(PlanId::Pro),
            "ENTERPRISE" => Ok(PlanId::Enterprise),
            other => Err(format!("unknown plan: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantLimits {
    pub users: u32,
    pub projects: u32,
    pub labor: u32,
    pub equipment: u32,
    pub roles: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    pub id: String,
    #[serde(alias = "nome")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "cnpj")]
    pub tax_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo_url: Option<String>,
    #[serde(alias = "planoId")]
    pub plan_id: PlanId,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "dataFimLicenca")]
    pub license_ends_on: Option<NaiveDate>,
    pub status: LicenseStatus,
    pub limits: TenantLimits,
}

impl Tenant {
    pub fn is_expired(&self) -> bool {
        self.status == LicenseStatus::Expired
    }
}

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Superadmin,
    Admin,
    #[serde(alias = "PLANEJADOR")]
    Planner,
    #[serde(alias = "ENGENHEIRO")]
    Engineer,
    #[serde(alias = "FINANCEIRO")]
    Finance,
    #[serde(alias = "LEITURA")]
    ReadOnly,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Superadmin => "SUPERADMIN",
            Role::Admin => "ADMIN",
            Role::Planner => "PLANNER",
            Role::Engineer => "ENGINEER",
            Role::Finance => "FINANCE",
            Role::ReadOnly => "READ_ONLY",
        }
    }

    pub fn is_superadmin(self) -> bool {
        self == Role::Superadmin
    }

    pub fn can_write(self) -> bool {
        self != Role::ReadOnly
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUPERADMIN" => Ok(Role::Superadmin),
            "ADMIN" => Ok(Role::Admin),
            "PLANNER" | "PLANEJADOR" => Ok(Role::Planner),
            "ENGINEER" | "ENGENHEIRO" => Ok(Role::Engineer),
            "FINANCE" | "FINANCEIRO" => Ok(Role::Finance),
            "READ_ONLY" | "LEITURA" => Ok(Role::ReadOnly),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    #[serde(alias = "nome")]
    pub name: String,
    pub email: String,
    /// Empty for unauthenticated sessions.
    #[serde(default)]
    pub tenant_id: String,
    pub role: Role,
    #[serde(alias = "ativo")]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "cargo")]
    pub job_title: Option<String>,
}

// ---------------------------------------------------------------------------
// Project
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectStatus {
    #[serde(alias = "PLANEJAMENTO")]
    Planning,
    #[serde(alias = "EXECUCAO")]
    Execution,
    #[serde(alias = "CONCLUIDA")]
    Concluded,
    #[serde(alias = "PARALISADA")]
    Halted,
}

impl ProjectStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProjectStatus::Planning => "PLANNING",
            ProjectStatus::Execution => "EXECUTION",
            ProjectStatus::Concluded => "CONCLUDED",
            ProjectStatus::Halted => "HALTED",
        }
    }
}

impl FromStr for ProjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PLANNING" | "PLANEJAMENTO" => Ok(ProjectStatus::Planning),
            "EXECUTION" | "EXECUCAO" => Ok(ProjectStatus::Execution),
            "CONCLUDED" | "CONCLUIDA" => Ok(ProjectStatus::Concluded),
            "HALTED" | "PARALISADA" => Ok(ProjectStatus::Halted),
            other => Err(format!("unknown project status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(alias = "nome")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "descricao")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "clienteNome")]
    pub client_name: Option<String>,
    #[serde(default, alias = "local")]
    pub location: String,
    pub status: ProjectStatus,
    #[serde(alias = "dataInicio")]
    pub start_date: NaiveDate,
    #[serde(alias = "dataFim")]
    pub end_date: NaiveDate,
    #[serde(default, alias = "orcamento")]
    pub budget: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo_url: Option<String>,
    #[serde(default)]
    pub baseline_set: bool,
}

impl Entity for Project {
    const KIND: CollectionKind = CollectionKind::Projects;

    fn id(&self) -> &str {
        &self.id
    }
    fn set_id(&mut self, id: String) {
        self.id = id;
    }
    fn tenant_id(&self) -> &str {
        &self.tenant_id
    }
    fn set_tenant_id(&mut self, tenant_id: String) {
        self.tenant_id = tenant_id;
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(alias = "obraId")]
    pub project_id: String,
    #[serde(default, alias = "nome")]
    pub name: String,
    #[serde(default)]
    pub wbs: String,
    #[serde(alias = "inicioPlanejado")]
    pub planned_start: NaiveDate,
    #[serde(alias = "fimPlanejado")]
    pub planned_end: NaiveDate,
    #[serde(default, alias = "dependencias")]
    pub dependencies: Vec<String>,
    #[serde(default, alias = "qtdPlanejada")]
    pub planned_quantity: f64,
    #[serde(default, alias = "qtdRealizada")]
    pub done_quantity: f64,
    #[serde(default, alias = "peso")]
    pub weight: f64,
    #[serde(default, alias = "custoPlanejado")]
    pub planned_cost: f64,
    #[serde(
        default,
        alias = "alocacoes",
        skip_serializing_if = "AllocationField::is_absent"
    )]
    pub allocations: AllocationField,
}

impl Task {
    /// Summary rows (stages) have a single-level wbs code; leaf tasks are
    /// nested (`1.2`, `1.2.3`).
    pub fn is_leaf(&self) -> bool {
        self.wbs.contains('.')
    }
}

impl Entity for Task {
    const KIND: CollectionKind = CollectionKind::Tasks;

    fn id(&self) -> &str {
        &self.id
    }
    fn set_id(&mut self, id: String) {
        self.id = id;
    }
    fn tenant_id(&self) -> &str {
        &self.tenant_id
    }
    fn set_tenant_id(&mut self, tenant_id: String) {
        self.tenant_id = tenant_id;
    }
}

// ---------------------------------------------------------------------------
// Resource
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceKind {
    #[serde(alias = "HUMANO")]
    Human,
    #[serde(alias = "EQUIPAMENTO")]
    Equipment,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Human => "HUMAN",
            ResourceKind::Equipment => "EQUIPMENT",
        }
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HUMAN" | "HUMANO" => Ok(ResourceKind::Human),
            "EQUIPMENT" | "EQUIPAMENTO" => Ok(ResourceKind::Equipment),
            other => Err(format!("unknown resource kind: {other}")),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_resource_kind() -> ResourceKind {
    ResourceKind::Human
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub id: String,
    #[serde(default)]
    pub tenant_id: String,
    /// Acts as the role/category label in the histogram.
    #[serde(alias = "nome")]
    pub name: String,
    #[serde(default = "default_resource_kind", alias = "tipo")]
    pub kind: ResourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "custoHora")]
    pub hourly_cost: Option<f64>,
    #[serde(default = "default_true", alias = "ativo")]
    pub active: bool,
}

impl Entity for Resource {
    const KIND: CollectionKind = CollectionKind::Resources;

    fn id(&self) -> &str {
        &self.id
    }
    fn set_id(&mut self, id: String) {
        self.id = id;
    }
    fn tenant_id(&self) -> &str {
        &self.tenant_id
    }
    fn set_tenant_id(&mut self, tenant_id: String) {
        self.tenant_id = tenant_id;
    }
}

// ---------------------------------------------------------------------------
// Daily log (RDO)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgress {
    #[serde(alias = "tarefaId")]
    pub task_id: String,
    #[serde(alias = "quantidade")]
    pub quantity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyLog {
    pub id: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(alias = "obraId")]
    pub project_id: String,
    #[serde(alias = "data")]
    pub date: NaiveDate,
    #[serde(default, alias = "usuarioId")]
    pub author_id: String,
    #[serde(default, alias = "observacoes")]
    pub notes: String,
    #[serde(default, alias = "avancos")]
    pub progress: Vec<TaskProgress>,
    #[serde(default, alias = "fotos")]
    pub photos: Vec<String>,
}

impl Entity for DailyLog {
    const KIND: CollectionKind = CollectionKind::DailyLogs;

    fn id(&self) -> &str {
        &self.id
    }
    fn set_id(&mut self, id: String) {
        self.id = id;
    }
    fn tenant_id(&self) -> &str {
        &self.tenant_id
    }
    fn set_tenant_id(&mut self, tenant_id: String) {
        self.tenant_id = tenant_id;
    }
}

/// Everything a tenant owns, as returned by the initial load.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialData {
    pub projects: Vec<Project>,
    pub tasks: Vec<Task>,
    pub resources: Vec<Resource>,
    pub daily_logs: Vec<DailyLog>,
}
