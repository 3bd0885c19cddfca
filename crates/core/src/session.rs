//! Session state: the single owner of every entity collection.
//!
//! Collections are held behind `Arc` and replaced wholesale on every
//! mutation, so a snapshot handed to a reader never changes under it.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::error::{CoreError, Result};
use crate::models::{
    CollectionKind, DailyLog, Entity, InitialData, Project, Resource, ResourceKind, Task, Tenant,
    User,
};
use crate::realtime::{self, ChangeEvent};
use crate::reconcile::{self, IdMapping};
use crate::tenancy;

#[derive(Debug, Clone, Default)]
pub struct SessionState {
    user: Option<User>,
    tenants: Arc<Vec<Tenant>>,
    projects: Arc<Vec<Project>>,
    tasks: Arc<Vec<Task>>,
    resources: Arc<Vec<Resource>>,
    daily_logs: Arc<Vec<DailyLog>>,
    selected_project: Option<Project>,
}

/// Upserts by id within the record's tenant.
fn upsert<T: Entity>(items: &[T], record: T) -> Vec<T> {
    let mut next = items.to_vec();
    match next
        .iter_mut()
        .find(|item| item.id() == record.id() && item.tenant_id() == record.tenant_id())
    {
        Some(existing) => *existing = record,
        None => next.push(record),
    }
    next
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Identity
    // -----------------------------------------------------------------------

    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn is_logged_in(&self) -> bool {
        self.user.is_some()
    }

    /// Tenant of the logged-in user; empty before login.
    pub fn tenant_id(&self) -> &str {
        self.user.as_ref().map_or("", |u| u.tenant_id.as_str())
    }

    pub fn login(&mut self, user: User) {
        info!(user_id = %user.id, tenant_id = %user.tenant_id, "Session started");
        if self
            .selected_project
            .as_ref()
            .is_some_and(|p| p.tenant_id != user.tenant_id)
        {
            self.selected_project = None;
        }
        self.user = Some(user);
    }

    pub fn logout(&mut self) {
        if let Some(user) = self.user.take() {
            info!(user_id = %user.id, "Session ended");
        }
        self.selected_project = None;
    }

    fn writer(&self) -> Result<&User> {
        let user = self.user.as_ref().ok_or(CoreError::Unauthorized)?;
        if !user.role.can_write() {
            return Err(CoreError::Forbidden("read-only users cannot edit".into()));
        }
        if user.tenant_id.is_empty() {
            return Err(CoreError::Forbidden("no tenant selected".into()));
        }
        Ok(user)
    }

    // -----------------------------------------------------------------------
    // Tenants
    // -----------------------------------------------------------------------

    pub fn tenants(&self) -> &Arc<Vec<Tenant>> {
        &self.tenants
    }

    pub fn set_tenants(&mut self, tenants: Vec<Tenant>) {
        self.tenants = Arc::new(tenants);
    }

    pub fn upsert_tenant(&mut self, tenant: Tenant) {
        let mut next = self.tenants.to_vec();
        match next.iter_mut().find(|t| t.id == tenant.id) {
            Some(existing) => *existing = tenant,
            None => next.push(tenant),
        }
        self.tenants = Arc::new(next);
    }

    pub fn active_tenant(&self) -> Option<&Tenant> {
        self.user
            .as_ref()
            .and_then(|user| tenancy::active_tenant(user, &self.tenants))
    }

    /// An expired license locks everyone but the superadmin out.
    pub fn license_blocked(&self) -> bool {
        let superadmin = self.user.as_ref().is_some_and(|u| u.role.is_superadmin());
        !superadmin && self.active_tenant().is_some_and(Tenant::is_expired)
    }

    // -----------------------------------------------------------------------
    // Global collections and tenant views
    // -----------------------------------------------------------------------

    pub fn projects(&self) -> &Arc<Vec<Project>> {
        &self.projects
    }

    pub fn tasks(&self) -> &Arc<Vec<Task>> {
        &self.tasks
    }

    pub fn resources(&self) -> &Arc<Vec<Resource>> {
        &self.resources
    }

    pub fn daily_logs(&self) -> &Arc<Vec<DailyLog>> {
        &self.daily_logs
    }

    pub fn tenant_projects(&self) -> Vec<Project> {
        tenancy::scope(&self.projects, self.tenant_id())
    }

    pub fn tenant_tasks(&self) -> Vec<Task> {
        tenancy::scope(&self.tasks, self.tenant_id())
    }

    pub fn tenant_resources(&self) -> Vec<Resource> {
        tenancy::scope(&self.resources, self.tenant_id())
    }

    pub fn tenant_daily_logs(&self) -> Vec<DailyLog> {
        tenancy::scope(&self.daily_logs, self.tenant_id())
    }

    /// Replaces every collection slice of `tenant_id` with `data`.
    pub fn replace_tenant_data(&mut self, tenant_id: &str, data: InitialData) {
        self.projects = Arc::new(tenancy::merge_tenant_slice(&self.projects, tenant_id, data.projects));
        self.tasks = Arc::new(tenancy::merge_tenant_slice(&self.tasks, tenant_id, data.tasks));
        self.resources = Arc::new(tenancy::merge_tenant_slice(
            &self.resources,
            tenant_id,
            data.resources,
        ));
        self.daily_logs = Arc::new(tenancy::merge_tenant_slice(
            &self.daily_logs,
            tenant_id,
            data.daily_logs,
        ));
        self.ensure_selection();
    }

    /// Restores global collections as cached, without tenant rewriting.
    pub fn restore(
        &mut self,
        projects: Vec<Project>,
        tasks: Vec<Task>,
        resources: Vec<Resource>,
        daily_logs: Vec<DailyLog>,
    ) {
        self.projects = Arc::new(projects);
        self.tasks = Arc::new(tasks);
        self.resources = Arc::new(resources);
        self.daily_logs = Arc::new(daily_logs);
        self.ensure_selection();
    }

    // -----------------------------------------------------------------------
    // Projects
    // -----------------------------------------------------------------------

    pub fn upsert_project(&mut self, mut project: Project) -> Result<()> {
        let tenant_id = self.writer()?.tenant_id.clone();
        project.tenant_id = tenant_id;

        let is_new = !tenancy::scoped(&self.projects, &project.tenant_id).any(|p| p.id == project.id);
        if is_new {
            if let Some(tenant) = self.active_tenant() {
                let count = self.tenant_projects().len();
                if count >= tenant.limits.projects as usize {
                    return Err(CoreError::Validation(format!(
                        "plan limit reached: {} projects",
                        tenant.limits.projects
                    )));
                }
            }
        }

        if self
            .selected_project
            .as_ref()
            .is_some_and(|p| p.id == project.id)
        {
            self.selected_project = Some(project.clone());
        }
        self.projects = Arc::new(upsert(&self.projects, project));
        Ok(())
    }

    /// Removes a project of the session tenant and its daily logs.
    pub fn remove_project(&mut self, id: &str) -> Result<bool> {
        let tenant_id = self.writer()?.tenant_id.clone();
        let owned = |p: &Project| p.id == id && p.tenant_id == tenant_id;
        if !self.projects.iter().any(|p| owned(p)) {
            return Ok(false);
        }

        self.projects = Arc::new(self.projects.iter().filter(|p| !owned(*p)).cloned().collect());
        self.daily_logs = Arc::new(
            self.daily_logs
                .iter()
                .filter(|l| !(l.project_id == id && l.tenant_id == tenant_id))
                .cloned()
                .collect(),
        );
        if self.selected_project.as_ref().is_some_and(|p| p.id == id) {
            self.selected_project = None;
        }
        Ok(true)
    }

    pub fn selected_project(&self) -> Option<&Project> {
        self.selected_project.as_ref()
    }

    pub fn select_project(&mut self, id: &str) -> Result<()> {
        let tenant_id = self.tenant_id();
        let project = tenancy::scoped(&self.projects, tenant_id)
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| CoreError::Validation(format!("project {id} not found")))?;
        self.selected_project = Some(project);
        Ok(())
    }

    /// Keeps the selection inside the session tenant, falling back to the
    /// tenant's first project.
    pub fn ensure_selection(&mut self) {
        let tenant_id = self.tenant_id().to_string();
        let current = self.selected_project.as_ref().and_then(|selected| {
            self.projects
                .iter()
                .find(|p| p.id == selected.id && p.tenant_id == tenant_id)
        });
        self.selected_project = current
            .or_else(|| tenancy::scoped(&self.projects, &tenant_id).next())
            .cloned();
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    /// Replaces the session tenant's tasks, keeping other tenants' tasks.
    pub fn replace_tenant_tasks(&mut self, tasks: Vec<Task>) -> Result<()> {
        let tenant_id = self.writer()?.tenant_id.clone();
        self.tasks = Arc::new(tenancy::merge_tenant_slice(&self.tasks, &tenant_id, tasks));
        Ok(())
    }

    pub fn upsert_task(&mut self, mut task: Task) -> Result<()> {
        task.tenant_id = self.writer()?.tenant_id.clone();
        self.tasks = Arc::new(upsert(&self.tasks, task));
        Ok(())
    }

    pub fn remove_task(&mut self, id: &str) -> Result<bool> {
        let tenant_id = self.writer()?.tenant_id.clone();
        let before = self.tasks.len();
        let next: Vec<Task> = self
            .tasks
            .iter()
            .filter(|t| !(t.id == id && t.tenant_id == tenant_id))
            .cloned()
            .collect();
        let removed = next.len() != before;
        if removed {
            self.tasks = Arc::new(next);
        }
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Resources
    // -----------------------------------------------------------------------

    pub fn upsert_resource(&mut self, mut resource: Resource) -> Result<()> {
        resource.tenant_id = self.writer()?.tenant_id.clone();

        let is_new =
            !tenancy::scoped(&self.resources, &resource.tenant_id).any(|r| r.id == resource.id);
        if is_new {
            if let Some(tenant) = self.active_tenant() {
                let limit = match resource.kind {
                    ResourceKind::Human => tenant.limits.labor,
                    ResourceKind::Equipment => tenant.limits.equipment,
                };
                let count = tenancy::scoped(&self.resources, &resource.tenant_id)
                    .filter(|r| r.kind == resource.kind)
                    .count();
                if count >= limit as usize {
                    return Err(CoreError::Validation(format!(
                        "plan limit reached: {limit} {} resources",
                        resource.kind.as_str().to_lowercase()
                    )));
                }
            }
        }

        self.resources = Arc::new(upsert(&self.resources, resource));
        Ok(())
    }

    /// Removes a resource and strips its allocations from the tenant's
    /// tasks. Returns whether any task changed.
    pub fn remove_resource(&mut self, id: &str) -> Result<bool> {
        let tenant_id = self.writer()?.tenant_id.clone();
        self.resources = Arc::new(
            self.resources
                .iter()
                .filter(|r| !(r.id == id && r.tenant_id == tenant_id))
                .cloned()
                .collect(),
        );

        let mut tasks_changed = false;
        let tasks: Vec<Task> = self
            .tasks
            .iter()
            .map(|task| {
                if task.tenant_id == tenant_id && task.allocations.references(id) {
                    tasks_changed = true;
                    let mut task = task.clone();
                    task.allocations = task.allocations.without_resource(id);
                    task
                } else {
                    task.clone()
                }
            })
            .collect();
        if tasks_changed {
            debug!(resource_id = id, "Stripped allocations of removed resource");
            self.tasks = Arc::new(tasks);
        }
        Ok(tasks_changed)
    }

    // -----------------------------------------------------------------------
    // Daily logs
    // -----------------------------------------------------------------------

    pub fn upsert_daily_log(&mut self, mut log: DailyLog) -> Result<()> {
        log.tenant_id = self.writer()?.tenant_id.clone();
        self.daily_logs = Arc::new(upsert(&self.daily_logs, log));
        Ok(())
    }

    pub fn remove_daily_log(&mut self, id: &str) -> Result<bool> {
        let tenant_id = self.writer()?.tenant_id.clone();
        let before = self.daily_logs.len();
        let next: Vec<DailyLog> = self
            .daily_logs
            .iter()
            .filter(|l| !(l.id == id && l.tenant_id == tenant_id))
            .cloned()
            .collect();
        let removed = next.len() != before;
        if removed {
            self.daily_logs = Arc::new(next);
        }
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Reconciliation and real-time changes
    // -----------------------------------------------------------------------

    /// Applies an id mapping returned by a sync of `kind`.
    ///
    /// The owning collection gets its ids rewritten; references held by the
    /// selection and by other records follow. Returns the collections whose
    /// content changed, owning collection first.
    pub fn apply_id_mapping(&mut self, kind: CollectionKind, mapping: &IdMapping) -> Vec<CollectionKind> {
        if mapping.is_empty() {
            return Vec::new();
        }

        let tenant_id = self.tenant_id().to_string();
        let tenant = tenant_id.as_str();
        let mut changed = Vec::new();
        match kind {
            CollectionKind::Projects => {
                let (projects, n) = reconcile::apply_mapping(&self.projects, mapping, tenant);
                if n > 0 {
                    self.projects = Arc::new(projects);
                    changed.push(CollectionKind::Projects);
                }
                if let Some(selected) = self.selected_project.as_mut() {
                    mapping.remap(&mut selected.id);
                }
                if let Some(tasks) = remap_each(&self.tasks, tenant, |t| mapping.remap(&mut t.project_id)) {
                    self.tasks = Arc::new(tasks);
                    changed.push(CollectionKind::Tasks);
                }
                if let Some(logs) = remap_each(&self.daily_logs, tenant, |l| mapping.remap(&mut l.project_id)) {
                    self.daily_logs = Arc::new(logs);
                    changed.push(CollectionKind::DailyLogs);
                }
            }
            CollectionKind::Tasks => {
                let (tasks, n) = reconcile::apply_mapping(&self.tasks, mapping, tenant);
                let remapped = remap_each(&tasks, tenant, |t| {
                    let mut any = false;
                    for dep in &mut t.dependencies {
                        any |= mapping.remap(dep);
                    }
                    any
                });
                if n > 0 || remapped.is_some() {
                    self.tasks = Arc::new(remapped.unwrap_or(tasks));
                    changed.push(CollectionKind::Tasks);
                }
                if let Some(logs) = remap_each(&self.daily_logs, tenant, |l| {
                    let mut any = false;
                    for entry in &mut l.progress {
                        any |= mapping.remap(&mut entry.task_id);
                    }
                    any
                }) {
                    self.daily_logs = Arc::new(logs);
                    changed.push(CollectionKind::DailyLogs);
                }
            }
            CollectionKind::Resources => {
                let (resources, n) = reconcile::apply_mapping(&self.resources, mapping, tenant);
                if n > 0 {
                    self.resources = Arc::new(resources);
                    changed.push(CollectionKind::Resources);
                }
                if let Some(tasks) = remap_each(&self.tasks, tenant, |t| {
                    match t.allocations.remap_resources(mapping) {
                        Some(allocations) => {
                            t.allocations = allocations;
                            true
                        }
                        None => false,
                    }
                }) {
                    self.tasks = Arc::new(tasks);
                    changed.push(CollectionKind::Tasks);
                }
            }
            CollectionKind::DailyLogs => {
                let (logs, n) = reconcile::apply_mapping(&self.daily_logs, mapping, tenant);
                if n > 0 {
                    self.daily_logs = Arc::new(logs);
                    changed.push(CollectionKind::DailyLogs);
                }
            }
        }

        info!(kind = %kind, mapped = mapping.len(), "Applied id mapping");
        changed
    }

    /// Applies a pushed change. Events of other tenants are ignored.
    pub fn apply_change(&mut self, event: &ChangeEvent) -> Result<bool> {
        let tenant_id = self.tenant_id();
        if tenant_id.is_empty() || event.tenant_id().is_some_and(|t| t != tenant_id) {
            return Ok(false);
        }

        let tenant_id = tenant_id.to_string();
        let changed = match event.table {
            CollectionKind::Projects => apply_scoped(&mut self.projects, event, &tenant_id)?,
            CollectionKind::Tasks => apply_scoped(&mut self.tasks, event, &tenant_id)?,
            CollectionKind::Resources => apply_scoped(&mut self.resources, event, &tenant_id)?,
            CollectionKind::DailyLogs => apply_scoped(&mut self.daily_logs, event, &tenant_id)?,
        };
        if changed && event.table == CollectionKind::Projects {
            self.ensure_selection();
        }
        Ok(changed)
    }
}

/// Clones the collection with `f` applied to every record of `tenant_id`;
/// `None` when `f` reported no change anywhere.
fn remap_each<T: Entity>(
    items: &[T],
    tenant_id: &str,
    mut f: impl FnMut(&mut T) -> bool,
) -> Option<Vec<T>> {
    let mut any = false;
    let next: Vec<T> = items
        .iter()
        .map(|item| {
            let mut item = item.clone();
            if item.tenant_id() == tenant_id {
                any |= f(&mut item);
            }
            item
        })
        .collect();
    any.then_some(next)
}

fn apply_scoped<T: Entity + DeserializeOwned>(
    items: &mut Arc<Vec<T>>,
    event: &ChangeEvent,
    tenant_id: &str,
) -> Result<bool> {
    match realtime::apply_change(items, event, tenant_id)? {
        Some(next) => {
            *items = Arc::new(next);
            Ok(true)
        }
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use serde_json::json;

    use super::*;
    use crate::allocation::{AllocationField, AllocationShape};
    use crate::models::{LicenseStatus, PlanId, ProjectStatus, Role, TaskProgress, TenantLimits};

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn user(tenant: &str, role: Role) -> User {
        User {
            id: "u1".into(),
            name: "Ana".into(),
            email: "ana@example.com".into(),
            tenant_id: tenant.into(),
            role,
            active: true,
            job_title: None,
        }
    }

    fn tenant(id: &str, projects: u32) -> Tenant {
        Tenant {
            id: id.into(),
            name: id.to_uppercase(),
            tax_id: None,
            logo_url: None,
            plan_id: PlanId::Basic,
            license_ends_on: None,
            status: LicenseStatus::Active,
            limits: TenantLimits {
                users: 5,
                projects,
                labor: 1,
                equipment: 1,
                roles: 10,
            },
        }
    }

    fn project(id: &str, tenant: &str) -> Project {
        Project {
            id: id.into(),
            tenant_id: tenant.into(),
            name: format!("Obra {id}"),
            description: None,
            client_name: None,
            location: "Centro".into(),
            status: ProjectStatus::Planning,
            start_date: date("2025-01-06"),
            end_date: date("2025-04-30"),
            budget: 0.0,
            logo_url: None,
            baseline_set: false,
        }
    }

    fn task(id: &str, project_id: &str, allocations: AllocationField) -> Task {
        Task {
            id: id.into(),
            tenant_id: "c1".into(),
            project_id: project_id.into(),
            name: "Alvenaria".into(),
            wbs: "1.1".into(),
            planned_start: date("2025-01-06"),
            planned_end: date("2025-01-10"),
            dependencies: Vec::new(),
            planned_quantity: 0.0,
            done_quantity: 0.0,
            weight: 0.0,
            planned_cost: 0.0,
            allocations,
        }
    }

    fn resource(id: &str, kind: ResourceKind) -> Resource {
        Resource {
            id: id.into(),
            tenant_id: "c1".into(),
            name: "Pedreiro".into(),
            kind,
            hourly_cost: None,
            active: true,
        }
    }

    fn log(id: &str, project_id: &str) -> DailyLog {
        DailyLog {
            id: id.into(),
            tenant_id: "c1".into(),
            project_id: project_id.into(),
            date: date("2025-01-07"),
            author_id: "u1".into(),
            notes: "Chuva pela manhã".into(),
            progress: Vec::new(),
            photos: Vec::new(),
        }
    }

    fn session() -> SessionState {
        let mut state = SessionState::new();
        state.set_tenants(vec![tenant("c1", 10), tenant("c2", 10)]);
        state.login(user("c1", Role::Admin));
        state
    }

    #[test]
    fn upsert_forces_session_tenant() {
        let mut state = session();
        state.upsert_project(project("p-1", "c2")).unwrap();

        assert_eq!(state.projects()[0].tenant_id, "c1");
        assert_eq!(state.tenant_projects().len(), 1);
    }

    #[test]
    fn read_only_user_cannot_edit() {
        let mut state = session();
        state.login(user("c1", Role::ReadOnly));
        assert!(matches!(
            state.upsert_project(project("p-1", "c1")),
            Err(CoreError::Forbidden(_))
        ));
    }

    #[test]
    fn project_limit_is_enforced() {
        let mut state = SessionState::new();
        state.set_tenants(vec![tenant("c1", 1)]);
        state.login(user("c1", Role::Admin));

        state.upsert_project(project("p-1", "c1")).unwrap();
        state.upsert_project(project("p-1", "c1")).unwrap();
        assert!(matches!(
            state.upsert_project(project("p-2", "c1")),
            Err(CoreError::Validation(_))
        ));
    }

    #[test]
    fn removing_project_cascades_logs_and_selection() {
        let mut state = session();
        state.upsert_project(project("p-1", "c1")).unwrap();
        state.upsert_project(project("p-2", "c1")).unwrap();
        state.upsert_daily_log(log("log-1", "p-1")).unwrap();
        state.upsert_daily_log(log("log-2", "p-2")).unwrap();
        state.select_project("p-1").unwrap();

        assert!(state.remove_project("p-1").unwrap());
        assert_eq!(state.tenant_daily_logs().len(), 1);
        assert_eq!(state.tenant_daily_logs()[0].id, "log-2");
        assert!(state.selected_project().is_none());
        assert!(!state.remove_project("p-1").unwrap());
    }

    #[test]
    fn removing_resource_strips_allocations_keeping_shape() {
        let mut state = session();
        state.upsert_resource(resource("r1", ResourceKind::Human)).unwrap();
        let text = AllocationField::parse(&json!("[\"R1 \",\"r2\"]"));
        state.upsert_task(task("t1", "p1", text)).unwrap();

        assert!(state.remove_resource("r1").unwrap());
        let task = &state.tenant_tasks()[0];
        assert_eq!(task.allocations.shape(), AllocationShape::Text);
        assert_eq!(task.allocations.len(), 1);
        assert!(state.tenant_resources().is_empty());
    }

    #[test]
    fn resource_limit_counts_by_kind() {
        let mut state = session();
        state.upsert_resource(resource("r1", ResourceKind::Human)).unwrap();
        state.upsert_resource(resource("e1", ResourceKind::Equipment)).unwrap();
        assert!(state.upsert_resource(resource("r2", ResourceKind::Human)).is_err());
    }

    #[test]
    fn project_mapping_follows_selection_and_children() {
        let mut state = session();
        state.upsert_project(project("p-1", "c1")).unwrap();
        state.upsert_task(task("t1", "p-1", AllocationField::default())).unwrap();
        state.upsert_daily_log(log("log-1", "p-1")).unwrap();
        state.select_project("p-1").unwrap();

        let mut mapping = IdMapping::new();
        mapping.insert("p-1", "a3c9");
        let changed = state.apply_id_mapping(CollectionKind::Projects, &mapping);

        assert_eq!(
            changed,
            vec![CollectionKind::Projects, CollectionKind::Tasks, CollectionKind::DailyLogs]
        );
        assert_eq!(state.projects()[0].id, "a3c9");
        assert_eq!(state.selected_project().unwrap().id, "a3c9");
        assert_eq!(state.tasks()[0].project_id, "a3c9");
        assert_eq!(state.daily_logs()[0].project_id, "a3c9");

        let projects = Arc::clone(state.projects());
        assert!(state.apply_id_mapping(CollectionKind::Projects, &mapping).is_empty());
        assert!(Arc::ptr_eq(&projects, state.projects()));
    }

    #[test]
    fn colliding_temporary_ids_stay_within_their_tenant() {
        let mut state = session();
        let foreign = project("p-1", "c2");
        state.restore(vec![foreign.clone()], Vec::new(), Vec::new(), Vec::new());

        state.upsert_project(project("p-1", "c1")).unwrap();
        assert_eq!(state.projects().len(), 2);
        assert_eq!(state.projects()[0], foreign);

        let mut mapping = IdMapping::new();
        mapping.insert("p-1", "a3c9");
        state.apply_id_mapping(CollectionKind::Projects, &mapping);

        assert_eq!(state.projects()[0], foreign);
        assert_eq!(state.projects()[1].id, "a3c9");

        let delete: ChangeEvent =
            serde_json::from_value(json!({"table": "projects", "kind": "DELETE", "old": {"id": "p-1"}}))
                .unwrap();
        assert!(!state.apply_change(&delete).unwrap());
        assert_eq!(state.projects()[0], foreign);
    }

    #[test]
    fn resource_mapping_rewrites_allocations() {
        let mut state = session();
        state.upsert_resource(resource("r-1", ResourceKind::Human)).unwrap();
        let allocations = AllocationField::parse(&json!([{"recursoId": "r-1", "quantidade": 2}]));
        state.upsert_task(task("t1", "p1", allocations)).unwrap();

        let mut mapping = IdMapping::new();
        mapping.insert("r-1", "b7d1");
        let changed = state.apply_id_mapping(CollectionKind::Resources, &mapping);

        assert_eq!(changed, vec![CollectionKind::Resources, CollectionKind::Tasks]);
        assert_eq!(state.tasks()[0].allocations.items()[0].resource_id, "b7d1");
    }

    #[test]
    fn task_mapping_rewrites_log_progress() {
        let mut state = session();
        state.upsert_task(task("task-1", "p1", AllocationField::default())).unwrap();
        let mut entry = log("log-1", "p1");
        entry.progress.push(TaskProgress {
            task_id: "task-1".into(),
            quantity: 3.0,
        });
        state.upsert_daily_log(entry).unwrap();

        let mut mapping = IdMapping::new();
        mapping.insert("task-1", "c0ff");
        state.apply_id_mapping(CollectionKind::Tasks, &mapping);
        assert_eq!(state.daily_logs()[0].progress[0].task_id, "c0ff");
    }

    #[test]
    fn change_events_of_other_tenants_are_ignored() {
        let mut state = session();
        let foreign = ChangeEvent::inserted(&project("x1", "c2")).unwrap();
        assert!(!state.apply_change(&foreign).unwrap());
        assert!(state.projects().is_empty());

        let own = ChangeEvent::inserted(&project("a1", "c1")).unwrap();
        assert!(state.apply_change(&own).unwrap());
        assert_eq!(state.selected_project().unwrap().id, "a1");
    }

    #[test]
    fn expired_license_blocks_non_superadmins() {
        let mut state = session();
        let mut expired = tenant("c1", 10);
        expired.status = LicenseStatus::Expired;
        state.upsert_tenant(expired);
        assert!(state.license_blocked());

        state.login(user("master", Role::Superadmin));
        assert!(!state.license_blocked());
    }

    #[test]
    fn logout_empties_views_but_keeps_collections() {
        let mut state = session();
        state.upsert_project(project("p-1", "c1")).unwrap();
        state.logout();

        assert!(state.tenant_projects().is_empty());
        assert_eq!(state.projects().len(), 1);
    }
}
