//! In-process [`RemoteStore`] used for offline demos and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::models::{
    CollectionKind, DailyLog, Entity, InitialData, Project, Resource, Task, Tenant,
};
use crate::realtime::ChangeEvent;
use crate::reconcile::{self, IdMapping};
use crate::remote::RemoteStore;

type ChannelKey = (String, CollectionKind);

#[derive(Default)]
struct Tables {
    tenants: Vec<Tenant>,
    data: InitialData,
}

/// Keeps every table in memory and fans out change events per
/// `(tenant, table)`.
pub struct MemoryRemote {
    tables: Mutex<Tables>,
    channels: Mutex<HashMap<ChannelKey, broadcast::Sender<ChangeEvent>>>,
    available: AtomicBool,
    failing: AtomicBool,
    sync_calls: Mutex<HashMap<CollectionKind, usize>>,
    deletes: AtomicUsize,
    latency_ms: AtomicU64,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            channels: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            failing: AtomicBool::new(false),
            sync_calls: Mutex::new(HashMap::new()),
            deletes: AtomicUsize::new(0),
            latency_ms: AtomicU64::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Makes every subsequent write fail with a remote error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Delays every batch write, as a slow network would.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis().try_into().unwrap_or(u64::MAX), Ordering::SeqCst);
    }

    async fn in_flight(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    pub fn sync_calls(&self, kind: CollectionKind) -> usize {
        self.sync_calls
            .lock()
            .map(|calls| calls.get(&kind).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn delete_calls(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn insert_tenant(&self, tenant: Tenant) -> Result<()> {
        let mut tables = self.lock_tables()?;
        tables.tenants.retain(|t| t.id != tenant.id);
        tables.tenants.push(tenant);
        Ok(())
    }

    /// Stored rows of `tenant_id`.
    pub fn snapshot(&self, tenant_id: &str) -> Result<InitialData> {
        let tables = self.lock_tables()?;
        Ok(InitialData {
            projects: owned_by(&tables.data.projects, tenant_id),
            tasks: owned_by(&tables.data.tasks, tenant_id),
            resources: owned_by(&tables.data.resources, tenant_id),
            daily_logs: owned_by(&tables.data.daily_logs, tenant_id),
        })
    }

    /// Publishes an event as if another client had written the row.
    pub fn push_change(&self, tenant_id: &str, event: ChangeEvent) {
        let key = (tenant_id.to_string(), event.table);
        if let Ok(channels) = self.channels.lock() {
            if let Some(tx) = channels.get(&key) {
                let _ = tx.send(event);
            }
        }
    }

    fn lock_tables(&self) -> Result<std::sync::MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| CoreError::Remote("store lock poisoned".into()))
    }

    fn check_writable(&self, kind: CollectionKind) -> Result<()> {
        if let Ok(mut calls) = self.sync_calls.lock() {
            *calls.entry(kind).or_default() += 1;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(CoreError::Offline);
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(CoreError::Remote(format!("write to {kind} rejected")));
        }
        Ok(())
    }

    /// Upserts a batch. Temporary ids get permanent ones first, then
    /// `relink` rewrites references between records of the same batch.
    fn upsert_batch<T: Entity + Serialize>(
        &self,
        select: impl FnOnce(&mut InitialData) -> &mut Vec<T>,
        mut items: Vec<T>,
        tenant_id: &str,
        relink: impl Fn(&mut T, &IdMapping),
    ) -> Result<IdMapping> {
        self.check_writable(T::KIND)?;

        let mut mapping = IdMapping::new();
        for item in &mut items {
            if reconcile::is_temporary(T::KIND, item.id()) {
                let id = Uuid::new_v4().to_string();
                mapping.insert(item.id(), id.clone());
                item.set_id(id);
            }
        }

        let mut events = Vec::new();
        {
            let mut tables = self.lock_tables()?;
            let rows = select(&mut tables.data);
            for mut item in items {
                relink(&mut item, &mapping);
                item.set_tenant_id(tenant_id.to_string());

                match rows.iter_mut().find(|row| row.id() == item.id()) {
                    Some(row) if row.tenant_id() != tenant_id => {
                        debug!(id = item.id(), "Skipping row owned by another tenant");
                    }
                    Some(row) => {
                        events.push(ChangeEvent::updated(&item, Some(&*row))?);
                        *row = item;
                    }
                    None => {
                        events.push(ChangeEvent::inserted(&item)?);
                        rows.push(item);
                    }
                }
            }
        }

        for event in events {
            self.push_change(tenant_id, event);
        }
        Ok(mapping)
    }
}

fn owned_by<T: Entity>(items: &[T], tenant_id: &str) -> Vec<T> {
    items
        .iter()
        .filter(|item| item.tenant_id() == tenant_id)
        .cloned()
        .collect()
}

fn remove_owned<T: Entity>(items: &mut Vec<T>, id: &str, tenant_id: &str) -> bool {
    let before = items.len();
    items.retain(|item| !(item.id() == id && item.tenant_id() == tenant_id));
    items.len() != before
}

impl RemoteStore for MemoryRemote {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn load_initial_data(&self, tenant_id: &str) -> Result<InitialData> {
        if !self.is_available() {
            return Err(CoreError::Offline);
        }
        self.snapshot(tenant_id)
    }

    async fn load_tenant_data(&self, tenant_id: &str) -> Result<Option<Tenant>> {
        if !self.is_available() {
            return Err(CoreError::Offline);
        }
        let tables = self.lock_tables()?;
        Ok(tables.tenants.iter().find(|t| t.id == tenant_id).cloned())
    }

    async fn sync_projects(
        &self,
        projects: Vec<Project>,
        _acting_user_id: &str,
        tenant_id: &str,
    ) -> Result<IdMapping> {
        self.in_flight().await;
        self.upsert_batch(|data| &mut data.projects, projects, tenant_id, |_, _| {})
    }

    async fn bulk_sync_tasks(
        &self,
        tasks: Vec<Task>,
        _acting_user_id: &str,
        tenant_id: &str,
    ) -> Result<IdMapping> {
        self.in_flight().await;
        self.upsert_batch(|data| &mut data.tasks, tasks, tenant_id, |task, mapping| {
            for dependency in &mut task.dependencies {
                mapping.remap(dependency);
            }
        })
    }

    async fn sync_resources(
        &self,
        resources: Vec<Resource>,
        _acting_user_id: &str,
        tenant_id: &str,
    ) -> Result<IdMapping> {
        self.in_flight().await;
        self.upsert_batch(|data| &mut data.resources, resources, tenant_id, |_, _| {})
    }

    async fn sync_daily_logs(
        &self,
        logs: Vec<DailyLog>,
        _acting_user_id: &str,
        tenant_id: &str,
    ) -> Result<IdMapping> {
        self.in_flight().await;
        self.upsert_batch(|data| &mut data.daily_logs, logs, tenant_id, |_, _| {})
    }

    async fn delete_record(&self, kind: CollectionKind, id: &str, tenant_id: &str) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if !self.is_available() {
            return Err(CoreError::Offline);
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(CoreError::Remote(format!("delete from {kind} rejected")));
        }

        let removed = {
            let mut tables = self.lock_tables()?;
            let data = &mut tables.data;
            match kind {
                CollectionKind::Projects => {
                    let removed = remove_owned(&mut data.projects, id, tenant_id);
                    if removed {
                        data.daily_logs
                            .retain(|l| !(l.project_id == id && l.tenant_id == tenant_id));
                    }
                    removed
                }
                CollectionKind::Tasks => remove_owned(&mut data.tasks, id, tenant_id),
                CollectionKind::Resources => remove_owned(&mut data.resources, id, tenant_id),
                CollectionKind::DailyLogs => remove_owned(&mut data.daily_logs, id, tenant_id),
            }
        };

        if removed {
            self.push_change(tenant_id, ChangeEvent::deleted_id(kind, id, tenant_id));
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        tenant_id: &str,
        kind: CollectionKind,
    ) -> Result<broadcast::Receiver<ChangeEvent>> {
        let mut channels = self
            .channels
            .lock()
            .map_err(|_| CoreError::Remote("channel registry poisoned".into()))?;
        let tx = channels
            .entry((tenant_id.to_string(), kind))
            .or_insert_with(|| broadcast::channel(256).0);
        Ok(tx.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::models::ResourceKind;

    fn resource(id: &str, tenant: &str) -> Resource {
        Resource {
            id: id.into(),
            tenant_id: tenant.into(),
            name: "Servente".into(),
            kind: ResourceKind::Human,
            hourly_cost: None,
            active: true,
        }
    }

    #[tokio::test]
    async fn temporary_ids_get_permanent_ones() {
        let remote = MemoryRemote::new();
        let mapping = remote
            .sync_resources(vec![resource("r-1", "c1"), resource("b7d1", "c1")], "u1", "c1")
            .await
            .unwrap();

        assert_eq!(mapping.len(), 1);
        let new_id = mapping.get("r-1").unwrap();
        assert!(Uuid::parse_str(new_id).is_ok());

        let stored = remote.snapshot("c1").unwrap().resources;
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().any(|r| r.id == new_id));
    }

    #[tokio::test]
    async fn dependencies_inside_a_batch_follow_new_ids() {
        let remote = MemoryRemote::new();
        let task = |id: &str, dependencies: &[&str]| Task {
            id: id.into(),
            tenant_id: "c1".into(),
            project_id: "a1".into(),
            name: "Fundação".into(),
            wbs: "1.1".into(),
            planned_start: NaiveDate::from_ymd_opt(2025, 3, 3).unwrap(),
            planned_end: NaiveDate::from_ymd_opt(2025, 3, 7).unwrap(),
            dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
            planned_quantity: 0.0,
            done_quantity: 0.0,
            weight: 0.0,
            planned_cost: 0.0,
            allocations: Default::default(),
        };

        let mapping = remote
            .bulk_sync_tasks(
                vec![task("task-1", &[]), task("task-2", &["task-1", "f00d"])],
                "u1",
                "c1",
            )
            .await
            .unwrap();

        let stored = remote.snapshot("c1").unwrap().tasks;
        let second = stored
            .iter()
            .find(|t| t.id == mapping.get("task-2").unwrap())
            .unwrap();
        assert_eq!(
            second.dependencies,
            vec![mapping.get("task-1").unwrap().to_string(), "f00d".to_string()]
        );
    }

    #[tokio::test]
    async fn rows_of_other_tenants_are_never_overwritten() {
        let remote = MemoryRemote::new();
        remote.sync_resources(vec![resource("shared", "c1")], "u1", "c1").await.unwrap();

        let mut hostile = resource("shared", "c2");
        hostile.name = "Hijacked".into();
        remote.sync_resources(vec![hostile], "u2", "c2").await.unwrap();

        let stored = remote.snapshot("c1").unwrap().resources;
        assert_eq!(stored[0].name, "Servente");
        assert!(remote.snapshot("c2").unwrap().resources.is_empty());
    }

    #[tokio::test]
    async fn project_delete_cascades_and_publishes() {
        let remote = MemoryRemote::new();
        let mut rx = remote.subscribe("c1", CollectionKind::Projects).await.unwrap();
        let project = Project {
            id: "a1".into(),
            tenant_id: "c1".into(),
            name: "Galpão".into(),
            description: None,
            client_name: None,
            location: String::new(),
            status: crate::models::ProjectStatus::Planning,
            start_date: NaiveDate::from_ymd_opt(2025, 3, 3).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2025, 3, 31).unwrap(),
            budget: 0.0,
            logo_url: None,
            baseline_set: false,
        };
        remote.sync_projects(vec![project], "u1", "c1").await.unwrap();
        let log = DailyLog {
            id: "d1".into(),
            tenant_id: "c1".into(),
            project_id: "a1".into(),
            date: NaiveDate::from_ymd_opt(2025, 3, 4).unwrap(),
            author_id: "u1".into(),
            notes: String::new(),
            progress: Vec::new(),
            photos: Vec::new(),
        };
        remote.sync_daily_logs(vec![log], "u1", "c1").await.unwrap();

        remote.delete_record(CollectionKind::Projects, "a1", "c1").await.unwrap();

        assert!(remote.snapshot("c1").unwrap().daily_logs.is_empty());
        assert_eq!(rx.recv().await.unwrap().kind, crate::realtime::ChangeKind::Insert);
        assert_eq!(rx.recv().await.unwrap().record_id(), Some("a1"));
    }

    #[tokio::test]
    async fn offline_store_rejects_writes() {
        let remote = MemoryRemote::new();
        remote.set_available(false);
        let err = remote.sync_resources(vec![resource("r-1", "c1")], "u1", "c1").await;
        assert!(matches!(err, Err(CoreError::Offline)));
        assert_eq!(remote.sync_calls(CollectionKind::Resources), 1);
    }
}
