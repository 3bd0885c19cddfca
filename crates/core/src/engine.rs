//! Sync engine: optimistic local edits, debounced remote sync, offline
//! fallback and real-time change feeds.
//!
//! Every edit lands in [`SessionState`] first, is written to the local cache
//! and then schedules a push of the whole tenant collection once edits stop
//! arriving for the configured quiet period.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{self, LocalCache, CURRENT_USER_KEY, SELECTED_PROJECT_KEY, TENANTS_KEY};
use crate::config::SyncConfig;
use crate::edits::{DebounceTimers, EditLog};
use crate::error::{CoreError, Result};
use crate::histogram::{self, Histogram, HistogramQuery};
use crate::models::{
    CollectionKind, DailyLog, Entity, Project, Resource, Task, Tenant, User,
};
use crate::notify::Notifier;
use crate::realtime::{ChangeEvent, ChangeKind};
use crate::reconcile::{self, IdMapping};
use crate::remote::RemoteStore;
use crate::session::SessionState;
use crate::tenancy::TenantView;

#[derive(Default)]
struct Views {
    projects: TenantView<Project>,
    tasks: TenantView<Task>,
    resources: TenantView<Resource>,
    daily_logs: TenantView<DailyLog>,
}

struct Inner<R, C> {
    remote: Arc<R>,
    cache: Arc<C>,
    config: SyncConfig,
    notifier: Notifier,
    state: RwLock<SessionState>,
    timers: Mutex<DebounceTimers>,
    /// Marked while the state write lock is held, so a snapshot and its
    /// edit marks always agree.
    edits: Mutex<EditLog>,
    /// Serializes flushes of the same collection.
    flush_locks: HashMap<CollectionKind, tokio::sync::Mutex<()>>,
    /// Keeps cache writes in snapshot order.
    persist_lock: tokio::sync::Mutex<()>,
    /// Held across login and logout.
    session_lock: tokio::sync::Mutex<()>,
    feeds: Mutex<Vec<JoinHandle<()>>>,
    views: Mutex<Views>,
}

pub struct SyncEngine<R, C> {
    inner: Arc<Inner<R, C>>,
}

impl<R, C> Clone for SyncEngine<R, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: RemoteStore, C: LocalCache> SyncEngine<R, C> {
    pub fn new(remote: Arc<R>, cache: Arc<C>, config: SyncConfig) -> Self {
        let flush_locks = CollectionKind::ALL
            .into_iter()
            .map(|kind| (kind, tokio::sync::Mutex::new(())))
            .collect();

        Self {
            inner: Arc::new(Inner {
                remote,
                cache,
                config,
                notifier: Notifier::new(),
                state: RwLock::new(SessionState::new()),
                timers: Mutex::new(DebounceTimers::default()),
                edits: Mutex::new(EditLog::default()),
                flush_locks,
                persist_lock: tokio::sync::Mutex::new(()),
                session_lock: tokio::sync::Mutex::new(()),
                feeds: Mutex::new(Vec::new()),
                views: Mutex::new(Views::default()),
            }),
        }
    }

    pub fn notifier(&self) -> &Notifier {
        &self.inner.notifier
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.inner.remote
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    // -----------------------------------------------------------------------
    // Session lifecycle
    // -----------------------------------------------------------------------

    pub async fn login(&self, user: User) -> Result<()> {
        if !user.active {
            return Err(CoreError::SessionInvalid {
                reason: "user is inactive".into(),
            });
        }
        let _session = self.inner.session_lock.lock().await;
        if let Err(e) = cache::store_json(self.inner.cache.as_ref(), CURRENT_USER_KEY, &user).await {
            warn!(error = %e, "Failed to cache current user");
        }
        let resumed = {
            let mut state = self.inner.state.write().await;
            let resumed = state
                .user()
                .is_some_and(|current| current.id == user.id && current.tenant_id == user.tenant_id);
            state.login(user);
            resumed
        };
        if resumed {
            debug!("Session already loaded");
            return Ok(());
        }

        self.bootstrap().await?;
        self.start_realtime().await;
        Ok(())
    }

    /// Drops the session. Unsynced edits stay in the local cache.
    pub async fn logout(&self) {
        let _session = self.inner.session_lock.lock().await;
        self.cancel_pending();
        self.stop_realtime();
        {
            let mut state = self.inner.state.write().await;
            state.logout();
            self.edits(EditLog::clear);
        }

        for key in [CURRENT_USER_KEY, SELECTED_PROJECT_KEY] {
            if let Err(e) = self.inner.cache.remove(key).await {
                warn!(key, error = %e, "Failed to clear cache entry");
            }
        }
    }

    /// User remembered from the previous run, if any.
    pub async fn cached_user(&self) -> Option<User> {
        cache::load_json(self.inner.cache.as_ref(), CURRENT_USER_KEY).await
    }

    /// Loads the session tenant's data from the remote store, falling back
    /// to the local cache when the store is unreachable.
    pub async fn bootstrap(&self) -> Result<()> {
        let tenant_id = self.inner.state.read().await.tenant_id().to_string();
        if tenant_id.is_empty() {
            return Err(CoreError::Unauthorized);
        }

        if self.inner.remote.is_available() {
            match self.load_remote(&tenant_id).await {
                Ok(()) => {
                    info!(tenant_id = %tenant_id, "Loaded tenant data from remote store");
                    self.persist_all().await;
                    return Ok(());
                }
                Err(e) => {
                    warn!(tenant_id = %tenant_id, error = %e, "Remote load failed, using local cache");
                    self.inner
                        .notifier
                        .warn("Server unreachable, working with local data");
                }
            }
        } else {
            debug!("Remote store not configured, using local cache");
        }

        self.restore_from_cache().await;
        self.resend_temporary().await;
        Ok(())
    }

    async fn load_remote(&self, tenant_id: &str) -> Result<()> {
        let data = self.inner.remote.load_initial_data(tenant_id).await?;
        let tenant = self.inner.remote.load_tenant_data(tenant_id).await?;

        let mut state = self.inner.state.write().await;
        if let Some(tenant) = tenant {
            state.upsert_tenant(tenant);
        }
        state.replace_tenant_data(tenant_id, data);
        Ok(())
    }

    async fn restore_from_cache(&self) {
        let cache = self.inner.cache.as_ref();
        let tenants = cache::load_json::<Vec<Tenant>>(cache, TENANTS_KEY).await;
        let projects =
            cache::load_json::<Vec<Project>>(cache, CollectionKind::Projects.cache_key()).await;
        let tasks = cache::load_json::<Vec<Task>>(cache, CollectionKind::Tasks.cache_key()).await;
        let resources =
            cache::load_json::<Vec<Resource>>(cache, CollectionKind::Resources.cache_key()).await;
        let daily_logs =
            cache::load_json::<Vec<DailyLog>>(cache, CollectionKind::DailyLogs.cache_key()).await;
        let selected = cache::load_json::<Project>(cache, SELECTED_PROJECT_KEY).await;

        let mut state = self.inner.state.write().await;
        if let Some(tenants) = tenants {
            state.set_tenants(tenants);
        }
        state.restore(
            projects.unwrap_or_default(),
            tasks.unwrap_or_default(),
            resources.unwrap_or_default(),
            daily_logs.unwrap_or_default(),
        );
        if let Some(selected) = selected {
            if state.select_project(&selected.id).is_err() {
                debug!(project_id = %selected.id, "Cached selection no longer visible");
            }
        }
    }

    /// Schedules a push of every collection still holding records the
    /// remote store has never acknowledged.
    async fn resend_temporary(&self) {
        let kinds: Vec<CollectionKind> = {
            let state = self.inner.state.read().await;
            CollectionKind::ALL
                .into_iter()
                .filter(|&kind| match kind {
                    CollectionKind::Projects => has_temporary(&state.tenant_projects()),
                    CollectionKind::Tasks => has_temporary(&state.tenant_tasks()),
                    CollectionKind::Resources => has_temporary(&state.tenant_resources()),
                    CollectionKind::DailyLogs => has_temporary(&state.tenant_daily_logs()),
                })
                .collect()
        };
        for kind in kinds {
            self.schedule(kind);
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn current_user(&self) -> Option<User> {
        self.inner.state.read().await.user().cloned()
    }

    pub async fn is_logged_in(&self) -> bool {
        self.inner.state.read().await.is_logged_in()
    }

    pub async fn active_tenant(&self) -> Option<Tenant> {
        self.inner.state.read().await.active_tenant().cloned()
    }

    pub async fn license_blocked(&self) -> bool {
        self.inner.state.read().await.license_blocked()
    }

    pub async fn selected_project(&self) -> Option<Project> {
        self.inner.state.read().await.selected_project().cloned()
    }

    pub async fn projects(&self) -> Arc<Vec<Project>> {
        let (source, tenant_id) = {
            let state = self.inner.state.read().await;
            (Arc::clone(state.projects()), state.tenant_id().to_string())
        };
        self.with_views(|views| views.projects.get(&source, &tenant_id))
    }

    pub async fn tasks(&self) -> Arc<Vec<Task>> {
        let (source, tenant_id) = {
            let state = self.inner.state.read().await;
            (Arc::clone(state.tasks()), state.tenant_id().to_string())
        };
        self.with_views(|views| views.tasks.get(&source, &tenant_id))
    }

    pub async fn resources(&self) -> Arc<Vec<Resource>> {
        let (source, tenant_id) = {
            let state = self.inner.state.read().await;
            (Arc::clone(state.resources()), state.tenant_id().to_string())
        };
        self.with_views(|views| views.resources.get(&source, &tenant_id))
    }

    pub async fn daily_logs(&self) -> Arc<Vec<DailyLog>> {
        let (source, tenant_id) = {
            let state = self.inner.state.read().await;
            (Arc::clone(state.daily_logs()), state.tenant_id().to_string())
        };
        self.with_views(|views| views.daily_logs.get(&source, &tenant_id))
    }

    fn with_views<T>(&self, f: impl FnOnce(&mut Views) -> Arc<Vec<T>>) -> Arc<Vec<T>> {
        match self.inner.views.lock() {
            Ok(mut views) => f(&mut *views),
            Err(poisoned) => f(&mut *poisoned.into_inner()),
        }
    }

    fn edits<T>(&self, f: impl FnOnce(&mut EditLog) -> T) -> T {
        match self.inner.edits.lock() {
            Ok(mut edits) => f(&mut *edits),
            Err(poisoned) => f(&mut *poisoned.into_inner()),
        }
    }

    pub async fn histogram(&self, query: &HistogramQuery) -> Histogram {
        let tasks = self.tasks().await;
        let resources = self.resources().await;
        histogram::aggregate(&tasks, &resources, query)
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    pub async fn save_project(&self, project: Project) -> Result<()> {
        let selected = {
            let mut state = self.inner.state.write().await;
            let id = project.id.clone();
            state.upsert_project(project)?;
            state.ensure_selection();
            self.edits(|log| log.touch(CollectionKind::Projects, [id]));
            state.selected_project().cloned()
        };
        self.persist(CollectionKind::Projects).await;
        self.persist_selection(selected.as_ref()).await;
        self.schedule(CollectionKind::Projects);
        Ok(())
    }

    pub async fn delete_project(&self, id: &str) -> Result<()> {
        let (removed, tenant_id, selected) = {
            let mut state = self.inner.state.write().await;
            let logs: Vec<String> = state
                .tenant_daily_logs()
                .into_iter()
                .filter(|log| log.project_id == id)
                .map(|log| log.id)
                .collect();
            let removed = state.remove_project(id)?;
            if removed {
                state.ensure_selection();
                self.edits(|log| {
                    log.delete(CollectionKind::Projects, [id]);
                    log.delete(CollectionKind::DailyLogs, logs);
                });
            }
            (removed, state.tenant_id().to_string(), state.selected_project().cloned())
        };
        if !removed {
            return Ok(());
        }

        self.persist(CollectionKind::Projects).await;
        self.persist(CollectionKind::DailyLogs).await;
        self.persist_selection(selected.as_ref()).await;
        self.delete_remote(CollectionKind::Projects, id, &tenant_id).await;
        Ok(())
    }

    pub async fn select_project(&self, id: &str) -> Result<()> {
        let selected = {
            let mut state = self.inner.state.write().await;
            state.select_project(id)?;
            state.selected_project().cloned()
        };
        self.persist_selection(selected.as_ref()).await;
        Ok(())
    }

    /// Replaces every task of the session tenant, e.g. after a schedule
    /// import.
    pub async fn replace_tasks(&self, tasks: Vec<Task>) -> Result<()> {
        {
            let mut state = self.inner.state.write().await;
            state.replace_tenant_tasks(tasks)?;
            let ids = tenant_ids(&state, CollectionKind::Tasks);
            self.edits(|log| log.touch(CollectionKind::Tasks, ids));
        }
        self.persist(CollectionKind::Tasks).await;
        self.schedule(CollectionKind::Tasks);
        Ok(())
    }

    pub async fn save_task(&self, task: Task) -> Result<()> {
        {
            let mut state = self.inner.state.write().await;
            let id = task.id.clone();
            state.upsert_task(task)?;
            self.edits(|log| log.touch(CollectionKind::Tasks, [id]));
        }
        self.persist(CollectionKind::Tasks).await;
        self.schedule(CollectionKind::Tasks);
        Ok(())
    }

    pub async fn delete_task(&self, id: &str) -> Result<()> {
        let (removed, tenant_id) = {
            let mut state = self.inner.state.write().await;
            let removed = state.remove_task(id)?;
            if removed {
                self.edits(|log| log.delete(CollectionKind::Tasks, [id]));
            }
            (removed, state.tenant_id().to_string())
        };
        if removed {
            self.persist(CollectionKind::Tasks).await;
            self.delete_remote(CollectionKind::Tasks, id, &tenant_id).await;
        }
        Ok(())
    }

    pub async fn save_resource(&self, resource: Resource) -> Result<()> {
        {
            let mut state = self.inner.state.write().await;
            let id = resource.id.clone();
            state.upsert_resource(resource)?;
            self.edits(|log| log.touch(CollectionKind::Resources, [id]));
        }
        self.persist(CollectionKind::Resources).await;
        self.schedule(CollectionKind::Resources);
        Ok(())
    }

    /// Removes a resource; tasks that allocated it are rewritten and synced.
    pub async fn delete_resource(&self, id: &str) -> Result<()> {
        let (tasks_changed, tenant_id) = {
            let mut state = self.inner.state.write().await;
            let stripped: Vec<String> = state
                .tenant_tasks()
                .into_iter()
                .filter(|task| task.allocations.references(id))
                .map(|task| task.id)
                .collect();
            let tasks_changed = state.remove_resource(id)?;
            self.edits(|log| {
                log.delete(CollectionKind::Resources, [id]);
                log.touch(CollectionKind::Tasks, stripped);
            });
            (tasks_changed, state.tenant_id().to_string())
        };

        self.persist(CollectionKind::Resources).await;
        if tasks_changed {
            self.persist(CollectionKind::Tasks).await;
            self.schedule(CollectionKind::Tasks);
        }
        self.delete_remote(CollectionKind::Resources, id, &tenant_id).await;
        Ok(())
    }

    pub async fn save_daily_log(&self, log: DailyLog) -> Result<()> {
        {
            let mut state = self.inner.state.write().await;
            let id = log.id.clone();
            state.upsert_daily_log(log)?;
            self.edits(|edits| edits.touch(CollectionKind::DailyLogs, [id]));
        }
        self.persist(CollectionKind::DailyLogs).await;
        self.schedule(CollectionKind::DailyLogs);
        Ok(())
    }

    pub async fn delete_daily_log(&self, id: &str) -> Result<()> {
        let (removed, tenant_id) = {
            let mut state = self.inner.state.write().await;
            let removed = state.remove_daily_log(id)?;
            if removed {
                self.edits(|log| log.delete(CollectionKind::DailyLogs, [id]));
            }
            (removed, state.tenant_id().to_string())
        };
        if removed {
            self.persist(CollectionKind::DailyLogs).await;
            self.delete_remote(CollectionKind::DailyLogs, id, &tenant_id).await;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Remote sync
    // -----------------------------------------------------------------------

    /// (Re)starts the debounce timer of `kind`. Only the sleep is cancelled;
    /// a flush that already started runs to completion.
    fn schedule(&self, kind: CollectionKind) {
        let mut timers = match self.inner.timers.lock() {
            Ok(timers) => timers,
            Err(_) => {
                warn!(kind = %kind, "Debounce registry poisoned");
                return;
            }
        };
        let generation = timers.next_generation();
        let engine = self.clone();
        let delay = self.inner.config.debounce;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Ok(mut timers) = engine.inner.timers.lock() {
                timers.release(kind, generation);
            }
            engine.flush_reporting(kind).await;
        });
        timers.insert(kind, generation, timer);
    }

    fn cancel_pending(&self) {
        if let Ok(mut timers) = self.inner.timers.lock() {
            timers.cancel_all();
        }
    }

    async fn flush_reporting(&self, kind: CollectionKind) {
        match self.flush(kind).await {
            Ok(_) => {}
            Err(CoreError::Offline) => debug!(kind = %kind, "Remote store offline, sync deferred"),
            Err(e) => {
                warn!(kind = %kind, error = %e, "Sync failed, keeping local state");
                self.inner
                    .notifier
                    .warn(format!("Could not sync {kind}: {e}"));
            }
        }
    }

    /// Pushes the session tenant's `kind` collection and applies the
    /// returned id mapping.
    ///
    /// Records deleted locally while the push was in flight are deleted
    /// again once their permanent id is known.
    pub async fn flush(&self, kind: CollectionKind) -> Result<IdMapping> {
        let lock = self
            .inner
            .flush_locks
            .get(&kind)
            .ok_or_else(|| CoreError::Validation(format!("no flush lock for {kind}")))?;
        let _serial = lock.lock().await;

        if !self.inner.remote.is_available() {
            return Err(CoreError::Offline);
        }

        let (user_id, tenant_id) = {
            let state = self.inner.state.read().await;
            let user = state.user().ok_or(CoreError::Unauthorized)?;
            (user.id.clone(), state.tenant_id().to_string())
        };
        if tenant_id.is_empty() {
            return Err(CoreError::Unauthorized);
        }

        let remote = &self.inner.remote;
        let (pushed, result) = match kind {
            CollectionKind::Projects => {
                let items = self.snapshot(kind, SessionState::tenant_projects).await;
                (ids_of(&items), remote.sync_projects(items, &user_id, &tenant_id).await)
            }
            CollectionKind::Tasks => {
                let items = self.snapshot(kind, SessionState::tenant_tasks).await;
                (ids_of(&items), remote.bulk_sync_tasks(items, &user_id, &tenant_id).await)
            }
            CollectionKind::Resources => {
                let items = self.snapshot(kind, SessionState::tenant_resources).await;
                (ids_of(&items), remote.sync_resources(items, &user_id, &tenant_id).await)
            }
            CollectionKind::DailyLogs => {
                let items = self.snapshot(kind, SessionState::tenant_daily_logs).await;
                (ids_of(&items), remote.sync_daily_logs(items, &user_id, &tenant_id).await)
            }
        };
        let mapping = match result {
            Ok(mapping) => mapping,
            Err(e) => {
                self.edits(|log| log.touch(kind, pushed));
                return Err(e);
            }
        };

        let (changed, selected, revived) = {
            let mut state = self.inner.state.write().await;
            if state.tenant_id() != tenant_id {
                debug!(kind = %kind, "Session changed during sync, dropping mapping");
                return Ok(mapping);
            }
            let changed = state.apply_id_mapping(kind, &mapping);
            let rewritten: Vec<(CollectionKind, Vec<String>)> = changed
                .iter()
                .filter(|&&other| other != kind)
                .map(|&other| (other, tenant_ids(&state, other)))
                .collect();

            let revived: Vec<String> = self.edits(|log| {
                log.remap(kind, &mapping);
                for (other, ids) in rewritten {
                    log.touch(other, ids);
                }
                pushed
                    .iter()
                    .map(|id| mapping.get(id).unwrap_or(id.as_str()).to_string())
                    .filter(|id| log.is_deleted(kind, id))
                    .collect()
            });
            for id in &revived {
                if let Err(e) = remove_local(&mut state, kind, id) {
                    warn!(kind = %kind, id = %id, error = %e, "Could not drop deleted record");
                }
            }
            (changed, state.selected_project().cloned(), revived)
        };

        for &changed_kind in &changed {
            self.persist(changed_kind).await;
            if changed_kind != kind {
                self.schedule(changed_kind);
            }
        }
        if kind == CollectionKind::Projects && !mapping.is_empty() {
            self.persist_selection(selected.as_ref()).await;
        }
        if !revived.is_empty() {
            self.persist(kind).await;
            if kind == CollectionKind::Projects {
                self.persist(CollectionKind::DailyLogs).await;
            }
            for id in &revived {
                debug!(kind = %kind, id = %id, "Deleting record pushed before its local delete");
                self.delete_remote(kind, id, &tenant_id).await;
            }
        }
        debug!(kind = %kind, mapped = mapping.len(), "Sync completed");
        Ok(mapping)
    }

    /// Reads the tenant's records of `kind` and starts a new round of edit
    /// tracking for them.
    async fn snapshot<T>(
        &self,
        kind: CollectionKind,
        read: impl FnOnce(&SessionState) -> Vec<T>,
    ) -> Vec<T> {
        let state = self.inner.state.read().await;
        self.edits(|log| log.clear_dirty(kind));
        read(&state)
    }

    /// Propagates a delete of a permanent id. Records that never reached the
    /// remote store only exist locally.
    async fn delete_remote(&self, kind: CollectionKind, id: &str, tenant_id: &str) {
        if reconcile::is_temporary(kind, id) || !self.inner.remote.is_available() {
            return;
        }
        if let Err(e) = self.inner.remote.delete_record(kind, id, tenant_id).await {
            warn!(kind = %kind, id, error = %e, "Remote delete failed");
            self.inner
                .notifier
                .warn(format!("Could not delete from {kind}: {e}"));
        }
    }

    // -----------------------------------------------------------------------
    // Real-time
    // -----------------------------------------------------------------------

    /// Subscribes to every collection of the session tenant.
    pub async fn start_realtime(&self) {
        self.stop_realtime();
        let tenant_id = self.inner.state.read().await.tenant_id().to_string();
        if tenant_id.is_empty() || !self.inner.remote.is_available() {
            return;
        }

        let mut feeds = Vec::new();
        for kind in CollectionKind::ALL {
            match self.inner.remote.subscribe(&tenant_id, kind).await {
                Ok(rx) => feeds.push(self.spawn_feed(kind, rx)),
                Err(e) => warn!(kind = %kind, error = %e, "Real-time subscription failed"),
            }
        }
        if let Ok(mut current) = self.inner.feeds.lock() {
            *current = feeds;
        }
    }

    pub fn stop_realtime(&self) {
        if let Ok(mut feeds) = self.inner.feeds.lock() {
            for feed in feeds.drain(..) {
                feed.abort();
            }
        }
    }

    fn spawn_feed(&self, kind: CollectionKind, mut rx: broadcast::Receiver<ChangeEvent>) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let applied = {
                            let mut state = engine.inner.state.write().await;
                            if engine.is_shadowed(&event) {
                                debug!(kind = %kind, id = ?event.record_id(), "Ignoring change older than a local edit");
                                Ok(false)
                            } else {
                                state.apply_change(&event)
                            }
                        };
                        match applied {
                            Ok(true) => engine.persist(event.table).await,
                            Ok(false) => {}
                            Err(e) => warn!(kind = %kind, error = %e, "Dropping malformed change event"),
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(kind = %kind, skipped, "Real-time feed lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!(kind = %kind, "Real-time feed closed");
        })
    }

    /// Inserts and updates never override a pending local edit or delete.
    fn is_shadowed(&self, event: &ChangeEvent) -> bool {
        event.kind != ChangeKind::Delete
            && event
                .record_id()
                .is_some_and(|id| self.edits(|log| log.shadows(event.table, id)))
    }

    // -----------------------------------------------------------------------
    // Cache
    // -----------------------------------------------------------------------

    async fn persist(&self, kind: CollectionKind) {
        let _serial = self.inner.persist_lock.lock().await;
        let cache = self.inner.cache.as_ref();
        let key = kind.cache_key();
        let result = match kind {
            CollectionKind::Projects => {
                let items = Arc::clone(self.inner.state.read().await.projects());
                cache::store_json(cache, key, items.as_slice()).await
            }
            CollectionKind::Tasks => {
                let items = Arc::clone(self.inner.state.read().await.tasks());
                cache::store_json(cache, key, items.as_slice()).await
            }
            CollectionKind::Resources => {
                let items = Arc::clone(self.inner.state.read().await.resources());
                cache::store_json(cache, key, items.as_slice()).await
            }
            CollectionKind::DailyLogs => {
                let items = Arc::clone(self.inner.state.read().await.daily_logs());
                cache::store_json(cache, key, items.as_slice()).await
            }
        };
        if let Err(e) = result {
            warn!(kind = %kind, error = %e, "Failed to persist collection");
        }
    }

    async fn persist_all(&self) {
        for kind in CollectionKind::ALL {
            self.persist(kind).await;
        }
        let tenants = Arc::clone(self.inner.state.read().await.tenants());
        if let Err(e) =
            cache::store_json(self.inner.cache.as_ref(), TENANTS_KEY, tenants.as_slice()).await
        {
            warn!(error = %e, "Failed to persist tenants");
        }
        let selected = self.selected_project().await;
        self.persist_selection(selected.as_ref()).await;
    }

    async fn persist_selection(&self, selected: Option<&Project>) {
        let cache = self.inner.cache.as_ref();
        let result = match selected {
            Some(project) => cache::store_json(cache, SELECTED_PROJECT_KEY, project).await,
            None => cache.remove(SELECTED_PROJECT_KEY).await,
        };
        if let Err(e) = result {
            warn!(error = %e, "Failed to persist selected project");
        }
    }
}

fn has_temporary<T: Entity>(items: &[T]) -> bool {
    items.iter().any(|item| reconcile::is_temporary(T::KIND, item.id()))
}

fn ids_of<T: Entity>(items: &[T]) -> Vec<String> {
    items.iter().map(|item| item.id().to_string()).collect()
}

fn tenant_ids(state: &SessionState, kind: CollectionKind) -> Vec<String> {
    match kind {
        CollectionKind::Projects => ids_of(&state.tenant_projects()),
        CollectionKind::Tasks => ids_of(&state.tenant_tasks()),
        CollectionKind::Resources => ids_of(&state.tenant_resources()),
        CollectionKind::DailyLogs => ids_of(&state.tenant_daily_logs()),
    }
}

fn remove_local(state: &mut SessionState, kind: CollectionKind, id: &str) -> Result<()> {
    match kind {
        CollectionKind::Projects => {
            state.remove_project(id)?;
            state.ensure_selection();
        }
        CollectionKind::Tasks => {
            state.remove_task(id)?;
        }
        CollectionKind::Resources => {
            state.remove_resource(id)?;
        }
        CollectionKind::DailyLogs => {
            state.remove_daily_log(id)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{NaiveDate, Utc};

    use super::*;
    use crate::cache::MemoryCache;
    use crate::memory::MemoryRemote;
    use crate::models::{LicenseStatus, PlanId, ProjectStatus, ResourceKind, Role};
    use crate::notify::Level;

    type Engine = SyncEngine<MemoryRemote, MemoryCache>;

    fn user(tenant: &str) -> User {
        User {
            id: "u1".into(),
            name: "Bruno".into(),
            email: "bruno@example.com".into(),
            tenant_id: tenant.into(),
            role: Role::Planner,
            active: true,
            job_title: None,
        }
    }

    fn tenant(id: &str) -> Tenant {
        Tenant {
            id: id.into(),
            name: "Construtora".into(),
            tax_id: None,
            logo_url: None,
            plan_id: PlanId::Pro,
            license_ends_on: None,
            status: LicenseStatus::Active,
            limits: PlanId::Pro.default_limits(),
        }
    }

    fn project(id: &str) -> Project {
        Project {
            id: id.into(),
            tenant_id: String::new(),
            name: "Edifício Aurora".into(),
            description: None,
            client_name: None,
            location: "Recife".into(),
            status: ProjectStatus::Execution,
            start_date: NaiveDate::from_ymd_opt(2025, 2, 3).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2025, 8, 29).unwrap(),
            budget: 2_000_000.0,
            logo_url: None,
            baseline_set: false,
        }
    }

    fn resource(id: &str) -> Resource {
        Resource {
            id: id.into(),
            tenant_id: String::new(),
            name: "Armador".into(),
            kind: ResourceKind::Human,
            hourly_cost: Some(32.0),
            active: true,
        }
    }

    fn task(id: &str, dependencies: &[&str]) -> Task {
        Task {
            id: id.into(),
            tenant_id: String::new(),
            project_id: "a1".into(),
            name: "Estrutura".into(),
            wbs: "2.1".into(),
            planned_start: NaiveDate::from_ymd_opt(2025, 3, 3).unwrap(),
            planned_end: NaiveDate::from_ymd_opt(2025, 3, 14).unwrap(),
            dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
            planned_quantity: 120.0,
            done_quantity: 0.0,
            weight: 1.0,
            planned_cost: 0.0,
            allocations: Default::default(),
        }
    }

    async fn engine() -> (Engine, Arc<MemoryRemote>, Arc<MemoryCache>) {
        let remote = Arc::new(MemoryRemote::new());
        remote.insert_tenant(tenant("c1")).unwrap();
        let cache = Arc::new(MemoryCache::new());
        let engine = SyncEngine::new(Arc::clone(&remote), Arc::clone(&cache), SyncConfig::default());
        engine.login(user("c1")).await.unwrap();
        (engine, remote, cache)
    }

    /// Lets spawned tasks run to completion on the paused clock.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_sign_in_keeps_the_loaded_session() {
        let (engine, remote, _) = engine().await;
        let temp_id = reconcile::temporary_id(CollectionKind::Resources, Utc::now());
        engine.save_resource(resource(&temp_id)).await.unwrap();

        let (again, concurrent) = tokio::join!(engine.login(user("c1")), engine.login(user("c1")));
        again.unwrap();
        concurrent.unwrap();

        assert_eq!(engine.resources().await.len(), 1);
        assert_eq!(remote.sync_calls(CollectionKind::Resources), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_edits_coalesce_into_one_sync() {
        let (engine, remote, _) = engine().await;

        let temp_id = reconcile::temporary_id(CollectionKind::Resources, Utc::now());
        engine.save_resource(resource(&temp_id)).await.unwrap();
        for cost in [33.0, 34.0, 35.0] {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let mut edited = resource(&temp_id);
            edited.hourly_cost = Some(cost);
            engine.save_resource(edited).await.unwrap();
        }
        assert_eq!(remote.sync_calls(CollectionKind::Resources), 0);

        tokio::time::sleep(Duration::from_millis(801)).await;
        settle().await;

        assert_eq!(remote.sync_calls(CollectionKind::Resources), 1);
        let local = engine.resources().await;
        assert_eq!(local.len(), 1);
        assert!(!reconcile::is_temporary(CollectionKind::Resources, &local[0].id));
        assert_eq!(remote.snapshot("c1").unwrap().resources[0].hourly_cost, Some(35.0));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_sync_keeps_local_state_and_warns() {
        let (engine, remote, _) = engine().await;
        let mut notifications = engine.notifier().subscribe();
        remote.set_failing(true);

        engine.save_project(project("p-1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(801)).await;
        settle().await;

        assert_eq!(engine.projects().await[0].id, "p-1");
        let notification = notifications.recv().await.unwrap();
        assert_eq!(notification.level, Level::Warning);
        assert!(!notification.is_blocking());
    }

    #[tokio::test(start_paused = true)]
    async fn project_mapping_reaches_selection_and_cache() {
        let (engine, _, cache) = engine().await;
        engine.save_project(project("p-1")).await.unwrap();
        assert_eq!(engine.selected_project().await.unwrap().id, "p-1");

        let mapping = engine.flush(CollectionKind::Projects).await.unwrap();
        let new_id = mapping.get("p-1").unwrap().to_string();

        assert_eq!(engine.selected_project().await.unwrap().id, new_id);
        let cached: Vec<Project> =
            cache::load_json(cache.as_ref(), CollectionKind::Projects.cache_key())
                .await
                .unwrap();
        assert_eq!(cached[0].id, new_id);

        // Nothing temporary left: a second push maps nothing.
        assert!(engine.flush(CollectionKind::Projects).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn offline_bootstrap_restores_cache_and_keeps_working() {
        let remote = Arc::new(MemoryRemote::new());
        remote.set_available(false);
        let cache = Arc::new(MemoryCache::new());
        let mut cached = project("a1");
        cached.tenant_id = "c1".into();
        cache::store_json(cache.as_ref(), CollectionKind::Projects.cache_key(), &vec![cached])
            .await
            .unwrap();

        let engine = SyncEngine::new(Arc::clone(&remote), cache, SyncConfig::default());
        engine.login(user("c1")).await.unwrap();
        assert_eq!(engine.projects().await.len(), 1);

        engine.save_resource(resource("r-9")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(801)).await;
        settle().await;
        assert_eq!(engine.resources().await[0].id, "r-9");
    }

    #[tokio::test(start_paused = true)]
    async fn realtime_events_update_views_for_own_tenant_only() {
        let (engine, remote, _) = engine().await;

        let mut own = resource("b1");
        own.tenant_id = "c1".into();
        remote.push_change("c1", ChangeEvent::inserted(&own).unwrap());
        let mut foreign = resource("x1");
        foreign.tenant_id = "c2".into();
        remote.push_change("c1", ChangeEvent::inserted(&foreign).unwrap());
        settle().await;

        let resources = engine.resources().await;
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].id, "b1");
    }

    #[tokio::test(start_paused = true)]
    async fn deleting_permanent_record_reaches_remote_immediately() {
        let (engine, remote, _) = engine().await;
        engine.save_resource(resource("r-1")).await.unwrap();
        let mapping = engine.flush(CollectionKind::Resources).await.unwrap();
        let id = mapping.get("r-1").unwrap().to_string();

        engine.delete_resource(&id).await.unwrap();
        assert_eq!(remote.delete_calls(), 1);
        assert!(remote.snapshot("c1").unwrap().resources.is_empty());

        engine.save_resource(resource("r-2")).await.unwrap();
        engine.delete_resource("r-2").await.unwrap();
        assert_eq!(remote.delete_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn views_are_memoized_until_a_mutation() {
        let (engine, _, _) = engine().await;
        let first = engine.projects().await;
        assert!(Arc::ptr_eq(&first, &engine.projects().await));

        engine.save_project(project("p-1")).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &engine.projects().await));
    }

    #[tokio::test(start_paused = true)]
    async fn logout_hides_tenant_data() {
        let (engine, _, _) = engine().await;
        engine.save_project(project("p-1")).await.unwrap();
        engine.logout().await;

        assert!(engine.projects().await.is_empty());
        assert!(engine.current_user().await.is_none());
        assert!(engine.cached_user().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn new_tasks_depending_on_each_other_sync_with_permanent_ids() {
        let (engine, remote, _) = engine().await;
        engine.save_task(task("task-1", &[])).await.unwrap();
        engine.save_task(task("task-2", &["task-1"])).await.unwrap();

        tokio::time::sleep(Duration::from_millis(801)).await;
        settle().await;

        let stored = remote.snapshot("c1").unwrap().tasks;
        assert_eq!(stored.len(), 2);
        let first = stored.iter().find(|t| t.dependencies.is_empty()).unwrap();
        let second = stored.iter().find(|t| !t.dependencies.is_empty()).unwrap();
        assert_eq!(second.dependencies, vec![first.id.clone()]);

        let local = engine.tasks().await;
        assert_eq!(local.len(), 2);
        assert!(local
            .iter()
            .all(|t| !reconcile::is_temporary(CollectionKind::Tasks, &t.id)));
        let local_second = local.iter().find(|t| t.id == second.id).unwrap();
        assert_eq!(local_second.dependencies, vec![first.id.clone()]);
    }

    #[tokio::test(start_paused = true)]
    async fn record_deleted_while_its_push_is_in_flight_stays_deleted() {
        let (engine, remote, _) = engine().await;
        remote.set_latency(Duration::from_millis(500));

        engine.save_resource(resource("r-1")).await.unwrap();
        // The push starts at 800 ms and lands at 1300 ms.
        tokio::time::sleep(Duration::from_millis(900)).await;
        engine.delete_resource("r-1").await.unwrap();
        assert_eq!(remote.delete_calls(), 0);

        tokio::time::sleep(Duration::from_millis(500)).await;
        settle().await;

        assert!(engine.resources().await.is_empty());
        assert!(remote.snapshot("c1").unwrap().resources.is_empty());
        assert_eq!(remote.delete_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn echo_of_an_older_push_does_not_undo_a_newer_edit() {
        let (engine, remote, _) = engine().await;
        remote.set_latency(Duration::from_millis(500));

        let mut first = resource("b1");
        first.hourly_cost = Some(10.0);
        engine.save_resource(first).await.unwrap();
        tokio::time::sleep(Duration::from_millis(900)).await;

        let mut second = resource("b1");
        second.hourly_cost = Some(20.0);
        engine.save_resource(second).await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        settle().await;
        assert_eq!(remote.snapshot("c1").unwrap().resources[0].hourly_cost, Some(10.0));
        assert_eq!(engine.resources().await[0].hourly_cost, Some(20.0));

        tokio::time::sleep(Duration::from_millis(1000)).await;
        settle().await;
        assert_eq!(remote.snapshot("c1").unwrap().resources[0].hourly_cost, Some(20.0));
        assert_eq!(engine.resources().await[0].hourly_cost, Some(20.0));
    }

    #[tokio::test(start_paused = true)]
    async fn remote_changes_apply_once_local_edits_are_pushed() {
        let (engine, remote, _) = engine().await;
        engine.save_resource(resource("b1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(801)).await;
        settle().await;

        let mut renamed = resource("b1");
        renamed.tenant_id = "c1".into();
        renamed.name = "Armador líder".into();
        remote.push_change("c1", ChangeEvent::updated(&renamed, None).unwrap());
        settle().await;

        assert_eq!(engine.resources().await[0].name, "Armador líder");
    }
}
