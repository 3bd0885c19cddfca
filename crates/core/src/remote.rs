//! Contracts of the external collaborators the core talks to.

use std::future::Future;

use tokio::sync::broadcast;

use crate::error::Result;
use crate::models::{CollectionKind, DailyLog, InitialData, Project, Resource, Task, Tenant, User};
use crate::realtime::ChangeEvent;
use crate::reconcile::IdMapping;

/// The remote data store. Sync operations upsert a batch and answer with the
/// ids the store assigned to records that arrived with temporary ids.
pub trait RemoteStore: Send + Sync + 'static {
    fn is_available(&self) -> bool;

    fn load_initial_data(&self, tenant_id: &str) -> impl Future<Output = Result<InitialData>> + Send;

    fn load_tenant_data(&self, tenant_id: &str) -> impl Future<Output = Result<Option<Tenant>>> + Send;

    fn sync_projects(
        &self,
        projects: Vec<Project>,
        acting_user_id: &str,
        tenant_id: &str,
    ) -> impl Future<Output = Result<IdMapping>> + Send;

    fn bulk_sync_tasks(
        &self,
        tasks: Vec<Task>,
        acting_user_id: &str,
        tenant_id: &str,
    ) -> impl Future<Output = Result<IdMapping>> + Send;

    fn sync_resources(
        &self,
        resources: Vec<Resource>,
        acting_user_id: &str,
        tenant_id: &str,
    ) -> impl Future<Output = Result<IdMapping>> + Send;

    fn sync_daily_logs(
        &self,
        logs: Vec<DailyLog>,
        acting_user_id: &str,
        tenant_id: &str,
    ) -> impl Future<Output = Result<IdMapping>> + Send;

    fn delete_record(
        &self,
        kind: CollectionKind,
        id: &str,
        tenant_id: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Change feed of one table, limited to one tenant.
    fn subscribe(
        &self,
        tenant_id: &str,
        kind: CollectionKind,
    ) -> impl Future<Output = Result<broadcast::Receiver<ChangeEvent>>> + Send;
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionCheck {
    Valid(User),
    Invalid { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthEvent {
    SignedIn(User),
    SignedOut,
    TokenRefreshed,
}

pub trait AuthService: Send + Sync + 'static {
    fn current_user(&self) -> impl Future<Output = Result<Option<User>>> + Send;

    /// Checks that the session token, the stored user and its tenant still
    /// agree and that the user is active.
    fn validate_session(&self) -> impl Future<Output = SessionCheck> + Send;

    fn logout(&self) -> impl Future<Output = Result<()>> + Send;

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent>;
}
