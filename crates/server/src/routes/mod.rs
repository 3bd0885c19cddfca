pub mod auth;
pub mod daily_logs;
pub mod data;
pub mod projects;
pub mod resources;
pub mod tasks;
pub mod tenants;

use canteiro_core::{
    models::{CollectionKind, Entity, Tenant},
    realtime::ChangeEvent,
    reconcile::{self, IdMapping},
};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::{
    error::{AppError, Result},
    AppState,
};

/// Body of every `POST /<collection>/sync`.
#[derive(Debug, Deserialize)]
pub struct SyncRequest<T> {
    pub items: Vec<T>,
}

#[derive(Debug, Serialize)]
pub struct SyncResponse {
    /// Temporary id to the id the row was stored under.
    pub mappings: IdMapping,
}

/// Gives a record that arrived with a temporary id a fresh UUID.
pub(crate) fn assign_id<T: Entity>(item: &mut T, mappings: &mut IdMapping) {
    if reconcile::is_temporary(T::KIND, item.id()) {
        let id = Uuid::new_v4().to_string();
        if !item.id().is_empty() {
            mappings.insert(item.id(), id.clone());
        }
        item.set_id(id);
    }
}

/// Tenant currently owning row `id` of `kind`, if the row exists.
pub(crate) async fn row_owner(
    conn: &mut SqliteConnection,
    kind: CollectionKind,
    id: &str,
) -> Result<Option<String>> {
    let owner = sqlx::query_scalar::<_, String>(&format!(
        "SELECT tenant_id FROM {} WHERE id = ?",
        kind.table()
    ))
    .bind(id)
    .fetch_optional(conn)
    .await?;
    Ok(owner)
}

pub(crate) enum Upsert {
    Insert,
    Update,
    /// The id belongs to another tenant; the row is left alone.
    Foreign,
}

pub(crate) async fn classify_upsert(
    conn: &mut SqliteConnection,
    kind: CollectionKind,
    id: &str,
    tenant_id: &str,
) -> Result<Upsert> {
    Ok(match row_owner(conn, kind, id).await? {
        None => Upsert::Insert,
        Some(owner) if owner == tenant_id => Upsert::Update,
        Some(owner) => {
            tracing::warn!(table = %kind, id, tenant_id, owner = %owner, "Refusing cross-tenant upsert");
            Upsert::Foreign
        }
    })
}

pub(crate) fn change_event<T: Entity + Serialize>(upsert: &Upsert, record: &T) -> Result<Option<ChangeEvent>> {
    let event = match upsert {
        Upsert::Insert => ChangeEvent::inserted(record),
        Upsert::Update => ChangeEvent::updated(record, None),
        Upsert::Foreign => return Ok(None),
    };
    event
        .map(Some)
        .map_err(|e| AppError::Internal(format!("Failed to encode change event: {e}")))
}

pub(crate) async fn count_rows(
    conn: &mut SqliteConnection,
    kind: CollectionKind,
    tenant_id: &str,
) -> Result<i64> {
    let count = sqlx::query_scalar::<_, i64>(&format!(
        "SELECT COUNT(*) FROM {} WHERE tenant_id = ?",
        kind.table()
    ))
    .bind(tenant_id)
    .fetch_one(conn)
    .await?;
    Ok(count)
}

/// The caller's tenant, which must exist for writes that check plan limits.
pub(crate) async fn writer_tenant(state: &AppState, tenant_id: &str) -> Result<Tenant> {
    let tenant = tenants::find_tenant(state, tenant_id)
        .await?
        .ok_or_else(|| AppError::Forbidden("Tenant not found".to_string()))?;
    if tenant.is_expired() {
        return Err(AppError::Forbidden("License expired".to_string()));
    }
    Ok(tenant)
}
