use axum::{
    extract::{Path, State},
    routing::{delete, post},
    Json, Router,
};
use canteiro_core::{
    models::{CollectionKind, Project},
    realtime::ChangeEvent,
    reconcile::IdMapping,
};
use chrono::Utc;

use crate::{
    db::models::format_date,
    error::{AppError, Result},
    handlers::ws::publish_all,
    middleware::auth::AuthUser,
    routes::{
        assign_id, change_event, classify_upsert, count_rows, writer_tenant, SyncRequest,
        SyncResponse, Upsert,
    },
    AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sync", post(sync_projects))
        .route("/:id", delete(delete_project))
}

/// Upserts the batch in one transaction. Rows that arrived with temporary
/// ids are stored under fresh UUIDs, reported back in `mappings`.
async fn sync_projects(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<SyncRequest<Project>>,
) -> Result<Json<SyncResponse>> {
    let tenant_id = user.require_writer()?.to_string();
    let tenant = writer_tenant(&state, &tenant_id).await?;
    let now = Utc::now().to_rfc3339();

    let mut mappings = IdMapping::new();
    let mut events = Vec::new();
    let mut inserted = 0;
    let mut tx = state.db.pool.begin().await?;

    for mut project in body.items {
        if project.name.trim().is_empty() {
            return Err(AppError::Validation("Project name is required".to_string()));
        }
        assign_id(&mut project, &mut mappings);
        project.tenant_id = tenant_id.clone();

        let upsert = classify_upsert(&mut *tx, CollectionKind::Projects, &project.id, &tenant_id).await?;
        if matches!(upsert, Upsert::Foreign) {
            continue;
        }
        if matches!(upsert, Upsert::Insert) {
            inserted += 1;
        }

        sqlx::query(
            r#"
            INSERT INTO projects (id, tenant_id, name, description, client_name, location, status,
                start_date, end_date, budget, logo_url, baseline_set, updated_by, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                client_name = excluded.client_name,
                location = excluded.location,
                status = excluded.status,
                start_date = excluded.start_date,
                end_date = excluded.end_date,
                budget = excluded.budget,
                logo_url = excluded.logo_url,
                baseline_set = excluded.baseline_set,
                updated_by = excluded.updated_by,
                updated_at = excluded.updated_at
            WHERE projects.tenant_id = excluded.tenant_id
            "#,
        )
        .bind(&project.id)
        .bind(&project.tenant_id)
        .bind(&project.name)
        .bind(&project.description)
        .bind(&project.client_name)
        .bind(&project.location)
        .bind(project.status.as_str())
        .bind(format_date(project.start_date))
        .bind(format_date(project.end_date))
        .bind(project.budget)
        .bind(&project.logo_url)
        .bind(project.baseline_set)
        .bind(&user.id)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        events.extend(change_event(&upsert, &project)?);
    }

    if inserted > 0 {
        let count = count_rows(&mut *tx, CollectionKind::Projects, &tenant_id).await?;
        if count > i64::from(tenant.limits.projects) {
            return Err(AppError::Validation(format!(
                "Plan limit reached: {} projects",
                tenant.limits.projects
            )));
        }
    }

    tx.commit().await?;

    tracing::debug!(tenant_id = %tenant_id, mapped = mappings.len(), "Projects synced");
    publish_all(&state.feeds, &tenant_id, events).await;

    Ok(Json(SyncResponse { mappings }))
}

/// Deletes a project together with its daily logs.
async fn delete_project(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<()>> {
    let tenant_id = user.require_writer()?.to_string();
    let mut tx = state.db.pool.begin().await?;

    let removed = sqlx::query("DELETE FROM projects WHERE id = ? AND tenant_id = ?")
        .bind(&id)
        .bind(&tenant_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    if removed == 0 {
        return Err(AppError::NotFound("Project not found".to_string()));
    }

    let log_ids = sqlx::query_scalar::<_, String>(
        "SELECT id FROM daily_logs WHERE project_id = ? AND tenant_id = ?",
    )
    .bind(&id)
    .bind(&tenant_id)
    .fetch_all(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM daily_logs WHERE project_id = ? AND tenant_id = ?")
        .bind(&id)
        .bind(&tenant_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    tracing::info!(tenant_id = %tenant_id, project_id = %id, logs = log_ids.len(), "Project deleted");

    let mut events = vec![ChangeEvent::deleted_id(CollectionKind::Projects, &id, &tenant_id)];
    events.extend(
        log_ids
            .iter()
            .map(|log_id| ChangeEvent::deleted_id(CollectionKind::DailyLogs, log_id, &tenant_id)),
    );
    publish_all(&state.feeds, &tenant_id, events).await;

    Ok(Json(()))
}
