use axum::{
    extract::{Path, State},
    routing::{delete, post},
    Json, Router,
};
use canteiro_core::{
    models::{CollectionKind, Task},
    realtime::ChangeEvent,
    reconcile::IdMapping,
};
use chrono::Utc;

use crate::{
    db::models::{allocations_column, format_date, to_json},
    error::{AppError, Result},
    handlers::ws::{publish, publish_all},
    middleware::auth::AuthUser,
    routes::{assign_id, change_event, classify_upsert, SyncRequest, SyncResponse, Upsert},
    AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sync", post(sync_tasks))
        .route("/:id", delete(delete_task))
}

async fn sync_tasks(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<SyncRequest<Task>>,
) -> Result<Json<SyncResponse>> {
    let tenant_id = user.require_writer()?.to_string();
    let now = Utc::now().to_rfc3339();

    let mut items = body.items;
    let mut mappings = IdMapping::new();
    for task in &mut items {
        if task.project_id.is_empty() {
            return Err(AppError::Validation("Task without project".to_string()));
        }
        assign_id(task, &mut mappings);
    }

    let mut events = Vec::new();
    let mut tx = state.db.pool.begin().await?;

    for mut task in items {
        // Dependencies on tasks created in the same batch.
        for dependency in &mut task.dependencies {
            mappings.remap(dependency);
        }
        task.tenant_id = tenant_id.clone();

        let upsert = classify_upsert(&mut *tx, CollectionKind::Tasks, &task.id, &tenant_id).await?;
        if matches!(upsert, Upsert::Foreign) {
            continue;
        }

        sqlx::query(
            r#"
            INSERT INTO tasks (id, tenant_id, project_id, name, wbs, planned_start, planned_end,
                dependencies, planned_quantity, done_quantity, weight, planned_cost, allocations,
                updated_by, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                project_id = excluded.project_id,
                name = excluded.name,
                wbs = excluded.wbs,
                planned_start = excluded.planned_start,
                planned_end = excluded.planned_end,
                dependencies = excluded.dependencies,
                planned_quantity = excluded.planned_quantity,
                done_quantity = excluded.done_quantity,
                weight = excluded.weight,
                planned_cost = excluded.planned_cost,
                allocations = excluded.allocations,
                updated_by = excluded.updated_by,
                updated_at = excluded.updated_at
            WHERE tasks.tenant_id = excluded.tenant_id
            "#,
        )
        .bind(&task.id)
        .bind(&task.tenant_id)
        .bind(&task.project_id)
        .bind(&task.name)
        .bind(&task.wbs)
        .bind(format_date(task.planned_start))
        .bind(format_date(task.planned_end))
        .bind(to_json(&task.dependencies)?)
        .bind(task.planned_quantity)
        .bind(task.done_quantity)
        .bind(task.weight)
        .bind(task.planned_cost)
        .bind(allocations_column(&task.allocations)?)
        .bind(&user.id)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        events.extend(change_event(&upsert, &task)?);
    }

    tx.commit().await?;

    tracing::debug!(tenant_id = %tenant_id, mapped = mappings.len(), "Tasks synced");
    publish_all(&state.feeds, &tenant_id, events).await;

    Ok(Json(SyncResponse { mappings }))
}

async fn delete_task(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<()>> {
    let tenant_id = user.require_writer()?.to_string();

    let removed = sqlx::query("DELETE FROM tasks WHERE id = ? AND tenant_id = ?")
        .bind(&id)
        .bind(&tenant_id)
        .execute(&state.db.pool)
        .await?
        .rows_affected();

    if removed == 0 {
        return Err(AppError::NotFound("Task not found".to_string()));
    }

    publish(
        &state.feeds,
        &tenant_id,
        ChangeEvent::deleted_id(CollectionKind::Tasks, &id, &tenant_id),
    )
    .await;

    Ok(Json(()))
}
