use axum::{
    extract::{Path, State},
    routing::{delete, post},
    Json, Router,
};
use canteiro_core::{
    models::{CollectionKind, DailyLog},
    realtime::ChangeEvent,
    reconcile::IdMapping,
};
use chrono::Utc;

use crate::{
    db::models::{format_date, to_json},
    error::{AppError, Result},
    handlers::ws::{publish, publish_all},
    middleware::auth::AuthUser,
    routes::{assign_id, change_event, classify_upsert, SyncRequest, SyncResponse, Upsert},
    AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sync", post(sync_daily_logs))
        .route("/:id", delete(delete_daily_log))
}

async fn sync_daily_logs(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<SyncRequest<DailyLog>>,
) -> Result<Json<SyncResponse>> {
    let tenant_id = user.require_writer()?.to_string();
    let now = Utc::now().to_rfc3339();

    let mut mappings = IdMapping::new();
    let mut events = Vec::new();
    let mut tx = state.db.pool.begin().await?;

    for mut log in body.items {
        if log.project_id.is_empty() {
            return Err(AppError::Validation("Daily log without project".to_string()));
        }
        assign_id(&mut log, &mut mappings);
        log.tenant_id = tenant_id.clone();
        if log.author_id.is_empty() {
            log.author_id = user.id.clone();
        }

        let upsert = classify_upsert(&mut *tx, CollectionKind::DailyLogs, &log.id, &tenant_id).await?;
        if matches!(upsert, Upsert::Foreign) {
            continue;
        }

        sqlx::query(
            r#"
            INSERT INTO daily_logs (id, tenant_id, project_id, date, author_id, notes, progress,
                photos, updated_by, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                project_id = excluded.project_id,
                date = excluded.date,
                author_id = excluded.author_id,
                notes = excluded.notes,
                progress = excluded.progress,
                photos = excluded.photos,
                updated_by = excluded.updated_by,
                updated_at = excluded.updated_at
            WHERE daily_logs.tenant_id = excluded.tenant_id
            "#,
        )
        .bind(&log.id)
        .bind(&log.tenant_id)
        .bind(&log.project_id)
        .bind(format_date(log.date))
        .bind(&log.author_id)
        .bind(&log.notes)
        .bind(to_json(&log.progress)?)
        .bind(to_json(&log.photos)?)
        .bind(&user.id)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        events.extend(change_event(&upsert, &log)?);
    }

    tx.commit().await?;

    tracing::debug!(tenant_id = %tenant_id, mapped = mappings.len(), "Daily logs synced");
    publish_all(&state.feeds, &tenant_id, events).await;

    Ok(Json(SyncResponse { mappings }))
}

async fn delete_daily_log(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<()>> {
    let tenant_id = user.require_writer()?.to_string();

    let removed = sqlx::query("DELETE FROM daily_logs WHERE id = ? AND tenant_id = ?")
        .bind(&id)
        .bind(&tenant_id)
        .execute(&state.db.pool)
        .await?
        .rows_affected();

    if removed == 0 {
        return Err(AppError::NotFound("Daily log not found".to_string()));
    }

    publish(
        &state.feeds,
        &tenant_id,
        ChangeEvent::deleted_id(CollectionKind::DailyLogs, &id, &tenant_id),
    )
    .await;

    Ok(Json(()))
}
