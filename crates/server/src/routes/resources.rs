use axum::{
    extract::{Path, Query, State},
    routing::{delete, get, post},
    Json, Router,
};
use canteiro_core::{
    histogram::{self, DateRange, DisplayMode, Histogram, HistogramQuery, TimeStep},
    models::{CollectionKind, Resource, ResourceKind, Task},
    realtime::ChangeEvent,
    reconcile::IdMapping,
};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use sqlx::SqliteConnection;

use crate::{
    db::models::{allocations_column, convert_all, TaskRow, TASK_COLUMNS},
    error::{AppError, Result},
    handlers::ws::publish_all,
    middleware::auth::AuthUser,
    routes::{
        assign_id, change_event, classify_upsert, data, writer_tenant, SyncRequest, SyncResponse,
        Upsert,
    },
    AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sync", post(sync_resources))
        .route("/histogram", get(resource_histogram))
        .route("/:id", delete(delete_resource))
}

async fn count_kind(conn: &mut SqliteConnection, tenant_id: &str, kind: ResourceKind) -> Result<i64> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM resources WHERE tenant_id = ? AND kind = ?",
    )
    .bind(tenant_id)
    .bind(kind.as_str())
    .fetch_one(conn)
    .await?;
    Ok(count)
}

/// Labor and equipment are limited separately by the tenant's plan.
async fn sync_resources(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<SyncRequest<Resource>>,
) -> Result<Json<SyncResponse>> {
    let tenant_id = user.require_writer()?.to_string();
    let tenant = writer_tenant(&state, &tenant_id).await?;
    let now = Utc::now().to_rfc3339();

    let mut mappings = IdMapping::new();
    let mut events = Vec::new();
    let mut inserted_kinds = Vec::new();
    let mut tx = state.db.pool.begin().await?;

    for mut resource in body.items {
        if resource.name.trim().is_empty() {
            return Err(AppError::Validation("Resource name is required".to_string()));
        }
        assign_id(&mut resource, &mut mappings);
        resource.tenant_id = tenant_id.clone();

        let upsert =
            classify_upsert(&mut *tx, CollectionKind::Resources, &resource.id, &tenant_id).await?;
        match upsert {
            Upsert::Foreign => continue,
            Upsert::Insert if !inserted_kinds.contains(&resource.kind) => {
                inserted_kinds.push(resource.kind)
            }
            _ => {}
        }

        sqlx::query(
            r#"
            INSERT INTO resources (id, tenant_id, name, kind, hourly_cost, active, updated_by, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                kind = excluded.kind,
                hourly_cost = excluded.hourly_cost,
                active = excluded.active,
                updated_by = excluded.updated_by,
                updated_at = excluded.updated_at
            WHERE resources.tenant_id = excluded.tenant_id
            "#,
        )
        .bind(&resource.id)
        .bind(&resource.tenant_id)
        .bind(&resource.name)
        .bind(resource.kind.as_str())
        .bind(resource.hourly_cost)
        .bind(resource.active)
        .bind(&user.id)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        events.extend(change_event(&upsert, &resource)?);
    }

    for kind in inserted_kinds {
        let (limit, label) = match kind {
            ResourceKind::Human => (tenant.limits.labor, "labor resources"),
            ResourceKind::Equipment => (tenant.limits.equipment, "equipment resources"),
        };
        if count_kind(&mut *tx, &tenant_id, kind).await? > i64::from(limit) {
            return Err(AppError::Validation(format!(
                "Plan limit reached: {limit} {label}"
            )));
        }
    }

    tx.commit().await?;

    tracing::debug!(tenant_id = %tenant_id, mapped = mappings.len(), "Resources synced");
    publish_all(&state.feeds, &tenant_id, events).await;

    Ok(Json(SyncResponse { mappings }))
}

/// Deletes the resource and strips its allocations from every task of the
/// tenant, in one transaction.
async fn delete_resource(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<()>> {
    let tenant_id = user.require_writer()?.to_string();
    let now = Utc::now().to_rfc3339();
    let mut tx = state.db.pool.begin().await?;

    let removed = sqlx::query("DELETE FROM resources WHERE id = ? AND tenant_id = ?")
        .bind(&id)
        .bind(&tenant_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    if removed == 0 {
        return Err(AppError::NotFound("Resource not found".to_string()));
    }

    let rows = sqlx::query_as::<_, TaskRow>(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE tenant_id = ? AND allocations IS NOT NULL"
    ))
    .bind(&tenant_id)
    .fetch_all(&mut *tx)
    .await?;
    let tasks: Vec<Task> = convert_all(rows)?;

    let mut events = vec![ChangeEvent::deleted_id(CollectionKind::Resources, &id, &tenant_id)];
    for mut task in tasks.into_iter().filter(|t| t.allocations.references(&id)) {
        task.allocations = task.allocations.without_resource(&id);
        sqlx::query(
            "UPDATE tasks SET allocations = ?, updated_by = ?, updated_at = ? WHERE id = ? AND tenant_id = ?",
        )
        .bind(allocations_column(&task.allocations)?)
        .bind(&user.id)
        .bind(&now)
        .bind(&task.id)
        .bind(&tenant_id)
        .execute(&mut *tx)
        .await?;
        events.extend(change_event(&Upsert::Update, &task)?);
    }

    tx.commit().await?;

    tracing::info!(
        tenant_id = %tenant_id,
        resource_id = %id,
        tasks = events.len() - 1,
        "Resource deleted"
    );
    publish_all(&state.feeds, &tenant_id, events).await;

    Ok(Json(()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistogramParams {
    project_id: Option<String>,
    mode: Option<DisplayMode>,
    step: Option<TimeStep>,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    /// Comma separated role names.
    roles: Option<String>,
    capacity_limit: Option<f64>,
    leaf_tasks_only: Option<bool>,
}

impl HistogramParams {
    fn into_query(self, tasks: &[Task]) -> Result<HistogramQuery> {
        let range = match (self.start, self.end) {
            (Some(start), Some(end)) if start > end => {
                return Err(AppError::Validation("start must not be after end".to_string()));
            }
            (Some(start), Some(end)) => Some(DateRange { start, end }),
            (None, None) => None,
            _ => {
                return Err(AppError::Validation(
                    "start and end must be given together".to_string(),
                ));
            }
        };
        let effective_range =
            range.or_else(|| histogram::full_date_range(tasks, self.project_id.as_deref()));
        let step = self
            .step
            .or_else(|| effective_range.as_ref().map(histogram::suggested_step))
            .unwrap_or_default();
        if let Some(range) = &effective_range {
            if histogram::bucket_count(range, step) > histogram::MAX_BUCKETS {
                return Err(AppError::Validation(format!(
                    "Range too long for {} steps: at most {} buckets",
                    step_name(step),
                    histogram::MAX_BUCKETS
                )));
            }
        }

        let defaults = HistogramQuery::default();
        Ok(HistogramQuery {
            project_id: self.project_id,
            mode: self.mode.unwrap_or(defaults.mode),
            step,
            range,
            role_filters: self
                .roles
                .map(|roles| {
                    roles
                        .split(',')
                        .map(str::trim)
                        .filter(|r| !r.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            capacity_limit: self.capacity_limit.unwrap_or(defaults.capacity_limit),
            leaf_tasks_only: self.leaf_tasks_only.unwrap_or(defaults.leaf_tasks_only),
        })
    }
}

fn step_name(step: TimeStep) -> &'static str {
    match step {
        TimeStep::Daily => "daily",
        TimeStep::Weekly => "weekly",
    }
}

async fn resource_histogram(
    State(state): State<AppState>,
    user: AuthUser,
    Query(params): Query<HistogramParams>,
) -> Result<Json<Histogram>> {
    let tenant_id = user.tenant()?;
    let tasks = data::load_tasks(&state.db.pool, tenant_id).await?;
    let resources = data::load_resources(&state.db.pool, tenant_id).await?;

    let query = params.into_query(&tasks)?;
    Ok(Json(histogram::aggregate(&tasks, &resources, &query)))
}
