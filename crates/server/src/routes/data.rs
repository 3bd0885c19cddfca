use axum::{extract::State, routing::get, Json, Router};
use canteiro_core::models::{DailyLog, InitialData, Project, Resource, Task};
use sqlx::SqlitePool;

use crate::{
    db::models::{
        convert_all, DailyLogRow, ProjectRow, ResourceRow, TaskRow, DAILY_LOG_COLUMNS,
        PROJECT_COLUMNS, RESOURCE_COLUMNS, TASK_COLUMNS,
    },
    error::Result,
    middleware::auth::AuthUser,
    AppState,
};

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(initial_data))
}

pub(crate) async fn load_projects(pool: &SqlitePool, tenant_id: &str) -> Result<Vec<Project>> {
    let rows = sqlx::query_as::<_, ProjectRow>(&format!(
        "SELECT {PROJECT_COLUMNS} FROM projects WHERE tenant_id = ? ORDER BY start_date ASC, name ASC"
    ))
    .bind(tenant_id)
    .fetch_all(pool)
    .await?;
    convert_all(rows)
}

pub(crate) async fn load_tasks(pool: &SqlitePool, tenant_id: &str) -> Result<Vec<Task>> {
    let rows = sqlx::query_as::<_, TaskRow>(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE tenant_id = ? ORDER BY project_id ASC, wbs ASC"
    ))
    .bind(tenant_id)
    .fetch_all(pool)
    .await?;
    convert_all(rows)
}

pub(crate) async fn load_resources(pool: &SqlitePool, tenant_id: &str) -> Result<Vec<Resource>> {
    let rows = sqlx::query_as::<_, ResourceRow>(&format!(
        "SELECT {RESOURCE_COLUMNS} FROM resources WHERE tenant_id = ? ORDER BY name ASC"
    ))
    .bind(tenant_id)
    .fetch_all(pool)
    .await?;
    convert_all(rows)
}

pub(crate) async fn load_daily_logs(pool: &SqlitePool, tenant_id: &str) -> Result<Vec<DailyLog>> {
    let rows = sqlx::query_as::<_, DailyLogRow>(&format!(
        "SELECT {DAILY_LOG_COLUMNS} FROM daily_logs WHERE tenant_id = ? ORDER BY date DESC"
    ))
    .bind(tenant_id)
    .fetch_all(pool)
    .await?;
    convert_all(rows)
}

/// Everything the caller's tenant owns.
async fn initial_data(State(state): State<AppState>, user: AuthUser) -> Result<Json<InitialData>> {
    let tenant_id = user.tenant()?;
    let pool = &state.db.pool;

    Ok(Json(InitialData {
        projects: load_projects(pool, tenant_id).await?,
        tasks: load_tasks(pool, tenant_id).await?,
        resources: load_resources(pool, tenant_id).await?,
        daily_logs: load_daily_logs(pool, tenant_id).await?,
    }))
}
