use axum::{
    extract::{Path, State},
    routing::{get, put},
    Json, Router,
};
use canteiro_core::models::{LicenseStatus, PlanId, Tenant};
use chrono::NaiveDate;
use serde::Deserialize;

use crate::{
    db::models::{convert_all, format_date, TenantRow, TENANT_COLUMNS},
    error::{AppError, Result},
    middleware::auth::AuthUser,
    AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_tenants))
        .route("/:id", get(get_tenant))
        .route("/:id/license", put(update_license))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateLicenseRequest {
    pub status: LicenseStatus,
    #[serde(default)]
    pub license_ends_on: Option<NaiveDate>,
    /// Switching plan resets the limits to the plan's defaults.
    #[serde(default)]
    pub plan_id: Option<PlanId>,
}

pub(crate) async fn find_tenant(state: &AppState, id: &str) -> Result<Option<Tenant>> {
    if id.is_empty() {
        return Ok(None);
    }
    let row = sqlx::query_as::<_, TenantRow>(&format!(
        "SELECT {TENANT_COLUMNS} FROM tenants WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(&state.db.pool)
    .await?;
    row.map(Tenant::try_from).transpose()
}

async fn list_tenants(State(state): State<AppState>, user: AuthUser) -> Result<Json<Vec<Tenant>>> {
    if !user.is_superadmin() {
        let own = find_tenant(&state, &user.tenant_id).await?;
        return Ok(Json(own.into_iter().collect()));
    }

    let rows = sqlx::query_as::<_, TenantRow>(&format!(
        "SELECT {TENANT_COLUMNS} FROM tenants ORDER BY created_at ASC"
    ))
    .fetch_all(&state.db.pool)
    .await?;

    Ok(Json(convert_all(rows)?))
}

async fn get_tenant(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Tenant>> {
    if !user.is_superadmin() && user.tenant_id != id {
        return Err(AppError::NotFound("Tenant not found".to_string()));
    }

    find_tenant(&state, &id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound("Tenant not found".to_string()))
}

async fn update_license(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(body): Json<UpdateLicenseRequest>,
) -> Result<Json<Tenant>> {
    if !user.is_superadmin() {
        return Err(AppError::Forbidden(
            "Only the superadmin can manage licenses".to_string(),
        ));
    }

    let mut tenant = find_tenant(&state, &id)
        .await?
        .ok_or_else(|| AppError::NotFound("Tenant not found".to_string()))?;

    tenant.status = body.status;
    tenant.license_ends_on = body.license_ends_on;
    if let Some(plan_id) = body.plan_id {
        tenant.plan_id = plan_id;
        tenant.limits = plan_id.default_limits();
    }

    sqlx::query(
        "UPDATE tenants SET status = ?, license_ends_on = ?, plan_id = ?, users_limit = ?, \
         projects_limit = ?, labor_limit = ?, equipment_limit = ?, roles_limit = ? WHERE id = ?",
    )
    .bind(tenant.status.as_str())
    .bind(tenant.license_ends_on.map(format_date))
    .bind(tenant.plan_id.as_str())
    .bind(i64::from(tenant.limits.users))
    .bind(i64::from(tenant.limits.projects))
    .bind(i64::from(tenant.limits.labor))
    .bind(i64::from(tenant.limits.equipment))
    .bind(i64::from(tenant.limits.roles))
    .bind(&tenant.id)
    .execute(&state.db.pool)
    .await?;

    tracing::info!(tenant_id = %tenant.id, status = tenant.status.as_str(), "License updated");

    Ok(Json(tenant))
}
