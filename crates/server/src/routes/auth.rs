use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{
    extract::State,
    middleware as axum_middleware,
    routing::{get, post},
    Json, Router,
};
use canteiro_core::models::{LicenseStatus, PlanId, Role, Tenant, User};
use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    db::models::{UserRow, USER_COLUMNS},
    error::{AppError, Result},
    middleware::auth::{auth_middleware, AuthUser},
    routes::tenants::find_tenant,
    AppState,
};

pub fn router(state: AppState) -> Router<AppState> {
    let session = Router::new()
        .route("/me", get(me))
        .route("/validate", get(validate))
        .route_layer(axum_middleware::from_fn_with_state(state, auth_middleware));

    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .merge(session)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub company_name: String,
    #[serde(default)]
    pub tax_id: Option<String>,
    #[serde(default)]
    pub plan_id: Option<PlanId>,
    pub email: String,
    pub name: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub user: User,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<Tenant>,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub user: User,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<Tenant>,
}

#[derive(Debug, Serialize)]
pub struct ValidateResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
}

impl ValidateResponse {
    fn invalid(reason: &str) -> Self {
        Self {
            valid: false,
            reason: Some(reason.to_string()),
            user: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user id
    pub email: String,
    pub name: String,
    pub tenant_id: String,
    pub role: String,
    pub exp: usize,
}

pub(crate) fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|_| AppError::Internal("Failed to hash password".to_string()))
}

fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed_hash = PasswordHash::new(hash)
        .map_err(|_| AppError::Internal("Invalid password hash".to_string()))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

pub(crate) fn create_token(user: &User, secret: &str) -> Result<String> {
    let expiration = Utc::now()
        .checked_add_signed(chrono::Duration::days(7))
        .ok_or_else(|| AppError::Internal("Token expiry out of range".to_string()))?
        .timestamp() as usize;

    let claims = Claims {
        sub: user.id.clone(),
        email: user.email.clone(),
        name: user.name.clone(),
        tenant_id: user.tenant_id.clone(),
        role: user.role.as_str().to_string(),
        exp: expiration,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|_| AppError::Internal("Failed to create token".to_string()))
}

async fn find_user(state: &AppState, id: &str) -> Result<Option<User>> {
    let row = sqlx::query_as::<_, UserRow>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?"))
        .bind(id)
        .fetch_optional(&state.db.pool)
        .await?;
    row.map(User::try_from).transpose()
}

async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Result<Json<AuthResponse>> {
    // Validate input
    if body.email.is_empty() || !body.email.contains('@') {
        return Err(AppError::Validation("Invalid email address".to_string()));
    }
    if body.name.trim().is_empty() {
        return Err(AppError::Validation("Name is required".to_string()));
    }
    if body.company_name.trim().is_empty() {
        return Err(AppError::Validation("Company name is required".to_string()));
    }
    if body.password.len() < 8 {
        return Err(AppError::Validation(
            "Password must be at least 8 characters".to_string(),
        ));
    }

    // Check if user already exists
    let existing = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users WHERE email = ?")
        .bind(&body.email)
        .fetch_one(&state.db.pool)
        .await?;

    if existing > 0 {
        return Err(AppError::Validation("Email already registered".to_string()));
    }

    let password_hash = hash_password(&body.password)?;
    let now = Utc::now().to_rfc3339();
    let plan_id = body.plan_id.unwrap_or(PlanId::Basic);

    let tenant = Tenant {
        id: Uuid::new_v4().to_string(),
        name: body.company_name.trim().to_string(),
        tax_id: body.tax_id,
        logo_url: None,
        plan_id,
        license_ends_on: None,
        status: LicenseStatus::Active,
        limits: plan_id.default_limits(),
    };
    let user = User {
        id: Uuid::new_v4().to_string(),
        name: body.name.trim().to_string(),
        email: body.email,
        tenant_id: tenant.id.clone(),
        role: Role::Admin,
        active: true,
        job_title: None,
    };

    // Tenant and its first admin are created together
    let mut tx = state.db.pool.begin().await?;

    sqlx::query(
        "INSERT INTO tenants (id, name, tax_id, plan_id, status, users_limit, projects_limit, \
         labor_limit, equipment_limit, roles_limit, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&tenant.id)
    .bind(&tenant.name)
    .bind(&tenant.tax_id)
    .bind(tenant.plan_id.as_str())
    .bind(tenant.status.as_str())
    .bind(i64::from(tenant.limits.users))
    .bind(i64::from(tenant.limits.projects))
    .bind(i64::from(tenant.limits.labor))
    .bind(i64::from(tenant.limits.equipment))
    .bind(i64::from(tenant.limits.roles))
    .bind(&now)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "INSERT INTO users (id, tenant_id, email, name, password_hash, role, active, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, 1, ?)",
    )
    .bind(&user.id)
    .bind(&user.tenant_id)
    .bind(&user.email)
    .bind(&user.name)
    .bind(&password_hash)
    .bind(user.role.as_str())
    .bind(&now)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    tracing::info!(tenant_id = %tenant.id, user_id = %user.id, "Registered tenant");

    let token = create_token(&user, &state.config.jwt_secret)?;

    Ok(Json(AuthResponse {
        token,
        user,
        tenant: Some(tenant),
    }))
}

async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<AuthResponse>> {
    // Find user by email
    let row = sqlx::query_as::<_, UserRow>(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE email = ?"
    ))
    .bind(&body.email)
    .fetch_optional(&state.db.pool)
    .await?
    .ok_or(AppError::Unauthorized)?;

    // Verify password
    if !verify_password(&body.password, &row.password_hash)? {
        return Err(AppError::Unauthorized);
    }

    let user = User::try_from(row)?;
    if !user.active {
        return Err(AppError::Forbidden("Account is disabled".to_string()));
    }

    let tenant = find_tenant(&state, &user.tenant_id).await?;
    let token = create_token(&user, &state.config.jwt_secret)?;

    Ok(Json(AuthResponse {
        token,
        user,
        tenant,
    }))
}

async fn me(State(state): State<AppState>, auth: AuthUser) -> Result<Json<SessionResponse>> {
    let user = find_user(&state, &auth.id)
        .await?
        .ok_or(AppError::Unauthorized)?;
    let tenant = find_tenant(&state, &user.tenant_id).await?;

    Ok(Json(SessionResponse { user, tenant }))
}

/// Re-checks a session against the stored user: the account must still
/// exist, be active, belong to the tenant in the token and, unless it is the
/// superadmin, hold an unexpired license.
async fn validate(State(state): State<AppState>, auth: AuthUser) -> Result<Json<ValidateResponse>> {
    let Some(user) = find_user(&state, &auth.id).await? else {
        return Ok(Json(ValidateResponse::invalid("User no longer exists")));
    };

    if !user.active {
        return Ok(Json(ValidateResponse::invalid("Account is disabled")));
    }

    if user.tenant_id != auth.tenant_id {
        tracing::warn!(
            user_id = %user.id,
            token_tenant = %auth.tenant_id,
            stored_tenant = %user.tenant_id,
            "Tenant mismatch between token and account"
        );
        return Ok(Json(ValidateResponse::invalid("Tenant mismatch")));
    }

    if !user.role.is_superadmin() {
        let tenant = find_tenant(&state, &user.tenant_id).await?;
        match tenant {
            None => return Ok(Json(ValidateResponse::invalid("Tenant not found"))),
            Some(t) if t.is_expired() => {
                return Ok(Json(ValidateResponse::invalid("License expired")))
            }
            Some(_) => {}
        }
    }

    Ok(Json(ValidateResponse {
        valid: true,
        reason: None,
        user: Some(user),
    }))
}
