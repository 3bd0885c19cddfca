use std::str::FromStr;

use axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::{request::Parts, StatusCode},
    middleware::Next,
    response::Response,
};
use canteiro_core::models::Role;
use jsonwebtoken::{decode, DecodingKey, Validation};

use crate::{
    error::{AppError, Result},
    routes::auth::Claims,
    AppState,
};

#[derive(Clone, Debug)]
pub struct AuthUser {
    pub id: String,
    pub email: String,
    pub name: String,
    /// Empty for the platform superadmin.
    pub tenant_id: String,
    pub role: Role,
}

impl AuthUser {
    pub fn is_superadmin(&self) -> bool {
        self.role.is_superadmin()
    }

    /// Tenant the request acts for; business data needs one.
    pub fn tenant(&self) -> Result<&str> {
        if self.tenant_id.is_empty() {
            return Err(AppError::Forbidden("No tenant bound to this account".to_string()));
        }
        Ok(&self.tenant_id)
    }

    pub fn require_writer(&self) -> Result<&str> {
        if !self.role.can_write() {
            return Err(AppError::Forbidden("Read-only users cannot edit".to_string()));
        }
        self.tenant()
    }
}

pub fn decode_token(token: &str, secret: &str) -> Result<AuthUser> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| AppError::Unauthorized)?;

    let claims = token_data.claims;
    Ok(AuthUser {
        role: Role::from_str(&claims.role).map_err(|_| AppError::Unauthorized)?,
        id: claims.sub,
        email: claims.email,
        name: claims.name,
        tenant_id: claims.tenant_id,
    })
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> std::result::Result<Response, StatusCode> {
    let auth_header = request
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    let token = match auth_header {
        Some(t) => t,
        None => return Err(StatusCode::UNAUTHORIZED),
    };

    let user = decode_token(token, &state.config.jwt_secret).map_err(|_| StatusCode::UNAUTHORIZED)?;

    request.extensions_mut().insert(user);

    Ok(next.run(request).await)
}

// Extractor for getting the authenticated user from request extensions
#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> std::result::Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthUser>()
            .cloned()
            .ok_or(StatusCode::UNAUTHORIZED)
    }
}
