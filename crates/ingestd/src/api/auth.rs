use axum::extract::{Extension, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use validator::Validate;

use super::{ApiError, Request};
use crate::app::App;
use crate::tokens::{self, AuthedUser};

#[derive(Debug, Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(email)]
    pub email: String,
    /// Accepted for compatibility with password-login clients; identity is
    /// established at the edge and the core trusts the email.
    #[serde(default)]
    #[allow(dead_code)]
    pub password: Option<String>,
}

pub async fn login(
    State(app): State<Arc<App>>,
    Request(body): Request<LoginRequest>,
) -> Result<Json<tokens::IssuedTokens>, ApiError> {
    let issued = tokens::login(&app.signer, &body.email, &app.pool).await?;
    tracing::info!(email = %body.email, "login");
    Ok(Json(issued))
}

#[derive(Debug, Deserialize, Validate)]
pub struct RefreshRequest {
    #[validate(length(min = 1))]
    pub refresh_token: String,
}

pub async fn refresh(
    State(app): State<Arc<App>>,
    Request(body): Request<RefreshRequest>,
) -> Result<Json<tokens::RefreshedToken>, ApiError> {
    Ok(Json(
        tokens::refresh(&app.signer, &body.refresh_token, &app.pool).await?,
    ))
}

pub async fn logout(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthedUser>,
) -> Result<Json<serde_json::Value>, ApiError> {
    catalog_sql::users::revoke_token(&user.token_id, &app.pool).await?;
    Ok(Json(serde_json::json!({})))
}

#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub user_id: String,
    pub email: String,
    pub name: Option<String>,
    pub email_verified: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_login: Option<chrono::DateTime<chrono::Utc>>,
}

pub async fn me(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthedUser>,
) -> Result<Json<MeResponse>, ApiError> {
    let profile = catalog_sql::users::fetch_profile(&user.email, &app.pool)
        .await?
        .ok_or_else(|| ApiError::not_found("user profile"))?;

    Ok(Json(MeResponse {
        user_id: profile.user_id,
        email: profile.email,
        name: profile.name,
        email_verified: true,
        created_at: profile.created_at,
        last_login: profile.last_login,
    }))
}

/// Never rejects: reports whether the presented credentials (if any) resolve
/// to a live user.
pub async fn status(user: Option<Extension<AuthedUser>>) -> Json<serde_json::Value> {
    match user {
        Some(Extension(user)) => Json(serde_json::json!({
            "authenticated": true,
            "email": user.email,
        })),
        None => Json(serde_json::json!({"authenticated": false})),
    }
}
