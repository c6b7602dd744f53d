pub mod compare;
pub mod extract;
pub mod pages;
pub mod uploads;

use std::sync::Arc;

use axum::http::HeaderMap;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::app::AppState;
use crate::auth::{bearer_token, verify_token};
use crate::error::ApiError;
use crate::models::api::AuthContext;

/// Build all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(uploads::routes())
        .merge(pages::routes())
        .merge(extract::routes())
        .merge(compare::routes())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Verify the access token (header or SSE query param), check the blacklist
/// and attach the active workspace from the `X-Workspace-Id` header.
pub async fn require_workspace(
    state: &AppState,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> Result<AuthContext, ApiError> {
    let token = bearer_token(
        headers.get("authorization").and_then(|v| v.to_str().ok()),
        query_token,
    )?;
    let identity = verify_token(token, &state.ctx.settings.jwt_secret_key)?;

    if let Some(jti) = &identity.jti {
        if state.blacklist.is_revoked(jti).await {
            return Err(ApiError::Unauthorized("token has been revoked".into()));
        }
    }

    let workspace_id = headers
        .get("x-workspace-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::Validation("X-Workspace-Id header required".into()))?;

    Ok(AuthContext {
        user_id: identity.user_id,
        workspace_id: workspace_id.to_string(),
    })
}
