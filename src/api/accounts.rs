//! Account listing, disconnect, token and health endpoints.

use super::{extract_user_id, require_bearer, ApiState, AppError};
use crate::accounts::{SocialAccountSummary, TokenHealth};
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub platform_id: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub accounts: Vec<SocialAccountSummary>,
}

#[derive(Serialize)]
pub struct TokenResponse {
    pub account_id: String,
    pub access_token: String,
}

#[derive(Debug, Serialize)]
pub struct DisconnectResponse {
    pub success: bool,
    pub account_id: String,
}

#[derive(Debug, Serialize)]
pub struct HealthListResponse {
    pub accounts: Vec<TokenHealth>,
}

pub fn create_accounts_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/accounts", get(list_accounts))
        .route("/api/accounts/:id", axum::routing::delete(disconnect_account))
        .route("/api/accounts/:id/token", get(account_token))
        .route("/api/accounts/:id/health", get(account_health))
        .route("/api/admin/token-health", get(all_token_health))
        .with_state(state)
}

/// Resolves the account and checks it belongs to the caller. Someone else's
/// account is reported as not found.
fn owned_account(
    state: &ApiState,
    headers: &HeaderMap,
    account_id: &str,
) -> Result<SocialAccountSummary, AppError> {
    let user_id = extract_user_id(headers)?;
    let account = state.manager.get_account(account_id)?;
    if account.user_id != user_id {
        return Err(AppError::NotFound(format!("Account '{}' not found", account_id)));
    }
    Ok(account)
}

/// GET /api/accounts?platform_id=
async fn list_accounts(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse>, AppError> {
    let user_id = extract_user_id(&headers)?;
    let accounts = state
        .manager
        .list_connected_accounts(user_id, query.platform_id)?;
    Ok(Json(ListResponse { accounts }))
}

/// DELETE /api/accounts/:id
async fn disconnect_account(
    State(state): State<ApiState>,
    Path(account_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<DisconnectResponse>, AppError> {
    let account = owned_account(&state, &headers, &account_id)?;
    state.manager.disconnect_account(&account.id).await?;

    info!(account_id = %account.id, user_id = account.user_id, "Account disconnected via API");

    Ok(Json(DisconnectResponse {
        success: true,
        account_id,
    }))
}

/// GET /api/accounts/:id/token
///
/// For internal collaborators (the posting pipeline), who must present the
/// service bearer token. Responses are never cached.
async fn account_token(
    State(state): State<ApiState>,
    Path(account_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    require_bearer(&headers, &state.service_token)?;
    let account = owned_account(&state, &headers, &account_id)?;
    let access_token = state.manager.get_valid_access_token(&account.id).await?;

    let mut response = Json(TokenResponse {
        account_id,
        access_token,
    })
    .into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    Ok(response)
}

/// GET /api/accounts/:id/health
async fn account_health(
    State(state): State<ApiState>,
    Path(account_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<TokenHealth>, AppError> {
    let account = owned_account(&state, &headers, &account_id)?;
    Ok(Json(state.manager.token_health(&account.id)?))
}

/// GET /api/admin/token-health
async fn all_token_health(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<HealthListResponse>, AppError> {
    require_bearer(&headers, &state.admin_token)?;
    Ok(Json(HealthListResponse {
        accounts: state.manager.list_token_health()?,
    }))
}
