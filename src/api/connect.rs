//! Connection flow endpoints.
//!
//! 1. POST /api/connect/:platform_id/start → `{auth_url, state}`; the UI sends
//!    the browser to `auth_url`
//! 2. User authorizes on the provider's site
//! 3. Provider redirects to /api/connect/:platform_id/callback
//! 4. State consumed, code exchanged, account linked

use super::{extract_user_id, ApiState, AppError};
use crate::accounts::SocialAccountSummary;
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Body of the start request. Both fields are optional.
#[derive(Debug, Default, Deserialize)]
pub struct StartRequest {
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub auth_url: String,
    pub state: String,
}

/// OAuth callback query parameters
#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CallbackResponse {
    pub success: bool,
    pub account: SocialAccountSummary,
}

pub fn create_connect_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/connect/:platform_id/start", post(connect_start))
        .route("/api/connect/:platform_id/callback", get(connect_callback))
        .with_state(state)
}

/// POST /api/connect/:platform_id/start
async fn connect_start(
    State(state): State<ApiState>,
    Path(platform_id): Path<i64>,
    headers: HeaderMap,
    body: Option<Json<StartRequest>>,
) -> Result<Json<StartResponse>, AppError> {
    let user_id = extract_user_id(&headers)?;
    let request = body.map(|Json(r)| r).unwrap_or_default();

    debug!(user_id, platform_id, "Connect start requested");

    let initiated = state
        .manager
        .initiate_connection(
            user_id,
            platform_id,
            request.callback_url.as_deref(),
            &request.scopes,
        )
        .await?;

    Ok(Json(StartResponse {
        auth_url: initiated.auth_url,
        state: initiated.state,
    }))
}

/// GET /api/connect/:platform_id/callback
///
/// No caller header here: the browser arrives from the provider, and the
/// state alone identifies the pending authorization.
async fn connect_callback(
    State(state): State<ApiState>,
    Path(platform_id): Path<i64>,
    Query(callback): Query<CallbackQuery>,
) -> Result<Json<CallbackResponse>, AppError> {
    debug!(platform_id, "OAuth callback received");

    if let Some(error) = callback.error {
        let Some(csrf_state) = callback.state else {
            warn!(platform_id, error = %error, "OAuth error callback without state");
            return Err(AppError::BadRequest(format!("OAuth authorization failed: {}", error)));
        };
        let err = state
            .manager
            .reject_callback(&csrf_state, &error, callback.error_description.as_deref())
            .await;
        return Err(err.into());
    }

    let code = callback
        .code
        .ok_or_else(|| AppError::BadRequest("Missing 'code' parameter".to_string()))?;
    let csrf_state = callback
        .state
        .ok_or_else(|| AppError::BadRequest("Missing 'state' parameter".to_string()))?;

    let account = state
        .manager
        .complete_platform_callback(platform_id, &code, &csrf_state)
        .await?;

    Ok(Json(CallbackResponse {
        success: true,
        account: account.summary(),
    }))
}
