//! HTTP adapter over [`TokenLifecycleManager`].
//!
//! Handlers stay thin: extract the caller, call one manager operation, map
//! the result. The caller's identity arrives in `X-User-Id`; authenticating
//! it is the job of whatever sits in front of this service. Routes that hand
//! out tokens or cross-user data additionally require a configured bearer
//! token.

pub mod accounts;
pub mod connect;

pub use accounts::create_accounts_router;
pub use connect::create_connect_router;

use crate::error::ConnectError;
use crate::lifecycle::TokenLifecycleManager;
use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, warn};

pub const USER_ID_HEADER: &str = "x-user-id";

/// Shared application state for the connect and account APIs
#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<TokenLifecycleManager>,
    /// Bearer token for the plaintext token route; `None` disables it
    pub service_token: Option<String>,
    /// Bearer token for admin routes; `None` disables them
    pub admin_token: Option<String>,
}

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Application error types for HTTP endpoints
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Conflict(String),
    BadGateway(String),
    ServiceUnavailable(String),
    ServerError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            AppError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            AppError::ServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse {
            error: error_message,
        });

        (status, body).into_response()
    }
}

impl From<ConnectError> for AppError {
    fn from(err: ConnectError) -> Self {
        match err {
            ConnectError::InvalidState => {
                AppError::BadRequest("Connection failed or expired, please retry".to_string())
            }
            ConnectError::ProviderRejected { message, .. } => {
                AppError::BadGateway(format!("Provider rejected the request: {}", message))
            }
            ConnectError::ProviderUnavailable(_) => AppError::ServiceUnavailable(
                "Provider temporarily unavailable, please retry".to_string(),
            ),
            ConnectError::ReauthRequired { .. } => {
                AppError::Conflict("Reconnect your account".to_string())
            }
            ConnectError::AccountNotFound(id) => {
                AppError::NotFound(format!("Account '{}' not found", id))
            }
            ConnectError::UnknownPlatform(id) => {
                AppError::NotFound(format!("Platform {} is not configured", id))
            }
            other => {
                error!(error = %other, "Request failed");
                AppError::ServerError("Internal error".to_string())
            }
        }
    }
}

/// Reads the calling user from `X-User-Id`.
pub fn extract_user_id(headers: &HeaderMap) -> Result<i64, AppError> {
    let value = headers
        .get(USER_ID_HEADER)
        .ok_or_else(|| AppError::Unauthorized("Missing X-User-Id header".to_string()))?;

    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<i64>().ok())
        .ok_or_else(|| AppError::Unauthorized("Invalid X-User-Id header".to_string()))
}

/// Checks `Authorization: Bearer <token>` against the configured token.
///
/// An unconfigured token means the route is switched off and reports 404.
pub fn require_bearer(headers: &HeaderMap, expected: &Option<String>) -> Result<(), AppError> {
    let Some(expected_token) = expected else {
        return Err(AppError::NotFound("Not found".to_string()));
    };

    let presented = headers
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "));

    match presented {
        Some(token) if token == expected_token => Ok(()),
        _ => {
            warn!("Rejected request with missing or invalid bearer token");
            Err(AppError::Unauthorized("Unauthorized".to_string()))
        }
    }
}

/// Both routers merged under one state.
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .merge(create_connect_router(state.clone()))
        .merge(create_accounts_router(state))
}
