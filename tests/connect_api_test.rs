// Integration tests for the connect and account APIs

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use social_connect::accounts::{AccountStore, ProfileFetcher, ProviderProfile};
use social_connect::api::{create_router, ApiState};
use social_connect::credentials::TokenCipher;
use social_connect::oauth::{
    InMemoryStateStore, ProfileFormat, ProviderConfig, ProviderRegistry, TokenExchangeClient,
    TokenSet,
};
use social_connect::{LifecycleSettings, Result, TokenLifecycleManager};
use std::sync::Arc;
use tower::ServiceExt;

struct StubExchange;

#[async_trait]
impl TokenExchangeClient for StubExchange {
    async fn exchange_code(
        &self,
        _provider: &ProviderConfig,
        code: &str,
        _code_verifier: &str,
        _redirect_uri: &str,
    ) -> Result<TokenSet> {
        Ok(TokenSet {
            access_token: format!("AT-for-{}", code),
            refresh_token: Some("RT-1".to_string()),
            expires_in_seconds: Some(7200),
            scope: None,
        })
    }

    async fn exchange_refresh_token(
        &self,
        _provider: &ProviderConfig,
        _refresh_token: &str,
    ) -> Result<TokenSet> {
        Ok(TokenSet {
            access_token: "AT-refreshed".to_string(),
            refresh_token: None,
            expires_in_seconds: Some(7200),
            scope: None,
        })
    }
}

struct StubProfile;

#[async_trait]
impl ProfileFetcher for StubProfile {
    async fn fetch_profile(&self, _: &ProviderConfig, _: &str) -> Result<ProviderProfile> {
        Ok(ProviderProfile {
            provider_account_id: "li-55".to_string(),
            username: Some("Jane Poster".to_string()),
            profile_image_url: Some("https://media.example/jane.jpg".to_string()),
            follower_count: None,
        })
    }
}

const SERVICE_TOKEN: &str = "svc-token";
const ADMIN_TOKEN: &str = "admin-token";

fn create_test_app() -> Router {
    create_test_app_with(Some(SERVICE_TOKEN), Some(ADMIN_TOKEN))
}

fn create_test_app_with(service_token: Option<&str>, admin_token: Option<&str>) -> Router {
    let providers = ProviderRegistry::new(vec![ProviderConfig {
        id: 2,
        name: "linkedin".to_string(),
        authorize_url: "https://provider.example/oauth/v2/authorization".to_string(),
        token_url: "https://provider.example/oauth/v2/accessToken".to_string(),
        profile_url: "https://provider.example/v2/userinfo".to_string(),
        profile_format: ProfileFormat::OpenIdUserInfo,
        default_scopes: vec!["openid".to_string(), "profile".to_string()],
        client_id: "li-client".to_string(),
        client_secret: Some("li-secret".to_string()),
    }]);

    let manager = TokenLifecycleManager::new(
        Arc::new(providers),
        Arc::new(InMemoryStateStore::new()),
        Arc::new(StubExchange),
        Arc::new(StubProfile),
        Arc::new(AccountStore::new(":memory:").unwrap()),
        Arc::new(TokenCipher::new(&[0u8; 32]).unwrap()),
        LifecycleSettings::default(),
    );

    create_router(ApiState {
        manager: Arc::new(manager),
        service_token: service_token.map(str::to_string),
        admin_token: admin_token.map(str::to_string),
    })
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

fn start_request(user_id: &str, platform_id: i64) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(format!("/api/connect/{}/start", platform_id))
        .header("x-user-id", user_id)
        .header("content-type", "application/json")
        .body(Body::from("{}"))
        .unwrap()
}

fn get(uri: &str, user_id: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(user_id) = user_id {
        builder = builder.header("x-user-id", user_id);
    }
    builder.body(Body::empty()).unwrap()
}

fn with_bearer(mut request: Request<Body>, token: &str) -> Request<Body> {
    request.headers_mut().insert(
        "authorization",
        format!("Bearer {}", token).parse().unwrap(),
    );
    request
}

/// Runs start + callback for `user_id` and returns the account id.
async fn connect(app: &Router, user_id: &str) -> String {
    let (status, json) = send(app, start_request(user_id, 2)).await;
    assert_eq!(status, StatusCode::OK);
    let state = json["state"].as_str().unwrap().to_string();

    let (status, json) = send(
        app,
        get(&format!("/api/connect/2/callback?code=c0de&state={}", state), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    json["account"]["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_start_requires_user_header() {
    let app = create_test_app();

    let request = Request::builder()
        .method("POST")
        .uri("/api/connect/2/start")
        .body(Body::empty())
        .unwrap();
    let (status, json) = send(&app, request).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(json["error"].as_str().unwrap().contains("X-User-Id"));
}

#[tokio::test]
async fn test_start_unknown_platform() {
    let app = create_test_app();
    let (status, _) = send(&app, start_request("7", 99)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_start_returns_authorization_url() {
    let app = create_test_app();

    let (status, json) = send(&app, start_request("7", 2)).await;

    assert_eq!(status, StatusCode::OK);
    let auth_url = json["auth_url"].as_str().unwrap();
    let state = json["state"].as_str().unwrap();
    assert!(auth_url.starts_with("https://provider.example/oauth/v2/authorization?"));
    assert!(auth_url.contains("code_challenge_method=S256"));
    assert!(auth_url.contains(&format!("state={}", state)));
    assert!(auth_url.contains("scope=openid%20profile"));
}

#[tokio::test]
async fn test_start_without_body_uses_defaults() {
    let app = create_test_app();

    let request = Request::builder()
        .method("POST")
        .uri("/api/connect/2/start")
        .header("x-user-id", "7")
        .body(Body::empty())
        .unwrap();
    let (status, json) = send(&app, request).await;

    assert_eq!(status, StatusCode::OK);
    assert!(json["auth_url"]
        .as_str()
        .unwrap()
        .contains("redirect_uri=http%3A%2F%2Flocalhost%3A3000%2Fapi%2Fconnect%2F2%2Fcallback"));
}

#[tokio::test]
async fn test_callback_links_account_once() {
    let app = create_test_app();

    let (_, json) = send(&app, start_request("7", 2)).await;
    let state = json["state"].as_str().unwrap().to_string();
    let callback = format!("/api/connect/2/callback?code=c0de&state={}", state);

    let (status, json) = send(&app, get(&callback, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    assert_eq!(json["account"]["user_id"], 7);
    assert_eq!(json["account"]["provider_account_id"], "li-55");
    assert_eq!(json["account"]["connection_status"], "connected");
    assert!(json["account"].get("encrypted_access_token").is_none());

    // Replay
    let (status, json) = send(&app, get(&callback, None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("retry"));
}

#[tokio::test]
async fn test_callback_missing_code() {
    let app = create_test_app();
    let (status, _) = send(&app, get("/api/connect/2/callback?state=abc", None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_callback_consent_denied() {
    let app = create_test_app();

    let (_, json) = send(&app, start_request("7", 2)).await;
    let state = json["state"].as_str().unwrap().to_string();

    let (status, _) = send(
        &app,
        get(
            &format!(
                "/api/connect/2/callback?error=access_denied&error_description=denied&state={}",
                state
            ),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);

    // State was consumed
    let (status, _) = send(
        &app,
        get(&format!("/api/connect/2/callback?code=c0de&state={}", state), None),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_list_accounts_is_scoped_to_caller() {
    let app = create_test_app();
    connect(&app, "7").await;

    let (status, json) = send(&app, get("/api/accounts", Some("7"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["accounts"].as_array().unwrap().len(), 1);

    let (_, json) = send(&app, get("/api/accounts?platform_id=1", Some("7"))).await;
    assert!(json["accounts"].as_array().unwrap().is_empty());

    let (_, json) = send(&app, get("/api/accounts", Some("8"))).await;
    assert!(json["accounts"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_token_endpoint() {
    let app = create_test_app();
    let account_id = connect(&app, "7").await;
    let uri = format!("/api/accounts/{}/token", account_id);

    let response = app
        .clone()
        .oneshot(with_bearer(get(&uri, Some("7")), SERVICE_TOKEN))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["cache-control"], "no-store");
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["access_token"], "AT-for-c0de");

    // Another user's account looks absent
    let (status, _) = send(&app, with_bearer(get(&uri, Some("8")), SERVICE_TOKEN)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_token_endpoint_requires_service_token() {
    let app = create_test_app();
    let account_id = connect(&app, "7").await;
    let uri = format!("/api/accounts/{}/token", account_id);

    // The user header alone is not enough
    let (status, json) = send(&app, get(&uri, Some("7"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(json.get("access_token").is_none());

    let (status, _) = send(&app, with_bearer(get(&uri, Some("7")), ADMIN_TOKEN)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_token_endpoint_disabled_without_service_token() {
    let app = create_test_app_with(None, Some(ADMIN_TOKEN));
    let account_id = connect(&app, "7").await;

    let (status, json) = send(
        &app,
        with_bearer(get(&format!("/api/accounts/{}/token", account_id), Some("7")), SERVICE_TOKEN),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json.get("access_token").is_none());
}

#[tokio::test]
async fn test_disconnect_then_token_requires_reconnect() {
    let app = create_test_app();
    let account_id = connect(&app, "7").await;

    let delete = Request::builder()
        .method("DELETE")
        .uri(format!("/api/accounts/{}", account_id))
        .header("x-user-id", "7")
        .body(Body::empty())
        .unwrap();
    let (status, json) = send(&app, delete).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);

    let (status, json) = send(
        &app,
        with_bearer(get(&format!("/api/accounts/{}/token", account_id), Some("7")), SERVICE_TOKEN),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["error"], "Reconnect your account");

    let (_, json) = send(&app, get("/api/accounts", Some("7"))).await;
    assert!(json["accounts"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_health_endpoints() {
    let app = create_test_app();
    let account_id = connect(&app, "7").await;

    let (status, json) = send(&app, get(&format!("/api/accounts/{}/health", account_id), Some("7"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["connection_status"], "connected");
    assert_eq!(json["error_count"], 0);

    let (status, json) = send(&app, with_bearer(get("/api/admin/token-health", None), ADMIN_TOKEN)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["accounts"].as_array().unwrap().len(), 1);
    assert_eq!(json["accounts"][0]["account_id"], account_id.as_str());

    let (status, _) = send(&app, get("/api/accounts/missing/health", Some("7"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_admin_health_requires_admin_token() {
    let app = create_test_app();
    connect(&app, "7").await;

    let (status, json) = send(&app, get("/api/admin/token-health", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(json.get("accounts").is_none());

    let (status, _) = send(&app, with_bearer(get("/api/admin/token-health", None), SERVICE_TOKEN)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let app = create_test_app_with(Some(SERVICE_TOKEN), None);
    let (status, _) = send(&app, with_bearer(get("/api/admin/token-health", None), ADMIN_TOKEN)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_callback_on_other_platform_links_nothing() {
    let app = create_test_app();

    let (_, json) = send(&app, start_request("7", 2)).await;
    let state = json["state"].as_str().unwrap().to_string();

    let (status, _) = send(
        &app,
        get(&format!("/api/connect/1/callback?code=c0de&state={}", state), None),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, json) = send(&app, get("/api/accounts", Some("7"))).await;
    assert!(json["accounts"].as_array().unwrap().is_empty());

    // The state is spent; the right callback cannot reuse it
    let (status, _) = send(
        &app,
        get(&format!("/api/connect/2/callback?code=c0de&state={}", state), None),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
