use anyhow::{Context, Result};
use social_connect::accounts::{AccountStore, HttpProfileFetcher};
use social_connect::api::{create_router, ApiState};
use social_connect::config::{load_config, ConnectConfig};
use social_connect::credentials::TokenCipher;
use social_connect::oauth::{
    run_state_cleanup, HttpTokenExchangeClient, InMemoryStateStore, OAuthStateStore,
    ProviderRegistry, RedisStateStore,
};
use social_connect::TokenLifecycleManager;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "social_connect=info".into()),
        )
        .init();

    info!("Social connect starting...");

    // Optional TOML file, then environment overrides
    let mut config = match std::env::var("SOCIAL_CONNECT_CONFIG") {
        Ok(path) => load_config(&path)?,
        Err(_) => ConnectConfig::default(),
    };
    config.apply_env();
    config.validate().context("Invalid configuration")?;

    let encryption_key = std::env::var("SOCIAL_CONNECT_ENCRYPTION_KEY")
        .context("SOCIAL_CONNECT_ENCRYPTION_KEY is required (base64-encoded 32-byte key)")?;
    let cipher = Arc::new(
        TokenCipher::from_base64_key(&encryption_key)
            .context("Failed to initialize token cipher")?,
    );

    info!(
        bind_addr = %config.bind_addr(),
        accounts_db = %config.storage.accounts_db,
        shared_state = config.storage.redis_url.is_some(),
        "Configuration loaded"
    );

    let providers = Arc::new(ProviderRegistry::from_env(config.providers.clone()));
    if providers.is_empty() {
        warn!("No OAuth providers configured; set SOCIAL_OAUTH_<NAME>_CLIENT_ID");
    }
    info!(providers = ?providers.ids().collect::<Vec<_>>(), "OAuth providers loaded");

    let accounts = Arc::new(
        AccountStore::new(&config.storage.accounts_db)
            .context("Failed to initialize account store")?,
    );
    info!("Account store initialized");

    let state_store: Arc<dyn OAuthStateStore> = match &config.storage.redis_url {
        Some(url) => Arc::new(
            RedisStateStore::connect(url, config.io_timeout())
                .await
                .context("Failed to connect to Redis state store")?,
        ),
        None => {
            warn!("Using in-memory OAuth state store; callbacks must reach this instance");
            Arc::new(InMemoryStateStore::new())
        }
    };

    let exchange = Arc::new(
        HttpTokenExchangeClient::new(config.io_timeout(), config.retry_policy())
            .context("Failed to build token exchange client")?,
    );
    let profiles = Arc::new(
        HttpProfileFetcher::new(config.io_timeout())
            .context("Failed to build profile client")?,
    );

    let manager = Arc::new(TokenLifecycleManager::new(
        providers,
        Arc::clone(&state_store),
        exchange,
        profiles,
        accounts,
        cipher,
        config.lifecycle_settings(),
    ));

    // Recurring state cleanup, stopped on shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let cleanup_handle = tokio::spawn(run_state_cleanup(
        state_store,
        config.oauth.state_cleanup_interval_seconds,
        shutdown_rx,
    ));

    // Start HTTP API server
    if config.server.service_token.is_none() {
        warn!("SOCIAL_CONNECT_SERVICE_TOKEN not set; token endpoint disabled");
    }
    if config.server.admin_token.is_none() {
        warn!("SOCIAL_CONNECT_ADMIN_TOKEN not set; admin endpoints disabled");
    }

    let api_state = ApiState {
        manager,
        service_token: config.server.service_token.clone(),
        admin_token: config.server.admin_token.clone(),
    };
    let router = create_router(api_state).layer(build_cors_layer(&config));
    let listener = tokio::net::TcpListener::bind(config.bind_addr())
        .await
        .context("Failed to bind API port")?;
    info!(addr = %config.bind_addr(), "Social connect API listening");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "API server error");
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    // Graceful shutdown
    let _ = shutdown_tx.send(true);
    if let Err(e) = cleanup_handle.await {
        warn!(error = %e, "State cleanup task ended abnormally");
    }
    server_handle.abort();
    info!("Social connect stopped");

    Ok(())
}

fn build_cors_layer(config: &ConnectConfig) -> CorsLayer {
    if config.server.cors_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = config
            .server
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
