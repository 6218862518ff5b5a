use crate::error::ConnectError;
use crate::lifecycle::LifecycleSettings;
use crate::oauth::{ProviderConfig, RetryPolicy};
use anyhow::Context;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

/// Complete service configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    /// Providers beyond (or overriding) the built-in Twitter/LinkedIn entries
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Allowed CORS origins. Empty allows any origin.
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Bearer token for `GET /api/accounts/:id/token`. Route disabled when unset.
    #[serde(default)]
    pub service_token: Option<String>,
    /// Bearer token for `/api/admin/*`. Routes disabled when unset.
    #[serde(default)]
    pub admin_token: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
            service_token: None,
            admin_token: None,
        }
    }
}

/// Persistence configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// SQLite file holding `social_accounts`
    #[serde(default = "default_accounts_db")]
    pub accounts_db: String,
    /// Shared state store. In-memory store is used when unset.
    #[serde(default)]
    pub redis_url: Option<String>,
}

fn default_accounts_db() -> String {
    "social_accounts.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            accounts_db: default_accounts_db(),
            redis_url: None,
        }
    }
}

/// Connection flow and token lifecycle tunables
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    #[serde(default = "default_state_ttl")]
    pub state_ttl_seconds: u64,
    #[serde(default = "default_state_cleanup_interval")]
    pub state_cleanup_interval_seconds: u64,
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin_seconds: i64,
    #[serde(default = "default_max_refresh_failures")]
    pub max_refresh_failures: i64,
    /// Bound on every provider and Redis call
    #[serde(default = "default_io_timeout")]
    pub io_timeout_seconds: u64,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
    /// Public base URL used to derive redirect URIs
    #[serde(default = "default_callback_base_url")]
    pub callback_base_url: String,
}

fn default_state_ttl() -> u64 {
    600
}

fn default_state_cleanup_interval() -> u64 {
    60
}

fn default_refresh_margin() -> i64 {
    60
}

fn default_max_refresh_failures() -> i64 {
    3
}

fn default_io_timeout() -> u64 {
    10
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    200
}

fn default_callback_base_url() -> String {
    "http://localhost:3000".to_string()
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            state_ttl_seconds: default_state_ttl(),
            state_cleanup_interval_seconds: default_state_cleanup_interval(),
            refresh_margin_seconds: default_refresh_margin(),
            max_refresh_failures: default_max_refresh_failures(),
            io_timeout_seconds: default_io_timeout(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay(),
            callback_base_url: default_callback_base_url(),
        }
    }
}

impl ConnectConfig {
    /// Overrides fields from `SOCIAL_CONNECT_*` env vars. Unparseable values
    /// are ignored with a warning.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Same as [`ConnectConfig::apply_env`] with an injectable lookup.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(key: &str, value: Option<String>) -> Option<T> {
            let value = value?;
            match value.parse::<T>() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(key, value = %value, "Ignoring unparseable environment override");
                    None
                }
            }
        }

        fn non_empty(value: String) -> Option<String> {
            if value.trim().is_empty() {
                None
            } else {
                Some(value)
            }
        }

        if let Some(v) = lookup("SOCIAL_CONNECT_HOST") {
            self.server.host = v;
        }
        if let Some(v) = parsed("SOCIAL_CONNECT_PORT", lookup("SOCIAL_CONNECT_PORT")) {
            self.server.port = v;
        }
        if let Some(v) = lookup("SOCIAL_CONNECT_SERVICE_TOKEN") {
            self.server.service_token = non_empty(v);
        }
        if let Some(v) = lookup("SOCIAL_CONNECT_ADMIN_TOKEN") {
            self.server.admin_token = non_empty(v);
        }
        if let Some(v) = lookup("SOCIAL_CONNECT_ACCOUNTS_DB") {
            self.storage.accounts_db = v;
        }
        if let Some(v) = lookup("SOCIAL_CONNECT_REDIS_URL") {
            self.storage.redis_url = non_empty(v);
        }
        if let Some(v) = parsed("SOCIAL_CONNECT_STATE_TTL_SECONDS", lookup("SOCIAL_CONNECT_STATE_TTL_SECONDS")) {
            self.oauth.state_ttl_seconds = v;
        }
        if let Some(v) = parsed(
            "SOCIAL_CONNECT_REFRESH_MARGIN_SECONDS",
            lookup("SOCIAL_CONNECT_REFRESH_MARGIN_SECONDS"),
        ) {
            self.oauth.refresh_margin_seconds = v;
        }
        if let Some(v) = parsed(
            "SOCIAL_CONNECT_MAX_REFRESH_FAILURES",
            lookup("SOCIAL_CONNECT_MAX_REFRESH_FAILURES"),
        ) {
            self.oauth.max_refresh_failures = v;
        }
        if let Some(v) = parsed("SOCIAL_CONNECT_IO_TIMEOUT_SECONDS", lookup("SOCIAL_CONNECT_IO_TIMEOUT_SECONDS")) {
            self.oauth.io_timeout_seconds = v;
        }
        if let Some(v) = lookup("SOCIAL_CONNECT_CALLBACK_BASE_URL") {
            self.oauth.callback_base_url = v;
        }
    }

    /// Rejects values the lifecycle cannot run with.
    pub fn validate(&self) -> Result<(), ConnectError> {
        let invalid = |msg: &str| Err(ConnectError::InvalidConfiguration(msg.to_string()));

        if self.oauth.state_ttl_seconds == 0 {
            return invalid("oauth.state_ttl_seconds must be positive");
        }
        if self.oauth.state_cleanup_interval_seconds == 0 {
            return invalid("oauth.state_cleanup_interval_seconds must be positive");
        }
        if self.oauth.refresh_margin_seconds < 0 {
            return invalid("oauth.refresh_margin_seconds must not be negative");
        }
        if self.oauth.max_refresh_failures < 1 {
            return invalid("oauth.max_refresh_failures must be at least 1");
        }
        if self.oauth.io_timeout_seconds == 0 {
            return invalid("oauth.io_timeout_seconds must be positive");
        }
        if self.oauth.retry_max_attempts == 0 {
            return invalid("oauth.retry_max_attempts must be at least 1");
        }
        if self.oauth.callback_base_url.trim().is_empty() {
            return invalid("oauth.callback_base_url must be set");
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.oauth.io_timeout_seconds)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.oauth.retry_max_attempts,
            base_delay: Duration::from_millis(self.oauth.retry_base_delay_ms),
        }
    }

    pub fn lifecycle_settings(&self) -> LifecycleSettings {
        LifecycleSettings {
            state_ttl: Duration::from_secs(self.oauth.state_ttl_seconds),
            refresh_margin: chrono::Duration::seconds(self.oauth.refresh_margin_seconds),
            max_refresh_failures: self.oauth.max_refresh_failures,
            callback_base_url: self.oauth.callback_base_url.clone(),
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> anyhow::Result<ConnectConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path))?;
    let config: ConnectConfig =
        toml::from_str(&contents).with_context(|| format!("Failed to parse config file {}", path))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::ProfileFormat;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = ConnectConfig::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.storage.accounts_db, "social_accounts.db");
        assert_eq!(config.storage.redis_url, None);
        assert_eq!(config.oauth.state_ttl_seconds, 600);
        assert_eq!(config.oauth.refresh_margin_seconds, 60);
        assert_eq!(config.oauth.max_refresh_failures, 3);
        assert_eq!(config.oauth.io_timeout_seconds, 10);
        assert_eq!(config.server.service_token, None);
        assert_eq!(config.server.admin_token, None);
        assert!(config.providers.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [server]
            host = "127.0.0.1"
            port = 8080
            admin_token = "ops-secret"

            [storage]
            accounts_db = "/var/lib/social/accounts.db"
            redis_url = "redis://cache:6379"

            [oauth]
            state_ttl_seconds = 300
            max_refresh_failures = 5
            callback_base_url = "https://poster.example"

            [[providers]]
            id = 3
            name = "mastodon"
            authorize_url = "https://mastodon.example/oauth/authorize"
            token_url = "https://mastodon.example/oauth/token"
            profile_url = "https://mastodon.example/oauth/userinfo"
            default_scopes = ["read", "write"]
            client_id = "masto-client"
        "#;

        let config: ConnectConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.bind_addr(), "127.0.0.1:8080");
        assert_eq!(config.server.admin_token.as_deref(), Some("ops-secret"));
        assert_eq!(config.server.service_token, None);
        assert_eq!(config.storage.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.oauth.state_ttl_seconds, 300);
        assert_eq!(config.oauth.max_refresh_failures, 5);
        assert_eq!(config.oauth.refresh_margin_seconds, 60); // Default

        let provider = &config.providers[0];
        assert_eq!(provider.id, 3);
        assert_eq!(provider.profile_format, ProfileFormat::OpenIdUserInfo);
        assert_eq!(provider.client_secret, None);

        let settings = config.lifecycle_settings();
        assert_eq!(settings.state_ttl, Duration::from_secs(300));
        assert_eq!(settings.callback_base_url, "https://poster.example");
    }

    #[test]
    fn test_partial_config() {
        let toml = r#"
            [oauth]
            refresh_margin_seconds = 120
        "#;

        let config: ConnectConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.oauth.refresh_margin_seconds, 120);
        assert_eq!(config.oauth.state_ttl_seconds, 600); // Default
        assert_eq!(config.server.port, 3000); // Default
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("SOCIAL_CONNECT_PORT", "9000"),
            ("SOCIAL_CONNECT_REDIS_URL", "redis://localhost"),
            ("SOCIAL_CONNECT_MAX_REFRESH_FAILURES", "not-a-number"),
            ("SOCIAL_CONNECT_CALLBACK_BASE_URL", "https://app.example"),
            ("SOCIAL_CONNECT_SERVICE_TOKEN", "svc-secret"),
            ("SOCIAL_CONNECT_ADMIN_TOKEN", " "),
        ]);

        let mut config = ConnectConfig::default();
        config.apply_env_from(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.storage.redis_url.as_deref(), Some("redis://localhost"));
        assert_eq!(config.oauth.max_refresh_failures, 3); // Unparseable, kept
        assert_eq!(config.oauth.callback_base_url, "https://app.example");
        assert_eq!(config.server.service_token.as_deref(), Some("svc-secret"));
        assert_eq!(config.server.admin_token, None); // Blank disables
    }

    #[test]
    fn test_validate_rejects_zero_ttl() {
        let mut config = ConnectConfig::default();
        config.oauth.state_ttl_seconds = 0;
        assert!(matches!(
            config.validate(),
            Err(ConnectError::InvalidConfiguration(_))
        ));

        let mut config = ConnectConfig::default();
        config.oauth.max_refresh_failures = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_config_missing_file() {
        assert!(load_config("/nonexistent/social-connect.toml").is_err());
    }
}
