//! OAuth provider configurations.
//!
//! Defines OAuth 2.0 endpoints and client credentials for each supported
//! social platform.

use crate::error::{ConnectError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Platform id for Twitter/X.
pub const TWITTER_PLATFORM_ID: i64 = 1;

/// Platform id for LinkedIn.
pub const LINKEDIN_PLATFORM_ID: i64 = 2;

/// Shape of the provider's "who am I" response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileFormat {
    /// Twitter API v2 `GET /2/users/me`
    Twitter,
    /// OpenID Connect `userinfo` (LinkedIn and most OIDC providers)
    OpenIdUserInfo,
}

/// OAuth provider configuration
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Platform id used throughout the application
    pub id: i64,

    /// Short name, also used for env var lookup (e.g. "twitter")
    pub name: String,

    /// OAuth authorization endpoint URL
    pub authorize_url: String,

    /// OAuth token exchange endpoint URL
    pub token_url: String,

    /// Profile endpoint called with the fresh access token
    pub profile_url: String,

    #[serde(default = "default_profile_format")]
    pub profile_format: ProfileFormat,

    /// Scopes requested when the caller asks for none
    #[serde(default)]
    pub default_scopes: Vec<String>,

    pub client_id: String,

    /// Absent for public clients
    #[serde(default)]
    pub client_secret: Option<String>,
}

fn default_profile_format() -> ProfileFormat {
    ProfileFormat::OpenIdUserInfo
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("authorize_url", &self.authorize_url)
            .field("token_url", &self.token_url)
            .field("profile_url", &self.profile_url)
            .field("profile_format", &self.profile_format)
            .field("default_scopes", &self.default_scopes)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl ProviderConfig {
    /// Scopes to request: the caller's, or the provider defaults when empty.
    pub fn effective_scopes(&self, requested: &[String]) -> Vec<String> {
        if requested.is_empty() {
            self.default_scopes.clone()
        } else {
            requested.to_vec()
        }
    }
}

/// Built-in provider endpoints; credentials still come from the environment.
fn builtin_endpoints(name: &str) -> Option<(i64, &'static str, &'static str, &'static str, ProfileFormat, Vec<&'static str>)> {
    match name {
        "twitter" => Some((
            TWITTER_PLATFORM_ID,
            "https://twitter.com/i/oauth2/authorize",
            "https://api.twitter.com/2/oauth2/token",
            "https://api.twitter.com/2/users/me?user.fields=profile_image_url,public_metrics",
            ProfileFormat::Twitter,
            vec!["tweet.read", "tweet.write", "users.read", "offline.access"],
        )),
        "linkedin" => Some((
            LINKEDIN_PLATFORM_ID,
            "https://www.linkedin.com/oauth/v2/authorization",
            "https://www.linkedin.com/oauth/v2/accessToken",
            "https://api.linkedin.com/v2/userinfo",
            ProfileFormat::OpenIdUserInfo,
            vec!["openid", "profile", "w_member_social"],
        )),
        _ => None,
    }
}

/// Names of the built-in providers
pub const BUILTIN_PROVIDERS: &[&str] = &["twitter", "linkedin"];

/// Loads a built-in provider from `SOCIAL_OAUTH_{NAME}_CLIENT_ID` / `_CLIENT_SECRET`.
///
/// Returns `None` when the provider is unknown or the client id is not set.
pub fn builtin_from_env(name: &str) -> Option<ProviderConfig> {
    let (id, authorize_url, token_url, profile_url, profile_format, scopes) =
        builtin_endpoints(name)?;

    let env_prefix = name.to_uppercase();
    let client_id = std::env::var(format!("SOCIAL_OAUTH_{}_CLIENT_ID", env_prefix)).ok()?;
    let client_secret = std::env::var(format!("SOCIAL_OAUTH_{}_CLIENT_SECRET", env_prefix)).ok();

    Some(ProviderConfig {
        id,
        name: name.to_string(),
        authorize_url: authorize_url.to_string(),
        token_url: token_url.to_string(),
        profile_url: profile_url.to_string(),
        profile_format,
        default_scopes: scopes.into_iter().map(|s| s.to_string()).collect(),
        client_id,
        client_secret,
    })
}

/// Configured providers keyed by platform id.
#[derive(Clone, Debug, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<i64, ProviderConfig>,
}

impl ProviderRegistry {
    pub fn new(providers: impl IntoIterator<Item = ProviderConfig>) -> Self {
        Self {
            providers: providers.into_iter().map(|p| (p.id, p)).collect(),
        }
    }

    /// Built-in providers whose credentials are present in the environment,
    /// overlaid with `extra` (later entries win on id clashes).
    pub fn from_env(extra: impl IntoIterator<Item = ProviderConfig>) -> Self {
        let mut registry = Self::new(BUILTIN_PROVIDERS.iter().filter_map(|n| builtin_from_env(n)));
        for provider in extra {
            registry.providers.insert(provider.id, provider);
        }
        registry
    }

    pub fn get(&self, platform_id: i64) -> Result<&ProviderConfig> {
        self.providers
            .get(&platform_id)
            .ok_or(ConnectError::UnknownPlatform(platform_id))
    }

    pub fn contains(&self, platform_id: i64) -> bool {
        self.providers.contains_key(&platform_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = i64> + '_ {
        self.providers.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
