//! Provider profile lookup with a fresh access token.

use crate::error::{ConnectError, Result};
use crate::oauth::{ProfileFormat, ProviderConfig};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// The subset of the provider profile stored on the account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderProfile {
    pub provider_account_id: String,
    pub username: Option<String>,
    pub profile_image_url: Option<String>,
    pub follower_count: Option<i64>,
}

#[async_trait]
pub trait ProfileFetcher: Send + Sync {
    async fn fetch_profile(&self, provider: &ProviderConfig, access_token: &str)
        -> Result<ProviderProfile>;
}

#[derive(Deserialize)]
struct TwitterEnvelope {
    data: TwitterUser,
}

#[derive(Deserialize)]
struct TwitterUser {
    id: String,
    username: String,
    #[serde(default)]
    profile_image_url: Option<String>,
    #[serde(default)]
    public_metrics: Option<TwitterMetrics>,
}

#[derive(Deserialize)]
struct TwitterMetrics {
    followers_count: i64,
}

#[derive(Deserialize)]
struct UserInfo {
    sub: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    preferred_username: Option<String>,
    #[serde(default)]
    picture: Option<String>,
}

/// Parses a profile body according to the provider's format.
pub fn parse_profile(format: ProfileFormat, body: &str) -> Result<ProviderProfile> {
    let malformed =
        |e: serde_json::Error| ConnectError::ProviderUnavailable(format!("malformed profile response: {}", e));

    match format {
        ProfileFormat::Twitter => {
            let envelope: TwitterEnvelope = serde_json::from_str(body).map_err(malformed)?;
            let user = envelope.data;
            Ok(ProviderProfile {
                provider_account_id: user.id,
                username: Some(user.username),
                profile_image_url: user.profile_image_url,
                follower_count: user.public_metrics.map(|m| m.followers_count),
            })
        }
        ProfileFormat::OpenIdUserInfo => {
            let info: UserInfo = serde_json::from_str(body).map_err(malformed)?;
            Ok(ProviderProfile {
                provider_account_id: info.sub,
                username: info.preferred_username.or(info.name),
                profile_image_url: info.picture,
                follower_count: None,
            })
        }
    }
}

/// reqwest-backed profile fetcher.
#[derive(Clone)]
pub struct HttpProfileFetcher {
    client: reqwest::Client,
}

impl HttpProfileFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConnectError::InvalidConfiguration(format!("HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ProfileFetcher for HttpProfileFetcher {
    async fn fetch_profile(
        &self,
        provider: &ProviderConfig,
        access_token: &str,
    ) -> Result<ProviderProfile> {
        let response = self
            .client
            .get(&provider.profile_url)
            .bearer_auth(access_token)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| ConnectError::ProviderUnavailable(format!("profile request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ConnectError::ProviderUnavailable(format!("profile body: {}", e)))?;

        if status.is_client_error() {
            return Err(ConnectError::ProviderRejected {
                status: status.as_u16(),
                message: "profile request rejected".to_string(),
            });
        }
        if !status.is_success() {
            return Err(ConnectError::ProviderUnavailable(format!(
                "profile endpoint returned {}",
                status
            )));
        }

        parse_profile(provider.profile_format, &body)
    }
}
