//! OAuth token exchange.
//!
//! Exchanges authorization codes (with PKCE verifier) and refresh tokens for
//! access tokens at the provider's token endpoint.

use super::provider::ProviderConfig;
use crate::error::{ConnectError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Tokens returned by the provider.
///
/// `refresh_token` may be rotated on every refresh; callers persist whatever
/// comes back.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in_seconds: Option<i64>,
    pub scope: Option<String>,
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_in_seconds", &self.expires_in_seconds)
            .field("scope", &self.scope)
            .finish()
    }
}

/// OAuth token response (standard OAuth 2.0)
#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

/// OAuth error body (RFC 6749 §5.2)
#[derive(Deserialize, Debug)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Talks to a provider's token endpoint.
#[async_trait]
pub trait TokenExchangeClient: Send + Sync {
    /// `grant_type=authorization_code`. Never retried: providers invalidate a
    /// code after its first use.
    async fn exchange_code(
        &self,
        provider: &ProviderConfig,
        code: &str,
        code_verifier: &str,
        redirect_uri: &str,
    ) -> Result<TokenSet>;

    /// `grant_type=refresh_token`. Transient failures are retried internally.
    async fn exchange_refresh_token(
        &self,
        provider: &ProviderConfig,
        refresh_token: &str,
    ) -> Result<TokenSet>;
}

/// Backoff policy for refresh-token exchanges.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
    }
}

/// reqwest-backed token exchange client.
#[derive(Clone)]
pub struct HttpTokenExchangeClient {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpTokenExchangeClient {
    /// Every request is bounded by `timeout`.
    pub fn new(timeout: Duration, retry: RetryPolicy) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConnectError::InvalidConfiguration(format!("HTTP client: {}", e)))?;
        Ok(Self { client, retry })
    }

    async fn post_token_request(
        &self,
        provider: &ProviderConfig,
        form: &[(&str, &str)],
    ) -> Result<TokenSet> {
        let mut request = self
            .client
            .post(&provider.token_url)
            .header("Accept", "application/json")
            .form(form);

        if let Some(secret) = &provider.client_secret {
            request = request.basic_auth(&provider.client_id, Some(secret));
        }

        let response = request.send().await.map_err(|e| {
            ConnectError::ProviderUnavailable(if e.is_timeout() {
                "token endpoint timed out".to_string()
            } else {
                format!("failed to reach token endpoint: {}", e)
            })
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(status.as_u16(), &body));
        }

        let token_response: TokenResponse = response.json().await.map_err(|e| {
            ConnectError::ProviderUnavailable(format!("failed to parse token response: {}", e))
        })?;

        debug!(
            has_refresh_token = token_response.refresh_token.is_some(),
            expires_in = ?token_response.expires_in,
            "Token exchange successful"
        );

        Ok(TokenSet {
            access_token: token_response.access_token,
            refresh_token: token_response.refresh_token,
            expires_in_seconds: token_response.expires_in,
            scope: token_response.scope,
        })
    }
}

/// Maps a non-2xx token endpoint response onto the error taxonomy.
fn classify_failure(status: u16, body: &str) -> ConnectError {
    if (400..500).contains(&status) {
        let message = match serde_json::from_str::<ErrorResponse>(body) {
            Ok(err) => match err.error_description {
                Some(desc) => format!("{}: {}", err.error, desc),
                None => err.error,
            },
            Err(_) if body.is_empty() => "request rejected".to_string(),
            Err(_) => body.chars().take(200).collect(),
        };
        ConnectError::ProviderRejected { status, message }
    } else {
        ConnectError::ProviderUnavailable(format!("token endpoint returned {}", status))
    }
}

#[async_trait]
impl TokenExchangeClient for HttpTokenExchangeClient {
    async fn exchange_code(
        &self,
        provider: &ProviderConfig,
        code: &str,
        code_verifier: &str,
        redirect_uri: &str,
    ) -> Result<TokenSet> {
        debug!(platform_id = provider.id, "Exchanging authorization code for token");

        self.post_token_request(
            provider,
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("code_verifier", code_verifier),
                ("client_id", provider.client_id.as_str()),
            ],
        )
        .await
    }

    async fn exchange_refresh_token(
        &self,
        provider: &ProviderConfig,
        refresh_token: &str,
    ) -> Result<TokenSet> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            debug!(platform_id = provider.id, attempt, "Exchanging refresh token");

            let result = self
                .post_token_request(
                    provider,
                    &[
                        ("grant_type", "refresh_token"),
                        ("refresh_token", refresh_token),
                        ("client_id", provider.client_id.as_str()),
                    ],
                )
                .await;

            match result {
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        platform_id = provider.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Refresh token exchange failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
