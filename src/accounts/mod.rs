//! Linked social accounts.
//!
//! `social_accounts` is the system of record for tokens. Only ciphertext and
//! IVs are persisted; summaries and health views never carry either.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod linker;
mod profile;
mod storage;

pub use linker::AccountLinker;
pub use profile::{HttpProfileFetcher, ProfileFetcher, ProviderProfile};
pub use storage::{AccountStore, AccountUpsert};

use crate::credentials::SealedToken;

/// Health label for a linked account.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Expired,
    Error,
    Pending,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Expired => "expired",
            ConnectionStatus::Error => "error",
            ConnectionStatus::Pending => "pending",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "connected" => Some(ConnectionStatus::Connected),
            "disconnected" => Some(ConnectionStatus::Disconnected),
            "expired" => Some(ConnectionStatus::Expired),
            "error" => Some(ConnectionStatus::Error),
            "pending" => Some(ConnectionStatus::Pending),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token protocol variant in use for an account.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OAuthVersion {
    #[serde(rename = "1.0a")]
    V1a,
    #[serde(rename = "2.0")]
    V2,
}

impl OAuthVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            OAuthVersion::V1a => "1.0a",
            OAuthVersion::V2 => "2.0",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1.0a" => Some(OAuthVersion::V1a),
            "2.0" => Some(OAuthVersion::V2),
            _ => None,
        }
    }
}

/// A linked provider account as persisted.
#[derive(Clone, PartialEq)]
pub struct SocialAccount {
    pub id: String,
    pub user_id: i64,
    pub platform_id: i64,
    pub provider_account_id: String,
    pub account_username: Option<String>,
    pub profile_image_url: Option<String>,
    pub follower_count: Option<i64>,
    pub oauth_version: OAuthVersion,
    pub encrypted_access_token: Option<String>,
    pub encrypted_refresh_token: Option<String>,
    /// IV for `encrypted_access_token`
    pub token_encryption_iv: Option<String>,
    /// IV for `encrypted_refresh_token`
    pub refresh_token_iv: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub connection_status: ConnectionStatus,
    pub last_error: Option<String>,
    pub error_count: i64,
    pub token_refresh_attempts: i64,
    pub last_token_refresh: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SocialAccount {
    pub fn sealed_access_token(&self) -> Option<SealedToken> {
        match (&self.encrypted_access_token, &self.token_encryption_iv) {
            (Some(ciphertext), Some(iv)) => Some(SealedToken {
                ciphertext: ciphertext.clone(),
                iv: iv.clone(),
            }),
            _ => None,
        }
    }

    pub fn sealed_refresh_token(&self) -> Option<SealedToken> {
        match (&self.encrypted_refresh_token, &self.refresh_token_iv) {
            (Some(ciphertext), Some(iv)) => Some(SealedToken {
                ciphertext: ciphertext.clone(),
                iv: iv.clone(),
            }),
            _ => None,
        }
    }

    /// True when the token expires within `margin` of `now` (or already has).
    /// Accounts without a known expiry never need a refresh.
    pub fn needs_refresh(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        match self.token_expires_at {
            Some(expires_at) => expires_at - margin <= now,
            None => false,
        }
    }

    pub fn summary(&self) -> SocialAccountSummary {
        SocialAccountSummary {
            id: self.id.clone(),
            user_id: self.user_id,
            platform_id: self.platform_id,
            provider_account_id: self.provider_account_id.clone(),
            account_username: self.account_username.clone(),
            profile_image_url: self.profile_image_url.clone(),
            follower_count: self.follower_count,
            oauth_version: self.oauth_version,
            connection_status: self.connection_status,
            token_expires_at: self.token_expires_at,
            last_error: self.last_error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    pub fn health(&self) -> TokenHealth {
        TokenHealth {
            account_id: self.id.clone(),
            platform_id: self.platform_id,
            connection_status: self.connection_status,
            token_expires_at: self.token_expires_at,
            error_count: self.error_count,
            token_refresh_attempts: self.token_refresh_attempts,
            last_token_refresh: self.last_token_refresh,
            last_error: self.last_error.clone(),
        }
    }
}

impl std::fmt::Debug for SocialAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocialAccount")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("platform_id", &self.platform_id)
            .field("provider_account_id", &self.provider_account_id)
            .field("account_username", &self.account_username)
            .field("connection_status", &self.connection_status)
            .field("token_expires_at", &self.token_expires_at)
            .field("has_access_token", &self.encrypted_access_token.is_some())
            .field("has_refresh_token", &self.encrypted_refresh_token.is_some())
            .field("error_count", &self.error_count)
            .field("token_refresh_attempts", &self.token_refresh_attempts)
            .finish_non_exhaustive()
    }
}

/// Public view of an account: no ciphertext, no IVs.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SocialAccountSummary {
    pub id: String,
    pub user_id: i64,
    pub platform_id: i64,
    pub provider_account_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub follower_count: Option<i64>,
    pub oauth_version: OAuthVersion,
    pub connection_status: ConnectionStatus,
    pub token_expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Token health for dashboards and alerts.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TokenHealth {
    pub account_id: String,
    pub platform_id: i64,
    pub connection_status: ConnectionStatus,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub error_count: i64,
    pub token_refresh_attempts: i64,
    pub last_token_refresh: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}
