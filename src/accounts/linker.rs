//! Links provider accounts to application users.

use super::{AccountStore, AccountUpsert, OAuthVersion, ProfileFetcher, ProviderProfile, SocialAccount};
use crate::credentials::TokenCipher;
use crate::error::{ConnectError, Result};
use crate::oauth::{ProviderRegistry, TokenSet};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info};

/// Creates and relinks `SocialAccount` rows from freshly exchanged tokens.
#[derive(Clone)]
pub struct AccountLinker {
    store: Arc<AccountStore>,
    cipher: Arc<TokenCipher>,
    profiles: Arc<dyn ProfileFetcher>,
    providers: Arc<ProviderRegistry>,
}

impl AccountLinker {
    pub fn new(
        store: Arc<AccountStore>,
        cipher: Arc<TokenCipher>,
        profiles: Arc<dyn ProfileFetcher>,
        providers: Arc<ProviderRegistry>,
    ) -> Self {
        Self {
            store,
            cipher,
            profiles,
            providers,
        }
    }

    /// Fetches the provider profile with the new access token, then upserts
    /// the account keyed by (user, platform, provider account id).
    pub async fn link_or_update(
        &self,
        user_id: i64,
        platform_id: i64,
        tokens: &TokenSet,
    ) -> Result<SocialAccount> {
        let profile = self.fetch_profile(platform_id, tokens).await?;
        self.upsert_with_profile(user_id, platform_id, &profile, tokens)
    }

    /// Resolves who the new access token belongs to on the provider side.
    pub async fn fetch_profile(&self, platform_id: i64, tokens: &TokenSet) -> Result<ProviderProfile> {
        let provider = self.providers.get(platform_id)?;

        let profile = self
            .profiles
            .fetch_profile(provider, &tokens.access_token)
            .await?;

        debug!(
            platform_id,
            provider_account_id = %profile.provider_account_id,
            "Fetched provider profile"
        );

        Ok(profile)
    }

    /// Encrypts `tokens` and upserts the account for an already-known profile.
    ///
    /// First link and relink both end `connected` with counters reset.
    pub fn upsert_with_profile(
        &self,
        user_id: i64,
        platform_id: i64,
        profile: &ProviderProfile,
        tokens: &TokenSet,
    ) -> Result<SocialAccount> {
        let access_token = self.cipher.encrypt(&tokens.access_token)?;
        let refresh_token = tokens
            .refresh_token
            .as_deref()
            .map(|t| self.cipher.encrypt(t))
            .transpose()?;
        let token_expires_at = tokens
            .expires_in_seconds
            .map(|seconds| Utc::now() + Duration::seconds(seconds));

        let account = self.store.upsert(&AccountUpsert {
            user_id,
            platform_id,
            profile,
            oauth_version: OAuthVersion::V2,
            access_token: &access_token,
            refresh_token: refresh_token.as_ref(),
            token_expires_at,
        })?;

        info!(
            account_id = %account.id,
            user_id,
            platform_id,
            has_refresh_token = refresh_token.is_some(),
            "Social account linked"
        );

        Ok(account)
    }

    /// Marks the account `disconnected` and clears its ciphertext.
    ///
    /// Disconnecting an already-disconnected account succeeds trivially.
    pub fn disconnect(&self, account_id: &str) -> Result<()> {
        if !self.store.disconnect(account_id)? {
            return Err(ConnectError::AccountNotFound(account_id.to_string()));
        }
        info!(account_id = %account_id, "Social account disconnected");
        Ok(())
    }
}
