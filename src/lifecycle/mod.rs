//! Connection and token lifecycle orchestration.
//!
//! ```text
//! IDLE --initiate()--> PENDING --callback(code,state)--> LINKED
//! PENDING --ttl expiry / unknown state--> FAILED
//! LINKED --near/past expiry & get_valid_access_token()--> REFRESHING --ok--> LINKED
//! REFRESHING --ProviderRejected--> EXPIRED (error after max failures)
//! LINKED/EXPIRED --disconnect()--> DISCONNECTED
//! ```
//!
//! Refreshes are serialized per account. Concurrent callers for the same
//! account queue on one `tokio::sync::Mutex`; whoever gets it after a
//! successful refresh re-reads the row and finds a fresh token, so a burst of
//! callers produces exactly one refresh-token exchange.

use crate::accounts::{
    AccountLinker, AccountStore, ConnectionStatus, ProfileFetcher, SocialAccount,
    SocialAccountSummary, TokenHealth,
};
use crate::credentials::{SealedToken, TokenCipher};
use crate::error::{ConnectError, Result};
use crate::oauth::{
    build_authorization_url, pkce, OAuthStateStore, PendingAuthorization, ProviderRegistry,
    TokenExchangeClient,
};
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};


/// Tunables for the lifecycle manager.
#[derive(Clone, Debug)]
pub struct LifecycleSettings {
    /// How long a pending authorization stays valid.
    pub state_ttl: Duration,
    /// Refresh when the token expires within this window.
    pub refresh_margin: chrono::Duration,
    /// Consecutive refresh failures before the account is marked `error`.
    pub max_refresh_failures: i64,
    /// Used to derive a redirect URI when the caller does not pass one.
    pub callback_base_url: String,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            state_ttl: Duration::from_secs(600),
            refresh_margin: chrono::Duration::seconds(60),
            max_refresh_failures: 3,
            callback_base_url: "http://localhost:3000".to_string(),
        }
    }
}

/// Result of `initiate`: where to send the browser, and the state to expect back.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InitiatedConnection {
    pub auth_url: String,
    pub state: String,
}

/// Orchestrates connect, refresh, and disconnect for linked accounts.
pub struct TokenLifecycleManager {
    providers: Arc<ProviderRegistry>,
    state_store: Arc<dyn OAuthStateStore>,
    exchange: Arc<dyn TokenExchangeClient>,
    linker: AccountLinker,
    accounts: Arc<AccountStore>,
    cipher: Arc<TokenCipher>,
    refresh_locks: DashMap<String, Arc<Mutex<()>>>,
    settings: LifecycleSettings,
}

impl TokenLifecycleManager {
    pub fn new(
        providers: Arc<ProviderRegistry>,
        state_store: Arc<dyn OAuthStateStore>,
        exchange: Arc<dyn TokenExchangeClient>,
        profiles: Arc<dyn ProfileFetcher>,
        accounts: Arc<AccountStore>,
        cipher: Arc<TokenCipher>,
        settings: LifecycleSettings,
    ) -> Self {
        let linker = AccountLinker::new(
            Arc::clone(&accounts),
            Arc::clone(&cipher),
            profiles,
            Arc::clone(&providers),
        );
        Self {
            providers,
            state_store,
            exchange,
            linker,
            accounts,
            cipher,
            refresh_locks: DashMap::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Redirect URI used when the caller does not supply one.
    pub fn default_callback_url(&self, platform_id: i64) -> String {
        format!(
            "{}/api/connect/{}/callback",
            self.settings.callback_base_url.trim_end_matches('/'),
            platform_id
        )
    }

    /// Starts a connection: PKCE pair, fresh state, pending authorization
    /// stored with TTL, and the provider authorization URL.
    ///
    /// Empty `scopes` means the provider's default scopes.
    pub async fn initiate(
        &self,
        user_id: i64,
        platform_id: i64,
        callback_url: Option<&str>,
        scopes: &[String],
    ) -> Result<InitiatedConnection> {
        let provider = self.providers.get(platform_id)?;

        let pkce = pkce::generate_pair()?;
        let state = pkce::generate_state()?;

        let callback_url = match callback_url {
            Some(url) if !url.trim().is_empty() => url.to_string(),
            _ => self.default_callback_url(platform_id),
        };
        let scopes = provider.effective_scopes(scopes);

        // Build first so a misconfigured provider leaves no orphan state.
        let auth_url = build_authorization_url(
            &provider.authorize_url,
            &provider.client_id,
            &callback_url,
            &scopes,
            &state,
            &pkce.challenge,
        )?;

        let pending = PendingAuthorization {
            state: state.clone(),
            user_id,
            platform_id,
            code_verifier: pkce.verifier,
            callback_url,
            requested_scopes: scopes,
            created_at: Utc::now(),
            ttl_seconds: self.settings.state_ttl.as_secs() as i64,
        };

        self.state_store
            .put(&state, &pending, self.settings.state_ttl)
            .await?;

        info!(user_id, platform_id, "OAuth connection initiated");

        Ok(InitiatedConnection { auth_url, state })
    }

    /// Completes a connection from the provider callback.
    ///
    /// The state is consumed before anything else; an unknown, expired, or
    /// replayed state fails with `InvalidState`. The authorization code is
    /// exchanged exactly once.
    pub async fn complete_callback(&self, code: &str, state: &str) -> Result<SocialAccount> {
        self.complete(None, code, state).await
    }

    /// Like `complete_callback`, for a callback that arrived on
    /// `platform_id`'s redirect URI. A state issued for another platform is
    /// consumed and rejected as `InvalidState` before any code exchange.
    pub async fn complete_platform_callback(
        &self,
        platform_id: i64,
        code: &str,
        state: &str,
    ) -> Result<SocialAccount> {
        self.complete(Some(platform_id), code, state).await
    }

    async fn complete(
        &self,
        expected_platform: Option<i64>,
        code: &str,
        state: &str,
    ) -> Result<SocialAccount> {
        let pending = self
            .state_store
            .take_and_delete(state)
            .await?
            .ok_or_else(|| {
                warn!("OAuth callback with invalid or expired state (possible CSRF)");
                ConnectError::InvalidState
            })?;

        if let Some(platform_id) = expected_platform {
            if platform_id != pending.platform_id {
                warn!(
                    user_id = pending.user_id,
                    callback_platform_id = platform_id,
                    state_platform_id = pending.platform_id,
                    "OAuth callback arrived for a different platform than it was started for"
                );
                return Err(ConnectError::InvalidState);
            }
        }

        let provider = self.providers.get(pending.platform_id)?;

        debug!(
            user_id = pending.user_id,
            platform_id = pending.platform_id,
            "OAuth state validated"
        );

        let tokens = self
            .exchange
            .exchange_code(provider, code, &pending.code_verifier, &pending.callback_url)
            .await
            .map_err(|e| {
                error!(
                    user_id = pending.user_id,
                    platform_id = pending.platform_id,
                    error = %e,
                    "Authorization code exchange failed"
                );
                e
            })?;

        let profile = self
            .linker
            .fetch_profile(pending.platform_id, &tokens)
            .await?;

        // A relink overwrites the grant; hold off any refresh of the same row.
        let existing = self.accounts.find_by_provider_account(
            pending.user_id,
            pending.platform_id,
            &profile.provider_account_id,
        )?;
        let lock = existing.map(|account| self.refresh_lock(&account.id));
        let _guard = match &lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        let account = self.linker.upsert_with_profile(
            pending.user_id,
            pending.platform_id,
            &profile,
            &tokens,
        )?;

        info!(
            account_id = %account.id,
            user_id = account.user_id,
            platform_id = account.platform_id,
            "OAuth flow completed successfully"
        );

        Ok(account)
    }

    /// Handles a callback carrying `error=` (e.g. consent denied): consumes the
    /// state so it cannot be replayed and reports the provider's refusal.
    pub async fn reject_callback(
        &self,
        state: &str,
        error: &str,
        description: Option<&str>,
    ) -> ConnectError {
        match self.state_store.take_and_delete(state).await {
            Ok(Some(pending)) => warn!(
                user_id = pending.user_id,
                platform_id = pending.platform_id,
                error = %error,
                "OAuth authorization refused by provider"
            ),
            Ok(None) => return ConnectError::InvalidState,
            Err(e) => return e,
        }

        ConnectError::ProviderRejected {
            status: 400,
            message: match description {
                Some(desc) => format!("{}: {}", error, desc),
                None => error.to_string(),
            },
        }
    }

    /// `initiateConnection` for collaborators.
    pub async fn initiate_connection(
        &self,
        user_id: i64,
        platform_id: i64,
        callback_url: Option<&str>,
        scopes: &[String],
    ) -> Result<InitiatedConnection> {
        self.initiate(user_id, platform_id, callback_url, scopes).await
    }

    /// `completeConnection` for collaborators.
    pub async fn complete_connection(&self, code: &str, state: &str) -> Result<SocialAccountSummary> {
        self.complete_callback(code, state)
            .await
            .map(|account| account.summary())
    }

    /// Returns a plaintext access token that is valid for at least the refresh
    /// margin, refreshing first if needed.
    ///
    /// Accounts in `error` or `disconnected` fail fast with `ReauthRequired`
    /// without contacting the provider.
    pub async fn get_valid_access_token(&self, account_id: &str) -> Result<String> {
        let account = self.load(account_id)?;
        ensure_usable(&account)?;

        if self.is_fresh(&account) {
            return self.open_access_token(&account);
        }

        let lock = self.refresh_lock(account_id);
        let _guard = lock.lock().await;

        // Another caller may have refreshed while we waited.
        let account = self.load(account_id)?;
        ensure_usable(&account)?;
        if self.is_fresh(&account) {
            debug!(account_id = %account_id, "Token refreshed by concurrent caller");
            return self.open_access_token(&account);
        }

        self.refresh_locked(&account).await
    }

    /// Forces a refresh regardless of expiry.
    pub async fn refresh(&self, account_id: &str) -> Result<String> {
        let lock = self.refresh_lock(account_id);
        let _guard = lock.lock().await;

        let account = self.load(account_id)?;
        ensure_usable(&account)?;
        self.refresh_locked(&account).await
    }

    /// Soft-disconnects the account and clears its ciphertext. Idempotent.
    pub async fn disconnect_account(&self, account_id: &str) -> Result<()> {
        let lock = self.refresh_lock(account_id);
        let guard = lock.lock().await;
        let result = self.linker.disconnect(account_id);
        drop(guard);
        drop(lock);

        // Only drop the entry when no other caller holds or awaits this lock.
        self.refresh_locks
            .remove_if(account_id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    /// A user's accounts that are not disconnected, including ones that need
    /// reconnecting (`expired`, `error`).
    pub fn list_connected_accounts(
        &self,
        user_id: i64,
        platform_id: Option<i64>,
    ) -> Result<Vec<SocialAccountSummary>> {
        Ok(self
            .accounts
            .list_by_user(user_id, platform_id)?
            .iter()
            .filter(|a| a.connection_status != ConnectionStatus::Disconnected)
            .map(SocialAccount::summary)
            .collect())
    }

    pub fn get_account(&self, account_id: &str) -> Result<SocialAccountSummary> {
        Ok(self.load(account_id)?.summary())
    }

    pub fn token_health(&self, account_id: &str) -> Result<TokenHealth> {
        Ok(self.load(account_id)?.health())
    }

    pub fn list_token_health(&self) -> Result<Vec<TokenHealth>> {
        Ok(self
            .accounts
            .list_all()?
            .iter()
            .map(SocialAccount::health)
            .collect())
    }

    fn load(&self, account_id: &str) -> Result<SocialAccount> {
        self.accounts
            .get(account_id)?
            .ok_or_else(|| ConnectError::AccountNotFound(account_id.to_string()))
    }

    fn is_fresh(&self, account: &SocialAccount) -> bool {
        account.connection_status == ConnectionStatus::Connected
            && !account.needs_refresh(Utc::now(), self.settings.refresh_margin)
    }

    fn refresh_lock(&self, account_id: &str) -> Arc<Mutex<()>> {
        let entry = self
            .refresh_locks
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())));
        Arc::clone(entry.value())
    }

    fn open_access_token(&self, account: &SocialAccount) -> Result<String> {
        let sealed = account.sealed_access_token().ok_or_else(|| {
            ConnectError::DecryptionFailed("access token ciphertext is missing".to_string())
        });
        self.open_sealed(account, sealed)
    }

    /// Decrypts, forcing the account into `error` on failure.
    fn open_sealed(&self, account: &SocialAccount, sealed: Result<SealedToken>) -> Result<String> {
        match sealed.and_then(|s| self.cipher.open(&s)) {
            Ok(token) => Ok(token),
            Err(e) => {
                error!(
                    account_id = %account.id,
                    error = %e,
                    "Stored token could not be decrypted; account marked error"
                );
                if let Err(mark_err) = self.accounts.mark_status(
                    &account.id,
                    ConnectionStatus::Error,
                    Some(&e.to_string()),
                ) {
                    error!(account_id = %account.id, error = %mark_err, "Failed to mark account error");
                }
                Err(e)
            }
        }
    }

    /// Refresh path. Caller holds the account's refresh lock.
    async fn refresh_locked(&self, account: &SocialAccount) -> Result<String> {
        let provider = self.providers.get(account.platform_id)?;

        let Some(sealed_refresh) = account.sealed_refresh_token() else {
            let reason = "access token expired and no refresh token is stored";
            warn!(account_id = %account.id, "{}", reason);
            self.accounts
                .mark_status(&account.id, ConnectionStatus::Expired, Some(reason))?;
            return Err(ConnectError::ReauthRequired {
                account_id: account.id.clone(),
                reason: reason.to_string(),
            });
        };

        let refresh_token = self.open_sealed(account, Ok(sealed_refresh))?;

        debug!(account_id = %account.id, "Refreshing access token");

        match self
            .exchange
            .exchange_refresh_token(provider, &refresh_token)
            .await
        {
            Ok(tokens) => {
                let now = Utc::now();
                let access = self.cipher.encrypt(&tokens.access_token)?;
                // Keep whatever the provider returned; fall back to the old token.
                let kept_refresh = tokens.refresh_token.as_deref().unwrap_or(&refresh_token);
                let refresh = self.cipher.encrypt(kept_refresh)?;
                let expires_at = tokens
                    .expires_in_seconds
                    .map(|seconds| now + chrono::Duration::seconds(seconds));

                let written = self.accounts.update_tokens(
                    &account.id,
                    &access,
                    Some(&refresh),
                    expires_at,
                    now,
                    account.token_encryption_iv.as_deref(),
                )?;

                if !written {
                    warn!(
                        account_id = %account.id,
                        "Account was relinked during refresh; discarding refreshed tokens"
                    );
                    let current = self.load(&account.id)?;
                    ensure_usable(&current)?;
                    return self.open_access_token(&current);
                }

                info!(
                    account_id = %account.id,
                    rotated_refresh_token = tokens.refresh_token.is_some(),
                    "Access token refreshed"
                );

                Ok(tokens.access_token)
            }
            Err(e) => {
                let attempts = account.token_refresh_attempts + 1;
                let status = if attempts >= self.settings.max_refresh_failures {
                    ConnectionStatus::Error
                } else if matches!(e, ConnectError::ProviderRejected { .. }) {
                    ConnectionStatus::Expired
                } else {
                    account.connection_status
                };

                self.accounts
                    .record_refresh_failure(&account.id, &e.to_string(), status)?;

                if status == ConnectionStatus::Error {
                    error!(
                        account_id = %account.id,
                        attempts,
                        error = %e,
                        "Token refresh failed repeatedly; account requires reconnection"
                    );
                } else {
                    warn!(
                        account_id = %account.id,
                        attempts,
                        status = %status,
                        error = %e,
                        "Token refresh failed"
                    );
                }

                Err(e)
            }
        }
    }
}

/// Rejects accounts that cannot produce a token without user re-authorization.
fn ensure_usable(account: &SocialAccount) -> Result<()> {
    let reason = match account.connection_status {
        ConnectionStatus::Connected | ConnectionStatus::Expired => return Ok(()),
        ConnectionStatus::Disconnected => "account is disconnected".to_string(),
        ConnectionStatus::Pending => "connection was never completed".to_string(),
        ConnectionStatus::Error => account
            .last_error
            .clone()
            .unwrap_or_else(|| "account is in error state".to_string()),
    };
    Err(ConnectError::ReauthRequired {
        account_id: account.id.clone(),
        reason,
    })
}
