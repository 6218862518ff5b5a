//! Social account persistence using SQLite.
//!
//! Tokens arrive here already encrypted; this layer only ever sees ciphertext
//! and IVs.

use super::{ConnectionStatus, OAuthVersion, ProviderProfile, SocialAccount};
use crate::credentials::SealedToken;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;

/// Everything needed to create or relink an account.
pub struct AccountUpsert<'a> {
    pub user_id: i64,
    pub platform_id: i64,
    pub profile: &'a ProviderProfile,
    pub oauth_version: OAuthVersion,
    pub access_token: &'a SealedToken,
    pub refresh_token: Option<&'a SealedToken>,
    pub token_expires_at: Option<DateTime<Utc>>,
}

const ACCOUNT_COLUMNS: &str = "id, user_id, platform_id, provider_account_id, account_username, \
     profile_image_url, follower_count, oauth_version, encrypted_access_token, \
     encrypted_refresh_token, token_encryption_iv, refresh_token_iv, token_expires_at, \
     connection_status, last_error, error_count, token_refresh_attempts, last_token_refresh, \
     created_at, updated_at";

/// SQLite-backed `social_accounts` table.
///
/// # Schema
/// ```sql
/// CREATE TABLE social_accounts (
///     id TEXT PRIMARY KEY,
///     user_id INTEGER NOT NULL,
///     platform_id INTEGER NOT NULL,
///     provider_account_id TEXT NOT NULL,
///     ...
///     encrypted_access_token TEXT,   -- ciphertext (base64)
///     encrypted_refresh_token TEXT,  -- ciphertext (base64)
///     token_encryption_iv TEXT,      -- nonce for access token
///     refresh_token_iv TEXT,         -- nonce for refresh token
///     token_expires_at TEXT,         -- RFC 3339
///     connection_status TEXT NOT NULL,
///     ...
///     UNIQUE(user_id, platform_id, provider_account_id)
/// );
/// ```
///
/// # Thread Safety
/// The connection is wrapped in a Mutex; every method holds it only for the
/// duration of its statements.
pub struct AccountStore {
    conn: Mutex<Connection>,
}

impl AccountStore {
    /// Creates or opens the account store at `db_path` (`":memory:"` for tests).
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open accounts database")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS social_accounts (
                id TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                platform_id INTEGER NOT NULL,
                provider_account_id TEXT NOT NULL,
                account_username TEXT,
                profile_image_url TEXT,
                follower_count INTEGER,
                oauth_version TEXT NOT NULL,
                encrypted_access_token TEXT,
                encrypted_refresh_token TEXT,
                token_encryption_iv TEXT,
                refresh_token_iv TEXT,
                token_expires_at TEXT,
                connection_status TEXT NOT NULL,
                last_error TEXT,
                error_count INTEGER NOT NULL DEFAULT 0,
                token_refresh_attempts INTEGER NOT NULL DEFAULT 0,
                last_token_refresh TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(user_id, platform_id, provider_account_id)
            );
            CREATE INDEX IF NOT EXISTS idx_social_accounts_user
                ON social_accounts(user_id, platform_id);
            "#,
        )
        .context("Failed to create social_accounts table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Inserts or relinks the account keyed by (user, platform, provider account).
    ///
    /// A relink keeps the row id, overwrites tokens and profile metadata, and
    /// resets status to `connected` with cleared error counters.
    pub fn upsert(&self, record: &AccountUpsert<'_>) -> Result<SocialAccount> {
        let now = Utc::now().to_rfc3339();
        let new_id = uuid::Uuid::new_v4().to_string();
        let (refresh_ciphertext, refresh_iv) = match record.refresh_token {
            Some(sealed) => (Some(sealed.ciphertext.as_str()), Some(sealed.iv.as_str())),
            None => (None, None),
        };

        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO social_accounts (
                id, user_id, platform_id, provider_account_id,
                account_username, profile_image_url, follower_count, oauth_version,
                encrypted_access_token, encrypted_refresh_token,
                token_encryption_iv, refresh_token_iv, token_expires_at,
                connection_status, last_error, error_count, token_refresh_attempts,
                last_token_refresh, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                    'connected', NULL, 0, 0, NULL, ?14, ?14)
            ON CONFLICT(user_id, platform_id, provider_account_id) DO UPDATE SET
                account_username = excluded.account_username,
                profile_image_url = excluded.profile_image_url,
                follower_count = excluded.follower_count,
                oauth_version = excluded.oauth_version,
                encrypted_access_token = excluded.encrypted_access_token,
                encrypted_refresh_token = excluded.encrypted_refresh_token,
                token_encryption_iv = excluded.token_encryption_iv,
                refresh_token_iv = excluded.refresh_token_iv,
                token_expires_at = excluded.token_expires_at,
                connection_status = 'connected',
                last_error = NULL,
                error_count = 0,
                token_refresh_attempts = 0,
                updated_at = excluded.updated_at
            "#,
            params![
                new_id,
                record.user_id,
                record.platform_id,
                record.profile.provider_account_id,
                record.profile.username,
                record.profile.profile_image_url,
                record.profile.follower_count,
                record.oauth_version.as_str(),
                record.access_token.ciphertext,
                refresh_ciphertext,
                record.access_token.iv,
                refresh_iv,
                record.token_expires_at.map(|dt| dt.to_rfc3339()),
                now,
            ],
        )
        .context("Failed to upsert social account")?;

        let sql = format!(
            "SELECT {} FROM social_accounts \
             WHERE user_id = ?1 AND platform_id = ?2 AND provider_account_id = ?3",
            ACCOUNT_COLUMNS
        );
        conn.query_row(
            &sql,
            params![
                record.user_id,
                record.platform_id,
                record.profile.provider_account_id
            ],
            row_to_account,
        )
        .context("Failed to read back upserted account")
    }

    /// Fetches an account by id.
    pub fn get(&self, account_id: &str) -> Result<Option<SocialAccount>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("SELECT {} FROM social_accounts WHERE id = ?1", ACCOUNT_COLUMNS);
        conn.query_row(&sql, params![account_id], row_to_account)
            .optional()
            .context("Failed to load social account")
    }

    /// Fetches the account linked for (user, platform, provider account), if any.
    pub fn find_by_provider_account(
        &self,
        user_id: i64,
        platform_id: i64,
        provider_account_id: &str,
    ) -> Result<Option<SocialAccount>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM social_accounts \
             WHERE user_id = ?1 AND platform_id = ?2 AND provider_account_id = ?3",
            ACCOUNT_COLUMNS
        );
        conn.query_row(&sql, params![user_id, platform_id, provider_account_id], row_to_account)
            .optional()
            .context("Failed to look up social account")
    }

    /// Lists a user's accounts, optionally for one platform.
    pub fn list_by_user(&self, user_id: i64, platform_id: Option<i64>) -> Result<Vec<SocialAccount>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM social_accounts \
             WHERE user_id = ?1 AND (?2 IS NULL OR platform_id = ?2) \
             ORDER BY platform_id, created_at",
            ACCOUNT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql).context("Failed to prepare query")?;
        let accounts = stmt
            .query_map(params![user_id, platform_id], row_to_account)
            .context("Failed to execute query")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read results")?;
        Ok(accounts)
    }

    /// Lists every account (token health dashboards).
    pub fn list_all(&self) -> Result<Vec<SocialAccount>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM social_accounts ORDER BY user_id, platform_id, created_at",
            ACCOUNT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql).context("Failed to prepare query")?;
        let accounts = stmt
            .query_map([], row_to_account)
            .context("Failed to execute query")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read results")?;
        Ok(accounts)
    }

    /// Persists a successful refresh: new ciphertext and expiry, attempts reset.
    ///
    /// `refresh_token` is the token to keep, rotated or not. With
    /// `expected_access_iv` set, the write only applies while the row still
    /// holds the access token sealed under that IV; `Ok(false)` means the row
    /// is gone or was rewritten (e.g. relinked) in the meantime.
    pub fn update_tokens(
        &self,
        account_id: &str,
        access_token: &SealedToken,
        refresh_token: Option<&SealedToken>,
        token_expires_at: Option<DateTime<Utc>>,
        refreshed_at: DateTime<Utc>,
        expected_access_iv: Option<&str>,
    ) -> Result<bool> {
        let (refresh_ciphertext, refresh_iv) = match refresh_token {
            Some(sealed) => (Some(sealed.ciphertext.as_str()), Some(sealed.iv.as_str())),
            None => (None, None),
        };

        let rows = self
            .conn
            .lock()
            .unwrap()
            .execute(
                r#"
                UPDATE social_accounts SET
                    encrypted_access_token = ?2,
                    token_encryption_iv = ?3,
                    encrypted_refresh_token = ?4,
                    refresh_token_iv = ?5,
                    token_expires_at = ?6,
                    connection_status = 'connected',
                    last_error = NULL,
                    token_refresh_attempts = 0,
                    last_token_refresh = ?7,
                    updated_at = ?7
                WHERE id = ?1 AND (?8 IS NULL OR token_encryption_iv = ?8)
                "#,
                params![
                    account_id,
                    access_token.ciphertext,
                    access_token.iv,
                    refresh_ciphertext,
                    refresh_iv,
                    token_expires_at.map(|dt| dt.to_rfc3339()),
                    refreshed_at.to_rfc3339(),
                    expected_access_iv,
                ],
            )
            .context("Failed to update tokens")?;

        Ok(rows > 0)
    }

    /// Records a failed refresh: bumps attempt and error counters, stores the
    /// error, and sets `status`.
    pub fn record_refresh_failure(
        &self,
        account_id: &str,
        error: &str,
        status: ConnectionStatus,
    ) -> Result<bool> {
        let rows = self
            .conn
            .lock()
            .unwrap()
            .execute(
                r#"
                UPDATE social_accounts SET
                    token_refresh_attempts = token_refresh_attempts + 1,
                    error_count = error_count + 1,
                    last_error = ?2,
                    connection_status = ?3,
                    updated_at = ?4
                WHERE id = ?1
                "#,
                params![account_id, error, status.as_str(), Utc::now().to_rfc3339()],
            )
            .context("Failed to record refresh failure")?;

        Ok(rows > 0)
    }

    /// Sets `status` and records an error without touching refresh attempts.
    pub fn mark_status(
        &self,
        account_id: &str,
        status: ConnectionStatus,
        error: Option<&str>,
    ) -> Result<bool> {
        let rows = self
            .conn
            .lock()
            .unwrap()
            .execute(
                r#"
                UPDATE social_accounts SET
                    connection_status = ?2,
                    last_error = COALESCE(?3, last_error),
                    error_count = error_count + CASE WHEN ?3 IS NULL THEN 0 ELSE 1 END,
                    updated_at = ?4
                WHERE id = ?1
                "#,
                params![account_id, status.as_str(), error, Utc::now().to_rfc3339()],
            )
            .context("Failed to update connection status")?;

        Ok(rows > 0)
    }

    /// Soft-invalidates an account and clears every ciphertext/IV column.
    ///
    /// # Returns
    /// * `Ok(true)` - Account exists (whether or not it was already disconnected)
    /// * `Ok(false)` - No such account
    pub fn disconnect(&self, account_id: &str) -> Result<bool> {
        let rows = self
            .conn
            .lock()
            .unwrap()
            .execute(
                r#"
                UPDATE social_accounts SET
                    connection_status = 'disconnected',
                    encrypted_access_token = NULL,
                    encrypted_refresh_token = NULL,
                    token_encryption_iv = NULL,
                    refresh_token_iv = NULL,
                    updated_at = CASE WHEN connection_status = 'disconnected'
                                      THEN updated_at ELSE ?2 END
                WHERE id = ?1
                "#,
                params![account_id, Utc::now().to_rfc3339()],
            )
            .context("Failed to disconnect account")?;

        Ok(rows > 0)
    }
}

fn parse_timestamp(idx: usize, value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        idx,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })
        })
        .transpose()
}

fn required_timestamp(idx: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    parse_timestamp(idx, Some(value)).map(|dt| dt.unwrap_or_else(Utc::now))
}

fn invalid_text(idx: usize, what: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("invalid {}: {}", what, value).into(),
    )
}

fn row_to_account(row: &Row<'_>) -> rusqlite::Result<SocialAccount> {
    let oauth_version: String = row.get(7)?;
    let status: String = row.get(13)?;

    Ok(SocialAccount {
        id: row.get(0)?,
        user_id: row.get(1)?,
        platform_id: row.get(2)?,
        provider_account_id: row.get(3)?,
        account_username: row.get(4)?,
        profile_image_url: row.get(5)?,
        follower_count: row.get(6)?,
        oauth_version: OAuthVersion::parse(&oauth_version)
            .ok_or_else(|| invalid_text(7, "oauth_version", &oauth_version))?,
        encrypted_access_token: row.get(8)?,
        encrypted_refresh_token: row.get(9)?,
        token_encryption_iv: row.get(10)?,
        refresh_token_iv: row.get(11)?,
        token_expires_at: parse_timestamp(12, row.get(12)?)?,
        connection_status: ConnectionStatus::parse(&status)
            .ok_or_else(|| invalid_text(13, "connection_status", &status))?,
        last_error: row.get(14)?,
        error_count: row.get(15)?,
        token_refresh_attempts: row.get(16)?,
        last_token_refresh: parse_timestamp(17, row.get(17)?)?,
        created_at: required_timestamp(18, row.get(18)?)?,
        updated_at: required_timestamp(19, row.get(19)?)?,
    })
}
