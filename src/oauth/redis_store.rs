//! Redis-backed OAuth state store.
//!
//! Shared by every server instance, so initiate and callback may land on
//! different processes. `SET NX EX` rejects duplicate keys and lets Redis
//! expire abandoned flows; `GETDEL` makes consumption atomic on the server.

use super::state_store::{OAuthStateStore, PendingAuthorization};
use crate::error::{ConnectError, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Client;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error};

const KEY_PREFIX: &str = "oauth_state:";

/// State store on a shared Redis instance.
#[derive(Clone)]
pub struct RedisStateStore {
    conn: ConnectionManager,
    io_timeout: Duration,
}

impl RedisStateStore {
    /// Connects to Redis at `redis_url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(redis_url: &str, io_timeout: Duration) -> Result<Self> {
        let client = Client::open(redis_url).map_err(|e| {
            ConnectError::InvalidConfiguration(format!("invalid Redis URL: {}", e))
        })?;

        let conn = with_timeout(io_timeout, ConnectionManager::new(client)).await?;

        Ok(Self { conn, io_timeout })
    }

    fn key(state: &str) -> String {
        format!("{}{}", KEY_PREFIX, state)
    }
}

/// Bounds a Redis call; timeouts and transport errors become `ProviderUnavailable`.
async fn with_timeout<T, F>(io_timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = redis::RedisResult<T>>,
{
    match tokio::time::timeout(io_timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(ConnectError::ProviderUnavailable(format!(
            "state store error: {}",
            e
        ))),
        Err(_) => Err(ConnectError::ProviderUnavailable(
            "state store timed out".to_string(),
        )),
    }
}

#[async_trait]
impl OAuthStateStore for RedisStateStore {
    async fn put(&self, state: &str, pending: &PendingAuthorization, ttl: Duration) -> Result<()> {
        let value = serde_json::to_string(pending).map_err(|e| {
            ConnectError::Storage(anyhow::anyhow!("failed to serialize pending authorization: {}", e))
        })?;
        let mut conn = self.conn.clone();
        let ttl_secs = ttl.as_secs().max(1);

        let mut cmd = redis::cmd("SET");
        cmd.arg(Self::key(state))
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs);

        let reply: Option<String> = with_timeout(self.io_timeout, cmd.query_async(&mut conn)).await?;

        match reply {
            Some(_) => Ok(()),
            None => {
                error!("OAuth state collision detected in Redis; refusing to overwrite");
                Err(ConnectError::Conflict(
                    "OAuth state already exists".to_string(),
                ))
            }
        }
    }

    async fn take_and_delete(&self, state: &str) -> Result<Option<PendingAuthorization>> {
        let mut conn = self.conn.clone();

        let mut cmd = redis::cmd("GETDEL");
        cmd.arg(Self::key(state));

        let raw: Option<String> = with_timeout(self.io_timeout, cmd.query_async(&mut conn)).await?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        let pending: PendingAuthorization = serde_json::from_str(&raw).map_err(|e| {
            ConnectError::Storage(anyhow::anyhow!("corrupt pending authorization: {}", e))
        })?;

        // Redis TTL has second granularity; enforce the exact window too.
        if pending.is_expired(chrono::Utc::now()) {
            debug!("OAuth state expired before use");
            return Ok(None);
        }

        Ok(Some(pending))
    }
}
