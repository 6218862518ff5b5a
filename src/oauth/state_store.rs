//! OAuth state storage for CSRF protection and PKCE verifier custody.
//!
//! A `state` value maps to the pending authorization context for exactly one
//! in-flight connect attempt. Entries are single-use and expire after a TTL.

use crate::error::{ConnectError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, error};

/// Pending authorization context (lives only in the state store).
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingAuthorization {
    pub state: String,
    pub user_id: i64,
    pub platform_id: i64,
    /// PKCE secret. Never sent to the browser.
    pub code_verifier: String,
    pub callback_url: String,
    pub requested_scopes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub ttl_seconds: i64,
}

impl PendingAuthorization {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_at + Duration::seconds(self.ttl_seconds)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}

impl std::fmt::Debug for PendingAuthorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingAuthorization")
            .field("user_id", &self.user_id)
            .field("platform_id", &self.platform_id)
            .field("callback_url", &self.callback_url)
            .field("requested_scopes", &self.requested_scopes)
            .field("created_at", &self.created_at)
            .field("ttl_seconds", &self.ttl_seconds)
            .finish_non_exhaustive()
    }
}

/// Short-lived, single-use storage for pending authorizations.
///
/// Implementations must make `take_and_delete` atomic: two concurrent callers
/// with the same state get exactly one `Some`.
#[async_trait]
pub trait OAuthStateStore: Send + Sync {
    /// Stores `pending` under `state`. Fails with `Conflict` if the key exists.
    async fn put(&self, state: &str, pending: &PendingAuthorization, ttl: std::time::Duration)
        -> Result<()>;

    /// Atomically reads and removes the entry. Expired entries are never returned.
    async fn take_and_delete(&self, state: &str) -> Result<Option<PendingAuthorization>>;

    /// Drops expired entries. Stores with native TTL return 0.
    async fn purge_expired(&self) -> Result<usize> {
        Ok(0)
    }
}

struct StateEntry {
    pending: PendingAuthorization,
    expires_at: DateTime<Utc>,
}

/// Process-local state store.
///
/// Only suitable when initiate and callback are served by the same instance.
#[derive(Clone, Default)]
pub struct InMemoryStateStore {
    states: Arc<Mutex<HashMap<String, StateEntry>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count of stored states, expired or not (for debugging/monitoring)
    pub fn count(&self) -> usize {
        self.states.lock().unwrap().len()
    }
}

#[async_trait]
impl OAuthStateStore for InMemoryStateStore {
    async fn put(
        &self,
        state: &str,
        pending: &PendingAuthorization,
        ttl: std::time::Duration,
    ) -> Result<()> {
        let ttl = Duration::from_std(ttl)
            .map_err(|e| ConnectError::InvalidConfiguration(format!("state ttl: {}", e)))?;
        let now = Utc::now();

        let mut states = self.states.lock().unwrap();
        if let Some(existing) = states.get(state) {
            if existing.expires_at > now {
                error!("OAuth state collision detected; refusing to overwrite pending authorization");
                return Err(ConnectError::Conflict(
                    "OAuth state already exists".to_string(),
                ));
            }
        }

        states.insert(
            state.to_string(),
            StateEntry {
                pending: pending.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn take_and_delete(&self, state: &str) -> Result<Option<PendingAuthorization>> {
        let mut states = self.states.lock().unwrap();

        // Remove first (single-use), then check expiry
        let Some(entry) = states.remove(state) else {
            return Ok(None);
        };

        if Utc::now() >= entry.expires_at {
            debug!("OAuth state expired before use");
            return Ok(None);
        }

        Ok(Some(entry.pending))
    }

    async fn purge_expired(&self) -> Result<usize> {
        let mut states = self.states.lock().unwrap();
        let now = Utc::now();
        let before = states.len();
        states.retain(|_, entry| entry.expires_at > now);
        Ok(before - states.len())
    }
}

/// Periodically purges expired states until `shutdown` flips to `true`.
///
/// Spawned and owned by the process entry point.
pub async fn run_state_cleanup(
    store: Arc<dyn OAuthStateStore>,
    interval_seconds: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval =
        tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds.max(1)));

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match store.purge_expired().await {
                    Ok(removed) => debug!(removed, "OAuth state cleanup complete"),
                    Err(e) => error!(error = %e, "OAuth state cleanup failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("OAuth state cleanup stopping");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn pending(state: &str) -> PendingAuthorization {
        PendingAuthorization {
            state: state.to_string(),
            user_id: 1,
            platform_id: 2,
            code_verifier: "v".repeat(64),
            callback_url: "https://app/x/callback".to_string(),
            requested_scopes: vec!["read".to_string()],
            created_at: Utc::now(),
            ttl_seconds: 600,
        }
    }

    #[tokio::test]
    async fn test_put_and_take() {
        let store = InMemoryStateStore::new();
        let p = pending("s1");

        store.put("s1", &p, StdDuration::from_secs(600)).await.unwrap();

        let taken = store.take_and_delete("s1").await.unwrap();
        assert_eq!(taken, Some(p));
    }

    #[tokio::test]
    async fn test_state_is_single_use() {
        let store = InMemoryStateStore::new();
        store
            .put("s1", &pending("s1"), StdDuration::from_secs(600))
            .await
            .unwrap();

        assert!(store.take_and_delete("s1").await.unwrap().is_some());
        assert!(store.take_and_delete("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_state() {
        let store = InMemoryStateStore::new();
        assert!(store.take_and_delete("invalid_state").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_put_conflicts() {
        let store = InMemoryStateStore::new();
        store
            .put("dup", &pending("dup"), StdDuration::from_secs(600))
            .await
            .unwrap();

        let err = store
            .put("dup", &pending("dup"), StdDuration::from_secs(600))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_expired_state_rejected() {
        let store = InMemoryStateStore::new();
        store
            .put("old", &pending("old"), StdDuration::from_millis(50))
            .await
            .unwrap();

        tokio::time::sleep(StdDuration::from_millis(120)).await;

        assert!(store.take_and_delete("old").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_removes_expired() {
        let store = InMemoryStateStore::new();
        store
            .put("a", &pending("a"), StdDuration::from_millis(50))
            .await
            .unwrap();
        store
            .put("b", &pending("b"), StdDuration::from_millis(50))
            .await
            .unwrap();
        store
            .put("c", &pending("c"), StdDuration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(store.count(), 3);

        tokio::time::sleep(StdDuration::from_millis(120)).await;

        assert_eq!(store.purge_expired().await.unwrap(), 2);
        assert_eq!(store.count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_take_single_winner() {
        let store = Arc::new(InMemoryStateStore::new());
        store
            .put("race", &pending("race"), StdDuration::from_secs(600))
            .await
            .unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.take_and_delete("race").await.unwrap() })
            })
            .collect();

        let mut winners = 0;
        for h in handles {
            if h.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_cleanup_task_stops_on_shutdown() {
        let store: Arc<dyn OAuthStateStore> = Arc::new(InMemoryStateStore::new());
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(run_state_cleanup(store, 1, rx));
        tx.send(true).unwrap();

        tokio::time::timeout(StdDuration::from_secs(2), handle)
            .await
            .expect("cleanup task did not stop")
            .unwrap();
    }

    #[test]
    fn test_debug_hides_verifier() {
        let p = pending("s");
        assert!(!format!("{:?}", p).contains(&p.code_verifier));
    }
}
