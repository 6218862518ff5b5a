//! Error taxonomy for the connection and token lifecycle.
//!
//! Protocol errors (`InvalidState`, `ProviderRejected`) are surfaced to callers
//! as-is. `ProviderUnavailable` is the only retryable kind. Encryption-layer
//! failures are always surfaced and never mapped to a silent reconnect.

use thiserror::Error;

/// Errors produced by the OAuth connection core.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Callback state missing, expired, or already consumed.
    #[error("OAuth state is invalid, expired, or already used")]
    InvalidState,

    /// Provider returned a definitive 4xx (bad code, revoked token, consent denied).
    #[error("provider rejected the request ({status}): {message}")]
    ProviderRejected { status: u16, message: String },

    /// Network failure, timeout, or provider 5xx.
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Stored ciphertext could not be decrypted (wrong key, truncated, tampered).
    #[error("token decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("token encryption failed: {0}")]
    EncryptionFailed(String),

    /// A state key was stored twice.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("unknown platform {0}")]
    UnknownPlatform(i64),

    #[error("social account '{0}' not found")]
    AccountNotFound(String),

    /// Account is disconnected or exhausted its refresh attempts.
    #[error("account '{account_id}' must be reconnected: {reason}")]
    ReauthRequired { account_id: String, reason: String },

    /// The OS random source failed.
    #[error("random source failure: {0}")]
    Entropy(String),

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl ConnectError {
    /// Only transient provider failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConnectError::ProviderUnavailable(_))
    }
}

pub type Result<T, E = ConnectError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unavailable_is_retryable() {
        assert!(ConnectError::ProviderUnavailable("timeout".to_string()).is_retryable());
        assert!(!ConnectError::InvalidState.is_retryable());
        assert!(!ConnectError::ProviderRejected {
            status: 400,
            message: "invalid_grant".to_string()
        }
        .is_retryable());
        assert!(!ConnectError::DecryptionFailed("tag".to_string()).is_retryable());
    }

    #[test]
    fn test_storage_error_keeps_context() {
        let err: ConnectError = anyhow::anyhow!("disk full")
            .context("Failed to store account")
            .into();
        let msg = err.to_string();
        assert!(msg.contains("Failed to store account"));
        assert!(msg.contains("disk full"));
    }
}
