//! AES-256-GCM encryption for OAuth tokens at rest.
//!
//! Each token is sealed separately with its own random nonce. The key is 32
//! bytes (256 bits), supplied base64-encoded from the environment and held in
//! memory for the life of the process.

use super::SealedToken;
use crate::error::{ConnectError, Result};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

/// Size of the encryption key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Validates that the key is exactly 32 bytes when base64 decoded.
///
/// # Returns
/// * `Ok(Vec<u8>)` - Decoded key bytes
/// * `Err(InvalidConfiguration)` - Wrong length or not base64
pub fn validate_key(key_base64: &str) -> Result<Vec<u8>> {
    let key_bytes = BASE64.decode(key_base64.trim()).map_err(|e| {
        ConnectError::InvalidConfiguration(format!("encryption key is not valid base64: {}", e))
    })?;

    if key_bytes.len() != KEY_SIZE {
        return Err(ConnectError::InvalidConfiguration(format!(
            "encryption key must be {} bytes (256 bits), got {} bytes",
            KEY_SIZE,
            key_bytes.len()
        )));
    }

    Ok(key_bytes)
}

/// Process-wide token cipher.
///
/// Built once at startup and shared behind an `Arc`. Every `encrypt` call
/// draws a fresh nonce from the OS random source.
#[derive(Clone)]
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl TokenCipher {
    /// Creates a cipher from raw key bytes.
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_SIZE {
            return Err(ConnectError::InvalidConfiguration(format!(
                "encryption key must be {} bytes",
                KEY_SIZE
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| {
            ConnectError::InvalidConfiguration(format!("failed to create cipher: {}", e))
        })?;
        Ok(Self { cipher })
    }

    /// Creates a cipher from a base64-encoded 32-byte key.
    pub fn from_base64_key(key_base64: &str) -> Result<Self> {
        let key = validate_key(key_base64)?;
        Self::new(&key)
    }

    /// Encrypts a token with a random nonce.
    ///
    /// Ciphertext and nonce are both returned base64-encoded for storage.
    pub fn encrypt(&self, plaintext: &str) -> Result<SealedToken> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| ConnectError::EncryptionFailed(e.to_string()))?;

        Ok(SealedToken {
            ciphertext: BASE64.encode(&ciphertext),
            iv: BASE64.encode(nonce),
        })
    }

    /// Decrypts a token sealed by [`TokenCipher::encrypt`].
    ///
    /// Fails with `DecryptionFailed` if the key changed, the data was
    /// truncated, or the authentication tag does not verify.
    pub fn decrypt(&self, ciphertext: &str, iv: &str) -> Result<String> {
        let ciphertext_bytes = BASE64
            .decode(ciphertext)
            .map_err(|e| ConnectError::DecryptionFailed(format!("ciphertext is not base64: {}", e)))?;
        let nonce_bytes = BASE64
            .decode(iv)
            .map_err(|e| ConnectError::DecryptionFailed(format!("iv is not base64: {}", e)))?;

        if nonce_bytes.len() != NONCE_SIZE {
            return Err(ConnectError::DecryptionFailed(format!(
                "invalid iv size: expected {}, got {}",
                NONCE_SIZE,
                nonce_bytes.len()
            )));
        }

        let nonce = Nonce::from_slice(&nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext_bytes.as_ref())
            .map_err(|_| {
                ConnectError::DecryptionFailed(
                    "authentication failed (wrong key or corrupted data)".to_string(),
                )
            })?;

        String::from_utf8(plaintext)
            .map_err(|_| ConnectError::DecryptionFailed("plaintext is not valid UTF-8".to_string()))
    }

    /// Convenience for [`SealedToken`] values.
    pub fn open(&self, sealed: &SealedToken) -> Result<String> {
        self.decrypt(&sealed.ciphertext, &sealed.iv)
    }
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenCipher { .. }")
    }
}
