//! PKCE (RFC 7636) verifier/challenge generation and OAuth state values.

use crate::error::{ConnectError, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};

/// Unreserved characters allowed in a code verifier.
const VERIFIER_CHARSET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";

/// Verifier length. RFC 7636 allows 43-128.
pub const VERIFIER_LENGTH: usize = 64;

/// Random bytes behind a state value (encodes to 43 characters).
const STATE_BYTES: usize = 32;

/// A verifier and the S256 challenge derived from it.
#[derive(Clone)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

impl std::fmt::Debug for PkcePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkcePair")
            .field("verifier", &"<redacted>")
            .field("challenge", &self.challenge)
            .finish()
    }
}

fn fill_random(buf: &mut [u8]) -> Result<()> {
    OsRng
        .try_fill_bytes(buf)
        .map_err(|e| ConnectError::Entropy(e.to_string()))
}

/// Generates a code verifier from the OS random source.
///
/// Bytes are rejection-sampled so every character of the 66-symbol alphabet is
/// equally likely.
pub fn generate_verifier() -> Result<String> {
    // Largest multiple of the alphabet size that fits in a byte.
    let limit = (256 / VERIFIER_CHARSET.len() * VERIFIER_CHARSET.len()) as u8;

    let mut verifier = String::with_capacity(VERIFIER_LENGTH);
    let mut buf = [0u8; VERIFIER_LENGTH];
    while verifier.len() < VERIFIER_LENGTH {
        fill_random(&mut buf)?;
        for &b in buf.iter().filter(|&&b| b < limit) {
            if verifier.len() == VERIFIER_LENGTH {
                break;
            }
            verifier.push(VERIFIER_CHARSET[b as usize % VERIFIER_CHARSET.len()] as char);
        }
    }
    Ok(verifier)
}

/// `base64url_nopad(sha256(verifier))`
pub fn derive_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Generates a verifier together with its challenge.
pub fn generate_pair() -> Result<PkcePair> {
    let verifier = generate_verifier()?;
    let challenge = derive_challenge(&verifier);
    Ok(PkcePair {
        verifier,
        challenge,
    })
}

/// Generates an OAuth `state` value, independent of any verifier.
pub fn generate_state() -> Result<String> {
    let mut bytes = [0u8; STATE_BYTES];
    fill_random(&mut bytes)?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Whether `s` is a syntactically valid verifier.
pub fn is_valid_verifier(s: &str) -> bool {
    (43..=128).contains(&s.len()) && s.bytes().all(|b| VERIFIER_CHARSET.contains(&b))
}
