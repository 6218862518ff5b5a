//! Token encryption at rest.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       AccountStore / AccountLinker       │
//! │  - persist ciphertext + iv only          │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!    (encrypt)            (decrypt)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       TokenCipher                        │
//! │  - AES-256-GCM                           │
//! │  - Fresh nonce per token                 │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use social_connect::credentials::TokenCipher;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let key = std::env::var("SOCIAL_CONNECT_ENCRYPTION_KEY")?;
//! let cipher = TokenCipher::from_base64_key(&key)?;
//!
//! let sealed = cipher.encrypt("access-token")?;
//! assert_eq!(cipher.decrypt(&sealed.ciphertext, &sealed.iv)?, "access-token");
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! - Plaintext tokens exist only in memory during exchange and use
//! - Each token has its own nonce (never reused)
//! - Authenticated encryption (tampering detected as `DecryptionFailed`)

use serde::{Deserialize, Serialize};

mod encryption;

pub use encryption::{validate_key, TokenCipher};

/// Ciphertext plus the nonce it was sealed with, both base64.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedToken {
    pub ciphertext: String,
    pub iv: String,
}
