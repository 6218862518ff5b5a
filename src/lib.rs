// Linked social accounts and their persistence
pub mod accounts;

// HTTP adapter
pub mod api;

// TOML + environment configuration
pub mod config;

// Token encryption at rest
pub mod credentials;

pub mod error;

// Connect, refresh, and disconnect orchestration
pub mod lifecycle;

// OAuth 2.0 + PKCE protocol pieces
pub mod oauth;

pub use error::{ConnectError, Result};
pub use lifecycle::{InitiatedConnection, LifecycleSettings, TokenLifecycleManager};
