//! OAuth 2.0 authorization code flow with PKCE.
//!
//! 1. `initiate` generates a verifier/challenge and a state, stores the
//!    pending authorization, and returns the provider authorization URL
//! 2. The user consents on the provider's site
//! 3. The provider redirects back with `code` + `state`
//! 4. The state is consumed and the code exchanged (with the verifier) for tokens

pub mod authorize;
pub mod exchange;
pub mod pkce;
pub mod provider;
pub mod redis_store;
pub mod state_store;

pub use authorize::build_authorization_url;
pub use exchange::{HttpTokenExchangeClient, RetryPolicy, TokenExchangeClient, TokenSet};
pub use provider::{ProfileFormat, ProviderConfig, ProviderRegistry};
pub use redis_store::RedisStateStore;
pub use state_store::{run_state_cleanup, InMemoryStateStore, OAuthStateStore, PendingAuthorization};
