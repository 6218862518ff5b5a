//! Authorization URL assembly.

use crate::error::{ConnectError, Result};
use reqwest::Url;

/// Builds the provider authorization URL for a PKCE (S256) code flow.
///
/// Parameters are appended in a fixed order after any query the base URL
/// already carries. Scopes are space-joined.
///
/// # Errors
/// `InvalidConfiguration` if `base_authorize_url` is not an absolute http(s)
/// URL or carries a fragment.
pub fn build_authorization_url(
    base_authorize_url: &str,
    client_id: &str,
    redirect_uri: &str,
    scopes: &[String],
    state: &str,
    code_challenge: &str,
) -> Result<String> {
    let base = Url::parse(base_authorize_url).map_err(|e| {
        ConnectError::InvalidConfiguration(format!(
            "malformed authorize URL '{}': {}",
            base_authorize_url, e
        ))
    })?;

    if !matches!(base.scheme(), "http" | "https") || base.host_str().is_none() {
        return Err(ConnectError::InvalidConfiguration(format!(
            "authorize URL must be http(s): '{}'",
            base_authorize_url
        )));
    }
    if base.fragment().is_some() {
        return Err(ConnectError::InvalidConfiguration(format!(
            "authorize URL must not contain a fragment: '{}'",
            base_authorize_url
        )));
    }

    let scope = scopes.join(" ");
    let params = [
        ("response_type", "code"),
        ("client_id", client_id),
        ("redirect_uri", redirect_uri),
        ("scope", scope.as_str()),
        ("state", state),
        ("code_challenge", code_challenge),
        ("code_challenge_method", "S256"),
    ];

    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    let mut url = base.to_string();
    match base.query() {
        Some(q) if !q.is_empty() => url.push('&'),
        Some(_) => {}
        None => url.push('?'),
    }
    url.push_str(&query);

    Ok(url)
}
