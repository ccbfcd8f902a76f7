//! Access token plumbing shared by the HTTP and streaming transports.

use std::future::Future;
use std::pin::Pin;

/// Bearer token presented to the backend.
///
/// Debug output elides the secret so tokens never leak into logs.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    /// Wrap a raw token string.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Raw token value, for request construction only.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

impl From<String> for AccessToken {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl From<&str> for AccessToken {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

/// Boxed future type for token lookups.
pub type TokenFuture<'a> = Pin<Box<dyn Future<Output = Option<AccessToken>> + Send + 'a>>;

/// Source of the current access token.
///
/// Lookups are asynchronous so implementations can read from a keystore
/// or refresh an expiring credential.
pub trait TokenProvider: Send + Sync {
    /// Current token, or `None` when the user is signed out.
    fn access_token(&self) -> TokenFuture<'_>;
}

/// Provider that serves one fixed token (or none) on every lookup.
pub struct StaticTokenProvider {
    token: Option<AccessToken>,
}

impl StaticTokenProvider {
    /// Provider serving `token` on every lookup.
    #[must_use]
    pub fn new(token: impl Into<AccessToken>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    /// Provider that reports the user as signed out.
    #[must_use]
    pub const fn signed_out() -> Self {
        Self { token: None }
    }
}

impl TokenProvider for StaticTokenProvider {
    fn access_token(&self) -> TokenFuture<'_> {
        let token = self.token.clone();
        Box::pin(async move { token })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_elides_the_secret() {
        let token = AccessToken::new("super-secret-value");
        let rendered = format!("{token:?}");
        assert!(!rendered.contains("super-secret-value"));
        assert!(rendered.contains("***"));
    }

    #[tokio::test]
    async fn test_static_provider_round_trips() {
        let provider = StaticTokenProvider::new("abc123");
        let token = provider.access_token().await.unwrap();
        assert_eq!(token.as_str(), "abc123");

        let signed_out = StaticTokenProvider::signed_out();
        assert!(signed_out.access_token().await.is_none());
    }
}
