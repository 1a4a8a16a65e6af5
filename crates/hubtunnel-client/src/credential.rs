//! Bearer token acquisition

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Token request failed: {0}")]
    RequestFailed(String),

    #[error("No credential configured")]
    NotConfigured,
}

/// Issues bearer tokens for the tunnel.
///
/// `audience` names the service the token is for, `claims` the URL it will
/// be presented to. Called once per connect attempt; implementations decide
/// whether to cache.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn get_token(&self, audience: &str, claims: &str) -> Result<String, CredentialError>;
}

/// Hands out the same pre-issued token for every request
#[derive(Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for StaticTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenProvider")
            .field("token", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn get_token(&self, _audience: &str, _claims: &str) -> Result<String, CredentialError> {
        if self.token.is_empty() {
            return Err(CredentialError::NotConfigured);
        }
        Ok(self.token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_token() {
        let provider = StaticTokenProvider::new("secret");
        assert_eq!(
            provider.get_token("aud", "wss://x/").await.unwrap(),
            "secret"
        );
        assert!(!format!("{:?}", provider).contains("secret"));
    }

    #[tokio::test]
    async fn test_empty_token_is_not_configured() {
        let provider = StaticTokenProvider::new("");
        assert!(matches!(
            provider.get_token("aud", "wss://x/").await,
            Err(CredentialError::NotConfigured)
        ));
    }
}
