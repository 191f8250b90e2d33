//! Credential seam for connection negotiation.

use async_trait::async_trait;
use thiserror::Error;

/// Authentication error.
///
/// Distinct from transport errors: a failed credential fetch fails the
/// connect attempt immediately and never enters the backoff loop.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no credential available")]
    MissingCredential,
    #[error("credential provider error: {0}")]
    Provider(String),
}

/// Source of bearer credentials for the console endpoint.
///
/// Called fresh at every connect and reconnect attempt, so rotating or
/// expiring tokens are picked up without restarting the link.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn bearer_token(&self) -> Result<String, AuthError>;
}

/// Fixed-credential provider for single-token setups and tests.
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn bearer_token(&self) -> Result<String, AuthError> {
        Ok(self.token.clone())
    }
}
