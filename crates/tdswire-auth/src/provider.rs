//! Federated authentication token providers.

use async_trait::async_trait;

use crate::error::AuthError;

/// What the server asked for in FEDAUTHINFO.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FedAuthContext {
    /// Security token service URL.
    pub sts_url: String,
    /// Service principal name the token must be issued for.
    pub spn: String,
}

/// Supplies access tokens on demand during login.
///
/// Called once per login attempt, after the server has sent FEDAUTHINFO.
/// Implementations typically call an identity platform; the driver itself
/// never contacts one.
#[async_trait]
pub trait FedAuthTokenProvider: Send + Sync + std::fmt::Debug {
    /// Acquire a token for the requested resource.
    async fn token(&self, context: &FedAuthContext) -> Result<String, AuthError>;
}

/// Provider that always returns the same token.
#[derive(Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    /// Wrap a pre-acquired token.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for StaticTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenProvider")
            .field("token", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl FedAuthTokenProvider for StaticTokenProvider {
    async fn token(&self, _context: &FedAuthContext) -> Result<String, AuthError> {
        if self.token.is_empty() {
            return Err(AuthError::TokenAcquisition("empty token".into()));
        }
        Ok(self.token.clone())
    }
}
