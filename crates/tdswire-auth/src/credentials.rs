//! Authentication modes.

use std::sync::Arc;

use crate::ntlm::NtlmClient;
use crate::provider::FedAuthTokenProvider;

/// How a connection authenticates.
///
/// The mode picks the login flow once per connection attempt.
#[derive(Clone)]
pub enum Authentication {
    /// SQL Server login with username and password in LOGIN7.
    SqlServer {
        /// Username.
        username: String,
        /// Password.
        password: String,
    },

    /// Windows account via NTLMv2.
    Ntlm {
        /// Username without domain.
        username: String,
        /// Password.
        password: String,
        /// Windows domain.
        domain: String,
    },

    /// Pre-acquired federated access token sent in LOGIN7.
    AccessToken {
        /// The access token.
        token: String,
    },

    /// Federated token fetched after the server names its STS and SPN.
    TokenProvider(Arc<dyn FedAuthTokenProvider>),
}

impl Authentication {
    /// SQL Server login.
    pub fn sql_server(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::SqlServer {
            username: username.into(),
            password: password.into(),
        }
    }

    /// NTLM login. A `DOMAIN\user` username is split when `domain` is empty.
    pub fn ntlm(
        username: impl Into<String>,
        password: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        let mut username = username.into();
        let mut domain = domain.into();
        if domain.is_empty() {
            if let Some((d, u)) = username.split_once('\\') {
                let (d, u) = (d.to_string(), u.to_string());
                domain = d;
                username = u;
            }
        }
        Self::Ntlm {
            username,
            password: password.into(),
            domain,
        }
    }

    /// Federated login with a token already in hand.
    pub fn access_token(token: impl Into<String>) -> Self {
        Self::AccessToken {
            token: token.into(),
        }
    }

    /// Federated login with a token provider.
    pub fn token_provider(provider: Arc<dyn FedAuthTokenProvider>) -> Self {
        Self::TokenProvider(provider)
    }

    /// Whether this mode uses the FEDAUTH feature extension.
    #[must_use]
    pub fn is_federated(&self) -> bool {
        matches!(self, Self::AccessToken { .. } | Self::TokenProvider(_))
    }

    /// NTLM client for this mode, if it is NTLM.
    #[must_use]
    pub fn ntlm_client(&self, workstation: &str) -> Option<NtlmClient> {
        match self {
            Self::Ntlm {
                username,
                password,
                domain,
            } => Some(NtlmClient::new(username, password, domain).with_workstation(workstation)),
            _ => None,
        }
    }

    /// Get the authentication method name.
    #[must_use]
    pub fn method_name(&self) -> &'static str {
        match self {
            Self::SqlServer { .. } => "SQL Server Authentication",
            Self::Ntlm { .. } => "NTLM",
            Self::AccessToken { .. } => "Federated Access Token",
            Self::TokenProvider(_) => "Federated Token Provider",
        }
    }
}

impl Default for Authentication {
    fn default() -> Self {
        Self::sql_server("", "")
    }
}

impl std::fmt::Debug for Authentication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose secrets in debug output
        match self {
            Self::SqlServer { username, .. } => f
                .debug_struct("SqlServer")
                .field("username", username)
                .field("password", &"[REDACTED]")
                .finish(),
            Self::Ntlm {
                username, domain, ..
            } => f
                .debug_struct("Ntlm")
                .field("username", username)
                .field("domain", domain)
                .field("password", &"[REDACTED]")
                .finish(),
            Self::AccessToken { .. } => f
                .debug_struct("AccessToken")
                .field("token", &"[REDACTED]")
                .finish(),
            Self::TokenProvider(provider) => {
                f.debug_tuple("TokenProvider").field(provider).finish()
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::provider::StaticTokenProvider;

    #[test]
    fn test_ntlm_splits_domain_user() {
        let auth = Authentication::ntlm("CORP\\alice", "pw", "");
        let Authentication::Ntlm {
            username, domain, ..
        } = auth
        else {
            panic!("expected NTLM");
        };
        assert_eq!(username, "alice");
        assert_eq!(domain, "CORP");
    }

    #[test]
    fn test_explicit_domain_wins() {
        let auth = Authentication::ntlm("x\\alice", "pw", "CORP");
        assert!(matches!(auth, Authentication::Ntlm { ref domain, .. } if domain == "CORP"));
    }

    #[test]
    fn test_federated_modes() {
        assert!(Authentication::access_token("t").is_federated());
        assert!(
            Authentication::token_provider(Arc::new(StaticTokenProvider::new("t"))).is_federated()
        );
        assert!(!Authentication::sql_server("sa", "pw").is_federated());
        assert!(Authentication::sql_server("sa", "pw").ntlm_client("ws").is_none());
        assert!(Authentication::ntlm("u", "p", "d").ntlm_client("ws").is_some());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let debug = format!("{:?}", Authentication::sql_server("sa", "s3cret"));
        assert!(debug.contains("sa"));
        assert!(!debug.contains("s3cret"));
        let debug = format!("{:?}", Authentication::access_token("tok3n"));
        assert!(!debug.contains("tok3n"));
    }
}
