//! Authentication error types.

use thiserror::Error;

/// Errors that can occur during authentication.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuthError {
    /// The server's NTLM CHALLENGE message could not be parsed.
    #[error("invalid NTLM challenge: {0}")]
    InvalidChallenge(String),

    /// Token acquisition failed.
    #[error("failed to acquire token: {0}")]
    TokenAcquisition(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),
}
