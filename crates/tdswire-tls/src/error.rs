//! TLS-related error types.

use thiserror::Error;

/// Errors that can occur during TLS setup and handshake.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TlsError {
    /// TLS handshake failed.
    #[error("TLS handshake failed: {0}")]
    HandshakeFailed(#[source] std::io::Error),

    /// The name used for SNI and certificate validation is not valid.
    #[error("invalid server name for TLS: {0}")]
    InvalidServerName(String),

    /// A configured root certificate could not be used.
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    /// TLS configuration error.
    #[error("TLS configuration error: {0}")]
    Configuration(String),
}
