//! Client error types.
//!
//! Failures are split by scope. A [`ConnectionError`] ends the connection
//! (or the attempt to open one); a [`RequestError`] ends one request and,
//! unless its code says otherwise, leaves the connection logged in.

use std::fmt;

use tdswire_protocol::ServerMessage;
use thiserror::Error;

use crate::state::State;

/// Boxed underlying cause.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server error numbers worth retrying a login on.
///
/// 4060 (database unavailable), 10928/10929 (resource limits), 40197
/// (service error), 40501 (service busy), 40613 (database unavailable).
pub const TRANSIENT_ERROR_NUMBERS: [i32; 6] = [4060, 10928, 10929, 40197, 40501, 40613];

// =============================================================================
// Server error
// =============================================================================

/// An ERROR token raised by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    /// Error number.
    pub number: i32,
    /// Error class/severity (0-25).
    pub class: u8,
    /// Error state.
    pub state: u8,
    /// Error message.
    pub message: String,
    /// Server name where the error occurred.
    pub server: Option<String>,
    /// Stored procedure name, if any.
    pub procedure: Option<String>,
    /// Line number in the SQL batch or procedure.
    pub line: u32,
}

impl ServerError {
    /// Whether the number is in the transient allow-list.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        TRANSIENT_ERROR_NUMBERS.contains(&self.number)
    }
}

impl From<ServerMessage> for ServerError {
    fn from(msg: ServerMessage) -> Self {
        let non_empty = |s: String| if s.is_empty() { None } else { Some(s) };
        Self {
            number: msg.number,
            class: msg.class,
            state: msg.state,
            message: msg.message,
            server: non_empty(msg.server),
            procedure: non_empty(msg.procedure),
            line: msg.line,
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server error {}: {}", self.number, self.message)
    }
}

// =============================================================================
// Connection errors
// =============================================================================

/// Why a connection failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionErrorCode {
    /// Socket connect, read or write failed.
    Socket,
    /// Connect timer or cancel timer expired.
    Timeout,
    /// Encryption could not be negotiated or the TLS handshake failed.
    Encrypt,
    /// The server rejected the login.
    Login,
    /// The port of a named instance could not be determined.
    InstanceLookup,
    /// Federated authentication failed.
    FedAuth,
    /// The connection was closed while connecting.
    Closed,
    /// An operation was issued in a state that does not allow it.
    InvalidState,
    /// The server sent something the client could not decode.
    Protocol,
}

impl ConnectionErrorCode {
    /// Stable string code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Socket => "ESOCKET",
            Self::Timeout => "ETIMEOUT",
            Self::Encrypt => "EENCRYPT",
            Self::Login => "ELOGIN",
            Self::InstanceLookup => "EINSTLOOKUP",
            Self::FedAuth => "EFEDAUTH",
            Self::Closed => "ECLOSE",
            Self::InvalidState => "EINVALIDSTATE",
            Self::Protocol => "EPROTOCOL",
        }
    }
}

impl fmt::Display for ConnectionErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure that ends the connection.
#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct ConnectionError {
    /// Error code.
    pub code: ConnectionErrorCode,
    /// Human-readable message.
    pub message: String,
    /// State the connection was in when it failed.
    pub state: State,
    /// Server error behind a login failure.
    pub server: Option<ServerError>,
    #[source]
    source: Option<BoxError>,
}

impl ConnectionError {
    pub(crate) fn new(code: ConnectionErrorCode, state: State, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            state,
            server: None,
            source: None,
        }
    }

    pub(crate) fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub(crate) fn with_server(mut self, server: ServerError) -> Self {
        self.server = Some(server);
        self
    }

    /// Whether a login retry may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.code == ConnectionErrorCode::Login
            && self.server.as_ref().is_some_and(ServerError::is_transient)
    }
}

// =============================================================================
// Request errors
// =============================================================================

/// Why a request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestErrorCode {
    /// Cancelled by the caller.
    Cancel,
    /// The request timeout expired.
    Timeout,
    /// A parameter could not be sent as its declared type.
    Param,
    /// The server reported an error, or a streamed source failed.
    Request,
    /// The socket failed while the request was in flight.
    Socket,
    /// The connection is not ready for requests.
    InvalidState,
}

impl RequestErrorCode {
    /// Stable string code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cancel => "ECANCEL",
            Self::Timeout => "ETIMEOUT",
            Self::Param => "EPARAM",
            Self::Request => "EREQUEST",
            Self::Socket => "ESOCKET",
            Self::InvalidState => "EINVALIDSTATE",
        }
    }
}

impl fmt::Display for RequestErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure that ends one request.
#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct RequestError {
    /// Error code.
    pub code: RequestErrorCode,
    /// Human-readable message.
    pub message: String,
    /// First server error of the response.
    pub server: Option<ServerError>,
    #[source]
    source: Option<BoxError>,
}

impl RequestError {
    pub(crate) fn new(code: RequestErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            server: None,
            source: None,
        }
    }

    pub(crate) fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub(crate) fn from_server(server: ServerError) -> Self {
        Self {
            code: RequestErrorCode::Request,
            message: server.message.clone(),
            server: Some(server),
            source: None,
        }
    }
}

// =============================================================================
// Top-level error
// =============================================================================

/// Errors returned by the client.
#[derive(Debug, Error)]
pub enum Error {
    /// The connection failed or was lost.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// A request failed.
    #[error(transparent)]
    Request(#[from] RequestError),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Stable string code, e.g. `ELOGIN` or `ECANCEL`.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connection(e) => e.code.as_str(),
            Self::Request(e) => e.code.as_str(),
            Self::Config(_) => "ECONFIG",
        }
    }

    /// Check if this error is transient and may succeed on retry.
    ///
    /// Only server errors in [`TRANSIENT_ERROR_NUMBERS`] qualify.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.server_error().is_some_and(ServerError::is_transient)
    }

    /// Server error behind this failure, if any.
    #[must_use]
    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            Self::Connection(e) => e.server.as_ref(),
            Self::Request(e) => e.server.as_ref(),
            Self::Config(_) => None,
        }
    }

    /// Get the error class/severity if this is a server error.
    ///
    /// SQL Server error classes range from 0-25:
    /// - 0-10: Informational
    /// - 11-16: User errors
    /// - 17-19: Resource/hardware errors
    /// - 20-25: System errors (connection terminating)
    #[must_use]
    pub fn class(&self) -> Option<u8> {
        self.server_error().map(|e| e.class)
    }

    /// Whether this is a connection-scope failure.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;
