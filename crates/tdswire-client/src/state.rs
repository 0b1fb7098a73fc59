//! Connection states.
//!
//! Every connection is in exactly one [`State`]. The driver moves between
//! them with [`State::can_transition_to`] guarding each step:
//!
//! ```text
//! Connecting ─► SentPrelogin ─► SentTlsNegotiation ─► SentLogin7*
//!                      └──────────────────────────────────┘
//! SentLogin7* ─► LoggedInSendingInitialSql ─► LoggedIn
//!             ─► ReRouting ─► Connecting
//!             ─► TransientFailureRetry ─► Connecting
//! LoggedIn ─► BuildingClientRequest ─► SentClientRequest ─► LoggedIn
//!                                                ─► SentAttention ─► LoggedIn
//! any ─► Final
//! ```

use std::fmt;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Resolving the host and opening the socket.
    Connecting,
    /// PRELOGIN sent, waiting for the server's answer.
    SentPrelogin,
    /// TLS handshake in progress inside PRELOGIN packets.
    SentTlsNegotiation,
    /// LOGIN7 with username and password (or a pre-acquired token) sent.
    SentLogin7WithStandardLogin,
    /// LOGIN7 with an NTLM NEGOTIATE blob sent.
    SentLogin7WithNtlmLogin,
    /// LOGIN7 with the FEDAUTH workflow feature sent.
    SentLogin7WithFedauth,
    /// Logged in, running the session-setup batch.
    LoggedInSendingInitialSql,
    /// Idle and ready for requests.
    LoggedIn,
    /// Validating and encoding a request.
    BuildingClientRequest,
    /// Request sent, reading the response.
    SentClientRequest,
    /// Attention sent, waiting for its acknowledgment.
    SentAttention,
    /// Following a routing redirect.
    ReRouting,
    /// Waiting before retrying a transient login failure.
    TransientFailureRetry,
    /// Closed. No further transitions.
    Final,
}

impl State {
    /// Name used in logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Connecting => "Connecting",
            Self::SentPrelogin => "SentPrelogin",
            Self::SentTlsNegotiation => "SentTLSNegotiation",
            Self::SentLogin7WithStandardLogin => "SentLogin7WithStandardLogin",
            Self::SentLogin7WithNtlmLogin => "SentLogin7WithNTLMLogin",
            Self::SentLogin7WithFedauth => "SentLogin7Withfedauth",
            Self::LoggedInSendingInitialSql => "LoggedInSendingInitialSql",
            Self::LoggedIn => "LoggedIn",
            Self::BuildingClientRequest => "BuildingClientRequest",
            Self::SentClientRequest => "SentClientRequest",
            Self::SentAttention => "SentAttention",
            Self::ReRouting => "ReRouting",
            Self::TransientFailureRetry => "TransientFailureRetry",
            Self::Final => "Final",
        }
    }

    /// Whether this is one of the login states.
    #[must_use]
    pub const fn is_login(self) -> bool {
        matches!(
            self,
            Self::SentLogin7WithStandardLogin | Self::SentLogin7WithNtlmLogin | Self::SentLogin7WithFedauth
        )
    }

    /// Whether the state sits before a completed login.
    #[must_use]
    pub const fn is_connecting(self) -> bool {
        matches!(
            self,
            Self::Connecting
                | Self::SentPrelogin
                | Self::SentTlsNegotiation
                | Self::SentLogin7WithStandardLogin
                | Self::SentLogin7WithNtlmLogin
                | Self::SentLogin7WithFedauth
                | Self::LoggedInSendingInitialSql
                | Self::ReRouting
                | Self::TransientFailureRetry
        )
    }

    /// Whether `next` is a legal successor.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use State::*;

        if next == Final {
            return self != Final;
        }
        match self {
            Connecting => next == SentPrelogin,
            SentPrelogin => next == SentTlsNegotiation || next.is_login(),
            SentTlsNegotiation => next.is_login(),
            SentLogin7WithStandardLogin | SentLogin7WithNtlmLogin | SentLogin7WithFedauth => {
                matches!(next, LoggedInSendingInitialSql | ReRouting | TransientFailureRetry)
            }
            LoggedInSendingInitialSql => next == LoggedIn,
            LoggedIn => next == BuildingClientRequest,
            BuildingClientRequest => matches!(next, SentClientRequest | LoggedIn),
            SentClientRequest => matches!(next, LoggedIn | SentAttention),
            SentAttention => next == LoggedIn,
            ReRouting | TransientFailureRetry => next == Connecting,
            Final => false,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const ALL: [State; 14] = [
        State::Connecting,
        State::SentPrelogin,
        State::SentTlsNegotiation,
        State::SentLogin7WithStandardLogin,
        State::SentLogin7WithNtlmLogin,
        State::SentLogin7WithFedauth,
        State::LoggedInSendingInitialSql,
        State::LoggedIn,
        State::BuildingClientRequest,
        State::SentClientRequest,
        State::SentAttention,
        State::ReRouting,
        State::TransientFailureRetry,
        State::Final,
    ];

    #[test]
    fn test_every_state_can_reach_final() {
        for state in ALL.iter().filter(|s| **s != State::Final) {
            assert!(state.can_transition_to(State::Final), "{state}");
        }
    }

    #[test]
    fn test_final_is_terminal() {
        for state in ALL {
            assert!(!State::Final.can_transition_to(state));
        }
    }

    #[test]
    fn test_connect_path() {
        assert!(State::Connecting.can_transition_to(State::SentPrelogin));
        assert!(!State::Connecting.can_transition_to(State::LoggedIn));
        assert!(State::SentPrelogin.can_transition_to(State::SentLogin7WithNtlmLogin));
        assert!(State::SentTlsNegotiation.can_transition_to(State::SentLogin7WithFedauth));
        assert!(!State::SentTlsNegotiation.can_transition_to(State::SentPrelogin));
        assert!(State::SentLogin7WithStandardLogin.can_transition_to(State::ReRouting));
        assert!(State::ReRouting.can_transition_to(State::Connecting));
        assert!(State::TransientFailureRetry.can_transition_to(State::Connecting));
    }

    #[test]
    fn test_request_path() {
        assert!(State::LoggedIn.can_transition_to(State::BuildingClientRequest));
        assert!(State::BuildingClientRequest.can_transition_to(State::LoggedIn));
        assert!(State::SentClientRequest.can_transition_to(State::SentAttention));
        assert!(State::SentAttention.can_transition_to(State::LoggedIn));
        assert!(!State::SentAttention.can_transition_to(State::SentClientRequest));
        assert!(!State::LoggedIn.can_transition_to(State::SentClientRequest));
    }

    #[test]
    fn test_state_classification() {
        assert!(State::SentLogin7WithFedauth.is_login());
        assert!(!State::LoggedIn.is_login());
        assert!(State::ReRouting.is_connecting());
        assert!(!State::SentAttention.is_connecting());
        assert_eq!(State::SentTlsNegotiation.to_string(), "SentTLSNegotiation");
    }
}
