//! # tdswire-auth
//!
//! Authentication modes for TDS connections, isolated from connection
//! logic.
//!
//! | Mode | Login flow |
//! |------|------------|
//! | [`Authentication::SqlServer`] | username/password in LOGIN7 |
//! | [`Authentication::Ntlm`] | NTLMv2 over SSPI messages |
//! | [`Authentication::AccessToken`] | token in the LOGIN7 FEDAUTH feature |
//! | [`Authentication::TokenProvider`] | token fetched after FEDAUTHINFO |

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod credentials;
pub mod error;
pub mod ntlm;
pub mod provider;

pub use credentials::Authentication;
pub use error::AuthError;
pub use ntlm::{NtlmChallenge, NtlmClient};
pub use provider::{FedAuthContext, FedAuthTokenProvider, StaticTokenProvider};
