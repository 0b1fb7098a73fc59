//! # tdswire-tls
//!
//! TLS bootstrap inside the TDS protocol.
//!
//! The handshake does not run on the bare socket. After the cleartext
//! PRELOGIN exchange both peers keep framing: every handshake flight is
//! carried in PRELOGIN packets.
//!
//! ```text
//! TCP → PRELOGIN (cleartext) → TLS handshake in PRELOGIN packets → LOGIN7 (encrypted)
//! ```
//!
//! [`TlsConnector::handshake`] takes the raw stream, wraps it in a
//! [`PreloginStream`] for the handshake and hands back an
//! [`EncryptedStream`] that writes TLS records directly. The caller builds
//! a new packet transport on top of it.
//!
//! ## Security
//!
//! Server certificates are validated against the Mozilla root store unless
//! custom roots are configured. `TrustServerCertificate` disables
//! validation and logs a warning.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod connector;
pub mod error;
pub mod fragment;
pub mod prelogin;

pub use config::{TlsConfig, TlsVersion};
pub use connector::{EncryptedStream, TlsConnector};
pub use error::TlsError;
pub use fragment::{FragmentLimit, FragmentLimited};
pub use prelogin::PreloginStream;
